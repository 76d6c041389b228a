//! End-to-end: spawn a real CPython child and sample it through the public
//! `Supervisor` API, mirroring `benfred-py-spy`'s own `tests/integration_test.rs`
//! (`TestRunner`, `busyloop.py`/`longsleep.py`) but exercised against
//! `render_stacks()` rather than `PythonSpy::get_stack_traces()`.

use austin::emitter::{Event, MojoEmitter};
use austin::process::Supervisor;
use austin::Config;

/// Walks a raw MOJO event stream (no header) and counts `Stack` events,
/// skipping every other event's payload by its known shape so a varint byte
/// that happens to equal `Event::Stack as u8` can never be mistaken for one.
fn count_stack_events(buf: &[u8]) -> usize {
    let mut pos = 0;
    let mut stacks = 0;

    fn skip_varint(buf: &[u8], pos: &mut usize) {
        if buf[*pos] & 0x80 != 0 {
            *pos += 1;
            while buf[*pos] & 0x80 != 0 {
                *pos += 1;
            }
        }
        *pos += 1;
    }

    fn skip_cstring(buf: &[u8], pos: &mut usize) {
        while buf[*pos] != 0 {
            *pos += 1;
        }
        *pos += 1;
    }

    while pos < buf.len() {
        let event = buf[pos];
        pos += 1;
        match event {
            e if e == Event::Stack as u8 => {
                stacks += 1;
                skip_varint(buf, &mut pos); // pid
                skip_varint(buf, &mut pos); // iid
                skip_cstring(buf, &mut pos); // tid_hex
            }
            e if e == Event::Metadata as u8 => {
                skip_cstring(buf, &mut pos); // key
                skip_cstring(buf, &mut pos); // value
            }
            e if e == Event::Frame as u8 => {
                for _ in 0..7 {
                    skip_varint(buf, &mut pos);
                }
            }
            e if e == Event::FrameRef as u8 => {
                skip_varint(buf, &mut pos);
            }
            e if e == Event::FrameKernel as u8 => {
                skip_cstring(buf, &mut pos);
            }
            e if e == Event::Gc as u8 || e == Event::Idle as u8 => {}
            e if e == Event::MetricTime as u8 || e == Event::MetricMemory as u8 => {
                skip_varint(buf, &mut pos);
            }
            e if e == Event::StringEvent as u8 => {
                skip_varint(buf, &mut pos); // key
                skip_cstring(buf, &mut pos); // value
            }
            e if e == Event::StringRef as u8 => {
                skip_varint(buf, &mut pos);
            }
            other => panic!("unknown event byte {}", other),
        }
    }

    stacks
}

struct TestRunner {
    supervisor: Supervisor,
}

impl TestRunner {
    fn new(filename: &str) -> TestRunner {
        let command = vec!["python3".to_owned(), filename.to_owned()];
        let mut supervisor =
            Supervisor::spawn(&command, austin::MAX_STACK_SIZE).expect("failed to spawn python3");
        supervisor
            .init(std::time::Duration::from_secs(5))
            .expect("failed to locate the interpreter");
        TestRunner { supervisor }
    }
}

impl Drop for TestRunner {
    fn drop(&mut self) {
        let _ = self.supervisor.terminate();
        let _ = self.supervisor.wait();
    }
}

#[test]
fn test_busy_loop() {
    let mut runner = TestRunner::new("./tests/scripts/busyloop.py");
    let stacks = runner.supervisor.render_stacks().unwrap();

    assert_eq!(stacks.len(), 1);
    let frame = &stacks[0].frames[0];
    assert_eq!(frame.scope, "busy_loop");
    assert!(frame.filename.ends_with("busyloop.py"));
}

#[test]
fn test_long_sleep() {
    let mut runner = TestRunner::new("./tests/scripts/longsleep.py");
    let stacks = runner.supervisor.render_stacks().unwrap();

    assert_eq!(stacks.len(), 1);
    let frames = &stacks[0].frames;

    assert_eq!(frames[0].scope, "longsleep");
    assert!(frames[0].filename.ends_with("longsleep.py"));
    assert_eq!(frames[0].line, 5);

    assert_eq!(frames[1].scope, "<module>");
    assert_eq!(frames[1].line, 9);
}

#[test]
fn test_cpu_only_filters_idle_thread() {
    let mut runner = TestRunner::new("./tests/scripts/idle_worker.py");
    // let the worker thread reach its time.sleep(60) call
    std::thread::sleep(std::time::Duration::from_millis(300));

    let mut config = Config::default();

    let mut buf = Vec::new();
    let mut emitter = MojoEmitter::new(&mut buf, false);
    runner.supervisor.sample(&config, 0, &mut emitter).unwrap();
    assert_eq!(
        count_stack_events(&buf),
        2,
        "both the busy-looping and the sleeping thread should be sampled without -s"
    );

    config.cpu_only = true;
    let mut buf = Vec::new();
    let mut emitter = MojoEmitter::new(&mut buf, false);
    runner.supervisor.sample(&config, 0, &mut emitter).unwrap();
    assert_eq!(
        count_stack_events(&buf),
        1,
        "-s should drop the sleeping thread's sample, keeping only the busy loop"
    );
}
