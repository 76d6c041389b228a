//! Process supervisor: owns exactly one target process end to end.
//!
//! Grounded on `benfred-py-spy/src/python_spy.rs` (`PythonSpy::new`'s
//! binary-discovery-then-version-then-interpreter pipeline, `retry_new`'s
//! retry-until-timeout shape) and `python_process_info.rs` (`PythonProcessInfo::new`'s
//! main-binary/libpython split via `proc_maps`, `get_python_version`'s
//! symbol-then-BSS-then-filename fallback chain). Restructured from the
//! teacher's one-thread-per-target actor (`sampler.rs`'s `PythonSpyThread`)
//! into a synchronous value type driven by an explicit `sample()` call per
//! tick, per `SPEC_FULL.md` §5's single-threaded cooperative loop
//! (REDESIGN FLAG).

use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use proc_maps::get_process_maps;
use regex::Regex;
use remoteprocess::{Pid, Process, ProcessMemory};

use crate::config::Config;
use crate::descriptors::VersionDescriptor;
use crate::emitter::MojoEmitter;
use crate::error::{to_anyhow, Kind};
use crate::image::{self, ImageInfo};
use crate::locator;
use crate::stats::Stats;
use crate::unwind::Target;
use crate::version::Version;

#[cfg(unix)]
fn is_python_lib(pathname: &str) -> bool {
    lazy_static! {
        static ref RE: Regex = Regex::new(r"lib(python)(\d+(\.\d+))?[a-z0-9]*\.(so|dylib)").unwrap();
    }
    RE.is_match(pathname)
}

#[cfg(not(unix))]
fn is_python_lib(pathname: &str) -> bool {
    pathname.to_lowercase().contains("python") && pathname.to_lowercase().ends_with(".dll")
}

/// Locates the main Python executable's image and, if present, `libpython`'s,
/// merging their symbol tables (main binary wins ties) and picking whichever
/// one actually carries a `.PyRuntime`/BSS region.
fn discover_image(process: &Process) -> anyhow::Result<ImageInfo> {
    let exe = process
        .exe()
        .map_err(|e| to_anyhow(Kind::Os, format!("failed to get executable path: {}", e)))?;

    let maps = get_process_maps(process.pid)
        .map_err(|e| to_anyhow(Kind::VmMaps, e.to_string()))?;

    let main_map = maps
        .iter()
        .find(|m| {
            m.filename()
                .and_then(|p| p.to_str())
                .map(|p| p == exe)
                .unwrap_or(false)
                && m.is_exec()
        })
        .or_else(|| maps.first())
        .ok_or_else(|| to_anyhow(Kind::VmMaps, "no memory maps found for target"))?;

    let mut combined = image::parse_binary(Path::new(&exe), main_map.start() as u64, main_map.size() as u64)?;

    for m in &maps {
        if let Some(path) = m.filename().and_then(|p| p.to_str()) {
            if m.is_exec() && is_python_lib(path) {
                if let Ok(lib) = image::parse_binary(Path::new(path), m.start() as u64, m.size() as u64) {
                    for (name, addr) in lib.symbols {
                        combined.symbols.entry(name).or_insert(addr);
                    }
                    if combined.bss_size == 0 {
                        combined.bss_addr = lib.bss_addr;
                        combined.bss_size = lib.bss_size;
                    }
                    if combined.pyruntime_size == 0 {
                        combined.pyruntime_addr = lib.pyruntime_addr;
                        combined.pyruntime_size = lib.pyruntime_size;
                    }
                }
                break;
            }
        }
    }

    Ok(combined)
}

/// Mirrors `get_python_version`'s fallback chain: a symbol holding the
/// `sys.version` string directly, then a BSS scan, then the executable's own
/// filename (`python3.11` style).
fn detect_version(process: &Process, image: &ImageInfo, exe_path: &str) -> anyhow::Result<Version> {
    if let Some(addr) = image.symbol("Py_GetVersion.version") {
        if let Ok(bytes) = process.copy(addr as usize, 128) {
            if let Ok(v) = Version::scan_bytes(&bytes) {
                return Ok(v);
            }
        }
    }

    if image.bss_size > 0 {
        if let Ok(bss) = process.copy(image.bss_addr as usize, image.bss_size as usize) {
            if let Ok(v) = Version::scan_bytes(&bss) {
                return Ok(v);
            }
        }
    }

    if let Some(name) = Path::new(exe_path).file_name().and_then(|n| n.to_str()) {
        if let Some(rest) = name.strip_prefix("python") {
            let parts: Vec<&str> = rest.split('.').collect();
            if parts.len() >= 2 {
                if let (Ok(major), Ok(minor)) = (parts[0].parse(), parts[1].parse()) {
                    return Ok(Version {
                        major,
                        minor,
                        patch: 0,
                        release_flags: String::new(),
                        build_metadata: None,
                    });
                }
            }
        }
    }

    Err(to_anyhow(
        Kind::Version,
        "failed to determine the target's Python version",
    ))
}

/// Owns one observed OS process: attach/spawn, interpreter discovery,
/// per-tick sampling, and termination/reap.
pub struct Supervisor {
    pub pid: Pid,
    child: Option<std::process::Child>,
    target: Option<Target<Process>>,
    version: Option<Version>,
    pub stats: Stats,
    max_stack: usize,
}

impl Supervisor {
    /// `attach(pid)`.
    pub fn attach(pid: Pid, max_stack: usize) -> anyhow::Result<Supervisor> {
        // Constructing a `Process` is deferred to `init()`/`try_init_once()`
        // so that `attach` itself never touches remote memory, matching
        // `SPEC_FULL.md` §4.10's public-operation split.
        let _ = Process::new(pid).map_err(|e| to_anyhow(Kind::Os, e.to_string()))?;
        Ok(Supervisor {
            pid,
            child: None,
            target: None,
            version: None,
            stats: Stats::new(),
            max_stack,
        })
    }

    /// `spawn(cmd, argv)`.
    pub fn spawn(command: &[String], max_stack: usize) -> anyhow::Result<Supervisor> {
        let mut cmd = std::process::Command::new(&command[0]);
        cmd.args(&command[1..]);
        let child = cmd
            .spawn()
            .map_err(|e| to_anyhow(Kind::Os, format!("failed to spawn '{}': {}", command[0], e)))?;
        let pid = child.id() as Pid;
        Ok(Supervisor {
            pid,
            child: Some(child),
            target: None,
            version: None,
            stats: Stats::new(),
            max_stack,
        })
    }

    /// `is_python()`: true iff the locator has succeeded at least once.
    pub fn is_python(&self) -> bool {
        self.target.is_some()
    }

    /// `is_running()`.
    pub fn is_running(&mut self) -> bool {
        if let Some(child) = &mut self.child {
            matches!(child.try_wait(), Ok(None))
        } else if let Some(target) = &self.target {
            target.process.exe().is_ok()
        } else {
            Process::new(self.pid).is_ok()
        }
    }

    pub fn version(&self) -> Option<&Version> {
        self.version.as_ref()
    }

    fn try_init(&mut self) -> anyhow::Result<()> {
        let process = Process::new(self.pid).map_err(|e| to_anyhow(Kind::Os, e.to_string()))?;
        let image = discover_image(&process)?;
        let exe = process.exe().unwrap_or_default();
        let version = detect_version(&process, &image, &exe)?;

        let desc = VersionDescriptor::lookup(&version)
            .ok_or_else(|| to_anyhow(Kind::Version, format!("unsupported CPython version {}", version)))?;

        let located = locator::locate_interpreter(&process, &image, &version, &desc)?;

        let (desc, version) = if let Some((major, minor, patch)) = located.from_debug_offsets {
            let resolved_version = Version {
                major,
                minor,
                patch,
                release_flags: String::new(),
                build_metadata: None,
            };
            match VersionDescriptor::lookup(&resolved_version) {
                Some(d) => (d, resolved_version),
                None => (desc, version),
            }
        } else {
            (desc, version)
        };

        let window_size = crate::config::page_size_cap();
        let mut target = Target::new(process, desc, located.interpreter_head, self.max_stack, window_size);
        if desc.runtime_tstate_current != 0 {
            if let Some(runtime_addr) = image.symbol("_PyRuntime") {
                target.threadstate_current_addr = runtime_addr as usize + desc.runtime_tstate_current;
            }
        }

        self.version = Some(version);
        self.target = Some(target);
        Ok(())
    }

    /// `init()`: locates the interpreter, retried at sampling cadence up to
    /// `timeout`.
    pub fn init(&mut self, timeout: Duration) -> anyhow::Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.try_init() {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if Instant::now() >= deadline {
                        return Err(err);
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
            }
        }
    }

    /// Single-shot variant used when discovering child processes: must
    /// succeed immediately or the caller skips this pid.
    pub fn try_init_once(&mut self) -> anyhow::Result<()> {
        self.try_init()
    }

    /// `sample()`: one tick, best-effort across every interpreter in the
    /// runtime's linked list (`SPEC_FULL.md` §4.9) and every thread of each.
    /// `interpreter_id_base` offsets the real per-interpreter id so that
    /// multiple `Supervisor`s sharing one emitter (tree mode) don't need
    /// their sub-interpreter ids to coincide; the pid already disambiguates
    /// the process on the wire.
    pub fn sample<W: Write>(
        &mut self,
        config: &Config,
        interpreter_id_base: u64,
        emitter: &mut MojoEmitter<W>,
    ) -> anyhow::Result<()> {
        let started = Instant::now();
        let target = self
            .target
            .as_mut()
            .ok_or_else(|| to_anyhow(Kind::PyObject, "interpreter not yet located"))?;

        let interpreters = match target.list_interpreters() {
            Ok(interpreters) => interpreters,
            Err(err) => {
                self.stats.record_error();
                return Err(err);
            }
        };

        let gil_holder = target.gil_holder_thread_id().unwrap_or(0);

        let rss_now = crate::platform::resident_memory(self.pid).unwrap_or(target.last_rss);
        let rss_delta = rss_now as i64 - target.last_rss as i64;
        target.last_rss = rss_now;

        for interp in &interpreters {
            target.check_code_object_generation(interp)?;

            let gc_collecting = if config.gc && interp.gc_addr != 0 {
                // `GC.collecting` is the first field of the struct in every
                // supported version family.
                target
                    .process
                    .copy(interp.gc_addr, 8)
                    .ok()
                    .map(|b| b.iter().any(|&byte| byte != 0))
                    .unwrap_or(false)
            } else {
                false
            };
            if gc_collecting {
                self.stats.record_gc_time(started.elapsed());
            }

            let threads = match target.walk_threads(interp) {
                Ok(threads) => threads,
                Err(err) => {
                    self.stats.record_error();
                    debug!("walking threads of interpreter {}: {}", interp.id, err);
                    continue;
                }
            };

            let interpreter_id = interpreter_id_base + interp.id;

            for thread in &threads {
                // Pre-3.11 threads don't carry the native tid directly;
                // infer it once per target from the `pthread_t` handle
                // (`SPEC_FULL.md` §4.8) and reuse it for every later tick.
                let native_tid = thread
                    .native_thread_id
                    .or_else(|| target.infer_native_tid(self.pid, thread.thread_id));

                let scheduler_idle = native_tid
                    .and_then(|tid| crate::platform::thread_is_running(self.pid, tid).ok())
                    .map(|running| !running);

                // `-f` disables `-s` filtering regardless of `cpu_only`
                // (`-m` already clears `cpu_only` itself at parse time, see
                // `config.rs`), matching the original's `if (!pargs.full &&
                // is_idle && pargs.cpu) continue;`. When the OS scheduler
                // state is already known, this lets us skip unwinding an
                // idle thread entirely.
                if let Some(true) = scheduler_idle {
                    if !config.full && config.cpu_only {
                        continue;
                    }
                }

                match target.unwind_thread(thread) {
                    Ok(resolved) => {
                        // No native tid, or the platform's scheduler query
                        // failed (e.g. no primitive on this OS): fall back to
                        // the stdlib-blocking-call heuristic over the top
                        // frame now that it's resolved.
                        let is_idle = scheduler_idle.unwrap_or_else(|| {
                            let top = resolved.first().map(|f| {
                                (
                                    target.lookup_string(f.record.scope_ref).unwrap_or_default(),
                                    target
                                        .lookup_string(f.record.filename_ref)
                                        .unwrap_or_default(),
                                )
                            });
                            crate::unwind::heuristic_is_idle(
                                top.as_ref().map(|(scope, filename)| (scope.as_str(), filename.as_str())),
                            )
                        });

                        if !config.full && config.cpu_only && is_idle {
                            continue;
                        }

                        emitter.stack_begin(
                            self.pid as u64,
                            interpreter_id,
                            &format!("0x{:x}", thread.thread_id),
                        )?;

                        for frame in &resolved {
                            for (key, value) in &frame.new_strings {
                                emitter.new_string(*key, value)?;
                            }
                            let loc = &frame.record.location;
                            if frame.is_new {
                                emitter.new_frame(
                                    frame.record.key,
                                    frame.record.filename_ref,
                                    frame.record.scope_ref,
                                    loc.line,
                                    loc.line_end,
                                    loc.column,
                                    loc.column_end,
                                )?;
                            } else {
                                emitter.frame_ref(frame.record.key)?;
                            }
                        }

                        let is_gil_holder = gil_holder != 0
                            && (thread.native_thread_id == Some(gil_holder) || thread.thread_id == gil_holder);
                        let memory_delta = if is_gil_holder { rss_delta } else { 0 };
                        let elapsed_us = started.elapsed().as_micros().min(u64::MAX as u128) as u64;

                        emitter.stack_end(
                            gc_collecting,
                            config.full,
                            is_idle,
                            config.memory,
                            elapsed_us,
                            memory_delta,
                        )?;

                        if target.buffers.py_frames.saturated() {
                            self.stats.record_saturation();
                        }
                        self.stats.record_sample(started.elapsed());
                    }
                    Err(_) => {
                        self.stats.record_error();
                    }
                }
            }
        }

        Ok(())
    }

    /// `signal(s)`.
    pub fn signal(&mut self, sig: i32) -> anyhow::Result<()> {
        #[cfg(unix)]
        {
            let ret = unsafe { libc::kill(self.pid, sig) };
            if ret != 0 {
                return Err(to_anyhow(Kind::Os, std::io::Error::last_os_error().to_string()));
            }
            Ok(())
        }
        #[cfg(not(unix))]
        {
            let _ = sig;
            Err(to_anyhow(Kind::Os, "signal delivery is unsupported on this platform"))
        }
    }

    /// `terminate()`.
    pub fn terminate(&mut self) -> anyhow::Result<()> {
        if let Some(child) = &mut self.child {
            child
                .kill()
                .map_err(|e| to_anyhow(Kind::Os, e.to_string()))?;
        } else {
            self.signal(libc::SIGTERM)?;
        }
        Ok(())
    }

    /// `wait()`: reap a spawned child (no-op for an attached target).
    pub fn wait(&mut self) -> anyhow::Result<()> {
        if let Some(child) = &mut self.child {
            child.wait().map_err(|e| to_anyhow(Kind::Os, e.to_string()))?;
        }
        Ok(())
    }

    /// `destroy()`.
    pub fn destroy(self) {}

    /// Walks every thread once and returns fully-resolved stacks (filenames
    /// and scopes as owned strings rather than cache refs), for `--where`'s
    /// one-shot human-readable rendering. Bypasses the emitter entirely.
    pub fn render_stacks(&mut self) -> anyhow::Result<Vec<RenderedStack>> {
        let target = self
            .target
            .as_mut()
            .ok_or_else(|| to_anyhow(Kind::PyObject, "interpreter not yet located"))?;

        let interpreters = target.list_interpreters()?;

        let mut stacks = Vec::new();
        for interp in &interpreters {
            target.check_code_object_generation(interp)?;
            let threads = target.walk_threads(interp)?;

            for thread in &threads {
                let resolved = target.unwind_thread(thread)?;
                let frames = resolved
                    .iter()
                    .map(|f| RenderedFrame {
                        filename: target
                            .caches
                            .strings
                            .get(&f.record.filename_ref)
                            .cloned()
                            .unwrap_or_default(),
                        scope: target
                            .caches
                            .strings
                            .get(&f.record.scope_ref)
                            .cloned()
                            .unwrap_or_else(|| "<unknown>".to_owned()),
                        line: f.record.location.line,
                    })
                    .collect();
                stacks.push(RenderedStack {
                    thread_id: thread.thread_id,
                    frames,
                });
            }
        }
        Ok(stacks)
    }
}

/// One frame as rendered for `--where`.
pub struct RenderedFrame {
    pub filename: String,
    pub scope: String,
    pub line: u32,
}

/// One thread's stack as rendered for `--where`.
pub struct RenderedStack {
    pub thread_id: u64,
    pub frames: Vec<RenderedFrame>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn python_lib_regex_matches_common_names() {
        assert!(is_python_lib("/usr/lib/libpython3.11.so.1.0"));
        assert!(is_python_lib("/usr/local/lib/libpython3.8m.dylib"));
        assert!(!is_python_lib("/usr/lib/libboost_python.so"));
    }
}
