//! Thread and frame-stack unwinding across the three CPython ABI dialects.
//!
//! Grounded on `benfred-py-spy/src/stack_trace.rs` (`get_stack_traces`,
//! `get_stack_trace`, `get_gil_threadid`, the `<shim>`-skip and depth-guard
//! logic) and `benfred-py-spy/src/python_spy.rs` (`_heuristic_is_thread_idle`,
//! `_get_os_thread_id`'s per-OS dispatch). Generalized to walk the
//! *interpreter* linked list first (`SPEC_FULL.md` §4.9), which the teacher
//! doesn't need since py-spy assumes one interpreter per process: each tick,
//! [`Target::list_interpreters`] follows `InterpreterState.next` from the
//! runtime's head, prefetching a page-aligned mirror of each interpreter
//! struct ([`InterpWindow`]) so that the handful of fields read every tick
//! (thread-state head, GC flag, code-object generation, the next pointer
//! itself) cost one remote read instead of four.

use std::collections::HashSet;
use std::mem::size_of;

use remoteprocess::{Pid, ProcessMemory};

use crate::caches::{interpreter_cache_key, TargetCaches};
use crate::codeloc::{self, CodeRecord, Dialect, FrameRecord, Location};
use crate::descriptors::{FrameDialect, VersionDescriptor};
use crate::error::{to_anyhow, Kind};
use crate::stack_buffers::{PyFrame, StackBuffers};

/// Matches the original's `MAX_STACK_SIZE` (`original_source/src/py_thread.h`):
/// the frame/stack-buffer capacity, independent of any environment-tunable
/// quantity such as [`crate::config::page_size_cap`]'s prefetch window size.
pub const MAX_STACK_SIZE: usize = 2048;

const MAX_THREADS: usize = 4096;
const MAX_FRAMES: usize = 4096;
const MAX_INTERPRETERS: usize = 64;

/// Bounded window read from the `pthread_t` handle when inferring the native
/// OS thread id on pre-3.11 targets (`SPEC_FULL.md` §4.8: "a bounded window,
/// approximately one small page"). Real `pthread_t` buffers hold the tid
/// within the first few hundred bytes on every libc this port targets.
const TID_SCAN_WINDOW: usize = 512;

/// A frame resolved and ready for the emitter: the record plus whichever
/// strings must be registered with a `String` event before the `Frame`
/// event itself (empty once a string has been sent once, ever).
pub struct ResolvedFrame {
    pub record: FrameRecord,
    pub is_new: bool,
    pub new_strings: Vec<(u64, String)>,
}

/// A page-aligned snapshot of one interpreter-state struct, refreshed once
/// per tick before any of its fields are read (`SPEC_FULL.md` §3's "small
/// prefetched mirror of the interpreter-state struct"). Reads that land
/// outside the window (a tiny `AUSTIN_PAGE_SIZE_CAP`, or a field the target's
/// CPython puts further into the struct than expected) fall back to a direct
/// remote read rather than failing the tick.
struct InterpWindow {
    bytes: Vec<u8>,
}

impl InterpWindow {
    fn read_u64(&self, offset: usize) -> Option<u64> {
        self.bytes
            .get(offset..offset + size_of::<usize>())
            .map(|s| usize::from_le_bytes(s.try_into().unwrap()) as u64)
    }
}

/// One CPython interpreter discovered by [`Target::list_interpreters`].
pub struct InterpreterHandle {
    pub address: usize,
    pub id: u64,
    pub gc_addr: usize,
    window: InterpWindow,
}

/// One target's sampling state: everything that survives between ticks.
pub struct Target<P: ProcessMemory> {
    pub process: P,
    pub desc: VersionDescriptor,
    pub interpreter_head: usize,
    pub threadstate_current_addr: usize,
    pub caches: TargetCaches,
    pub buffers: StackBuffers,
    pub last_rss: u64,
    pub last_sample_at: Option<std::time::Instant>,
    window_size: usize,
    /// Keys already handed to the emitter as a full `Frame`/`String` event.
    /// Separate from `caches`: a cache entry may be evicted for capacity
    /// reasons while the decoder on the other end of the stream still
    /// remembers the key, so eviction alone must never force a needless
    /// re-send — only forgetting the key here does (`SPEC_FULL.md` §4.5:
    /// "eviction runs a caller-provided destructor").
    sent_frames: HashSet<u64>,
    sent_strings: HashSet<u64>,
    /// Byte offset of the tid field within the `pthread_t` buffer pointed to
    /// by a pre-3.11 thread's `ThreadState.thread_id`, once inferred
    /// (`SPEC_FULL.md` §4.8). Memoised per-target: every thread in a process
    /// shares the same libc, so the offset never needs re-deriving once found.
    tid_field_offset: Option<i64>,
    /// Set once a scan has failed to find the offset, so a target whose
    /// threading library doesn't match the expected layout isn't rescanned
    /// every tick.
    tid_lookup_failed: bool,
}

impl<P: ProcessMemory> Target<P> {
    pub fn new(
        process: P,
        desc: VersionDescriptor,
        interpreter_head: usize,
        max_stack: usize,
        window_size: usize,
    ) -> Self {
        Target {
            process,
            threadstate_current_addr: 0,
            caches: TargetCaches::new(max_stack),
            buffers: StackBuffers::new(max_stack),
            last_rss: 0,
            last_sample_at: None,
            window_size: window_size.max(size_of::<usize>()),
            interpreter_head,
            desc,
            sent_frames: HashSet::new(),
            sent_strings: HashSet::new(),
            tid_field_offset: None,
            tid_lookup_failed: false,
        }
    }

    /// Infer (or recall) the native OS thread id for a pre-3.11 thread given
    /// the remote address of its `ThreadState.thread_id` handle — a
    /// `pthread_t`, which on NPTL is a pointer to the thread's control block
    /// rather than the kernel tid itself.
    ///
    /// Grounded on `original_source/src/linux/py_proc.h`'s
    /// `_infer_tid_field_offset`: copy a bounded window of the block and
    /// search it for our own pid (or the namespaced pid, inside a container)
    /// at a small integer offset; memoise the offset the first time it's
    /// found. Unlike the original's two-pass scan (pointer-sized words, then
    /// a `pid_t`-sized fallback), this scans at `pid_t` (4-byte) granularity
    /// throughout, which already covers every offset the fallback pass would
    /// find.
    pub fn infer_native_tid(&mut self, pid: Pid, pthread_handle: u64) -> Option<u64> {
        if pthread_handle == 0 {
            return None;
        }

        if let Some(offset) = self.tid_field_offset {
            return self.read_tid_at(pthread_handle, offset);
        }
        if self.tid_lookup_failed {
            return None;
        }

        let window = self.process.copy(pthread_handle as usize, TID_SCAN_WINDOW).ok()?;
        let target_pid = pid as u32;
        let ns_pid = crate::platform::namespaced_pid(pid).map(|p| p as u32);

        let mut offset = 0usize;
        while offset + 4 <= window.len() {
            let candidate = u32::from_le_bytes(window[offset..offset + 4].try_into().unwrap());
            if candidate == target_pid || ns_pid == Some(candidate) {
                self.tid_field_offset = Some(offset as i64);
                return Some(candidate as u64);
            }
            offset += 4;
        }

        self.tid_lookup_failed = true;
        None
    }

    fn read_tid_at(&self, pthread_handle: u64, offset: i64) -> Option<u64> {
        let addr = (pthread_handle as i64 + offset) as usize;
        let bytes = self.process.copy(addr, 4).ok()?;
        Some(u32::from_le_bytes(bytes.try_into().unwrap()) as u64)
    }

    /// Looks up a previously cached string by its key (the remote address of
    /// its `PyASCIIObject`), without touching the emitter's sent-once
    /// bookkeeping. Used by [`heuristic_is_idle`]'s fallback, which only
    /// needs the string's content, not whether it's been streamed yet.
    pub fn lookup_string(&mut self, key: u64) -> Option<String> {
        self.caches.strings.get(&key).cloned()
    }

    /// Drops every cached frame/code record *and* forgets which keys were
    /// already sent to the emitter, so that a key reused for different
    /// bytecode after a code-object-generation bump is re-sent as a fresh
    /// `Frame` rather than assumed already known
    /// (`SPEC_FULL.md` §8: "no subsequent `FrameRef` refers to a
    /// pre-invalidation key until a fresh `Frame` is emitted").
    pub fn invalidate_all(&mut self) {
        self.caches.invalidate_all();
        self.sent_frames.clear();
        self.sent_strings.clear();
    }

    fn read_u64_field(&self, base: usize, offset: usize) -> anyhow::Result<u64> {
        let bytes = self
            .process
            .copy(base + offset, size_of::<usize>())
            .map_err(|e| to_anyhow(Kind::MemoryCopy, e.to_string()))?;
        Ok(usize::from_le_bytes(bytes.try_into().unwrap()) as u64)
    }

    /// Reads a field through `window` when it falls inside the prefetched
    /// range, falling back to a direct remote read otherwise.
    fn read_windowed(&self, base: usize, window: &InterpWindow, offset: usize) -> anyhow::Result<u64> {
        match window.read_u64(offset) {
            Some(v) => Ok(v),
            None => self.read_u64_field(base, offset),
        }
    }

    /// Walk the interpreter linked list from the runtime's head
    /// (`SPEC_FULL.md` §4.9: "for each tick, for each interpreter in the
    /// linked list"), prefetching each interpreter's state window along the
    /// way so later per-tick reads (code-object generation, thread-state
    /// head, GC flag) don't each cost a separate remote read.
    pub fn list_interpreters(&mut self) -> anyhow::Result<Vec<InterpreterHandle>> {
        let mut out = Vec::new();
        let mut addr = self.interpreter_head;
        let mut position = 0u64;

        while addr != 0 {
            if out.len() >= MAX_INTERPRETERS {
                anyhow::bail!("max interpreter recursion depth reached");
            }

            let bytes = self
                .process
                .copy(addr, self.window_size)
                .map_err(|e| to_anyhow(Kind::MemoryCopy, e.to_string()))?;
            let window = InterpWindow { bytes };

            let id = if self.desc.interp_id != 0 {
                self.read_windowed(addr, &window, self.desc.interp_id)
                    .unwrap_or(position)
            } else {
                position
            };
            let gc_addr = if self.desc.interp_gc != 0 {
                addr + self.desc.interp_gc
            } else {
                0
            };
            let next = self.read_windowed(addr, &window, self.desc.interp_next)? as usize;

            out.push(InterpreterHandle {
                address: addr,
                id,
                gc_addr,
                window,
            });

            if next == addr {
                break;
            }
            addr = next;
            position += 1;
        }

        Ok(out)
    }

    /// Check (and, on change, act on) the 3.14+ code-object-generation
    /// counter for one interpreter, keyed by `(interpreter_id,
    /// code_object_generation)` via [`crate::caches::TargetCaches::interpreter_meta`];
    /// on change, both the frame and code caches are invalidated before any
    /// thread of this interpreter is walked this tick.
    pub fn check_code_object_generation(&mut self, interp: &InterpreterHandle) -> anyhow::Result<()> {
        if self.desc.interp_code_object_generation == 0 {
            return Ok(());
        }
        let gen = self.read_windowed(interp.address, &interp.window, self.desc.interp_code_object_generation)?;

        if let Some(key) = interpreter_cache_key(interp.id as i64) {
            let changed = match self.caches.interpreter_meta.get(&key) {
                Some(&last) => last != gen,
                None => true,
            };
            if changed {
                self.invalidate_all();
                self.caches.interpreter_meta.put(key, gen);
            }
        }
        Ok(())
    }

    /// Which thread (if any) currently holds the GIL, identified by its
    /// native thread id field.
    pub fn gil_holder_thread_id(&self) -> anyhow::Result<u64> {
        if self.threadstate_current_addr == 0 {
            return Ok(0);
        }
        let addr = self.read_u64_field(self.threadstate_current_addr, 0)? as usize;
        if addr == 0 {
            return Ok(0);
        }
        self.read_u64_field(addr, self.desc.thread_thread_id)
    }

    /// Walk one interpreter's thread list once, yielding one [`ThreadHandle`]
    /// per live thread.
    pub fn walk_threads(&mut self, interp: &InterpreterHandle) -> anyhow::Result<Vec<ThreadHandle>> {
        let mut handles = Vec::new();
        let mut next =
            self.read_windowed(interp.address, &interp.window, self.desc.interp_tstate_head)? as usize;
        let mut count = 0;
        while next != 0 {
            count += 1;
            if count > MAX_THREADS {
                anyhow::bail!("max thread recursion depth reached");
            }

            let top_frame_field = self.read_u64_field(next, self.desc.thread_frame)? as usize;
            let status = self.read_u64_field(next, self.desc.thread_status).unwrap_or(1);
            let thread_id = self.read_u64_field(next, self.desc.thread_thread_id).unwrap_or(0);
            let native_thread_id = if self.desc.native_tid_in_threadstate {
                self.read_u64_field(next, self.desc.thread_native_thread_id).ok()
            } else {
                None
            };

            handles.push(ThreadHandle {
                address: next,
                thread_id,
                native_thread_id,
                top_frame: top_frame_field,
                active: status != 0,
            });

            next = self.read_u64_field(next, self.desc.thread_next)? as usize;
        }
        Ok(handles)
    }

    /// Unwind one thread's call stack into the pre-resolution stack buffer,
    /// then resolve every frame to a cached [`FrameRecord`], reporting which
    /// frames/strings the emitter has never seen before on this stream.
    pub fn unwind_thread(&mut self, thread: &ThreadHandle) -> anyhow::Result<Vec<ResolvedFrame>> {
        self.buffers.py_frames.reset();

        match self.desc.frame_dialect {
            FrameDialect::Classic => self.walk_classic(thread.top_frame)?,
            FrameDialect::CFrameRooted => self.walk_cframe_rooted(thread.top_frame)?,
            FrameDialect::InterpreterFrameNative => {
                self.walk_interpreter_frame_native(thread.top_frame)?
            }
        }

        if self.buffers.py_frames.has_cycle() {
            anyhow::bail!("self-referential frame chain detected");
        }

        self.resolve_frames()
    }

    fn walk_classic(&mut self, mut frame: usize) -> anyhow::Result<()> {
        let mut count = 0;
        while frame != 0 {
            count += 1;
            if count > MAX_FRAMES {
                anyhow::bail!("max frame recursion depth reached");
            }
            let code = self.read_u64_field(frame, self.desc.frame_code)? as u64;
            let lasti = self.read_u64_field(frame, self.desc.frame_lasti)? as i64;
            if !self.buffers.py_frames.push(PyFrame {
                origin: frame as u64,
                code,
                lasti,
            }) {
                break;
            }
            frame = self.read_u64_field(frame, self.desc.frame_back)? as usize;
        }
        Ok(())
    }

    fn walk_cframe_rooted(&mut self, cframe: usize) -> anyhow::Result<()> {
        if cframe == 0 {
            return Ok(());
        }
        let top = self.read_u64_field(cframe, self.desc.cframe_current_frame)? as usize;
        self.walk_interpreter_frames(top)
    }

    fn walk_interpreter_frame_native(&mut self, frame: usize) -> anyhow::Result<()> {
        self.walk_interpreter_frames(frame)
    }

    fn walk_interpreter_frames(&mut self, mut frame: usize) -> anyhow::Result<()> {
        let mut count = 0;
        while frame != 0 {
            count += 1;
            if count > MAX_FRAMES {
                anyhow::bail!("max frame recursion depth reached");
            }

            let is_shim = if self.desc.has_frame_owner {
                self.read_u64_field(frame, self.desc.interpreter_frame_owner)? != 0
            } else if self.desc.has_is_entry {
                self.read_u64_field(frame, self.desc.interpreter_frame_is_entry)? != 0
            } else {
                false
            };

            if !is_shim {
                let code = self.read_u64_field(frame, self.desc.interpreter_frame_code)? as u64;
                let prev_instr =
                    self.read_u64_field(frame, self.desc.interpreter_frame_prev_instr)? as i64;
                let code_addr = code as i64;
                let lasti = if code != 0 {
                    (prev_instr - code_addr) / self.desc.code_unit_size as i64
                } else {
                    0
                };
                if !self.buffers.py_frames.push(PyFrame {
                    origin: frame as u64,
                    code,
                    lasti,
                }) {
                    break;
                }
            }

            frame = self.read_u64_field(frame, self.desc.interpreter_frame_previous)? as usize;
        }
        Ok(())
    }

    fn read_code(
        &mut self,
        code_raddr: u64,
        new_strings: &mut Vec<(u64, String)>,
    ) -> anyhow::Result<CodeRecord> {
        if let Some(cached) = self.caches.codes.get(&code_raddr) {
            // Even on a code-record cache hit, the filename/scope strings
            // may not have been sent yet (e.g. a fresh stream after
            // `invalidate_all` cleared `sent_strings` but not the string
            // cache itself, which survives generation bumps).
            let cached = cached.clone();
            self.read_string(cached.filename_ref, new_strings)?;
            self.read_string(cached.scope_ref, new_strings)?;
            return Ok(cached);
        }

        let lnotab_ptr = self.read_u64_field(code_raddr as usize, self.desc.code_lnotab)? as usize;
        let filename_ptr = self.read_u64_field(code_raddr as usize, self.desc.code_filename)? as usize;
        let name_field = if self.desc.frame_dialect == FrameDialect::Classic {
            self.desc.code_name
        } else {
            self.desc.code_qualname
        };
        let scope_ptr = self.read_u64_field(code_raddr as usize, name_field)? as usize;
        let first_line = self.read_u64_field(code_raddr as usize, self.desc.code_firstlineno)? as u32;

        // Line tables are small (typically well under a kilobyte); read a
        // bounded window rather than chase the object's own length field.
        let line_table = self
            .process
            .copy(lnotab_ptr, 1024)
            .map_err(|e| to_anyhow(Kind::MemoryCopy, e.to_string()))?;

        let filename_ref = self.read_string(filename_ptr as u64, new_strings)?;
        let scope_ref = self.read_string(scope_ptr as u64, new_strings)?;

        let record = CodeRecord {
            key: code_raddr,
            filename_ref,
            scope_ref,
            line_table,
            first_line,
        };
        // No dedicated cleanup needed on eviction here: code records carry no
        // bookkeeping outside the cache itself.
        self.caches.codes.put(code_raddr, record.clone());
        Ok(record)
    }

    /// Ensures `addr`'s bytes are cached, returning `(key, Some(value))` the
    /// first time this key is ever seen (the caller must emit a `String`
    /// event) or `(key, None)` on every later call (emit `StringRef`).
    fn read_string(&mut self, addr: u64, new_strings: &mut Vec<(u64, String)>) -> anyhow::Result<u64> {
        if addr == 0 {
            return Ok(0);
        }
        if self.caches.strings.get(&addr).is_none() {
            let bytes = self
                .process
                .copy(addr as usize, 256)
                .map_err(|e| to_anyhow(Kind::MemoryCopy, e.to_string()))?;
            let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            let s = String::from_utf8_lossy(&bytes[..end]).into_owned();
            if let Some((evicted_addr, _)) = self.caches.strings.put(addr, s) {
                self.sent_strings.remove(&evicted_addr);
            }
        }
        if self.sent_strings.insert(addr) {
            let value = self.caches.strings.get(&addr).cloned().unwrap_or_default();
            new_strings.push((addr, value));
        }
        Ok(addr)
    }

    fn resolve_frames(&mut self) -> anyhow::Result<Vec<ResolvedFrame>> {
        let dialect = Dialect::for_version(self.desc.version.0, self.desc.version.1);
        let py_frames: Vec<PyFrame> = self.buffers.py_frames.iter().copied().collect();

        let mut resolved = Vec::with_capacity(py_frames.len());
        for py_frame in py_frames {
            let key = codeloc::frame_key(py_frame.code, py_frame.lasti);
            let mut new_strings = Vec::new();

            let record = if let Some(cached) = self.caches.frames.get(&key) {
                cached.clone()
            } else {
                let code = self.read_code(py_frame.code, &mut new_strings)?;
                let location =
                    codeloc::decode(dialect, &code.line_table, code.first_line, py_frame.lasti)
                        .unwrap_or(Location::default());

                let record = FrameRecord {
                    key,
                    filename_ref: code.filename_ref,
                    scope_ref: code.scope_ref,
                    location,
                };
                if let Some((evicted_key, _)) = self.caches.frames.put(key, record.clone()) {
                    self.sent_frames.remove(&evicted_key);
                }
                record
            };

            let is_new = self.sent_frames.insert(key);
            resolved.push(ResolvedFrame {
                record,
                is_new,
                new_strings,
            });
        }
        Ok(resolved)
    }
}

/// One thread surfaced by [`Target::walk_threads`].
#[derive(Debug, Clone)]
pub struct ThreadHandle {
    pub address: usize,
    pub thread_id: u64,
    pub native_thread_id: Option<u64>,
    pub top_frame: usize,
    pub active: bool,
}

/// Mirrors `_heuristic_is_thread_idle`: a thread whose top frame sits in a
/// well-known blocking call of the stdlib/common async libraries is treated
/// as idle absent better information from the OS scheduler.
pub fn heuristic_is_idle(top_frame: Option<(&str, &str)>) -> bool {
    match top_frame {
        None => false,
        Some((name, filename)) => {
            (name == "wait" && filename.ends_with("threading.py"))
                || (name == "select" && filename.ends_with("selectors.py"))
                || (name == "poll"
                    && (filename.ends_with("asyncore.py")
                        || filename.contains("zmq")
                        || filename.contains("gevent")
                        || filename.contains("tornado")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_heuristic_matches_known_blocking_frames() {
        assert!(heuristic_is_idle(Some(("wait", "/usr/lib/python3.11/threading.py"))));
        assert!(heuristic_is_idle(Some(("select", "/usr/lib/python3.11/selectors.py"))));
        assert!(heuristic_is_idle(Some(("poll", "site-packages/zmq/sugar/poll.py"))));
        assert!(!heuristic_is_idle(Some(("run", "myapp/worker.py"))));
        assert!(!heuristic_is_idle(None));
    }
}
