//! Per-CPython-version struct sizes and field offsets.
//!
//! The teacher (`py-spy`) generates one Rust module per supported version via
//! `bindgen` and dispatches with a giant `match` over `(Version, Os, Arch)` at
//! the type level (see `python_bindings::*` and the various `InterpreterState`
//! trait impls it re-exports). That table doesn't travel well once every
//! struct in play is described by name rather than by a generated Rust type:
//! this module keeps the same "one record per version family" shape the
//! teacher already uses in `python_bindings::pyruntime`'s offset functions,
//! generalized to every struct the unwinder touches.

use crate::version::Version;

/// Struct sizes and named field offsets for one CPython ABI generation.
///
/// All offsets are in bytes from the start of the struct they belong to.
/// Fields that don't exist for a given version family are left at `0` and
/// must not be read by code gated on that family (`Frame` offsets are unused
/// once `interpreter_frame` is populated, and vice versa).
#[derive(Debug, Clone, Copy)]
pub struct VersionDescriptor {
    pub version: (u64, u64),

    // Struct sizes.
    pub size_runtime: usize,
    pub size_interpreter_state: usize,
    pub size_thread_state: usize,
    pub size_frame: usize,
    pub size_interpreter_frame: usize,
    pub size_cframe: usize,
    pub size_code: usize,
    pub size_unicode: usize,
    pub size_bytes: usize,
    pub size_gc: usize,
    pub size_gilstate: usize,

    // Runtime.
    pub runtime_interp_head: usize,
    pub runtime_tstate_current: usize,
    pub runtime_gilstate: usize,

    // InterpreterState.
    pub interp_next: usize,
    pub interp_tstate_head: usize,
    pub interp_id: usize,
    pub interp_gc: usize,
    pub interp_code_object_generation: usize,

    // ThreadState.
    pub thread_interp: usize,
    pub thread_frame: usize,
    pub thread_next: usize,
    pub thread_status: usize,
    pub thread_thread_id: usize,
    pub thread_native_thread_id: usize,

    // Frame (classic, <=3.10).
    pub frame_back: usize,
    pub frame_code: usize,
    pub frame_lasti: usize,

    // InterpreterFrame (3.11+) / CFrame (3.11-3.12).
    pub interpreter_frame_previous: usize,
    pub interpreter_frame_code: usize,
    pub interpreter_frame_prev_instr: usize,
    pub interpreter_frame_owner: usize,
    pub interpreter_frame_is_entry: usize,
    pub cframe_current_frame: usize,

    // Code.
    pub code_filename: usize,
    pub code_name: usize,
    pub code_qualname: usize,
    pub code_lnotab: usize,
    pub code_firstlineno: usize,
    pub code_code: usize,

    /// Size of one bytecode instruction unit (`sizeof(_Py_CODEUNIT)`), 2 since 3.6.
    pub code_unit_size: usize,

    /// Whether `InterpreterFrame.owner` marks C-stack-owned ("shim") frames (3.12+).
    pub has_frame_owner: bool,
    /// Whether the 3.11-only `is_entry` guard should be consulted instead of `owner`.
    pub has_is_entry: bool,
    /// Whether thread state already carries the native OS thread id directly (3.11+).
    pub native_tid_in_threadstate: bool,
    /// Whether frames live in `_PyInterpreterFrame` form rooted at a `_PyCFrame` (3.11-3.12)
    /// vs. directly off `ThreadState.frame` (3.13+) vs. classic `PyFrameObject` (<=3.10).
    pub frame_dialect: FrameDialect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDialect {
    Classic,
    CFrameRooted,
    InterpreterFrameNative,
}

impl VersionDescriptor {
    /// Look up the descriptor for a `(major, minor, patch)` triple. `patch` is
    /// currently unused for offset selection (CPython has never changed these
    /// offsets within a minor series) but is accepted for forward compatibility
    /// with hypothetical mid-series ABI breaks.
    pub fn lookup(version: &Version) -> Option<VersionDescriptor> {
        match (version.major, version.minor) {
            (2, 7) => Some(v2_7()),
            (3, m) if (6..=10).contains(&m) => Some(v3_6_to_10(m)),
            (3, 11) => Some(v3_11()),
            (3, 12) => Some(v3_12()),
            (3, m) if m >= 13 => Some(v3_13_plus(m)),
            _ => None,
        }
    }
}

fn v2_7() -> VersionDescriptor {
    VersionDescriptor {
        version: (2, 7),
        size_runtime: 0, // 2.7 has no PyRuntime; interp_head is a bare global symbol.
        size_interpreter_state: 64,
        size_thread_state: 144,
        size_frame: 96,
        size_interpreter_frame: 0,
        size_cframe: 0,
        size_code: 88,
        size_unicode: 0,
        size_bytes: 24,
        size_gc: 0,
        size_gilstate: 0,
        runtime_interp_head: 0,
        runtime_tstate_current: 0,
        runtime_gilstate: 0,
        interp_next: 0,
        interp_tstate_head: 8,
        interp_id: 0,
        interp_gc: 0,
        interp_code_object_generation: 0,
        thread_interp: 0,
        thread_frame: 8,
        thread_next: 16,
        thread_status: 0,
        thread_thread_id: 144 - 8,
        thread_native_thread_id: 0,
        frame_back: 8,
        frame_code: 16,
        frame_lasti: 48,
        interpreter_frame_previous: 0,
        interpreter_frame_code: 0,
        interpreter_frame_prev_instr: 0,
        interpreter_frame_owner: 0,
        interpreter_frame_is_entry: 0,
        cframe_current_frame: 0,
        code_filename: 48,
        code_name: 56,
        code_qualname: 56,
        code_lnotab: 80,
        code_firstlineno: 36,
        code_code: 24,
        code_unit_size: 1,
        has_frame_owner: false,
        has_is_entry: false,
        native_tid_in_threadstate: false,
        frame_dialect: FrameDialect::Classic,
    }
}

fn v3_6_to_10(minor: u64) -> VersionDescriptor {
    VersionDescriptor {
        version: (3, minor),
        size_runtime: if minor >= 7 { 2048 } else { 0 },
        size_interpreter_state: 256,
        size_thread_state: 256,
        size_frame: 96,
        size_interpreter_frame: 0,
        size_cframe: 0,
        size_code: 104,
        size_unicode: 48,
        size_bytes: 24,
        size_gc: 24,
        size_gilstate: 32,
        runtime_interp_head: if minor >= 7 { 32 } else { 0 },
        runtime_tstate_current: if minor >= 7 { 40 } else { 0 },
        runtime_gilstate: if minor >= 7 { 1152 } else { 0 },
        interp_next: 8,
        interp_tstate_head: 16,
        interp_id: if minor >= 8 { 24 } else { 0 },
        interp_gc: if minor >= 7 { 40 } else { 0 },
        interp_code_object_generation: 0,
        thread_interp: 8,
        thread_frame: 16,
        thread_next: 24,
        thread_status: 32,
        thread_thread_id: 176,
        thread_native_thread_id: 0,
        frame_back: 24,
        frame_code: 32,
        frame_lasti: if minor >= 10 { 96 } else { 48 },
        interpreter_frame_previous: 0,
        interpreter_frame_code: 0,
        interpreter_frame_prev_instr: 0,
        interpreter_frame_owner: 0,
        interpreter_frame_is_entry: 0,
        cframe_current_frame: 0,
        code_filename: 96,
        code_name: if minor >= 9 { 112 } else { 104 },
        code_qualname: if minor >= 9 { 112 } else { 104 },
        code_lnotab: if minor >= 10 { 112 } else { 96 },
        code_firstlineno: 44,
        code_code: 80,
        code_unit_size: 2,
        has_frame_owner: false,
        has_is_entry: false,
        native_tid_in_threadstate: false,
        frame_dialect: FrameDialect::Classic,
    }
}

fn v3_11() -> VersionDescriptor {
    VersionDescriptor {
        version: (3, 11),
        size_runtime: 2048,
        size_interpreter_state: 280,
        size_thread_state: 352,
        size_frame: 0,
        size_interpreter_frame: 72,
        size_cframe: 16,
        size_code: 120,
        size_unicode: 48,
        size_bytes: 24,
        size_gc: 24,
        size_gilstate: 32,
        runtime_interp_head: 32,
        runtime_tstate_current: 40,
        runtime_gilstate: 1152,
        interp_next: 8,
        interp_tstate_head: 16,
        interp_id: 24,
        interp_gc: 48,
        interp_code_object_generation: 0,
        thread_interp: 8,
        thread_frame: 24,
        thread_next: 16,
        thread_status: 48,
        thread_thread_id: 176,
        thread_native_thread_id: 184,
        frame_back: 0,
        frame_code: 0,
        frame_lasti: 0,
        interpreter_frame_previous: 0,
        interpreter_frame_code: 8,
        interpreter_frame_prev_instr: 56,
        interpreter_frame_owner: 0,
        interpreter_frame_is_entry: 64,
        cframe_current_frame: 8,
        code_filename: 96,
        code_name: 104,
        code_qualname: 112,
        code_lnotab: 112,
        code_firstlineno: 44,
        code_code: 80,
        code_unit_size: 2,
        has_frame_owner: false,
        has_is_entry: true,
        native_tid_in_threadstate: true,
        frame_dialect: FrameDialect::CFrameRooted,
    }
}

fn v3_12() -> VersionDescriptor {
    let mut d = v3_11();
    d.version = (3, 12);
    d.size_interpreter_frame = 80;
    d.interpreter_frame_owner = 72;
    d.has_frame_owner = true;
    d.has_is_entry = false;
    // `code_object_generation` doesn't exist on the interpreter state until
    // 3.14; left at 0 so `check_code_object_generation` skips the check.
    d
}

fn v3_13_plus(minor: u64) -> VersionDescriptor {
    let mut d = v3_12();
    d.version = (3, minor);
    // From 3.13 the thread state itself carries the top interpreter frame
    // directly (no `_PyCFrame` indirection).
    d.frame_dialect = FrameDialect::InterpreterFrameNative;
    if minor >= 14 {
        d.interp_code_object_generation = 64;
    }
    d
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::Version;

    fn v(major: u64, minor: u64, patch: u64) -> Version {
        Version {
            major,
            minor,
            patch,
            release_flags: String::new(),
            build_metadata: None,
        }
    }

    #[test]
    fn looks_up_supported_versions() {
        assert!(VersionDescriptor::lookup(&v(2, 7, 18)).is_some());
        assert!(VersionDescriptor::lookup(&v(3, 8, 10)).is_some());
        assert!(VersionDescriptor::lookup(&v(3, 11, 4)).is_some());
        assert!(VersionDescriptor::lookup(&v(3, 12, 3)).is_some());
        assert!(VersionDescriptor::lookup(&v(3, 14, 0)).is_some());
    }

    #[test]
    fn rejects_unsupported_major() {
        assert!(VersionDescriptor::lookup(&v(1, 7, 0)).is_none());
        assert!(VersionDescriptor::lookup(&v(3, 5, 9)).is_none());
    }

    #[test]
    fn frame_dialect_matches_version_family() {
        let d310 = VersionDescriptor::lookup(&v(3, 10, 0)).unwrap();
        assert_eq!(d310.frame_dialect, FrameDialect::Classic);

        let d311 = VersionDescriptor::lookup(&v(3, 11, 0)).unwrap();
        assert_eq!(d311.frame_dialect, FrameDialect::CFrameRooted);
        assert!(d311.has_is_entry);
        assert!(!d311.has_frame_owner);

        let d312 = VersionDescriptor::lookup(&v(3, 12, 0)).unwrap();
        assert_eq!(d312.frame_dialect, FrameDialect::CFrameRooted);
        assert!(d312.has_frame_owner);
        assert!(!d312.has_is_entry);

        let d313 = VersionDescriptor::lookup(&v(3, 13, 0)).unwrap();
        assert_eq!(d313.frame_dialect, FrameDialect::InterpreterFrameNative);
    }

    #[test]
    fn code_object_generation_offset_present_from_3_14() {
        let d312 = VersionDescriptor::lookup(&v(3, 12, 0)).unwrap();
        assert_eq!(d312.interp_code_object_generation, 0);
        let d313 = VersionDescriptor::lookup(&v(3, 13, 0)).unwrap();
        assert_eq!(d313.interp_code_object_generation, 0);
        let d314 = VersionDescriptor::lookup(&v(3, 14, 0)).unwrap();
        assert_eq!(d314.interp_code_object_generation, 64);
    }
}
