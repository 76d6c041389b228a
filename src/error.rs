//! Thread-local error slot, mirroring austin's `(austin_errno, austin_error_msg)` pair.
//!
//! Every fallible operation in the core sets this slot before returning, so that
//! callers which only see a `bool`/`Option` at a hot call site (for example the
//! per-thread walk in [`crate::unwind`]) can still recover the reason after the
//! fact via [`last_error`].

use std::cell::RefCell;
use std::fmt;

/// Error kinds, in the order given by `SPEC_FULL.md` §7 / `error.h`'s `AUSTIN_E*` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Os,
    Permission,
    MemoryCopy,
    MemoryAllocation,
    Io,
    CommandLine,
    Environment,
    Value,
    Null,
    Version,
    Binary,
    PyObject,
    VmMaps,
    IterationEnd,
}

impl Kind {
    /// Whether this kind should terminate the whole run rather than just this
    /// sample or this target.
    pub fn is_fatal(self) -> bool {
        !matches!(
            self,
            Kind::MemoryCopy
                | Kind::Value
                | Kind::Binary
                | Kind::PyObject
                | Kind::VmMaps
                | Kind::IterationEnd
        )
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Kind::Os => "OS error",
            Kind::Permission => "permission denied",
            Kind::MemoryCopy => "failed to copy remote memory",
            Kind::MemoryAllocation => "memory allocation failed",
            Kind::Io => "I/O error",
            Kind::CommandLine => "command line error",
            Kind::Environment => "environment error",
            Kind::Value => "invalid value",
            Kind::Null => "unexpected null",
            Kind::Version => "unsupported or undetectable Python version",
            Kind::Binary => "binary analysis error",
            Kind::PyObject => "invalid Python object layout",
            Kind::VmMaps => "failed to read process memory maps",
            Kind::IterationEnd => "iteration end",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone)]
pub struct AustinError {
    pub kind: Kind,
    pub message: String,
}

impl fmt::Display for AustinError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for AustinError {}

thread_local! {
    static LAST_ERROR: RefCell<Option<AustinError>> = RefCell::new(None);
}

/// Set the thread-local error slot, logging it the way `log_error()` does in
/// the original (fatal kinds at `error!`, everything else at `debug!`).
pub fn set_error(kind: Kind, message: impl Into<String>) {
    let err = AustinError {
        kind,
        message: message.into(),
    };
    if err.kind.is_fatal() {
        error!("{}", err);
    } else {
        debug!("{}", err);
    }
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(err));
}

/// Read back the last error set on this thread, if any.
pub fn last_error() -> Option<AustinError> {
    LAST_ERROR.with(|slot| slot.borrow().clone())
}

/// Convert to an `anyhow::Error` at an API boundary.
pub fn to_anyhow(kind: Kind, message: impl Into<String>) -> anyhow::Error {
    let message = message.into();
    set_error(kind, message.clone());
    anyhow::Error::new(AustinError { kind, message })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_kinds() {
        assert!(Kind::Os.is_fatal());
        assert!(Kind::Permission.is_fatal());
        assert!(Kind::Version.is_fatal());
        assert!(!Kind::MemoryCopy.is_fatal());
        assert!(!Kind::PyObject.is_fatal());
        assert!(!Kind::IterationEnd.is_fatal());
    }

    #[test]
    fn slot_roundtrip() {
        set_error(Kind::Value, "bad lnotab");
        let err = last_error().expect("error should be set");
        assert_eq!(err.kind, Kind::Value);
        assert_eq!(err.message, "bad lnotab");
    }
}
