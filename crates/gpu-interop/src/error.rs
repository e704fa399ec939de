//! Device error type.
//!
//! Every device call is checked on its own. A failure records which call
//! failed and the source location that issued it.

use std::fmt;
use std::panic::Location;

use nnao_core::SurfaceHandle;

/// Source location of a failed device call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    pub file: &'static str,
    pub line: u32,
}

impl CallSite {
    /// The location of the caller of the function this is invoked from.
    #[track_caller]
    pub fn caller() -> Self {
        let location = Location::caller();
        Self {
            file: location.file(),
            line: location.line(),
        }
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InteropError {
    #[error("{call} failed at {site}: {detail}")]
    Call {
        call: &'static str,
        detail: String,
        site: CallSite,
    },

    #[error("registering {surface} for interop failed at {site}: {detail}")]
    RegistrationFailed {
        surface: SurfaceHandle,
        detail: String,
        site: CallSite,
    },

    #[error("pitch mismatch: {buffer} buffer pitch {actual} != input buffer pitch {expected}")]
    LayoutMismatch {
        buffer: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid depth range [{min}, {max}]: max must be greater than min and both finite")]
    InvalidDepthRange { min: f32, max: f32 },

    #[error("interop resource is not mapped")]
    NotMapped,

    #[error("unknown device handle {0}")]
    UnknownHandle(u64),

    #[error("operation not supported by this device: {0}")]
    Unsupported(&'static str),
}

impl InteropError {
    /// A failed device call, located at the caller.
    #[track_caller]
    pub fn call(call: &'static str, detail: impl Into<String>) -> Self {
        InteropError::Call {
            call,
            detail: detail.into(),
            site: CallSite::caller(),
        }
    }

    #[track_caller]
    pub fn registration(surface: SurfaceHandle, detail: impl Into<String>) -> Self {
        InteropError::RegistrationFailed {
            surface,
            detail: detail.into(),
            site: CallSite::caller(),
        }
    }
}

pub type Result<T> = std::result::Result<T, InteropError>;
