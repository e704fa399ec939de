//! Session error taxonomy.
//!
//! Each variant maps to a stable integer code via
//! [`SessionError::error_code`] so hosts can branch without parsing text.

use gpu_interop::{CallSite, InteropError};
use nnao_core::{CapturePhase, SurfaceHandle};
use nnao_engine::EngineStatus;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    // -- capture --------------------------------------------------------
    #[error("surfaces not ready: capture is {phase:?}")]
    SurfacesNotReady { phase: CapturePhase },

    // -- device ---------------------------------------------------------
    #[error("layout mismatch: {buffer} buffer pitch {actual} != input pitch {expected}")]
    LayoutMismatch {
        buffer: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("interop registration of {surface} failed at {site}: {detail}")]
    InteropRegistrationFailed {
        surface: SurfaceHandle,
        detail: String,
        site: CallSite,
    },

    #[error(transparent)]
    Device(InteropError),

    #[error("invalid depth range [{min}, {max}]")]
    InvalidDepthRange { min: f32, max: f32 },

    // -- engine ---------------------------------------------------------
    #[error("{0}")]
    GraphLoadFailed(EngineStatus),

    #[error("{0}")]
    GraphCreateFailed(EngineStatus),

    #[error("{0}")]
    InferenceFailed(EngineStatus),

    #[error("unsupported graph mode {0}; expected 0 (binary) or 1 (text)")]
    UnsupportedGraphMode(u32),

    #[error("engine {engine} has no device kernel support")]
    EngineUnavailable { engine: String },

    // -- control --------------------------------------------------------
    #[error("no inference session is running")]
    NotRunning,
}

impl SessionError {
    /// Stable integer code:
    /// - 1xx: capture
    /// - 2xx: device
    /// - 3xx: engine
    /// - 4xx: control
    pub fn error_code(&self) -> u32 {
        match self {
            Self::SurfacesNotReady { .. } => 100,
            Self::LayoutMismatch { .. } => 200,
            Self::InteropRegistrationFailed { .. } => 201,
            Self::Device(_) => 202,
            Self::InvalidDepthRange { .. } => 203,
            Self::GraphLoadFailed(_) => 300,
            Self::GraphCreateFailed(_) => 301,
            Self::InferenceFailed(_) => 302,
            Self::UnsupportedGraphMode(_) => 303,
            Self::EngineUnavailable { .. } => 304,
            Self::NotRunning => 400,
        }
    }

    /// Whether the failure happened with a session already running, which
    /// means the session was torn down because of it.
    pub fn tears_down(&self) -> bool {
        matches!(self, Self::Device(_) | Self::InferenceFailed(_))
    }
}

impl From<InteropError> for SessionError {
    fn from(err: InteropError) -> Self {
        match err {
            InteropError::LayoutMismatch {
                buffer,
                expected,
                actual,
            } => Self::LayoutMismatch {
                buffer,
                expected,
                actual,
            },
            InteropError::RegistrationFailed {
                surface,
                detail,
                site,
            } => Self::InteropRegistrationFailed {
                surface,
                detail,
                site,
            },
            InteropError::InvalidDepthRange { min, max } => Self::InvalidDepthRange { min, max },
            other => Self::Device(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
