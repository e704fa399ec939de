//! Inference session lifecycle and the host plugin controller.
//!
//! [`InferenceSession`] owns one run: three interop registrations, three
//! pitched buffers, the capture textures and a loaded graph. [`NnaoPlugin`]
//! wires it to the host's frame callbacks and reports failures to a
//! [`DiagnosticSink`](nnao_core::DiagnosticSink).

pub mod error;
pub mod plugin;
pub mod session;
pub mod textures;

pub use error::{Result, SessionError};
pub use plugin::NnaoPlugin;
pub use session::{InferenceSession, SessionParams, SessionState, StepOutcome};
pub use textures::CaptureTextures;
