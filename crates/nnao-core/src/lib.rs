//! Host-boundary types for streaming render surfaces into an inference engine.
//!
//! Nothing in this crate touches the GPU. It describes what the host rendering
//! system hands us (surfaces), the order it hands them in (the frame
//! [`capture`] state machine), how the plugin is configured, and where
//! diagnostics go.

pub mod capture;
pub mod config;
pub mod diagnostics;
pub mod surface;

pub use capture::{CapturePhase, CaptureState, CapturedSurfaces, Delivery, FrameCapture, SurfaceRole};
pub use config::{GpuOptions, NnaoConfig};
pub use diagnostics::{DiagnosticSink, RecordingSink, Severity, TracingSink};
pub use surface::{SurfaceDesc, SurfaceFormat, SurfaceHandle};

/// Name the plugin reports itself under in host diagnostics.
pub const PLUGIN_NAME: &str = "NnaoPlugin";

/// Channels in every image tensor the pipeline exchanges with the engine.
pub const TENSOR_CHANNELS: usize = 4;
