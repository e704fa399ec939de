//! OpenGL compute backend.
//!
//! Runs in the host's own GL context: host render targets are textures the
//! device can copy and transfer directly, so registration only has to track
//! which textures are in use.

mod device;
mod program;

pub use device::GlInteropDevice;
