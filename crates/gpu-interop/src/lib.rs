//! GPU interop between host render surfaces and compute buffers.
//!
//! This crate defines the [`InteropDevice`] trait, the RAII wrappers built on
//! it ([`PitchedBuffer`], [`GpuBuffer`], [`InteropResource`]) and the
//! conversion [`kernels`]. Two devices implement the trait: the software
//! [`HostDevice`] and the OpenGL 4.5 compute [`GlInteropDevice`].

pub mod buffer;
pub mod device;
pub mod error;
pub mod kernels;
pub mod pitched;
pub mod resource;

pub mod gl_compute;
pub mod host;

pub use buffer::GpuBuffer;
pub use device::{ArrayHandle, DevicePtr, InteropDevice, MapFlags, ResourceHandle, SharedDevice};
pub use error::{CallSite, InteropError, Result};
pub use gl_compute::GlInteropDevice;
pub use host::{DeviceStats, HostDevice};
pub use kernels::{BlockSize, DepthRange, Grid, ImageDims, KernelLaunch, KernelOp};
pub use pitched::{PitchedBuffer, PitchedSet, PitchedView, PITCH_ALIGNMENT};
pub use resource::InteropResource;
