//! The device interface every interop backend implements.

use std::fmt;
use std::rc::Rc;

use nnao_core::{SurfaceDesc, SurfaceHandle};

use crate::error::Result;
use crate::kernels::KernelLaunch;
use crate::pitched::PitchedView;

/// Address of a linear device allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(pub u64);

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ptr#{:x}", self.0)
    }
}

/// A surface registered for compute interop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceHandle(pub u64);

/// The compute-side array backing a mapped interop resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArrayHandle(pub u64);

/// How the compute side intends to use a mapped resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MapFlags {
    #[default]
    ReadWrite,
    ReadOnly,
    WriteDiscard,
}

/// Shared handle to the active device. Devices are single-threaded and used
/// from the host render thread only.
pub type SharedDevice = Rc<dyn InteropDevice>;

/// A GPU that can see the host's render surfaces and run the conversion
/// kernels.
///
/// All methods take `&self`; implementations keep their bookkeeping behind
/// interior mutability. Every method checks its own device call and reports
/// failure with the call site.
pub trait InteropDevice {
    fn name(&self) -> &str;

    // -- rendering side ----------------------------------------------------

    fn surface_desc(&self, surface: SurfaceHandle) -> Result<SurfaceDesc>;

    /// Create a device-owned texture.
    fn create_texture(&self, desc: &SurfaceDesc) -> Result<SurfaceHandle>;

    fn release_texture(&self, texture: SurfaceHandle) -> Result<()>;

    /// Full-surface copy. Both surfaces must share dimensions and texel size.
    fn copy_surface(&self, dst: SurfaceHandle, src: SurfaceHandle) -> Result<()>;

    /// Submit queued rendering-side work.
    fn flush(&self) -> Result<()>;

    // -- linear memory -----------------------------------------------------

    /// Allocate `height` rows of at least `width_bytes` each. Returns the
    /// allocation and the row pitch the device picked.
    fn alloc_pitched(&self, width_bytes: usize, height: usize) -> Result<(DevicePtr, usize)>;

    fn alloc_linear(&self, bytes: usize) -> Result<DevicePtr>;

    fn memset(&self, ptr: DevicePtr, value: u8, bytes: usize) -> Result<()>;

    fn free(&self, ptr: DevicePtr) -> Result<()>;

    fn read_linear(&self, ptr: DevicePtr, offset: usize, len: usize) -> Result<Vec<u8>>;

    fn write_linear(&self, ptr: DevicePtr, offset: usize, bytes: &[u8]) -> Result<()>;

    // -- interop -----------------------------------------------------------

    fn register_surface(&self, surface: SurfaceHandle) -> Result<ResourceHandle>;

    fn set_map_flags(&self, resource: ResourceHandle, flags: MapFlags) -> Result<()>;

    /// Map a registered resource for compute access. Orders all previously
    /// submitted GPU work before the mapping.
    fn map(&self, resource: ResourceHandle) -> Result<()>;

    /// The array behind a mapped resource.
    fn mapped_array(&self, resource: ResourceHandle) -> Result<ArrayHandle>;

    fn unmap(&self, resource: ResourceHandle) -> Result<()>;

    fn unregister(&self, resource: ResourceHandle) -> Result<()>;

    // -- transfers (blocking) ----------------------------------------------

    fn copy_array_to_pitched(
        &self,
        dst: &PitchedView,
        src: ArrayHandle,
        width_bytes: usize,
        height: usize,
    ) -> Result<()>;

    fn copy_pitched_to_array(
        &self,
        dst: ArrayHandle,
        src: &PitchedView,
        width_bytes: usize,
        height: usize,
    ) -> Result<()>;

    /// Block until all submitted device work has finished.
    fn synchronize(&self) -> Result<()>;

    /// Enqueue one conversion kernel.
    fn launch(&self, launch: &KernelLaunch) -> Result<()>;
}
