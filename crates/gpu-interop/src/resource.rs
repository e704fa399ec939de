//! Scoped interop registration of a host surface.

use std::rc::Rc;

use nnao_core::SurfaceHandle;

use crate::device::{ArrayHandle, InteropDevice, MapFlags, ResourceHandle};
use crate::error::Result;

/// A host surface registered and mapped for compute access.
///
/// The mapping lasts as long as the value. Dropping it (or calling
/// [`release`](Self::release)) unmaps and then unregisters, once, on every
/// path out of the owner.
pub struct InteropResource {
    device: Rc<dyn InteropDevice>,
    surface: SurfaceHandle,
    handle: Option<ResourceHandle>,
    mapped: bool,
    array: ArrayHandle,
}

impl InteropResource {
    /// Register, map and fetch the array of `surface`.
    ///
    /// A failure part way through undoes the steps that succeeded.
    pub fn acquire(device: Rc<dyn InteropDevice>, surface: SurfaceHandle) -> Result<Self> {
        let handle = device.register_surface(surface)?;
        let mut resource = Self {
            device,
            surface,
            handle: Some(handle),
            mapped: false,
            array: ArrayHandle(0),
        };
        resource.device.set_map_flags(handle, MapFlags::ReadWrite)?;
        resource.device.map(handle)?;
        resource.mapped = true;
        resource.array = resource.device.mapped_array(handle)?;
        tracing::trace!(surface = %surface, ?handle, "interop resource mapped");
        Ok(resource)
    }

    pub fn surface(&self) -> SurfaceHandle {
        self.surface
    }

    /// The mapped array; valid for the lifetime of `self`.
    pub fn array(&self) -> ArrayHandle {
        self.array
    }

    /// Unmap and unregister, reporting the first failure. Both steps are
    /// attempted even if the first fails.
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let unmapped = if std::mem::take(&mut self.mapped) {
            self.device.unmap(handle)
        } else {
            Ok(())
        };
        let unregistered = self.device.unregister(handle);
        tracing::trace!(surface = %self.surface, ?handle, "interop resource released");
        unmapped.and(unregistered)
    }
}

impl Drop for InteropResource {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            tracing::error!(surface = %self.surface, %err, "failed to release interop resource");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostDevice;
    use nnao_core::{SurfaceDesc, SurfaceFormat};

    fn host_with_surface() -> (Rc<HostDevice>, SurfaceHandle) {
        let host = Rc::new(HostDevice::new());
        let surface = host.create_surface(
            SurfaceDesc::new(2, 2, SurfaceFormat::Rgba8Uint),
            vec![0; 16],
        );
        (host, surface)
    }

    #[test]
    fn drop_unmaps_and_unregisters() {
        let (host, surface) = host_with_surface();
        let resource = InteropResource::acquire(host.clone(), surface).unwrap();
        assert_eq!(host.mapped_resources(), 1);
        drop(resource);
        assert_eq!(host.mapped_resources(), 0);
        assert_eq!(host.live_registrations(), 0);
        assert_eq!(host.stats().unmaps, 1);
    }

    #[test]
    fn failed_map_still_unregisters() {
        let (host, surface) = host_with_surface();
        host.fail_call("map", 0);
        assert!(InteropResource::acquire(host.clone(), surface).is_err());
        assert_eq!(host.live_registrations(), 0);
        assert_eq!(host.stats().unmaps, 0);
    }

    #[test]
    fn surface_bound_elsewhere_is_refused() {
        let (host, surface) = host_with_surface();
        host.set_bound_elsewhere(surface, true);
        let err = InteropResource::acquire(host.clone(), surface).err();
        assert!(matches!(
            err,
            Some(crate::InteropError::RegistrationFailed { .. })
        ));
        assert_eq!(host.live_registrations(), 0);
    }

    #[test]
    fn explicit_release_happens_once() {
        let (host, surface) = host_with_surface();
        let resource = InteropResource::acquire(host.clone(), surface).unwrap();
        resource.release().unwrap();
        assert_eq!(host.stats().unmaps, 1);
        assert_eq!(host.stats().unregisters, 1);
    }
}
