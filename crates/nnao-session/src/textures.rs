//! Device-owned capture textures.
//!
//! Host render targets are not registered directly. Each step copies them
//! into textures of a fixed format that the session created and owns, and
//! only those are registered for interop.

use gpu_interop::{InteropError, SharedDevice};
use nnao_core::{SurfaceDesc, SurfaceFormat, SurfaceHandle};

struct OwnedTexture {
    device: SharedDevice,
    handle: Option<SurfaceHandle>,
}

impl OwnedTexture {
    fn create(device: &SharedDevice, desc: SurfaceDesc) -> gpu_interop::Result<Self> {
        let handle = device.create_texture(&desc)?;
        Ok(Self {
            device: device.clone(),
            handle: Some(handle),
        })
    }

    fn handle(&self) -> SurfaceHandle {
        self.handle.unwrap_or(SurfaceHandle(0))
    }

    fn release(&mut self) -> gpu_interop::Result<()> {
        match self.handle.take() {
            Some(handle) => self.device.release_texture(handle),
            None => Ok(()),
        }
    }
}

impl Drop for OwnedTexture {
    fn drop(&mut self) {
        if let Some(handle) = self.handle {
            if let Err(err) = self.release() {
                tracing::error!(texture = %handle, %err, "failed to release capture texture");
            }
        }
    }
}

/// Normals, depth and AO textures at the capture size.
pub struct CaptureTextures {
    normals: OwnedTexture,
    depth: OwnedTexture,
    ao: OwnedTexture,
}

impl CaptureTextures {
    pub fn create(device: &SharedDevice, width: u32, height: u32) -> gpu_interop::Result<Self> {
        let normals = OwnedTexture::create(
            device,
            SurfaceDesc::new(width, height, SurfaceFormat::Rgba8Uint),
        )?;
        let depth = OwnedTexture::create(
            device,
            SurfaceDesc::new(width, height, SurfaceFormat::R32Float),
        )?;
        let ao = OwnedTexture::create(
            device,
            SurfaceDesc::new(width, height, SurfaceFormat::Rgba8Uint),
        )?;
        tracing::debug!(width, height, "capture textures created");
        Ok(Self {
            normals,
            depth,
            ao,
        })
    }

    pub fn normals(&self) -> SurfaceHandle {
        self.normals.handle()
    }

    pub fn depth(&self) -> SurfaceHandle {
        self.depth.handle()
    }

    pub fn ao(&self) -> SurfaceHandle {
        self.ao.handle()
    }

    /// Release all three textures, reporting the first failure.
    pub fn release(mut self) -> gpu_interop::Result<()> {
        let results = [
            self.normals.release(),
            self.depth.release(),
            self.ao.release(),
        ];
        results
            .into_iter()
            .collect::<Result<Vec<()>, InteropError>>()
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use gpu_interop::HostDevice;

    use super::*;

    #[test]
    fn textures_use_capture_formats_and_release_once() {
        let host = Rc::new(HostDevice::new());
        let device: SharedDevice = host.clone();
        let textures = CaptureTextures::create(&device, 8, 2).unwrap();
        assert_eq!(host.live_textures(), 3);
        assert_eq!(
            device.surface_desc(textures.depth()).unwrap().format,
            SurfaceFormat::R32Float
        );
        assert_eq!(
            device.surface_desc(textures.ao()).unwrap().format,
            SurfaceFormat::Rgba8Uint
        );

        textures.release().unwrap();
        assert_eq!(host.live_textures(), 0);
        assert_eq!(host.stats().textures_released, 3);
    }

    #[test]
    fn partial_creation_is_rolled_back() {
        let host = Rc::new(HostDevice::new());
        let device: SharedDevice = host.clone();
        host.fail_call("create_texture", 2);
        assert!(CaptureTextures::create(&device, 4, 4).is_err());
        assert_eq!(host.live_textures(), 0);
    }
}
