//! Linear device buffers for tensor data exchanged with the engine.

use std::rc::Rc;

use crate::device::{DevicePtr, InteropDevice};
use crate::error::{InteropError, Result};

/// A linear device allocation. Freed on drop.
pub struct GpuBuffer {
    device: Rc<dyn InteropDevice>,
    ptr: DevicePtr,
    /// Total size in bytes.
    size: usize,
}

impl GpuBuffer {
    pub fn allocate(device: Rc<dyn InteropDevice>, size: usize) -> Result<Self> {
        let ptr = device.alloc_linear(size)?;
        Ok(Self { device, ptr, size })
    }

    /// Allocate a buffer and upload `values` as little-endian f32.
    pub fn from_f32(device: Rc<dyn InteropDevice>, values: &[f32]) -> Result<Self> {
        let buffer = Self::allocate(device, values.len() * 4)?;
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        buffer.device.write_linear(buffer.ptr, 0, &bytes)?;
        Ok(buffer)
    }

    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Download the whole buffer as little-endian f32.
    pub fn read_f32(&self) -> Result<Vec<f32>> {
        if self.size % 4 != 0 {
            return Err(InteropError::call(
                "read_f32",
                format!("buffer of {} bytes is not a whole number of floats", self.size),
            ));
        }
        let bytes = self.device.read_linear(self.ptr, 0, self.size)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        if let Err(err) = self.device.free(self.ptr) {
            tracing::error!(ptr = %self.ptr, %err, "failed to free device buffer");
        }
    }
}
