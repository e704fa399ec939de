//! Pitch-aligned device buffers.
//!
//! The conversion kernels address every buffer they touch with one row
//! pitch. [`PitchedSet`] allocates the buffers a session uses together and
//! refuses to hand them out unless their pitches agree.

use std::rc::Rc;

use crate::device::{DevicePtr, InteropDevice};
use crate::error::{InteropError, Result};

/// Row alignment used by the devices in this crate.
pub const PITCH_ALIGNMENT: usize = 512;

/// Round `width_bytes` up to the device row alignment.
pub fn aligned_pitch(width_bytes: usize) -> usize {
    width_bytes.div_ceil(PITCH_ALIGNMENT).max(1) * PITCH_ALIGNMENT
}

/// Copyable description of a pitched allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PitchedView {
    pub ptr: DevicePtr,
    /// Bytes between the starts of consecutive rows.
    pub pitch: usize,
    /// Width in pixels.
    pub width: usize,
    pub height: usize,
    pub bytes_per_pixel: usize,
}

impl PitchedView {
    /// Logical row size in bytes, excluding row padding.
    pub fn row_bytes(&self) -> usize {
        self.width * self.bytes_per_pixel
    }

    /// Total allocation size.
    pub fn byte_len(&self) -> usize {
        self.pitch * self.height
    }
}

/// An owned pitched allocation. Freed on drop.
pub struct PitchedBuffer {
    device: Rc<dyn InteropDevice>,
    view: PitchedView,
}

impl PitchedBuffer {
    pub fn allocate(
        device: Rc<dyn InteropDevice>,
        width: usize,
        height: usize,
        bytes_per_pixel: usize,
    ) -> Result<Self> {
        let (ptr, pitch) = device.alloc_pitched(width * bytes_per_pixel, height)?;
        tracing::trace!(%ptr, pitch, width, height, bytes_per_pixel, "pitched allocation");
        Ok(Self {
            device,
            view: PitchedView {
                ptr,
                pitch,
                width,
                height,
                bytes_per_pixel,
            },
        })
    }

    pub fn view(&self) -> PitchedView {
        self.view
    }

    pub fn pitch(&self) -> usize {
        self.view.pitch
    }

    /// Fill the whole allocation, padding included, with zero bytes.
    pub fn zero(&self) -> Result<()> {
        self.device.memset(self.view.ptr, 0, self.view.byte_len())
    }
}

impl Drop for PitchedBuffer {
    fn drop(&mut self) {
        if let Err(err) = self.device.free(self.view.ptr) {
            tracing::error!(ptr = %self.view.ptr, %err, "failed to free pitched buffer");
        }
    }
}

impl std::fmt::Debug for PitchedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PitchedBuffer")
            .field("device", &self.device.name())
            .field("view", &self.view)
            .finish()
    }
}

/// The three buffers of one session: packed input (4 x u8 per pixel),
/// depth (one f32 per pixel) and output (4 bytes per pixel).
#[derive(Debug)]
pub struct PitchedSet {
    pub input: PitchedBuffer,
    pub depth: PitchedBuffer,
    pub output: PitchedBuffer,
}

impl PitchedSet {
    /// Allocate all three buffers, then reconcile their pitches.
    ///
    /// On mismatch every buffer is released before the error is returned.
    pub fn allocate(device: &Rc<dyn InteropDevice>, width: usize, height: usize) -> Result<Self> {
        let input = PitchedBuffer::allocate(device.clone(), width, height, 4)?;
        let depth = PitchedBuffer::allocate(device.clone(), width, height, 4)?;
        let output = PitchedBuffer::allocate(device.clone(), width, height, 4)?;

        let expected = input.pitch();
        for (buffer, actual) in [("depth", depth.pitch()), ("output", output.pitch())] {
            if actual != expected {
                tracing::error!(buffer, expected, actual, "pitched buffer layouts disagree");
                return Err(InteropError::LayoutMismatch {
                    buffer,
                    expected,
                    actual,
                });
            }
        }

        tracing::debug!(width, height, pitch = expected, "allocated pitched buffers");
        Ok(Self {
            input,
            depth,
            output,
        })
    }

    /// The pitch every buffer in the set shares.
    pub fn pitch(&self) -> usize {
        self.input.pitch()
    }

    pub fn zero(&self) -> Result<()> {
        self.input.zero()?;
        self.depth.zero()?;
        self.output.zero()
    }
}
