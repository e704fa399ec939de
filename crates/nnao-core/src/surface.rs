//! Opaque handles and descriptors for host-owned 2D surfaces.

use std::fmt;

/// Handle to a 2D surface owned by the host rendering system (or created by
/// the device on our behalf).
///
/// The numeric value is backend specific: a GL texture name for the GL
/// device, an arena id for the software device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceHandle(pub u64);

impl fmt::Display for SurfaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "surface#{}", self.0)
    }
}

/// Pixel formats the pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfaceFormat {
    /// Four unsigned 8-bit integer channels (normals and AO capture textures).
    Rgba8Uint,
    /// Four normalized 8-bit channels (typical host render targets).
    Rgba8Unorm,
    /// One 32-bit float channel (depth).
    R32Float,
}

impl SurfaceFormat {
    /// Bytes occupied by one pixel.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            SurfaceFormat::Rgba8Uint | SurfaceFormat::Rgba8Unorm | SurfaceFormat::R32Float => 4,
        }
    }
}

/// Size and format of a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceDesc {
    pub width: u32,
    pub height: u32,
    pub format: SurfaceFormat,
}

impl SurfaceDesc {
    pub fn new(width: u32, height: u32, format: SurfaceFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }

    /// Logical (unpadded) row size in bytes.
    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    /// Bytes of a densely packed image of this description.
    pub fn byte_len(&self) -> usize {
        self.row_bytes() * self.height as usize
    }
}
