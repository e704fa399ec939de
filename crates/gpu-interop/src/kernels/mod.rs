//! Conversion kernels between captured pixel layouts and the engine's
//! tensor layout.
//!
//! Tensors are dense little-endian f32 with four channels; element
//! `(x, y, c)` lives at float index `((y * width) + x) * 4 + c`. Pitched
//! images are addressed as row `y` at byte `y * pitch`.
//!
//! [`cpu`] holds a rayon implementation used by the software device and as
//! the reference the compute shaders in [`shaders`] are checked against.

pub mod cpu;
pub mod shaders;

use crate::device::DevicePtr;
use crate::error::{InteropError, Result};
use crate::pitched::PitchedView;

/// Rescale bounds for depth kernels. Construction guarantees
/// `min < max` with both finite.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthRange {
    min: f32,
    max: f32,
}

impl DepthRange {
    pub fn new(min: f32, max: f32) -> Result<Self> {
        if !min.is_finite() || !max.is_finite() || max <= min {
            return Err(InteropError::InvalidDepthRange { min, max });
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> f32 {
        self.min
    }

    pub fn max(&self) -> f32 {
        self.max
    }

    pub fn span(&self) -> f32 {
        self.max - self.min
    }

    /// Depth to `[0, 1]` (for depths inside the range).
    pub fn normalize(&self, depth: f32) -> f32 {
        (depth - self.min) / self.span()
    }

    pub fn denormalize(&self, value: f32) -> f32 {
        value * self.span() + self.min
    }
}

impl Default for DepthRange {
    fn default() -> Self {
        Self { min: 0.0, max: 1.0 }
    }
}

/// Logical image size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDims {
    pub width: usize,
    pub height: usize,
}

impl ImageDims {
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    pub fn pixels(&self) -> usize {
        self.width * self.height
    }

    /// Floats in a four-channel tensor of this size.
    pub fn tensor_len(&self) -> usize {
        self.pixels() * nnao_core::TENSOR_CHANNELS
    }
}

/// Threads per block along each axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSize {
    pub x: usize,
    pub y: usize,
}

impl Default for BlockSize {
    fn default() -> Self {
        Self { x: 16, y: 16 }
    }
}

impl BlockSize {
    pub fn new(x: usize, y: usize) -> Result<Self> {
        if x == 0 || y == 0 {
            return Err(InteropError::call(
                "BlockSize::new",
                format!("block {x}x{y} has a zero dimension"),
            ));
        }
        Ok(Self { x, y })
    }
}

/// The task grid of one launch: whole blocks covering the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grid {
    pub blocks_x: usize,
    pub blocks_y: usize,
    pub block: BlockSize,
}

impl Grid {
    pub fn covering(dims: ImageDims, block: BlockSize) -> Self {
        Self {
            blocks_x: dims.width.div_ceil(block.x),
            blocks_y: dims.height.div_ceil(block.y),
            block,
        }
    }

    /// Tasks along x, including the ones past the image edge.
    pub fn width(&self) -> usize {
        self.blocks_x * self.block.x
    }

    pub fn height(&self) -> usize {
        self.blocks_y * self.block.y
    }
}

/// One conversion kernel with its buffers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelOp {
    /// 3 normal bytes and one depth float into one tensor.
    PackNormalsDepth {
        normals: PitchedView,
        depth: PitchedView,
        out: DevicePtr,
        range: DepthRange,
    },
    /// 4 bytes to 4 floats, each divided by 255.
    NormalsToTensor { normals: PitchedView, out: DevicePtr },
    /// Rescaled depth broadcast into all four channels.
    DepthToTensor {
        depth: PitchedView,
        out: DevicePtr,
        range: DepthRange,
    },
    /// Channel 0 copied verbatim into a pitched float image.
    TensorToScalar { tensor: DevicePtr, out: PitchedView },
    /// Channel 1 with the inverse depth rescale.
    TensorToDepth {
        tensor: DevicePtr,
        out: PitchedView,
        range: DepthRange,
    },
}

impl KernelOp {
    pub fn name(&self) -> &'static str {
        match self {
            KernelOp::PackNormalsDepth { .. } => "pack_normals_depth",
            KernelOp::NormalsToTensor { .. } => "normals_to_tensor",
            KernelOp::DepthToTensor { .. } => "depth_to_tensor",
            KernelOp::TensorToScalar { .. } => "tensor_to_scalar",
            KernelOp::TensorToDepth { .. } => "tensor_to_depth",
        }
    }

    /// The row pitch the kernel indexes every pitched buffer with.
    pub fn pitch(&self) -> usize {
        match self {
            KernelOp::PackNormalsDepth { normals, .. } | KernelOp::NormalsToTensor { normals, .. } => {
                normals.pitch
            }
            KernelOp::DepthToTensor { depth, .. } => depth.pitch,
            KernelOp::TensorToScalar { out, .. } | KernelOp::TensorToDepth { out, .. } => out.pitch,
        }
    }

    pub fn range(&self) -> Option<DepthRange> {
        match self {
            KernelOp::PackNormalsDepth { range, .. }
            | KernelOp::DepthToTensor { range, .. }
            | KernelOp::TensorToDepth { range, .. } => Some(*range),
            KernelOp::NormalsToTensor { .. } | KernelOp::TensorToScalar { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelLaunch {
    pub op: KernelOp,
    pub dims: ImageDims,
    pub block: BlockSize,
}

impl KernelLaunch {
    pub fn new(op: KernelOp, dims: ImageDims, block: BlockSize) -> Self {
        Self { op, dims, block }
    }

    pub fn grid(&self) -> Grid {
        Grid::covering(self.dims, self.block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapsed_or_inverted_range_is_rejected() {
        assert!(DepthRange::new(1.0, 1.0).is_err());
        assert!(DepthRange::new(2.0, 1.0).is_err());
        assert!(DepthRange::new(0.0, f32::INFINITY).is_err());
        assert!(DepthRange::new(f32::NAN, 1.0).is_err());
        assert!(DepthRange::new(-1.0, 1.0).is_ok());
    }

    #[test]
    fn grid_rounds_up_to_whole_blocks() {
        let grid = Grid::covering(ImageDims::new(17, 4), BlockSize::default());
        assert_eq!((grid.blocks_x, grid.blocks_y), (2, 1));
        assert_eq!((grid.width(), grid.height()), (32, 16));

        let exact = Grid::covering(ImageDims::new(32, 16), BlockSize::default());
        assert_eq!((exact.blocks_x, exact.blocks_y), (2, 1));
    }
}
