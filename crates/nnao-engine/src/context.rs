//! Per-run state handed to the interactive operators.
//!
//! The operators do not take their pixels from graph edges. They read the
//! session's pitched buffers directly, and the session passes those buffers
//! in here with every `run` call.

use gpu_interop::{BlockSize, DepthRange, ImageDims, PitchedView, SharedDevice};

use crate::status::EngineStatus;
use crate::tensor::{image_shape, Tensor};

#[derive(Clone)]
pub struct OpContext {
    device: SharedDevice,
    /// Packed normals from the capture.
    pub input: PitchedView,
    pub depth: PitchedView,
    /// Where output operators write the inferred image.
    pub output: PitchedView,
    pub dims: ImageDims,
    /// Used by depth operators whose node has no range attributes.
    pub depth_range: DepthRange,
    pub block: BlockSize,
}

impl OpContext {
    pub fn new(
        device: SharedDevice,
        input: PitchedView,
        depth: PitchedView,
        output: PitchedView,
        dims: ImageDims,
    ) -> Self {
        Self {
            device,
            input,
            depth,
            output,
            dims,
            depth_range: DepthRange::default(),
            block: BlockSize::default(),
        }
    }

    pub fn with_depth_range(mut self, range: DepthRange) -> Self {
        self.depth_range = range;
        self
    }

    pub fn with_block(mut self, block: BlockSize) -> Self {
        self.block = block;
        self
    }

    pub fn device(&self) -> &SharedDevice {
        &self.device
    }

    /// Row pitch shared by all three buffers.
    pub fn pitch(&self) -> usize {
        self.input.pitch
    }

    pub fn image_shape(&self) -> [usize; 4] {
        image_shape(self.dims.width, self.dims.height)
    }

    /// Operators accept exactly the session's image tensor shape.
    pub fn check_shape(&self, op: &str, tensor: &Tensor) -> Result<(), EngineStatus> {
        let expected = self.image_shape();
        if tensor.shape() != expected {
            return Err(EngineStatus::invalid_argument(format!(
                "{op}: input must have shape {expected:?}, got {:?}",
                tensor.shape()
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for OpContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpContext")
            .field("device", &self.device.name())
            .field("input", &self.input)
            .field("depth", &self.depth)
            .field("output", &self.output)
            .field("dims", &self.dims)
            .field("depth_range", &self.depth_range)
            .finish()
    }
}
