//! The graph-execution service seen from the session side.

use nnao_core::GpuOptions;

use crate::context::OpContext;
use crate::graph::GraphDef;
use crate::status::EngineStatus;
use crate::tensor::Tensor;

/// Options a new engine session is created with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionOptions {
    /// Grow device memory on demand instead of reserving it up front.
    pub allow_growth: bool,
    /// Upper bound on the share of device memory the session may use.
    pub memory_fraction: f64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&GpuOptions::default())
    }
}

impl From<&GpuOptions> for SessionOptions {
    fn from(gpu: &GpuOptions) -> Self {
        Self {
            allow_growth: gpu.allow_growth,
            memory_fraction: gpu.memory_fraction,
        }
    }
}

pub trait GraphEngine {
    fn name(&self) -> &str;

    /// Whether the interactive operators' device kernels are available.
    fn supports_device_kernels(&self) -> bool;

    fn new_session(&self, options: &SessionOptions) -> Result<Box<dyn GraphSession>, EngineStatus>;
}

pub trait GraphSession: std::fmt::Debug {
    /// Load `graph` into the session. A session holds one graph.
    fn create(&mut self, graph: &GraphDef) -> Result<(), EngineStatus>;

    /// Evaluate `fetches`, with `feeds` bound to the named nodes.
    fn run(
        &mut self,
        feeds: &[(&str, &Tensor)],
        fetches: &[&str],
        ctx: &OpContext,
    ) -> Result<Vec<Tensor>, EngineStatus>;

    fn close(&mut self) -> Result<(), EngineStatus> {
        Ok(())
    }
}
