//! In-process graph interpreter.
//!
//! Supports `Placeholder`, `Identity`, `Scale` and every operator in an
//! [`OpRegistry`]. It exists so the pipeline can run end to end without an
//! external inference runtime.

mod session;

pub use session::ReferenceSession;

use crate::engine::{GraphEngine, GraphSession, SessionOptions};
use crate::ops::{OpRegistry, INTERACTIVE_OPS};
use crate::status::EngineStatus;

pub struct ReferenceEngine {
    ops: &'static OpRegistry,
    device_kernels: bool,
}

impl ReferenceEngine {
    pub fn new() -> Self {
        Self {
            ops: &INTERACTIVE_OPS,
            device_kernels: true,
        }
    }

    /// An engine built without device kernels. Sessions reject graphs that
    /// use device-only operators.
    pub fn cpu_only() -> Self {
        Self {
            device_kernels: false,
            ..Self::new()
        }
    }
}

impl Default for ReferenceEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphEngine for ReferenceEngine {
    fn name(&self) -> &str {
        "reference"
    }

    fn supports_device_kernels(&self) -> bool {
        self.device_kernels
    }

    fn new_session(&self, options: &SessionOptions) -> Result<Box<dyn GraphSession>, EngineStatus> {
        if !(options.memory_fraction > 0.0 && options.memory_fraction <= 1.0) {
            return Err(EngineStatus::invalid_argument(format!(
                "per_process_gpu_memory_fraction must be in (0, 1], got {}",
                options.memory_fraction
            )));
        }
        tracing::debug!(
            allow_growth = options.allow_growth,
            memory_fraction = options.memory_fraction,
            "reference session created"
        );
        Ok(Box::new(ReferenceSession::new(self.ops, self.device_kernels)))
    }
}
