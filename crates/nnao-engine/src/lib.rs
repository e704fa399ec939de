//! Boundary to the graph inference engine.
//!
//! A session loads a [`GraphDef`] and runs it with a placeholder input. The
//! graph reaches the captured pixels through the interactive operators in
//! [`ops`], which read the buffers carried by an [`OpContext`].

pub mod context;
pub mod engine;
pub mod graph;
pub mod ops;
pub mod reference;
pub mod status;
pub mod tensor;

pub use context::OpContext;
pub use engine::{GraphEngine, GraphSession, SessionOptions};
pub use graph::{GraphDef, GraphEncoding, NodeDef};
pub use ops::{OpDef, OpKernel, OpRegistry, INTERACTIVE_OPS};
pub use reference::{ReferenceEngine, ReferenceSession};
pub use status::{EngineStatus, StatusCode};
pub use tensor::Tensor;
