//! The interactive operators a loaded graph uses to reach the capture.
//!
//! Input operators ignore the values of their declared input: it only fixes
//! the shape. They convert the session's pitched buffers into a fresh
//! tensor. Output operators pass their input through unchanged and, as a
//! side effect, write it into the session's output buffer.

use std::collections::BTreeMap;

use gpu_interop::{DepthRange, GpuBuffer, KernelLaunch, KernelOp};
use once_cell::sync::Lazy;

use crate::context::OpContext;
use crate::graph::NodeDef;
use crate::status::EngineStatus;
use crate::tensor::Tensor;

/// Signature of a registered operator. All of them take one float tensor
/// and return one float tensor of the same shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpDef {
    pub name: &'static str,
    pub input: &'static str,
    pub output: &'static str,
    /// Only a device kernel exists for this operator.
    pub device_only: bool,
}

pub trait OpKernel: Send + Sync {
    fn def(&self) -> &OpDef;

    fn compute(&self, node: &NodeDef, input: &Tensor, ctx: &OpContext) -> Result<Tensor, EngineStatus>;
}

#[derive(Default)]
pub struct OpRegistry {
    ops: BTreeMap<&'static str, Box<dyn OpKernel>>,
}

impl OpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kernel: Box<dyn OpKernel>) -> Result<(), EngineStatus> {
        let name = kernel.def().name;
        if self.ops.contains_key(name) {
            return Err(EngineStatus::already_exists(format!(
                "Op with name {name} already registered"
            )));
        }
        self.ops.insert(name, kernel);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&dyn OpKernel> {
        self.ops.get(name).map(|k| k.as_ref())
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.ops.keys().copied()
    }
}

impl std::fmt::Debug for OpRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.ops.keys()).finish()
    }
}

pub static INTERACTIVE_OPS: Lazy<OpRegistry> = Lazy::new(|| {
    let kernels: [Box<dyn OpKernel>; 5] = [
        Box::new(InteractiveNormalsInput),
        Box::new(InteractiveDepthInput),
        Box::new(InteractiveOutput),
        Box::new(InteractiveInput),
        Box::new(InteractiveDepthOutput),
    ];
    let mut registry = OpRegistry::new();
    for kernel in kernels {
        let name = kernel.def().name;
        if let Err(status) = registry.register(kernel) {
            tracing::error!(op = name, %status, "operator registration failed");
        }
    }
    registry
});

/// Rescale range for a depth operator: node attributes, falling back to the
/// context default.
fn node_range(node: &NodeDef, ctx: &OpContext) -> Result<DepthRange, EngineStatus> {
    let attr = |key: &str, default: f32| node.attrs.get(key).copied().unwrap_or(default);
    let min = attr("depth_min", ctx.depth_range.min());
    let max = attr("depth_max", ctx.depth_range.max());
    DepthRange::new(min, max).map_err(|err| {
        EngineStatus::invalid_argument(format!("{} ({}): {err}", node.name, node.op))
    })
}

/// Run one capture-to-tensor kernel into scratch memory and download it.
fn convert_to_tensor(
    ctx: &OpContext,
    op: impl FnOnce(gpu_interop::DevicePtr) -> KernelOp,
) -> Result<Tensor, EngineStatus> {
    let scratch = GpuBuffer::allocate(ctx.device().clone(), ctx.dims.tensor_len() * 4)?;
    let launch = KernelLaunch::new(op(scratch.ptr()), ctx.dims, ctx.block);
    ctx.device().launch(&launch)?;
    ctx.device().synchronize()?;
    Tensor::from_data(&ctx.image_shape(), scratch.read_f32()?)
}

/// Upload `tensor` and run one tensor-to-output kernel.
fn convert_from_tensor(
    ctx: &OpContext,
    tensor: &Tensor,
    op: impl FnOnce(gpu_interop::DevicePtr) -> KernelOp,
) -> Result<(), EngineStatus> {
    let staged = GpuBuffer::from_f32(ctx.device().clone(), tensor.data())?;
    let launch = KernelLaunch::new(op(staged.ptr()), ctx.dims, ctx.block);
    ctx.device().launch(&launch)?;
    ctx.device().synchronize()?;
    Ok(())
}

macro_rules! op_def {
    ($name:literal, $input:literal, $output:literal) => {
        OpDef {
            name: $name,
            input: $input,
            output: $output,
            device_only: true,
        }
    };
}

const NORMALS_INPUT: OpDef = op_def!("InteractiveNormalsInput", "interactive_input", "from_interactive");
const DEPTH_INPUT: OpDef = op_def!("InteractiveDepthInput", "interactive_input", "from_interactive");
const PACKED_INPUT: OpDef = op_def!("InteractiveInput", "interactive_input", "from_interactive");
const OUTPUT: OpDef = op_def!("InteractiveOutput", "to_interactive", "interactive_output");
const DEPTH_OUTPUT: OpDef = op_def!("InteractiveDepthOutput", "to_interactive", "interactive_output");

pub struct InteractiveNormalsInput;

impl OpKernel for InteractiveNormalsInput {
    fn def(&self) -> &OpDef {
        &NORMALS_INPUT
    }

    fn compute(&self, _node: &NodeDef, input: &Tensor, ctx: &OpContext) -> Result<Tensor, EngineStatus> {
        ctx.check_shape(NORMALS_INPUT.name, input)?;
        convert_to_tensor(ctx, |out| KernelOp::NormalsToTensor {
            normals: ctx.input,
            out,
        })
    }
}

pub struct InteractiveDepthInput;

impl OpKernel for InteractiveDepthInput {
    fn def(&self) -> &OpDef {
        &DEPTH_INPUT
    }

    fn compute(&self, node: &NodeDef, input: &Tensor, ctx: &OpContext) -> Result<Tensor, EngineStatus> {
        ctx.check_shape(DEPTH_INPUT.name, input)?;
        let range = node_range(node, ctx)?;
        convert_to_tensor(ctx, |out| KernelOp::DepthToTensor {
            depth: ctx.depth,
            out,
            range,
        })
    }
}

/// Normals and depth packed into one tensor.
pub struct InteractiveInput;

impl OpKernel for InteractiveInput {
    fn def(&self) -> &OpDef {
        &PACKED_INPUT
    }

    fn compute(&self, node: &NodeDef, input: &Tensor, ctx: &OpContext) -> Result<Tensor, EngineStatus> {
        ctx.check_shape(PACKED_INPUT.name, input)?;
        let range = node_range(node, ctx)?;
        convert_to_tensor(ctx, |out| KernelOp::PackNormalsDepth {
            normals: ctx.input,
            depth: ctx.depth,
            out,
            range,
        })
    }
}

pub struct InteractiveOutput;

impl OpKernel for InteractiveOutput {
    fn def(&self) -> &OpDef {
        &OUTPUT
    }

    fn compute(&self, _node: &NodeDef, input: &Tensor, ctx: &OpContext) -> Result<Tensor, EngineStatus> {
        ctx.check_shape(OUTPUT.name, input)?;
        convert_from_tensor(ctx, input, |tensor| KernelOp::TensorToScalar {
            tensor,
            out: ctx.output,
        })?;
        Ok(input.clone())
    }
}

pub struct InteractiveDepthOutput;

impl OpKernel for InteractiveDepthOutput {
    fn def(&self) -> &OpDef {
        &DEPTH_OUTPUT
    }

    fn compute(&self, node: &NodeDef, input: &Tensor, ctx: &OpContext) -> Result<Tensor, EngineStatus> {
        ctx.check_shape(DEPTH_OUTPUT.name, input)?;
        let range = node_range(node, ctx)?;
        convert_from_tensor(ctx, input, |tensor| KernelOp::TensorToDepth {
            tensor,
            out: ctx.output,
            range,
        })?;
        Ok(input.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use approx::assert_relative_eq;
    use gpu_interop::{HostDevice, ImageDims, InteropDevice, PitchedSet};

    use super::*;
    use crate::StatusCode;

    struct Fixture {
        host: Rc<HostDevice>,
        set: PitchedSet,
        ctx: OpContext,
    }

    fn fixture(width: usize, height: usize) -> Fixture {
        let host = Rc::new(HostDevice::new());
        let device: Rc<dyn InteropDevice> = host.clone();
        let set = PitchedSet::allocate(&device, width, height).unwrap();
        set.zero().unwrap();
        let ctx = OpContext::new(
            device,
            set.input.view(),
            set.depth.view(),
            set.output.view(),
            ImageDims::new(width, height),
        );
        Fixture { host, set, ctx }
    }

    fn write_depth(f: &Fixture, values: &[f32]) {
        let view = f.set.depth.view();
        for (y, row) in values.chunks(view.width).enumerate() {
            let bytes: Vec<u8> = row.iter().flat_map(|v| v.to_le_bytes()).collect();
            f.host.write_linear(view.ptr, y * view.pitch, &bytes).unwrap();
        }
    }

    #[test]
    fn registry_holds_every_interactive_op() {
        let names: Vec<_> = INTERACTIVE_OPS.names().collect();
        assert_eq!(
            names,
            [
                "InteractiveDepthInput",
                "InteractiveDepthOutput",
                "InteractiveInput",
                "InteractiveNormalsInput",
                "InteractiveOutput",
            ]
        );
        assert!(INTERACTIVE_OPS.get("InteractiveOutput").unwrap().def().device_only);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = OpRegistry::new();
        registry.register(Box::new(InteractiveOutput)).unwrap();
        let err = registry.register(Box::new(InteractiveOutput)).unwrap_err();
        assert_eq!(err.code, StatusCode::AlreadyExists);
    }

    #[test]
    fn normals_input_reads_the_side_channel_not_the_tensor() {
        let f = fixture(2, 1);
        f.host
            .write_linear(f.set.input.view().ptr, 0, &[255, 0, 51, 102, 0, 255, 0, 0])
            .unwrap();

        let mut declared = Tensor::image(2, 1);
        declared.data_mut().fill(9.0);
        let node = NodeDef::new("normals", "InteractiveNormalsInput");
        let out = InteractiveNormalsInput.compute(&node, &declared, &f.ctx).unwrap();

        assert_eq!(out.shape(), &[1, 2, 1, 4]);
        assert_relative_eq!(out.data()[0], 1.0);
        assert_relative_eq!(out.data()[2], 0.2);
        assert_relative_eq!(out.data()[3], 0.4);
        assert_relative_eq!(out.data()[5], 1.0);
        assert_eq!(f.host.live_allocations(), 3);
    }

    #[test]
    fn depth_attrs_override_context_range() {
        let f = fixture(2, 2);
        write_depth(&f, &[2.0, 4.0, 6.0, 3.0]);
        let node = NodeDef::new("depth", "InteractiveDepthInput")
            .attr("depth_min", 2.0)
            .attr("depth_max", 6.0);
        let out = InteractiveDepthInput
            .compute(&node, &Tensor::image(2, 2), &f.ctx)
            .unwrap();
        assert_eq!(&out.data()[..4], &[0.0; 4]);
        assert_relative_eq!(out.data()[4], 0.5);
        assert_relative_eq!(out.data()[8], 1.0);
        assert_relative_eq!(out.data()[15], 0.25);
    }

    #[test]
    fn collapsed_node_range_is_invalid_argument() {
        let f = fixture(1, 1);
        let node = NodeDef::new("depth", "InteractiveDepthInput")
            .attr("depth_min", 1.0)
            .attr("depth_max", 1.0);
        let err = InteractiveDepthInput
            .compute(&node, &Tensor::image(1, 1), &f.ctx)
            .unwrap_err();
        assert_eq!(err.code, StatusCode::InvalidArgument);
        assert!(err.message.starts_with("depth (InteractiveDepthInput)"));
    }

    #[test]
    fn wrong_shape_is_rejected_before_any_launch() {
        let f = fixture(4, 4);
        let err = InteractiveNormalsInput
            .compute(&NodeDef::new("n", "InteractiveNormalsInput"), &Tensor::image(4, 3), &f.ctx)
            .unwrap_err();
        assert_eq!(err.code, StatusCode::InvalidArgument);
        assert_eq!(f.host.stats().launches, 0);
    }

    #[test]
    fn output_writes_channel_zero_and_passes_through() {
        let f = fixture(2, 1);
        let input = Tensor::from_data(
            &[1, 2, 1, 4],
            vec![0.25, 9.0, 9.0, 9.0, 0.75, 9.0, 9.0, 9.0],
        )
        .unwrap();
        let out = InteractiveOutput
            .compute(&NodeDef::new("ao", "InteractiveOutput"), &input, &f.ctx)
            .unwrap();
        assert_eq!(out, input);

        let bytes = f.host.read_linear(f.set.output.view().ptr, 0, 8).unwrap();
        assert_eq!(&bytes[0..4], &0.25f32.to_le_bytes());
        assert_eq!(&bytes[4..8], &0.75f32.to_le_bytes());
        assert_eq!(f.host.live_allocations(), 3);
    }

    #[test]
    fn depth_output_inverts_the_rescale_from_channel_one() {
        let f = fixture(1, 1);
        let input = Tensor::from_data(&[1, 1, 1, 4], vec![0.0, 0.5, 0.0, 0.0]).unwrap();
        let node = NodeDef::new("d", "InteractiveDepthOutput")
            .attr("depth_min", 1.0)
            .attr("depth_max", 3.0);
        InteractiveDepthOutput.compute(&node, &input, &f.ctx).unwrap();
        let bytes = f.host.read_linear(f.set.output.view().ptr, 0, 4).unwrap();
        assert_relative_eq!(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]), 2.0);
    }
}
