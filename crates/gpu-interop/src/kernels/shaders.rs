//! Compute shader sources for the conversion kernels.
//!
//! The WGSL files under `shaders/` are the source of truth; `build.rs`
//! transpiles each to GLSL 4.50. Every kernel binds its parameters as a
//! uniform block at binding 0 and its buffers as storage blocks from binding
//! 1 on, in the order [`storage_bindings`] returns.

use super::{BlockSize, KernelLaunch, KernelOp};
use crate::device::DevicePtr;

/// Workgroup size compiled into every kernel.
pub const WORKGROUP_SIZE: BlockSize = BlockSize { x: 16, y: 16 };

/// Size of the uniform parameter block.
pub const PARAMS_SIZE: usize = 32;

#[derive(Debug, Clone, Copy)]
pub struct KernelShader {
    pub entry_point: &'static str,
    pub wgsl: &'static str,
    pub glsl: &'static str,
}

macro_rules! kernel_shader {
    ($name:literal) => {
        KernelShader {
            entry_point: $name,
            wgsl: include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/shaders/", $name, ".wgsl")),
            glsl: include_str!(concat!(env!("OUT_DIR"), "/", $name, ".glsl")),
        }
    };
}

pub const KERNEL_SHADERS: [KernelShader; 5] = [
    kernel_shader!("pack_normals_depth"),
    kernel_shader!("normals_to_tensor"),
    kernel_shader!("depth_to_tensor"),
    kernel_shader!("tensor_to_scalar"),
    kernel_shader!("tensor_to_depth"),
];

pub fn shader_for(op: &KernelOp) -> &'static KernelShader {
    let index = match op {
        KernelOp::PackNormalsDepth { .. } => 0,
        KernelOp::NormalsToTensor { .. } => 1,
        KernelOp::DepthToTensor { .. } => 2,
        KernelOp::TensorToScalar { .. } => 3,
        KernelOp::TensorToDepth { .. } => 4,
    };
    &KERNEL_SHADERS[index]
}

/// Buffers bound as storage blocks, starting at binding 1.
pub fn storage_bindings(op: &KernelOp) -> Vec<DevicePtr> {
    match *op {
        KernelOp::PackNormalsDepth {
            normals, depth, out, ..
        } => vec![normals.ptr, depth.ptr, out],
        KernelOp::NormalsToTensor { normals, out } => vec![normals.ptr, out],
        KernelOp::DepthToTensor { depth, out, .. } => vec![depth.ptr, out],
        KernelOp::TensorToScalar { tensor, out } | KernelOp::TensorToDepth { tensor, out, .. } => {
            vec![tensor, out.ptr]
        }
    }
}

/// Uniform block contents for `launch`: width, height, pitch, padding,
/// range min, range max, padding. Kernels without a range get `[0, 1]`.
pub fn params_bytes(launch: &KernelLaunch) -> [u8; PARAMS_SIZE] {
    let range = launch.op.range().unwrap_or_default();
    let words: [[u8; 4]; 8] = [
        (launch.dims.width as u32).to_le_bytes(),
        (launch.dims.height as u32).to_le_bytes(),
        (launch.op.pitch() as u32).to_le_bytes(),
        [0; 4],
        range.min().to_le_bytes(),
        range.max().to_le_bytes(),
        [0; 4],
        [0; 4],
    ];
    let mut bytes = [0u8; PARAMS_SIZE];
    for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word);
    }
    bytes
}
