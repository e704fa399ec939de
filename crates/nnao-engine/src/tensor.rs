//! Dense float tensors exchanged with graph sessions.

use crate::status::EngineStatus;

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    /// A zero-filled tensor of `shape`.
    pub fn zeros(shape: &[usize]) -> Self {
        let len = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: vec![0.0; len],
        }
    }

    pub fn from_data(shape: &[usize], data: Vec<f32>) -> Result<Self, EngineStatus> {
        let len: usize = shape.iter().product();
        if len != data.len() {
            return Err(EngineStatus::invalid_argument(format!(
                "tensor of shape {shape:?} needs {len} values, got {}",
                data.len()
            )));
        }
        Ok(Self {
            shape: shape.to_vec(),
            data,
        })
    }

    /// The `[1, width, height, 4]` image tensor used for the placeholder
    /// input.
    pub fn image(width: usize, height: usize) -> Self {
        Self::zeros(&image_shape(width, height))
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Same shape, every element mapped through `f`.
    pub fn map(&self, f: impl Fn(f32) -> f32) -> Self {
        Self {
            shape: self.shape.clone(),
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }
}

pub fn image_shape(width: usize, height: usize) -> [usize; 4] {
    [1, width, height, nnao_core::TENSOR_CHANNELS]
}
