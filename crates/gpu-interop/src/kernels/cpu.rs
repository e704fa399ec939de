//! Host implementation of the conversion kernels.
//!
//! Each kernel walks the full launch grid one row per rayon task. Tasks
//! whose `(x, y)` falls outside the image return without touching memory,
//! exactly as the device kernels do.

use rayon::prelude::*;

use super::{DepthRange, Grid, ImageDims};
use crate::error::{InteropError, Result};

const CHANNELS: usize = nnao_core::TENSOR_CHANNELS;
const TENSOR_PIXEL_BYTES: usize = CHANNELS * 4;

#[inline]
fn load_f32(bytes: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

#[inline]
fn store_f32(bytes: &mut [u8], offset: usize, value: f32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[track_caller]
fn require(kernel: &'static str, what: &str, have: usize, need: usize) -> Result<()> {
    if have < need {
        return Err(InteropError::call(
            kernel,
            format!("{what} buffer holds {have} bytes, needs {need}"),
        ));
    }
    Ok(())
}

fn pitched_len(dims: ImageDims, pitch: usize, bytes_per_pixel: usize) -> usize {
    if dims.height == 0 {
        0
    } else {
        (dims.height - 1) * pitch + dims.width * bytes_per_pixel
    }
}

fn check_pitch(kernel: &'static str, dims: ImageDims, pitch: usize) -> Result<()> {
    if pitch < dims.width * 4 || pitch % 4 != 0 {
        return Err(InteropError::call(
            kernel,
            format!("pitch {pitch} cannot hold {} pixels", dims.width),
        ));
    }
    Ok(())
}

/// Normals (first three bytes) and depth into a dense tensor. Channel 3
/// carries the rescaled depth.
pub fn pack_normals_depth(
    grid: Grid,
    dims: ImageDims,
    pitch: usize,
    range: DepthRange,
    normals: &[u8],
    depth: &[u8],
    out: &mut [u8],
) -> Result<()> {
    const NAME: &str = "pack_normals_depth";
    if dims.pixels() == 0 {
        return Ok(());
    }
    check_pitch(NAME, dims, pitch)?;
    require(NAME, "normals", normals.len(), pitched_len(dims, pitch, 4))?;
    require(NAME, "depth", depth.len(), pitched_len(dims, pitch, 4))?;
    require(NAME, "tensor", out.len(), dims.pixels() * TENSOR_PIXEL_BYTES)?;

    let row_stride = dims.width * TENSOR_PIXEL_BYTES;
    out.par_chunks_mut(row_stride)
        .take(grid.height())
        .enumerate()
        .for_each(|(y, row)| {
            if y >= dims.height {
                return;
            }
            for x in 0..grid.width() {
                if x >= dims.width {
                    continue;
                }
                let src = y * pitch + 4 * x;
                let dst = x * TENSOR_PIXEL_BYTES;
                for c in 0..3 {
                    store_f32(row, dst + 4 * c, f32::from(normals[src + c]) / 255.0);
                }
                store_f32(row, dst + 12, range.normalize(load_f32(depth, src)));
            }
        });
    Ok(())
}

/// Four bytes per pixel into four floats, each divided by 255.
pub fn normals_to_tensor(
    grid: Grid,
    dims: ImageDims,
    pitch: usize,
    normals: &[u8],
    out: &mut [u8],
) -> Result<()> {
    const NAME: &str = "normals_to_tensor";
    if dims.pixels() == 0 {
        return Ok(());
    }
    check_pitch(NAME, dims, pitch)?;
    require(NAME, "normals", normals.len(), pitched_len(dims, pitch, 4))?;
    require(NAME, "tensor", out.len(), dims.pixels() * TENSOR_PIXEL_BYTES)?;

    let row_stride = dims.width * TENSOR_PIXEL_BYTES;
    out.par_chunks_mut(row_stride)
        .take(grid.height())
        .enumerate()
        .for_each(|(y, row)| {
            if y >= dims.height {
                return;
            }
            for x in 0..grid.width() {
                if x >= dims.width {
                    continue;
                }
                let src = y * pitch + 4 * x;
                let dst = x * TENSOR_PIXEL_BYTES;
                for c in 0..CHANNELS {
                    store_f32(row, dst + 4 * c, f32::from(normals[src + c]) / 255.0);
                }
            }
        });
    Ok(())
}

/// Rescaled depth broadcast into all four channels.
pub fn depth_to_tensor(
    grid: Grid,
    dims: ImageDims,
    pitch: usize,
    range: DepthRange,
    depth: &[u8],
    out: &mut [u8],
) -> Result<()> {
    const NAME: &str = "depth_to_tensor";
    if dims.pixels() == 0 {
        return Ok(());
    }
    check_pitch(NAME, dims, pitch)?;
    require(NAME, "depth", depth.len(), pitched_len(dims, pitch, 4))?;
    require(NAME, "tensor", out.len(), dims.pixels() * TENSOR_PIXEL_BYTES)?;

    let row_stride = dims.width * TENSOR_PIXEL_BYTES;
    out.par_chunks_mut(row_stride)
        .take(grid.height())
        .enumerate()
        .for_each(|(y, row)| {
            if y >= dims.height {
                return;
            }
            for x in 0..grid.width() {
                if x >= dims.width {
                    continue;
                }
                let value = range.normalize(load_f32(depth, y * pitch + 4 * x));
                let dst = x * TENSOR_PIXEL_BYTES;
                for c in 0..CHANNELS {
                    store_f32(row, dst + 4 * c, value);
                }
            }
        });
    Ok(())
}

/// Channel 0 of each tensor pixel into a pitched float image.
pub fn tensor_to_scalar(
    grid: Grid,
    dims: ImageDims,
    pitch: usize,
    tensor: &[u8],
    out: &mut [u8],
) -> Result<()> {
    const NAME: &str = "tensor_to_scalar";
    unpack(NAME, grid, dims, pitch, tensor, out, |pixel| pixel[0])
}

/// Channel 1 of each tensor pixel, inverse-rescaled, into a pitched float
/// image.
pub fn tensor_to_depth(
    grid: Grid,
    dims: ImageDims,
    pitch: usize,
    range: DepthRange,
    tensor: &[u8],
    out: &mut [u8],
) -> Result<()> {
    const NAME: &str = "tensor_to_depth";
    unpack(NAME, grid, dims, pitch, tensor, out, |pixel| {
        range.denormalize(pixel[1])
    })
}

fn unpack(
    name: &'static str,
    grid: Grid,
    dims: ImageDims,
    pitch: usize,
    tensor: &[u8],
    out: &mut [u8],
    value: impl Fn([f32; CHANNELS]) -> f32 + Sync,
) -> Result<()> {
    if dims.pixels() == 0 {
        return Ok(());
    }
    check_pitch(name, dims, pitch)?;
    require(name, "tensor", tensor.len(), dims.pixels() * TENSOR_PIXEL_BYTES)?;
    require(name, "output", out.len(), pitched_len(dims, pitch, 4))?;

    out.par_chunks_mut(pitch)
        .take(grid.height())
        .enumerate()
        .for_each(|(y, row)| {
            if y >= dims.height {
                return;
            }
            for x in 0..grid.width() {
                if x >= dims.width {
                    continue;
                }
                let src = ((y * dims.width) + x) * TENSOR_PIXEL_BYTES;
                let pixel = [
                    load_f32(tensor, src),
                    load_f32(tensor, src + 4),
                    load_f32(tensor, src + 8),
                    load_f32(tensor, src + 12),
                ];
                store_f32(row, 4 * x, value(pixel));
            }
        });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::BlockSize;
    use approx::assert_relative_eq;

    const SENTINEL: u8 = 0xCD;

    fn floats(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    fn depth_image(dims: ImageDims, pitch: usize, f: impl Fn(usize, usize) -> f32) -> Vec<u8> {
        let mut bytes = vec![SENTINEL; pitch * dims.height];
        for y in 0..dims.height {
            for x in 0..dims.width {
                store_f32(&mut bytes, y * pitch + 4 * x, f(x, y));
            }
        }
        bytes
    }

    #[test]
    fn pack_scales_normals_and_rescales_depth() {
        let dims = ImageDims::new(2, 1);
        let pitch = 512;
        let grid = Grid::covering(dims, BlockSize::default());
        let range = DepthRange::new(10.0, 20.0).unwrap();

        let mut normals = vec![0u8; pitch];
        normals[..8].copy_from_slice(&[255, 0, 51, 9, 102, 204, 255, 7]);
        let depth = depth_image(dims, pitch, |x, _| if x == 0 { 10.0 } else { 15.0 });
        let mut out = vec![0u8; dims.tensor_len() * 4];

        pack_normals_depth(grid, dims, pitch, range, &normals, &depth, &mut out).unwrap();
        let t = floats(&out);
        assert_relative_eq!(t[0], 1.0);
        assert_relative_eq!(t[1], 0.0);
        assert_relative_eq!(t[2], 0.2);
        assert_relative_eq!(t[3], 0.0);
        assert_relative_eq!(t[4], 0.4);
        assert_relative_eq!(t[5], 0.8);
        assert_relative_eq!(t[6], 1.0);
        assert_relative_eq!(t[7], 0.5);
    }

    #[test]
    fn normals_divide_all_four_channels() {
        let dims = ImageDims::new(1, 2);
        let pitch = 512;
        let grid = Grid::covering(dims, BlockSize::default());
        let mut normals = vec![0u8; pitch * 2];
        normals[pitch..pitch + 4].copy_from_slice(&[0, 255, 51, 255]);
        let mut out = vec![0u8; dims.tensor_len() * 4];

        normals_to_tensor(grid, dims, pitch, &normals, &mut out).unwrap();
        let t = floats(&out);
        assert_eq!(&t[..4], &[0.0f32; 4]);
        assert_relative_eq!(t[4], 0.0);
        assert_relative_eq!(t[5], 1.0);
        assert_relative_eq!(t[6], 0.2);
        assert_relative_eq!(t[7], 1.0);
    }

    #[test]
    fn depth_is_broadcast_to_every_channel() {
        let dims = ImageDims::new(3, 3);
        let pitch = 512;
        let grid = Grid::covering(dims, BlockSize::default());
        let range = DepthRange::new(-1.0, 1.0).unwrap();
        let depth = depth_image(dims, pitch, |x, y| (x + y) as f32 * 0.25 - 0.5);
        let mut out = vec![0u8; dims.tensor_len() * 4];

        depth_to_tensor(grid, dims, pitch, range, &depth, &mut out).unwrap();
        let t = floats(&out);
        for pixel in t.chunks_exact(4) {
            assert!(pixel.iter().all(|&v| v == pixel[0]));
        }
        // (x=2, y=1): depth 0.25 -> 0.625
        assert_relative_eq!(t[(3 + 2) * 4 + 2], 0.625);
    }

    #[test]
    fn scalar_unpack_reads_channel_zero() {
        let dims = ImageDims::new(2, 2);
        let pitch = 512;
        let grid = Grid::covering(dims, BlockSize::default());
        let tensor: Vec<u8> = (0..dims.tensor_len())
            .flat_map(|i| (i as f32).to_le_bytes())
            .collect();
        let mut out = vec![0u8; pitch * 2];

        tensor_to_scalar(grid, dims, pitch, &tensor, &mut out).unwrap();
        assert_eq!(load_f32(&out, 0), 0.0);
        assert_eq!(load_f32(&out, 4), 4.0);
        assert_eq!(load_f32(&out, pitch), 8.0);
        assert_eq!(load_f32(&out, pitch + 4), 12.0);
    }

    #[test]
    fn depth_survives_pack_then_unpack() {
        let dims = ImageDims::new(5, 3);
        let pitch = 512;
        let grid = Grid::covering(dims, BlockSize::default());
        let range = DepthRange::new(0.5, 80.0).unwrap();
        let depth = depth_image(dims, pitch, |x, y| 0.5 + (x * 7 + y * 13) as f32 * 1.7);

        // Depth-only ingestion fills channel 1 as well, which is the channel
        // the inverse kernel reads back.
        let mut tensor = vec![0u8; dims.tensor_len() * 4];
        depth_to_tensor(grid, dims, pitch, range, &depth, &mut tensor).unwrap();
        let mut restored = vec![0u8; pitch * dims.height];
        tensor_to_depth(grid, dims, pitch, range, &tensor, &mut restored).unwrap();

        for y in 0..dims.height {
            for x in 0..dims.width {
                let offset = y * pitch + 4 * x;
                assert_relative_eq!(
                    load_f32(&restored, offset),
                    load_f32(&depth, offset),
                    max_relative = 1e-5
                );
            }
        }
    }

    #[test]
    fn unpack_depth_ignores_channel_three() {
        let dims = ImageDims::new(1, 1);
        let grid = Grid::covering(dims, BlockSize::default());
        let range = DepthRange::new(2.0, 4.0).unwrap();
        let tensor: Vec<u8> = [0.9f32, 0.25, 0.7, 0.1]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let mut out = vec![0u8; 512];
        tensor_to_depth(grid, dims, 512, range, &tensor, &mut out).unwrap();
        assert_relative_eq!(load_f32(&out, 0), 2.5);
    }

    #[test]
    fn over_provisioned_grid_leaves_padding_untouched() {
        // 3x2 image in a 16x16 block: most tasks fall outside the image.
        let dims = ImageDims::new(3, 2);
        let pitch = 512;
        let grid = Grid::covering(dims, BlockSize::default());
        assert!(grid.width() > dims.width && grid.height() > dims.height);
        let range = DepthRange::default();

        // Pitched output: one spare row plus row padding.
        let tensor = vec![0u8; dims.tensor_len() * 4];
        let mut out = vec![SENTINEL; pitch * (dims.height + 1)];
        tensor_to_scalar(grid, dims, pitch, &tensor, &mut out).unwrap();
        for (i, &b) in out.iter().enumerate() {
            let (row, col) = (i / pitch, i % pitch);
            let inside = row < dims.height && col < dims.width * 4;
            assert_eq!(b == SENTINEL, !inside, "byte {i}");
        }

        // Dense tensor output: spare trailing rows stay untouched.
        let depth = depth_image(dims, pitch, |_, _| 0.5);
        let normals = vec![0u8; pitch * dims.height];
        let used = dims.tensor_len() * 4;
        let mut tensor = vec![SENTINEL; used + dims.width * 16 * 4];
        pack_normals_depth(grid, dims, pitch, range, &normals, &depth, &mut tensor).unwrap();
        assert!(tensor[used..].iter().all(|&b| b == SENTINEL));
        assert!(tensor[..used].iter().all(|&b| b != SENTINEL));
    }

    #[test]
    fn short_buffers_are_reported_not_indexed() {
        let dims = ImageDims::new(4, 4);
        let grid = Grid::covering(dims, BlockSize::default());
        let mut out = vec![0u8; 16];
        let err = normals_to_tensor(grid, dims, 512, &[0u8; 64], &mut out).unwrap_err();
        assert!(err.to_string().contains("normals_to_tensor"));
    }
}
