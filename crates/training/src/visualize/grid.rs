use candle_core::{DType, Tensor};

use crate::TrainingError;

/// Images per row of a grid.
pub const GRID_NROW: usize = 10;
/// Zero border between tiles, in pixels.
pub const GRID_PADDING: usize = 2;

/// 8-bit host image, row-major and channel-interleaved. `channels` is 1
/// (grayscale) or 3 (RGB).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageGrid {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub pixels: Vec<u8>,
}

impl ImageGrid {
    pub fn pixel(&self, x: u32, y: u32, channel: u8) -> u8 {
        let idx = ((y * self.width + x) as usize) * self.channels as usize + channel as usize;
        self.pixels[idx]
    }
}

/// Tiles a `(batch, channels, height, width)` tensor into one image, `nrow`
/// tiles per row with `padding` zero pixels around every tile. With
/// `normalize`, values are min-max scaled over the whole batch; otherwise they
/// are taken as `[0, 1]` and clamped.
pub fn make_grid(
    images: &Tensor,
    nrow: usize,
    padding: usize,
    normalize: bool,
) -> Result<ImageGrid, TrainingError> {
    let (batch, channels, height, width) = images.dims4().map_err(|_| {
        TrainingError::shape(format!(
            "image grid expects (batch, channels, height, width), got {:?}",
            images.dims()
        ))
    })?;
    if batch == 0 {
        return Err(TrainingError::shape("cannot build a grid from an empty batch"));
    }
    if channels != 1 && channels != 3 {
        return Err(TrainingError::shape(format!(
            "image grid supports 1 or 3 channels, got {}",
            channels
        )));
    }

    let values = images
        .to_dtype(DType::F32)
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(|err| TrainingError::runtime(err.to_string()))?;
    let (low, scale) = if normalize {
        let low = values.iter().copied().fold(f32::INFINITY, f32::min);
        let high = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        (low, 1.0 / (high - low).max(1e-5))
    } else {
        (0.0, 1.0)
    };

    let cols = nrow.max(1).min(batch);
    let rows = batch.div_ceil(cols);
    let cell_h = height + padding;
    let cell_w = width + padding;
    let grid_h = rows * cell_h + padding;
    let grid_w = cols * cell_w + padding;

    let mut pixels = vec![0u8; grid_h * grid_w * channels];
    let plane = height * width;
    for idx in 0..batch {
        let top = (idx / cols) * cell_h + padding;
        let left = (idx % cols) * cell_w + padding;
        let image = &values[idx * channels * plane..(idx + 1) * channels * plane];
        for c in 0..channels {
            for y in 0..height {
                for x in 0..width {
                    let v = (image[c * plane + y * width + x] - low) * scale;
                    let dst = ((top + y) * grid_w + left + x) * channels + c;
                    pixels[dst] = (v.clamp(0.0, 1.0) * 255.0).round() as u8;
                }
            }
        }
    }

    Ok(ImageGrid {
        width: grid_w as u32,
        height: grid_h as u32,
        channels: channels as u8,
        pixels,
    })
}
