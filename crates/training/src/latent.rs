//! Latent-vector sampling for generator input.
//!
//! Every row is laid out as `[noise | one-hot slot 0 | ... | continuous]`
//! following [`LatentLayout`]. Values are drawn on the host from a seeded
//! [`StdRng`] and uploaded once per batch, so a given seed reproduces the same
//! codes on every backend.

use std::collections::BTreeMap;

use candle_core::{Device, Tensor};
use model::LatentLayout;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::TrainingError;

/// Steps of the continuous sweep in the fixed grid.
pub const SWEEP_STEPS: usize = 10;

/// One batch of generator input together with the codes it encodes.
#[derive(Debug, Clone)]
pub struct LatentSample {
    /// Latent vectors, `(batch, layout.width())`.
    pub z: Tensor,
    /// Category index per discrete slot and sample, `(n_c_disc, batch)` as `u32`.
    pub disc_idx: Tensor,
    /// Continuous block of `z`, `(batch, dim_c_cont)`.
    pub cont: Tensor,
}

/// Fixed latent batches keyed by `(discrete slot, continuous channel)`.
pub type FixedGrid = BTreeMap<(usize, usize), Tensor>;

pub struct LatentSampler {
    layout: LatentLayout,
    device: Device,
    rng: StdRng,
}

impl LatentSampler {
    pub fn new(layout: LatentLayout, seed: u64, device: &Device) -> Result<Self, TrainingError> {
        layout
            .validate()
            .map_err(|err| TrainingError::initialization(err.to_string()))?;
        Ok(Self {
            layout,
            device: device.clone(),
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn layout(&self) -> LatentLayout {
        self.layout
    }

    /// Draws `batch` latent vectors: standard-normal noise, a uniformly drawn
    /// category per discrete slot, and continuous codes uniform in `[-1, 1]`.
    pub fn sample(&mut self, batch: usize) -> Result<LatentSample, TrainingError> {
        if batch == 0 {
            return Err(TrainingError::shape("cannot sample an empty latent batch"));
        }
        let layout = self.layout;
        let width = layout.width();
        let mut values = vec![0f32; batch * width];
        let mut indices = vec![0u32; layout.n_c_disc * batch];

        for (row, chunk) in values.chunks_mut(width).enumerate() {
            for value in &mut chunk[..layout.dim_z] {
                *value = self.rng.sample(StandardNormal);
            }
            for slot in 0..layout.n_c_disc {
                let category = self.rng.gen_range(0..layout.dim_c_disc);
                chunk[layout.disc_offset(slot) + category] = 1.0;
                indices[slot * batch + row] = category as u32;
            }
            for value in &mut chunk[layout.cont_offset()..] {
                *value = self.rng.gen_range(-1.0f32..=1.0);
            }
        }

        let z = Tensor::from_vec(values, (batch, width), &self.device).map_err(to_runtime_error)?;
        let disc_idx = Tensor::from_vec(indices, (layout.n_c_disc, batch), &self.device)
            .map_err(to_runtime_error)?;
        let cont = z
            .narrow(1, layout.cont_offset(), layout.dim_c_cont)
            .map_err(to_runtime_error)?;
        Ok(LatentSample { z, disc_idx, cont })
    }

    /// Builds the visualization grid. Each entry holds `dim_c_disc * 10` rows:
    /// row `r` sets the chosen slot to category `r / 10` (other slots to
    /// category 0) and the chosen channel to step `r % 10` of an even sweep
    /// from -1 to 1 (other channels to 0). One noise draw is shared by every
    /// entry.
    pub fn sample_fixed(&mut self) -> Result<FixedGrid, TrainingError> {
        let layout = self.layout;
        let width = layout.width();
        let rows = layout.dim_c_disc * SWEEP_STEPS;
        let noise: Vec<f32> = (0..rows * layout.dim_z)
            .map(|_| self.rng.sample(StandardNormal))
            .collect();
        let sweep = linspace(-1.0, 1.0, SWEEP_STEPS);

        let mut grid = FixedGrid::new();
        for disc_slot in 0..layout.n_c_disc {
            for cont_slot in 0..layout.dim_c_cont {
                let mut values = vec![0f32; rows * width];
                for (row, chunk) in values.chunks_mut(width).enumerate() {
                    chunk[..layout.dim_z]
                        .copy_from_slice(&noise[row * layout.dim_z..(row + 1) * layout.dim_z]);
                    for slot in 0..layout.n_c_disc {
                        let category = if slot == disc_slot {
                            row / SWEEP_STEPS
                        } else {
                            0
                        };
                        chunk[layout.disc_offset(slot) + category] = 1.0;
                    }
                    chunk[layout.cont_offset() + cont_slot] = sweep[row % SWEEP_STEPS];
                }
                let z = Tensor::from_vec(values, (rows, width), &self.device)
                    .map_err(to_runtime_error)?;
                grid.insert((disc_slot, cont_slot), z);
            }
        }
        Ok(grid)
    }
}

fn linspace(start: f32, end: f32, steps: usize) -> Vec<f32> {
    if steps < 2 {
        return vec![start; steps];
    }
    let step = (end - start) / (steps - 1) as f32;
    (0..steps)
        .map(|idx| {
            if idx + 1 == steps {
                end
            } else {
                start + step * idx as f32
            }
        })
        .collect()
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn one_hot_rows(block: &Tensor) -> Result<bool, TrainingError> {
        let sums = block
            .to_dtype(DType::F32)
            .and_then(|t| t.sum(1))
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(to_runtime_error)?;
        Ok(sums.iter().all(|sum| *sum == 1.0))
    }

    fn sampler(layout: LatentLayout) -> LatentSampler {
        LatentSampler::new(layout, 42, &Device::Cpu).expect("valid layout")
    }

    #[test]
    fn small_layout_scenario() -> Result<(), TrainingError> {
        let mut sampler = sampler(LatentLayout::new(2, 1, 3, 1));
        let sample = sampler.sample(4)?;
        assert_eq!(sample.z.dims(), &[4, 6]);
        assert_eq!(sample.disc_idx.dims(), &[1, 4]);

        let z = sample.z.to_vec2::<f32>().map_err(to_runtime_error)?;
        let idx = sample.disc_idx.to_vec2::<u32>().map_err(to_runtime_error)?;
        for (row, values) in z.iter().enumerate() {
            let one_hot = &values[2..5];
            assert_eq!(one_hot.iter().sum::<f32>(), 1.0);
            assert!(idx[0][row] < 3);
            assert_eq!(one_hot[idx[0][row] as usize], 1.0);
            assert!((-1.0..=1.0).contains(&values[5]));
        }
        Ok(())
    }

    #[test]
    fn every_slot_is_one_hot_at_the_recorded_index() -> Result<(), TrainingError> {
        let layout = LatentLayout::new(5, 3, 4, 2);
        let mut sampler = sampler(layout);
        let sample = sampler.sample(64)?;
        let idx = sample.disc_idx.to_vec2::<u32>().map_err(to_runtime_error)?;
        for slot in 0..layout.n_c_disc {
            let block = sample
                .z
                .narrow(1, layout.disc_offset(slot), layout.dim_c_disc)
                .map_err(to_runtime_error)?;
            assert!(one_hot_rows(&block)?);
            let rows = block.to_vec2::<f32>().map_err(to_runtime_error)?;
            for (row, values) in rows.iter().enumerate() {
                assert_eq!(values[idx[slot][row] as usize], 1.0);
            }
        }
        let cont = sample.cont.to_vec2::<f32>().map_err(to_runtime_error)?;
        assert!(cont.iter().flatten().all(|v| (-1.0..=1.0).contains(v)));
        Ok(())
    }

    #[test]
    fn batch_of_one_keeps_two_dimensional_shapes() -> Result<(), TrainingError> {
        let mut sampler = sampler(LatentLayout::default());
        let sample = sampler.sample(1)?;
        assert_eq!(sample.z.dims(), &[1, 74]);
        assert_eq!(sample.disc_idx.dims(), &[1, 1]);
        assert_eq!(sample.cont.dims(), &[1, 2]);
        assert!(sampler.sample(0).is_err());
        Ok(())
    }

    #[test]
    fn fixed_grid_covers_every_slot_pair() -> Result<(), TrainingError> {
        let layout = LatentLayout::new(3, 2, 4, 3);
        let mut sampler = sampler(layout);
        let grid = sampler.sample_fixed()?;
        assert_eq!(grid.len(), layout.n_c_disc * layout.dim_c_cont);
        for z in grid.values() {
            assert_eq!(z.dims(), &[layout.dim_c_disc * SWEEP_STEPS, layout.width()]);
        }
        Ok(())
    }

    #[test]
    fn fixed_grid_sweeps_monotonically_per_category() -> Result<(), TrainingError> {
        let layout = LatentLayout::new(3, 2, 4, 2);
        let mut sampler = sampler(layout);
        let grid = sampler.sample_fixed()?;
        for (&(disc_slot, cont_slot), z) in &grid {
            let rows = z.to_vec2::<f32>().map_err(to_runtime_error)?;
            for block in rows.chunks(SWEEP_STEPS) {
                let sweep: Vec<f32> = block
                    .iter()
                    .map(|row| row[layout.cont_offset() + cont_slot])
                    .collect();
                assert_eq!(sweep[0], -1.0);
                assert_eq!(sweep[SWEEP_STEPS - 1], 1.0);
                assert!(sweep.windows(2).all(|pair| pair[0] <= pair[1]));
            }
            for (row, values) in rows.iter().enumerate() {
                let category = row / SWEEP_STEPS;
                assert_eq!(values[layout.disc_offset(disc_slot) + category], 1.0);
                for other in (0..layout.n_c_disc).filter(|slot| *slot != disc_slot) {
                    assert_eq!(values[layout.disc_offset(other)], 1.0);
                }
                for channel in (0..layout.dim_c_cont).filter(|c| *c != cont_slot) {
                    assert_eq!(values[layout.cont_offset() + channel], 0.0);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn fixed_grid_shares_one_noise_draw() -> Result<(), TrainingError> {
        let layout = LatentLayout::new(4, 2, 3, 2);
        let mut sampler = sampler(layout);
        let grid = sampler.sample_fixed()?;
        let noise: Vec<Vec<Vec<f32>>> = grid
            .values()
            .map(|z| z.narrow(1, 0, layout.dim_z).and_then(|t| t.to_vec2::<f32>()))
            .collect::<Result<_, _>>()
            .map_err(to_runtime_error)?;
        assert!(noise.windows(2).all(|pair| pair[0] == pair[1]));
        Ok(())
    }

    #[test]
    fn same_seed_same_samples() -> Result<(), TrainingError> {
        let mut a = sampler(LatentLayout::default());
        let mut b = sampler(LatentLayout::default());
        let za = a.sample(8)?.z.to_vec2::<f32>().map_err(to_runtime_error)?;
        let zb = b.sample(8)?.z.to_vec2::<f32>().map_err(to_runtime_error)?;
        assert_eq!(za, zb);
        Ok(())
    }

    #[test]
    fn linspace_hits_both_ends() {
        let values = linspace(-1.0, 1.0, 10);
        assert_eq!(values.len(), 10);
        assert_eq!(values[0], -1.0);
        assert_eq!(values[9], 1.0);
    }
}
