use std::{
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{DType, Device, Tensor};
use layers::{InitScheme, ParamInit};
use log::{debug, info};
use model::{DiscriminatorNet, GeneratorNet, MnistDiscriminator, MnistGenerator};

use crate::{
    data::{self, BlockingDataLoader, DataLoader},
    device::{select_device, DeviceSpec},
    latent::{FixedGrid, LatentSampler},
    logging::{self, StepPosition},
    loss::{Label, LossComposer},
    metrics::{StepLosses, TrainingMetrics},
    optimizer::{AdamGroup, OptimizerPartition},
    visualize::{make_grid, Visualizer, GRID_NROW, GRID_PADDING},
    TrainingConfig, TrainingError,
};

/// Fakes rendered in the first-step snapshot of every epoch.
const SNAPSHOT_IMAGES: usize = 100;

/// Where the trainer is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerPhase {
    /// Networks and optimizers exist; nothing has run yet.
    Init,
    /// Preparing the data loader and the fixed visualization grid.
    Building,
    /// Between steps of an epoch.
    TrainingEpoch,
    /// Inside one optimization step.
    TrainingStep,
    /// Rendering the fixed-grid sweep.
    VisualizationSweep,
    Done,
}

struct StepOutcome {
    losses: StepLosses,
    fake: Tensor,
}

pub struct Trainer {
    config: TrainingConfig,
    device: Device,
    generator: Box<dyn GeneratorNet>,
    discriminator: Box<dyn DiscriminatorNet>,
    optimizers: OptimizerPartition,
    loss: LossComposer,
    sampler: LatentSampler,
    fixed_grid: Option<FixedGrid>,
    data_loader: Option<BlockingDataLoader<Box<dyn DataLoader>>>,
    visualizer: Visualizer,
    metrics: TrainingMetrics,
    run_name: String,
    run_dir: PathBuf,
    phase: TrainerPhase,
    global_step: usize,
}

impl Trainer {
    /// Builds the MNIST networks on the configured device and initialises
    /// them with the configured scheme.
    pub fn new(config: TrainingConfig) -> Result<Self, TrainingError> {
        config.validate()?;
        let spec: DeviceSpec = config
            .runtime
            .device
            .parse()
            .map_err(TrainingError::unsupported)?;
        let device = select_device(spec)?;

        let model_config = config.model_config();
        let mut init = ParamInit::new(
            InitScheme::from(config.runtime.init),
            config.runtime.seed,
            &device,
        );
        let generator = MnistGenerator::new(&model_config, &mut init).map_err(to_init_error)?;
        let discriminator =
            MnistDiscriminator::new(&model_config, &mut init).map_err(to_init_error)?;
        generator.apply_init(&mut init).map_err(to_init_error)?;
        discriminator.apply_init(&mut init).map_err(to_init_error)?;

        Self::with_networks(config, device, Box::new(generator), Box::new(discriminator))
    }

    /// Wraps already-initialised networks. Their latent layout and image
    /// shape must match the configuration.
    pub fn with_networks(
        config: TrainingConfig,
        device: Device,
        generator: Box<dyn GeneratorNet>,
        discriminator: Box<dyn DiscriminatorNet>,
    ) -> Result<Self, TrainingError> {
        config.validate()?;
        let layout = config.latent.layout();
        if generator.latent_layout() != layout || discriminator.latent_layout() != layout {
            return Err(TrainingError::shape(format!(
                "networks expect latent layouts {:?} / {:?} but the configuration describes {:?}",
                generator.latent_layout(),
                discriminator.latent_layout(),
                layout
            )));
        }
        if generator.image_shape() != config.data.image_shape() {
            return Err(TrainingError::shape(format!(
                "generator produces {:?} images but data expects {:?}",
                generator.image_shape(),
                config.data.image_shape()
            )));
        }

        let optimizers = OptimizerPartition::new(
            &config.optimizer,
            config.loss.continuous_mode,
            generator.as_ref(),
            discriminator.as_ref(),
        )?;
        info!(
            "optimizers: discriminator {} params (lr {}), generator {} params (lr {})",
            optimizers.discriminator.len(),
            optimizers.discriminator.learning_rate(),
            optimizers.generator.len(),
            optimizers.generator.learning_rate()
        );

        let sampler = LatentSampler::new(layout, config.runtime.seed, &device)?;
        let run_name = run_name(&config.runtime.model_name);
        let run_dir = config.runtime.output_root.join("results").join(&run_name);
        let visualizer = Visualizer::from_config(&config.visualization, &run_dir);

        Ok(Self {
            loss: LossComposer::new(&config.loss),
            config,
            device,
            generator,
            discriminator,
            optimizers,
            sampler,
            fixed_grid: None,
            data_loader: None,
            visualizer,
            metrics: TrainingMetrics::new(),
            run_name,
            run_dir,
            phase: TrainerPhase::Init,
            global_step: 0,
        })
    }

    /// Replaces the dataset-backed loader `train` would otherwise build.
    pub fn set_data_loader<L>(&mut self, loader: L) -> Result<(), TrainingError>
    where
        L: DataLoader + 'static,
    {
        if loader.image_shape() != self.generator.image_shape() {
            return Err(TrainingError::shape(format!(
                "loader yields {:?} images but the generator produces {:?}",
                loader.image_shape(),
                self.generator.image_shape()
            )));
        }
        self.data_loader = Some(BlockingDataLoader::new(
            Box::new(loader) as Box<dyn DataLoader>
        ));
        Ok(())
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn phase(&self) -> TrainerPhase {
        self.phase
    }

    /// `model_name` plus the time-derived suffix.
    pub fn run_name(&self) -> &str {
        &self.run_name
    }

    /// Directory receiving the PNG output of this run.
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn generator(&self) -> &dyn GeneratorNet {
        self.generator.as_ref()
    }

    pub fn discriminator(&self) -> &dyn DiscriminatorNet {
        self.discriminator.as_ref()
    }

    pub fn optimizers(&self) -> &OptimizerPartition {
        &self.optimizers
    }

    pub fn visualizer_mut(&mut self) -> &mut Visualizer {
        &mut self.visualizer
    }

    pub fn train(&mut self) -> Result<(), TrainingError> {
        self.train_with_shutdown(|| false)
    }

    /// Runs every configured epoch. `should_stop` is polled at step
    /// boundaries; a stop ends the run after flushing the sinks.
    pub fn train_with_shutdown<F>(&mut self, mut should_stop: F) -> Result<(), TrainingError>
    where
        F: FnMut() -> bool,
    {
        self.phase = TrainerPhase::Building;
        self.ensure_fixed_grid()?;
        let mut loader = match self.data_loader.take() {
            Some(loader) => loader,
            None => {
                let loader = data::build_data_loader(
                    &self.config.data,
                    self.config.runtime.seed,
                    &self.device,
                )?;
                BlockingDataLoader::new(Box::new(loader) as Box<dyn DataLoader>)
            }
        };
        if loader.image_shape() != self.generator.image_shape() {
            return Err(TrainingError::shape(format!(
                "loader yields {:?} images but the generator produces {:?}",
                loader.image_shape(),
                self.generator.image_shape()
            )));
        }

        info!(
            "starting run '{}' on {:?}: {} epochs x {} steps, output {}",
            self.run_name,
            self.device,
            self.config.runtime.num_epochs,
            loader.batches_per_epoch(),
            self.run_dir.display()
        );
        let result = self.run_epochs(&mut loader, &mut should_stop);
        self.data_loader = Some(loader);
        self.visualizer.flush();
        if result.is_ok() {
            self.phase = TrainerPhase::Done;
        }
        result
    }

    fn run_epochs<F>(
        &mut self,
        loader: &mut BlockingDataLoader<Box<dyn DataLoader>>,
        should_stop: &mut F,
    ) -> Result<(), TrainingError>
    where
        F: FnMut() -> bool,
    {
        let num_epochs = self.config.runtime.num_epochs;
        let steps_per_epoch = loader.batches_per_epoch();
        let log_every = self.config.runtime.log_every_n_steps;
        let sweep_every = self.config.runtime.sweep_every_n_epochs;

        for epoch in 0..num_epochs {
            self.phase = TrainerPhase::TrainingEpoch;
            loader.start_epoch(epoch)?;

            while let Some(batch) = loader.next_batch()? {
                if should_stop() {
                    info!("stop requested; ending run at epoch {} step {}", epoch + 1, batch.step);
                    return Ok(());
                }

                let outcome = self.step(&batch.images)?;
                self.global_step += 1;
                let snapshot = self
                    .metrics
                    .record_step(batch.batch_size as u64, &outcome.losses);

                if batch.step % log_every == 0 {
                    let position = StepPosition {
                        epoch: epoch + 1,
                        num_epochs,
                        step: batch.step,
                        steps_per_epoch,
                    };
                    logging::log_step(
                        &self.run_name,
                        position,
                        self.metrics.elapsed(),
                        &outcome.losses,
                        &snapshot,
                    );
                    for (series, value) in logging::step_series(&outcome.losses) {
                        self.visualizer.scalar(series, self.global_step as u64, value);
                    }
                }
                if batch.step == 0 {
                    self.render_snapshot(&outcome.fake, epoch, batch.step + 1)?;
                }
                self.visualizer.drain();
                self.phase = TrainerPhase::TrainingEpoch;
            }

            if (epoch + 1) % sweep_every == 0 || epoch + 1 == num_epochs {
                self.sweep(epoch)?;
            }
        }
        Ok(())
    }

    /// Renders the fixed-grid sweep once without training.
    pub fn test(&mut self) -> Result<(), TrainingError> {
        self.phase = TrainerPhase::Building;
        self.ensure_fixed_grid()?;
        self.sweep(0)?;
        self.visualizer.flush();
        self.phase = TrainerPhase::Done;
        Ok(())
    }

    /// One discriminator update followed by one generator+recognition
    /// update on `images`.
    pub fn train_step(&mut self, images: &Tensor) -> Result<StepLosses, TrainingError> {
        let outcome = self.step(images)?;
        self.phase = TrainerPhase::TrainingEpoch;
        Ok(outcome.losses)
    }

    fn step(&mut self, images: &Tensor) -> Result<StepOutcome, TrainingError> {
        self.phase = TrainerPhase::TrainingStep;
        let batch = images.dim(0).map_err(to_runtime_error)?;
        let expected = self.generator.image_shape().batch_dims(batch);
        if images.dims() != expected {
            return Err(TrainingError::shape(format!(
                "real batch is {:?}, expected {:?}",
                images.dims(),
                expected
            )));
        }
        let detect_anomaly = self.config.runtime.detect_anomaly;

        self.optimizers.discriminator.zero_grad();

        let real_out = self
            .discriminator
            .forward_t(images, true)
            .map_err(to_runtime_error)?;
        let loss_d_real = self.loss.discriminator(&real_out, Label::Real)?;
        if detect_anomaly {
            ensure_finite_loss("discriminator real loss", &loss_d_real)?;
        }
        let grads = loss_d_real.backward().map_err(to_runtime_error)?;
        self.optimizers.discriminator.accumulate(&grads)?;

        // The sampler follows the observed batch, so a short trailing batch
        // gets labels and codes of its own size.
        let sample = self.sampler.sample(batch)?;
        let fake = self
            .generator
            .forward_t(&sample.z, true)
            .map_err(to_runtime_error)?;
        let fake_out_d = self
            .discriminator
            .forward_t(&fake.detach(), true)
            .map_err(to_runtime_error)?;
        let loss_d_fake = self.loss.discriminator(&fake_out_d, Label::Fake)?;
        if detect_anomaly {
            ensure_finite_loss("discriminator fake loss", &loss_d_fake)?;
        }
        let grads = loss_d_fake.backward().map_err(to_runtime_error)?;
        self.optimizers.discriminator.accumulate(&grads)?;
        if detect_anomaly {
            ensure_finite_gradients("discriminator backward", &self.optimizers.discriminator)?;
        }

        self.optimizers.discriminator.step()?;

        self.optimizers.generator.zero_grad();

        let fake_out_g = self
            .discriminator
            .forward_t(&fake, true)
            .map_err(to_runtime_error)?;
        let info = self.loss.info(&fake_out_g, &sample)?;
        if detect_anomaly {
            ensure_finite_loss("generator info loss", &info.loss)?;
        }
        let grads = info.loss.backward().map_err(to_runtime_error)?;
        self.optimizers.generator.accumulate(&grads)?;
        if detect_anomaly {
            ensure_finite_gradients("generator backward", &self.optimizers.generator)?;
        }

        self.optimizers.generator.step()?;

        let loss_d_real = scalar(&loss_d_real)?;
        let loss_d_fake = scalar(&loss_d_fake)?;
        let loss_cont_channels: Vec<f64> = info
            .continuous
            .to_dtype(DType::F32)
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(to_runtime_error)?
            .into_iter()
            .map(f64::from)
            .collect();
        let losses = StepLosses {
            loss_d: loss_d_real + loss_d_fake,
            loss_d_real,
            loss_d_fake,
            loss_info: scalar(&info.loss)?,
            loss_gen: scalar(&info.adversarial)?,
            loss_disc: scalar(&info.categorical)?,
            loss_cont: loss_cont_channels.iter().sum(),
            loss_cont_channels,
            prob_real: mean(&real_out.probability)?,
            prob_fake_d: mean(&fake_out_d.probability)?,
            prob_fake_g: mean(&fake_out_g.probability)?,
        };
        debug!(
            "step {} losses: d {:.4} info {:.4}",
            self.global_step, losses.loss_d, losses.loss_info
        );
        Ok(StepOutcome {
            losses,
            fake: fake.detach(),
        })
    }

    fn ensure_fixed_grid(&mut self) -> Result<(), TrainingError> {
        if self.fixed_grid.is_none() {
            self.fixed_grid = Some(self.sampler.sample_fixed()?);
        }
        Ok(())
    }

    fn render_snapshot(
        &mut self,
        fake: &Tensor,
        epoch: usize,
        index: usize,
    ) -> Result<(), TrainingError> {
        let count = fake.dim(0).map_err(to_runtime_error)?.min(SNAPSHOT_IMAGES);
        let images = fake.narrow(0, 0, count).map_err(to_runtime_error)?;
        let grid = make_grid(&images, GRID_NROW, GRID_PADDING, true)?;
        let name = format!("{}-Epoch_{}-C_disc_{}", self.run_name, epoch, index);
        let caption = format!("Generated samples, epoch {}", epoch + 1);
        self.visualizer.image(name, caption, grid);
        Ok(())
    }

    /// Generates every fixed-grid batch and queues one captioned grid per
    /// (discrete slot, continuous channel). The generator uses running
    /// normalisation statistics unless `visualization.sweep_batch_statistics`
    /// is set, which normalises each grid batch on its own statistics.
    fn sweep(&mut self, epoch: usize) -> Result<(), TrainingError> {
        self.phase = TrainerPhase::VisualizationSweep;
        self.ensure_fixed_grid()?;
        let batch_statistics = self.config.visualization.sweep_batch_statistics;
        if let Some(grid) = self.fixed_grid.as_ref() {
            for (&(disc_slot, cont_slot), z) in grid {
                let images = self
                    .generator
                    .forward_t(z, batch_statistics)
                    .map_err(to_runtime_error)?
                    .detach();
                let name = format!(
                    "Fixed_{}_E-{}_Cd-{}_Cc-{}",
                    self.run_name, epoch, disc_slot, cont_slot
                );
                let caption = format!(
                    "Discrete Code Index = {}, Continuous Code Index = {}",
                    disc_slot, cont_slot
                );
                let rendered = make_grid(&images, GRID_NROW, GRID_PADDING, true)?;
                self.visualizer.image(name, caption, rendered);
            }
            debug!("queued {} sweep grids for epoch {}", grid.len(), epoch);
        }
        self.visualizer.drain();
        self.phase = TrainerPhase::TrainingEpoch;
        Ok(())
    }
}

fn run_name(model_name: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_millis())
        .unwrap_or(0);
    format!("{}{:04}", model_name, millis % 10_000)
}

fn ensure_finite_loss(stage: &str, loss: &Tensor) -> Result<(), TrainingError> {
    let value = scalar(loss)?;
    if !value.is_finite() {
        return Err(TrainingError::anomaly(stage, format!("loss evaluated to {}", value)));
    }
    Ok(())
}

fn ensure_finite_gradients(stage: &str, group: &AdamGroup) -> Result<(), TrainingError> {
    for (name, grad) in group.gradients() {
        if contains_non_finite(grad)? {
            return Err(TrainingError::anomaly(
                stage,
                format!("non-finite gradient for '{}'", name),
            ));
        }
    }
    Ok(())
}

fn contains_non_finite(tensor: &Tensor) -> Result<bool, TrainingError> {
    let values = tensor
        .flatten_all()
        .and_then(|t| t.to_dtype(DType::F32))
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(to_runtime_error)?;
    Ok(values.iter().any(|value| !value.is_finite()))
}

fn scalar(tensor: &Tensor) -> Result<f64, TrainingError> {
    tensor
        .to_dtype(DType::F32)
        .and_then(|t| t.to_scalar::<f32>())
        .map(f64::from)
        .map_err(to_runtime_error)
}

fn mean(tensor: &Tensor) -> Result<f64, TrainingError> {
    tensor
        .mean_all()
        .map_err(to_runtime_error)
        .and_then(|t| scalar(&t))
}

fn to_init_error(err: candle_core::Error) -> TrainingError {
    TrainingError::initialization(err.to_string())
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_name_appends_four_digits() {
        let name = run_name("Vanila_InfoGAN");
        let suffix = &name["Vanila_InfoGAN".len()..];
        assert_eq!(suffix.len(), 4);
        assert!(suffix.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn non_finite_detection() -> Result<(), TrainingError> {
        let finite = Tensor::new(&[1f32, 2.0], &Device::Cpu).map_err(to_runtime_error)?;
        let nan = Tensor::new(&[1f32, f32::NAN], &Device::Cpu).map_err(to_runtime_error)?;
        let large = Tensor::new(&[3e30f32, -3e30], &Device::Cpu).map_err(to_runtime_error)?;
        let empty = Tensor::new(&[] as &[f32], &Device::Cpu).map_err(to_runtime_error)?;
        assert!(!contains_non_finite(&finite)?);
        assert!(!contains_non_finite(&large)?);
        assert!(!contains_non_finite(&empty)?);
        assert!(contains_non_finite(&nan)?);
        assert!(matches!(
            ensure_finite_loss(
                "stage",
                &Tensor::new(f32::INFINITY, &Device::Cpu).map_err(to_runtime_error)?
            ),
            Err(TrainingError::Anomaly { .. })
        ));
        Ok(())
    }
}
