use std::{collections::HashSet, fs, path::Path};

use anyhow::Result;
use candle_core::{Device, Tensor, Var};
use layers::{Activation, ActivationKind, InitScheme, Layer, Linear, ParamInit, Sequential};
use model::{
    DiscriminatorHead, DiscriminatorNet, DiscriminatorOutput, GeneratorNet, ImageShape,
    LatentLayout, MnistDiscriminator, MnistGenerator, ModelConfig,
};
use training::{
    config::ContinuousLossMode,
    optimizer::OptimizerPartition,
    Trainer, TrainerPhase, TrainingConfig, TrainingError,
};

const SIDE: usize = 4;

fn small_layout() -> LatentLayout {
    LatentLayout::new(2, 1, 3, 1)
}

fn stub_config(output_root: &Path) -> TrainingConfig {
    let mut config = TrainingConfig::default();
    let layout = small_layout();
    config.latent.dim_z = layout.dim_z;
    config.latent.n_c_disc = layout.n_c_disc;
    config.latent.dim_c_disc = layout.dim_c_disc;
    config.latent.dim_c_cont = layout.dim_c_cont;
    config.data.data_dim = SIDE;
    config.data.batch_size = 4;
    config.data.num_workers = 0;
    config.runtime.device = "cpu".to_string();
    config.runtime.seed = 7;
    config.runtime.output_root = output_root.to_path_buf();
    config.visualization.enabled = false;
    config
}

/// Dense generator: latent -> tanh(linear) reshaped to a 1x4x4 image.
struct StubGenerator {
    layout: LatentLayout,
    layers: Sequential,
}

impl StubGenerator {
    fn new(layout: LatentLayout, init: &mut ParamInit) -> Result<Self> {
        let layers = Sequential::new()
            .add(Linear::new(layout.width(), SIDE * SIDE, init)?)
            .add(Activation::new(ActivationKind::Tanh)?);
        Ok(Self { layout, layers })
    }
}

impl GeneratorNet for StubGenerator {
    fn latent_layout(&self) -> LatentLayout {
        self.layout
    }

    fn image_shape(&self) -> ImageShape {
        ImageShape::grayscale(SIDE)
    }

    fn forward_t(&self, z: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let batch = z.dim(0)?;
        self.layers.forward_t(z, train)?.reshape((batch, 1, SIDE, SIDE))
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        self.layers.named_parameters("stub_generator")
    }

    fn apply_init(&self, init: &mut ParamInit) -> candle_core::Result<()> {
        self.layers.apply_init(init)
    }
}

/// Dense discriminator with the same head structure as the MNIST network.
struct StubDiscriminator {
    layout: LatentLayout,
    shared: Sequential,
    real_fake: Sequential,
    q: Sequential,
    latent_disc: Sequential,
    latent_cont_mu: Sequential,
    latent_cont_var: Sequential,
}

impl StubDiscriminator {
    fn new(layout: LatentLayout, init: &mut ParamInit) -> Result<Self> {
        let hidden = 8;
        Ok(Self {
            layout,
            shared: Sequential::new()
                .add(Linear::new(SIDE * SIDE, hidden, init)?)
                .add(Activation::new(ActivationKind::LeakyRelu(0.1))?),
            real_fake: Sequential::new()
                .add(Linear::new(hidden, 1, init)?)
                .add(Activation::new(ActivationKind::Sigmoid)?),
            q: Sequential::new()
                .add(Linear::new(hidden, hidden, init)?)
                .add(Activation::new(ActivationKind::LeakyRelu(0.1))?),
            latent_disc: Sequential::new().add(Linear::new(hidden, layout.disc_width(), init)?),
            latent_cont_mu: Sequential::new().add(Linear::new(hidden, layout.dim_c_cont, init)?),
            latent_cont_var: Sequential::new()
                .add(Linear::new(hidden, layout.dim_c_cont, init)?)
                .add(Activation::new(ActivationKind::Exp)?),
        })
    }

    fn head(&self, head: DiscriminatorHead) -> &Sequential {
        match head {
            DiscriminatorHead::Shared => &self.shared,
            DiscriminatorHead::RealFake => &self.real_fake,
            DiscriminatorHead::Q => &self.q,
            DiscriminatorHead::Discrete => &self.latent_disc,
            DiscriminatorHead::ContinuousMean => &self.latent_cont_mu,
            DiscriminatorHead::ContinuousVariance => &self.latent_cont_var,
        }
    }
}

impl DiscriminatorNet for StubDiscriminator {
    fn latent_layout(&self) -> LatentLayout {
        self.layout
    }

    fn forward_t(&self, images: &Tensor, train: bool) -> candle_core::Result<DiscriminatorOutput> {
        let batch = images.dim(0)?;
        let x = images.reshape((batch, SIDE * SIDE))?;
        let shared = self.shared.forward_t(&x, train)?;
        let probability = self.real_fake.forward_t(&shared, train)?.squeeze(1)?;
        let q = self.q.forward_t(&shared, train)?;
        let disc_logits = self.latent_disc.forward_t(&q, train)?.reshape((
            batch,
            self.layout.n_c_disc,
            self.layout.dim_c_disc,
        ))?;
        Ok(DiscriminatorOutput {
            probability,
            disc_logits,
            cont_mu: self.latent_cont_mu.forward_t(&q, train)?,
            cont_var: self.latent_cont_var.forward_t(&q, train)?,
        })
    }

    fn head_parameters(&self, head: DiscriminatorHead) -> Vec<(String, Var)> {
        self.head(head)
            .named_parameters(&format!("stub_discriminator.{}", head.name()))
    }

    fn apply_init(&self, init: &mut ParamInit) -> candle_core::Result<()> {
        for head in DiscriminatorHead::ALL {
            self.head(head).apply_init(init)?;
        }
        Ok(())
    }
}

fn stub_trainer(config: TrainingConfig) -> Result<Trainer, TrainingError> {
    let device = Device::Cpu;
    let mut init = ParamInit::new(InitScheme::Default, config.runtime.seed, &device);
    let layout = config.latent.layout();
    let generator = StubGenerator::new(layout, &mut init)
        .map_err(|err| TrainingError::initialization(err.to_string()))?;
    let discriminator = StubDiscriminator::new(layout, &mut init)
        .map_err(|err| TrainingError::initialization(err.to_string()))?;
    Trainer::with_networks(config, device, Box::new(generator), Box::new(discriminator))
}

fn real_batch(batch: usize) -> Result<Tensor> {
    let values: Vec<f32> = (0..batch * SIDE * SIDE)
        .map(|idx| ((idx % 7) as f32 / 3.0) - 1.0)
        .collect();
    Ok(Tensor::from_vec(values, (batch, 1, SIDE, SIDE), &Device::Cpu)?)
}

fn write_idx_fixture(dir: &Path, count: usize, side: usize) -> Result<()> {
    let mut images = Vec::new();
    for field in [2051u32, count as u32, side as u32, side as u32] {
        images.extend_from_slice(&field.to_be_bytes());
    }
    images.extend((0..count * side * side).map(|idx| (idx * 31 % 256) as u8));
    fs::write(dir.join("train-images-idx3-ubyte"), images)?;

    let mut labels = Vec::new();
    for field in [2049u32, count as u32] {
        labels.extend_from_slice(&field.to_be_bytes());
    }
    labels.extend((0..count).map(|idx| (idx % 10) as u8));
    fs::write(dir.join("train-labels-idx1-ubyte"), labels)?;
    Ok(())
}

fn png_names(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().to_string();
        if name.ends_with(".png") {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

#[test]
fn one_step_is_deterministic_for_a_fixed_seed() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let images = real_batch(4)?;

    let mut first = stub_trainer(stub_config(tmp.path()))?;
    let mut second = stub_trainer(stub_config(tmp.path()))?;
    let a = first.train_step(&images)?;
    let b = second.train_step(&images)?;

    assert_eq!(a, b);
    assert!(a.loss_d.is_finite() && a.loss_info.is_finite());
    assert_eq!(a.loss_cont_channels.len(), 1);
    assert!((a.loss_d - (a.loss_d_real + a.loss_d_fake)).abs() < 1e-9);
    let expected_info = a.loss_gen + a.loss_disc + a.loss_cont;
    assert!((a.loss_info - expected_info).abs() < 1e-4);
    Ok(())
}

#[test]
fn steps_update_both_optimizers() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut trainer = stub_trainer(stub_config(tmp.path()))?;
    trainer.train_step(&real_batch(4)?)?;
    assert_eq!(trainer.optimizers().discriminator.steps(), 1);
    assert_eq!(trainer.optimizers().generator.steps(), 1);
    assert_eq!(trainer.phase(), TrainerPhase::TrainingEpoch);
    Ok(())
}

#[test]
fn trailing_partial_batches_are_accepted() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut trainer = stub_trainer(stub_config(tmp.path()))?;
    trainer.train_step(&real_batch(4)?)?;
    let losses = trainer.train_step(&real_batch(3)?)?;
    assert!(losses.loss_d.is_finite());
    Ok(())
}

#[test]
fn image_shape_mismatch_is_fatal() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut trainer = stub_trainer(stub_config(tmp.path()))?;
    let wrong = Tensor::zeros((4, 1, 8, 8), candle_core::DType::F32, &Device::Cpu)?;
    assert!(matches!(
        trainer.train_step(&wrong),
        Err(TrainingError::Shape(_))
    ));
    Ok(())
}

#[test]
fn non_finite_input_raises_an_anomaly() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut trainer = stub_trainer(stub_config(tmp.path()))?;
    let poisoned = real_batch(4)?.affine(f64::NAN, 0.0)?;
    match trainer.train_step(&poisoned) {
        Err(TrainingError::Anomaly { stage, .. }) => assert!(stage.contains("discriminator")),
        other => panic!("expected anomaly, got {:?}", other.map(|_| ())),
    }
    Ok(())
}

#[test]
fn only_adam_is_accepted_before_training() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut config = stub_config(tmp.path());
    config.optimizer.algorithm = "adam_w".to_string();
    assert!(matches!(
        stub_trainer(config),
        Err(TrainingError::Unsupported(_))
    ));
    Ok(())
}

#[test]
fn unknown_optimizer_in_a_config_file_is_unsupported() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("run.toml");
    fs::write(
        &path,
        "[optimizer]\nalgorithm = \"rmsprop\"\n\n[runtime]\ndevice = \"cpu\"\n\n[visualization]\nenabled = false\n",
    )?;
    let config = TrainingConfig::load(&path)?;
    assert_eq!(config.optimizer.algorithm, "rmsprop");
    assert!(matches!(
        Trainer::new(config),
        Err(TrainingError::Unsupported(_))
    ));
    Ok(())
}

#[test]
fn mismatched_latent_layout_is_rejected() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let config = stub_config(tmp.path());
    let device = Device::Cpu;
    let mut init = ParamInit::new(InitScheme::Default, 1, &device);
    let generator = StubGenerator::new(LatentLayout::new(5, 1, 3, 1), &mut init)?;
    let discriminator = StubDiscriminator::new(small_layout(), &mut init)?;
    assert!(matches!(
        Trainer::with_networks(config, device, Box::new(generator), Box::new(discriminator)),
        Err(TrainingError::Shape(_))
    ));
    Ok(())
}

fn head_values(trainer: &Trainer, head: DiscriminatorHead) -> Result<Vec<f32>> {
    let mut values = Vec::new();
    for (_, var) in trainer.discriminator().head_parameters(head) {
        values.extend(var.as_tensor().flatten_all()?.to_vec1::<f32>()?);
    }
    Ok(values)
}

#[test]
fn a_step_moves_trunk_and_recognition_but_not_the_variance_head() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut trainer = stub_trainer(stub_config(tmp.path()))?;
    let before: Vec<Vec<f32>> = DiscriminatorHead::ALL
        .iter()
        .map(|head| head_values(&trainer, *head))
        .collect::<Result<_>>()?;

    trainer.train_step(&real_batch(4)?)?;

    for (head, before) in DiscriminatorHead::ALL.iter().zip(before) {
        let after = head_values(&trainer, *head)?;
        let moved = after != before;
        match head {
            DiscriminatorHead::ContinuousVariance => {
                assert!(!moved, "variance head must stay frozen")
            }
            _ => assert!(moved, "{} did not move", head.name()),
        }
    }
    Ok(())
}

fn partition_names(mode: ContinuousLossMode) -> Result<(HashSet<String>, HashSet<String>)> {
    let device = Device::Cpu;
    let model_config = ModelConfig::new(LatentLayout::default(), ImageShape::grayscale(28));
    let mut init = ParamInit::new(InitScheme::Default, 3, &device);
    let generator = MnistGenerator::new(&model_config, &mut init)?;
    let discriminator = MnistDiscriminator::new(&model_config, &mut init)?;
    let partition = OptimizerPartition::new(
        &TrainingConfig::default().optimizer,
        mode,
        &generator,
        &discriminator,
    )?;
    let d = partition
        .discriminator
        .parameter_names()
        .map(str::to_string)
        .collect();
    let g = partition
        .generator
        .parameter_names()
        .map(str::to_string)
        .collect();
    Ok((d, g))
}

#[test]
fn optimizer_groups_are_disjoint_and_skip_the_variance_head() -> Result<()> {
    let (d, g) = partition_names(ContinuousLossMode::Mse)?;
    assert!(d.is_disjoint(&g));
    assert!(!d.is_empty() && !g.is_empty());

    let owned_by = |prefix: &str, set: &HashSet<String>| set.iter().any(|n| n.starts_with(prefix));
    assert!(owned_by("discriminator.shared.", &d));
    assert!(owned_by("discriminator.real_fake.", &d));
    assert!(!owned_by("discriminator.shared.", &g));
    assert!(owned_by("generator.", &g));
    assert!(owned_by("discriminator.q.", &g));
    assert!(owned_by("discriminator.latent_disc.", &g));
    assert!(owned_by("discriminator.latent_cont_mu.", &g));
    assert!(!owned_by("discriminator.latent_cont_var.", &d));
    assert!(!owned_by("discriminator.latent_cont_var.", &g));
    Ok(())
}

#[test]
fn likelihood_mode_trains_the_variance_head_with_the_generator() -> Result<()> {
    let (d, g) = partition_names(ContinuousLossMode::GaussianNll)?;
    assert!(d.is_disjoint(&g));
    assert!(g
        .iter()
        .any(|name| name.starts_with("discriminator.latent_cont_var.")));
    Ok(())
}

#[test]
fn likelihood_mode_step_is_finite() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut config = stub_config(tmp.path());
    config.loss.continuous_mode = ContinuousLossMode::GaussianNll;
    let mut trainer = stub_trainer(config)?;
    let losses = trainer.train_step(&real_batch(4)?)?;
    assert!(losses.loss_cont.is_finite());
    Ok(())
}

#[test]
fn test_mode_renders_one_grid_per_code_pair() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut config = stub_config(tmp.path());
    config.latent.dim_c_cont = 2;
    let mut trainer = stub_trainer(config)?;
    trainer.test()?;
    assert_eq!(trainer.phase(), TrainerPhase::Done);

    let names = png_names(trainer.run_dir())?;
    assert_eq!(names.len(), 2);
    let run = trainer.run_name().to_string();
    assert!(names.contains(&format!("Fixed_{}_E-0_Cd-0_Cc-0.png", run)));
    assert!(names.contains(&format!("Fixed_{}_E-0_Cd-0_Cc-1.png", run)));
    Ok(())
}

#[test]
fn stop_request_ends_the_run_at_a_step_boundary() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let data_dir = tmp.path().join("data");
    fs::create_dir_all(&data_dir)?;
    write_idx_fixture(&data_dir, 8, SIDE)?;

    let mut config = stub_config(tmp.path());
    config.data.root = data_dir;
    let mut trainer = stub_trainer(config)?;
    trainer.train_with_shutdown(|| true)?;
    assert_eq!(trainer.global_step(), 0);
    assert_eq!(trainer.phase(), TrainerPhase::Done);
    Ok(())
}

#[test]
fn mnist_epoch_writes_snapshot_and_sweep() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let data_dir = tmp.path().join("mnist");
    fs::create_dir_all(&data_dir)?;
    write_idx_fixture(&data_dir, 10, 28)?;

    let mut config = TrainingConfig::default();
    config.data.root = data_dir;
    config.data.batch_size = 4;
    config.data.num_workers = 2;
    config.runtime.num_epochs = 1;
    config.runtime.device = "cpu".to_string();
    config.runtime.log_every_n_steps = 1;
    config.runtime.output_root = tmp.path().to_path_buf();
    config.visualization.enabled = false;
    config.visualization.tensorboard = Some(tmp.path().join("tb"));

    let mut trainer = Trainer::new(config)?;
    trainer.train()?;

    assert_eq!(trainer.phase(), TrainerPhase::Done);
    // 10 images in batches of 4 leave a trailing batch of 2
    assert_eq!(trainer.global_step(), 3);

    let run = trainer.run_name().to_string();
    let names = png_names(trainer.run_dir())?;
    assert!(names.contains(&format!("{}-Epoch_0-C_disc_1.png", run)));
    assert!(names.contains(&format!("Fixed_{}_E-0_Cd-0_Cc-0.png", run)));
    assert!(names.contains(&format!("Fixed_{}_E-0_Cd-0_Cc-1.png", run)));
    assert_eq!(names.len(), 3);

    let events = fs::read_dir(tmp.path().join("tb"))?.count();
    assert_eq!(events, 1);
    Ok(())
}

fn mnist_sweep_png(output_root: &Path, batch_statistics: bool) -> Result<Vec<u8>> {
    let mut config = TrainingConfig::default();
    config.latent.dim_c_cont = 1;
    config.runtime.device = "cpu".to_string();
    config.runtime.output_root = output_root.to_path_buf();
    config.visualization.enabled = false;
    config.visualization.sweep_batch_statistics = batch_statistics;

    let mut trainer = Trainer::new(config)?;
    trainer.test()?;
    let name = format!("Fixed_{}_E-0_Cd-0_Cc-0.png", trainer.run_name());
    Ok(fs::read(trainer.run_dir().join(name))?)
}

#[test]
fn sweep_normalisation_follows_the_configured_statistics() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let running = mnist_sweep_png(&tmp.path().join("running"), false)?;
    let running_again = mnist_sweep_png(&tmp.path().join("running_again"), false)?;
    let batch = mnist_sweep_png(&tmp.path().join("batch"), true)?;

    assert_eq!(running, running_again);
    assert_ne!(running, batch);
    Ok(())
}
