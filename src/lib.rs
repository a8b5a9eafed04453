//! InfoGAN on candle.
//!
//! `layers` holds the parameter-owning building blocks, `model` the MNIST
//! generator and discriminator/recognizer, `training` the latent sampler,
//! loss composition, optimizer partition and the epoch loop.

pub use layers;
pub use model;
pub use training;

pub use model::{
    DiscriminatorHead, DiscriminatorNet, DiscriminatorOutput, GeneratorNet, ImageShape,
    LatentLayout, ModelConfig,
};
pub use training::{Trainer, TrainerPhase, TrainingConfig, TrainingError};

use candle_core::Device;
use log::info;
use training::{select_device, DeviceSpec};

/// Picks Metal, then CUDA, then the CPU. `CANDLE_FORCE_CPU` pins the CPU.
pub fn setup_device() -> Result<Device, TrainingError> {
    select_device(DeviceSpec::Auto)
}

pub fn check_available_backends() {
    info!(
        "system: os={} arch={} family={}",
        std::env::consts::OS,
        std::env::consts::ARCH,
        std::env::consts::FAMILY
    );
    info!(
        "backends: cuda={} metal={}",
        candle_core::utils::cuda_is_available(),
        candle_core::utils::metal_is_available()
    );
}
