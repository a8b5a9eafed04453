pub mod config;
pub mod data;
pub mod device;
pub mod latent;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod trainer;
pub mod visualize;

pub use config::{ContinuousLossMode, TrainingConfig, TrainingError};
pub use data::{BlockingDataLoader, DataBatch, DataLoader, ImageDataset, InMemoryDataLoader};
pub use device::{select_device, DeviceSpec};
pub use latent::{FixedGrid, LatentSample, LatentSampler};
pub use loss::{InfoLossOutput, Label, LossComposer};
pub use metrics::{StepLosses, TrainingMetrics};
pub use optimizer::{AdamConfig, AdamGroup, OptimizerPartition};
pub use trainer::{Trainer, TrainerPhase};
pub use visualize::{SinkError, VisualEvent, VisualSink, Visualizer};
