use layers::InitScheme;
use model::{ImageShape, LatentLayout, ModelConfig};
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use crate::device::DeviceSpec;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub latent: LatentConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub loss: LossConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub visualization: VisualizationConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if let Err(err) = self.latent.layout().validate() {
            errors.push(format!("latent: {}", err));
        }

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }

        if self.data.data_dim == 0 || self.data.data_dim % 4 != 0 {
            errors.push(format!(
                "data.data_dim must be a positive multiple of 4 (got {})",
                self.data.data_dim
            ));
        }

        if self.data.dataset.trim().is_empty() {
            errors.push("data.dataset must not be empty".to_string());
        }

        if self.optimizer.generator_lr <= 0.0 {
            errors.push("optimizer.generator_lr must be greater than 0".to_string());
        }

        if self.optimizer.discriminator_lr <= 0.0 {
            errors.push("optimizer.discriminator_lr must be greater than 0".to_string());
        }

        if !(0.0..1.0).contains(&self.optimizer.beta1) {
            errors.push("optimizer.beta1 must be in [0, 1)".to_string());
        }

        if !(0.0..1.0).contains(&self.optimizer.beta2) {
            errors.push("optimizer.beta2 must be in [0, 1)".to_string());
        }

        if self.optimizer.epsilon <= 0.0 {
            errors.push("optimizer.epsilon must be greater than 0".to_string());
        }

        if self.loss.lambda_disc < 0.0 || !self.loss.lambda_disc.is_finite() {
            errors.push("loss.lambda_disc must be a finite value >= 0".to_string());
        }

        if self.loss.lambda_cont < 0.0 || !self.loss.lambda_cont.is_finite() {
            errors.push("loss.lambda_cont must be a finite value >= 0".to_string());
        }

        if self.runtime.num_epochs == 0 {
            errors.push("runtime.num_epochs must be greater than 0".to_string());
        }

        if self.runtime.log_every_n_steps == 0 {
            errors.push("runtime.log_every_n_steps must be greater than 0".to_string());
        }

        if self.runtime.sweep_every_n_epochs == 0 {
            errors.push("runtime.sweep_every_n_epochs must be greater than 0".to_string());
        }

        if self.runtime.model_name.trim().is_empty() {
            errors.push("runtime.model_name must not be empty".to_string());
        }

        if let Err(err) = self.runtime.device.parse::<DeviceSpec>() {
            errors.push(format!("runtime.device: {}", err));
        }

        if self.visualization.max_sink_failures == 0 {
            errors.push("visualization.max_sink_failures must be greater than 0".to_string());
        }

        if self.visualization.enabled && self.visualization.server.trim().is_empty() {
            errors.push("visualization.server must not be empty when enabled".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    /// Network geometry implied by the latent and data sections.
    pub fn model_config(&self) -> ModelConfig {
        ModelConfig::new(self.latent.layout(), self.data.image_shape())
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.data.root, base);
        absolutize_in_place(&mut self.runtime.output_root, base);
        if let Some(dir) = self.visualization.tensorboard.as_mut() {
            absolutize_in_place(dir, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatentConfig {
    #[serde(default = "default_dim_z")]
    pub dim_z: usize,
    #[serde(default = "default_n_c_disc")]
    pub n_c_disc: usize,
    #[serde(default = "default_dim_c_disc")]
    pub dim_c_disc: usize,
    #[serde(default = "default_dim_c_cont")]
    pub dim_c_cont: usize,
}

impl LatentConfig {
    pub fn layout(&self) -> LatentLayout {
        LatentLayout::new(self.dim_z, self.n_c_disc, self.dim_c_disc, self.dim_c_cont)
    }
}

impl Default for LatentConfig {
    fn default() -> Self {
        Self {
            dim_z: default_dim_z(),
            n_c_disc: default_n_c_disc(),
            dim_c_disc: default_dim_c_disc(),
            dim_c_cont: default_dim_c_cont(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_dataset")]
    pub dataset: String,
    #[serde(default = "default_data_root")]
    pub root: PathBuf,
    /// Side length of the square input images.
    #[serde(default = "default_data_dim")]
    pub data_dim: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    #[serde(default = "default_true")]
    pub shuffle: bool,
}

impl DataConfig {
    pub fn image_shape(&self) -> ImageShape {
        ImageShape::grayscale(self.data_dim)
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dataset: default_dataset(),
            root: default_data_root(),
            data_dim: default_data_dim(),
            batch_size: default_batch_size(),
            num_workers: default_num_workers(),
            shuffle: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Optimizer kind; only `adam` is implemented.
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    #[serde(default = "default_generator_lr")]
    pub generator_lr: f64,
    #[serde(default = "default_discriminator_lr")]
    pub discriminator_lr: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            generator_lr: default_generator_lr(),
            discriminator_lr: default_discriminator_lr(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossConfig {
    #[serde(default = "default_lambda_disc")]
    pub lambda_disc: f64,
    #[serde(default = "default_lambda_cont")]
    pub lambda_cont: f64,
    #[serde(default)]
    pub continuous_mode: ContinuousLossMode,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            lambda_disc: default_lambda_disc(),
            lambda_cont: default_lambda_cont(),
            continuous_mode: ContinuousLossMode::default(),
        }
    }
}

/// How the recovered continuous code is scored against the sampled one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuousLossMode {
    /// Squared error against the predicted mean; the variance head is idle.
    Mse,
    /// Gaussian negative log-likelihood using the predicted mean and variance;
    /// the variance head joins the generator-objective group.
    GaussianNll,
}

impl Default for ContinuousLossMode {
    fn default() -> Self {
        Self::Mse
    }
}

/// Weight initialisation applied to both networks after construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitKind {
    Normal,
    Default,
}

impl Default for InitKind {
    fn default() -> Self {
        Self::Normal
    }
}

impl From<InitKind> for InitScheme {
    fn from(kind: InitKind) -> Self {
        match kind {
            InitKind::Normal => InitScheme::normal(),
            InitKind::Default => InitScheme::Default,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_true")]
    pub is_train: bool,
    #[serde(default = "default_num_epochs")]
    pub num_epochs: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_log_every_n_steps")]
    pub log_every_n_steps: usize,
    #[serde(default = "default_sweep_every_n_epochs")]
    pub sweep_every_n_epochs: usize,
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,
    #[serde(default = "default_model_name")]
    pub model_name: String,
    #[serde(default = "default_true")]
    pub detect_anomaly: bool,
    #[serde(default)]
    pub init: InitKind,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            is_train: true,
            num_epochs: default_num_epochs(),
            seed: default_seed(),
            device: default_device(),
            log_every_n_steps: default_log_every_n_steps(),
            sweep_every_n_epochs: default_sweep_every_n_epochs(),
            output_root: default_output_root(),
            model_name: default_model_name(),
            detect_anomaly: true,
            init: InitKind::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualizationConfig {
    /// Enables the live visdom sink.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_server")]
    pub server: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_env")]
    pub env: String,
    /// Directory for TensorBoard event files.
    #[serde(default)]
    pub tensorboard: Option<PathBuf>,
    /// Writes image grids as PNG files under the run directory.
    #[serde(default = "default_true")]
    pub save_images: bool,
    #[serde(default = "default_max_sink_failures")]
    pub max_sink_failures: usize,
    /// Runs the sweep generator on batch statistics instead of the running
    /// averages. Batch-norm running averages are updated as a side effect.
    #[serde(default)]
    pub sweep_batch_statistics: bool,
}

impl Default for VisualizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            server: default_server(),
            port: default_port(),
            env: default_env(),
            tensorboard: None,
            save_images: true,
            max_sink_failures: default_max_sink_failures(),
            sweep_batch_statistics: false,
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_true() -> bool {
    true
}

fn default_dim_z() -> usize {
    62
}

fn default_n_c_disc() -> usize {
    1
}

fn default_dim_c_disc() -> usize {
    10
}

fn default_dim_c_cont() -> usize {
    2
}

fn default_dataset() -> String {
    "mnist".to_string()
}

fn default_data_root() -> PathBuf {
    PathBuf::from("data/mnist")
}

fn default_data_dim() -> usize {
    28
}

fn default_batch_size() -> usize {
    128
}

fn default_num_workers() -> usize {
    12
}

fn default_generator_lr() -> f64 {
    1e-3
}

fn default_discriminator_lr() -> f64 {
    2e-4
}

fn default_beta1() -> f64 {
    0.5
}

fn default_beta2() -> f64 {
    0.999
}

fn default_algorithm() -> String {
    "adam".to_string()
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_lambda_disc() -> f64 {
    1.0
}

fn default_lambda_cont() -> f64 {
    0.1
}

fn default_num_epochs() -> usize {
    20
}

fn default_seed() -> u64 {
    42
}

fn default_device() -> String {
    "auto".to_string()
}

fn default_log_every_n_steps() -> usize {
    10
}

fn default_sweep_every_n_epochs() -> usize {
    1
}

fn default_output_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_model_name() -> String {
    "Vanila_InfoGAN".to_string()
}

fn default_server() -> String {
    "http://localhost".to_string()
}

fn default_port() -> u16 {
    8097
}

fn default_env() -> String {
    "main".to_string()
}

fn default_max_sink_failures() -> usize {
    3
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Unsupported(String),
    Shape(String),
    Anomaly { stage: String, detail: String },
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported(message.into())
    }

    pub fn shape(message: impl Into<String>) -> Self {
        Self::Shape(message.into())
    }

    pub fn anomaly(stage: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Anomaly {
            stage: stage.into(),
            detail: detail.into(),
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "i/o error: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::Unsupported(msg) => write!(f, "not implemented: {}", msg),
            TrainingError::Shape(msg) => write!(f, "shape mismatch: {}", msg),
            TrainingError::Anomaly { stage, detail } => {
                write!(f, "numerical anomaly during {}: {}", stage, detail)
            }
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}
