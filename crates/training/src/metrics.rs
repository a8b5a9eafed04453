use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Scalars of one training step, read back from the device.
#[derive(Debug, Clone, PartialEq)]
pub struct StepLosses {
    /// Discriminator objective: real + fake BCE.
    pub loss_d: f64,
    pub loss_d_real: f64,
    pub loss_d_fake: f64,
    /// Generator+recognition objective.
    pub loss_info: f64,
    /// Adversarial part of the generator objective.
    pub loss_gen: f64,
    /// Weighted discrete-code recovery loss.
    pub loss_disc: f64,
    /// Weighted continuous-code recovery loss summed over channels.
    pub loss_cont: f64,
    /// Weighted continuous-code recovery loss per channel.
    pub loss_cont_channels: Vec<f64>,
    /// Mean discriminator probability on real images.
    pub prob_real: f64,
    /// Mean probability on detached fakes during the discriminator step.
    pub prob_fake_d: f64,
    /// Mean probability on fakes during the generator step.
    pub prob_fake_g: f64,
}

#[derive(Debug)]
pub struct TrainingMetrics {
    step_timer: Instant,
    start_time: Instant,
    images_processed: u64,
    loss_d_ema: ExponentialMovingAverage,
    loss_info_ema: ExponentialMovingAverage,
    throughput_ema: ExponentialMovingAverage,
}

impl TrainingMetrics {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            step_timer: now,
            start_time: now,
            images_processed: 0,
            loss_d_ema: ExponentialMovingAverage::new(0.1),
            loss_info_ema: ExponentialMovingAverage::new(0.1),
            throughput_ema: ExponentialMovingAverage::new(0.1),
        }
    }

    pub fn record_step(&mut self, images: u64, losses: &StepLosses) -> StepSnapshot {
        let now = Instant::now();
        let step_duration = now.duration_since(self.step_timer);
        self.step_timer = now;

        self.images_processed = self.images_processed.saturating_add(images);
        let step_images_per_sec = if step_duration > Duration::ZERO {
            images as f64 / step_duration.as_secs_f64()
        } else {
            0.0
        };

        StepSnapshot {
            loss_d: self.loss_d_ema.update(losses.loss_d),
            loss_info: self.loss_info_ema.update(losses.loss_info),
            images,
            step_images_per_sec,
            images_per_sec: self.throughput_ema.update(step_images_per_sec),
            total_images: self.images_processed,
            wall_time: now.duration_since(self.start_time),
            step_duration,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct StepSnapshot {
    /// Smoothed discriminator loss.
    pub loss_d: f64,
    /// Smoothed generator+recognition loss.
    pub loss_info: f64,
    pub images: u64,
    pub step_images_per_sec: f64,
    pub images_per_sec: f64,
    pub total_images: u64,
    pub wall_time: Duration,
    pub step_duration: Duration,
}
