use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::Path,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use log::info;
use prost::Message;

use crate::{
    metrics::{StepLosses, StepSnapshot},
    visualize::{png::encode_png, ImageGrid, SinkError, VisualSink},
    TrainingError,
};

/// Where a step sits in the run, for console output.
#[derive(Debug, Clone, Copy)]
pub struct StepPosition {
    pub epoch: usize,
    pub num_epochs: usize,
    pub step: usize,
    pub steps_per_epoch: usize,
}

/// Console line for one logged step.
pub fn format_step(
    model_name: &str,
    position: StepPosition,
    elapsed: Duration,
    losses: &StepLosses,
) -> String {
    let channels = losses
        .loss_cont_channels
        .iter()
        .map(|value| format!("{:.4}", value))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "[{}] epoch {}/{} step {}/{} elapsed {:.1}s | loss_d {:.4} loss_info {:.4} \
         (gen {:.4} disc {:.4} cont {:.4} [{}]) | prob real {:.3} fake_d {:.3} fake_g {:.3}",
        model_name,
        position.epoch,
        position.num_epochs,
        position.step,
        position.steps_per_epoch,
        elapsed.as_secs_f64(),
        losses.loss_d,
        losses.loss_info,
        losses.loss_gen,
        losses.loss_disc,
        losses.loss_cont,
        channels,
        losses.prob_real,
        losses.prob_fake_d,
        losses.prob_fake_g,
    )
}

pub fn log_step(
    model_name: &str,
    position: StepPosition,
    elapsed: Duration,
    losses: &StepLosses,
    snapshot: &StepSnapshot,
) {
    info!("{}", format_step(model_name, position, elapsed, losses));
    info!(
        "  ema loss_d {:.4} loss_info {:.4} | {:.1} img/s",
        snapshot.loss_d, snapshot.loss_info, snapshot.images_per_sec
    );
}

/// Scalar series emitted for a logged step, named `plot/trace`.
pub fn step_series(losses: &StepLosses) -> Vec<(String, f64)> {
    let mut series = vec![
        ("loss_d/total".to_string(), losses.loss_d),
        ("loss_d/real".to_string(), losses.loss_d_real),
        ("loss_d/fake".to_string(), losses.loss_d_fake),
        ("loss_info/total".to_string(), losses.loss_info),
        ("loss_info/gen".to_string(), losses.loss_gen),
        ("loss_info/disc".to_string(), losses.loss_disc),
        ("loss_info/cont".to_string(), losses.loss_cont),
        ("prob/real".to_string(), losses.prob_real),
        ("prob/fake_d".to_string(), losses.prob_fake_d),
        ("prob/fake_g".to_string(), losses.prob_fake_g),
    ];
    for (channel, value) in losses.loss_cont_channels.iter().enumerate() {
        series.push((format!("loss_cont/c{}", channel), *value));
    }
    series
}

/// TensorBoard event file sink: scalars as simple values, grids as PNG
/// image summaries.
pub struct TensorBoardSink {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardSink {
    pub fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    fn write_value(&mut self, step: i64, value: summary::Value) -> Result<(), SinkError> {
        let event = Event {
            wall_time: current_wall_time(),
            step,
            summary: Some(Summary { value: vec![value] }),
        };
        self.write_event(&event)
    }

    fn write_event(&mut self, event: &Event) -> Result<(), SinkError> {
        let mut buffer = BytesMut::with_capacity(event.encoded_len());
        event
            .encode(&mut buffer)
            .map_err(|err| SinkError::Encode(format!("tensorboard event: {err}")))?;
        let data = buffer.freeze();

        let len_bytes = (data.len() as u64).to_le_bytes();
        self.writer.write_all(&len_bytes)?;
        self.writer.write_all(&masked_crc32(&len_bytes).to_le_bytes())?;
        self.writer.write_all(&data)?;
        self.writer.write_all(&masked_crc32(&data).to_le_bytes())?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            VisualSink::flush(self)?;
        }
        Ok(())
    }
}

impl VisualSink for TensorBoardSink {
    fn name(&self) -> &str {
        "tensorboard"
    }

    fn scalar(&mut self, series: &str, step: u64, value: f64) -> Result<(), SinkError> {
        self.write_value(
            step as i64,
            summary::Value {
                tag: series.to_string(),
                simple_value: Some(value as f32),
                image: None,
            },
        )
    }

    fn image(&mut self, name: &str, _caption: &str, grid: &ImageGrid) -> Result<(), SinkError> {
        let encoded = encode_png(grid)?;
        self.write_value(
            0,
            summary::Value {
                tag: name.to_string(),
                simple_value: None,
                image: Some(summary::Image {
                    height: grid.height as i32,
                    width: grid.width as i32,
                    colorspace: grid.channels as i32,
                    encoded_image_string: encoded,
                }),
            },
        )
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardSink {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
        #[prost(message, optional, tag = "4")]
        pub image: Option<Image>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct Image {
        #[prost(int32, tag = "1")]
        pub height: i32,
        #[prost(int32, tag = "2")]
        pub width: i32,
        #[prost(int32, tag = "3")]
        pub colorspace: i32,
        #[prost(bytes = "vec", tag = "4")]
        pub encoded_image_string: Vec<u8>,
    }
}
