//! Typed visualization events and the sinks that display or persist them.
//!
//! The training loop only produces [`VisualEvent`]s into a channel. The
//! [`Visualizer`] drains that channel at step and epoch boundaries and hands
//! every event to each registered [`VisualSink`]. Sink failures are logged and
//! counted, never returned to the loop; a sink that keeps failing is switched
//! off so training continues with console logging alone.

pub mod grid;
pub mod png;
pub mod visdom;

use std::{
    path::Path,
    sync::mpsc::{self, Receiver, Sender},
};

use log::{debug, warn};

use crate::{config::VisualizationConfig, logging::TensorBoardSink};

pub use grid::{make_grid, ImageGrid, GRID_NROW, GRID_PADDING};
pub use png::PngDirectorySink;
pub use visdom::VisdomSink;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode image: {0}")]
    Encode(String),

    #[error("http error: {message}")]
    Http { message: String },

    #[error("server answered with status {status}")]
    Status { status: u16 },
}

/// One update for the display sinks.
#[derive(Debug, Clone)]
pub enum VisualEvent {
    /// Point of a scalar series. Series names read `plot/trace`; sinks that
    /// group traces into plots split on the first `/`.
    Scalar {
        series: String,
        step: u64,
        value: f64,
    },
    /// A rendered grid. `name` doubles as the file stem and window key.
    Image {
        name: String,
        caption: String,
        grid: ImageGrid,
    },
}

pub trait VisualSink: Send {
    fn name(&self) -> &str;

    fn scalar(&mut self, series: &str, step: u64, value: f64) -> Result<(), SinkError>;

    fn image(&mut self, name: &str, caption: &str, grid: &ImageGrid) -> Result<(), SinkError>;

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

struct SinkSlot {
    sink: Box<dyn VisualSink>,
    consecutive_failures: usize,
    disabled: bool,
}

impl SinkSlot {
    fn record(&mut self, result: Result<(), SinkError>, max_failures: usize) {
        match result {
            Ok(()) => self.consecutive_failures = 0,
            Err(err) => {
                self.consecutive_failures += 1;
                warn!(
                    "visualization sink '{}' failed ({}/{}): {}",
                    self.sink.name(),
                    self.consecutive_failures,
                    max_failures,
                    err
                );
                if self.consecutive_failures >= max_failures {
                    warn!(
                        "disabling visualization sink '{}' for the rest of the run",
                        self.sink.name()
                    );
                    self.disabled = true;
                }
            }
        }
    }
}

pub struct Visualizer {
    sender: Sender<VisualEvent>,
    receiver: Receiver<VisualEvent>,
    sinks: Vec<SinkSlot>,
    max_failures: usize,
}

impl Visualizer {
    pub fn new(max_failures: usize) -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            sender,
            receiver,
            sinks: Vec::new(),
            max_failures: max_failures.max(1),
        }
    }

    /// Registers the sinks `config` enables. Sinks that cannot be created are
    /// skipped with a warning.
    pub fn from_config(config: &VisualizationConfig, run_dir: &Path) -> Self {
        let mut visualizer = Self::new(config.max_sink_failures);
        if config.save_images {
            visualizer.add_sink(PngDirectorySink::new(run_dir));
        }
        if let Some(dir) = config.tensorboard.as_ref() {
            match TensorBoardSink::create(dir, 20) {
                Ok(sink) => visualizer.add_sink(sink),
                Err(err) => warn!("tensorboard output disabled: {}", err),
            }
        }
        if config.enabled {
            match VisdomSink::new(&config.server, config.port, &config.env) {
                Ok(sink) => visualizer.add_sink(sink),
                Err(err) => warn!("visdom output disabled: {}", err),
            }
        }
        visualizer
    }

    pub fn add_sink(&mut self, sink: impl VisualSink + 'static) {
        self.sinks.push(SinkSlot {
            sink: Box::new(sink),
            consecutive_failures: 0,
            disabled: false,
        });
    }

    /// A producer handle for the event channel.
    pub fn sender(&self) -> Sender<VisualEvent> {
        self.sender.clone()
    }

    pub fn scalar(&self, series: impl Into<String>, step: u64, value: f64) {
        self.send(VisualEvent::Scalar {
            series: series.into(),
            step,
            value,
        });
    }

    pub fn image(&self, name: impl Into<String>, caption: impl Into<String>, grid: ImageGrid) {
        self.send(VisualEvent::Image {
            name: name.into(),
            caption: caption.into(),
            grid,
        });
    }

    fn send(&self, event: VisualEvent) {
        if let Err(err) = self.sender.send(event) {
            debug!("visual event dropped: {}", err);
        }
    }

    /// Names of sinks that are still enabled.
    pub fn active_sinks(&self) -> Vec<&str> {
        self.sinks
            .iter()
            .filter(|slot| !slot.disabled)
            .map(|slot| slot.sink.name())
            .collect()
    }

    /// Delivers every queued event to every enabled sink. Returns the number
    /// of events drained.
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        while let Ok(event) = self.receiver.try_recv() {
            drained += 1;
            for slot in self.sinks.iter_mut().filter(|slot| !slot.disabled) {
                let result = match &event {
                    VisualEvent::Scalar {
                        series,
                        step,
                        value,
                    } => slot.sink.scalar(series, *step, *value),
                    VisualEvent::Image {
                        name,
                        caption,
                        grid,
                    } => slot.sink.image(name, caption, grid),
                };
                slot.record(result, self.max_failures);
            }
        }
        if drained > 0 {
            debug!("delivered {} visualization events", drained);
        }
        drained
    }

    /// Drains pending events, then flushes every enabled sink.
    pub fn flush(&mut self) {
        self.drain();
        let max_failures = self.max_failures;
        for slot in self.sinks.iter_mut().filter(|slot| !slot.disabled) {
            let result = slot.sink.flush();
            slot.record(result, max_failures);
        }
    }
}
