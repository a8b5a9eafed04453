pub mod mnist;

use std::{sync::Arc, thread};

use candle_core::{Device, Tensor};
use futures::{channel::mpsc, future::BoxFuture, SinkExt, StreamExt};
use log::debug;
use model::ImageShape;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::{config::DataConfig, TrainingError};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// Batch returned by dataset loaders.
#[derive(Debug)]
pub struct DataBatch {
    /// Images shaped `(batch, channels, height, width)` on the training device.
    pub images: Tensor,
    pub labels: Option<Vec<u8>>,
    pub batch_size: usize,
    /// Zero-based index of the batch within its epoch.
    pub step: usize,
    pub epoch: usize,
}

/// Asynchronous-compatible loader abstraction.
pub trait DataLoader: Send {
    fn image_shape(&self) -> ImageShape;

    fn batches_per_epoch(&self) -> usize;

    /// Rewinds the loader to the first batch of `epoch`.
    fn start_epoch(&mut self, epoch: usize) -> Result<()>;

    /// Next batch of the current epoch, `None` once it is exhausted.
    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<DataBatch>>>;
}

impl<L: DataLoader + ?Sized> DataLoader for Box<L> {
    fn image_shape(&self) -> ImageShape {
        (**self).image_shape()
    }

    fn batches_per_epoch(&self) -> usize {
        (**self).batches_per_epoch()
    }

    fn start_epoch(&mut self, epoch: usize) -> Result<()> {
        (**self).start_epoch(epoch)
    }

    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<DataBatch>>> {
        (**self).next_batch()
    }
}

/// Blocking adapter around an async-friendly loader.
pub struct BlockingDataLoader<L>
where
    L: DataLoader,
{
    inner: L,
}

impl<L> BlockingDataLoader<L>
where
    L: DataLoader,
{
    pub fn new(inner: L) -> Self {
        Self { inner }
    }

    pub fn image_shape(&self) -> ImageShape {
        self.inner.image_shape()
    }

    pub fn batches_per_epoch(&self) -> usize {
        self.inner.batches_per_epoch()
    }

    pub fn start_epoch(&mut self, epoch: usize) -> Result<()> {
        self.inner.start_epoch(epoch)
    }

    pub fn next_batch(&mut self) -> Result<Option<DataBatch>> {
        futures::executor::block_on(self.inner.next_batch())
    }

    pub fn into_inner(self) -> L {
        self.inner
    }
}

/// Host-resident image collection with pixels stored as `f32`.
#[derive(Debug, Clone)]
pub struct ImageDataset {
    shape: ImageShape,
    pixels: Vec<f32>,
    labels: Option<Vec<u8>>,
}

impl ImageDataset {
    pub fn new(shape: ImageShape, pixels: Vec<f32>, labels: Option<Vec<u8>>) -> Result<Self> {
        let per_image = shape.pixels();
        if per_image == 0 || pixels.len() % per_image != 0 {
            return Err(TrainingError::shape(format!(
                "{} pixels do not divide into images of shape {:?}",
                pixels.len(),
                shape
            )));
        }
        let len = pixels.len() / per_image;
        if let Some(labels) = &labels {
            if labels.len() != len {
                return Err(TrainingError::shape(format!(
                    "{} labels for {} images",
                    labels.len(),
                    len
                )));
            }
        }
        Ok(Self {
            shape,
            pixels,
            labels,
        })
    }

    pub fn shape(&self) -> ImageShape {
        self.shape
    }

    pub fn len(&self) -> usize {
        self.pixels.len() / self.shape.pixels()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    pub fn image(&self, index: usize) -> &[f32] {
        let per_image = self.shape.pixels();
        &self.pixels[index * per_image..(index + 1) * per_image]
    }

    pub fn label(&self, index: usize) -> Option<u8> {
        self.labels.as_ref().map(|labels| labels[index])
    }

    fn gather(&self, indices: &[usize]) -> HostBatch {
        let mut pixels = Vec::with_capacity(indices.len() * self.shape.pixels());
        for &index in indices {
            pixels.extend_from_slice(self.image(index));
        }
        HostBatch {
            pixels,
            labels: self
                .labels
                .as_ref()
                .map(|labels| indices.iter().map(|&index| labels[index]).collect()),
            len: indices.len(),
        }
    }
}

/// Batch assembled on the host, before upload to the device.
struct HostBatch {
    pixels: Vec<f32>,
    labels: Option<Vec<u8>>,
    len: usize,
}

/// Shuffling loader over an [`ImageDataset`] held in memory.
///
/// The trailing partial batch of every epoch is kept. With `num_workers > 0`
/// a background thread assembles host batches ahead of the training loop,
/// bounded to `num_workers` batches in flight.
pub struct InMemoryDataLoader {
    dataset: Arc<ImageDataset>,
    device: Device,
    batch_size: usize,
    shuffle: bool,
    num_workers: usize,
    seed: u64,
    epoch: usize,
    order: Arc<Vec<usize>>,
    cursor: usize,
    step: usize,
    prefetch: Option<mpsc::Receiver<HostBatch>>,
}

impl InMemoryDataLoader {
    pub fn new(
        dataset: ImageDataset,
        batch_size: usize,
        shuffle: bool,
        num_workers: usize,
        seed: u64,
        device: Device,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }
        if dataset.is_empty() {
            return Err(TrainingError::initialization(
                "training dataset is empty; no images available",
            ));
        }
        let order = Arc::new((0..dataset.len()).collect());
        Ok(Self {
            dataset: Arc::new(dataset),
            device,
            batch_size,
            shuffle,
            num_workers,
            seed,
            epoch: 0,
            order,
            cursor: 0,
            step: 0,
            prefetch: None,
        })
    }

    fn spawn_prefetch(&mut self) {
        let (mut tx, rx) = mpsc::channel(self.num_workers.max(1));
        let dataset = Arc::clone(&self.dataset);
        let order = Arc::clone(&self.order);
        let batch_size = self.batch_size;
        thread::spawn(move || {
            for chunk in order.chunks(batch_size) {
                let batch = dataset.gather(chunk);
                if futures::executor::block_on(tx.send(batch)).is_err() {
                    // receiver dropped: epoch restarted or loader gone
                    break;
                }
            }
        });
        self.prefetch = Some(rx);
    }

    fn upload(&self, host: HostBatch, step: usize) -> Result<DataBatch> {
        let dims = self.dataset.shape().batch_dims(host.len);
        let images = Tensor::from_vec(host.pixels, &dims, &self.device).map_err(|err| {
            TrainingError::runtime(format!("failed to materialize image batch: {}", err))
        })?;
        Ok(DataBatch {
            images,
            labels: host.labels,
            batch_size: host.len,
            step,
            epoch: self.epoch,
        })
    }

    async fn next_host_batch(&mut self) -> Option<HostBatch> {
        if let Some(rx) = self.prefetch.as_mut() {
            return rx.next().await;
        }
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let batch = self.dataset.gather(&self.order[self.cursor..end]);
        self.cursor = end;
        Some(batch)
    }
}

impl DataLoader for InMemoryDataLoader {
    fn image_shape(&self) -> ImageShape {
        self.dataset.shape()
    }

    fn batches_per_epoch(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    fn start_epoch(&mut self, epoch: usize) -> Result<()> {
        self.prefetch = None;
        self.epoch = epoch;
        self.cursor = 0;
        self.step = 0;
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        self.order = Arc::new(order);
        if self.num_workers > 0 {
            self.spawn_prefetch();
        }
        debug!("epoch {} prepared: {} batches", epoch, self.batches_per_epoch());
        Ok(())
    }

    fn next_batch(&mut self) -> BoxFuture<'_, Result<Option<DataBatch>>> {
        Box::pin(async move {
            let Some(host) = self.next_host_batch().await else {
                return Ok(None);
            };
            let step = self.step;
            self.step += 1;
            self.upload(host, step).map(Some)
        })
    }
}

/// Builds the loader named by `config.dataset`.
pub fn build_data_loader(
    config: &DataConfig,
    seed: u64,
    device: &Device,
) -> Result<InMemoryDataLoader> {
    let dataset = match config.dataset.to_ascii_lowercase().as_str() {
        "mnist" => mnist::load_training_set(&config.root)?,
        other => {
            return Err(TrainingError::unsupported(format!(
                "dataset '{}' (only 'mnist' is available)",
                other
            )))
        }
    };
    if dataset.shape() != config.image_shape() {
        return Err(TrainingError::shape(format!(
            "dataset images are {:?} but data.data_dim expects {:?}",
            dataset.shape(),
            config.image_shape()
        )));
    }
    InMemoryDataLoader::new(
        dataset,
        config.batch_size,
        config.shuffle,
        config.num_workers,
        seed,
        device.clone(),
    )
}
