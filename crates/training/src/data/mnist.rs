//! MNIST in the IDX format: big-endian `u32` header fields followed by raw
//! `u8` payload. Images use magic `2051` (`count, rows, cols`), labels `2049`
//! (`count`).

use std::{
    fs,
    path::{Path, PathBuf},
};

use log::info;
use model::ImageShape;

use super::{ImageDataset, Result};
use crate::TrainingError;

const IMAGE_MAGIC: u32 = 2051;
const LABEL_MAGIC: u32 = 2049;

const IMAGE_FILES: &[&str] = &["train-images-idx3-ubyte", "train-images.idx3-ubyte"];
const LABEL_FILES: &[&str] = &["train-labels-idx1-ubyte", "train-labels.idx1-ubyte"];

/// Loads the MNIST training split found under `root` (or `root/MNIST/raw`).
pub fn load_training_set(root: &Path) -> Result<ImageDataset> {
    let images_path = locate(root, IMAGE_FILES)?;
    let labels_path = locate(root, LABEL_FILES)?;
    let dataset = read_idx_pair(&images_path, &labels_path)?;
    info!(
        "loaded {} mnist images from {}",
        dataset.len(),
        images_path.display()
    );
    Ok(dataset)
}

/// Reads an image file and its label file into a dataset with pixels in
/// `[-1, 1]`.
pub fn read_idx_pair(images_path: &Path, labels_path: &Path) -> Result<ImageDataset> {
    let (shape, count, pixels) = parse_images(&fs::read(images_path)?)?;
    let labels = parse_labels(&fs::read(labels_path)?)?;
    if labels.len() != count {
        return Err(TrainingError::shape(format!(
            "{} holds {} labels but {} holds {} images",
            labels_path.display(),
            labels.len(),
            images_path.display(),
            count
        )));
    }
    ImageDataset::new(shape, pixels, Some(labels))
}

fn locate(root: &Path, names: &[&str]) -> Result<PathBuf> {
    let dirs = [root.to_path_buf(), root.join("MNIST").join("raw")];
    dirs.iter()
        .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
        .find(|path| path.is_file())
        .ok_or_else(|| {
            TrainingError::initialization(format!(
                "could not find {} under {}",
                names[0],
                root.display()
            ))
        })
}

fn read_be_u32(data: &[u8], offset: &mut usize) -> Result<u32> {
    let bytes = data
        .get(*offset..*offset + 4)
        .ok_or_else(|| TrainingError::initialization("idx header is truncated"))?;
    *offset += 4;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn parse_images(data: &[u8]) -> Result<(ImageShape, usize, Vec<f32>)> {
    let mut offset = 0usize;
    let magic = read_be_u32(data, &mut offset)?;
    if magic != IMAGE_MAGIC {
        return Err(TrainingError::initialization(format!(
            "expected idx image magic {}, found {}",
            IMAGE_MAGIC, magic
        )));
    }
    let count = read_be_u32(data, &mut offset)? as usize;
    let rows = read_be_u32(data, &mut offset)? as usize;
    let cols = read_be_u32(data, &mut offset)? as usize;

    let total = count * rows * cols;
    let payload = data
        .get(offset..offset + total)
        .ok_or_else(|| TrainingError::initialization("idx image file is truncated"))?;
    let pixels = payload
        .iter()
        .map(|&byte| byte as f32 / 127.5 - 1.0)
        .collect();
    Ok((ImageShape::new(1, rows, cols), count, pixels))
}

fn parse_labels(data: &[u8]) -> Result<Vec<u8>> {
    let mut offset = 0usize;
    let magic = read_be_u32(data, &mut offset)?;
    if magic != LABEL_MAGIC {
        return Err(TrainingError::initialization(format!(
            "expected idx label magic {}, found {}",
            LABEL_MAGIC, magic
        )));
    }
    let count = read_be_u32(data, &mut offset)? as usize;
    data.get(offset..offset + count)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| TrainingError::initialization("idx label file is truncated"))
}
