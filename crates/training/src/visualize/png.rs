use std::{
    fs,
    path::{Path, PathBuf},
};

use image::{codecs::png::PngEncoder, ExtendedColorType, ImageEncoder};

use super::{ImageGrid, SinkError, VisualSink};

/// Encodes a grid as PNG bytes.
pub fn encode_png(grid: &ImageGrid) -> Result<Vec<u8>, SinkError> {
    let color = match grid.channels {
        1 => ExtendedColorType::L8,
        3 => ExtendedColorType::Rgb8,
        other => {
            return Err(SinkError::Encode(format!(
                "unsupported channel count {}",
                other
            )))
        }
    };
    let mut bytes = Vec::new();
    PngEncoder::new(&mut bytes)
        .write_image(&grid.pixels, grid.width, grid.height, color)
        .map_err(|err| SinkError::Encode(err.to_string()))?;
    Ok(bytes)
}

/// Writes every image event to `<dir>/<name>.png`; scalars are ignored.
pub struct PngDirectorySink {
    dir: PathBuf,
}

impl PngDirectorySink {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.png", name))
    }
}

impl VisualSink for PngDirectorySink {
    fn name(&self) -> &str {
        "png"
    }

    fn scalar(&mut self, _series: &str, _step: u64, _value: f64) -> Result<(), SinkError> {
        Ok(())
    }

    fn image(&mut self, name: &str, _caption: &str, grid: &ImageGrid) -> Result<(), SinkError> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.path_for(name), encode_png(grid)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_decodable_png() -> Result<(), SinkError> {
        let dir = tempfile::tempdir()?;
        let mut sink = PngDirectorySink::new(dir.path().join("run"));
        let grid = ImageGrid {
            width: 3,
            height: 2,
            channels: 1,
            pixels: vec![0, 64, 128, 192, 255, 7],
        };
        sink.image("Fixed_run_E-1_Cd-0_Cc-1", "sweep", &grid)?;

        let path = sink.path_for("Fixed_run_E-1_Cd-0_Cc-1");
        let decoded = image::open(&path)
            .map_err(|err| SinkError::Encode(err.to_string()))?
            .to_luma8();
        assert_eq!(decoded.dimensions(), (3, 2));
        assert_eq!(decoded.into_raw(), grid.pixels);
        Ok(())
    }

    #[test]
    fn png_signature_is_present() -> Result<(), SinkError> {
        let grid = ImageGrid {
            width: 1,
            height: 1,
            channels: 3,
            pixels: vec![1, 2, 3],
        };
        let bytes = encode_png(&grid)?;
        assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");
        Ok(())
    }
}
