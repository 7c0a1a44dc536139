use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use exposureconfig::ExportFormat;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat, RgbaImage};

const FILE_PREFIX: &str = "LONGEXP";

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Context for a single export.
#[derive(Debug, Clone)]
pub struct ExportHint {
    pub taken_at: DateTime<Local>,
}

impl ExportHint {
    pub fn now() -> Self {
        Self {
            taken_at: Local::now(),
        }
    }
}

/// Persists a finished exposure somewhere and reports where.
pub trait ImageExporter: Send {
    fn export(&mut self, image: &RgbaImage, hint: &ExportHint) -> Result<PathBuf, ExportError>;
}

/// Writes `LONGEXP_<yyyyMMddHHmmss>_<n>.<ext>` files into one directory.
#[derive(Debug, Clone)]
pub struct FileExporter {
    directory: PathBuf,
    format: ExportFormat,
    quality: u8,
}

impl FileExporter {
    pub fn new(directory: impl Into<PathBuf>, format: ExportFormat, quality: u8) -> Self {
        Self {
            directory: directory.into(),
            format,
            quality: quality.clamp(1, 100),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// First unused name for `hint`, counting `n` up from 1.
    fn next_path(&self, hint: &ExportHint) -> PathBuf {
        let stamp = hint.taken_at.format("%Y%m%d%H%M%S");
        let extension = self.format.extension();
        let mut sequence = 1u32;
        loop {
            let candidate = self
                .directory
                .join(format!("{FILE_PREFIX}_{stamp}_{sequence}.{extension}"));
            if !candidate.exists() {
                return candidate;
            }
            sequence += 1;
        }
    }

    fn write(&self, image: &RgbaImage, path: &Path) -> Result<(), ExportError> {
        let encode_err = |source| ExportError::Encode {
            path: path.to_path_buf(),
            source,
        };
        let io_err = |source| ExportError::Io {
            path: path.to_path_buf(),
            source,
        };
        match self.format {
            ExportFormat::Jpeg => {
                let file = File::create(path).map_err(io_err)?;
                // JPEG carries no alpha channel.
                let rgb = DynamicImage::ImageRgba8(image.clone()).into_rgb8();
                let mut writer = BufWriter::new(file);
                JpegEncoder::new_with_quality(&mut writer, self.quality)
                    .encode_image(&rgb)
                    .map_err(encode_err)?;
                writer.flush().map_err(io_err)
            }
            ExportFormat::Png => image
                .save_with_format(path, ImageFormat::Png)
                .map_err(encode_err),
        }
    }
}

impl ImageExporter for FileExporter {
    fn export(&mut self, image: &RgbaImage, hint: &ExportHint) -> Result<PathBuf, ExportError> {
        fs::create_dir_all(&self.directory).map_err(|source| ExportError::Io {
            path: self.directory.clone(),
            source,
        })?;
        let path = self.next_path(hint);
        self.write(image, &path)?;
        tracing::info!(
            path = %path.display(),
            width = image.width(),
            height = image.height(),
            "still exported"
        );
        Ok(path)
    }
}
