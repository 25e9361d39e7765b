use std::{io::Cursor, time::Duration};

use async_trait::async_trait;
use image::{ColorType, ImageFormat, ImageReader};
use thiserror::Error;

use shared::domain::{Dimensions, OutputFormat, ResizeMethod, Rotation};

mod plan;
mod processor;

pub use plan::plan_job;
pub use processor::ImageProcessor;

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("image codec failure: {0}")]
    Codec(#[from] image::ImageError),
    #[error("unrecognized or unsupported image format")]
    UnsupportedFormat,
    #[error("invalid image operation: {0}")]
    InvalidOperation(String),
    #[error("image step exceeded {0:?}")]
    TimedOut(Duration),
    #[error("image worker failed: {0}")]
    Worker(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = ProcessingError> = std::result::Result<T, E>;

/// One pixel operation. Geometry is in absolute pixels.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageOperation {
    Resize {
        width: u32,
        height: u32,
        maintain_aspect_ratio: bool,
        method: ResizeMethod,
    },
    Rotate(Rotation),
    Crop {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },
    Grayscale,
    Invert,
    Blur {
        sigma: f32,
    },
    Brighten {
        amount: i32,
    },
    Contrast {
        amount: f32,
    },
    Unsharpen {
        sigma: f32,
        threshold: i32,
    },
    Flip {
        horizontal: bool,
        vertical: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOutput {
    Export {
        format: OutputFormat,
    },
    Optimize {
        format: OutputFormat,
        level: u8,
        interlace: bool,
        optimize_alpha: bool,
    },
}

impl ImageOutput {
    pub fn format(&self) -> OutputFormat {
        match self {
            Self::Export { format } | Self::Optimize { format, .. } => *format,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImageJob {
    pub source: Vec<u8>,
    pub operations: Vec<ImageOperation>,
    pub output: ImageOutput,
}

#[derive(Debug, Clone)]
pub struct ProcessedImage {
    pub bytes: Vec<u8>,
    pub format: OutputFormat,
    pub width: u32,
    pub height: u32,
}

/// Runs image jobs off the async executor.
#[async_trait]
pub trait ImageWorker: Send + Sync {
    async fn process(&self, job: ImageJob) -> Result<ProcessedImage>;
}

/// Decodes, transforms and encodes on Tokio's blocking pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlockingImageWorker;

#[async_trait]
impl ImageWorker for BlockingImageWorker {
    async fn process(&self, job: ImageJob) -> Result<ProcessedImage> {
        tokio::task::spawn_blocking(move || ImageProcessor::run(job))
            .await
            .map_err(|error| ProcessingError::Worker(error.to_string()))?
    }
}

/// Header facts about an encoded image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageProbe {
    pub format: Option<OutputFormat>,
    pub dimensions: Dimensions,
    pub has_alpha: bool,
    pub color_space: String,
}

pub fn probe(bytes: &[u8]) -> Result<ImageProbe> {
    let reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
    let format = reader.format().ok_or(ProcessingError::UnsupportedFormat)?;
    let image = reader.decode()?;
    let color = image.color();

    Ok(ImageProbe {
        format: output_format(format),
        dimensions: Dimensions {
            width: image.width(),
            height: image.height(),
        },
        has_alpha: color.has_alpha(),
        color_space: color_space(color).to_string(),
    })
}

pub(crate) fn output_format(format: ImageFormat) -> Option<OutputFormat> {
    match format {
        ImageFormat::Png => Some(OutputFormat::Png),
        ImageFormat::Jpeg => Some(OutputFormat::Jpeg),
        ImageFormat::Gif => Some(OutputFormat::Gif),
        ImageFormat::WebP => Some(OutputFormat::Webp),
        ImageFormat::Bmp => Some(OutputFormat::Bmp),
        _ => None,
    }
}

pub(crate) fn image_format(format: OutputFormat) -> ImageFormat {
    match format {
        OutputFormat::Png => ImageFormat::Png,
        OutputFormat::Jpeg => ImageFormat::Jpeg,
        OutputFormat::Gif => ImageFormat::Gif,
        OutputFormat::Webp => ImageFormat::WebP,
        OutputFormat::Bmp => ImageFormat::Bmp,
    }
}

fn color_space(color: ColorType) -> &'static str {
    match color {
        ColorType::L8 | ColorType::L16 | ColorType::La8 | ColorType::La16 => "gray",
        _ => "srgb",
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
