use std::io::Cursor;

use image::{
    codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder},
    imageops::FilterType,
    DynamicImage, ImageReader,
};
use tracing::debug;

use shared::domain::{OutputFormat, ResizeMethod, Rotation};

use crate::{
    image_format, output_format, ImageJob, ImageOperation, ImageOutput, ProcessedImage,
    ProcessingError, Result,
};

/// Synchronous decode, transform and encode of a single image.
#[derive(Debug, Clone)]
pub struct ImageProcessor {
    image: DynamicImage,
    source_format: Option<OutputFormat>,
}

impl ImageProcessor {
    /// Guesses the format from the bytes and decodes them.
    pub fn import(bytes: &[u8]) -> Result<Self> {
        let reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
        let format = reader.format().ok_or(ProcessingError::UnsupportedFormat)?;
        let image = reader.decode()?;
        debug!(?format, width = image.width(), height = image.height(), "imaging: imported");
        Ok(Self {
            image,
            source_format: output_format(format),
        })
    }

    pub fn source_format(&self) -> Option<OutputFormat> {
        self.source_format
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.image.width(), self.image.height())
    }

    pub fn apply(&mut self, operation: &ImageOperation) -> Result<()> {
        let image = &self.image;
        let next = match *operation {
            ImageOperation::Resize {
                width,
                height,
                maintain_aspect_ratio,
                method,
            } => {
                if width == 0 || height == 0 {
                    return Err(ProcessingError::InvalidOperation(format!(
                        "resize target {width}x{height} is empty"
                    )));
                }
                if maintain_aspect_ratio {
                    image.resize(width, height, filter(method))
                } else {
                    image.resize_exact(width, height, filter(method))
                }
            }
            ImageOperation::Rotate(Rotation::Quarter) => image.rotate90(),
            ImageOperation::Rotate(Rotation::Half) => image.rotate180(),
            ImageOperation::Rotate(Rotation::ThreeQuarters) => image.rotate270(),
            ImageOperation::Crop {
                x,
                y,
                width,
                height,
            } => {
                if width == 0 || height == 0 || x >= image.width() || y >= image.height() {
                    return Err(ProcessingError::InvalidOperation(format!(
                        "crop {width}x{height} at ({x}, {y}) is outside a {}x{} image",
                        image.width(),
                        image.height()
                    )));
                }
                image.crop_imm(x, y, width, height)
            }
            ImageOperation::Grayscale => image.grayscale(),
            ImageOperation::Invert => {
                let mut inverted = image.clone();
                inverted.invert();
                inverted
            }
            ImageOperation::Blur { sigma } => image.blur(sigma),
            ImageOperation::Brighten { amount } => image.brighten(amount),
            ImageOperation::Contrast { amount } => image.adjust_contrast(amount),
            ImageOperation::Unsharpen { sigma, threshold } => image.unsharpen(sigma, threshold),
            ImageOperation::Flip {
                horizontal,
                vertical,
            } => {
                let mut flipped = image.clone();
                if horizontal {
                    flipped = flipped.fliph();
                }
                if vertical {
                    flipped = flipped.flipv();
                }
                flipped
            }
        };
        debug!(?operation, width = next.width(), height = next.height(), "imaging: applied");
        self.image = next;
        Ok(())
    }

    pub fn export(self, format: OutputFormat) -> Result<Vec<u8>> {
        let mut buffer = Cursor::new(Vec::new());
        match format {
            // JPEG has no alpha channel.
            OutputFormat::Jpeg => DynamicImage::ImageRgb8(self.image.to_rgb8())
                .write_to(&mut buffer, image_format(format))?,
            _ => DynamicImage::ImageRgba8(self.image.to_rgba8())
                .write_to(&mut buffer, image_format(format))?,
        }
        Ok(buffer.into_inner())
    }

    /// Re-encodes with size-oriented settings. Only PNG has an optimizer;
    /// other formats fall back to [`ImageProcessor::export`].
    pub fn optimize(
        self,
        format: OutputFormat,
        level: u8,
        interlace: bool,
        optimize_alpha: bool,
    ) -> Result<Vec<u8>> {
        if format != OutputFormat::Png {
            debug!(?format, "imaging: no optimizer for format, exporting");
            return self.export(format);
        }
        if interlace {
            debug!("imaging: interlaced PNG output is not supported, writing non-interlaced");
        }

        let mut pixels = self.image.to_rgba8();
        if optimize_alpha {
            for pixel in pixels.pixels_mut() {
                if pixel[3] == 0 {
                    pixel[0] = 0;
                    pixel[1] = 0;
                    pixel[2] = 0;
                }
            }
        }

        let mut bytes = Vec::new();
        let encoder = PngEncoder::new_with_quality(&mut bytes, compression(level), PngFilter::Adaptive);
        DynamicImage::ImageRgba8(pixels).write_with_encoder(encoder)?;
        Ok(bytes)
    }

    /// Runs a whole job: import, every operation in order, then the output step.
    pub fn run(job: ImageJob) -> Result<ProcessedImage> {
        let mut processor = Self::import(&job.source)?;
        for operation in &job.operations {
            processor.apply(operation)?;
        }

        let (width, height) = processor.dimensions();
        let bytes = match job.output {
            ImageOutput::Export { format } => processor.export(format)?,
            ImageOutput::Optimize {
                format,
                level,
                interlace,
                optimize_alpha,
            } => processor.optimize(format, level, interlace, optimize_alpha)?,
        };

        Ok(ProcessedImage {
            bytes,
            format: job.output.format(),
            width,
            height,
        })
    }
}

fn filter(method: ResizeMethod) -> FilterType {
    match method {
        ResizeMethod::Nearest => FilterType::Nearest,
        ResizeMethod::Triangle => FilterType::Triangle,
        ResizeMethod::CatmullRom => FilterType::CatmullRom,
        ResizeMethod::Gaussian => FilterType::Gaussian,
        ResizeMethod::Lanczos3 => FilterType::Lanczos3,
    }
}

fn compression(level: u8) -> CompressionType {
    match level {
        0 | 1 => CompressionType::Fast,
        2 | 3 => CompressionType::Default,
        _ => CompressionType::Best,
    }
}
