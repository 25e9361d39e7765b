use shared::domain::{Dimensions, OutputFormat, TransformerSettings};

use crate::{ImageJob, ImageOperation, ImageOutput};

/// Turns transformer settings into an ordered job for one source image.
///
/// Order is fixed: resize, rotate, crop, filters (grayscale, invert, blur,
/// brighten, contrast, unsharpen), flip, then the output step. Resize and crop
/// percentages are taken against `original` and rounded to whole pixels.
pub fn plan_job(
    source: Vec<u8>,
    settings: &TransformerSettings,
    original: Dimensions,
    fallback_format: OutputFormat,
) -> ImageJob {
    let mut operations = Vec::new();

    if let Some(resize) = &settings.resize {
        operations.push(ImageOperation::Resize {
            width: scale(resize.width, original.width),
            height: scale(resize.height, original.height),
            maintain_aspect_ratio: resize.maintain_aspect_ratio,
            method: resize.method,
        });
    }

    if let Some(rotate) = settings.rotate {
        operations.push(ImageOperation::Rotate(rotate.angle));
    }

    if let Some(crop) = settings.crop {
        operations.push(ImageOperation::Crop {
            x: scale(crop.x, original.width),
            y: scale(crop.y, original.height),
            width: scale(crop.width, original.width),
            height: scale(crop.height, original.height),
        });
    }

    if let Some(filter) = &settings.filter {
        if filter.grayscale {
            operations.push(ImageOperation::Grayscale);
        }
        if filter.invert {
            operations.push(ImageOperation::Invert);
        }
        if let Some(blur) = filter.blur.filter(|blur| blur.sigma > 0.0) {
            operations.push(ImageOperation::Blur { sigma: blur.sigma });
        }
        if let Some(brighten) = filter.brighten.filter(|brighten| brighten.amount > 0) {
            operations.push(ImageOperation::Brighten {
                amount: brighten.amount,
            });
        }
        if let Some(contrast) = filter.contrast.filter(|contrast| contrast.amount > 0.0) {
            operations.push(ImageOperation::Contrast {
                amount: contrast.amount,
            });
        }
        if let Some(unsharpen) = filter
            .unsharpen
            .filter(|unsharpen| unsharpen.sigma > 0.0 || unsharpen.threshold > 0)
        {
            operations.push(ImageOperation::Unsharpen {
                sigma: unsharpen.sigma,
                threshold: unsharpen.threshold,
            });
        }
    }

    if let Some(flip) = settings.flip.filter(|flip| flip.horizontal || flip.vertical) {
        operations.push(ImageOperation::Flip {
            horizontal: flip.horizontal,
            vertical: flip.vertical,
        });
    }

    let format = settings.format.unwrap_or(fallback_format);
    let output = match settings.optimize {
        Some(optimize) => ImageOutput::Optimize {
            format,
            level: optimize.level,
            interlace: optimize.interlace,
            optimize_alpha: optimize.optimize_alpha,
        },
        None => ImageOutput::Export { format },
    };

    ImageJob {
        source,
        operations,
        output,
    }
}

fn scale(percent: f64, dimension: u32) -> u32 {
    let pixels = (percent / 100.0 * f64::from(dimension)).round();
    if pixels <= 0.0 {
        0
    } else {
        pixels as u32
    }
}
