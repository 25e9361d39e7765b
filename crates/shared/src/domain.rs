use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(value).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(FileId);
id_newtype!(ProjectId);
id_newtype!(TransformerId);

/// Document collections backing the three entity types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Files,
    Projects,
    Transformers,
}

impl Collection {
    pub const ALL: [Collection; 3] = [Self::Files, Self::Projects, Self::Transformers];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Files => "files",
            Self::Projects => "projects",
            Self::Transformers => "transformers",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Image,
    Video,
    Audio,
    Text,
    Document,
    Unknown,
}

impl FileKind {
    /// Classifies a MIME type. Prefix rules win over substring rules.
    pub fn from_mime(mime_type: &str) -> Self {
        let mime_type = mime_type.trim().to_ascii_lowercase();
        if mime_type.starts_with("image/") {
            Self::Image
        } else if mime_type.starts_with("video/") {
            Self::Video
        } else if mime_type.starts_with("audio/") {
            Self::Audio
        } else if mime_type.contains("text") || mime_type.contains("markdown") {
            Self::Text
        } else if mime_type.contains("pdf") || mime_type.contains("document") {
            Self::Document
        } else {
            Self::Unknown
        }
    }

    /// The kind shared by every element, or `Unknown` when mixed or empty.
    pub fn common<I>(kinds: I) -> Self
    where
        I: IntoIterator<Item = FileKind>,
    {
        let mut kinds = kinds.into_iter();
        let Some(first) = kinds.next() else {
            return Self::Unknown;
        };
        if kinds.all(|kind| kind == first) {
            first
        } else {
            Self::Unknown
        }
    }

    pub fn allowed_features(&self) -> &'static [Feature] {
        match self {
            Self::Image => &[
                Feature::Format,
                Feature::Resize,
                Feature::Rotate,
                Feature::Crop,
                Feature::Filter,
                Feature::Flip,
                Feature::Optimize,
            ],
            Self::Video => &[Feature::Format, Feature::Resize, Feature::Crop, Feature::Trim],
            Self::Audio => &[Feature::Format, Feature::Trim],
            Self::Text | Self::Document | Self::Unknown => &[],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Text => "text",
            Self::Document => "document",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransformerStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Error,
    Canceled,
}

impl TransformerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Canceled)
    }

    /// Allowed edges: idle or any terminal state starts a run, and a run ends
    /// in exactly one terminal state.
    pub fn can_transition_to(&self, next: TransformerStatus) -> bool {
        match (self, next) {
            (Self::Idle, Self::Running) => true,
            (current, Self::Running) => current.is_terminal(),
            (Self::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TransformerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Canceled => "canceled",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub size: u64,
    pub mime_type: String,
    #[serde(flatten)]
    pub media: MediaMetadata,
}

impl FileMetadata {
    pub fn base(size: u64, mime_type: impl Into<String>) -> Self {
        Self {
            size,
            mime_type: mime_type.into(),
            media: MediaMetadata::Base,
        }
    }

    pub fn dimensions(&self) -> Option<Dimensions> {
        match &self.media {
            MediaMetadata::Image(image) => Some(image.dimensions),
            MediaMetadata::Video(video) => Some(video.dimensions),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MediaMetadata {
    Image(ImageMetadata),
    Video(VideoMetadata),
    Audio(AudioMetadata),
    Document(DocumentMetadata),
    Base,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMetadata {
    pub dimensions: Dimensions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_space: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_alpha: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dpi: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoMetadata {
    pub duration: f64,
    pub dimensions: Dimensions,
    pub frame_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_audio: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioMetadata {
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// A configurable block of [`TransformerSettings`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Format,
    Resize,
    Rotate,
    Crop,
    Filter,
    Flip,
    Trim,
    Optimize,
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Format => "format",
            Self::Resize => "resize",
            Self::Rotate => "rotate",
            Self::Crop => "crop",
            Self::Filter => "filter",
            Self::Flip => "flip",
            Self::Trim => "trim",
            Self::Optimize => "optimize",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Png,
    Jpeg,
    Gif,
    Webp,
    Bmp,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpeg",
            Self::Gif => "gif",
            Self::Webp => "webp",
            Self::Bmp => "bmp",
        }
    }

    pub fn mime_type(&self) -> String {
        format!("image/{}", self.extension())
    }

    pub fn from_mime(mime_type: &str) -> Option<Self> {
        match mime_type.trim().to_ascii_lowercase().as_str() {
            "image/png" => Some(Self::Png),
            "image/jpeg" | "image/jpg" => Some(Self::Jpeg),
            "image/gif" => Some(Self::Gif),
            "image/webp" => Some(Self::Webp),
            "image/bmp" | "image/x-ms-bmp" => Some(Self::Bmp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformerSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<OutputFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resize: Option<ResizeSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotate: Option<RotateSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crop: Option<CropSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilterSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flip: Option<FlipSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trim: Option<TrimSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimize: Option<OptimizeSettings>,
}

impl TransformerSettings {
    pub fn active_features(&self) -> Vec<Feature> {
        [
            (self.format.is_some(), Feature::Format),
            (self.resize.is_some(), Feature::Resize),
            (self.rotate.is_some(), Feature::Rotate),
            (self.crop.is_some(), Feature::Crop),
            (self.filter.is_some(), Feature::Filter),
            (self.flip.is_some(), Feature::Flip),
            (self.trim.is_some(), Feature::Trim),
            (self.optimize.is_some(), Feature::Optimize),
        ]
        .into_iter()
        .filter_map(|(active, feature)| active.then_some(feature))
        .collect()
    }

    /// Active features the given kind cannot process.
    pub fn unsupported_features(&self, kind: FileKind) -> Vec<Feature> {
        let allowed = kind.allowed_features();
        self.active_features()
            .into_iter()
            .filter(|feature| !allowed.contains(feature))
            .collect()
    }

    /// Geometry fields whose percentage is out of range or not finite.
    /// Offsets must lie in `[0, 100)`, sizes in `(0, 100]`.
    pub fn out_of_range_geometry(&self) -> Vec<&'static str> {
        let mut checks: Vec<(&'static str, f64, fn(f64) -> bool)> = Vec::new();
        if let Some(resize) = &self.resize {
            checks.push(("resize.width", resize.width, is_extent));
            checks.push(("resize.height", resize.height, is_extent));
        }
        if let Some(crop) = self.crop {
            checks.push(("crop.x", crop.x, is_offset));
            checks.push(("crop.y", crop.y, is_offset));
            checks.push(("crop.width", crop.width, is_extent));
            checks.push(("crop.height", crop.height, is_extent));
        }

        checks
            .into_iter()
            .filter(|(_, value, valid)| !valid(*value))
            .map(|(field, ..)| field)
            .collect()
    }
}

fn is_offset(percent: f64) -> bool {
    (0.0..100.0).contains(&percent)
}

fn is_extent(percent: f64) -> bool {
    percent > 0.0 && percent <= 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResizeMethod {
    Nearest,
    Triangle,
    CatmullRom,
    Gaussian,
    #[default]
    Lanczos3,
}

fn full_scale() -> f64 {
    100.0
}

fn enabled() -> bool {
    true
}

/// Target size as a percentage of the source dimensions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeSettings {
    #[serde(default = "full_scale")]
    pub width: f64,
    #[serde(default = "full_scale")]
    pub height: f64,
    #[serde(default = "enabled")]
    pub maintain_aspect_ratio: bool,
    #[serde(default)]
    pub method: ResizeMethod,
}

impl Default for ResizeSettings {
    fn default() -> Self {
        Self {
            width: full_scale(),
            height: full_scale(),
            maintain_aspect_ratio: true,
            method: ResizeMethod::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(try_from = "u16", into = "u16")]
pub enum Rotation {
    #[default]
    Quarter,
    Half,
    ThreeQuarters,
}

impl TryFrom<u16> for Rotation {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            90 => Ok(Self::Quarter),
            180 => Ok(Self::Half),
            270 => Ok(Self::ThreeQuarters),
            other => Err(format!("unsupported rotation angle {other}, expected 90, 180 or 270")),
        }
    }
}

impl From<Rotation> for u16 {
    fn from(value: Rotation) -> Self {
        match value {
            Rotation::Quarter => 90,
            Rotation::Half => 180,
            Rotation::ThreeQuarters => 270,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct RotateSettings {
    pub angle: Rotation,
}

/// Crop window in percent of the source dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CropSettings {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Default for CropSettings {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: full_scale(),
            height: full_scale(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterSettings {
    #[serde(default)]
    pub grayscale: bool,
    #[serde(default)]
    pub invert: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blur: Option<BlurSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brighten: Option<BrightenSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contrast: Option<ContrastSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsharpen: Option<UnsharpenSettings>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlurSettings {
    pub sigma: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BrightenSettings {
    pub amount: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContrastSettings {
    pub amount: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnsharpenSettings {
    pub sigma: f32,
    pub threshold: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlipSettings {
    #[serde(default)]
    pub horizontal: bool,
    #[serde(default)]
    pub vertical: bool,
}

/// Time window in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrimSettings {
    pub start: f64,
    pub end: f64,
}

fn default_level() -> u8 {
    3
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeSettings {
    #[serde(default = "default_level")]
    pub level: u8,
    #[serde(default)]
    pub interlace: bool,
    #[serde(default = "enabled")]
    pub optimize_alpha: bool,
}

impl Default for OptimizeSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            interlace: false,
            optimize_alpha: true,
        }
    }
}

#[cfg(test)]
#[path = "tests/domain_tests.rs"]
mod tests;
