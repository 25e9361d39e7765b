use anyhow::Context;
use async_trait::async_trait;

use shared::{
    domain::{DocumentMetadata, FileKind, FileMetadata, ImageMetadata, MediaMetadata},
    models::RawFile,
};

/// Reads kind-specific facts out of an imported file.
#[async_trait]
pub trait MetadataExtractor: Send + Sync {
    async fn extract(&self, file: &RawFile, kind: FileKind) -> anyhow::Result<FileMetadata>;
}

/// Probes images in-process and describes documents by name. Other kinds get
/// base metadata.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicMetadataExtractor;

#[async_trait]
impl MetadataExtractor for BasicMetadataExtractor {
    async fn extract(&self, file: &RawFile, kind: FileKind) -> anyhow::Result<FileMetadata> {
        let mut metadata = FileMetadata::base(file.bytes.len() as u64, file.mime_type.clone());

        match kind {
            FileKind::Image => {
                let bytes = file.bytes.clone();
                let probe = tokio::task::spawn_blocking(move || imaging::probe(&bytes))
                    .await
                    .context("image probe task failed")?
                    .with_context(|| format!("failed to probe '{}'", file.name))?;
                metadata.media = MediaMetadata::Image(ImageMetadata {
                    dimensions: probe.dimensions,
                    color_space: Some(probe.color_space),
                    has_alpha: Some(probe.has_alpha),
                    dpi: None,
                });
            }
            FileKind::Document => {
                metadata.media = MediaMetadata::Document(DocumentMetadata {
                    page_count: Some(1),
                    author: None,
                    title: Some(stem(&file.name).to_string()),
                });
            }
            FileKind::Video | FileKind::Audio | FileKind::Text | FileKind::Unknown => {}
        }

        Ok(metadata)
    }
}

/// The file name without its last extension.
pub(crate) fn stem(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    }
}
