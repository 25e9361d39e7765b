use std::{fmt, hash::Hash};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{
    Collection, FileId, FileKind, FileMetadata, ProjectId, TransformerId, TransformerSettings,
    TransformerStatus,
};

/// Payload persisted in one collection under an id of type `Self::Id`.
pub trait Document:
    fmt::Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const COLLECTION: Collection;

    type Id: fmt::Debug
        + fmt::Display
        + Copy
        + Eq
        + Hash
        + From<Uuid>
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static;
}

/// A stored document with its identity and timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound = "")]
pub struct Record<D: Document> {
    pub id: D::Id,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub data: D,
}

pub type FileRecord = Record<FileData>;
pub type ProjectRecord = Record<ProjectData>;
pub type TransformerRecord = Record<TransformerData>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileData {
    pub name: String,
    pub original_name: String,
    pub kind: FileKind,
    pub size: u64,
    #[serde(with = "crate::blob")]
    pub blob: Vec<u8>,
    pub metadata: FileMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<ProjectId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file_id: Option<FileId>,
}

impl Document for FileData {
    const COLLECTION: Collection = Collection::Files;
    type Id = FileId;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectData {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub file_ids: Vec<FileId>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Document for ProjectData {
    const COLLECTION: Collection = Collection::Projects;
    type Id = ProjectId;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformerData {
    pub project_id: ProjectId,
    pub kind: FileKind,
    #[serde(default)]
    pub settings: TransformerSettings,
    #[serde(default)]
    pub status: TransformerStatus,
    #[serde(default)]
    pub result_file_ids: Vec<FileId>,
}

impl Document for TransformerData {
    const COLLECTION: Collection = Collection::Transformers;
    type Id = TransformerId;
}

/// A file as handed over by the caller before classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFile {
    pub name: String,
    pub mime_type: String,
    #[serde(with = "crate::blob")]
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<FileMetadata>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectCreate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub file_ids: Vec<FileId>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformerCreate {
    pub project_id: ProjectId,
    pub kind: FileKind,
    #[serde(default)]
    pub settings: TransformerSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformerUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<TransformerSettings>,
}

/// Project view with its files, owned transformer and derived totals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectModel {
    #[serde(flatten)]
    pub project: ProjectRecord,
    pub files: Vec<FileRecord>,
    pub size: u64,
    pub kind: FileKind,
    #[serde(default)]
    pub transformer: Option<TransformerRecord>,
}

/// Transformer view with its project, the project's source files and the
/// produced result files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformerModel {
    #[serde(flatten)]
    pub transformer: TransformerRecord,
    #[serde(default)]
    pub project: Option<ProjectRecord>,
    pub files: Vec<FileRecord>,
    pub result_files: Vec<FileRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdPayload<I> {
    pub id: I,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Created<I, D> {
    pub id: I,
    pub data: D,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformerProgress {
    pub id: TransformerId,
    pub status: TransformerStatus,
}

#[cfg(test)]
#[path = "tests/models_tests.rs"]
mod tests;
