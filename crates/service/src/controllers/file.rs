use std::{collections::BTreeSet, sync::Arc};

use async_trait::async_trait;
use tracing::{debug, warn};

use shared::{
    domain::{Collection, FileId, FileKind, FileMetadata, ProjectId},
    models::{FileData, FileRecord, FileUpdate, ProjectData, RawFile, TransformerData},
    query::ListQuery,
};
use storage::{Storage, StorageTx};

use super::{project::owned_by, BaseController, EntityController};
use crate::{error::Result, metadata::MetadataExtractor};

/// A converted output ready to be stored next to its source.
#[derive(Debug, Clone)]
pub struct ResultFile {
    pub file: RawFile,
    pub source_file_id: FileId,
    pub project_id: ProjectId,
}

#[derive(Clone)]
pub struct FileController {
    base: BaseController<FileData>,
    extractor: Arc<dyn MetadataExtractor>,
}

impl FileController {
    pub fn new(storage: Storage, extractor: Arc<dyn MetadataExtractor>) -> Self {
        Self {
            base: BaseController::new(storage),
            extractor,
        }
    }

    pub async fn create(&self, data: FileData) -> Result<FileRecord> {
        self.base.create(data).await
    }

    /// Classifies a raw file by mime type, extracts its metadata and stores it.
    /// Extraction failures are logged and fall back to base metadata.
    pub async fn import(&self, file: RawFile) -> Result<FileRecord> {
        let data = self.describe(file, None, None).await;
        let record = self.base.create(data).await?;
        debug!(file_id = %record.id, kind = %record.data.kind, size = record.data.size, "files: imported");
        Ok(record)
    }

    pub async fn import_result(&self, result: ResultFile) -> Result<FileRecord> {
        let data = self
            .describe(result.file, Some(result.project_id), Some(result.source_file_id))
            .await;
        self.base.create(data).await
    }

    pub async fn update(&self, id: FileId, update: &FileUpdate) -> Result<FileRecord> {
        self.base.update(id, update).await
    }

    pub async fn fetch_many(&self, ids: &[FileId]) -> Result<Vec<FileRecord>> {
        let mut tx = self.base.storage().begin().await?;
        let files = tx.fetch_many::<FileData>(ids).await?;
        tx.commit().await?;
        Ok(files)
    }

    /// Deletes the given files and drops them from the projects and
    /// transformers that reference them. Unknown ids are ignored.
    pub async fn delete_many(&self, ids: &[FileId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.base.storage().begin().await?;
        let deleted = delete_files(&mut tx, ids).await?;
        tx.commit().await?;
        Ok(deleted)
    }

    async fn describe(
        &self,
        file: RawFile,
        project_id: Option<ProjectId>,
        source_file_id: Option<FileId>,
    ) -> FileData {
        let kind = FileKind::from_mime(&file.mime_type);
        let size = file.bytes.len() as u64;
        let metadata = match self.extractor.extract(&file, kind).await {
            Ok(metadata) => metadata,
            Err(error) => {
                warn!(name = %file.name, %kind, "files: metadata extraction failed: {error:#}");
                FileMetadata::base(size, file.mime_type.clone())
            }
        };

        FileData {
            original_name: file.name.clone(),
            name: file.name,
            kind,
            size,
            blob: file.bytes,
            metadata,
            project_id,
            source_file_id,
        }
    }
}

#[async_trait]
impl EntityController for FileController {
    type Doc = FileData;
    type Model = FileRecord;

    fn base(&self) -> &BaseController<FileData> {
        &self.base
    }

    fn dependencies(&self) -> &'static [Collection] {
        &[Collection::Files]
    }

    async fn serialize(&self, _tx: &mut StorageTx, record: FileRecord) -> Result<FileRecord> {
        Ok(record)
    }
}

/// Removes files inside an open transaction, keeping project file lists and
/// transformer result lists consistent.
pub(crate) async fn delete_files(tx: &mut StorageTx, ids: &[FileId]) -> Result<u64> {
    let files = tx.fetch_many::<FileData>(ids).await?;
    if files.is_empty() {
        return Ok(0);
    }
    let removed: BTreeSet<FileId> = files.iter().map(|file| file.id).collect();
    let owners: BTreeSet<ProjectId> = files.iter().filter_map(|file| file.data.project_id).collect();

    // A file can be listed by projects other than the one that owns it.
    for mut project in tx.query::<ProjectData>(&ListQuery::new().limit(u32::MAX)).await? {
        if strip(&mut project.data.file_ids, &removed) {
            tx.save(&mut project).await?;
        }
    }

    for project_id in owners {
        for mut transformer in tx.query::<TransformerData>(&owned_by(project_id)).await? {
            if strip(&mut transformer.data.result_file_ids, &removed) {
                tx.save(&mut transformer).await?;
            }
        }
    }

    Ok(tx.delete_many::<FileData>(ids).await?)
}

fn strip(ids: &mut Vec<FileId>, removed: &BTreeSet<FileId>) -> bool {
    let before = ids.len();
    ids.retain(|id| !removed.contains(id));
    ids.len() != before
}

