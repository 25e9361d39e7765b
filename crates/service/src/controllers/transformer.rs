use async_trait::async_trait;
use tracing::{debug, info};

use shared::{
    domain::{
        Collection, FileId, FileKind, ProjectId, TransformerId, TransformerSettings,
        TransformerStatus,
    },
    models::{
        FileData, ProjectData, TransformerCreate, TransformerData, TransformerModel,
        TransformerRecord, TransformerUpdate,
    },
};
use storage::{Storage, StorageTx};

use super::{project::owned_by, BaseController, EntityController};
use crate::error::{Result, ServiceError};

#[derive(Clone)]
pub struct TransformerController {
    base: BaseController<TransformerData>,
}

impl TransformerController {
    pub fn new(storage: Storage) -> Self {
        Self {
            base: BaseController::new(storage),
        }
    }

    /// Creates an idle transformer for a project that has none yet.
    pub async fn create(&self, request: TransformerCreate) -> Result<TransformerRecord> {
        validate_settings(request.kind, &request.settings)?;

        let mut tx = self.base.storage().begin().await?;
        tx.require::<ProjectData>(request.project_id).await?;
        if let Some(existing) = find_for_project(&mut tx, request.project_id).await? {
            return Err(ServiceError::validation(format!(
                "project '{}' already has transformer '{}'",
                request.project_id, existing.id
            )));
        }

        let transformer = tx
            .insert(TransformerData {
                project_id: request.project_id,
                kind: request.kind,
                settings: request.settings,
                status: TransformerStatus::Idle,
                result_file_ids: Vec::new(),
            })
            .await?;
        tx.commit().await?;
        Ok(transformer)
    }

    pub async fn update(&self, id: TransformerId, update: &TransformerUpdate) -> Result<TransformerRecord> {
        if let Some(settings) = &update.settings {
            let current = self.base.require(id).await?;
            validate_settings(current.data.kind, settings)?;
        }
        self.base.update(id, update).await
    }

    pub async fn get(&self, id: TransformerId) -> Result<Option<TransformerRecord>> {
        self.base.get(id).await
    }

    pub async fn get_by_project(&self, project_id: ProjectId) -> Result<Option<TransformerRecord>> {
        let mut tx = self.base.storage().begin().await?;
        let transformer = find_for_project(&mut tx, project_id).await?;
        tx.commit().await?;
        Ok(transformer)
    }

    /// Moves the transformer to `status`, rejecting transitions the
    /// lifecycle does not allow.
    pub async fn update_status(&self, id: TransformerId, status: TransformerStatus) -> Result<TransformerRecord> {
        let mut tx = self.base.storage().begin().await?;
        let mut transformer = tx.require::<TransformerData>(id).await?;
        transition(&mut transformer, status)?;
        tx.save(&mut transformer).await?;
        tx.commit().await?;

        debug!(transformer_id = %id, %status, "transformers: status changed");
        Ok(transformer)
    }

    /// Marks the transformer running and clears its result list. Returns the
    /// cleared result ids so the caller can delete them once the run ends.
    pub async fn begin_run(&self, id: TransformerId) -> Result<(TransformerRecord, Vec<FileId>)> {
        let mut tx = self.base.storage().begin().await?;
        let mut transformer = tx.require::<TransformerData>(id).await?;
        transition(&mut transformer, TransformerStatus::Running)?;
        let previous = std::mem::take(&mut transformer.data.result_file_ids);
        tx.save(&mut transformer).await?;
        tx.commit().await?;
        Ok((transformer, previous))
    }

    pub async fn append_result(&self, id: TransformerId, file_id: FileId) -> Result<()> {
        let mut tx = self.base.storage().begin().await?;
        let mut transformer = tx.require::<TransformerData>(id).await?;
        transformer.data.result_file_ids.push(file_id);
        tx.save(&mut transformer).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Drops files from the result list without deleting them.
    pub async fn unassign_files(&self, id: TransformerId, file_ids: &[FileId]) -> Result<TransformerRecord> {
        let mut tx = self.base.storage().begin().await?;
        let mut transformer = tx.require::<TransformerData>(id).await?;
        transformer
            .data
            .result_file_ids
            .retain(|file_id| !file_ids.contains(file_id));
        tx.save(&mut transformer).await?;
        tx.commit().await?;
        Ok(transformer)
    }

    /// Deletes the transformer and its result files. Returns `false` if it
    /// did not exist.
    pub async fn delete(&self, id: TransformerId) -> Result<bool> {
        let mut tx = self.base.storage().begin().await?;
        let Some(transformer) = tx.fetch::<TransformerData>(id).await? else {
            return Ok(false);
        };
        tx.delete_many::<FileData>(&transformer.data.result_file_ids)
            .await?;
        tx.delete::<TransformerData>(id).await?;
        tx.commit().await?;

        info!(transformer_id = %id, results = transformer.data.result_file_ids.len(), "transformers: deleted");
        Ok(true)
    }
}

#[async_trait]
impl EntityController for TransformerController {
    type Doc = TransformerData;
    type Model = TransformerModel;

    fn base(&self) -> &BaseController<TransformerData> {
        &self.base
    }

    fn dependencies(&self) -> &'static [Collection] {
        &[Collection::Transformers, Collection::Projects, Collection::Files]
    }

    async fn serialize(&self, tx: &mut StorageTx, transformer: TransformerRecord) -> Result<TransformerModel> {
        let project = tx
            .fetch::<ProjectData>(transformer.data.project_id)
            .await?;
        let files = match &project {
            Some(project) => tx.fetch_many::<FileData>(&project.data.file_ids).await?,
            None => Vec::new(),
        };
        let result_files = tx
            .fetch_many::<FileData>(&transformer.data.result_file_ids)
            .await?;

        Ok(TransformerModel {
            transformer,
            project,
            files,
            result_files,
        })
    }
}

fn validate_settings(kind: FileKind, settings: &TransformerSettings) -> Result<()> {
    let unsupported = settings.unsupported_features(kind);
    if !unsupported.is_empty() {
        let names: Vec<String> = unsupported.iter().map(ToString::to_string).collect();
        return Err(ServiceError::validation(format!(
            "{kind} transformers do not support: {}",
            names.join(", ")
        )));
    }

    let out_of_range = settings.out_of_range_geometry();
    if !out_of_range.is_empty() {
        return Err(ServiceError::validation(format!(
            "percentages out of range: {}",
            out_of_range.join(", ")
        )));
    }
    Ok(())
}

fn transition(transformer: &mut TransformerRecord, next: TransformerStatus) -> Result<()> {
    let current = transformer.data.status;
    if !current.can_transition_to(next) {
        return Err(ServiceError::validation(format!(
            "transformer '{}' cannot go from {current} to {next}",
            transformer.id
        )));
    }
    transformer.data.status = next;
    Ok(())
}

async fn find_for_project(tx: &mut StorageTx, project_id: ProjectId) -> Result<Option<TransformerRecord>> {
    Ok(tx
        .query::<TransformerData>(&owned_by(project_id).limit(1))
        .await?
        .into_iter()
        .next())
}
