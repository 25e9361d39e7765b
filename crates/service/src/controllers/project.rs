use async_trait::async_trait;
use tracing::{debug, info};

use shared::{
    domain::{Collection, FileId, FileKind, ProjectId, TransformerSettings, TransformerStatus},
    models::{
        FileData, FileRecord, ProjectCreate, ProjectData, ProjectModel, ProjectRecord,
        ProjectUpdate, TransformerData, TransformerRecord,
    },
    query::{Filter, ListQuery},
};
use storage::{Storage, StorageTx};

use super::{dedup, file::delete_files, BaseController, EntityController};
use crate::error::{Result, ServiceError};

#[derive(Clone)]
pub struct ProjectController {
    base: BaseController<ProjectData>,
}

impl ProjectController {
    pub fn new(storage: Storage) -> Self {
        Self {
            base: BaseController::new(storage),
        }
    }

    /// Creates the project, claims its files and creates its idle transformer
    /// in one transaction. The transformer kind is the files' common kind.
    pub async fn create(&self, request: ProjectCreate) -> Result<ProjectRecord> {
        let file_ids = dedup(request.file_ids);

        let mut tx = self.base.storage().begin().await?;
        let files = require_files(&mut tx, &file_ids).await?;
        let project = tx
            .insert(ProjectData {
                name: request.name,
                description: request.description,
                file_ids,
                tags: request.tags,
            })
            .await?;
        let kind = FileKind::common(files.iter().map(|file| file.data.kind));
        claim_files(&mut tx, files, project.id).await?;

        let transformer = tx
            .insert(TransformerData {
                project_id: project.id,
                kind,
                settings: TransformerSettings::default(),
                status: TransformerStatus::Idle,
                result_file_ids: Vec::new(),
            })
            .await?;
        tx.commit().await?;

        info!(project_id = %project.id, transformer_id = %transformer.id, %kind, files = project.data.file_ids.len(), "projects: created");
        Ok(project)
    }

    pub async fn update(&self, id: ProjectId, update: &ProjectUpdate) -> Result<ProjectRecord> {
        self.base.update(id, update).await
    }

    /// Appends files to the project. Files already assigned keep their
    /// position; repeats are dropped. An untouched transformer takes the new
    /// common kind of the files.
    pub async fn assign_files(&self, id: ProjectId, file_ids: &[FileId]) -> Result<ProjectRecord> {
        let mut tx = self.base.storage().begin().await?;
        let mut project = tx.require::<ProjectData>(id).await?;

        let incoming = dedup(file_ids.iter().copied());
        let files = require_files(&mut tx, &incoming).await?;
        claim_files(&mut tx, files, id).await?;

        project.data.file_ids = dedup(project.data.file_ids.iter().chain(&incoming).copied());
        tx.save(&mut project).await?;
        retarget_transformer(&mut tx, &project).await?;
        tx.commit().await?;
        Ok(project)
    }

    /// Deletes the project with its files, its transformer and the
    /// transformer's results. Returns `false` if the project did not exist.
    pub async fn delete(&self, id: ProjectId) -> Result<bool> {
        let mut tx = self.base.storage().begin().await?;
        let Some(project) = tx.fetch::<ProjectData>(id).await? else {
            return Ok(false);
        };

        let owned = owned_by(id);
        let transformers = tx.query::<TransformerData>(&owned).await?;
        let owned_files = tx.query::<FileData>(&owned).await?;

        let file_ids = dedup(
            project
                .data
                .file_ids
                .iter()
                .copied()
                .chain(
                    transformers
                        .iter()
                        .flat_map(|transformer| transformer.data.result_file_ids.iter().copied()),
                )
                .chain(owned_files.iter().map(|file| file.id)),
        );
        let transformer_ids: Vec<_> = transformers.iter().map(|transformer| transformer.id).collect();

        delete_files(&mut tx, &file_ids).await?;
        tx.delete_many::<TransformerData>(&transformer_ids).await?;
        tx.delete::<ProjectData>(id).await?;
        tx.commit().await?;

        info!(project_id = %id, files = file_ids.len(), "projects: deleted");
        Ok(true)
    }
}

#[async_trait]
impl EntityController for ProjectController {
    type Doc = ProjectData;
    type Model = ProjectModel;

    fn base(&self) -> &BaseController<ProjectData> {
        &self.base
    }

    fn dependencies(&self) -> &'static [Collection] {
        &[Collection::Projects, Collection::Files, Collection::Transformers]
    }

    async fn serialize(&self, tx: &mut StorageTx, project: ProjectRecord) -> Result<ProjectModel> {
        let files = tx.fetch_many::<FileData>(&project.data.file_ids).await?;
        let size = files.iter().map(|file| file.data.size).sum();
        let kind = FileKind::common(files.iter().map(|file| file.data.kind));
        let transformer: Option<TransformerRecord> = tx
            .query::<TransformerData>(&owned_by(project.id).limit(1))
            .await?
            .into_iter()
            .next();

        Ok(ProjectModel {
            project,
            files,
            size,
            kind,
            transformer,
        })
    }
}

pub(crate) fn owned_by(project_id: ProjectId) -> ListQuery {
    ListQuery::new().filter("projectId", Filter::equals(project_id.to_string()))
}

async fn require_files(tx: &mut StorageTx, ids: &[FileId]) -> Result<Vec<FileRecord>> {
    let files = tx.fetch_many::<FileData>(ids).await?;
    if let Some(missing) = ids
        .iter()
        .find(|id| !files.iter().any(|file| file.id == **id))
    {
        return Err(ServiceError::not_found("file", missing));
    }
    Ok(files)
}

/// Follows the project's files with the transformer kind while the
/// transformer is still untouched: idle, unconfigured and without results.
async fn retarget_transformer(tx: &mut StorageTx, project: &ProjectRecord) -> Result<()> {
    let Some(mut transformer) = tx
        .query::<TransformerData>(&owned_by(project.id).limit(1))
        .await?
        .into_iter()
        .next()
    else {
        return Ok(());
    };
    let untouched = transformer.data.status == TransformerStatus::Idle
        && transformer.data.settings == TransformerSettings::default()
        && transformer.data.result_file_ids.is_empty();
    if !untouched {
        return Ok(());
    }

    let files = tx.fetch_many::<FileData>(&project.data.file_ids).await?;
    let kind = FileKind::common(files.iter().map(|file| file.data.kind));
    if kind != transformer.data.kind {
        debug!(transformer_id = %transformer.id, from = %transformer.data.kind, to = %kind, "projects: transformer kind follows files");
        transformer.data.kind = kind;
        tx.save(&mut transformer).await?;
    }
    Ok(())
}

async fn claim_files(tx: &mut StorageTx, files: Vec<FileRecord>, project_id: ProjectId) -> Result<()> {
    for mut file in files {
        if file.data.project_id != Some(project_id) {
            file.data.project_id = Some(project_id);
            tx.save(&mut file).await?;
        }
    }
    Ok(())
}
