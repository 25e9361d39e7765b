//! Request handlers binding bus events to the controllers and the engine.

use std::future::Future;

use futures::FutureExt;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::warn;

use event_bus::{HandlerFuture, HandlerGroup, Responder};
use shared::{
    domain::{FileId, ProjectId, TransformerId},
    error::ApiError,
    models::{
        Created, FileRecord, IdPayload, ProjectModel, ProjectRecord, TransformerModel,
        TransformerProgress,
    },
    protocol::{
        AssignFiles, CreateFile, CreateProject, CreateTransformer, DeleteFiles, DeleteProject,
        DeleteTransformer, EventKind, ExecuteTransformer, GetFile, GetProject, GetTransformer,
        ImportFile, StopTransformer, UpdateFile, UpdateProject, UpdateTransformer,
    },
    query::ListQuery,
};

use crate::{
    controllers::EntityController,
    error::{Result, ServiceError},
    ServiceContext,
};

pub fn file_handlers(ctx: &ServiceContext) -> HandlerGroup {
    HandlerGroup::new("files")
        .on(EventKind::FilesCreate, reply(ctx, create_file))
        .on(EventKind::FilesImport, reply(ctx, import_file))
        .on(EventKind::FilesUpdate, reply(ctx, update_file))
        .on(EventKind::FilesDelete, reply(ctx, delete_files))
        .on(EventKind::FilesGet, reply(ctx, get_file))
        .on(EventKind::FilesList, reply(ctx, list_files))
}

pub fn project_handlers(ctx: &ServiceContext) -> HandlerGroup {
    HandlerGroup::new("projects")
        .on(EventKind::ProjectsCreate, reply(ctx, create_project))
        .on(EventKind::ProjectsUpdate, reply(ctx, update_project))
        .on(EventKind::ProjectsAssign, reply(ctx, assign_files))
        .on(EventKind::ProjectsDelete, reply(ctx, delete_project))
        .on(EventKind::ProjectsGet, reply(ctx, get_project))
        .on(EventKind::ProjectsList, reply(ctx, list_projects))
}

pub fn transformer_handlers(ctx: &ServiceContext) -> HandlerGroup {
    HandlerGroup::new("transformers")
        .on(EventKind::TransformersCreate, reply(ctx, create_transformer))
        .on(EventKind::TransformersUpdate, reply(ctx, update_transformer))
        .on(EventKind::TransformersDelete, reply(ctx, delete_transformer))
        .on(EventKind::TransformersGet, reply(ctx, get_transformer))
        .on(EventKind::TransformersList, reply(ctx, list_transformers))
        .on(EventKind::TransformersExecute, stream(ctx, execute_transformer))
        .on(EventKind::TransformersStop, reply(ctx, stop_transformer))
}

pub fn system_handlers(ctx: &ServiceContext) -> HandlerGroup {
    HandlerGroup::new("system").on(EventKind::SystemReset, reply(ctx, reset))
}

/// Wraps a handler that produces exactly one successful payload.
fn reply<Req, Resp, F, Fut>(
    ctx: &ServiceContext,
    handler: F,
) -> impl Fn(Value, Responder) -> HandlerFuture + Send + Sync + 'static
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(ServiceContext, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
{
    let ctx = ctx.clone();
    move |payload, responder| {
        let call = decode::<Req>(payload).map(|request| handler(ctx.clone(), request));
        async move {
            let response = call?.await?;
            responder.success(&response).map_err(bus_failure)?;
            Ok::<(), ApiError>(())
        }
        .boxed()
    }
}

/// Wraps a handler that answers through the responder itself.
fn stream<Req, F, Fut>(
    ctx: &ServiceContext,
    handler: F,
) -> impl Fn(Value, Responder) -> HandlerFuture + Send + Sync + 'static
where
    Req: DeserializeOwned + Send + 'static,
    F: Fn(ServiceContext, Req, Responder) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let ctx = ctx.clone();
    move |payload, responder| {
        let call = decode::<Req>(payload).map(|request| handler(ctx.clone(), request, responder));
        async move {
            call?.await?;
            Ok::<(), ApiError>(())
        }
        .boxed()
    }
}

fn decode<T: DeserializeOwned>(payload: Value) -> Result<T, ApiError> {
    serde_json::from_value(payload)
        .map_err(|error| ApiError::validation(format!("invalid payload: {error}")))
}

fn bus_failure(error: event_bus::BusError) -> ApiError {
    warn!("handlers: response not sent: {error}");
    ApiError::internal(error.to_string())
}

async fn create_file(ctx: ServiceContext, request: CreateFile) -> Result<IdPayload<FileId>> {
    let record = ctx.files.create(request.0).await?;
    Ok(IdPayload { id: record.id })
}

async fn import_file(ctx: ServiceContext, request: ImportFile) -> Result<Created<FileId, FileRecord>> {
    let record = ctx.files.import(request.file).await?;
    Ok(Created {
        id: record.id,
        data: record,
    })
}

async fn update_file(ctx: ServiceContext, request: UpdateFile) -> Result<()> {
    ctx.files.update(request.id, &request.data).await?;
    Ok(())
}

async fn delete_files(ctx: ServiceContext, request: DeleteFiles) -> Result<()> {
    ctx.files.delete_many(&request.ids).await?;
    Ok(())
}

async fn get_file(ctx: ServiceContext, request: GetFile) -> Result<FileRecord> {
    ctx.files
        .get_by_id(request.id)
        .await?
        .ok_or_else(|| ServiceError::not_found("file", request.id))
}

async fn list_files(ctx: ServiceContext, query: Option<ListQuery>) -> Result<Vec<FileRecord>> {
    ctx.files.get_many(&query.unwrap_or_default()).await
}

async fn create_project(
    ctx: ServiceContext,
    request: CreateProject,
) -> Result<Created<ProjectId, ProjectRecord>> {
    let record = ctx.projects.create(request.0).await?;
    Ok(Created {
        id: record.id,
        data: record,
    })
}

async fn update_project(ctx: ServiceContext, request: UpdateProject) -> Result<()> {
    ctx.projects.update(request.id, &request.data).await?;
    Ok(())
}

async fn assign_files(ctx: ServiceContext, request: AssignFiles) -> Result<()> {
    ctx.projects
        .assign_files(request.id, &request.file_ids)
        .await?;
    Ok(())
}

async fn delete_project(ctx: ServiceContext, request: DeleteProject) -> Result<()> {
    ctx.projects.delete(request.id).await?;
    Ok(())
}

async fn get_project(ctx: ServiceContext, request: GetProject) -> Result<ProjectModel> {
    ctx.projects
        .get_by_id(request.id)
        .await?
        .ok_or_else(|| ServiceError::not_found("project", request.id))
}

async fn list_projects(ctx: ServiceContext, query: Option<ListQuery>) -> Result<Vec<ProjectModel>> {
    ctx.projects.get_many(&query.unwrap_or_default()).await
}

async fn create_transformer(
    ctx: ServiceContext,
    request: CreateTransformer,
) -> Result<IdPayload<TransformerId>> {
    let record = ctx.transformers.create(request.0).await?;
    Ok(IdPayload { id: record.id })
}

async fn update_transformer(ctx: ServiceContext, request: UpdateTransformer) -> Result<()> {
    ctx.transformers.update(request.id, &request.data).await?;
    Ok(())
}

async fn delete_transformer(ctx: ServiceContext, request: DeleteTransformer) -> Result<()> {
    ctx.transformers.delete(request.id).await?;
    Ok(())
}

async fn get_transformer(ctx: ServiceContext, request: GetTransformer) -> Result<TransformerModel> {
    ctx.transformers
        .get_by_id(request.id)
        .await?
        .ok_or_else(|| ServiceError::not_found("transformer", request.id))
}

async fn list_transformers(
    ctx: ServiceContext,
    query: Option<ListQuery>,
) -> Result<Vec<TransformerModel>> {
    ctx.transformers
        .get_many(&query.unwrap_or_default())
        .await
}

async fn execute_transformer(
    ctx: ServiceContext,
    request: ExecuteTransformer,
    responder: Responder,
) -> Result<()> {
    ctx.engine.execute(request.id, &responder).await?;
    Ok(())
}

async fn stop_transformer(ctx: ServiceContext, request: StopTransformer) -> Result<TransformerProgress> {
    ctx.engine.stop(request.id).await
}

async fn reset(ctx: ServiceContext, _request: Value) -> Result<()> {
    ctx.storage.reset().await?;
    Ok(())
}
