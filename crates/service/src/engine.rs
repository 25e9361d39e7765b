//! Runs a transformer's pipeline over its project's files.
//!
//! A run persists `running`, converts the source files one at a time in
//! project order, appends each result as it is stored and ends in exactly one
//! terminal state. While it runs, every committed write to the transformer
//! (the start of the run and each appended result) is forwarded to the
//! caller as a pending response.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use serde_json::json;
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, error, info, warn};

use event_bus::Responder;
use imaging::{plan_job, ImageJob, ImageWorker, ProcessedImage, ProcessingError};
use shared::{
    domain::{Collection, FileKind, OutputFormat, TransformerId, TransformerStatus},
    error::ApiError,
    models::{FileRecord, RawFile, TransformerProgress, TransformerRecord},
};

use crate::{
    controllers::{
        EntityController, FileController, ProjectController, ResultFile, TransformerController,
    },
    error::{Result, ServiceError},
    metadata::stem,
};

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Upper bound for converting a single file.
    pub step_timeout: Option<Duration>,
}

type RunMap = Arc<Mutex<HashMap<TransformerId, Arc<AtomicBool>>>>;

#[derive(Clone)]
pub struct TransformerEngine {
    files: FileController,
    projects: ProjectController,
    transformers: TransformerController,
    worker: Arc<dyn ImageWorker>,
    config: EngineConfig,
    runs: RunMap,
}

enum RunOutcome {
    Completed,
    Canceled,
}

impl TransformerEngine {
    pub fn new(
        files: FileController,
        projects: ProjectController,
        transformers: TransformerController,
        worker: Arc<dyn ImageWorker>,
        config: EngineConfig,
    ) -> Self {
        Self {
            files,
            projects,
            transformers,
            worker,
            config,
            runs: Arc::default(),
        }
    }

    pub fn is_running(&self, id: TransformerId) -> bool {
        lock(&self.runs).contains_key(&id)
    }

    /// Executes the transformer and answers through `responder`.
    ///
    /// Errors found before the run starts are returned without responding.
    /// Once the run has started, the final response is always sent here and a
    /// failure is also returned to the caller for logging.
    pub async fn execute(&self, id: TransformerId, responder: &Responder) -> Result<TransformerProgress> {
        let transformer = self
            .transformers
            .get(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("transformer", id))?;
        let (cancel, _run) = self.register(id)?;

        if transformer.data.status == TransformerStatus::Running {
            warn!(transformer_id = %id, "engine: recovering run left over from a previous process");
            self.transformers
                .update_status(id, TransformerStatus::Error)
                .await?;
        }

        let progress = ProgressForwarder::start(self.transformers.clone(), id, responder.clone()).await;
        let (transformer, previous) = match self.transformers.begin_run(id).await {
            Ok(begun) => begun,
            Err(error) => {
                progress.stop().await;
                return Err(error);
            }
        };
        info!(transformer_id = %id, kind = %transformer.data.kind, "engine: run started");

        let outcome = self.run(&transformer, &cancel).await;
        progress.stop().await;

        let status = match &outcome {
            Ok(RunOutcome::Completed) => TransformerStatus::Completed,
            Ok(RunOutcome::Canceled) => TransformerStatus::Canceled,
            Err(_) => TransformerStatus::Error,
        };
        let persisted = self.transformers.update_status(id, status).await;
        if let Err(error) = self.files.delete_many(&previous).await {
            warn!(transformer_id = %id, "engine: failed to delete previous results: {error}");
        }

        let progress = TransformerProgress { id, status };
        match outcome {
            Ok(_) => {
                persisted?;
                if let Err(error) = responder.success(&progress) {
                    warn!(transformer_id = %id, "engine: final response not sent: {error}");
                }
                info!(transformer_id = %id, %status, "engine: run finished");
                Ok(progress)
            }
            Err(failure) => {
                if let Err(error) = persisted {
                    error!(transformer_id = %id, "engine: failed to persist error status: {error}");
                }
                let rejection = ApiError::from(&failure).with_details(json!({
                    "id": id,
                    "status": status,
                }));
                if let Err(error) = responder.error(&rejection) {
                    warn!(transformer_id = %id, "engine: final response not sent: {error}");
                }
                error!(transformer_id = %id, "engine: run failed: {failure}");
                Err(failure)
            }
        }
    }

    /// Asks a running transformer to stop before its next file and returns
    /// the persisted status.
    pub async fn stop(&self, id: TransformerId) -> Result<TransformerProgress> {
        let transformer = self
            .transformers
            .get(id)
            .await?
            .ok_or_else(|| ServiceError::not_found("transformer", id))?;

        if let Some(cancel) = lock(&self.runs).get(&id) {
            cancel.store(true, Ordering::SeqCst);
            info!(transformer_id = %id, "engine: stop requested");
        }

        Ok(TransformerProgress {
            id,
            status: transformer.data.status,
        })
    }

    fn register(&self, id: TransformerId) -> Result<(Arc<AtomicBool>, RunGuard)> {
        let mut runs = lock(&self.runs);
        if runs.contains_key(&id) {
            return Err(ServiceError::validation(format!(
                "transformer '{id}' is already running"
            )));
        }
        let cancel = Arc::new(AtomicBool::new(false));
        runs.insert(id, Arc::clone(&cancel));
        Ok((
            cancel,
            RunGuard {
                runs: Arc::clone(&self.runs),
                id,
            },
        ))
    }

    async fn run(&self, transformer: &TransformerRecord, cancel: &AtomicBool) -> Result<RunOutcome> {
        match transformer.data.kind {
            FileKind::Image => self.run_images(transformer, cancel).await,
            other => Err(ServiceError::UnsupportedKind(other)),
        }
    }

    async fn run_images(&self, transformer: &TransformerRecord, cancel: &AtomicBool) -> Result<RunOutcome> {
        let project = self
            .projects
            .base()
            .require(transformer.data.project_id)
            .await?;
        let sources = self.files.fetch_many(&project.data.file_ids).await?;

        for source in sources {
            if cancel.load(Ordering::SeqCst) {
                info!(transformer_id = %transformer.id, "engine: run canceled");
                return Ok(RunOutcome::Canceled);
            }

            let source_id = source.id;
            let result = self.convert_image(transformer, source).await?;
            self.transformers
                .append_result(transformer.id, result.id)
                .await?;
            debug!(transformer_id = %transformer.id, %source_id, result_id = %result.id, "engine: file converted");
        }

        Ok(RunOutcome::Completed)
    }

    async fn convert_image(&self, transformer: &TransformerRecord, source: FileRecord) -> Result<FileRecord> {
        if source.data.kind != FileKind::Image {
            return Err(ServiceError::validation(format!(
                "file '{}' is {}, expected image",
                source.id, source.data.kind
            )));
        }

        let dimensions = match source.data.metadata.dimensions() {
            Some(dimensions) => dimensions,
            None => {
                let bytes = source.data.blob.clone();
                tokio::task::spawn_blocking(move || imaging::probe(&bytes))
                    .await
                    .map_err(|error| ProcessingError::Worker(error.to_string()))??
                    .dimensions
            }
        };
        let fallback = OutputFormat::from_mime(&source.data.metadata.mime_type).unwrap_or(OutputFormat::Png);

        let name = source.data.name;
        let job = plan_job(source.data.blob, &transformer.data.settings, dimensions, fallback);
        let processed = self.process(job).await?;

        self.files
            .import_result(ResultFile {
                file: RawFile {
                    name: format!("{}.{}", stem(&name), processed.format.extension()),
                    mime_type: processed.format.mime_type(),
                    bytes: processed.bytes,
                },
                source_file_id: source.id,
                project_id: transformer.data.project_id,
            })
            .await
    }

    async fn process(&self, job: ImageJob) -> Result<ProcessedImage> {
        let work = self.worker.process(job);
        let processed = match self.config.step_timeout {
            Some(limit) => tokio::time::timeout(limit, work)
                .await
                .map_err(|_| ProcessingError::TimedOut(limit))??,
            None => work.await?,
        };
        Ok(processed)
    }
}

/// Clears the run's cancel flag when the run ends, however it ends.
struct RunGuard {
    runs: RunMap,
    id: TransformerId,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        lock(&self.runs).remove(&self.id);
    }
}

fn lock(runs: &RunMap) -> MutexGuard<'_, HashMap<TransformerId, Arc<AtomicBool>>> {
    runs.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Forwards committed writes to one transformer as pending responses.
struct ProgressForwarder {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ProgressForwarder {
    /// Returns once the current state has been forwarded.
    async fn start(transformers: TransformerController, id: TransformerId, responder: Responder) -> Self {
        let mut feed = transformers
            .base()
            .storage()
            .watch(&[Collection::Transformers]);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let key = id.to_string();
            forward_status(&transformers, id, &responder).await;
            let _ = ready_tx.send(());

            loop {
                tokio::select! {
                    notice = feed.recv() => match notice {
                        Some(notice) if notice.touches(&key) => {
                            forward_status(&transformers, id, &responder).await;
                        }
                        Some(_) => {}
                        None => return,
                    },
                    _ = &mut stop_rx => break,
                }
            }

            // Writes committed before the stop request are still queued.
            while let Some(notice) = feed.try_recv() {
                if notice.touches(&key) {
                    forward_status(&transformers, id, &responder).await;
                }
            }
        });

        let _ = ready_rx.await;
        Self {
            stop: stop_tx,
            task,
        }
    }

    async fn stop(self) {
        let _ = self.stop.send(());
        if let Err(error) = self.task.await {
            warn!("engine: progress forwarder failed: {error}");
        }
    }
}

async fn forward_status(transformers: &TransformerController, id: TransformerId, responder: &Responder) {
    match transformers.get(id).await {
        Ok(Some(transformer)) => {
            let progress = TransformerProgress {
                id,
                status: transformer.data.status,
            };
            if let Err(error) = responder.pending(&progress) {
                debug!(transformer_id = %id, "engine: progress not forwarded: {error}");
            }
        }
        Ok(None) => {}
        Err(error) => warn!(transformer_id = %id, "engine: failed to read progress: {error}"),
    }
}
