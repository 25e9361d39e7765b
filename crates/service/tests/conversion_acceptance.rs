use std::{io::Cursor, sync::Arc, time::Duration};

use async_trait::async_trait;
use event_bus::{BusError, BusMessage, Emitter};
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use imaging::{BlockingImageWorker, ImageJob, ImageWorker, ProcessedImage, ProcessingError};
use serde_json::json;
use service::{BasicMetadataExtractor, EngineConfig, ServiceContext, ServiceRuntime};
use shared::{
    domain::{
        FileId, FileKind, MediaMetadata, OptimizeSettings, ProjectId, ResizeSettings, TransformerId,
        TransformerSettings, TransformerStatus,
    },
    error::{ApiError, ErrorCode},
    models::{
        FileRecord, ProjectCreate, RawFile, TransformerProgress, TransformerUpdate,
    },
    protocol::{
        AssignFiles, CreateProject, DeleteFiles, DeleteProject, EventKind, ExecuteTransformer,
        GetFile, GetProject, GetTransformer, ImportFile, ListFiles, ListProjects,
        ListTransformers, ResetSystem, StopTransformer, UpdateTransformer,
    },
    query::{Filter, ListQuery},
};
use storage::Storage;
use tokio::sync::{mpsc, Semaphore};

const LIMIT: Duration = Duration::from_secs(10);

struct Harness {
    bus: Emitter,
    _ctx: ServiceContext,
    _runtime: ServiceRuntime,
}

async fn harness() -> Harness {
    harness_with(Arc::new(BlockingImageWorker), EngineConfig::default()).await
}

async fn harness_with(worker: Arc<dyn ImageWorker>, config: EngineConfig) -> Harness {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let bus = Emitter::new();
    let ctx = ServiceContext::with_workers(
        storage,
        bus.clone(),
        config,
        worker,
        Arc::new(BasicMetadataExtractor),
    );
    let runtime = service::start(&ctx);
    Harness {
        bus,
        _ctx: ctx,
        _runtime: runtime,
    }
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let image = RgbaImage::from_fn(width, height, |x, y| Rgba([(x * 2) as u8, (y * 4) as u8, 90, 255]));
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(image)
        .write_to(&mut buffer, ImageFormat::Png)
        .expect("encode png");
    buffer.into_inner()
}

async fn import(bus: &Emitter, name: &str, mime_type: &str, bytes: Vec<u8>) -> FileRecord {
    bus.call_within(
        &ImportFile {
            file: RawFile {
                name: name.to_string(),
                mime_type: mime_type.to_string(),
                bytes,
            },
        },
        LIMIT,
    )
    .await
    .expect("import")
    .data
}

async fn import_png(bus: &Emitter, name: &str) -> FileId {
    import(bus, name, "image/png", png(100, 50)).await.id
}

async fn create_project(bus: &Emitter, file_ids: Vec<FileId>) -> (ProjectId, TransformerId) {
    let created = bus
        .call_within(
            &CreateProject(ProjectCreate {
                name: "batch".into(),
                file_ids,
                ..ProjectCreate::default()
            }),
            LIMIT,
        )
        .await
        .expect("create project");
    let project = bus
        .call_within(&GetProject { id: created.id }, LIMIT)
        .await
        .expect("get project");
    let transformer = project.transformer.expect("project transformer");
    (created.id, transformer.id)
}

async fn configure(bus: &Emitter, id: TransformerId, settings: TransformerSettings) {
    bus.call_within(
        &UpdateTransformer {
            id,
            data: TransformerUpdate {
                settings: Some(settings),
            },
        },
        LIMIT,
    )
    .await
    .expect("configure");
}

/// Runs the transformer, returning the pending statuses seen and the outcome.
async fn execute(
    bus: &Emitter,
    id: TransformerId,
) -> (Vec<TransformerStatus>, Result<TransformerProgress, BusError>) {
    let mut statuses = Vec::new();
    let outcome = tokio::time::timeout(
        LIMIT,
        bus.call_with_updates(&ExecuteTransformer { id }, |response| {
            if !response.final_response {
                let progress: TransformerProgress =
                    serde_json::from_value(response.payload.clone()).expect("progress payload");
                assert_eq!(progress.id, id);
                statuses.push(progress.status);
            }
        }),
    )
    .await
    .expect("execution finished in time");
    (statuses, outcome)
}

fn rejection(result: Result<impl std::fmt::Debug, BusError>) -> ApiError {
    match result {
        Err(BusError::Rejected(error)) => error,
        other => panic!("expected a rejection, got {other:?}"),
    }
}

/// Blocks every job until the test releases it.
struct GatedWorker {
    started: mpsc::UnboundedSender<()>,
    gate: Arc<Semaphore>,
}

#[async_trait]
impl ImageWorker for GatedWorker {
    async fn process(&self, job: ImageJob) -> imaging::Result<ProcessedImage> {
        let _ = self.started.send(());
        self.gate
            .acquire()
            .await
            .map_err(|error| ProcessingError::Worker(error.to_string()))?
            .forget();
        BlockingImageWorker.process(job).await
    }
}

struct StalledWorker;

#[async_trait]
impl ImageWorker for StalledWorker {
    async fn process(&self, _job: ImageJob) -> imaging::Result<ProcessedImage> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn project_creation_assignment_and_cascade_acceptance() {
    let h = harness().await;
    let a = import_png(&h.bus, "a.png").await;
    let b = import_png(&h.bus, "b.png").await;
    let c = import_png(&h.bus, "c.png").await;

    let (project_id, transformer_id) = create_project(&h.bus, vec![a]).await;
    let transformer = h
        .bus
        .call_within(&GetTransformer { id: transformer_id }, LIMIT)
        .await
        .expect("transformer");
    assert_eq!(transformer.transformer.data.status, TransformerStatus::Idle);
    assert_eq!(transformer.transformer.data.kind, FileKind::Image);
    assert_eq!(transformer.project.map(|project| project.id), Some(project_id));

    for file_ids in [vec![a, b], vec![b, c]] {
        h.bus
            .call_within(
                &AssignFiles {
                    id: project_id,
                    file_ids,
                },
                LIMIT,
            )
            .await
            .expect("assign");
    }
    let project = h
        .bus
        .call_within(&GetProject { id: project_id }, LIMIT)
        .await
        .expect("project");
    assert_eq!(project.project.data.file_ids, vec![a, b, c]);
    assert_eq!(project.files.len(), 3);
    assert_eq!(project.kind, FileKind::Image);

    let listed = h
        .bus
        .call_within(&ListProjects::default(), LIMIT)
        .await
        .expect("list projects");
    assert_eq!(listed.len(), 1);

    h.bus
        .call_within(&DeleteProject { id: project_id }, LIMIT)
        .await
        .expect("delete project");
    let files = h
        .bus
        .call_within(&ListFiles::default(), LIMIT)
        .await
        .expect("list files");
    assert!(files.is_empty());
    let transformers = h
        .bus
        .call_within(&ListTransformers::default(), LIMIT)
        .await
        .expect("list transformers");
    assert!(transformers.is_empty());
    let missing = h.bus.call_within(&GetProject { id: project_id }, LIMIT).await;
    assert_eq!(rejection(missing).code, ErrorCode::NotFound);
}

/// The pending statuses of a run over `files` files that started from `before`.
fn progress_after(before: TransformerStatus, files: usize) -> Vec<TransformerStatus> {
    std::iter::once(before)
        .chain(std::iter::repeat(TransformerStatus::Running).take(files + 1))
        .collect()
}

#[tokio::test]
async fn optimize_only_execution_produces_one_result_per_source_acceptance() {
    let h = harness().await;
    let sources = vec![
        import_png(&h.bus, "first.png").await,
        import_png(&h.bus, "second.png").await,
        import_png(&h.bus, "third.png").await,
    ];
    let (_, transformer_id) = create_project(&h.bus, sources.clone()).await;
    configure(
        &h.bus,
        transformer_id,
        TransformerSettings {
            optimize: Some(OptimizeSettings::default()),
            ..TransformerSettings::default()
        },
    )
    .await;

    // One update when the run starts and one per converted file.
    let (statuses, outcome) = execute(&h.bus, transformer_id).await;
    assert_eq!(statuses, progress_after(TransformerStatus::Idle, sources.len()));
    assert_eq!(
        outcome.expect("execute"),
        TransformerProgress {
            id: transformer_id,
            status: TransformerStatus::Completed,
        }
    );

    let transformer = h
        .bus
        .call_within(&GetTransformer { id: transformer_id }, LIMIT)
        .await
        .expect("transformer");
    assert_eq!(transformer.transformer.data.status, TransformerStatus::Completed);
    let produced: Vec<_> = transformer
        .result_files
        .iter()
        .map(|file| file.data.source_file_id)
        .collect();
    assert_eq!(produced, sources.iter().copied().map(Some).collect::<Vec<_>>());
    let names: Vec<_> = transformer
        .result_files
        .iter()
        .map(|file| file.data.name.as_str())
        .collect();
    assert_eq!(names, ["first.png", "second.png", "third.png"]);
    assert!(transformer
        .result_files
        .iter()
        .all(|file| file.data.metadata.mime_type == "image/png"));

    // A second run replaces the first run's results.
    let first_results = transformer.transformer.data.result_file_ids.clone();
    let (statuses, outcome) = execute(&h.bus, transformer_id).await;
    assert_eq!(statuses, progress_after(TransformerStatus::Completed, sources.len()));
    outcome.expect("second execute");

    let files = h
        .bus
        .call_within(&ListFiles::default(), LIMIT)
        .await
        .expect("list files");
    assert_eq!(files.len(), 6);
    assert!(files.iter().all(|file| !first_results.contains(&file.id)));
}

#[tokio::test]
async fn half_size_resize_acceptance() {
    let h = harness().await;
    let source = import(&h.bus, "wide.png", "image/png", png(100, 50)).await;
    let MediaMetadata::Image(metadata) = &source.data.metadata.media else {
        panic!("expected image metadata");
    };
    assert_eq!((metadata.dimensions.width, metadata.dimensions.height), (100, 50));

    let (_, transformer_id) = create_project(&h.bus, vec![source.id]).await;
    configure(
        &h.bus,
        transformer_id,
        TransformerSettings {
            resize: Some(ResizeSettings {
                width: 50.0,
                height: 50.0,
                ..ResizeSettings::default()
            }),
            ..TransformerSettings::default()
        },
    )
    .await;
    execute(&h.bus, transformer_id).await.1.expect("execute");

    let transformer = h
        .bus
        .call_within(&GetTransformer { id: transformer_id }, LIMIT)
        .await
        .expect("transformer");
    let [result] = transformer.result_files.as_slice() else {
        panic!("expected one result, got {}", transformer.result_files.len());
    };
    let dimensions = result.data.metadata.dimensions().expect("result dimensions");
    assert_eq!((dimensions.width, dimensions.height), (50, 25));
}

#[tokio::test]
async fn document_transformer_fails_with_unsupported_kind_acceptance() {
    let h = harness().await;
    let doc = import(&h.bus, "notes.pdf", "application/pdf", b"%PDF-1.4".to_vec()).await;
    let (_, transformer_id) = create_project(&h.bus, vec![doc.id]).await;

    let (statuses, outcome) = execute(&h.bus, transformer_id).await;
    assert_eq!(statuses, vec![TransformerStatus::Idle, TransformerStatus::Running]);
    let error = rejection(outcome);
    assert_eq!(error.code, ErrorCode::UnsupportedKind);
    assert_eq!(
        error.details,
        Some(json!({ "id": transformer_id, "status": "error" }))
    );

    let transformer = h
        .bus
        .call_within(&GetTransformer { id: transformer_id }, LIMIT)
        .await
        .expect("transformer");
    assert_eq!(transformer.transformer.data.status, TransformerStatus::Error);
    assert!(transformer.result_files.is_empty());
}

#[tokio::test]
async fn stop_cancels_before_the_next_file_acceptance() {
    let (started_tx, mut started) = mpsc::unbounded_channel();
    let gate = Arc::new(Semaphore::new(0));
    let worker = GatedWorker {
        started: started_tx,
        gate: Arc::clone(&gate),
    };
    let h = harness_with(Arc::new(worker), EngineConfig::default()).await;
    let a = import_png(&h.bus, "a.png").await;
    let b = import_png(&h.bus, "b.png").await;
    let (_, transformer_id) = create_project(&h.bus, vec![a, b]).await;

    let bus = h.bus.clone();
    let run = tokio::spawn(async move { execute(&bus, transformer_id).await });
    tokio::time::timeout(LIMIT, started.recv())
        .await
        .expect("first file started")
        .expect("worker alive");

    let concurrent = h
        .bus
        .call_within(&ExecuteTransformer { id: transformer_id }, LIMIT)
        .await;
    assert_eq!(rejection(concurrent).code, ErrorCode::Validation);

    let stopping = h
        .bus
        .call_within(&StopTransformer { id: transformer_id }, LIMIT)
        .await
        .expect("stop");
    assert_eq!(stopping.status, TransformerStatus::Running);
    gate.add_permits(2);

    let (statuses, outcome) = run.await.expect("run task");
    assert_eq!(statuses, progress_after(TransformerStatus::Idle, 1));
    assert_eq!(outcome.expect("execute").status, TransformerStatus::Canceled);

    let transformer = h
        .bus
        .call_within(&GetTransformer { id: transformer_id }, LIMIT)
        .await
        .expect("transformer");
    assert_eq!(transformer.transformer.data.status, TransformerStatus::Canceled);
    assert_eq!(transformer.result_files.len(), 1);
    assert_eq!(transformer.result_files[0].data.source_file_id, Some(a));
}

#[tokio::test]
async fn stalled_step_times_out_acceptance() {
    let config = EngineConfig {
        step_timeout: Some(Duration::from_millis(50)),
    };
    let h = harness_with(Arc::new(StalledWorker), config).await;
    let a = import_png(&h.bus, "a.png").await;
    let (_, transformer_id) = create_project(&h.bus, vec![a]).await;

    let (_, outcome) = execute(&h.bus, transformer_id).await;
    assert_eq!(rejection(outcome).code, ErrorCode::Processing);

    let transformer = h
        .bus
        .call_within(&GetTransformer { id: transformer_id }, LIMIT)
        .await
        .expect("transformer");
    assert_eq!(transformer.transformer.data.status, TransformerStatus::Error);
}

#[tokio::test]
async fn request_errors_and_idempotent_deletes_acceptance() {
    let h = harness().await;
    let a = import_png(&h.bus, "a.png").await;

    for _ in 0..2 {
        h.bus
            .call_within(&DeleteFiles { ids: vec![a] }, LIMIT)
            .await
            .expect("delete is idempotent");
    }

    let missing = h.bus.call_within(&GetFile { id: a }, LIMIT).await;
    assert_eq!(rejection(missing).code, ErrorCode::NotFound);

    let two_operators = Filter {
        eq: Some(json!("a.png")),
        ne: Some(json!("b.png")),
        ..Filter::default()
    };
    let invalid = h
        .bus
        .call_within(&ListFiles(ListQuery::new().filter("name", two_operators)), LIMIT)
        .await;
    assert_eq!(rejection(invalid).code, ErrorCode::Validation);

    let malformed = h
        .bus
        .request(EventKind::FilesGet, &json!({ "id": "not-a-uuid" }), |_| {})
        .await;
    assert_eq!(rejection(malformed).code, ErrorCode::Validation);

    let unknown_transformer = h
        .bus
        .call_within(&ExecuteTransformer { id: TransformerId::new() }, LIMIT)
        .await;
    assert_eq!(rejection(unknown_transformer).code, ErrorCode::NotFound);
    assert_eq!(h.bus.in_flight(), 0);
}

#[tokio::test]
async fn reset_and_change_broadcasts_acceptance() {
    let h = harness().await;
    let (sender, mut published) = mpsc::unbounded_channel();
    h.bus.on(EventKind::FilesPub, move |message| {
        let sender = sender.clone();
        async move {
            if let BusMessage::Event(event) = message {
                let _ = sender.send(event.payload.clone());
            }
        }
    });

    let a = import_png(&h.bus, "a.png").await;
    loop {
        let listing = tokio::time::timeout(LIMIT, published.recv())
            .await
            .expect("files.pub in time")
            .expect("subscriber alive");
        let files: Vec<FileRecord> = serde_json::from_value(listing).expect("file listing");
        if files.iter().any(|file| file.id == a) {
            break;
        }
    }

    create_project(&h.bus, vec![a]).await;
    h.bus
        .call_within(&ResetSystem, LIMIT)
        .await
        .expect("reset");

    let files = h
        .bus
        .call_within(&ListFiles::default(), LIMIT)
        .await
        .expect("files");
    let projects = h
        .bus
        .call_within(&ListProjects::default(), LIMIT)
        .await
        .expect("projects");
    assert!(files.is_empty());
    assert!(projects.is_empty());
}
