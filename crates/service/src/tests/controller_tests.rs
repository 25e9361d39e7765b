use std::{io::Cursor, sync::Arc};

use async_trait::async_trait;
use futures::StreamExt;
use image::{DynamicImage, ImageFormat, RgbaImage};
use serde_json::json;

use shared::{
    domain::{
        CropSettings, FileId, FileKind, FileMetadata, MediaMetadata, ProjectId, ResizeSettings,
        RotateSettings, Rotation, TransformerSettings, TransformerStatus, TrimSettings,
    },
    error::ErrorCode,
    models::{FileUpdate, ProjectCreate, RawFile, TransformerCreate, TransformerUpdate},
};

use super::*;
use crate::metadata::{BasicMetadataExtractor, MetadataExtractor};

struct Controllers {
    files: FileController,
    projects: ProjectController,
    transformers: TransformerController,
}

async fn setup() -> Controllers {
    setup_with(Arc::new(BasicMetadataExtractor)).await
}

async fn setup_with(extractor: Arc<dyn MetadataExtractor>) -> Controllers {
    let storage = Storage::new("sqlite::memory:").await.expect("storage");
    Controllers {
        files: FileController::new(storage.clone(), extractor),
        projects: ProjectController::new(storage.clone()),
        transformers: TransformerController::new(storage),
    }
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(RgbaImage::new(width, height))
        .write_to(&mut buffer, ImageFormat::Png)
        .expect("encode png");
    buffer.into_inner()
}

fn raw(name: &str, mime_type: &str, bytes: Vec<u8>) -> RawFile {
    RawFile {
        name: name.to_string(),
        mime_type: mime_type.to_string(),
        bytes,
    }
}

async fn image(files: &FileController, name: &str) -> FileId {
    files
        .import(raw(name, "image/png", png(4, 2)))
        .await
        .expect("import")
        .id
}

fn project(name: &str, file_ids: Vec<FileId>) -> ProjectCreate {
    ProjectCreate {
        name: name.to_string(),
        file_ids,
        ..ProjectCreate::default()
    }
}

struct Unreadable;

#[async_trait]
impl MetadataExtractor for Unreadable {
    async fn extract(&self, _file: &RawFile, _kind: FileKind) -> anyhow::Result<FileMetadata> {
        anyhow::bail!("probe crashed")
    }
}

#[tokio::test]
async fn import_classifies_and_probes_images() {
    let c = setup().await;
    let file = c
        .files
        .import(raw("photo.png", "image/png", png(100, 50)))
        .await
        .expect("import");

    assert_eq!(file.data.kind, FileKind::Image);
    assert_eq!(file.data.original_name, "photo.png");
    assert_eq!(file.data.size, file.data.blob.len() as u64);
    let MediaMetadata::Image(metadata) = &file.data.metadata.media else {
        panic!("expected image metadata, got {:?}", file.data.metadata.media);
    };
    assert_eq!((metadata.dimensions.width, metadata.dimensions.height), (100, 50));
}

#[tokio::test]
async fn import_describes_documents_by_name() {
    let c = setup().await;
    let file = c
        .files
        .import(raw("report.final.pdf", "application/pdf", b"%PDF-1.4".to_vec()))
        .await
        .expect("import");

    assert_eq!(file.data.kind, FileKind::Document);
    let MediaMetadata::Document(metadata) = &file.data.metadata.media else {
        panic!("expected document metadata");
    };
    assert_eq!(metadata.page_count, Some(1));
    assert_eq!(metadata.title.as_deref(), Some("report.final"));
}

#[tokio::test]
async fn failed_extraction_falls_back_to_base_metadata() {
    let c = setup_with(Arc::new(Unreadable)).await;
    let file = c
        .files
        .import(raw("photo.png", "image/png", png(2, 2)))
        .await
        .expect("import");

    assert_eq!(file.data.kind, FileKind::Image);
    assert_eq!(file.data.metadata.media, MediaMetadata::Base);
    assert_eq!(file.data.metadata.mime_type, "image/png");
}

#[tokio::test]
async fn project_creation_claims_files_and_adds_idle_transformer() {
    let c = setup().await;
    let a = image(&c.files, "a.png").await;
    let b = image(&c.files, "b.png").await;

    let project = c
        .projects
        .create(project("album", vec![a, b, a]))
        .await
        .expect("create");
    assert_eq!(project.data.file_ids, vec![a, b]);

    let transformer = c
        .transformers
        .get_by_project(project.id)
        .await
        .expect("query")
        .expect("transformer");
    assert_eq!(transformer.data.kind, FileKind::Image);
    assert_eq!(transformer.data.status, TransformerStatus::Idle);
    assert!(transformer.data.result_file_ids.is_empty());

    let claimed = c.files.fetch_many(&[a, b]).await.expect("files");
    assert!(claimed.iter().all(|file| file.data.project_id == Some(project.id)));

    let model = c
        .projects
        .get_by_id(project.id)
        .await
        .expect("get")
        .expect("model");
    assert_eq!(model.files.len(), 2);
    assert_eq!(model.kind, FileKind::Image);
    assert_eq!(model.size, claimed.iter().map(|file| file.data.size).sum::<u64>());
    assert_eq!(model.transformer.map(|t| t.id), Some(transformer.id));
}

#[tokio::test]
async fn mixed_projects_get_an_unknown_transformer() {
    let c = setup().await;
    let a = image(&c.files, "a.png").await;
    let doc = c
        .files
        .import(raw("notes.pdf", "application/pdf", vec![1, 2, 3]))
        .await
        .expect("import")
        .id;

    let project = c
        .projects
        .create(project("mixed", vec![a, doc]))
        .await
        .expect("create");
    let transformer = c
        .transformers
        .get_by_project(project.id)
        .await
        .expect("query")
        .expect("transformer");
    assert_eq!(transformer.data.kind, FileKind::Unknown);
}

#[tokio::test]
async fn project_creation_with_missing_file_writes_nothing() {
    let c = setup().await;
    let a = image(&c.files, "a.png").await;

    let error = c
        .projects
        .create(project("broken", vec![a, FileId::new()]))
        .await
        .expect_err("missing file");
    assert_eq!(error.code(), ErrorCode::NotFound);

    let projects = c.projects.get_many(&ListQuery::new()).await.expect("list");
    assert!(projects.is_empty());
    let transformers = c.transformers.get_many(&ListQuery::new()).await.expect("list");
    assert!(transformers.is_empty());
    let file = c.files.fetch_many(&[a]).await.expect("file");
    assert_eq!(file[0].data.project_id, None);
}

#[tokio::test]
async fn assigning_files_appends_without_repeats() {
    let c = setup().await;
    let a = image(&c.files, "a.png").await;
    let b = image(&c.files, "b.png").await;
    let d = image(&c.files, "c.png").await;
    let project = c.projects.create(project("p", Vec::new())).await.expect("create");

    c.projects.assign_files(project.id, &[a, b]).await.expect("assign");
    let updated = c.projects.assign_files(project.id, &[b, d]).await.expect("assign");

    assert_eq!(updated.data.file_ids, vec![a, b, d]);
    let missing = c.projects.assign_files(project.id, &[FileId::new()]).await;
    assert!(matches!(missing, Err(ServiceError::NotFound { entity: "file", .. })));
}

#[tokio::test]
async fn assigning_files_retargets_an_untouched_transformer() {
    let c = setup().await;
    let project = c.projects.create(project("empty", Vec::new())).await.expect("create");
    let transformer = c
        .transformers
        .get_by_project(project.id)
        .await
        .expect("query")
        .expect("transformer");
    assert_eq!(transformer.data.kind, FileKind::Unknown);

    let a = image(&c.files, "a.png").await;
    let b = image(&c.files, "b.png").await;
    c.projects.assign_files(project.id, &[a, b]).await.expect("assign");
    let transformer = c
        .transformers
        .get(transformer.id)
        .await
        .expect("get")
        .expect("transformer");
    assert_eq!(transformer.data.kind, FileKind::Image);

    let rotate = TransformerUpdate {
        settings: Some(TransformerSettings {
            rotate: Some(RotateSettings {
                angle: Rotation::Quarter,
            }),
            ..TransformerSettings::default()
        }),
    };
    c.transformers
        .update(transformer.id, &rotate)
        .await
        .expect("configure");

    let doc = c
        .files
        .import(raw("notes.pdf", "application/pdf", b"%PDF-1.4".to_vec()))
        .await
        .expect("import")
        .id;
    c.projects.assign_files(project.id, &[doc]).await.expect("assign doc");
    let transformer = c
        .transformers
        .get(transformer.id)
        .await
        .expect("get")
        .expect("transformer");
    assert_eq!(transformer.data.kind, FileKind::Image);
}

#[tokio::test]
async fn deleting_a_project_cascades() {
    let c = setup().await;
    let a = image(&c.files, "a.png").await;
    let keep = image(&c.files, "keep.png").await;
    let project = c.projects.create(project("p", vec![a])).await.expect("create");
    let transformer = c
        .transformers
        .get_by_project(project.id)
        .await
        .expect("query")
        .expect("transformer");

    let result = c
        .files
        .import_result(ResultFile {
            file: raw("a.webp", "image/webp", vec![0; 4]),
            source_file_id: a,
            project_id: project.id,
        })
        .await
        .expect("result");
    c.transformers
        .append_result(transformer.id, result.id)
        .await
        .expect("append");

    assert!(c.projects.delete(project.id).await.expect("delete"));
    assert!(c.projects.base().get(project.id).await.expect("get").is_none());
    assert!(c.transformers.get(transformer.id).await.expect("get").is_none());
    let remaining = c.files.fetch_many(&[a, result.id, keep]).await.expect("files");
    assert_eq!(remaining.iter().map(|file| file.id).collect::<Vec<_>>(), vec![keep]);

    assert!(!c.projects.delete(project.id).await.expect("delete again"));
}

#[tokio::test]
async fn deleting_a_project_strips_its_files_from_other_projects() {
    let c = setup().await;
    let shared_file = image(&c.files, "shared.png").await;
    let other_file = image(&c.files, "other.png").await;

    let first = c
        .projects
        .create(project("first", vec![shared_file]))
        .await
        .expect("first");
    let second = c
        .projects
        .create(project("second", vec![other_file]))
        .await
        .expect("second");
    c.projects
        .assign_files(second.id, &[shared_file])
        .await
        .expect("assign");

    // The shared file is now owned by the second project but still listed by
    // the first one.
    assert!(c.projects.delete(second.id).await.expect("delete second"));
    let first = c.projects.base().require(first.id).await.expect("first");
    assert!(first.data.file_ids.is_empty());

    let third = c
        .projects
        .create(project("third", Vec::new()))
        .await
        .expect("third");
    let kept = image(&c.files, "kept.png").await;
    let fourth = c
        .projects
        .create(project("fourth", vec![kept]))
        .await
        .expect("fourth");
    c.projects
        .assign_files(third.id, &[kept])
        .await
        .expect("assign kept");

    assert!(c.projects.delete(fourth.id).await.expect("delete fourth"));
    let third = c.projects.base().require(third.id).await.expect("third");
    assert!(third.data.file_ids.is_empty());
    assert!(c.files.fetch_many(&[kept]).await.expect("files").is_empty());
}

#[tokio::test]
async fn deleting_a_transformer_removes_its_results() {
    let c = setup().await;
    let a = image(&c.files, "a.png").await;
    let project = c.projects.create(project("p", vec![a])).await.expect("create");
    let transformer = c
        .transformers
        .get_by_project(project.id)
        .await
        .expect("query")
        .expect("transformer");
    let result = c
        .files
        .import_result(ResultFile {
            file: raw("a.png", "image/png", png(1, 1)),
            source_file_id: a,
            project_id: project.id,
        })
        .await
        .expect("result");
    assert_eq!(result.data.source_file_id, Some(a));
    c.transformers
        .append_result(transformer.id, result.id)
        .await
        .expect("append");

    let unassigned = c
        .transformers
        .unassign_files(transformer.id, &[result.id])
        .await
        .expect("unassign");
    assert!(unassigned.data.result_file_ids.is_empty());
    assert_eq!(c.files.fetch_many(&[result.id]).await.expect("kept").len(), 1);
    c.transformers
        .append_result(transformer.id, result.id)
        .await
        .expect("append again");

    assert!(c.transformers.delete(transformer.id).await.expect("delete"));
    let remaining = c.files.fetch_many(&[a, result.id]).await.expect("files");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, a);
}

#[tokio::test]
async fn deleting_files_drops_references() {
    let c = setup().await;
    let a = image(&c.files, "a.png").await;
    let b = image(&c.files, "b.png").await;
    let project = c.projects.create(project("p", vec![a, b])).await.expect("create");

    assert_eq!(c.files.delete_many(&[a, FileId::new()]).await.expect("delete"), 1);
    assert_eq!(c.files.delete_many(&[a]).await.expect("delete again"), 0);
    assert_eq!(c.files.delete_many(&[]).await.expect("empty"), 0);

    let project = c.projects.base().require(project.id).await.expect("project");
    assert_eq!(project.data.file_ids, vec![b]);
}

#[tokio::test]
async fn one_transformer_per_project() {
    let c = setup().await;
    let project = c.projects.create(project("p", Vec::new())).await.expect("create");

    let duplicate = c
        .transformers
        .create(TransformerCreate {
            project_id: project.id,
            kind: FileKind::Image,
            settings: TransformerSettings::default(),
        })
        .await;
    assert!(matches!(duplicate, Err(ServiceError::Validation(_))));

    let orphan = c
        .transformers
        .create(TransformerCreate {
            project_id: ProjectId::new(),
            kind: FileKind::Image,
            settings: TransformerSettings::default(),
        })
        .await;
    assert!(matches!(orphan, Err(ServiceError::NotFound { entity: "project", .. })));
}

#[tokio::test]
async fn settings_must_fit_the_transformer_kind() {
    let c = setup().await;
    let a = image(&c.files, "a.png").await;
    let project = c.projects.create(project("p", vec![a])).await.expect("create");
    let transformer = c
        .transformers
        .get_by_project(project.id)
        .await
        .expect("query")
        .expect("transformer");

    let trim = TransformerUpdate {
        settings: Some(TransformerSettings {
            trim: Some(TrimSettings {
                start: 0.0,
                end: 1.0,
            }),
            ..TransformerSettings::default()
        }),
    };
    let error = c
        .transformers
        .update(transformer.id, &trim)
        .await
        .expect_err("image transformers cannot trim");
    assert!(error.to_string().contains("trim"), "{error}");

    let rotate = TransformerUpdate {
        settings: Some(TransformerSettings {
            rotate: Some(RotateSettings {
                angle: Rotation::Half,
            }),
            ..TransformerSettings::default()
        }),
    };
    let updated = c
        .transformers
        .update(transformer.id, &rotate)
        .await
        .expect("update");
    assert_eq!(updated.data.settings, rotate.settings.expect("settings"));
}

#[tokio::test]
async fn geometry_percentages_are_range_checked() {
    let c = setup().await;
    let a = image(&c.files, "a.png").await;
    let project = c.projects.create(project("p", vec![a])).await.expect("create");
    let transformer = c
        .transformers
        .get_by_project(project.id)
        .await
        .expect("query")
        .expect("transformer");

    let oversized = TransformerUpdate {
        settings: Some(TransformerSettings {
            resize: Some(ResizeSettings {
                width: 5000.0,
                height: -20.0,
                ..ResizeSettings::default()
            }),
            ..TransformerSettings::default()
        }),
    };
    let error = c
        .transformers
        .update(transformer.id, &oversized)
        .await
        .expect_err("resize outside 0-100");
    assert!(matches!(error, ServiceError::Validation(_)));
    assert!(error.to_string().contains("resize.width"), "{error}");
    assert!(error.to_string().contains("resize.height"), "{error}");

    for crop in [
        CropSettings {
            x: 100.0,
            ..CropSettings::default()
        },
        CropSettings {
            width: 0.0,
            ..CropSettings::default()
        },
        CropSettings {
            y: f64::NAN,
            ..CropSettings::default()
        },
    ] {
        let update = TransformerUpdate {
            settings: Some(TransformerSettings {
                crop: Some(crop),
                ..TransformerSettings::default()
            }),
        };
        let rejected = c.transformers.update(transformer.id, &update).await;
        assert!(matches!(rejected, Err(ServiceError::Validation(_))), "{crop:?}");
    }

    let stored = c
        .transformers
        .get(transformer.id)
        .await
        .expect("get")
        .expect("transformer");
    assert_eq!(stored.data.settings, TransformerSettings::default());

    assert!(c.transformers.delete(transformer.id).await.expect("delete"));
    let create = c
        .transformers
        .create(TransformerCreate {
            project_id: project.id,
            kind: FileKind::Image,
            settings: oversized.settings.clone().expect("settings"),
        })
        .await;
    assert!(matches!(create, Err(ServiceError::Validation(_))));

    let edges = TransformerSettings {
        resize: Some(ResizeSettings {
            width: 100.0,
            height: 0.5,
            ..ResizeSettings::default()
        }),
        crop: Some(CropSettings {
            x: 0.0,
            y: 99.0,
            width: 100.0,
            height: 1.0,
        }),
        ..TransformerSettings::default()
    };
    let created = c
        .transformers
        .create(TransformerCreate {
            project_id: project.id,
            kind: FileKind::Image,
            settings: edges.clone(),
        })
        .await
        .expect("in-range settings");
    assert_eq!(created.data.settings, edges);
}

#[tokio::test]
async fn status_changes_follow_the_lifecycle() {
    let c = setup().await;
    let project = c.projects.create(project("p", Vec::new())).await.expect("create");
    let transformer = c
        .transformers
        .get_by_project(project.id)
        .await
        .expect("query")
        .expect("transformer");

    let skipped = c
        .transformers
        .update_status(transformer.id, TransformerStatus::Completed)
        .await;
    assert!(matches!(skipped, Err(ServiceError::Validation(_))));

    let (running, previous) = c.transformers.begin_run(transformer.id).await.expect("begin");
    assert_eq!(running.data.status, TransformerStatus::Running);
    assert!(previous.is_empty());
    assert!(c.transformers.begin_run(transformer.id).await.is_err());

    let done = c
        .transformers
        .update_status(transformer.id, TransformerStatus::Canceled)
        .await
        .expect("cancel");
    assert_eq!(done.data.status, TransformerStatus::Canceled);
}

#[tokio::test]
async fn partial_updates_must_be_objects() {
    let c = setup().await;
    let a = image(&c.files, "a.png").await;

    let error = c.files.base().update(a, &json!(5)).await.expect_err("not an object");
    assert_eq!(error.code(), ErrorCode::Validation);

    let renamed = c
        .files
        .update(
            a,
            &FileUpdate {
                name: Some("renamed.png".into()),
                metadata: None,
            },
        )
        .await
        .expect("rename");
    assert_eq!(renamed.data.name, "renamed.png");
    assert_eq!(renamed.data.original_name, "a.png");

    let missing = c.files.update(FileId::new(), &FileUpdate::default()).await;
    assert!(matches!(missing, Err(ServiceError::NotFound { entity: "file", .. })));
}

#[tokio::test]
async fn live_queries_reevaluate_after_commits() {
    let c = setup().await;
    let mut listings = c.files.live_query_all();

    let initial = listings.next().await.expect("initial").expect("listing");
    assert!(initial.is_empty());

    let a = image(&c.files, "a.png").await;
    let next = listings.next().await.expect("next").expect("listing");
    assert_eq!(next.iter().map(|file| file.id).collect::<Vec<_>>(), vec![a]);
}

#[test]
fn dedup_keeps_first_occurrences() {
    assert_eq!(dedup([3, 1, 3, 2, 1]), vec![3, 1, 2]);
}
