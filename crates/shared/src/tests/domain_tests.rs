use super::*;
use serde_json::json;

#[test]
fn classifies_mime_types() {
    assert_eq!(FileKind::from_mime("image/png"), FileKind::Image);
    assert_eq!(FileKind::from_mime("video/mp4"), FileKind::Video);
    assert_eq!(FileKind::from_mime("audio/ogg"), FileKind::Audio);
    assert_eq!(FileKind::from_mime("text/markdown"), FileKind::Text);
    assert_eq!(FileKind::from_mime("application/pdf"), FileKind::Document);
    assert_eq!(
        FileKind::from_mime("application/vnd.oasis.opendocument.text"),
        FileKind::Text
    );
    assert_eq!(FileKind::from_mime("application/zip"), FileKind::Unknown);
}

#[test]
fn common_kind_falls_back_to_unknown() {
    assert_eq!(FileKind::common([FileKind::Image, FileKind::Image]), FileKind::Image);
    assert_eq!(FileKind::common([FileKind::Image, FileKind::Audio]), FileKind::Unknown);
    assert_eq!(FileKind::common(Vec::new()), FileKind::Unknown);
}

#[test]
fn status_transitions_follow_run_lifecycle() {
    use TransformerStatus::*;
    assert!(Idle.can_transition_to(Running));
    assert!(Running.can_transition_to(Completed));
    assert!(Running.can_transition_to(Error));
    assert!(Running.can_transition_to(Canceled));
    assert!(Completed.can_transition_to(Running));
    assert!(!Idle.can_transition_to(Completed));
    assert!(!Running.can_transition_to(Running));
    assert!(!Completed.can_transition_to(Error));
}

#[test]
fn metadata_serializes_flat_with_type_tag() {
    let metadata = FileMetadata {
        size: 42,
        mime_type: "image/png".into(),
        media: MediaMetadata::Image(ImageMetadata {
            dimensions: Dimensions {
                width: 100,
                height: 50,
            },
            color_space: None,
            has_alpha: Some(true),
            dpi: None,
        }),
    };
    let value = serde_json::to_value(&metadata).expect("serialize");
    assert_eq!(
        value,
        json!({
            "size": 42,
            "mimeType": "image/png",
            "type": "image",
            "dimensions": {"width": 100, "height": 50},
            "hasAlpha": true
        })
    );
    let back: FileMetadata = serde_json::from_value(value).expect("deserialize");
    assert_eq!(back, metadata);

    let base: FileMetadata =
        serde_json::from_value(json!({"size": 3, "mimeType": "application/zip", "type": "base"}))
            .expect("base");
    assert_eq!(base.media, MediaMetadata::Base);
    assert_eq!(base.dimensions(), None);
}

#[test]
fn settings_fill_defaults_and_report_unsupported_features() {
    let settings: TransformerSettings = serde_json::from_value(json!({
        "resize": {"width": 50},
        "rotate": {"angle": 180},
        "optimize": {}
    }))
    .expect("settings");

    let resize = settings.resize.clone().expect("resize");
    assert_eq!(resize.width, 50.0);
    assert_eq!(resize.height, 100.0);
    assert!(resize.maintain_aspect_ratio);
    assert_eq!(resize.method, ResizeMethod::Lanczos3);
    assert_eq!(settings.rotate.map(|r| r.angle), Some(Rotation::Half));
    assert_eq!(settings.optimize, Some(OptimizeSettings::default()));

    assert!(settings.unsupported_features(FileKind::Image).is_empty());
    assert_eq!(
        settings.unsupported_features(FileKind::Video),
        vec![Feature::Rotate, Feature::Optimize]
    );
    assert_eq!(settings.unsupported_features(FileKind::Document).len(), 3);
}

#[test]
fn rejects_unsupported_rotation() {
    let result = serde_json::from_value::<RotateSettings>(json!({"angle": 45}));
    assert!(result.is_err());
}

#[test]
fn ids_round_trip_through_strings() {
    let id = FileId::new();
    let parsed: FileId = id.to_string().parse().expect("parse");
    assert_eq!(parsed, id);
    assert_eq!(serde_json::to_value(id).expect("json"), json!(id.to_string()));
}
