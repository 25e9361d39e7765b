//! Application core: entity controllers, the transformer engine and the bus
//! handlers that expose them.

use std::sync::Arc;

use event_bus::{Emitter, Subscription};
use imaging::{BlockingImageWorker, ImageWorker};
use storage::Storage;
use tracing::info;

pub mod controllers;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod metadata;
pub mod notifier;

pub use controllers::{
    BaseController, EntityController, FileController, ProjectController, ResultFile,
    TransformerController,
};
pub use engine::{EngineConfig, TransformerEngine};
pub use error::{Result, ServiceError};
pub use metadata::{BasicMetadataExtractor, MetadataExtractor};
pub use notifier::ChangeNotifier;

#[derive(Clone)]
pub struct ServiceContext {
    pub storage: Storage,
    pub emitter: Emitter,
    pub files: FileController,
    pub projects: ProjectController,
    pub transformers: TransformerController,
    pub engine: TransformerEngine,
}

impl ServiceContext {
    /// Builds the context with the in-process image worker and metadata
    /// extractor.
    pub fn new(storage: Storage, emitter: Emitter, config: EngineConfig) -> Self {
        Self::with_workers(
            storage,
            emitter,
            config,
            Arc::new(BlockingImageWorker),
            Arc::new(BasicMetadataExtractor),
        )
    }

    pub fn with_workers(
        storage: Storage,
        emitter: Emitter,
        config: EngineConfig,
        worker: Arc<dyn ImageWorker>,
        extractor: Arc<dyn MetadataExtractor>,
    ) -> Self {
        let files = FileController::new(storage.clone(), extractor);
        let projects = ProjectController::new(storage.clone());
        let transformers = TransformerController::new(storage.clone());
        let engine = TransformerEngine::new(
            files.clone(),
            projects.clone(),
            transformers.clone(),
            worker,
            config,
        );

        Self {
            storage,
            emitter,
            files,
            projects,
            transformers,
            engine,
        }
    }
}

/// Handlers and broadcasters attached to a bus.
pub struct ServiceRuntime {
    subscriptions: Vec<Subscription>,
    notifier: ChangeNotifier,
}

impl ServiceRuntime {
    pub fn subscriptions(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn shutdown(self) {
        for subscription in self.subscriptions {
            subscription.unsubscribe();
        }
        self.notifier.shutdown();
    }
}

/// Registers every request handler on the context's bus and starts the
/// change notifier. Must be called inside a Tokio runtime.
pub fn start(ctx: &ServiceContext) -> ServiceRuntime {
    let groups = [
        handlers::file_handlers(ctx),
        handlers::project_handlers(ctx),
        handlers::transformer_handlers(ctx),
        handlers::system_handlers(ctx),
    ];

    let mut subscriptions = Vec::new();
    for group in groups {
        let name = group.name();
        let kinds = group.kinds().len();
        subscriptions.extend(group.subscribe(&ctx.emitter));
        info!(group = name, handlers = kinds, "service: handlers registered");
    }

    ServiceRuntime {
        subscriptions,
        notifier: ChangeNotifier::spawn(ctx),
    }
}
