use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use event_bus::Emitter;
use shared::protocol::EventKind;

use crate::{controllers::EntityController, ServiceContext};

/// Broadcasts the full serialized listing of each entity on its `*.pub`
/// topic whenever the underlying data changes.
pub struct ChangeNotifier {
    tasks: Vec<JoinHandle<()>>,
}

impl ChangeNotifier {
    pub fn spawn(ctx: &ServiceContext) -> Self {
        let tasks = vec![
            publish(ctx.files.clone(), ctx.emitter.clone(), EventKind::FilesPub),
            publish(ctx.projects.clone(), ctx.emitter.clone(), EventKind::ProjectsPub),
            publish(ctx.transformers.clone(), ctx.emitter.clone(), EventKind::TransformersPub),
        ];
        Self { tasks }
    }

    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

fn publish<C: EntityController>(controller: C, emitter: Emitter, kind: EventKind) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut listings = controller.live_query_all();
        while let Some(listing) = listings.next().await {
            match listing {
                Ok(models) => match emitter.emit(kind, &models) {
                    Ok(event_id) => debug!(%kind, %event_id, count = models.len(), "notifier: published"),
                    Err(error) => warn!(%kind, "notifier: failed to publish: {error}"),
                },
                Err(error) => warn!(%kind, "notifier: live query failed: {error}"),
            }
        }
        debug!(%kind, "notifier: change feed closed");
    })
}
