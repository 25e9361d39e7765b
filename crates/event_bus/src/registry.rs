use std::{future::Future, panic::AssertUnwindSafe, sync::Arc};

use futures::{future::BoxFuture, FutureExt};
use serde_json::Value;
use tracing::{debug, error, warn};

use shared::{error::ApiError, protocol::EventKind};

use crate::{BusMessage, Emitter, Responder, Subscription};

pub type HandlerFuture = BoxFuture<'static, Result<(), ApiError>>;

type Handler = Arc<dyn Fn(Value, Responder) -> HandlerFuture + Send + Sync>;

/// A named set of request handlers subscribed to the bus together.
///
/// Handlers answer through the [`Responder`] they are given. Returning
/// `Err` before a final response makes the group answer with that error.
pub struct HandlerGroup {
    name: &'static str,
    handlers: Vec<(EventKind, Handler)>,
}

impl HandlerGroup {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            handlers: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn on<F, Fut>(mut self, kind: EventKind, handler: F) -> Self
    where
        F: Fn(Value, Responder) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ApiError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |payload, responder| handler(payload, responder).boxed());
        self.handlers.push((kind, handler));
        self
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.handlers.iter().map(|(kind, _)| *kind).collect()
    }

    pub fn subscribe(self, emitter: &Emitter) -> Vec<Subscription> {
        let group = self.name;
        self.handlers
            .into_iter()
            .map(|(kind, handler)| {
                let bus = emitter.downgrade();
                emitter.on(kind, move |message| {
                    let handler = Arc::clone(&handler);
                    let bus = bus.clone();
                    async move {
                        let (BusMessage::Event(envelope), Some(emitter)) = (message, bus.upgrade())
                        else {
                            return;
                        };
                        let responder = Responder::new(emitter, Arc::clone(&envelope));
                        let outcome =
                            AssertUnwindSafe(handler(envelope.payload.clone(), responder.clone()))
                                .catch_unwind()
                                .await;

                        match outcome {
                            Ok(Ok(())) if responder.is_finished() => {}
                            Ok(Ok(())) => {
                                error!(
                                    group,
                                    %kind,
                                    event_id = %envelope.event_id,
                                    "bus: handler returned without a final response"
                                );
                                let _ = responder
                                    .error(&ApiError::internal("handler produced no response"));
                            }
                            Ok(Err(failure)) if responder.is_finished() => {
                                warn!(
                                    group,
                                    %kind,
                                    event_id = %envelope.event_id,
                                    %failure,
                                    "bus: handler failed after responding"
                                );
                            }
                            Ok(Err(failure)) => {
                                debug!(
                                    group,
                                    %kind,
                                    event_id = %envelope.event_id,
                                    %failure,
                                    "bus: handler failed"
                                );
                                let _ = responder.error(&failure);
                            }
                            Err(_) => {
                                error!(
                                    group,
                                    %kind,
                                    event_id = %envelope.event_id,
                                    "bus: handler panicked, request abandoned"
                                );
                            }
                        }
                    }
                })
            })
            .collect()
    }
}
