//! In-process publish/subscribe bus with request/response correlation.
//!
//! Every emitted event gets a fresh [`EventId`]. Handlers answer through a
//! [`Responder`], which publishes zero or more pending responses followed by
//! exactly one final response on the `<kind>.resp` topic. [`Emitter::request`]
//! waits for that final response and forwards everything before it.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, RwLock, Weak,
    },
    time::Duration,
};

use chrono::Utc;
use futures::{future::BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use shared::{
    error::ApiError,
    protocol::{
        EventEnvelope, EventId, EventKind, EventStatus, Request, ResponseEnvelope, Topic,
    },
};

mod registry;
mod responder;

pub use registry::{HandlerFuture, HandlerGroup};
pub use responder::Responder;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode payload: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("request rejected: {0}")]
    Rejected(ApiError),
    #[error("event {0} already has a final response")]
    AlreadyResponded(EventId),
    #[error("response stream closed before a final response")]
    Closed,
    #[error("request timed out after {0:?}")]
    TimedOut(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A message as delivered to subscribers.
#[derive(Debug, Clone)]
pub enum BusMessage {
    Event(Arc<EventEnvelope>),
    Response(Arc<ResponseEnvelope>),
}

impl BusMessage {
    pub fn topic(&self) -> Topic {
        match self {
            Self::Event(event) => Topic::Event(event.kind),
            Self::Response(response) => response.kind,
        }
    }

    pub fn event_id(&self) -> EventId {
        match self {
            Self::Event(event) => event.event_id,
            Self::Response(response) => response.event_id,
        }
    }
}

/// One or more topics to subscribe to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSet(Vec<Topic>);

impl From<Topic> for TopicSet {
    fn from(value: Topic) -> Self {
        Self(vec![value])
    }
}

impl From<EventKind> for TopicSet {
    fn from(value: EventKind) -> Self {
        Self(vec![Topic::Event(value)])
    }
}

impl From<Vec<Topic>> for TopicSet {
    fn from(value: Vec<Topic>) -> Self {
        Self(value)
    }
}

impl<const N: usize> From<[EventKind; N]> for TopicSet {
    fn from(value: [EventKind; N]) -> Self {
        Self(value.into_iter().map(Topic::Event).collect())
    }
}

type Callback = Arc<dyn Fn(BusMessage) -> BoxFuture<'static, ()> + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    callback: Callback,
}

#[derive(Default)]
struct Inner {
    next_event_id: AtomicU64,
    next_subscription_id: AtomicU64,
    subscribers: RwLock<HashMap<Topic, Vec<Subscriber>>>,
    /// Response channels of in-flight requests, keyed by request event id.
    waiting: RwLock<HashMap<EventId, mpsc::UnboundedSender<Arc<ResponseEnvelope>>>>,
}

impl Inner {
    fn remove(&self, topic: Topic, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(list) = subscribers.get_mut(&topic) else {
            return false;
        };
        let before = list.len();
        list.retain(|subscriber| subscriber.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            subscribers.remove(&topic);
        }
        removed
    }

    fn stop_waiting(&self, event_id: EventId) {
        self.waiting
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&event_id);
    }
}

/// Handle to a registered callback.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    topics: Vec<Topic>,
    inner: Weak<Inner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    pub fn unsubscribe(self) {
        if let Some(inner) = self.inner.upgrade() {
            for topic in &self.topics {
                inner.remove(*topic, self.id);
            }
        }
    }
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("next_event_id", &self.next_event_id)
            .finish_non_exhaustive()
    }
}

/// Stops routing responses to a request however the request ends.
struct WaitGuard<'a> {
    inner: &'a Inner,
    event_id: EventId,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.inner.stop_waiting(self.event_id);
    }
}

#[derive(Clone, Default)]
pub struct Emitter {
    inner: Arc<Inner>,
}

/// Non-owning handle, for callbacks stored inside the bus itself.
#[derive(Clone)]
pub struct WeakEmitter {
    inner: Weak<Inner>,
}

impl WeakEmitter {
    pub fn upgrade(&self) -> Option<Emitter> {
        self.inner.upgrade().map(|inner| Emitter { inner })
    }
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn downgrade(&self) -> WeakEmitter {
        WeakEmitter {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn next_event_id(&self) -> EventId {
        EventId(self.inner.next_event_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn next_subscription_id(&self) -> SubscriptionId {
        SubscriptionId(self.inner.next_subscription_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Publishes `payload` to the current subscribers of `kind` and returns
    /// the allocated event id.
    pub fn emit<P>(&self, kind: EventKind, payload: &P) -> Result<EventId, BusError>
    where
        P: Serialize + ?Sized,
    {
        let payload = serde_json::to_value(payload).map_err(BusError::Encode)?;
        Ok(self.emit_value(kind, payload))
    }

    pub fn emit_value(&self, kind: EventKind, payload: Value) -> EventId {
        let event_id = self.next_event_id();
        self.publish_event(event_id, kind, payload);
        event_id
    }

    fn publish_event(&self, event_id: EventId, kind: EventKind, payload: Value) {
        debug!(%event_id, %kind, "bus: emit");
        let envelope = EventEnvelope {
            event_id,
            kind,
            timestamp: Utc::now(),
            payload,
        };
        self.publish(BusMessage::Event(Arc::new(envelope)));
    }

    /// Publishes a response to `original` on its `.resp` topic.
    pub fn respond(
        &self,
        original: &EventEnvelope,
        payload: Value,
        response_id: u32,
        final_response: bool,
        status: EventStatus,
    ) {
        let response = ResponseEnvelope {
            event_id: original.event_id,
            kind: Topic::Response(original.kind),
            response_id,
            final_response,
            timestamp: Utc::now(),
            status,
            payload,
            original: original.clone(),
        };
        self.publish(BusMessage::Response(Arc::new(response)));
    }

    fn publish(&self, message: BusMessage) {
        if let BusMessage::Response(response) = &message {
            let waiting = self
                .inner
                .waiting
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            // Sent synchronously so a request observes responses in
            // publication order.
            if let Some(sender) = waiting.get(&response.event_id) {
                let _ = sender.send(Arc::clone(response));
            }
        }

        let topic = message.topic();
        let callbacks: Vec<Callback> = {
            let subscribers = self
                .inner
                .subscribers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            subscribers
                .get(&topic)
                .map(|list| list.iter().map(|s| Arc::clone(&s.callback)).collect())
                .unwrap_or_default()
        };
        for callback in callbacks {
            tokio::spawn(callback(message.clone()));
        }
    }

    fn register(&self, topics: &[Topic], id: SubscriptionId, callback: Callback) {
        let mut subscribers = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for topic in topics {
            subscribers.entry(*topic).or_default().push(Subscriber {
                id,
                callback: Arc::clone(&callback),
            });
        }
    }

    /// Runs `callback` for every message published on `topics` from now on.
    pub fn on<T, F, Fut>(&self, topics: T, callback: F) -> Subscription
    where
        T: Into<TopicSet>,
        F: Fn(BusMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let TopicSet(topics) = topics.into();
        let id = self.next_subscription_id();
        let callback: Callback = Arc::new(move |message| callback(message).boxed());
        self.register(&topics, id, callback);
        Subscription {
            id,
            topics,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Like [`Emitter::on`], but fires at most once and then unsubscribes.
    pub fn once<T, F, Fut>(&self, topics: T, callback: F) -> Subscription
    where
        T: Into<TopicSet>,
        F: Fn(BusMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let TopicSet(topics) = topics.into();
        let id = self.next_subscription_id();
        let fired = AtomicBool::new(false);
        let inner = Arc::downgrade(&self.inner);
        let registered = topics.clone();
        let callback: Callback = Arc::new(move |message| {
            if fired.swap(true, Ordering::SeqCst) {
                return futures::future::ready(()).boxed();
            }
            if let Some(inner) = inner.upgrade() {
                for topic in &registered {
                    inner.remove(*topic, id);
                }
            }
            callback(message).boxed()
        });
        self.register(&topics, id, callback);
        Subscription {
            id,
            topics,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Removes one subscription from one topic. Returns whether it was there.
    pub fn off(&self, topic: Topic, id: SubscriptionId) -> bool {
        self.inner.remove(topic, id)
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&topic)
            .map_or(0, Vec::len)
    }

    /// Emits `kind` and waits for its final response.
    ///
    /// The response listener is installed before the event is published, so
    /// no response can be missed. `on_update` sees every correlated response,
    /// pending and final, in `responseId` order. Resolves with the final
    /// payload, or [`BusError::Rejected`] when the final status is `Error`.
    pub async fn request<P, F>(
        &self,
        kind: EventKind,
        payload: &P,
        mut on_update: F,
    ) -> Result<Value, BusError>
    where
        P: Serialize + ?Sized,
        F: FnMut(&ResponseEnvelope) + Send,
    {
        let payload = serde_json::to_value(payload).map_err(BusError::Encode)?;
        let event_id = self.next_event_id();
        let (sender, mut receiver) = mpsc::unbounded_channel();

        self.inner
            .waiting
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(event_id, sender);
        let _guard = WaitGuard {
            inner: &self.inner,
            event_id,
        };

        self.publish_event(event_id, kind, payload);

        while let Some(response) = receiver.recv().await {
            on_update(response.as_ref());
            if !response.final_response {
                continue;
            }
            return match response.status {
                EventStatus::Error => Err(BusError::Rejected(rejection(&response.payload))),
                EventStatus::Success | EventStatus::Unknown | EventStatus::Pending => {
                    Ok(response.payload.clone())
                }
            };
        }
        Err(BusError::Closed)
    }

    /// Number of requests still waiting for a final response.
    pub fn in_flight(&self) -> usize {
        self.inner
            .waiting
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Typed [`Emitter::request`] without progress callbacks.
    pub async fn call<R: Request>(&self, request: &R) -> Result<R::Response, BusError> {
        self.call_with_updates(request, |_| {}).await
    }

    pub async fn call_with_updates<R, F>(
        &self,
        request: &R,
        on_update: F,
    ) -> Result<R::Response, BusError>
    where
        R: Request,
        F: FnMut(&ResponseEnvelope) + Send,
    {
        let payload = self.request(R::KIND, request, on_update).await?;
        serde_json::from_value(payload).map_err(BusError::Decode)
    }

    /// [`Emitter::call`] bounded by `limit`.
    pub async fn call_within<R: Request>(
        &self,
        request: &R,
        limit: Duration,
    ) -> Result<R::Response, BusError> {
        tokio::time::timeout(limit, self.call(request))
            .await
            .map_err(|_| BusError::TimedOut(limit))?
    }
}

fn rejection(payload: &Value) -> ApiError {
    serde_json::from_value(payload.clone()).unwrap_or_else(|error| {
        warn!(%error, "bus: error response without an error payload");
        ApiError::internal(payload.to_string())
    })
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
