use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use shared::{
    error::ApiError,
    protocol::{EventEnvelope, EventId, EventStatus},
};

use crate::{BusError, Emitter};

#[derive(Debug, Default)]
struct ResponderState {
    next_response_id: u32,
    finished: bool,
}

/// Answers one request. Clones share the response sequence, so ids stay
/// strictly increasing and at most one final response is published no matter
/// which clone sends it.
#[derive(Clone)]
pub struct Responder {
    emitter: Emitter,
    original: Arc<EventEnvelope>,
    state: Arc<Mutex<ResponderState>>,
}

impl Responder {
    pub fn new(emitter: Emitter, original: Arc<EventEnvelope>) -> Self {
        Self {
            emitter,
            original,
            state: Arc::new(Mutex::new(ResponderState::default())),
        }
    }

    pub fn original(&self) -> &EventEnvelope {
        &self.original
    }

    pub fn event_id(&self) -> EventId {
        self.original.event_id
    }

    pub fn pending<P: Serialize + ?Sized>(&self, payload: &P) -> Result<(), BusError> {
        self.send(encode(payload)?, EventStatus::Pending, false)
    }

    pub fn success<P: Serialize + ?Sized>(&self, payload: &P) -> Result<(), BusError> {
        self.send(encode(payload)?, EventStatus::Success, true)
    }

    pub fn error(&self, error: &ApiError) -> Result<(), BusError> {
        self.send(encode(error)?, EventStatus::Error, true)
    }

    pub fn is_finished(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .finished
    }

    fn send(&self, payload: Value, status: EventStatus, final_response: bool) -> Result<(), BusError> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.finished {
            warn!(
                event_id = %self.original.event_id,
                kind = %self.original.kind,
                ?status,
                "bus: dropping response after final response"
            );
            return Err(BusError::AlreadyResponded(self.original.event_id));
        }

        let response_id = state.next_response_id;
        state.next_response_id += 1;
        state.finished = final_response;
        // Published under the lock so concurrent senders cannot reorder ids.
        self.emitter
            .respond(&self.original, payload, response_id, final_response, status);
        Ok(())
    }
}

fn encode<P: Serialize + ?Sized>(payload: &P) -> Result<Value, BusError> {
    serde_json::to_value(payload).map_err(BusError::Encode)
}
