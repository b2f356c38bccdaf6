//! Per-request lifecycle.
//!
//! ```text
//! Received → Scaled(mode) → Computing → Cached | Computed → Delivered
//!     any non-terminal state → Failed
//! ```
//!
//! Each request carries a UUIDv7 identifier used in logs and in the conversion log table.

use serde::Serialize;
use tracing::{debug, error, warn};

use super::types::{ConversionMode, ConversionResult};
use crate::confidence::ConfidenceSummary;
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "mode", rename_all = "snake_case")]
pub enum RequestState {
    Received,
    Scaled(ConversionMode),
    Computing,
    Cached,
    Computed,
    Delivered,
    Failed,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition(&self, next: RequestState) -> bool {
        use RequestState::*;
        match (self, next) {
            (Delivered | Failed, _) => false,
            (_, Failed) => true,
            (Received, Scaled(_)) => true,
            (Scaled(_), Computing) => true,
            (Computing, Cached | Computed) => true,
            (Cached | Computed, Delivered) => true,
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct Request {
    id: String,
    operation: &'static str,
    states: Vec<RequestState>,
}

impl Request {
    pub fn new(operation: &'static str) -> Self {
        let id = uuid::Uuid::now_v7().to_string();
        debug!(request_id = %id, operation, "conversion request received");
        Self {
            id,
            operation,
            states: vec![RequestState::Received],
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn state(&self) -> RequestState {
        // `states` is never empty: it starts with `Received`.
        self.states.last().copied().unwrap_or(RequestState::Received)
    }

    pub fn trace(&self) -> &[RequestState] {
        &self.states
    }

    /// Move to `next`. An illegal transition is an engine bug; it is logged and the request is
    /// marked failed instead.
    pub fn advance(&mut self, next: RequestState) {
        let current = self.state();
        if current.can_transition(next) {
            debug!(request_id = %self.id, from = ?current, to = ?next, "request state");
            self.states.push(next);
        } else {
            error!(request_id = %self.id, from = ?current, to = ?next, "illegal request transition");
            if !current.is_terminal() {
                self.states.push(RequestState::Failed);
            }
        }
    }

    pub fn fail(&mut self, err: &Error) {
        warn!(request_id = %self.id, operation = self.operation, error = %err, "conversion failed");
        if !self.state().is_terminal() {
            self.states.push(RequestState::Failed);
        }
    }

    /// Finish the request and wrap `data` in a result envelope.
    pub fn deliver<T>(
        &mut self,
        data: T,
        mode: ConversionMode,
        confidence: ConfidenceSummary,
        failed_items: usize,
    ) -> ConversionResult<T> {
        let from_cache = self.states.contains(&RequestState::Cached);
        self.advance(RequestState::Delivered);
        ConversionResult {
            request_id: self.id.clone(),
            operation: self.operation,
            mode,
            confidence,
            from_cache,
            failed_items,
            states: self.states.clone(),
            data,
        }
    }
}
