//! Cooperative cancellation for long-running conversions.
//!
//! A [`CancelSignal`] combines an explicit [`CancellationToken`] with an optional deadline.
//! Algorithms poll [`CancelSignal::is_cancelled`] between iterations, sources, row blocks and
//! batches; when it fires they stop and the engine returns what was computed so far tagged
//! `sampled`.

use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share an existing token, e.g. one cancelled when a client disconnects.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Also fire once `timeout` has elapsed from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_not_cancelled() {
        assert!(!CancelSignal::new().is_cancelled());
    }

    #[test]
    fn test_explicit_cancel_propagates_to_clones() {
        let signal = CancelSignal::new();
        let clone = signal.clone();
        signal.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_elapsed_deadline_cancels() {
        let signal = CancelSignal::new().with_timeout(Duration::ZERO);
        assert!(signal.is_cancelled());
        assert!(!signal.token().is_cancelled());

        let later = CancelSignal::new().with_timeout(Duration::from_secs(3600));
        assert!(!later.is_cancelled());
    }
}
