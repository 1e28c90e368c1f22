//! Error taxonomy for the repricing engine.
//!
//! Every failure the core can surface falls into one of a handful of
//! classes, and each class carries its own retry policy:
//!
//! - `Throttled`: quota exhausted locally or throttled by the remote. Retry after the stated delay.
//! - `TransientRemote`: timeout / 5xx / network. Retry with bounded jitter.
//! - `Configuration`: missing policy, account or seller linkage. Never retried.
//! - `MalformedMessage`: left unprocessed so queue redelivery retries it.
//!
//! Data inconsistencies (no Buy Box winner, no own offer) are not errors at
//! all: the pricing engine reports them as `Unchanged`.

use std::time::Duration;

use rand::Rng;
use thiserror::Error;

/// Lower bound of the jitter applied to transient remote failures.
pub const TRANSIENT_RETRY_MIN_SECS: u64 = 5;

/// Upper bound of the jitter applied to transient remote failures.
pub const TRANSIENT_RETRY_MAX_SECS: u64 = 30;

/// Errors surfaced by the engine to its task boundary.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Quota window exhausted, either locally or reported by the remote.
    #[error("Throttled: retry after {}s", retry_after.as_secs())]
    Throttled { retry_after: Duration },

    /// Network, timeout or server-side failure talking to the marketplace.
    #[error("Transient remote error: {0}")]
    TransientRemote(String),

    /// Missing quota policy, account linkage or seller id.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Inbound notification could not be parsed.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// The remote rejected the request outright (4xx other than throttling).
    #[error("Remote rejected request: {0}")]
    RemoteRejected(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Local file I/O (spool directory, policy file).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The task queue was closed while work was still being scheduled.
    #[error("Engine shutting down")]
    Shutdown,
}

impl EngineError {
    /// Whether the task boundary should reschedule the failed unit of work.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Throttled { .. }
                | EngineError::TransientRemote(_)
                | EngineError::Storage(_)
                | EngineError::Io(_)
        )
    }

    /// Delay before the next attempt, or `None` if the error is fatal.
    ///
    /// Malformed messages return `None` as well: the queue redelivers them.
    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            EngineError::Throttled { retry_after } => Some(*retry_after),
            EngineError::TransientRemote(_) | EngineError::Storage(_) | EngineError::Io(_) => {
                let secs = rand::thread_rng()
                    .gen_range(TRANSIENT_RETRY_MIN_SECS..=TRANSIENT_RETRY_MAX_SECS);
                Some(Duration::from_secs(secs))
            }
            _ => None,
        }
    }
}

/// Errors returned by a `RemoteOfferClient` implementation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// The remote service reported "request throttled".
    #[error("Request throttled by remote")]
    Throttled,

    /// Timeout, connection reset, 5xx.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Non-retryable rejection (bad request, unknown SKU, auth).
    #[error("Rejected: {0}")]
    Rejected(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttled_uses_stated_delay() {
        let err = EngineError::Throttled { retry_after: Duration::from_secs(12) };
        assert!(err.is_retryable());
        assert_eq!(err.retry_delay(), Some(Duration::from_secs(12)));
    }

    #[test]
    fn test_transient_delay_within_jitter_bounds() {
        let err = EngineError::TransientRemote("timeout".into());
        for _ in 0..50 {
            let delay = err.retry_delay().unwrap().as_secs();
            assert!((TRANSIENT_RETRY_MIN_SECS..=TRANSIENT_RETRY_MAX_SECS).contains(&delay));
        }
    }

    #[test]
    fn test_configuration_and_malformed_are_fatal() {
        assert!(!EngineError::Configuration("no policy".into()).is_retryable());
        assert!(EngineError::Configuration("no policy".into()).retry_delay().is_none());
        assert!(!EngineError::MalformedMessage("bad json".into()).is_retryable());
    }
}
