//! Error types shared across the engine
//!
//! Each component reports failures through its own enum so callers can tell
//! "retry once", "refresh credentials", "skip this item" and "stop" apart.

use std::time::Duration;

/// Failure of a single protocol operation on one session
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Network blip or dropped session, safe to retry once on a fresh connection
    #[error("connection lost: {0}")]
    Transient(String),
    /// Credential rejected by the server
    #[error("authentication rejected: {0}")]
    AuthFailure(String),
    /// Malformed or negative server response for this unit of work
    #[error("protocol error: {0}")]
    ProtocolError(String),
    /// Transport timed out mid-operation
    #[error("timed out: {0}")]
    Timeout(String),
}

impl SessionError {
    /// Whether the failure means the underlying transport is no longer usable
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, SessionError::Transient(_) | SessionError::Timeout(_))
    }
}

/// Outcome of an operation run through the resilience manager
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Credentials were rejected; the cached token has been invalidated
    #[error("authentication failed: {0}")]
    Auth(String),
    /// No session could be established
    #[error("could not connect to {host}: {source}")]
    Connect {
        host: String,
        #[source]
        source: SessionError,
    },
    /// The operation failed again after the single reconnect-and-retry
    #[error("operation failed after reconnect: {0}")]
    RetryExhausted(#[source] SessionError),
    /// A non-retryable failure of the operation itself
    #[error(transparent)]
    Session(SessionError),
}

impl ConnectionError {
    /// Whether the failure only concerns the unit of work that produced it.
    ///
    /// Protocol errors are skipped by batch fetching and thread
    /// reconstruction; everything else stops the calling operation.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ConnectionError::Session(SessionError::ProtocolError(_)))
    }
}

/// Failure of a batch fetch stream
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    /// Every identifier the search returned failed to fetch
    #[error("no message in {mailbox} could be fetched ({failures} failures)")]
    NothingFetched { mailbox: String, failures: usize },
}

/// Failure to take or give back the shared store lock
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Attempts exhausted while another holder kept the lock
    #[error("lock still held after {attempts} attempts ({waited:?})")]
    Timeout { attempts: u32, waited: Duration },
    /// The remote object store failed while handling the lock object
    #[error("lock store error: {0:#}")]
    Store(#[source] anyhow::Error),
}

/// Failure of the shared store coordinator
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The lock could not be obtained; the store must not be mutated
    #[error(transparent)]
    Lock(#[from] LockError),
    /// Neither a usable local copy nor a reachable remote copy exists
    #[error("no usable store copy: {0}")]
    Fatal(String),
    /// Work bracketed by the store session failed
    #[error("store session failed: {0:#}")]
    Session(#[source] anyhow::Error),
}
