//! Connection resilience manager
//!
//! Owns one session and repairs it when it drops. An operation that fails
//! with a connection-loss error is retried exactly once on a fresh session;
//! a second failure is surfaced as [`ConnectionError::RetryExhausted`].
//! Authentication failures are never retried and invalidate cached tokens.

use log::{debug, error, info, warn};

use crate::error::{ConnectionError, SessionError};
use crate::imap::{Credentials, MailSession, SessionFactory};
use crate::models::SelectedMailbox;

/// Lifecycle of the managed session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Which attempt produced a successful result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    FirstTry,
    AfterReconnect,
}

/// A session handle that reconnects once on connection loss
///
/// One instance serves one mailbox account. Operations take `&mut self`, so
/// at most one protocol command is in flight per connection.
pub struct ResilientConnection<F: SessionFactory> {
    host: String,
    factory: F,
    credentials: Credentials,
    session: Option<F::Session>,
    state: ConnectionState,
    /// Mailbox to re-select after a reconnect
    selected: Option<String>,
    reconnects: u32,
}

impl<F: SessionFactory> ResilientConnection<F> {
    /// Create a disconnected handle; nothing touches the network until first use
    pub fn new(host: impl Into<String>, factory: F, credentials: Credentials) -> Self {
        Self {
            host: host.into(),
            factory,
            credentials,
            session: None,
            state: ConnectionState::Disconnected,
            selected: None,
            reconnects: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Number of reconnects performed to repair dropped sessions
    pub fn reconnect_count(&self) -> u32 {
        self.reconnects
    }

    pub fn selected_mailbox(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    /// Connect if there is no live session
    pub fn ensure_connected(&mut self) -> Result<(), ConnectionError> {
        if self.session.is_some() && self.state == ConnectionState::Connected {
            return Ok(());
        }
        self.connect()
    }

    fn connect(&mut self) -> Result<(), ConnectionError> {
        self.state = ConnectionState::Connecting;
        match self.factory.open(&self.host, &self.credentials) {
            Ok(session) => {
                self.session = Some(session);
                self.state = ConnectionState::Connected;
                info!("Connected to {}", self.host);
                Ok(())
            }
            Err(SessionError::AuthFailure(msg)) => {
                self.state = ConnectionState::Disconnected;
                warn!("Login to {} rejected: {}", self.host, msg);
                self.credentials.invalidate();
                Err(ConnectionError::Auth(msg))
            }
            Err(source) => {
                self.state = ConnectionState::Disconnected;
                Err(ConnectionError::Connect {
                    host: self.host.clone(),
                    source,
                })
            }
        }
    }

    /// Discard the session without logging out; the transport is unusable
    fn mark_lost(&mut self) {
        self.session = None;
        self.state = ConnectionState::Disconnected;
    }

    fn run<T>(
        &mut self,
        op: impl FnOnce(&mut F::Session) -> Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        match self.session.as_mut() {
            Some(session) => op(session),
            None => Err(SessionError::Transient("no session".to_string())),
        }
    }

    /// Run `op` against the session, reconnecting and retrying once on connection loss
    pub fn execute<T, Op>(&mut self, op: Op) -> Result<T, ConnectionError>
    where
        Op: FnMut(&mut F::Session) -> Result<T, SessionError>,
    {
        self.execute_tracked(op).map(|(value, _)| value)
    }

    /// Like [`execute`](Self::execute), also reporting whether a retry was needed
    pub fn execute_tracked<T, Op>(&mut self, mut op: Op) -> Result<(T, Attempt), ConnectionError>
    where
        Op: FnMut(&mut F::Session) -> Result<T, SessionError>,
    {
        self.ensure_connected()?;

        let err = match self.run(&mut op) {
            Ok(value) => return Ok((value, Attempt::FirstTry)),
            Err(e) => e,
        };
        if !err.is_connection_loss() {
            return Err(self.surface(err));
        }

        warn!("Connection to {} lost ({}); reconnecting once", self.host, err);
        self.mark_lost();
        self.reconnects += 1;
        match self.connect() {
            Ok(()) => {}
            Err(ConnectionError::Connect { source, .. }) => {
                error!("Reconnect to {} failed: {}", self.host, source);
                return Err(ConnectionError::RetryExhausted(source));
            }
            Err(other) => return Err(other),
        }

        if let Some(mailbox) = self.selected.clone()
            && let Err(e) = self.run(|s| s.select(&mailbox))
        {
            return Err(self.surface_retry(e));
        }

        match self.run(&mut op) {
            Ok(value) => {
                debug!("Operation on {} succeeded after reconnect", self.host);
                Ok((value, Attempt::AfterReconnect))
            }
            Err(e) => Err(self.surface_retry(e)),
        }
    }

    /// Map a non-retryable failure from the first attempt
    fn surface(&mut self, err: SessionError) -> ConnectionError {
        match err {
            SessionError::AuthFailure(msg) => {
                warn!("Credential rejected by {}: {}", self.host, msg);
                self.credentials.invalidate();
                self.mark_lost();
                ConnectionError::Auth(msg)
            }
            other => ConnectionError::Session(other),
        }
    }

    /// Map a failure from the single retry
    fn surface_retry(&mut self, err: SessionError) -> ConnectionError {
        if err.is_connection_loss() {
            error!("Operation on {} failed again after reconnect: {}", self.host, err);
            self.mark_lost();
            return ConnectionError::RetryExhausted(err);
        }
        self.surface(err)
    }

    /// Select `mailbox` and remember it for re-selection after reconnects
    pub fn select(&mut self, mailbox: &str) -> Result<SelectedMailbox, ConnectionError> {
        let selected = self.execute(|s| s.select(mailbox))?;
        self.selected = Some(mailbox.to_string());
        Ok(selected)
    }

    /// Log out best-effort; always ends `Disconnected`
    pub fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take()
            && let Err(e) = session.logout()
        {
            debug!("Logout from {} failed: {}", self.host, e);
        }
        self.selected = None;
        self.state = ConnectionState::Disconnected;
    }
}

impl<F: SessionFactory> Drop for ResilientConnection<F> {
    fn drop(&mut self) {
        self.disconnect();
    }
}
