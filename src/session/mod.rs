//! Remote sessions to cluster hosts.
//!
//! [`Connector`] and [`RemoteSession`] are the seam the orchestrator and
//! reconciler program against. [`SshConnector`] drives the system OpenSSH
//! client; tests substitute scripted doubles from
//! [`crate::test_support`].

use std::ops::{Deref, DerefMut};

use tracing::{debug, warn};

use crate::model::HostConnection;

mod error;
mod ssh;
mod types;

pub use error::SessionError;
pub use ssh::{SshConnector, SshSession, SshSettings};
pub use types::{
    CommandOutput, CommandRunner, Connector, ExecOutput, ProcessCommandRunner, RemoteSession,
};

/// Owns a session and disconnects it when dropped.
///
/// A failed disconnect during drop is logged, never escalated, so cleanup
/// cannot mask the error that caused an early return.
#[derive(Debug)]
pub struct SessionGuard<S: RemoteSession> {
    session: S,
    closed: bool,
}

impl<S: RemoteSession> SessionGuard<S> {
    /// Wraps an already connected session.
    #[must_use]
    pub const fn new(session: S) -> Self {
        Self {
            session,
            closed: false,
        }
    }

    /// Disconnects now, reporting any failure to the caller.
    ///
    /// # Errors
    ///
    /// Returns the session's disconnect error.
    pub fn close(mut self) -> Result<(), SessionError> {
        self.closed = true;
        self.session.disconnect()
    }
}

impl<S: RemoteSession> Deref for SessionGuard<S> {
    type Target = S;

    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

impl<S: RemoteSession> DerefMut for SessionGuard<S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.session
    }
}

impl<S: RemoteSession> Drop for SessionGuard<S> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let host = self.session.host().to_owned();
        match self.session.disconnect() {
            Ok(()) => debug!(host = %host, "session closed"),
            Err(err) => warn!(host = %host, error = %err, "failed to close session"),
        }
    }
}

/// Connects to `target` and wraps the session in a [`SessionGuard`].
///
/// # Errors
///
/// Returns the connector's error when the session cannot be opened.
pub fn open_session<C: Connector>(
    connector: &C,
    target: &HostConnection,
) -> Result<SessionGuard<C::Session>, SessionError> {
    let session = connector.connect(target)?;
    debug!(host = %target.host, port = target.port, "session opened");
    Ok(SessionGuard::new(session))
}

/// Returns `true` when a session to `target` can be opened and closed.
pub fn test_connection<C: Connector>(connector: &C, target: &HostConnection) -> bool {
    match open_session(connector, target) {
        Ok(guard) => {
            if let Err(err) = guard.close() {
                debug!(host = %target.host, error = %err, "connection test close failed");
            }
            true
        }
        Err(err) => {
            debug!(host = %target.host, error = %err, "connection test failed");
            false
        }
    }
}
