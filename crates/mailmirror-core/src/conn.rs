//! Exclusive ownership of one server connection.
//!
//! A [`Connection`] wraps a session in an async mutex; holding the guard
//! is the right to issue commands. One listener may park the session in
//! IDLE through [`Connection::idle_once`]. Every other user goes through
//! [`Connection::acquire`], which asks a parked listener to leave IDLE and
//! then queues for the mutex, so no command is ever sent mid-IDLE.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use mailmirror_imap::IdleEvent;
use tokio::sync::{Notify, OwnedMutexGuard};
use tracing::{debug, trace};

use crate::remote::{RemoteError, RemoteSession};

#[derive(Debug, Default)]
struct GateState {
    idling: bool,
    waiting: usize,
    reselect: bool,
    closed: bool,
}

#[derive(Debug, Default)]
struct IdleGate {
    state: Mutex<GateState>,
    stop: Notify,
}

impl IdleGate {
    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared handle to one session.
pub struct Connection<S> {
    session: Arc<tokio::sync::Mutex<S>>,
    gate: Arc<IdleGate>,
}

impl<S> Clone for Connection<S> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
            gate: Arc::clone(&self.gate),
        }
    }
}

/// Exclusive access to the session. Dropping it hands the connection to
/// the next waiter.
pub struct ConnectionGuard<S> {
    guard: OwnedMutexGuard<S>,
}

impl<S> Deref for ConnectionGuard<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.guard
    }
}

impl<S> DerefMut for ConnectionGuard<S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.guard
    }
}

/// Counts a pending [`Connection::acquire`], even if it is cancelled.
struct Waiting<'a>(&'a IdleGate);

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.lock().waiting -= 1;
    }
}

/// Clears the idling flag when the IDLE wait ends.
struct Idling<'a>(&'a IdleGate);

impl Drop for Idling<'_> {
    fn drop(&mut self) {
        self.0.lock().idling = false;
    }
}

impl<S: RemoteSession> Connection<S> {
    /// Takes ownership of an authenticated session.
    pub fn new(session: S) -> Self {
        Self {
            session: Arc::new(tokio::sync::Mutex::new(session)),
            gate: Arc::new(IdleGate::default()),
        }
    }

    /// Waits for exclusive use of the session, first asking an idle
    /// listener to leave IDLE.
    pub async fn acquire(&self) -> ConnectionGuard<S> {
        let waiting = {
            let mut state = self.gate.lock();
            state.waiting += 1;
            state.reselect = true;
            if state.idling {
                trace!("asking idle listener to stop");
                self.gate.stop.notify_one();
            }
            Waiting(&self.gate)
        };
        let guard = Arc::clone(&self.session).lock_owned().await;
        drop(waiting);
        ConnectionGuard { guard }
    }

    /// Asks a parked idle listener to leave IDLE without taking the
    /// connection.
    pub fn stop_idle(&self) {
        if self.gate.lock().idling {
            self.gate.stop.notify_one();
        }
    }

    /// Stops the idle listener for good. Later [`Connection::idle_once`]
    /// calls return `None` without idling.
    pub fn close_idle(&self) {
        let mut state = self.gate.lock();
        state.closed = true;
        if state.idling {
            self.gate.stop.notify_one();
        }
    }

    /// True once [`Connection::close_idle`] was called.
    #[must_use]
    pub fn is_idle_closed(&self) -> bool {
        self.gate.lock().closed
    }

    /// Parks the session in IDLE on `mailbox` until a push event, a stop
    /// request or the keepalive.
    ///
    /// `known_exists` carries the message count between calls. When the
    /// mailbox had to be reselected because another user changed the
    /// selection, a count that moved meanwhile is reported as
    /// [`IdleEvent::Exists`] without entering IDLE. Returns `None` without
    /// idling when another user is waiting for the connection or the
    /// listener was closed.
    ///
    /// # Errors
    ///
    /// Propagates failures of SELECT or IDLE.
    pub async fn idle_once(
        &self,
        mailbox: &str,
        keepalive: Duration,
        known_exists: &mut Option<u32>,
    ) -> Result<Option<IdleEvent>, RemoteError> {
        let mut session = Arc::clone(&self.session).lock_owned().await;

        let reselect = {
            let mut state = self.gate.lock();
            if state.waiting > 0 || state.closed {
                return Ok(None);
            }
            std::mem::take(&mut state.reselect) || known_exists.is_none()
        };

        if reselect {
            let selected = session.select(mailbox).await?;
            let moved = known_exists.is_some_and(|n| n != selected.exists);
            *known_exists = Some(selected.exists);
            if moved {
                debug!(mailbox, exists = selected.exists, "message count moved while away");
                return Ok(Some(IdleEvent::Exists(selected.exists)));
            }
        }

        // Checked under the same lock `acquire` takes before it looks at
        // `idling`, so a waiter is either seen here or notified.
        let idling = {
            let mut state = self.gate.lock();
            if state.waiting > 0 || state.closed {
                return Ok(None);
            }
            state.idling = true;
            Idling(&self.gate)
        };
        let event = session.idle(&self.gate.stop, keepalive).await;
        drop(idling);

        if let Ok(IdleEvent::Exists(n)) = event {
            *known_exists = Some(n);
        }
        event.map(Some)
    }
}
