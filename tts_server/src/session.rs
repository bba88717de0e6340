//! Tracks which control connection currently owns the synthesizer.
//!
//! Exactly one session is active at a time. Activating a new one preempts
//! the previous session by submitting `NewSession` to the worker; the
//! submission happens under the lock so the preemption is queued ahead of
//! anything the new session sends. Submitting it also advances the audio
//! generation, so the preempted run stops reaching listeners the moment
//! the new session is activated.
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info};
use uuid::Uuid;

use tts_core::Command;

use crate::error::ServerError;
use crate::metrics::ServerMetrics;
use crate::worker::WorkerHandle;

pub type SessionId = Uuid;

#[derive(Debug)]
pub struct SessionCoordinator {
    active: Mutex<Option<SessionId>>,
    worker: WorkerHandle,
    metrics: ServerMetrics,
}

impl SessionCoordinator {
    pub fn new(worker: WorkerHandle, metrics: ServerMetrics) -> Self {
        Self {
            active: Mutex::new(None),
            worker,
            metrics,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<SessionId>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make `id` the active session, preempting any other.
    pub fn activate(&self, id: SessionId) -> Result<(), ServerError> {
        let mut active = self.lock();
        match *active {
            Some(current) if current == id => return Ok(()),
            Some(current) => {
                info!(previous = %current, session = %id, "New session preempts the active one");
                ServerMetrics::incr(&self.metrics.sessions_preempted);
                self.worker.submit(Command::NewSession)?;
            }
            None => debug!(session = %id, "Session activated"),
        }
        *active = Some(id);
        Ok(())
    }

    /// Release `id` if it is still active, cancelling its work.
    pub fn deactivate(&self, id: SessionId) -> Result<(), ServerError> {
        let mut active = self.lock();
        if *active != Some(id) {
            return Ok(());
        }
        *active = None;
        debug!(session = %id, "Session released");
        self.worker.submit(Command::Cancel)
    }

    /// Forward `command` to the worker when `id` is the active session.
    /// Returns whether it was forwarded.
    pub fn submit(&self, id: SessionId, command: Command) -> Result<bool, ServerError> {
        let active = self.lock();
        if *active != Some(id) {
            debug!(session = %id, command = command.kind(), "Ignoring command from a superseded session");
            return Ok(false);
        }
        self.worker.submit(command)?;
        Ok(true)
    }

    pub fn is_active(&self, id: SessionId) -> bool {
        *self.lock() == Some(id)
    }

    pub fn active(&self) -> Option<SessionId> {
        *self.lock()
    }
}
