//! Cooperative cancellation flags keyed by task id.
//!
//! A task registers itself when it is created and receives a
//! [`CancellationGuard`]. The guard hands out the task's
//! [`CancellationToken`], which the generation loop polls at fragment
//! boundaries, and releases the registry entry when dropped, so every exit
//! path (finished, aborted, failed, connection dropped) releases exactly once.
//!
//! Signaling an unknown or already released task is not an error: an abort
//! that races the task's natural completion is silently absorbed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

use crate::error::{Result, SchedulerError};
use crate::task::TaskId;

/// Observable state of a task's cancellation flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagState {
    /// No cancellation requested.
    Clear,
    /// Cancellation requested, not yet acted upon.
    Signaled,
    /// The task observed the signal and stopped.
    Consumed,
}

struct Entry {
    token: CancellationToken,
    consumed: bool,
}

/// Registry of cancellation flags for in-flight tasks.
#[derive(Default)]
pub struct CancellationRegistry {
    entries: Mutex<HashMap<TaskId, Entry>>,
}

impl CancellationRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<TaskId, Entry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create a fresh, clear flag for `task_id`.
    pub fn register(self: &Arc<Self>, task_id: TaskId) -> Result<CancellationGuard> {
        let token = CancellationToken::new();
        {
            let mut entries = self.entries();
            if entries.contains_key(&task_id) {
                return Err(SchedulerError::DuplicateTask(task_id));
            }
            entries.insert(
                task_id,
                Entry {
                    token: token.clone(),
                    consumed: false,
                },
            );
        }
        tracing::debug!(%task_id, "cancellation flag registered");
        Ok(CancellationGuard {
            task_id,
            token,
            registry: Arc::clone(self),
        })
    }

    /// Request cancellation. Returns `true` if a clear flag was set.
    ///
    /// Unknown, released, already signaled or consumed tasks are left alone.
    pub fn signal(&self, task_id: TaskId) -> bool {
        let entries = self.entries();
        match entries.get(&task_id) {
            Some(entry) if !entry.consumed && !entry.token.is_cancelled() => {
                entry.token.cancel();
                tracing::debug!(%task_id, "cancellation signaled");
                true
            }
            Some(_) => false,
            None => {
                tracing::debug!(%task_id, "cancellation for unknown task ignored");
                false
            }
        }
    }

    /// Non-blocking poll.
    pub fn is_signaled(&self, task_id: TaskId) -> bool {
        self.entries()
            .get(&task_id)
            .is_some_and(|entry| entry.token.is_cancelled())
    }

    /// Acknowledge a signaled flag. Returns `true` on the `Signaled -> Consumed`
    /// transition, `false` otherwise.
    pub fn consume(&self, task_id: TaskId) -> bool {
        match self.entries().get_mut(&task_id) {
            Some(entry) if entry.token.is_cancelled() && !entry.consumed => {
                entry.consumed = true;
                true
            }
            _ => false,
        }
    }

    pub fn flag_state(&self, task_id: TaskId) -> Option<FlagState> {
        self.entries().get(&task_id).map(|entry| {
            if entry.consumed {
                FlagState::Consumed
            } else if entry.token.is_cancelled() {
                FlagState::Signaled
            } else {
                FlagState::Clear
            }
        })
    }

    /// Remove the entry. Returns whether it existed.
    pub fn release(&self, task_id: TaskId) -> bool {
        let removed = self.entries().remove(&task_id).is_some();
        if removed {
            tracing::debug!(%task_id, "cancellation flag released");
        }
        removed
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registration handle owned by the task. Releases the entry on drop.
pub struct CancellationGuard {
    task_id: TaskId,
    token: CancellationToken,
    registry: Arc<CancellationRegistry>,
}

impl CancellationGuard {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// A clone of the token to poll in generation loops.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_signaled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// See [`CancellationRegistry::consume`].
    pub fn consume(&self) -> bool {
        self.registry.consume(self.task_id)
    }
}

impl std::fmt::Debug for CancellationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationGuard")
            .field("task_id", &self.task_id)
            .finish()
    }
}

impl Drop for CancellationGuard {
    fn drop(&mut self) {
        // Stop anything still holding a clone of the token.
        self.token.cancel();
        self.registry.release(self.task_id);
    }
}
