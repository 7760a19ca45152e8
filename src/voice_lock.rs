//! # Voice Session Lock
//!
//! Process-wide mutual exclusion for voice sessions: only one component may
//! hold the microphone/speaker at a time, otherwise audio plays twice or the
//! device is contended.
//!
//! ## Semantics:
//! - **acquire**: claims the lock if nobody holds it, returns the session id
//! - **release**: clears the lock only for the matching session id
//! - **force_release**: clears the lock unconditionally (error recovery)
//! - **subscribe**: listeners are told about every state change
//!
//! Listeners see changes in the order they were applied. Every change is
//! queued under the state mutex together with the listeners subscribed at
//! that moment; whichever caller finds no delivery in progress drains the
//! queue. A change made while another delivery runs (from a listener or from
//! another thread) is queued and delivered by that running dispatcher.
//!
//! Contention is not an error. A failed `acquire` returns `None` and a
//! mismatched `release` returns `false`; neither ever panics or propagates.
//!
//! The lock is an explicit handle owned by [`crate::state::AppState`] and
//! cloned into callers. Clones share the same state.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// The current owner of the lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockHolder {
    pub session_id: String,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
}

/// A state change delivered to every subscribed listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockEvent {
    Acquired(LockHolder),
    Released(LockHolder),
    ForceReleased { previous: Option<LockHolder> },
}

impl LockEvent {
    /// Lock state after the change.
    pub fn is_locked(&self) -> bool {
        matches!(self, LockEvent::Acquired(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LockEvent::Acquired(_) => "acquired",
            LockEvent::Released(_) => "released",
            LockEvent::ForceReleased { .. } => "force_released",
        }
    }
}

type Listener = Arc<dyn Fn(&LockEvent) + Send + Sync>;

struct PendingEvent {
    version: u64,
    event: LockEvent,
    listeners: Vec<Listener>,
}

#[derive(Default)]
struct LockInner {
    holder: Option<LockHolder>,
    listeners: Vec<(u64, Listener)>,
    next_listener_id: u64,
    /// Bumped on every state change.
    version: u64,
    pending: VecDeque<PendingEvent>,
    dispatching: bool,
}

impl LockInner {
    /// Queue `event` for the listeners registered right now. Must be called
    /// under the same guard that applied the change.
    fn record(&mut self, event: LockEvent) {
        self.version += 1;
        let listeners = self.listeners.iter().map(|(_, listener)| listener.clone()).collect();
        self.pending.push_back(PendingEvent {
            version: self.version,
            event,
            listeners,
        });
    }
}

/// Shared handle to the voice session lock.
#[derive(Clone, Default)]
pub struct VoiceSessionLock {
    inner: Arc<Mutex<LockInner>>,
}

impl std::fmt::Debug for VoiceSessionLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock_inner();
        f.debug_struct("VoiceSessionLock")
            .field("holder", &inner.holder)
            .field("listeners", &inner.listeners.len())
            .finish()
    }
}

impl VoiceSessionLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to claim the lock for `owner`.
    ///
    /// Uses `session_id` when given, otherwise generates a random one.
    /// Returns `None` without side effects when somebody already holds it.
    pub fn acquire(&self, owner: &str, session_id: Option<String>) -> Option<String> {
        let holder = {
            let mut inner = self.lock_inner();
            if let Some(current) = &inner.holder {
                warn!(
                    requested_by = %owner,
                    holder = %current.owner,
                    holder_session = %current.session_id,
                    "Voice session already in use"
                );
                return None;
            }

            let holder = LockHolder {
                session_id: session_id.unwrap_or_else(generate_session_id),
                owner: owner.to_string(),
                acquired_at: Utc::now(),
            };
            inner.holder = Some(holder.clone());
            inner.record(LockEvent::Acquired(holder.clone()));
            holder
        };

        info!(owner = %holder.owner, session_id = %holder.session_id, "Voice session acquired");
        self.dispatch();
        Some(holder.session_id)
    }

    /// Release the lock if `session_id` is the one currently held.
    pub fn release(&self, session_id: &str) -> bool {
        let released = {
            let mut inner = self.lock_inner();
            let Some(current) = inner.holder.as_ref() else {
                warn!(session_id = %session_id, "Rejected release: no voice session is held");
                return false;
            };
            if current.session_id != session_id {
                warn!(
                    session_id = %session_id,
                    holder = %current.owner,
                    holder_session = %current.session_id,
                    "Rejected release of voice session not currently held"
                );
                return false;
            }
            let released = inner.holder.take();
            if let Some(holder) = &released {
                inner.record(LockEvent::Released(holder.clone()));
            }
            released
        };

        match released {
            Some(holder) => {
                info!(owner = %holder.owner, session_id = %holder.session_id, "Voice session released");
                self.dispatch();
                true
            }
            None => false,
        }
    }

    /// Clear the lock regardless of who holds it. Returns the previous holder.
    pub fn force_release(&self) -> Option<LockHolder> {
        let previous = {
            let mut inner = self.lock_inner();
            let previous = inner.holder.take();
            inner.record(LockEvent::ForceReleased {
                previous: previous.clone(),
            });
            previous
        };

        match &previous {
            Some(holder) => warn!(
                owner = %holder.owner,
                session_id = %holder.session_id,
                "Voice session force-released"
            ),
            None => debug!("Force release requested while unlocked"),
        }

        self.dispatch();
        previous
    }

    pub fn holder(&self) -> Option<LockHolder> {
        self.lock_inner().holder.clone()
    }

    #[cfg(test)]
    pub fn is_locked(&self) -> bool {
        self.lock_inner().holder.is_some()
    }

    /// Register a listener for lock state changes.
    ///
    /// The listener stays registered until the returned [`Subscription`] is
    /// dropped or explicitly unsubscribed.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&LockEvent) + Send + Sync + 'static,
    {
        let mut inner = self.lock_inner();
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;
        inner.listeners.push((id, Arc::new(listener)));

        Subscription {
            id,
            lock: Arc::downgrade(&self.inner),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.lock_inner().listeners.len()
    }

    /// Deliver queued events in version order, outside the mutex, so a
    /// listener may call back into the lock.
    ///
    /// Returns at once when another call is already delivering; that call
    /// picks up whatever was queued meanwhile.
    fn dispatch(&self) {
        {
            let mut inner = self.lock_inner();
            if inner.dispatching {
                return;
            }
            inner.dispatching = true;
        }
        let _reset = DispatchReset(self);

        loop {
            let next = {
                let mut inner = self.lock_inner();
                match inner.pending.pop_front() {
                    Some(next) => next,
                    None => {
                        inner.dispatching = false;
                        return;
                    }
                }
            };

            trace!(version = next.version, event = next.event.as_str(), "Delivering voice lock event");
            for listener in &next.listeners {
                listener(&next.event);
            }
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, LockInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Frees the dispatcher role when a listener panics mid-delivery, so later
/// changes are still delivered.
struct DispatchReset<'a>(&'a VoiceSessionLock);

impl Drop for DispatchReset<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.lock_inner().dispatching = false;
        }
    }
}

/// Keeps a listener registered; unsubscribes on drop.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    lock: Weak<Mutex<LockInner>>,
}

impl Subscription {
    #[cfg(test)]
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.lock.upgrade() {
            let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

fn generate_session_id() -> String {
    format!("voice_{}", Uuid::new_v4().simple())
}
