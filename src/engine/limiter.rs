//! Admission control for backend executions.
//!
//! Each scope (a room, or the global scope for roomless tasks) has an active
//! count and a FIFO queue. Releasing a slot while someone waits hands the
//! slot straight to the first waiter, so a newcomer can never steal it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Which queue a task waits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotScope {
    Global,
    Room(Uuid),
}

impl SlotScope {
    pub fn for_room(room_id: Option<Uuid>) -> Self {
        room_id.map(SlotScope::Room).unwrap_or(SlotScope::Global)
    }
}

#[derive(Default)]
struct ScopeState {
    active: u32,
    waiters: VecDeque<oneshot::Sender<()>>,
}

#[derive(Default)]
struct Inner {
    scopes: Mutex<HashMap<SlotScope, ScopeState>>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<SlotScope, ScopeState>> {
        self.scopes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, scope: SlotScope) {
        let mut scopes = self.lock();
        let Some(state) = scopes.get_mut(&scope) else {
            return;
        };

        while let Some(waiter) = state.waiters.pop_front() {
            // A closed receiver means the waiter was cancelled; try the next one.
            if waiter.send(()).is_ok() {
                return;
            }
        }

        state.active = state.active.saturating_sub(1);
        if state.active == 0 {
            scopes.remove(&scope);
        }
    }
}

/// Held while a backend call executes; the slot is released on drop.
pub struct SlotPermit {
    inner: Arc<Inner>,
    scope: SlotScope,
}

impl SlotPermit {
    pub fn scope(&self) -> SlotScope {
        self.scope
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.inner.release(self.scope);
    }
}

impl std::fmt::Debug for SlotPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPermit").field("scope", &self.scope).finish()
    }
}

/// A queued caller. Dropping it before admission gives back a slot that was
/// already handed over, whether the caller was cancelled or its future dropped.
struct Waiter {
    rx: oneshot::Receiver<()>,
    inner: Arc<Inner>,
    scope: SlotScope,
    admitted: bool,
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if self.admitted {
            return;
        }
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            self.inner.release(self.scope);
        }
    }
}

/// Process-wide concurrency limiter. Clones share state.
#[derive(Clone, Default)]
pub struct ConcurrencyLimiter {
    inner: Arc<Inner>,
}

impl ConcurrencyLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn permit(&self, scope: SlotScope) -> SlotPermit {
        SlotPermit {
            inner: self.inner.clone(),
            scope,
        }
    }

    /// Wait for a slot in `scope` allowing at most `max_slots` at once.
    ///
    /// Returns `None` if `cancel` fires first.
    pub async fn acquire(
        &self,
        scope: SlotScope,
        max_slots: u32,
        cancel: &CancellationToken,
    ) -> Option<SlotPermit> {
        let rx = {
            let mut scopes = self.inner.lock();
            let state = scopes.entry(scope).or_default();
            if state.active < max_slots.max(1) {
                state.active += 1;
                return Some(self.permit(scope));
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            debug!(
                ?scope,
                active = state.active,
                queued = state.waiters.len(),
                "Waiting for a concurrency slot"
            );
            rx
        };

        let mut waiter = Waiter {
            rx,
            inner: self.inner.clone(),
            scope,
            admitted: false,
        };
        let handed = tokio::select! {
            handed = &mut waiter.rx => handed.is_ok(),
            _ = cancel.cancelled() => false,
        };
        if !handed {
            return None;
        }
        waiter.admitted = true;
        Some(self.permit(scope))
    }

    /// Slots currently held in `scope`.
    pub fn active(&self, scope: SlotScope) -> u32 {
        self.inner.lock().get(&scope).map(|s| s.active).unwrap_or(0)
    }

    /// Callers waiting in `scope` (including cancelled ones not yet skipped).
    pub fn queued(&self, scope: SlotScope) -> usize {
        self.inner
            .lock()
            .get(&scope)
            .map(|s| s.waiters.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test]
    async fn three_slots_five_callers() {
        let limiter = ConcurrencyLimiter::new();
        let cancel = CancellationToken::new();
        let scope = SlotScope::Global;

        let mut callers: Vec<_> = (0..5)
            .map(|_| task::spawn(limiter.acquire(scope, 3, &cancel)))
            .collect();

        let mut held = Vec::new();
        for caller in callers.iter_mut().take(3) {
            held.push(assert_ready!(caller.poll()).expect("slot"));
        }
        assert_pending!(callers[3].poll());
        assert_pending!(callers[4].poll());
        assert_eq!(limiter.active(scope), 3);
        assert_eq!(limiter.queued(scope), 2);

        drop(held.pop());
        assert!(callers[3].is_woken());
        let fourth = assert_ready!(callers[3].poll()).expect("handed slot");
        assert_pending!(callers[4].poll());
        assert_eq!(limiter.active(scope), 3);

        drop(fourth);
        drop(held);
        let fifth = assert_ready!(callers[4].poll()).expect("handed slot");
        assert_eq!(limiter.active(scope), 1);
        drop(fifth);
        assert_eq!(limiter.active(scope), 0);
    }

    #[tokio::test]
    async fn scopes_are_independent() {
        let limiter = ConcurrencyLimiter::new();
        let cancel = CancellationToken::new();
        let room = SlotScope::Room(Uuid::new_v4());

        let _global = limiter.acquire(SlotScope::Global, 1, &cancel).await.unwrap();
        let mut blocked = task::spawn(limiter.acquire(SlotScope::Global, 1, &cancel));
        assert_pending!(blocked.poll());

        let room_permit = limiter.acquire(room, 1, &cancel).await;
        assert!(room_permit.is_some());
        assert_eq!(SlotScope::for_room(None), SlotScope::Global);
    }

    #[tokio::test]
    async fn cancelled_waiter_is_skipped() {
        let limiter = ConcurrencyLimiter::new();
        let scope = SlotScope::Global;
        let keep = CancellationToken::new();
        let abort = CancellationToken::new();

        let first = limiter.acquire(scope, 1, &keep).await.unwrap();
        let mut cancelled = task::spawn(limiter.acquire(scope, 1, &abort));
        let mut patient = task::spawn(limiter.acquire(scope, 1, &keep));
        assert_pending!(cancelled.poll());
        assert_pending!(patient.poll());

        abort.cancel();
        assert!(assert_ready!(cancelled.poll()).is_none());

        drop(first);
        let handed = assert_ready!(patient.poll());
        assert!(handed.is_some());
        assert_eq!(limiter.active(scope), 1);
    }

    #[tokio::test]
    async fn dropped_waiter_returns_handed_slot() {
        let limiter = ConcurrencyLimiter::new();
        let cancel = CancellationToken::new();
        let scope = SlotScope::Global;

        let held = limiter.acquire(scope, 1, &cancel).await.unwrap();
        let mut queued = task::spawn(limiter.acquire(scope, 1, &cancel));
        assert_pending!(queued.poll());

        // The slot is handed to the queued caller, which goes away unpolled.
        drop(held);
        drop(queued);
        assert_eq!(limiter.active(scope), 0);

        let mut fresh = task::spawn(limiter.acquire(scope, 1, &cancel));
        assert!(assert_ready!(fresh.poll()).is_some());
    }

    #[tokio::test]
    async fn dropped_waiter_before_handoff_leaves_queue() {
        let limiter = ConcurrencyLimiter::new();
        let cancel = CancellationToken::new();
        let scope = SlotScope::Global;

        let held = limiter.acquire(scope, 1, &cancel).await.unwrap();
        let mut queued = task::spawn(limiter.acquire(scope, 1, &cancel));
        assert_pending!(queued.poll());
        drop(queued);

        drop(held);
        assert_eq!(limiter.active(scope), 0);
        assert_eq!(limiter.queued(scope), 0);
    }
}
