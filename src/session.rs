//! Outstanding-work tracking for a caller-side task.
//!
//! A session counts the asynchronous operations started on behalf of one
//! processing task (a message being filtered, say). Each operation registers
//! a finalizer; releasing the operation drops it unrun, destroying the
//! session runs every finalizer still registered so the operations can
//! cancel themselves.

use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::FxHashMap;
use tokio::sync::Notify;

type Finalizer = Box<dyn FnOnce()>;

/// Identifies one registered unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(u64);

#[derive(Default)]
struct SessionState {
    next_event: u64,
    events: FxHashMap<u64, Finalizer>,
    destroyed: bool,
}

#[derive(Clone, Default)]
pub struct AsyncSession {
    state: Rc<RefCell<SessionState>>,
    drained: Rc<Notify>,
}

impl AsyncSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one unit of outstanding work.
    ///
    /// Returns `None` once the session has been destroyed.
    pub fn add_event(&self, finalizer: impl FnOnce() + 'static) -> Option<EventId> {
        let mut state = self.state.borrow_mut();
        if state.destroyed {
            return None;
        }

        let id = state.next_event;
        state.next_event += 1;
        state.events.insert(id, Box::new(finalizer));
        Some(EventId(id))
    }

    /// Release a unit of work without running its finalizer.
    pub fn remove_event(&self, event: EventId) -> bool {
        let (removed, drained) = {
            let mut state = self.state.borrow_mut();
            let removed = state.events.remove(&event.0).is_some();
            (removed, state.events.is_empty())
        };

        if removed && drained {
            self.drained.notify_waiters();
        }
        removed
    }

    /// Units of work still registered.
    pub fn pending(&self) -> usize {
        self.state.borrow().events.len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.borrow().destroyed
    }

    /// Tear the session down, running the finalizer of every unit still
    /// registered. Returns how many were finalized.
    pub fn destroy(&self) -> usize {
        let events = {
            let mut state = self.state.borrow_mut();
            state.destroyed = true;
            std::mem::take(&mut state.events)
        };

        let count = events.len();
        for (_, finalizer) in events {
            finalizer();
        }
        self.drained.notify_waiters();
        count
    }

    /// Wait until no unit of work is outstanding.
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::time::Duration;

    #[test]
    fn remove_releases_without_finalizing() {
        let session = AsyncSession::new();
        let ran = Rc::new(Cell::new(false));

        let flag = ran.clone();
        let event = session.add_event(move || flag.set(true)).unwrap();
        assert_eq!(session.pending(), 1);

        assert!(session.remove_event(event));
        assert!(!session.remove_event(event));
        assert_eq!(session.pending(), 0);
        assert!(!ran.get());
    }

    #[test]
    fn destroy_runs_remaining_finalizers() {
        let session = AsyncSession::new();
        let ran = Rc::new(Cell::new(0));

        let mut events = Vec::new();
        for _ in 0..3 {
            let counter = ran.clone();
            events.push(
                session
                    .add_event(move || counter.set(counter.get() + 1))
                    .unwrap(),
            );
        }
        session.remove_event(events[1]);

        assert_eq!(session.destroy(), 2);
        assert_eq!(ran.get(), 2);
        assert!(session.is_destroyed());
        assert!(session.add_event(|| {}).is_none());
    }

    #[test]
    fn finalizer_may_touch_the_session() {
        let session = AsyncSession::new();

        let inner = session.clone();
        let event = session.add_event(move || {
            assert_eq!(inner.pending(), 0);
        });
        assert!(event.is_some());

        assert_eq!(session.destroy(), 1);
    }

    #[tokio::test]
    async fn wait_drained_returns_after_last_release() {
        let session = AsyncSession::new();
        let first = session.add_event(|| {}).unwrap();
        let second = session.add_event(|| {}).unwrap();

        let releaser = session.clone();
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                tokio::task::spawn_local(async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    releaser.remove_event(first);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    releaser.remove_event(second);
                });

                tokio::time::timeout(Duration::from_secs(5), session.wait_drained())
                    .await
                    .expect("session never drained");
            })
            .await;

        assert_eq!(session.pending(), 0);
    }
}
