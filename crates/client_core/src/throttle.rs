//! Bounded-rate publishing of store updates.
//!
//! Updaters are applied eagerly to a staged value so that every updater sees
//! the result of all earlier ones, but the staged value reaches the [`Store`]
//! (and therefore its listeners) at most once per interval: immediately when
//! the window is open, otherwise once at the trailing edge of the window.
//! Only the latest staged value is ever kept.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{runtime::Handle, time::Instant};
use tracing::debug;

use crate::store::Store;

pub const DEFAULT_THROTTLE_INTERVAL: Duration = Duration::from_millis(33);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleOptions {
    pub interval: Duration,
}

impl Default for ThrottleOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_THROTTLE_INTERVAL,
        }
    }
}

struct ThrottleState<S> {
    staged: Option<Arc<S>>,
    last_publish: Option<Instant>,
    flush_scheduled: bool,
    handed_off: u64,
}

impl<S> ThrottleState<S> {
    fn hand_off(&mut self, value: Arc<S>, now: Instant) -> Outgoing<S> {
        self.last_publish = Some(now);
        self.handed_off += 1;
        Outgoing {
            seq: self.handed_off,
            value,
        }
    }
}

/// A value leaving the throttle, numbered in hand-off order.
struct Outgoing<S> {
    seq: u64,
    value: Arc<S>,
}

pub struct ThrottledStoreUpdater<S> {
    store: Store<S>,
    interval: Duration,
    state: Arc<Mutex<ThrottleState<S>>>,
    published: Arc<Mutex<u64>>,
}

impl<S> Clone for ThrottledStoreUpdater<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            interval: self.interval,
            state: Arc::clone(&self.state),
            published: Arc::clone(&self.published),
        }
    }
}

impl<S: Send + Sync + 'static> ThrottledStoreUpdater<S> {
    pub fn new(store: Store<S>, options: ThrottleOptions) -> Self {
        Self {
            store,
            interval: options.interval,
            state: Arc::new(Mutex::new(ThrottleState {
                staged: None,
                last_publish: None,
                flush_scheduled: false,
                handed_off: 0,
            })),
            published: Arc::new(Mutex::new(0)),
        }
    }

    pub fn store(&self) -> &Store<S> {
        &self.store
    }

    pub fn has_pending(&self) -> bool {
        self.lock().staged.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, ThrottleState<S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `updater` to the newest value (staged or published) without
    /// blocking. A failing updater leaves staged and published values intact
    /// and its error is returned here.
    ///
    /// Store listeners run after the throttle lock is released, so a listener
    /// may call back into this updater.
    pub fn update_with<E>(&self, updater: impl FnOnce(&S) -> Result<S, E>) -> Result<(), E> {
        let outgoing = {
            let mut guard = self.lock();
            let base = guard.staged.clone().unwrap_or_else(|| self.store.get());
            let next = Arc::new(updater(&base)?);

            let now = Instant::now();
            let window_open = guard
                .last_publish
                .map_or(true, |last| now.duration_since(last) >= self.interval);

            if window_open && !guard.flush_scheduled {
                guard.staged = None;
                Some(guard.hand_off(next, now))
            } else {
                guard.staged = Some(next);
                if guard.flush_scheduled {
                    None
                } else {
                    self.schedule_flush(&mut guard, now)
                }
            }
        };
        if let Some(outgoing) = outgoing {
            self.publish(outgoing);
        }
        Ok(())
    }

    fn schedule_flush(&self, guard: &mut ThrottleState<S>, now: Instant) -> Option<Outgoing<S>> {
        let deadline = guard
            .last_publish
            .map_or(now, |last| last + self.interval);
        match Handle::try_current() {
            Ok(handle) => {
                guard.flush_scheduled = true;
                let updater = self.clone();
                handle.spawn(async move {
                    tokio::time::sleep_until(deadline).await;
                    updater.flush_scheduled();
                });
                None
            }
            Err(_) => {
                debug!("no async runtime for trailing flush; publishing immediately");
                let staged = guard.staged.take()?;
                Some(guard.hand_off(staged, now))
            }
        }
    }

    /// Publishes any staged value right away.
    pub fn flush(&self) {
        let outgoing = {
            let mut guard = self.lock();
            let staged = guard.staged.take();
            staged.map(|staged| guard.hand_off(staged, Instant::now()))
        };
        if let Some(outgoing) = outgoing {
            self.publish(outgoing);
        }
    }

    fn flush_scheduled(&self) {
        let outgoing = {
            let mut guard = self.lock();
            guard.flush_scheduled = false;
            let staged = guard.staged.take();
            staged.map(|staged| guard.hand_off(staged, Instant::now()))
        };
        if let Some(outgoing) = outgoing {
            self.publish(outgoing);
        }
    }

    // A value handed off before one that is already in the store is stale.
    fn publish(&self, outgoing: Outgoing<S>) {
        {
            let mut published = self.published.lock().unwrap_or_else(PoisonError::into_inner);
            if *published >= outgoing.seq {
                debug!(seq = outgoing.seq, "skipping superseded publish");
                return;
            }
            *published = outgoing.seq;
            self.store.swap_shared(outgoing.value);
        }
        self.store.after_publish();
    }
}

#[cfg(test)]
#[path = "tests/throttle_tests.rs"]
mod tests;
