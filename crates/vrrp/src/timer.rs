//! Per-instance protocol timers.
//!
//! Every armed timer is a sleeping task that posts a [`TimerExpiry`] onto the
//! dispatcher's channel. Each schedule call issues a fresh generation number;
//! the dispatcher only acts on an expiry whose generation is still the current
//! one for that instance and class, so an expiry that raced with a reschedule
//! or a cancel is dropped.

use crate::types::InstanceKey;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::trace;

/// The two timer classes an instance runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerClass {
    /// Fires when no advertisement was seen for the master-down interval
    MasterDown,
    /// Fires periodically while master to re-send the advertisement
    Advertisement,
}

/// Expiry event delivered to the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerExpiry {
    pub key: InstanceKey,
    pub class: TimerClass,
    pub generation: u64,
}

struct TimerHandle {
    generation: u64,
    task: JoinHandle<()>,
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Owns every armed timer; driven exclusively by the dispatcher task.
pub struct TimerManager {
    timers: HashMap<(InstanceKey, TimerClass), TimerHandle>,
    next_generation: u64,
    expiry_tx: mpsc::UnboundedSender<TimerExpiry>,
}

impl TimerManager {
    pub fn new(expiry_tx: mpsc::UnboundedSender<TimerExpiry>) -> Self {
        Self {
            timers: HashMap::new(),
            next_generation: 1,
            expiry_tx,
        }
    }

    /// Arm (or re-arm) a timer, invalidating any previous handle of the same class.
    ///
    /// Returns the generation the expiry will carry.
    pub fn schedule(&mut self, key: InstanceKey, class: TimerClass, after: Duration) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;

        let deadline = Instant::now() + after;
        let expiry_tx = self.expiry_tx.clone();
        let task = tokio::spawn(async move {
            sleep_until(deadline).await;
            let _ = expiry_tx.send(TimerExpiry {
                key,
                class,
                generation,
            });
        });

        trace!(%key, ?class, generation, after_ms = after.as_millis() as u64, "Timer armed");

        // Dropping the replaced handle aborts its task
        self.timers.insert(
            (key, class),
            TimerHandle { generation, task },
        );
        generation
    }

    /// Cancel one timer; returns whether it was armed.
    pub fn cancel(&mut self, key: InstanceKey, class: TimerClass) -> bool {
        self.timers.remove(&(key, class)).is_some()
    }

    /// Cancel both timer classes of an instance
    pub fn cancel_all(&mut self, key: InstanceKey) {
        self.cancel(key, TimerClass::MasterDown);
        self.cancel(key, TimerClass::Advertisement);
    }

    /// Consume an expiry event.
    ///
    /// Returns true if the expiry belongs to the currently armed handle, which
    /// is then disarmed. Stale expiries return false and change nothing.
    pub fn accept(&mut self, expiry: &TimerExpiry) -> bool {
        match self.timers.get(&(expiry.key, expiry.class)) {
            Some(handle) if handle.generation == expiry.generation => {
                self.timers.remove(&(expiry.key, expiry.class));
                true
            }
            _ => false,
        }
    }

    pub fn is_armed(&self, key: InstanceKey, class: TimerClass) -> bool {
        self.timers.contains_key(&(key, class))
    }

    /// Cancel every timer
    pub fn clear(&mut self) {
        self.timers.clear();
    }
}
