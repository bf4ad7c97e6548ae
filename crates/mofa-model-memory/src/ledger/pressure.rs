//! Memory limit, pressure detection and pressure notification.
//!
//! Pressure is a derived state: usage at or above
//! `memory_limit * pressure_threshold`. It is recomputed on every query, so it
//! clears on its own once models are unloaded.
//!
//! A single listener can be registered. It is called with a [`PressureEvent`]
//! each time an allocation (or a lowered limit) moves the ledger from "no
//! pressure" to "pressure". The edge is detected inside the same critical
//! section as the allocation, so concurrent allocators near the threshold
//! produce one notification per crossing. The listener runs on the thread that
//! caused the crossing, after the ledger lock has been released.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use super::MemoryLedger;

type PressureCallback = dyn Fn(PressureEvent) + Send + Sync;

/// Payload passed to the pressure listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PressureEvent {
    /// Tracked usage right after the crossing, in bytes.
    pub current_usage: u64,
    /// The memory limit in effect, in bytes.
    pub limit: u64,
}

pub(super) fn pressure_reached(usage: u64, limit: u64, threshold: f64) -> bool {
    limit != 0 && usage as f64 >= limit as f64 * threshold
}

struct Listener {
    id: u64,
    callback: Arc<PressureCallback>,
}

/// Holder for the registered listener, shared with outstanding subscriptions.
#[derive(Default)]
pub(super) struct ListenerSlot {
    current: Mutex<Option<Listener>>,
    next_id: AtomicU64,
}

impl ListenerSlot {
    fn replace(&self, callback: Arc<PressureCallback>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        *self.current.lock() = Some(Listener { id, callback });
        id
    }

    /// Remove the listener only if it is still the one registered as `id`.
    fn remove(&self, id: u64) -> bool {
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|l| l.id == id) {
            *current = None;
            true
        } else {
            false
        }
    }

    fn callback(&self) -> Option<Arc<PressureCallback>> {
        self.current.lock().as_ref().map(|l| Arc::clone(&l.callback))
    }
}

/// Registration of a pressure listener.
///
/// Dropping the subscription (or calling
/// [`unsubscribe`](Self::unsubscribe)) removes the listener. If another
/// listener has replaced it in the meantime, the newer one is left alone.
/// The subscription does not keep the ledger alive.
#[must_use = "the pressure listener is removed when the subscription is dropped"]
pub struct PressureSubscription {
    slot: Weak<ListenerSlot>,
    id: u64,
}

impl PressureSubscription {
    /// Remove the listener now.
    pub fn unsubscribe(self) {
        // Drop does the work.
    }

    /// Whether this subscription's listener is still the registered one.
    pub fn is_active(&self) -> bool {
        self.slot.upgrade().is_some_and(|slot| {
            slot.current
                .lock()
                .as_ref()
                .is_some_and(|l| l.id == self.id)
        })
    }
}

impl Drop for PressureSubscription {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.upgrade() {
            if slot.remove(self.id) {
                debug!(subscription = self.id, "pressure listener removed");
            }
        }
    }
}

impl fmt::Debug for PressureSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PressureSubscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl MemoryLedger {
    /// The configured memory limit in bytes (`0` = unlimited).
    pub fn memory_limit(&self) -> u64 {
        self.state.lock().memory_limit
    }

    /// Fraction of the limit at which pressure is reported.
    pub fn pressure_threshold(&self) -> f64 {
        self.state.lock().pressure_threshold
    }

    /// Whether tracked usage is at or above the pressure threshold.
    pub fn is_memory_pressure(&self) -> bool {
        self.state.lock().is_pressure()
    }

    /// Usage as a percentage of the limit, `None` when unlimited.
    pub fn memory_usage_percentage(&self) -> Option<f64> {
        let state = self.state.lock();
        (state.memory_limit != 0)
            .then(|| state.total_usage as f64 / state.memory_limit as f64 * 100.0)
    }

    /// Change the memory limit (`0` = unlimited).
    ///
    /// Lowering the limit under current usage counts as a crossing and
    /// notifies the pressure listener.
    pub fn set_memory_limit(&self, bytes: u64) {
        let event = {
            let mut state = self.state.lock();
            state.memory_limit = bytes;
            info!(limit = bytes, usage = state.total_usage, "memory limit changed");
            state.update_pressure()
        };

        if let Some(event) = event {
            self.notify_pressure(event);
        }
    }

    /// Register the pressure listener, replacing any previous one.
    ///
    /// The callback runs synchronously on the allocating thread, so it should
    /// only record the event or hand it off (e.g. schedule an eviction pass);
    /// it must not block.
    pub fn set_memory_pressure_callback<F>(&self, callback: F) -> PressureSubscription
    where
        F: Fn(PressureEvent) + Send + Sync + 'static,
    {
        let id = self.listener.replace(Arc::new(callback));
        debug!(subscription = id, "pressure listener registered");
        PressureSubscription {
            slot: Arc::downgrade(&self.listener),
            id,
        }
    }

    pub(super) fn notify_pressure(&self, event: PressureEvent) {
        info!(
            usage = event.current_usage,
            limit = event.limit,
            "memory pressure threshold crossed"
        );
        if let Some(callback) = self.listener.callback() {
            callback(event);
        }
    }
}
