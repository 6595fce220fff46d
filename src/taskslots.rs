//! Per-slot task coalescing: enqueueing a task into an occupied slot cancels
//! the predecessor (spec.md §3, §4.5, §5). Grounded on the cancellation
//! dance in `examples/original_source/ha_wb_discovery/homeassistant.py`'s
//! `_run_task`, translated from `asyncio.Task.cancel()` to
//! `JoinHandle::abort()`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use tokio::task::JoinHandle;

/// A map from slot key to the single in-flight task occupying it.
#[derive(Default)]
pub struct TaskSlots {
    slots: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TaskSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels any task already running in `slot`, then spawns `fut` into
    /// it. A cancelled task never runs its remaining side effects, since
    /// `abort()` drops it at its next await point.
    pub fn spawn(&self, slot: impl Into<String>, fut: impl Future<Output = ()> + Send + 'static) {
        let slot = slot.into();
        let handle = tokio::spawn(fut);
        let mut slots = self.slots.lock().expect("task slot mutex poisoned");
        if let Some(previous) = slots.insert(slot, handle) {
            previous.abort();
        }
    }

    /// Aborts every in-flight task. Used on supervisor stop; cancellations
    /// raised during drain are expected and not treated as errors.
    pub fn abort_all(&self) {
        let mut slots = self.slots.lock().expect("task slot mutex poisoned");
        for (_, handle) in slots.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn replacing_a_slot_cancels_the_predecessor() {
        let slots = Arc::new(TaskSlots::new());
        let ran = Arc::new(AtomicUsize::new(0));

        let ran_first = Arc::clone(&ran);
        slots.spawn("x", async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            ran_first.fetch_add(1, Ordering::SeqCst);
        });

        let ran_second = Arc::clone(&ran);
        slots.spawn("x", async move {
            ran_second.fetch_add(10, Ordering::SeqCst);
        });

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn independent_slots_both_run() {
        let slots = TaskSlots::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let a = Arc::clone(&ran);
        slots.spawn("a", async move {
            a.fetch_add(1, Ordering::SeqCst);
        });
        let b = Arc::clone(&ran);
        slots.spawn("b", async move {
            b.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }
}
