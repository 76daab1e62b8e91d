//! Keyed trailing-edge debounce.
//!
//! Scheduling work for a key cancels whatever was pending for that key and
//! starts the delay again, so a burst of edits produces one call carrying the
//! last value. Each pending slot is an abortable tokio task. Once the delay
//! elapses the task moves to the running set, where it can still be aborted
//! by [`Debouncer::cancel_all`] until its work completes.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

struct Slot {
    ticket: u64,
    handle: JoinHandle<()>,
}

pub struct Debouncer<K> {
    delay: Duration,
    /// Waiting out the delay, one per key
    slots: Arc<Mutex<HashMap<K, Slot>>>,
    /// Past the delay with work still in flight, keyed by ticket.
    /// Locked only while `slots` is held or on its own.
    running: Arc<Mutex<HashMap<u64, JoinHandle<()>>>>,
    next_ticket: AtomicU64,
}

impl<K> Debouncer<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            slots: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(Mutex::new(HashMap::new())),
            next_ticket: AtomicU64::new(0),
        }
    }

    /// Run `work` after the delay unless `key` is scheduled again first
    pub fn schedule<F, Fut>(&self, key: K, work: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let delay = self.delay;
        let slots = self.slots.clone();
        let running = self.running.clone();
        let task_key = key.clone();

        let mut guard = self.slots.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut slots = slots.lock();
                match slots.get(&task_key) {
                    Some(slot) if slot.ticket == ticket => {
                        if let Some(slot) = slots.remove(&task_key) {
                            running.lock().insert(ticket, slot.handle);
                        }
                    }
                    _ => return,
                }
            }
            work().await;
            running.lock().remove(&ticket);
        });
        if let Some(previous) = guard.insert(key, Slot { ticket, handle }) {
            previous.handle.abort();
        }
    }

    pub fn cancel(&self, key: &K) -> bool {
        match self.slots.lock().remove(key) {
            Some(slot) => {
                slot.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Abort every pending slot and any work already in flight. Returns how
    /// many were aborted.
    pub fn cancel_all(&self) -> usize {
        let handles: Vec<JoinHandle<()>> = {
            let mut slots = self.slots.lock();
            let mut running = self.running.lock();
            slots
                .drain()
                .map(|(_, slot)| slot.handle)
                .chain(running.drain().map(|(_, handle)| handle))
                .collect()
        };
        for handle in &handles {
            handle.abort();
        }
        handles.len()
    }

    /// Slots waiting out the delay plus work still running
    pub fn pending(&self) -> usize {
        let slots = self.slots.lock();
        slots.len() + self.running.lock().len()
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.slots.lock().contains_key(key)
    }
}

impl<K> Drop for Debouncer<K> {
    fn drop(&mut self) {
        for (_, slot) in self.slots.lock().drain() {
            slot.handle.abort();
        }
        for (_, handle) in self.running.lock().drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, Debouncer<&'static str>) {
        (
            Arc::new(Mutex::new(Vec::new())),
            Debouncer::new(Duration::from_millis(500)),
        )
    }

    fn push(log: &Arc<Mutex<Vec<u32>>>, value: u32) -> impl FnOnce() -> std::future::Ready<()> {
        let log = log.clone();
        move || {
            log.lock().push(value);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_to_last() {
        let (log, debouncer) = recorder();

        for value in 1..=5 {
            debouncer.schedule("name", push(&log, value));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(log.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(*log.lock(), vec![5]);
        assert_eq!(debouncer.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_call_restarts_delay() {
        let (log, debouncer) = recorder();

        for value in 1..=3 {
            debouncer.schedule("name", push(&log, value));
            tokio::time::sleep(Duration::from_millis(400)).await;
        }
        assert!(log.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*log.lock(), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let (log, debouncer) = recorder();

        debouncer.schedule("name", push(&log, 1));
        debouncer.schedule("city", push(&log, 2));
        assert!(debouncer.is_pending(&"city"));

        tokio::time::sleep(Duration::from_millis(600)).await;
        let mut fired = log.lock().clone();
        fired.sort_unstable();
        assert_eq!(fired, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_prevents_firing() {
        let (log, debouncer) = recorder();

        debouncer.schedule("name", push(&log, 1));
        debouncer.schedule("city", push(&log, 2));
        assert_eq!(debouncer.cancel_all(), 2);
        assert!(!debouncer.cancel(&"name"));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(log.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_aborts_work_in_flight() {
        let (log, debouncer) = recorder();
        let sink = log.clone();
        debouncer.schedule("name", move || async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            sink.lock().push(1);
        });

        // Past the delay, inside the work
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!debouncer.is_pending(&"name"));
        assert_eq!(debouncer.pending(), 1);
        assert_eq!(debouncer.cancel_all(), 1);
        assert_eq!(debouncer.pending(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(log.lock().is_empty());
    }
}
