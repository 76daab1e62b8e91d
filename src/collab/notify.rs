//! Notification dispatch with timed dismissal.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::workflow::{Notification, NotificationKind, WorkflowAction, WorkflowStore};

/// Pushes notifications into the store and removes transient ones after
/// `duration`. Clones share timers.
#[derive(Clone)]
pub struct Notifier {
    store: Arc<WorkflowStore>,
    duration: Duration,
    timers: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    closed: Arc<AtomicBool>,
}

impl Notifier {
    pub fn new(store: Arc<WorkflowStore>, duration: Duration) -> Self {
        Self {
            store,
            duration,
            timers: Arc::new(Mutex::new(HashMap::new())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Show a notification that dismisses itself
    pub fn notify(&self, kind: NotificationKind, message: impl Into<String>) -> Option<String> {
        self.push(Notification::new(kind, message, false))
    }

    /// Show a notification that stays until removed
    pub fn notify_persistent(
        &self,
        kind: NotificationKind,
        message: impl Into<String>,
    ) -> Option<String> {
        self.push(Notification::new(kind, message, true))
    }

    fn push(&self, notification: Notification) -> Option<String> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let id = notification.id.clone();
        let persistent = notification.persistent;
        self.store.dispatch(WorkflowAction::AddNotification(notification));

        if !persistent {
            let store = self.store.clone();
            let timers = self.timers.clone();
            let duration = self.duration;
            let timer_id = id.clone();

            let mut guard = self.timers.lock();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                timers.lock().remove(&timer_id);
                store.dispatch(WorkflowAction::RemoveNotification(timer_id));
            });
            guard.insert(id.clone(), handle);
        }
        Some(id)
    }

    /// Stop accepting notifications and abort pending dismissals
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for (_, handle) in self.timers.lock().drain() {
            handle.abort();
        }
    }

    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.lock().len()
    }
}
