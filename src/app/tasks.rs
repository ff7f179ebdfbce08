//! Readiness of background embedding extraction for uploaded images.
//!
//! Every upload gets a watch channel; searches that arrive while extraction
//! is still running can wait on it for a bounded time instead of failing.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ImageStatus {
    Pending,
    Ready,
    Failed { error: String },
}

impl ImageStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, ImageStatus::Pending)
    }
}

struct Entry {
    tx: watch::Sender<ImageStatus>,
    started: Instant,
}

#[derive(Default)]
pub struct ImageTasks {
    entries: Mutex<HashMap<String, Entry>>,
}

impl ImageTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `image_id` as pending, replacing any earlier entry.
    pub fn start(&self, image_id: &str) {
        let (tx, _) = watch::channel(ImageStatus::Pending);
        self.lock().insert(
            image_id.to_string(),
            Entry {
                tx,
                started: Instant::now(),
            },
        );
    }

    pub fn finish(&self, image_id: &str, status: ImageStatus) {
        if let Some(entry) = self.lock().get(image_id) {
            // send_replace works without live receivers
            entry.tx.send_replace(status);
        }
    }

    pub fn status(&self, image_id: &str) -> Option<ImageStatus> {
        self.lock()
            .get(image_id)
            .map(|entry| entry.tx.borrow().clone())
    }

    /// Current status once it leaves `Pending`, or after `timeout`.
    pub async fn wait(&self, image_id: &str, timeout: Duration) -> Option<ImageStatus> {
        let mut rx = self.lock().get(image_id)?.tx.subscribe();

        if !timeout.is_zero() {
            let _ = tokio::time::timeout(timeout, rx.wait_for(|status| !status.is_pending())).await;
        }

        let status = rx.borrow().clone();
        Some(status)
    }

    pub fn forget(&self, image_id: &str) -> bool {
        self.lock().remove(image_id).is_some()
    }

    /// Drop entries older than `max_age`, returning their ids.
    pub fn sweep(&self, max_age: Duration) -> Vec<String> {
        let mut entries = self.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.started.elapsed() >= max_age)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            entries.remove(id);
        }
        expired
    }

    pub fn pending(&self) -> usize {
        self.lock()
            .values()
            .filter(|entry| entry.tx.borrow().is_pending())
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
