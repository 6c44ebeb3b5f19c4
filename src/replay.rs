//! Time-bounded record of consumed message IDs.

use std::{
    collections::HashMap,
    sync::{
        mpsc::{self, RecvTimeoutError},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration as StdDuration,
};

use parking_lot::Mutex;
use time::OffsetDateTime;
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct ReplayCache {
    entries: Mutex<HashMap<String, OffsetDateTime>>,
}

impl ReplayCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `id` until `expiry`. Returns false when the ID is already
    /// recorded and unexpired. Concurrent callers with the same ID see
    /// exactly one `true`.
    pub fn observe(&self, id: &str, expiry: OffsetDateTime) -> bool {
        self.observe_at(id, expiry, OffsetDateTime::now_utc())
    }

    pub fn observe_at(&self, id: &str, expiry: OffsetDateTime, now: OffsetDateTime) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(id) {
            Some(existing) if *existing > now => {
                warn!(id, "replayed message ID");
                false
            }
            _ => {
                entries.insert(id.to_string(), expiry);
                true
            }
        }
    }

    pub fn contains(&self, id: &str, now: OffsetDateTime) -> bool {
        self.entries
            .lock()
            .get(id)
            .is_some_and(|expiry| *expiry > now)
    }

    /// Drops every entry expired at `now`, returning how many went.
    pub fn purge_expired(&self, now: OffsetDateTime) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, expiry| *expiry > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Purges expired entries every `interval` on a background thread until
    /// the returned handle is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: StdDuration) -> SweeperHandle {
        let cache = Arc::clone(self);
        let (stop, stopped) = mpsc::channel::<()>();
        let thread = thread::spawn(move || loop {
            match stopped.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    let purged = cache.purge_expired(OffsetDateTime::now_utc());
                    if purged > 0 {
                        debug!(purged, remaining = cache.len(), "swept replay cache");
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        });
        SweeperHandle {
            stop: Some(stop),
            thread: Some(thread),
        }
    }
}

#[derive(Debug)]
pub struct SweeperHandle {
    stop: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("replay cache sweeper panicked");
            }
        }
    }
}
