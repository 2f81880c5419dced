//! Change notification.
//!
//! Watchers register a glob pattern and receive every committed change
//! whose key matches. Delivery happens on a dedicated dispatch task —
//! never synchronously on the writing thread — either into a channel
//! drained via [`WatchHandle::next_change`] or into a registered callback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use kasane_core::error::{Error, Result};
use kasane_core::metrics::Metrics;
use kasane_core::pattern::glob_match;
use kasane_core::types::ConfigValue;

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub max_watches: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { max_watches: 1024 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    /// Also deliver deletions (events with `value: None`).
    pub include_removals: bool,
}

/// One committed change.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub path: Arc<str>,
    /// `None` for removals.
    pub value: Option<ConfigValue>,
    /// Global version this change committed at.
    pub version: u64,
    pub timestamp_ns: u64,
}

enum WatchSink {
    Channel(mpsc::UnboundedSender<ChangeEvent>),
    Callback(Arc<dyn Fn(ChangeEvent) + Send + Sync>),
}

struct Watcher {
    pattern: String,
    options: WatchOptions,
    sink: WatchSink,
}

type WatcherMap = DashMap<u64, Watcher>;

pub struct WatchRegistry {
    watchers: Arc<WatcherMap>,
    next_id: AtomicU64,
    max_watches: usize,
    metrics: Metrics,
}

impl WatchRegistry {
    /// Build the registry and its dispatch task. The returned sender is
    /// the manager's publish side; dropping it stops the dispatcher.
    pub fn spawn(
        config: WatchConfig,
        metrics: Metrics,
    ) -> (Arc<Self>, mpsc::UnboundedSender<ChangeEvent>) {
        let registry = Arc::new(Self {
            watchers: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            max_watches: config.max_watches,
            metrics,
        });

        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ChangeEvent>();
        let dispatch = Arc::clone(&registry);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                dispatch.dispatch(event);
            }
            debug!("Watch dispatcher stopped");
        });

        (registry, events_tx)
    }

    fn dispatch(&self, event: ChangeEvent) {
        let mut dead = Vec::new();
        for watcher in self.watchers.iter() {
            if event.value.is_none() && !watcher.options.include_removals {
                continue;
            }
            if !glob_match(&watcher.pattern, &event.path) {
                continue;
            }
            self.metrics.record_watch_event();
            match &watcher.sink {
                WatchSink::Channel(tx) => {
                    if tx.send(event.clone()).is_err() {
                        dead.push(*watcher.key());
                    }
                }
                WatchSink::Callback(cb) => cb(event.clone()),
            }
        }
        for id in dead {
            self.watchers.remove(&id);
        }
    }

    fn install(&self, watcher: Watcher) -> Result<u64> {
        if self.watchers.len() >= self.max_watches {
            return Err(Error::ResourceLimit {
                resource: format!("watches ({})", self.max_watches),
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.watchers.insert(id, watcher);
        Ok(id)
    }

    /// Channel-based subscription.
    pub fn register(&self, pattern: &str, options: WatchOptions) -> Result<WatchHandle> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.install(Watcher {
            pattern: pattern.to_string(),
            options,
            sink: WatchSink::Channel(tx),
        })?;
        Ok(WatchHandle {
            id,
            watchers: Arc::downgrade(&self.watchers),
            rx: Some(rx),
        })
    }

    /// Callback-based subscription; the callback runs on the dispatch
    /// task.
    pub fn register_callback(
        &self,
        pattern: &str,
        callback: impl Fn(ChangeEvent) + Send + Sync + 'static,
        options: WatchOptions,
    ) -> Result<WatchHandle> {
        let id = self.install(Watcher {
            pattern: pattern.to_string(),
            options,
            sink: WatchSink::Callback(Arc::new(callback)),
        })?;
        Ok(WatchHandle {
            id,
            watchers: Arc::downgrade(&self.watchers),
            rx: None,
        })
    }

    pub fn unregister(&self, id: u64) {
        self.watchers.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.watchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }
}

/// Keeps a subscription alive; dropping it unregisters the watcher.
pub struct WatchHandle {
    id: u64,
    watchers: Weak<WatcherMap>,
    rx: Option<mpsc::UnboundedReceiver<ChangeEvent>>,
}

impl WatchHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next matching change, for channel-based subscriptions. Returns
    /// `None` once the store shuts down (or for callback subscriptions).
    pub async fn next_change(&mut self) -> Option<ChangeEvent> {
        self.rx.as_mut()?.recv().await
    }

    /// Non-blocking drain of any already-delivered change.
    pub fn try_next_change(&mut self) -> Option<ChangeEvent> {
        self.rx.as_mut()?.try_recv().ok()
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Some(watchers) = self.watchers.upgrade() {
            watchers.remove(&self.id);
        }
    }
}
