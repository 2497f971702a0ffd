//! Local cache of the watched collection.
//!
//! The [`Informer`] lists every resource, then follows the watch stream from
//! the listed version, keeping an in-memory mirror current. Every change it
//! applies is reported to a [`ResourceEventHandler`]. A periodic relist heals
//! notifications the watch may have missed, and any watch failure falls back
//! to a fresh list after a reconnect backoff.

pub mod detector;

pub use detector::{ChangeDetector, ChangePredicate};

use futures::StreamExt;
use opentelemetry::KeyValue;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ResourceApi, WatchEvent};
use crate::error::ApiError;
use crate::model::{Expression, ObjectKey};
use crate::telemetry::metrics;

/// Receives every change the informer applies to its mirror.
///
/// Called from the informer task, in notification order, outside any lock.
pub trait ResourceEventHandler: Send + Sync {
    fn on_add(&self, item: &Expression);
    fn on_update(&self, old: &Expression, new: &Expression);
    fn on_delete(&self, _item: &Expression) {}
}

#[derive(Debug, Clone)]
pub struct InformerConfig {
    /// Period of the full relist. Zero disables it.
    pub resync_interval: Duration,
    /// First delay before relisting after a list/watch failure.
    pub reconnect_base: Duration,
    /// Upper bound for the reconnect delay.
    pub reconnect_max: Duration,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(30),
            reconnect_base: Duration::from_millis(200),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

pub struct Informer {
    api: Arc<dyn ResourceApi>,
    handler: Arc<dyn ResourceEventHandler>,
    config: InformerConfig,
    store: RwLock<HashMap<ObjectKey, Expression>>,
    synced: watch::Sender<bool>,
}

fn record_event(kind: &'static str) {
    metrics::cache_events().add(1, &[KeyValue::new("kind", kind)]);
}

async fn next_resync(resync: &mut Option<Interval>) {
    match resync {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

impl Informer {
    pub fn new(
        api: Arc<dyn ResourceApi>,
        handler: Arc<dyn ResourceEventHandler>,
        config: InformerConfig,
    ) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            api,
            handler,
            config,
            store: RwLock::new(HashMap::new()),
            synced,
        }
    }

    /// True once the initial listing has been applied and its
    /// notifications delivered to the handler.
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Wait until [`has_synced`](Self::has_synced). Returns false if
    /// `cancel` fires first.
    pub async fn wait_for_sync(&self, cancel: &CancellationToken) -> bool {
        let mut synced = self.synced.subscribe();
        tokio::select! {
            _ = cancel.cancelled() => self.has_synced(),
            res = synced.wait_for(|s| *s) => res.is_ok(),
        }
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Expression> {
        self.store.read().get(key).cloned()
    }

    pub fn list(&self) -> Vec<Expression> {
        self.store.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// List, watch and resync until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(resync_secs = self.config.resync_interval.as_secs_f64(), "cache starting");

        let period = self.config.resync_interval;
        let mut resync = (!period.is_zero()).then(|| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let mut backoff = self.config.reconnect_base;

        while !cancel.is_cancelled() {
            let Err(err) = self.list_and_watch(&cancel, &mut resync, &mut backoff).await else {
                break;
            };
            warn!(
                error = %err,
                backoff_ms = backoff.as_millis() as u64,
                "list/watch failed, relisting"
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = backoff.saturating_mul(2).min(self.config.reconnect_max);
        }

        info!("cache stopped");
    }

    /// Returns `Ok` only on cancellation.
    async fn list_and_watch(
        &self,
        cancel: &CancellationToken,
        resync: &mut Option<Interval>,
        backoff: &mut Duration,
    ) -> Result<(), ApiError> {
        let listing = self.api.list().await?;
        *backoff = self.config.reconnect_base;
        let mut version = listing.resource_version;
        debug!(items = listing.items.len(), version, "listed");
        self.replace(listing.items, version);
        if !self.has_synced() {
            self.synced.send_replace(true);
            info!(items = self.len(), "cache synced");
        }

        let mut stream = self.api.watch(version).await?;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = next_resync(resync) => self.resync().await,
                next = stream.next() => match next {
                    Some(Ok(event)) => {
                        version = version.max(event.resource_version());
                        self.apply(event);
                    }
                    Some(Err(err)) => return Err(err),
                    None => {
                        return Err(ApiError::Unavailable(format!(
                            "watch closed at version {version}"
                        )));
                    }
                },
            }
        }
    }

    async fn resync(&self) {
        match self.api.list().await {
            Ok(listing) => {
                debug!(items = listing.items.len(), version = listing.resource_version, "resync");
                self.replace(listing.items, listing.resource_version);
            }
            // The watch is still running; the next tick tries again.
            Err(err) => warn!(error = %err, "resync list failed"),
        }
    }

    /// Reconcile the mirror against a full listing taken at `version`.
    fn replace(&self, items: Vec<Expression>, version: u64) {
        let mut added = Vec::new();
        let mut updated = Vec::new();
        let mut deleted = Vec::new();
        {
            let mut store = self.store.write();
            let listed: HashMap<ObjectKey, Expression> =
                items.into_iter().map(|item| (item.key(), item)).collect();

            store.retain(|key, cached| {
                // Entries newer than the listing arrived via watch; keep them.
                if listed.contains_key(key) || cached.resource_version() > version {
                    return true;
                }
                deleted.push(cached.clone());
                false
            });

            for (key, item) in listed {
                match store.get(&key) {
                    None => {
                        added.push(item.clone());
                        store.insert(key, item);
                    }
                    Some(cached) if cached.resource_version() > item.resource_version() => {}
                    // Deleted and recreated under the same key while unobserved.
                    Some(cached) if cached.metadata.uid != item.metadata.uid => {
                        deleted.push(cached.clone());
                        added.push(item.clone());
                        store.insert(key, item);
                    }
                    Some(cached) => {
                        updated.push((cached.clone(), item.clone()));
                        store.insert(key, item);
                    }
                }
            }
        }

        for item in &deleted {
            record_event("deleted");
            self.handler.on_delete(item);
        }
        for item in &added {
            record_event("added");
            self.handler.on_add(item);
        }
        for (old, new) in &updated {
            record_event("updated");
            self.handler.on_update(old, new);
        }
    }

    fn apply(&self, event: WatchEvent) {
        if event.object().metadata.name.is_empty() {
            record_event("malformed");
            warn!(version = event.resource_version(), "dropping notification without identity");
            return;
        }

        match event {
            WatchEvent::Added(item) | WatchEvent::Modified(item) => {
                let key = item.key();
                let previous = {
                    let mut store = self.store.write();
                    if store
                        .get(&key)
                        .is_some_and(|cached| cached.resource_version() >= item.resource_version())
                    {
                        debug!(%key, version = item.resource_version(), "stale notification");
                        return;
                    }
                    store.insert(key, item.clone())
                };
                match previous {
                    None => {
                        record_event("added");
                        self.handler.on_add(&item);
                    }
                    Some(old) if old.metadata.uid != item.metadata.uid => {
                        record_event("deleted");
                        self.handler.on_delete(&old);
                        record_event("added");
                        self.handler.on_add(&item);
                    }
                    Some(old) => {
                        record_event("updated");
                        self.handler.on_update(&old, &item);
                    }
                }
            }
            WatchEvent::Deleted(item) => {
                let key = item.key();
                let removed = {
                    let mut store = self.store.write();
                    if store
                        .get(&key)
                        .is_some_and(|cached| cached.resource_version() >= item.resource_version())
                    {
                        debug!(%key, version = item.resource_version(), "stale deletion");
                        return;
                    }
                    store.remove(&key)
                };
                if let Some(old) = removed {
                    record_event("deleted");
                    self.handler.on_delete(&old);
                }
            }
        }
    }
}
