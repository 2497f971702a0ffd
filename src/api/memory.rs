//! In-memory resource store.
//!
//! Keeps every resource in a map, stamps a store-wide monotonically
//! increasing version on each mutation, retains a bounded history of change
//! notifications, and fans new notifications out to watchers.

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::debug;
use uuid::Uuid;

use super::{ItemList, ResourceApi, WatchEvent, WatchStream};
use crate::error::ApiError;
use crate::model::{
    Expression, ExpressionSpec, ExpressionStatus, NewExpression, ObjectKey, ObjectMeta,
};

const DEFAULT_HISTORY: usize = 1024;

struct StoreState {
    items: BTreeMap<ObjectKey, Expression>,
    version: u64,
    history: VecDeque<WatchEvent>,
}

pub struct MemoryStore {
    state: Mutex<StoreState>,
    events: broadcast::Sender<WatchEvent>,
    history_limit: usize,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY)
    }

    /// A store retaining at most `limit` notifications for watch resumption.
    pub fn with_history_limit(limit: usize) -> Self {
        let limit = limit.max(1);
        let (events, _) = broadcast::channel(limit);
        Self {
            state: Mutex::new(StoreState {
                items: BTreeMap::new(),
                version: 0,
                history: VecDeque::new(),
            }),
            events,
            history_limit: limit,
            available: AtomicBool::new(true),
        }
    }

    /// Make every [`ResourceApi`] call fail with `Unavailable` (or recover).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), ApiError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ApiError::Unavailable("memory store is offline".to_string()))
        }
    }

    fn record(&self, state: &mut StoreState, event: WatchEvent) {
        state.history.push_back(event.clone());
        while state.history.len() > self.history_limit {
            state.history.pop_front();
        }
        // No receivers is fine; history still has it.
        let _ = self.events.send(event);
    }

    pub fn create(&self, new: NewExpression) -> Result<Expression, ApiError> {
        let key = new.key();
        let mut state = self.state.lock();
        if state.items.contains_key(&key) {
            return Err(ApiError::AlreadyExists(key));
        }
        state.version += 1;
        let item = Expression {
            metadata: ObjectMeta {
                namespace: new.namespace.clone(),
                name: new.name.clone(),
                uid: Uuid::new_v4(),
                resource_version: state.version,
                generation: 1,
                creation_timestamp: Utc::now(),
            },
            spec: new.spec(),
            status: ExpressionStatus::default(),
        };
        state.items.insert(key.clone(), item.clone());
        self.record(&mut state, WatchEvent::Added(item.clone()));
        debug!(%key, version = state.version, "created");
        Ok(item)
    }

    /// Replace the spec. A no-op when the spec is unchanged.
    pub fn update_spec(
        &self,
        key: &ObjectKey,
        spec: ExpressionSpec,
    ) -> Result<Expression, ApiError> {
        let mut state = self.state.lock();
        let version = state.version + 1;
        let item = state
            .items
            .get_mut(key)
            .ok_or_else(|| ApiError::NotFound(key.clone()))?;
        if item.spec == spec {
            return Ok(item.clone());
        }
        item.spec = spec;
        item.metadata.generation += 1;
        item.metadata.resource_version = version;
        let item = item.clone();
        state.version = version;
        self.record(&mut state, WatchEvent::Modified(item.clone()));
        debug!(%key, version, "spec updated");
        Ok(item)
    }

    pub fn delete(&self, key: &ObjectKey) -> Result<Expression, ApiError> {
        let mut state = self.state.lock();
        let mut item = state
            .items
            .remove(key)
            .ok_or_else(|| ApiError::NotFound(key.clone()))?;
        state.version += 1;
        item.metadata.resource_version = state.version;
        self.record(&mut state, WatchEvent::Deleted(item.clone()));
        debug!(%key, version = state.version, "deleted");
        Ok(item)
    }

    /// Current state of one resource, bypassing availability checks.
    pub fn lookup(&self, key: &ObjectKey) -> Option<Expression> {
        self.state.lock().items.get(key).cloned()
    }

    /// All resources, ordered by key.
    pub fn snapshot(&self) -> Vec<Expression> {
        self.state.lock().items.values().cloned().collect()
    }
}

#[async_trait]
impl ResourceApi for MemoryStore {
    async fn list(&self) -> Result<ItemList, ApiError> {
        self.check_available()?;
        let state = self.state.lock();
        Ok(ItemList {
            items: state.items.values().cloned().collect(),
            resource_version: state.version,
        })
    }

    async fn watch(&self, resource_version: u64) -> Result<WatchStream, ApiError> {
        self.check_available()?;
        let state = self.state.lock();

        if resource_version < state.version {
            // Versions are contiguous, so the next event must still be retained.
            let retained = state
                .history
                .front()
                .is_some_and(|first| first.resource_version() <= resource_version + 1);
            if !retained {
                return Err(ApiError::Gone(resource_version));
            }
        }

        let backlog: Vec<_> = state
            .history
            .iter()
            .filter(|event| event.resource_version() > resource_version)
            .cloned()
            .map(Ok)
            .collect();
        // Subscribe while holding the lock so nothing falls between backlog and live.
        let live = BroadcastStream::new(self.events.subscribe()).map(|res| {
            res.map_err(|err: BroadcastStreamRecvError| {
                ApiError::Unavailable(format!("watch interrupted: {err}"))
            })
        });
        drop(state);

        Ok(futures::stream::iter(backlog).chain(live).boxed())
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<Expression>, ApiError> {
        self.check_available()?;
        Ok(self.lookup(key))
    }

    async fn update_status(&self, item: &Expression) -> Result<Expression, ApiError> {
        self.check_available()?;
        let key = item.key();
        let mut state = self.state.lock();
        let version = state.version + 1;
        let current = state
            .items
            .get_mut(&key)
            .ok_or_else(|| ApiError::NotFound(key.clone()))?;
        if current.metadata.resource_version != item.metadata.resource_version {
            return Err(ApiError::Conflict {
                key,
                expected: item.metadata.resource_version,
                actual: current.metadata.resource_version,
            });
        }
        current.status = item.status.clone();
        current.metadata.resource_version = version;
        let updated = current.clone();
        state.version = version;
        self.record(&mut state, WatchEvent::Modified(updated.clone()));
        debug!(%key, version, "status updated");
        Ok(updated)
    }
}
