//! Resource API: the list/watch/get/update-status surface the controller
//! depends on, plus an in-memory implementation.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::ApiError;
use crate::model::{Expression, ObjectKey};

/// A full listing and the store version it was taken at.
#[derive(Debug, Clone, Default)]
pub struct ItemList {
    pub items: Vec<Expression>,
    pub resource_version: u64,
}

/// A single change notification from a watch.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(Expression),
    Modified(Expression),
    Deleted(Expression),
}

impl WatchEvent {
    pub fn object(&self) -> &Expression {
        match self {
            WatchEvent::Added(item) | WatchEvent::Modified(item) | WatchEvent::Deleted(item) => {
                item
            }
        }
    }

    pub fn resource_version(&self) -> u64 {
        self.object().resource_version()
    }
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, ApiError>>;

/// Operations the controller needs from the resource backend.
#[async_trait]
pub trait ResourceApi: Send + Sync {
    /// List every resource.
    async fn list(&self) -> Result<ItemList, ApiError>;

    /// Stream changes made after `resource_version`.
    ///
    /// Returns [`ApiError::Gone`] when that version is no longer retained;
    /// callers relist in that case.
    async fn watch(&self, resource_version: u64) -> Result<WatchStream, ApiError>;

    /// Read the current state of one resource.
    async fn get(&self, key: &ObjectKey) -> Result<Option<Expression>, ApiError>;

    /// Persist `item.status`, conditional on `item.metadata.resource_version`.
    async fn update_status(&self, item: &Expression) -> Result<Expression, ApiError>;
}
