//! Change events emitted by the cache and consumed by workers.
//!
//! Events own their copies of the resource; nothing in them aliases the
//! cache mirror.

use crate::model::{Expression, ObjectKey};
use crate::queue::QueueItem;

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Added(Expression),
    Updated { old: Expression, new: Expression },
}

impl ChangeEvent {
    /// The newest known state of the item.
    pub fn latest(&self) -> &Expression {
        match self {
            ChangeEvent::Added(item) => item,
            ChangeEvent::Updated { new, .. } => new,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::Added(_) => "added",
            ChangeEvent::Updated { .. } => "updated",
        }
    }
}

impl QueueItem for ChangeEvent {
    type Key = ObjectKey;

    fn key(&self) -> ObjectKey {
        self.latest().key()
    }
}
