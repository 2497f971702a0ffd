//! Turns cache notifications into queued change events.

use std::sync::Arc;
use tracing::debug;

use super::ResourceEventHandler;
use crate::event::ChangeEvent;
use crate::model::Expression;
use crate::queue::WorkQueue;

/// Decides whether an update carries a meaningful change.
pub type ChangePredicate = Arc<dyn Fn(&Expression, &Expression) -> bool + Send + Sync>;

/// Enqueues an [`ChangeEvent::Added`] for every addition and an
/// [`ChangeEvent::Updated`] for updates the predicate accepts. Deletions are
/// not enqueued.
pub struct ChangeDetector {
    queue: WorkQueue<ChangeEvent>,
    has_changed: ChangePredicate,
}

impl ChangeDetector {
    pub fn new(queue: WorkQueue<ChangeEvent>, has_changed: ChangePredicate) -> Self {
        Self { queue, has_changed }
    }
}

impl ResourceEventHandler for ChangeDetector {
    fn on_add(&self, item: &Expression) {
        self.queue.add(ChangeEvent::Added(item.clone()));
    }

    fn on_update(&self, old: &Expression, new: &Expression) {
        if !(self.has_changed)(old, new) {
            debug!(key = %new.key(), "unchanged, skipping");
            return;
        }
        self.queue.add(ChangeEvent::Updated {
            old: old.clone(),
            new: new.clone(),
        });
    }

    fn on_delete(&self, item: &Expression) {
        debug!(key = %item.key(), "deleted");
    }
}
