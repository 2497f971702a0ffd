//! The per-item business logic plugged into the controller.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use crate::api::ResourceApi;
use crate::error::ReconcileError;
use crate::event::ChangeEvent;
use crate::expr;
use crate::model::Expression;

/// Computes and persists the derived state for one change event.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Converge the event's item. Must be idempotent.
    async fn reconcile(&self, event: &ChangeEvent) -> Result<(), ReconcileError>;

    /// Whether an update is worth reconciling. Defaults to any structural
    /// difference.
    fn has_changed(&self, old: &Expression, new: &Expression) -> bool {
        old != new
    }
}

/// Evaluate `spec.body` against `spec.data` and render the result.
///
/// Empty data is treated as an empty object.
pub fn resolve(item: &Expression) -> Result<String, ReconcileError> {
    let key = item.key();
    let data = if item.spec.data.trim().is_empty() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        serde_json::from_str(&item.spec.data).map_err(|source| ReconcileError::InvalidData {
            key: key.clone(),
            source,
        })?
    };
    let value = expr::evaluate(&item.spec.body, &data)
        .map_err(|source| ReconcileError::Evaluation { key, source })?;
    Ok(value.to_string())
}

/// Writes `resolve(item)` into `status.result`.
pub struct ExpressionReconciler {
    api: Arc<dyn ResourceApi>,
}

impl ExpressionReconciler {
    pub fn new(api: Arc<dyn ResourceApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Reconciler for ExpressionReconciler {
    async fn reconcile(&self, event: &ChangeEvent) -> Result<(), ReconcileError> {
        let key = match event {
            ChangeEvent::Added(item) => {
                debug!(key = %item.key(), "processing addition");
                item.key()
            }
            ChangeEvent::Updated { old, new } => {
                debug!(
                    key = %new.key(),
                    from_generation = old.metadata.generation,
                    to_generation = new.metadata.generation,
                    "processing update"
                );
                new.key()
            }
        };

        // Work from the stored state so the write-back carries a current version.
        let Some(mut current) = self.api.get(&key).await? else {
            debug!(%key, "resource gone, nothing to do");
            return Ok(());
        };

        let result = resolve(&current)?;
        if current.status.result.as_deref() == Some(result.as_str()) {
            debug!(%key, %result, "status already up to date");
            return Ok(());
        }

        current.status.result = Some(result.clone());
        let updated = self.api.update_status(&current).await?;
        info!(
            %key,
            %result,
            version = updated.metadata.resource_version,
            "status updated"
        );
        Ok(())
    }

    fn has_changed(&self, old: &Expression, new: &Expression) -> bool {
        old.has_changed(new)
    }
}
