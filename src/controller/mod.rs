//! Controller: wires the cache, the work queue and a pool of workers.

pub mod worker;

use futures::future::join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::api::ResourceApi;
use crate::cache::{ChangeDetector, ChangePredicate, Informer, InformerConfig};
use crate::error::{Error, ReconcileError, Result};
use crate::event::ChangeEvent;
use crate::model::{Expression, ObjectKey};
use crate::queue::WorkQueue;
use crate::reconcile::Reconciler;

/// Consecutive failures tolerated before an item is dropped.
pub const MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub max_retries: u32,
    pub informer: InformerConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            informer: InformerConfig::default(),
        }
    }
}

/// Where reconciles that exhausted their retries are reported.
pub trait ErrorSink: Send + Sync {
    fn handle_error(&self, key: &ObjectKey, err: &ReconcileError);
}

/// Reports permanent failures to the log.
pub struct LogErrorSink;

impl ErrorSink for LogErrorSink {
    fn handle_error(&self, key: &ObjectKey, err: &ReconcileError) {
        error!(%key, error = %err, kind = err.kind(), "reconcile permanently failed");
    }
}

/// The reconciliation controller. Cheap to clone; clones share all state.
pub struct Controller {
    queue: WorkQueue<ChangeEvent>,
    informer: Arc<Informer>,
    reconciler: Arc<dyn Reconciler>,
    errors: Arc<dyn ErrorSink>,
    config: ControllerConfig,
}

impl Clone for Controller {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            informer: Arc::clone(&self.informer),
            reconciler: Arc::clone(&self.reconciler),
            errors: Arc::clone(&self.errors),
            config: self.config.clone(),
        }
    }
}

impl Controller {
    /// A controller with the default rate-limited queue and a logging error sink.
    pub fn new(
        api: Arc<dyn ResourceApi>,
        reconciler: Arc<dyn Reconciler>,
        config: ControllerConfig,
    ) -> Self {
        Self::with_parts(
            api,
            reconciler,
            WorkQueue::with_default_rate_limiter("expressions"),
            Arc::new(LogErrorSink),
            config,
        )
    }

    pub fn with_parts(
        api: Arc<dyn ResourceApi>,
        reconciler: Arc<dyn Reconciler>,
        queue: WorkQueue<ChangeEvent>,
        errors: Arc<dyn ErrorSink>,
        config: ControllerConfig,
    ) -> Self {
        let predicate: ChangePredicate = {
            let reconciler = Arc::clone(&reconciler);
            Arc::new(move |old: &Expression, new: &Expression| reconciler.has_changed(old, new))
        };
        let detector = ChangeDetector::new(queue.clone(), predicate);
        let informer = Informer::new(api, Arc::new(detector), config.informer.clone());
        Self {
            queue,
            informer: Arc::new(informer),
            reconciler,
            errors,
            config,
        }
    }

    pub fn queue(&self) -> &WorkQueue<ChangeEvent> {
        &self.queue
    }

    pub fn informer(&self) -> &Informer {
        &self.informer
    }

    /// Run until `cancel` fires.
    ///
    /// Starts the cache, waits for its initial sync, then drains the queue
    /// with `workers` concurrent workers. On cancellation the queue is shut
    /// down and every in-flight reconcile is allowed to finish before this
    /// returns. A controller can only be run once.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for zero workers; [`Error::CacheSync`] when
    /// cancelled before the cache synced.
    pub async fn run(&self, cancel: CancellationToken, workers: usize) -> Result<()> {
        if workers == 0 {
            return Err(Error::Config("at least one worker is required".to_string()));
        }

        info!("starting expression controller");
        let cache_cancel = cancel.child_token();
        let cache_task = {
            let informer = Arc::clone(&self.informer);
            let token = cache_cancel.clone();
            tokio::spawn(async move { informer.run(token).await })
        };

        info!("waiting for cache to sync");
        if !self.informer.wait_for_sync(&cancel).await {
            self.queue.shut_down();
            cache_cancel.cancel();
            if let Err(e) = cache_task.await {
                error!(error = %e, "cache task failed");
            }
            error!("failed to wait for cache to sync");
            return Err(Error::CacheSync);
        }

        info!(workers, "starting workers");
        let handles: Vec<_> = (0..workers)
            .map(|id| {
                let ctrl = self.clone();
                tokio::spawn(async move { ctrl.run_worker(id).await })
            })
            .collect();
        info!("controller ready");

        cancel.cancelled().await;
        info!("stopping expression controller");

        self.queue.shut_down();
        for res in join_all(handles).await {
            if let Err(e) = res {
                error!(error = %e, "worker task failed");
            }
        }
        cache_cancel.cancel();
        if let Err(e) = cache_task.await {
            error!(error = %e, "cache task failed");
        }

        info!("controller stopped");
        Ok(())
    }
}
