//! Worker loop: dequeue, reconcile, then forget, retry or drop.

use futures::FutureExt;
use opentelemetry::KeyValue;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Instant;
use tracing::{Instrument, Span, debug, error, warn};

use super::Controller;
use crate::error::ReconcileError;
use crate::event::ChangeEvent;
use crate::model::ObjectKey;
use crate::queue::QueueItem;
use crate::telemetry::metrics;
use crate::telemetry::reconcile::{record_state_transition, start_reconcile_span};

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl Controller {
    pub(super) async fn run_worker(&self, id: usize) {
        debug!(worker = id, "worker started");
        while self.process_next_item(id).await {}
        debug!(worker = id, "worker stopped");
    }

    /// Handle one queued item. Returns false once the queue is shut down.
    pub(super) async fn process_next_item(&self, worker: usize) -> bool {
        let Some(event) = self.queue.get().await else {
            return false;
        };
        let key = event.key();
        let span = start_reconcile_span(&key, event.kind(), worker);
        record_state_transition(&span, "queued", "processing");

        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.reconciler.reconcile(&event))
            .catch_unwind()
            .instrument(span.clone())
            .await
            .unwrap_or_else(|panic| Err(ReconcileError::Panicked(panic_message(&*panic))));
        metrics::reconcile_duration_ms().record(started.elapsed().as_secs_f64() * 1000.0, &[]);

        self.handle_outcome(&key, event, outcome, &span);
        self.queue.done(&key);
        true
    }

    fn handle_outcome(
        &self,
        key: &ObjectKey,
        event: ChangeEvent,
        outcome: Result<(), ReconcileError>,
        span: &Span,
    ) {
        let err = match outcome {
            Ok(()) => {
                self.queue.forget(key);
                record_state_transition(span, "processing", "idle");
                metrics::reconciles().add(1, &[KeyValue::new("result", "ok")]);
                return;
            }
            Err(err) => err,
        };

        let requeues = self.queue.num_requeues(key);
        if requeues < self.config.max_retries {
            span.in_scope(|| {
                warn!(
                    %key,
                    error = %err,
                    kind = err.kind(),
                    transient = err.is_transient(),
                    attempt = requeues + 1,
                    "error processing event, retrying"
                );
            });
            record_state_transition(span, "processing", "backoff");
            metrics::reconciles().add(
                1,
                &[
                    KeyValue::new("result", "retry"),
                    KeyValue::new("error", err.kind()),
                ],
            );
            self.queue.add_rate_limited(event);
        } else {
            span.in_scope(|| {
                error!(
                    %key,
                    error = %err,
                    kind = err.kind(),
                    transient = err.is_transient(),
                    retries = requeues,
                    "error processing event, max retries reached"
                );
            });
            record_state_transition(span, "processing", "idle");
            metrics::reconciles().add(
                1,
                &[
                    KeyValue::new("result", "dropped"),
                    KeyValue::new("error", err.kind()),
                ],
            );
            self.queue.forget(key);
            self.errors.handle_error(key, &err);
        }
    }
}
