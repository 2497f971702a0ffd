//! Reconcile span helpers.

use tracing::Span;

use crate::model::ObjectKey;

/// Start a span covering one reconcile of `key` by `worker`.
///
/// The `reconcile.state` field starts empty; see [`record_state_transition`].
pub fn start_reconcile_span(key: &ObjectKey, event_kind: &str, worker: usize) -> Span {
    tracing::info_span!(
        "reconcile",
        "reconcile.key" = %key,
        "reconcile.event" = event_kind,
        "reconcile.worker" = worker,
        "reconcile.state" = tracing::field::Empty,
    )
}

/// Record a per-key state transition on `span`.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("reconcile.state", to);
    span.in_scope(|| {
        tracing::debug!(from = from, to = to, "state_transition");
    });
}
