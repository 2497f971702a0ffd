//! Integration tests for telemetry initialization and span helpers.

use expression_resolver::error::Error;
use expression_resolver::model::ObjectKey;
use expression_resolver::telemetry::reconcile::{record_state_transition, start_reconcile_span};
use expression_resolver::telemetry::{TelemetryConfig, init_telemetry};
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Context, SubscriberExt as _};

#[test]
fn telemetry_initializes_without_endpoint() {
    // The global subscriber can only be set once per process; a second
    // init must fail cleanly instead of panicking.
    let config = || TelemetryConfig {
        endpoint: None,
        service_name: "expression-resolver-test".to_string(),
        log_level: "debug".to_string(),
    };

    let first = init_telemetry(config());
    match &first {
        Ok(guard) => guard.force_flush(),
        Err(Error::Other(msg)) => assert!(msg.contains("failed to init tracing subscriber")),
        Err(other) => panic!("unexpected error: {other}"),
    }

    let second = init_telemetry(config());
    assert!(matches!(
        second,
        Err(Error::Other(ref msg)) if msg.contains("failed to init tracing subscriber")
    ));
}

/// Collects every value recorded into `reconcile.state`.
#[derive(Clone, Default)]
struct StateRecorder(Arc<Mutex<Vec<String>>>);

struct StateVisitor<'a>(&'a mut Vec<String>);

impl Visit for StateVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "reconcile.state" {
            self.0.push(value.to_string());
        }
    }

    fn record_debug(&mut self, _field: &Field, _value: &dyn std::fmt::Debug) {}
}

impl<S: tracing::Subscriber> Layer<S> for StateRecorder {
    fn on_record(
        &self,
        _id: &tracing::span::Id,
        values: &tracing::span::Record<'_>,
        _ctx: Context<'_, S>,
    ) {
        let mut states = self.0.lock().unwrap();
        values.record(&mut StateVisitor(&mut states));
    }
}

#[test]
fn reconcile_span_records_state_transitions() {
    let recorder = StateRecorder::default();
    let subscriber = tracing_subscriber::registry().with(recorder.clone());

    tracing::subscriber::with_default(subscriber, || {
        let key = ObjectKey::new("default", "sum");
        let span = start_reconcile_span(&key, "added", 0);
        let metadata = span.metadata().unwrap();
        assert_eq!(metadata.name(), "reconcile");
        assert!(metadata.fields().field("reconcile.key").is_some());
        assert!(metadata.fields().field("reconcile.worker").is_some());

        record_state_transition(&span, "queued", "processing");
        record_state_transition(&span, "processing", "idle");
    });

    assert_eq!(*recorder.0.lock().unwrap(), vec!["processing", "idle"]);
}
