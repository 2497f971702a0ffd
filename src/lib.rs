//! # expression-resolver
//!
//! Reconciliation controller for `Expression` resources.
//!
//! Watches the collection through a [`api::ResourceApi`], mirrors it in a
//! local cache, queues changed items on a deduplicating rate-limited work
//! queue, and drains the queue with a fixed pool of workers that evaluate
//! each expression and write the result back to its status.

pub mod api;
pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod expr;
pub mod model;
pub mod queue;
pub mod reconcile;
pub mod telemetry;
