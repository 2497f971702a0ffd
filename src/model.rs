//! Core data model.
//!
//! An `Expression` is the watched resource: a formula (`spec.body`) and a JSON
//! data document (`spec.data`) declared by the user, plus a `status.result`
//! written back by the controller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_NAMESPACE: &str = "default";

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Stable identity of a resource: namespace + name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// ---------------------------------------------------------------------------
// Expression
// ---------------------------------------------------------------------------

/// Bookkeeping fields owned by the resource store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub namespace: String,
    pub name: String,
    /// Assigned on create, never reused.
    pub uid: Uuid,
    /// Bumped on every persisted mutation, spec or status.
    pub resource_version: u64,
    /// Bumped only when the spec changes.
    pub generation: u64,
    pub creation_timestamp: DateTime<Utc>,
}

/// User-declared intent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpressionSpec {
    /// JSON object whose fields are the expression's variables.
    pub data: String,
    /// The formula, e.g. `x + y`.
    pub body: String,
}

/// Derived output, written only by the controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpressionStatus {
    pub result: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expression {
    pub metadata: ObjectMeta,
    pub spec: ExpressionSpec,
    #[serde(default)]
    pub status: ExpressionStatus,
}

impl Expression {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    pub fn resource_version(&self) -> u64 {
        self.metadata.resource_version
    }

    /// True when `other` carries different user intent than `self`.
    ///
    /// Status and bookkeeping updates (including the controller's own
    /// write-back) are not changes.
    pub fn has_changed(&self, other: &Expression) -> bool {
        self.spec != other.spec
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for new expressions, and the shape of a manifest entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewExpression {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub data: String,
    pub body: String,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

impl NewExpression {
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            namespace: default_namespace(),
            name: name.into(),
            data: String::new(),
            body: body.into(),
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn data(mut self, data: impl Into<String>) -> Self {
        self.data = data.into();
        self
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    pub fn spec(&self) -> ExpressionSpec {
        ExpressionSpec {
            data: self.data.clone(),
            body: self.body.clone(),
        }
    }
}

/// A TOML manifest file: any number of `[[expression]]` tables.
#[derive(Debug, Default, Deserialize)]
pub struct Manifest {
    #[serde(default, rename = "expression")]
    pub expressions: Vec<NewExpression>,
}
