//! Untyped declarative objects.
//!
//! A [`Resource`] is a schema-unknown intent/status document: a property
//! tree that always carries `apiVersion`, `kind`, and a `metadata` mapping
//! with at least a `name`. The runtime never interprets provider-specific
//! fields; it only reads and writes the well-known metadata and status
//! paths exposed here. Everything else flows through opaque.
//!
//! The tree is held as a [`serde_json::Value`] object map, which is the
//! tagged-variant recursive value the protocol payload (`Struct`) maps onto
//! one-to-one.

use std::fmt;

use serde_json::{json, Map, Value};

use crate::kind::{Kind, KindError};

/// Errors produced when constructing a resource from a raw value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    /// The root of a declarative object must be a mapping.
    #[error("declarative object root must be a mapping, got {got}")]
    NotAnObject {
        /// JSON type name of the rejected root.
        got: &'static str,
    },
}

/// Namespace/name pair addressing one object within a kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace, empty for cluster-scoped objects.
    pub namespace: String,
    /// Object name.
    pub name: String,
}

impl ObjectKey {
    /// Builds a key from a namespace (possibly empty) and a name.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Status condition written by the reconciler.
///
/// Conditions live in the `status.conditions` list, keyed by `type`. The
/// reconciler maintains `Synced` (last reconcile outcome) and `Ready`
/// (external resource availability).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    /// Condition type, e.g. `Synced` or `Ready`.
    pub type_: String,
    /// `"True"` or `"False"`.
    pub status: bool,
    /// Machine-readable reason.
    pub reason: String,
}

impl Condition {
    /// A true condition with the given type and reason.
    pub fn ok(type_: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            type_: type_.into(),
            status: true,
            reason: reason.into(),
        }
    }

    /// A false condition with the given type and reason.
    pub fn not_ok(type_: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            type_: type_.into(),
            status: false,
            reason: reason.into(),
        }
    }
}

/// An untyped declarative object.
///
/// Cheap to clone relative to reconcile latency; mutated in place by the
/// codec when responses carry an updated copy back from the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    value: Value,
}

impl Resource {
    /// Builds a minimal object of the given kind and name.
    pub fn new(kind: &Kind, name: impl Into<String>) -> Self {
        Self {
            value: json!({
                "apiVersion": kind.api_version(),
                "kind": kind.kind,
                "metadata": { "name": name.into() },
            }),
        }
    }

    /// Wraps an existing property tree.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::NotAnObject`] when the root is not a mapping.
    pub fn from_value(value: Value) -> Result<Self, ResourceError> {
        if !value.is_object() {
            return Err(ResourceError::NotAnObject {
                got: json_type_name(&value),
            });
        }
        Ok(Self { value })
    }

    /// The underlying property tree.
    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Consumes the resource, returning the property tree.
    #[must_use]
    pub fn into_value(self) -> Value {
        self.value
    }

    /// Atomically replaces the whole property tree.
    ///
    /// Used by the codec when decoding a payload into an untyped holder.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::NotAnObject`] when the replacement root is
    /// not a mapping; the existing tree is left untouched in that case.
    pub fn replace_value(&mut self, value: Value) -> Result<(), ResourceError> {
        if !value.is_object() {
            return Err(ResourceError::NotAnObject {
                got: json_type_name(&value),
            });
        }
        self.value = value;
        Ok(())
    }

    /// The `apiVersion` field, empty when absent.
    #[must_use]
    pub fn api_version(&self) -> &str {
        self.str_at(&["apiVersion"]).unwrap_or("")
    }

    /// The kind triple of this object.
    ///
    /// # Errors
    ///
    /// Returns [`KindError`] when `apiVersion`/`kind` are absent or
    /// malformed.
    pub fn kind(&self) -> Result<Kind, KindError> {
        Kind::from_api_version(self.api_version(), self.str_at(&["kind"]).unwrap_or(""))
    }

    /// `metadata.name`, empty when absent.
    #[must_use]
    pub fn name(&self) -> &str {
        self.str_at(&["metadata", "name"]).unwrap_or("")
    }

    /// `metadata.namespace`, empty when absent.
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.str_at(&["metadata", "namespace"]).unwrap_or("")
    }

    /// Sets `metadata.namespace`.
    pub fn set_namespace(&mut self, namespace: impl Into<String>) {
        self.metadata_mut()
            .insert("namespace".to_string(), Value::String(namespace.into()));
    }

    /// Namespace/name key addressing this object within its kind.
    #[must_use]
    pub fn object_key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace(), self.name())
    }

    /// `metadata.deletionTimestamp`, `None` while the object is live.
    #[must_use]
    pub fn deletion_timestamp(&self) -> Option<&str> {
        self.str_at(&["metadata", "deletionTimestamp"])
    }

    /// Marks the object as pending deletion.
    ///
    /// Stores stamp objects on delete; exposed here so in-process stores and
    /// tests can drive the deletion flow.
    pub fn set_deletion_timestamp(&mut self, timestamp: impl Into<String>) {
        self.metadata_mut().insert(
            "deletionTimestamp".to_string(),
            Value::String(timestamp.into()),
        );
    }

    /// Current finalizers, empty when none are set.
    #[must_use]
    pub fn finalizers(&self) -> Vec<String> {
        match self.value.pointer("/metadata/finalizers") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Adds a finalizer, returning `true` when it was not already present.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.finalizers().iter().any(|f| f == finalizer) {
            return false;
        }
        let metadata = self.metadata_mut();
        let entry = metadata
            .entry("finalizers".to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = entry {
            items.push(Value::String(finalizer.to_string()));
            true
        } else {
            *entry = Value::Array(vec![Value::String(finalizer.to_string())]);
            true
        }
    }

    /// Removes a finalizer, returning `true` when it was present.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let Some(Value::Array(items)) = self.value.pointer_mut("/metadata/finalizers") else {
            return false;
        };
        let before = items.len();
        items.retain(|v| v.as_str() != Some(finalizer));
        items.len() != before
    }

    /// Upserts a status condition keyed by its type.
    pub fn set_condition(&mut self, condition: Condition) {
        let entry = json!({
            "type": condition.type_,
            "status": if condition.status { "True" } else { "False" },
            "reason": condition.reason,
        });

        let root = self
            .value
            .as_object_mut()
            .expect("resource root is always a mapping");
        let status = root
            .entry("status".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !status.is_object() {
            *status = Value::Object(Map::new());
        }
        let conditions = status
            .as_object_mut()
            .expect("status coerced to a mapping above")
            .entry("conditions".to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if !conditions.is_array() {
            *conditions = Value::Array(Vec::new());
        }

        let items = conditions
            .as_array_mut()
            .expect("conditions coerced to a list above");
        if let Some(existing) = items
            .iter_mut()
            .find(|c| c.pointer("/type").and_then(Value::as_str) == entry.pointer("/type").and_then(Value::as_str))
        {
            *existing = entry;
        } else {
            items.push(entry);
        }
    }

    /// Looks up a condition by type.
    #[must_use]
    pub fn condition(&self, type_: &str) -> Option<Condition> {
        let items = self.value.pointer("/status/conditions")?.as_array()?;
        let found = items
            .iter()
            .find(|c| c.pointer("/type").and_then(Value::as_str) == Some(type_))?;
        Some(Condition {
            type_: type_.to_string(),
            status: found.pointer("/status").and_then(Value::as_str) == Some("True"),
            reason: found
                .pointer("/reason")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
        })
    }

    fn str_at(&self, path: &[&str]) -> Option<&str> {
        let mut current = &self.value;
        for segment in path {
            current = current.get(segment)?;
        }
        current.as_str()
    }

    fn metadata_mut(&mut self) -> &mut Map<String, Value> {
        let root = self
            .value
            .as_object_mut()
            .expect("resource root is always a mapping");
        let metadata = root
            .entry("metadata".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !metadata.is_object() {
            *metadata = Value::Object(Map::new());
        }
        metadata
            .as_object_mut()
            .expect("metadata coerced to a mapping above")
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn widget() -> Resource {
        Resource::from_value(json!({
            "apiVersion": "example.org/v1",
            "kind": "Widget",
            "metadata": { "name": "w1", "namespace": "default" },
            "spec": { "size": 3 },
        }))
        .unwrap()
    }

    #[test]
    fn reads_identity_fields() {
        let r = widget();
        assert_eq!(r.api_version(), "example.org/v1");
        assert_eq!(r.kind().unwrap(), Kind::new("example.org", "v1", "Widget"));
        assert_eq!(r.name(), "w1");
        assert_eq!(r.namespace(), "default");
        assert_eq!(r.object_key().to_string(), "default/w1");
    }

    #[test]
    fn rejects_non_object_roots() {
        let err = Resource::from_value(json!([1, 2])).unwrap_err();
        assert_eq!(err, ResourceError::NotAnObject { got: "list" });
    }

    #[test]
    fn finalizer_round_trip() {
        let mut r = widget();
        assert!(r.finalizers().is_empty());
        assert!(r.add_finalizer("tether.io/external-resource"));
        assert!(!r.add_finalizer("tether.io/external-resource"));
        assert_eq!(r.finalizers(), vec!["tether.io/external-resource"]);
        assert!(r.remove_finalizer("tether.io/external-resource"));
        assert!(!r.remove_finalizer("tether.io/external-resource"));
        assert!(r.finalizers().is_empty());
    }

    #[test]
    fn deletion_timestamp_presence() {
        let mut r = widget();
        assert!(r.deletion_timestamp().is_none());
        r.set_deletion_timestamp("2025-01-01T00:00:00Z");
        assert_eq!(r.deletion_timestamp(), Some("2025-01-01T00:00:00Z"));
    }

    #[test]
    fn conditions_upsert_by_type() {
        let mut r = widget();
        r.set_condition(Condition::not_ok("Ready", "Creating"));
        r.set_condition(Condition::ok("Synced", "ReconcileSuccess"));
        r.set_condition(Condition::ok("Ready", "Available"));

        let ready = r.condition("Ready").unwrap();
        assert!(ready.status);
        assert_eq!(ready.reason, "Available");

        let conditions = r.value().pointer("/status/conditions").unwrap();
        assert_eq!(conditions.as_array().unwrap().len(), 2);
    }

    #[test]
    fn replace_value_is_atomic() {
        let mut r = widget();
        let err = r.replace_value(json!("nope")).unwrap_err();
        assert_eq!(err, ResourceError::NotAnObject { got: "string" });
        // Original tree untouched after the failed replace.
        assert_eq!(r.name(), "w1");
    }

    #[test]
    fn cluster_scoped_key_renders_bare_name() {
        let r = Resource::new(&Kind::new("example.org", "v1", "Widget"), "w2");
        assert_eq!(r.object_key().to_string(), "w2");
    }
}
