//! Operation outcomes shared by both ends of the protocol.
//!
//! Providers fill these in when handling an operation; the client decodes
//! responses back into the same shapes. Connection details are opaque
//! secret material destined for a publish target outside the reconciler;
//! additional details are diagnostic metadata that ends up in events.

use std::collections::BTreeMap;

/// Opaque secret material produced by an operation, keyed by name.
pub type ConnectionDetails = BTreeMap<String, Vec<u8>>;

/// Diagnostic metadata produced by an operation, keyed by name.
pub type AdditionalDetails = BTreeMap<String, String>;

/// Result of observing an external resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observation {
    /// Whether the external resource exists.
    pub exists: bool,
    /// Whether the external resource matches the desired state.
    pub up_to_date: bool,
    /// Whether observation back-filled absent spec fields.
    pub late_initialized: bool,
    /// Secret material observed, if any.
    pub connection_details: ConnectionDetails,
}

/// Result of creating an external resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Creation {
    /// Secret material produced by creation.
    pub connection_details: ConnectionDetails,
    /// Diagnostic metadata about the creation.
    pub additional_details: AdditionalDetails,
}

/// Result of updating an external resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Update {
    /// Secret material produced by the update.
    pub connection_details: ConnectionDetails,
    /// Diagnostic metadata about the update.
    pub additional_details: AdditionalDetails,
}

/// Result of deleting an external resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Deletion {
    /// Diagnostic metadata about the deletion.
    pub additional_details: AdditionalDetails,
}
