//! Resource kind identifiers.
//!
//! A [`Kind`] is the `(group, version, kind)` triple that names a resource
//! schema. It is the routing key for everything in the runtime: handler
//! registration on the provider side, session pinning on both sides, and
//! controller instantiation in the engine. Two kinds with the same triple
//! are the same kind.
//!
//! On the wire and in configuration the triple is split into
//! `apiVersion = "group/version"` plus `kind`, matching the declarative
//! object layout.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Errors produced when parsing a kind from its serialized form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KindError {
    /// The `apiVersion` string had more than one `/` separator.
    #[error("malformed apiVersion {api_version:?}: expected \"group/version\" or \"version\"")]
    MalformedApiVersion {
        /// The offending input.
        api_version: String,
    },

    /// One of the required components was empty.
    #[error("kind triple has an empty {component}")]
    EmptyComponent {
        /// Which component was empty (`version` or `kind`).
        component: &'static str,
    },
}

/// A `(group, version, kind)` triple identifying a resource schema.
///
/// The group may be empty for core kinds (`apiVersion: "v1"`); version and
/// kind never are. `Ord` is derived so kind sets iterate deterministically,
/// which keeps discovery responses stable across calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Kind {
    /// API group, empty for the core group.
    pub group: String,
    /// API version within the group.
    pub version: String,
    /// Kind name.
    pub kind: String,
}

impl Kind {
    /// Builds a kind from its three components.
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// Parses a kind from its serialized `apiVersion` + `kind` form.
    ///
    /// # Errors
    ///
    /// Returns [`KindError`] when `api_version` is not `"group/version"` or
    /// `"version"`, or when version or kind is empty.
    pub fn from_api_version(api_version: &str, kind: &str) -> Result<Self, KindError> {
        let (group, version) = match api_version.split_once('/') {
            Some((group, version)) => {
                if version.contains('/') {
                    return Err(KindError::MalformedApiVersion {
                        api_version: api_version.to_string(),
                    });
                }
                (group, version)
            }
            None => ("", api_version),
        };

        if version.is_empty() {
            return Err(KindError::EmptyComponent {
                component: "version",
            });
        }
        if kind.is_empty() {
            return Err(KindError::EmptyComponent { component: "kind" });
        }

        Ok(Self::new(group, version, kind))
    }

    /// Renders the `apiVersion` half of the serialized form.
    #[must_use]
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Returns `true` when every component is empty.
    ///
    /// An empty triple is never routable; registries reject it.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.group.is_empty() && self.version.is_empty() && self.kind.is_empty()
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Kind={}", self.api_version(), self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_grouped_api_version() {
        let kind = Kind::from_api_version("example.org/v1", "Widget").unwrap();
        assert_eq!(kind.group, "example.org");
        assert_eq!(kind.version, "v1");
        assert_eq!(kind.kind, "Widget");
        assert_eq!(kind.api_version(), "example.org/v1");
    }

    #[test]
    fn parses_core_api_version() {
        let kind = Kind::from_api_version("v1", "ConfigMap").unwrap();
        assert_eq!(kind.group, "");
        assert_eq!(kind.api_version(), "v1");
    }

    #[test]
    fn rejects_extra_separators() {
        let err = Kind::from_api_version("a/b/c", "Widget").unwrap_err();
        assert!(matches!(err, KindError::MalformedApiVersion { .. }));
    }

    #[test]
    fn rejects_empty_components() {
        assert!(matches!(
            Kind::from_api_version("example.org/", "Widget"),
            Err(KindError::EmptyComponent {
                component: "version"
            })
        ));
        assert!(matches!(
            Kind::from_api_version("example.org/v1", ""),
            Err(KindError::EmptyComponent { component: "kind" })
        ));
    }

    #[test]
    fn display_matches_serialized_form() {
        let kind = Kind::new("example.org", "v1", "Widget");
        assert_eq!(kind.to_string(), "example.org/v1, Kind=Widget");
    }

    #[test]
    fn ordering_is_stable() {
        let mut kinds = vec![
            Kind::new("z.org", "v1", "A"),
            Kind::new("a.org", "v2", "B"),
            Kind::new("a.org", "v1", "B"),
        ];
        kinds.sort();
        assert_eq!(kinds[0].group, "a.org");
        assert_eq!(kinds[0].version, "v1");
    }
}
