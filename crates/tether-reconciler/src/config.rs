//! Runtime configuration.
//!
//! The configuration file is JSON with one entry per provider:
//!
//! ```json
//! {
//!   "providers": [
//!     {
//!       "name": "p1",
//!       "endpoint": "localhost:50051",
//!       "useSSL": false,
//!       "resourceTypes": [
//!         { "apiVersion": "example.org/v1", "kind": "Widget" }
//!       ]
//!     }
//!   ]
//! }
//! ```
//!
//! A single-provider shortcut builds the same structure from one endpoint
//! for the `--provider-endpoint` flag.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tether_core::{Kind, KindError};

/// Provider name used by the single-endpoint shortcut.
pub const DEFAULT_PROVIDER_NAME: &str = "default";

/// Default endpoint when none is configured.
pub const DEFAULT_ENDPOINT: &str = "localhost:50051";

/// Errors raised while loading or validating configuration. All fail
/// startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("unable to read config file {path}")]
    Io {
        /// The offending path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON for the schema.
    #[error("unable to parse config file")]
    Parse(#[from] serde_json::Error),

    /// No providers are configured.
    #[error("no providers specified in configuration")]
    NoProviders,

    /// A provider entry is missing its name.
    #[error("provider at index {index} has no name")]
    MissingName {
        /// Index of the offending provider.
        index: usize,
    },

    /// A provider entry is missing its endpoint.
    #[error("provider {name} has no endpoint")]
    MissingEndpoint {
        /// Name of the offending provider.
        name: String,
    },

    /// Two providers share a name.
    #[error("provider name {name} is used more than once")]
    DuplicateName {
        /// The duplicated name.
        name: String,
    },

    /// A resource type entry does not parse as a kind triple.
    #[error("provider {provider} has invalid resource type {api_version:?}/{kind:?}")]
    InvalidResourceType {
        /// Name of the offending provider.
        provider: String,
        /// The entry's apiVersion.
        api_version: String,
        /// The entry's kind.
        kind: String,
        /// The underlying parse error.
        #[source]
        source: KindError,
    },
}

/// One resource type a provider reconciles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTypeConfig {
    /// `group/version` (or bare version for the core group).
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    /// Kind name.
    pub kind: String,
}

/// One provider endpoint and the kinds routed to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEntry {
    /// Unique provider name; part of every controller name.
    #[serde(default)]
    pub name: String,
    /// `host:port` of the provider's server.
    #[serde(default)]
    pub endpoint: String,
    /// Whether the deployment terminates TLS for this endpoint.
    #[serde(rename = "useSSL", default)]
    pub use_ssl: bool,
    /// Kinds this provider reconciles.
    #[serde(rename = "resourceTypes", default)]
    pub resource_types: Vec<ResourceTypeConfig>,
}

impl ProviderEntry {
    /// Parses this provider's configured kinds.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidResourceType`] naming the provider
    /// and the offending entry.
    pub fn kinds(&self) -> Result<Vec<Kind>, ConfigError> {
        self.resource_types
            .iter()
            .map(|rt| {
                Kind::from_api_version(&rt.api_version, &rt.kind).map_err(|source| {
                    ConfigError::InvalidResourceType {
                        provider: self.name.clone(),
                        api_version: rt.api_version.clone(),
                        kind: rt.kind.clone(),
                        source,
                    }
                })
            })
            .collect()
    }
}

/// The whole runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Configured providers.
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,
}

impl RuntimeConfig {
    /// Loads configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] or [`ConfigError::Parse`]; run
    /// [`validate`](Self::validate) afterwards for semantic checks.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Builds a single-provider configuration from one endpoint.
    ///
    /// An empty endpoint falls back to [`DEFAULT_ENDPOINT`]. The provider
    /// declares no kinds; discovery fills them in.
    #[must_use]
    pub fn from_endpoint(endpoint: &str) -> Self {
        let endpoint = if endpoint.is_empty() {
            DEFAULT_ENDPOINT
        } else {
            endpoint
        };
        Self {
            providers: vec![ProviderEntry {
                name: DEFAULT_PROVIDER_NAME.to_string(),
                endpoint: endpoint.to_string(),
                use_ssl: false,
                resource_types: Vec::new(),
            }],
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found: no providers, a provider
    /// missing name or endpoint, duplicate names, or unparsable resource
    /// types.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.is_empty() {
            return Err(ConfigError::NoProviders);
        }

        let mut seen = std::collections::HashSet::new();
        for (index, provider) in self.providers.iter().enumerate() {
            if provider.name.is_empty() {
                return Err(ConfigError::MissingName { index });
            }
            if provider.endpoint.is_empty() {
                return Err(ConfigError::MissingEndpoint {
                    name: provider.name.clone(),
                });
            }
            if !seen.insert(provider.name.clone()) {
                return Err(ConfigError::DuplicateName {
                    name: provider.name.clone(),
                });
            }
            provider.kinds()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_json() -> &'static str {
        r#"{
            "providers": [
                {
                    "name": "p1",
                    "endpoint": "localhost:50051",
                    "useSSL": false,
                    "resourceTypes": [
                        { "apiVersion": "example.org/v1", "kind": "Widget" }
                    ]
                }
            ]
        }"#
    }

    #[test]
    fn parses_the_documented_schema() {
        let config: RuntimeConfig = serde_json::from_str(valid_json()).unwrap();
        config.validate().unwrap();
        let provider = &config.providers[0];
        assert_eq!(provider.name, "p1");
        assert!(!provider.use_ssl);
        assert_eq!(
            provider.kinds().unwrap(),
            vec![Kind::new("example.org", "v1", "Widget")]
        );
    }

    #[test]
    fn round_trips_field_names() {
        let config: RuntimeConfig = serde_json::from_str(valid_json()).unwrap();
        let rendered = serde_json::to_string(&config).unwrap();
        assert!(rendered.contains("\"useSSL\""));
        assert!(rendered.contains("\"resourceTypes\""));
        assert!(rendered.contains("\"apiVersion\""));
    }

    #[test]
    fn empty_providers_is_invalid() {
        let config = RuntimeConfig { providers: vec![] };
        assert!(matches!(config.validate(), Err(ConfigError::NoProviders)));
    }

    #[test]
    fn missing_name_names_the_index() {
        let config: RuntimeConfig = serde_json::from_str(
            r#"{ "providers": [ { "endpoint": "localhost:50051" } ] }"#,
        )
        .unwrap();
        match config.validate() {
            Err(ConfigError::MissingName { index }) => assert_eq!(index, 0),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn missing_endpoint_names_the_provider() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{ "providers": [ { "name": "p1" } ] }"#).unwrap();
        match config.validate() {
            Err(ConfigError::MissingEndpoint { name }) => assert_eq!(name, "p1"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn duplicate_provider_names_are_rejected() {
        let config: RuntimeConfig = serde_json::from_str(
            r#"{ "providers": [
                { "name": "p1", "endpoint": "a:1" },
                { "name": "p1", "endpoint": "b:2" }
            ] }"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateName { .. })
        ));
    }

    #[test]
    fn invalid_resource_type_names_the_provider() {
        let config: RuntimeConfig = serde_json::from_str(
            r#"{ "providers": [ {
                "name": "p1",
                "endpoint": "a:1",
                "resourceTypes": [ { "apiVersion": "a/b/c", "kind": "Widget" } ]
            } ] }"#,
        )
        .unwrap();
        match config.validate() {
            Err(ConfigError::InvalidResourceType { provider, .. }) => assert_eq!(provider, "p1"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn endpoint_shortcut_builds_a_valid_config() {
        let config = RuntimeConfig::from_endpoint("localhost:50051");
        config.validate().unwrap();
        assert_eq!(config.providers[0].name, DEFAULT_PROVIDER_NAME);

        let fallback = RuntimeConfig::from_endpoint("");
        assert_eq!(fallback.providers[0].endpoint, DEFAULT_ENDPOINT);
    }

    #[test]
    fn load_reads_a_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(valid_json().as_bytes()).unwrap();

        let config = RuntimeConfig::load(file.path()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.providers.len(), 1);
    }

    #[test]
    fn load_surfaces_missing_files() {
        let err = RuntimeConfig::load("/nonexistent/config.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
