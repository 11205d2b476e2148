//! Configuration for the panel client.

use std::path::{Path, PathBuf};
use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use xnode_config::{impl_standard_builder, ConfigBuildError};

/// How to reach the management panel.
#[derive(Debug, Clone, Builder, Eq, PartialEq)]
#[builder(build_fn(error = "ConfigBuildError", validate = "Self::validate"))]
#[builder(derive(Debug, Serialize, Deserialize))]
pub struct PanelConfig {
    /// Base URL of the panel, for example `https://panel.example.com`.
    #[builder(setter(into))]
    api_host: String,

    /// The identifier of this node on the panel.
    node_id: u32,

    /// The key that authenticates us to the panel.
    #[builder(default, setter(into))]
    key: String,

    /// How long to wait for any single request.
    #[builder(default = "Duration::from_secs(5)")]
    #[builder_field_attr(serde(default, with = "humantime_serde::option"))]
    timeout: Duration,

    /// How many times to attempt a request that fails without an answer.
    #[builder(default = "3")]
    retry_count: u32,

    /// A file of extra detection rules, one regular expression per line.
    #[builder(default, setter(into, strip_option))]
    rule_list_path: Option<PathBuf>,
}

impl_standard_builder! { PanelConfig: !Default }

impl PanelConfigBuilder {
    /// Check the values that derive_builder can't check for us.
    fn validate(&self) -> Result<(), ConfigBuildError> {
        if let Some(host) = &self.api_host {
            if host.trim().is_empty() {
                return Err(ConfigBuildError::Invalid {
                    field: "api_host".into(),
                    problem: "must not be empty".into(),
                });
            }
        }
        if self.node_id == Some(0) {
            return Err(ConfigBuildError::Invalid {
                field: "node_id".into(),
                problem: "must be greater than zero".into(),
            });
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(ConfigBuildError::Invalid {
                field: "timeout".into(),
                problem: "must be greater than zero".into(),
            });
        }
        if self.retry_count == Some(0) {
            return Err(ConfigBuildError::Invalid {
                field: "retry_count".into(),
                problem: "must allow at least one attempt".into(),
            });
        }
        Ok(())
    }
}

impl PanelConfig {
    /// Return the panel's base URL, without a trailing slash.
    pub fn api_host(&self) -> &str {
        self.api_host.trim_end_matches('/')
    }

    /// Return our node identifier.
    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// Return the authentication key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Return the per-request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Return the number of attempts per request.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Return the path of the local rule list, if one is configured.
    pub fn rule_list_path(&self) -> Option<&Path> {
        self.rule_list_path.as_deref()
    }
}
