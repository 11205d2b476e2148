//! Configuration for the controller.

use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use xnode_config::{impl_standard_builder, ConfigBuildError};

/// How often the controller does what.
#[derive(Debug, Clone, Builder, Eq, PartialEq)]
#[builder(build_fn(error = "ConfigBuildError", validate = "Self::validate"))]
#[builder(derive(Debug, Serialize, Deserialize))]
pub struct ControllerConfig {
    /// How often to poll the node descriptor, roster and rules.
    #[builder(default = "Duration::from_secs(60)")]
    #[builder_field_attr(serde(default, with = "humantime_serde::option"))]
    node_poll_interval: Duration,

    /// How often to report traffic and online addresses.
    #[builder(default = "Duration::from_secs(60)")]
    #[builder_field_attr(serde(default, with = "humantime_serde::option"))]
    report_interval: Duration,

    /// How long after startup to skip node polls.
    ///
    /// The panel has just told us everything during startup.
    #[builder(default = "Duration::from_secs(60)")]
    #[builder_field_attr(serde(default, with = "humantime_serde::option"))]
    startup_grace: Duration,

    /// How often to renew a managed certificate.
    #[builder(default = "Duration::from_secs(60 * 60)")]
    #[builder_field_attr(serde(default, with = "humantime_serde::option"))]
    cert_renew_interval: Duration,

    /// How long to wait for one certificate renewal before giving up.
    #[builder(default = "Duration::from_secs(10 * 60)")]
    #[builder_field_attr(serde(default, with = "humantime_serde::option"))]
    cert_renew_timeout: Duration,

    /// Renew the certificate of this domain instead of the node's TLS
    /// server name.
    #[builder(default, setter(into, strip_option))]
    cert_domain_override: Option<String>,
}

impl_standard_builder! { ControllerConfig }

impl ControllerConfigBuilder {
    /// Reject zero intervals.
    fn validate(&self) -> Result<(), ConfigBuildError> {
        let intervals = [
            ("node_poll_interval", self.node_poll_interval),
            ("report_interval", self.report_interval),
            ("cert_renew_interval", self.cert_renew_interval),
            ("cert_renew_timeout", self.cert_renew_timeout),
        ];
        for (field, value) in intervals {
            if value == Some(Duration::ZERO) {
                return Err(ConfigBuildError::Invalid {
                    field: field.into(),
                    problem: "must be greater than zero".into(),
                });
            }
        }
        if let Some(Some(domain)) = &self.cert_domain_override {
            if domain.trim().is_empty() {
                return Err(ConfigBuildError::Invalid {
                    field: "cert_domain_override".into(),
                    problem: "must not be empty".into(),
                });
            }
        }
        Ok(())
    }
}

impl ControllerConfig {
    /// Return the node polling interval.
    pub fn node_poll_interval(&self) -> Duration {
        self.node_poll_interval
    }

    /// Return the reporting interval.
    pub fn report_interval(&self) -> Duration {
        self.report_interval
    }

    /// Return the startup grace period.
    pub fn startup_grace(&self) -> Duration {
        self.startup_grace
    }

    /// Return the certificate renewal interval.
    pub fn cert_renew_interval(&self) -> Duration {
        self.cert_renew_interval
    }

    /// Return the longest we wait for one certificate renewal.
    pub fn cert_renew_timeout(&self) -> Duration {
        self.cert_renew_timeout
    }

    /// Return the configured certificate domain, if any.
    pub fn cert_domain_override(&self) -> Option<&str> {
        self.cert_domain_override.as_deref()
    }
}
