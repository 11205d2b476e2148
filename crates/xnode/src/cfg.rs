//! The configuration file.

use std::path::{Path, PathBuf};

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use xnode_config::{impl_standard_builder, load_builder, ConfigBuildError};
use xnode_controller::{ControllerConfig, ControllerConfigBuilder};
use xnode_panel::{PanelConfig, PanelConfigBuilder};

/// Prefix of environment variables that override the configuration file.
pub const ENV_PREFIX: &str = "XNODE_";

/// Where log messages go.
#[derive(Debug, Clone, Builder, Eq, PartialEq)]
#[builder(build_fn(error = "ConfigBuildError", validate = "Self::validate"))]
#[builder(derive(Debug, Serialize, Deserialize))]
pub struct LoggingConfig {
    /// Filter for messages to standard output, in `RUST_LOG` syntax.
    #[builder(default = "\"info\".to_owned()", setter(into))]
    console: String,

    /// Also write messages to a daily file in this directory.
    #[builder(default, setter(into, strip_option))]
    log_dir: Option<PathBuf>,
}

impl_standard_builder! { LoggingConfig }

impl LoggingConfigBuilder {
    /// Reject filters that don't parse.
    fn validate(&self) -> Result<(), ConfigBuildError> {
        if let Some(console) = &self.console {
            crate::logging::filter(console).map_err(|e| ConfigBuildError::Invalid {
                field: "console".into(),
                problem: e.to_string(),
            })?;
        }
        Ok(())
    }
}

impl LoggingConfig {
    /// Return the console filter.
    pub fn console(&self) -> &str {
        &self.console
    }

    /// Return the log file directory, if any.
    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }
}

/// How certificates are renewed.
#[derive(Debug, Clone, Builder, Eq, PartialEq)]
#[builder(build_fn(error = "ConfigBuildError"))]
#[builder(derive(Debug, Serialize, Deserialize))]
pub struct CertConfig {
    /// A program to run as `<program> renew <mode> <domain>`.
    ///
    /// Without one, certificates are not renewed.
    #[builder(default, setter(into, strip_option))]
    renew_command: Option<PathBuf>,
}

impl_standard_builder! { CertConfig }

impl CertConfig {
    /// Return the renewal program, if any.
    pub fn renew_command(&self) -> Option<&Path> {
        self.renew_command.as_deref()
    }
}

/// The whole configuration of an xnode process.
#[derive(Debug, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub struct XnodeConfig {
    /// The management panel.
    panel: PanelConfig,
    /// The reconciler.
    controller: ControllerConfig,
    /// Logging.
    logging: LoggingConfig,
    /// Certificates.
    cert: CertConfig,
}

/// Builder for [`XnodeConfig`]: the configuration file, as read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct XnodeConfigBuilder {
    /// The `[panel]` section.
    pub panel: PanelConfigBuilder,
    /// The `[controller]` section.
    pub controller: ControllerConfigBuilder,
    /// The `[logging]` section.
    pub logging: LoggingConfigBuilder,
    /// The `[cert]` section.
    pub cert: CertConfigBuilder,
}

impl XnodeConfigBuilder {
    /// Build the configuration, naming failing fields by their section.
    pub fn build(&self) -> Result<XnodeConfig, ConfigBuildError> {
        Ok(XnodeConfig {
            panel: self.panel.build().map_err(|e| e.within("panel"))?,
            controller: self.controller.build().map_err(|e| e.within("controller"))?,
            logging: self.logging.build().map_err(|e| e.within("logging"))?,
            cert: self.cert.build().map_err(|e| e.within("cert"))?,
        })
    }
}

impl XnodeConfig {
    /// Return a new builder.
    pub fn builder() -> XnodeConfigBuilder {
        XnodeConfigBuilder::default()
    }

    /// Read the configuration at `path`, with overrides from the
    /// environment.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let builder: XnodeConfigBuilder = load_builder(path, ENV_PREFIX)?;
        Ok(builder.build()?)
    }

    /// Return the panel configuration.
    pub fn panel(&self) -> &PanelConfig {
        &self.panel
    }

    /// Return the controller configuration.
    pub fn controller(&self) -> &ControllerConfig {
        &self.controller
    }

    /// Return the logging configuration.
    pub fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    /// Return the certificate configuration.
    pub fn cert(&self) -> &CertConfig {
        &self.cert
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list @@ -->
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write as _;
    use std::time::Duration;

    fn write(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn full_file() {
        let f = write(
            r#"
            [panel]
            api_host = "https://panel.example.com/"
            node_id = 7
            key = "k"
            timeout = "2s"

            [controller]
            report_interval = "5m"

            [logging]
            console = "xnode_controller=debug,info"
            log_dir = "/var/log/xnode"

            [cert]
            renew_command = "/usr/local/bin/renew"
            "#,
        );
        let cfg = XnodeConfig::load(f.path()).unwrap();
        assert_eq!(cfg.panel().api_host(), "https://panel.example.com");
        assert_eq!(cfg.panel().node_id(), 7);
        assert_eq!(cfg.panel().timeout(), Duration::from_secs(2));
        assert_eq!(cfg.controller().report_interval(), Duration::from_secs(300));
        assert_eq!(cfg.controller().node_poll_interval(), Duration::from_secs(60));
        assert_eq!(cfg.logging().console(), "xnode_controller=debug,info");
        assert_eq!(cfg.logging().log_dir(), Some(Path::new("/var/log/xnode")));
        assert_eq!(
            cfg.cert().renew_command(),
            Some(Path::new("/usr/local/bin/renew"))
        );
    }

    #[test]
    fn minimal_file() {
        let f = write(
            r#"
            [panel]
            api_host = "http://panel"
            node_id = 1
            "#,
        );
        let cfg = XnodeConfig::load(f.path()).unwrap();
        assert_eq!(cfg.logging(), &LoggingConfig::default());
        assert_eq!(cfg.logging().console(), "info");
        assert_eq!(cfg.controller(), &ControllerConfig::default());
        assert_eq!(cfg.cert().renew_command(), None);
    }

    #[test]
    fn errors_name_section() {
        let mut b = XnodeConfig::builder();
        b.panel.api_host("http://panel");
        let e = b.build().unwrap_err();
        assert_matches!(e, ConfigBuildError::MissingField { field } if field == "panel.node_id");

        b.panel.node_id(3);
        b.controller.node_poll_interval(Duration::ZERO);
        let e = b.build().unwrap_err();
        assert_matches!(
            e,
            ConfigBuildError::Invalid { field, .. } if field == "controller.node_poll_interval"
        );

        b.controller.node_poll_interval(Duration::from_secs(1));
        b.logging.console("xnode=notalevel");
        let e = b.build().unwrap_err();
        assert_matches!(e, ConfigBuildError::Invalid { field, .. } if field == "logging.console");
    }

    #[test]
    fn missing_file() {
        let e = XnodeConfig::load(Path::new("/nonexistent/xnode.toml")).unwrap_err();
        assert!(e.to_string().contains("not found"), "{}", e);
    }
}
