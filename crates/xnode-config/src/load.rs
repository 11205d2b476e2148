//! Reading configuration files.

use std::path::Path;

use figment::providers::{Env, Format as _, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::ConfigError;

/// Load a builder (or any deserializable type) from the TOML file at
/// `path`, with overrides from environment variables starting with
/// `env_prefix`.
///
/// Nested keys are separated by a double underscore in variable names, so
/// with a prefix of `XNODE_`, `XNODE_PANEL__NODE_ID=7` sets `panel.node_id`.
pub fn load_builder<B: DeserializeOwned>(path: &Path, env_prefix: &str) -> Result<B, ConfigError> {
    if !path.is_file() {
        return Err(ConfigError::NotFound {
            path: path.to_owned(),
        });
    }
    debug!("Reading configuration from {}", path.display());
    let builder = Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed(env_prefix).split("__"))
        .extract()?;
    Ok(builder)
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
    use crate::{impl_standard_builder, ConfigBuildError};
    use derive_builder::Builder;
    use serde::{Deserialize, Serialize};
    use std::io::Write as _;
    use std::time::Duration;

    #[derive(Debug, Clone, Builder, Eq, PartialEq)]
    #[builder(build_fn(error = "ConfigBuildError"))]
    #[builder(derive(Debug, Serialize, Deserialize))]
    struct Sample {
        #[builder(default = "3")]
        retries: u32,
        #[builder(default = "Duration::from_secs(5)")]
        #[builder_field_attr(serde(default, with = "humantime_serde::option"))]
        timeout: Duration,
    }
    impl_standard_builder! { Sample }

    #[derive(Debug, Clone, Builder)]
    #[builder(build_fn(error = "ConfigBuildError"))]
    #[builder(derive(Debug, Serialize, Deserialize))]
    struct Required {
        host: String,
    }
    impl_standard_builder! { Required: !Default }

    fn write_toml(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn defaults() {
        let s = Sample::default();
        assert_eq!(s.retries, 3);
        assert_eq!(s.timeout, Duration::from_secs(5));
    }

    #[test]
    fn missing_field() {
        let e = Required::builder().build().unwrap_err();
        assert_eq!(
            e,
            ConfigBuildError::MissingField {
                field: "host".into()
            }
        );
        assert_eq!(
            e.within("panel").to_string(),
            "Field was not provided: panel.host"
        );
    }

    #[test]
    fn load_from_file() {
        let f = write_toml("retries = 7\ntimeout = \"2s 500ms\"\n");
        let b: SampleBuilder = load_builder(f.path(), "XNODE_CONFIG_TEST_UNUSED_").unwrap();
        let s = b.build().unwrap();
        assert_eq!(s.retries, 7);
        assert_eq!(s.timeout, Duration::from_millis(2500));
    }

    #[test]
    fn load_partial_file_keeps_defaults() {
        let f = write_toml("retries = 1\n");
        let b: SampleBuilder = load_builder(f.path(), "XNODE_CONFIG_TEST_UNUSED_").unwrap();
        assert_eq!(b.build().unwrap().timeout, Duration::from_secs(5));
    }

    #[test]
    fn load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let e = load_builder::<SampleBuilder>(&dir.path().join("nope.toml"), "X_").unwrap_err();
        assert!(matches!(e, ConfigError::NotFound { .. }));
    }

    #[test]
    fn load_bad_type() {
        let f = write_toml("retries = \"many\"\n");
        let e = load_builder::<SampleBuilder>(f.path(), "XNODE_CONFIG_TEST_UNUSED_").unwrap_err();
        assert!(matches!(e, ConfigError::Parse(_)));
    }
}
