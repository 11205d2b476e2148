//! Renew certificates with an external program.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio_crate::process::Command;
use tracing::debug;
use xnode_controller::{CertRenewer, EngineError};
use xnode_panel::CertMode;

/// Name we use for ourselves in errors.
const COMPONENT: &str = "certificate manager";

/// A [`CertRenewer`] that runs `<program> renew <mode> <domain>`.
///
/// The program decides whether the certificate needs renewing; a zero exit
/// status means the certificate is now valid.
#[derive(Debug, Clone)]
pub(crate) struct CommandRenewer {
    /// The program to run.
    program: PathBuf,
}

impl CommandRenewer {
    /// Return a renewer running `program`.
    pub(crate) fn new(program: impl Into<PathBuf>) -> Self {
        CommandRenewer {
            program: program.into(),
        }
    }
}

#[async_trait]
impl CertRenewer for CommandRenewer {
    async fn renew(&self, mode: CertMode, domain: &str) -> Result<(), EngineError> {
        let action = format!("renew the certificate of {}", domain);
        debug!("Running {} for {}", self.program.display(), domain);
        let status = Command::new(&self.program)
            .arg("renew")
            .arg(mode.to_string())
            .arg(domain)
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| EngineError::new(COMPONENT, action.clone(), e))?;
        if status.success() {
            Ok(())
        } else {
            Err(EngineError::new(COMPONENT, action, status))
        }
    }
}

#[cfg(all(test, unix))]
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

    #[tokio_crate::test(crate = "tokio_crate")]
    async fn exit_status() {
        CommandRenewer::new("true")
            .renew(CertMode::Http, "node.example.com")
            .await
            .unwrap();

        let e = CommandRenewer::new("false")
            .renew(CertMode::Dns, "node.example.com")
            .await
            .unwrap_err();
        let msg = e.to_string();
        assert!(msg.starts_with("certificate manager could not renew"), "{}", msg);
        assert!(msg.contains("node.example.com"), "{}", msg);
    }

    #[tokio_crate::test(crate = "tokio_crate")]
    async fn missing_program() {
        let e = CommandRenewer::new("/nonexistent/xnode-renew")
            .renew(CertMode::Http, "node.example.com")
            .await
            .unwrap_err();
        assert!(e.to_string().contains("certificate manager"));
    }
}
