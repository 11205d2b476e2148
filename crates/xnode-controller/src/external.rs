//! Capabilities of the components the controller drives.
//!
//! The proxy engine, the traffic accounting layer, the rule matcher and
//! the certificate manager all live outside this crate.  The controller
//! only needs the narrow operations below from each of them.

use std::sync::Arc;

use async_trait::async_trait;
use xnode_error::{ErrorKind, HasKind};
use xnode_limiter::UserKey;
use xnode_panel::{CertMode, DetectRule, ServiceInfo};

use crate::InboundPlan;

/// An external component refused to do something.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{component} could not {action}: {message}")]
#[non_exhaustive]
pub struct EngineError {
    /// Which component failed.
    pub component: &'static str,
    /// What it was asked to do.
    pub action: String,
    /// What it said.
    pub message: String,
}

impl EngineError {
    /// Construct a new `EngineError`.
    pub fn new(component: &'static str, action: impl Into<String>, message: impl ToString) -> Self {
        EngineError {
            component,
            action: action.into(),
            message: message.to_string(),
        }
    }
}

impl HasKind for EngineError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::ExternalComponentFailed
    }
}

/// The proxy engine: moves the bytes.
///
/// Every inbound has an outbound of the same tag.  Users are known to the
/// engine by their [`UserKey`].
pub trait ProxyEngine: Send + Sync {
    /// Start serving `plan`.
    fn add_inbound(&self, plan: &InboundPlan) -> Result<(), EngineError>;

    /// Stop serving the inbound `tag`, dropping its users.
    fn remove_inbound(&self, tag: &str) -> Result<(), EngineError>;

    /// Add the outbound for `plan`.
    fn add_outbound(&self, plan: &InboundPlan) -> Result<(), EngineError>;

    /// Remove the outbound `tag`.
    fn remove_outbound(&self, tag: &str) -> Result<(), EngineError>;

    /// Accept `users` on the inbound of `plan`.
    fn add_users(&self, plan: &InboundPlan, users: &[ServiceInfo]) -> Result<(), EngineError>;

    /// Stop accepting `users` on the inbound `tag`.
    fn remove_users(&self, tag: &str, users: &[UserKey]) -> Result<(), EngineError>;
}

/// Per-user traffic counters.
pub trait TrafficStats: Send + Sync {
    /// Return the bytes `user` has sent and received since the last
    /// reset, without resetting them.
    fn read(&self, user: &UserKey) -> (u64, u64);

    /// Reset the counters of `user` to zero.
    fn reset(&self, user: &UserKey);
}

/// A connection that a detection rule blocked.
#[derive(Debug, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub struct DetectHit {
    /// The user that made the connection.
    pub user: String,
    /// The rule that matched.
    pub rule_id: i64,
    /// Where the connection was going.
    pub destination: String,
}

impl DetectHit {
    /// Construct a new `DetectHit`.
    pub fn new(user: impl Into<String>, rule_id: i64, destination: impl Into<String>) -> Self {
        DetectHit {
            user: user.into(),
            rule_id,
            destination: destination.into(),
        }
    }
}

/// The component that matches connections against detection rules.
pub trait RuleManager: Send + Sync {
    /// Replace the rules in force on `tag`.  An empty list clears them.
    fn replace_rules(&self, tag: &str, rules: Vec<DetectRule>) -> Result<(), EngineError>;

    /// Return the connections blocked on `tag` since the last call.
    fn take_hits(&self, tag: &str) -> Vec<DetectHit>;
}

/// The certificate manager.
#[async_trait]
pub trait CertRenewer: Send + Sync {
    /// Renew the certificate of `domain`, if it needs renewing.
    async fn renew(&self, mode: CertMode, domain: &str) -> Result<(), EngineError>;
}

/// The set of external components a controller drives.
#[derive(Clone)]
#[non_exhaustive]
pub struct Externals {
    /// The proxy engine.
    pub engine: Arc<dyn ProxyEngine>,
    /// The traffic counters.
    pub traffic: Arc<dyn TrafficStats>,
    /// The rule matcher.
    pub rules: Arc<dyn RuleManager>,
    /// The certificate manager, if we have one.
    pub cert: Option<Arc<dyn CertRenewer>>,
}

impl Externals {
    /// Construct a new `Externals` without a certificate manager.
    pub fn new(
        engine: Arc<dyn ProxyEngine>,
        traffic: Arc<dyn TrafficStats>,
        rules: Arc<dyn RuleManager>,
    ) -> Self {
        Externals {
            engine,
            traffic,
            rules,
            cert: None,
        }
    }

    /// Use `cert` to renew certificates.
    #[must_use]
    pub fn with_cert_renewer(mut self, cert: Arc<dyn CertRenewer>) -> Self {
        self.cert = Some(cert);
        self
    }
}

impl std::fmt::Debug for Externals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Externals")
            .field("cert", &self.cert.is_some())
            .finish_non_exhaustive()
    }
}
