//! The interface to the source of truth.

use async_trait::async_trait;
use serde::Serialize;

use crate::{DetectRule, NodeDescriptor, Result, ServiceInfo};

/// The result of a conditional fetch.
#[derive(Debug, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum Fetched<T> {
    /// The data changed (or we had no cached copy): here it is.
    Fresh(T),
    /// The data is unchanged since our last successful fetch.
    NotModified,
}

impl<T> Fetched<T> {
    /// Return the fresh value, if there is one.
    pub fn fresh(self) -> Option<T> {
        match self {
            Fetched::Fresh(t) => Some(t),
            Fetched::NotModified => None,
        }
    }
}

/// Identifies the remote source and the node it's serving, for logging.
#[derive(Debug, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub struct ClientInfo {
    /// Base URL of the panel.
    pub api_host: String,
    /// Our node identifier.
    pub node_id: u32,
}

impl ClientInfo {
    /// Construct a new `ClientInfo`.
    pub fn new(api_host: impl Into<String>, node_id: u32) -> Self {
        ClientInfo {
            api_host: api_host.into(),
            node_id,
        }
    }
}

/// Traffic used by one user since the last successful report.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
#[non_exhaustive]
pub struct TrafficRecord {
    /// The user.
    pub uid: u64,
    /// Bytes sent by the user.
    pub upload: u64,
    /// Bytes received by the user.
    pub download: u64,
}

impl TrafficRecord {
    /// Construct a new `TrafficRecord`.
    pub fn new(uid: u64, upload: u64, download: u64) -> Self {
        TrafficRecord {
            uid,
            upload,
            download,
        }
    }
}

/// One address a user was seen connecting from.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
#[non_exhaustive]
pub struct OnlineRecord {
    /// The user.
    pub uid: u64,
    /// The address, as text.
    pub ip: String,
}

impl OnlineRecord {
    /// Construct a new `OnlineRecord`.
    pub fn new(uid: u64, ip: impl ToString) -> Self {
        OnlineRecord {
            uid,
            ip: ip.to_string(),
        }
    }
}

/// Where the reconciler gets its configuration, and where it sends its
/// statistics.
///
/// Fetches are conditional: an implementation returns
/// [`Fetched::NotModified`] when the data is unchanged since the last
/// fetch that returned [`Fetched::Fresh`].
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Describe this source, for logging.
    fn describe(&self) -> ClientInfo;

    /// Fetch the node descriptor.
    async fn fetch_node(&self) -> Result<Fetched<NodeDescriptor>>;

    /// Fetch the roster.
    async fn fetch_roster(&self) -> Result<Fetched<Vec<ServiceInfo>>>;

    /// Fetch the remote detection rules.
    async fn fetch_rules(&self) -> Result<Fetched<Vec<DetectRule>>>;

    /// Return the rules configured locally, which are always in force.
    fn local_rules(&self) -> Vec<DetectRule>;

    /// Report per-user traffic.
    ///
    /// On error, nothing was recorded and the same traffic should be
    /// reported again.
    async fn report_traffic(&self, traffic: &[TrafficRecord]) -> Result<()>;

    /// Report the addresses users are connected from.
    async fn report_online(&self, online: &[OnlineRecord]) -> Result<()>;
}
