//! The panel's JSON wire format.
//!
//! These types mirror what the panel sends; [`node`](crate::node) and
//! [`roster`](crate::roster) turn them into the types the rest of xnode
//! uses.  Every field is optional on the wire.

use serde::{Deserialize, Serialize};

use crate::rules::RuleSpec;

/// Body of `GET /api/backend/server/{id}`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct ServerConfig {
    /// The node itself.
    pub(crate) server: Server,
    /// Detection rules attached to the node.
    #[serde(rename = "rules")]
    pub(crate) routes: Vec<RuleSpec>,
}

/// The node description.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct Server {
    /// Public address advertised to clients.
    pub(crate) address: String,
    /// Certificate management mode.
    pub(crate) certmode: String,
    /// Shadowsocks cipher.
    pub(crate) cipher: String,
    /// Port to listen on.
    #[serde(rename = "listeningport")]
    pub(crate) port: i64,
    /// Address to listen on.
    pub(crate) listenip: String,
    /// Transport settings.
    #[serde(rename = "networkSettings")]
    pub(crate) network_settings: NetworkSettings,
    /// `none`, `tls` or `reality`.
    pub(crate) security: String,
    /// TLS or Reality settings.
    #[serde(rename = "securitySettings")]
    pub(crate) security_settings: SecuritySettings,
    /// Source address for outgoing connections.
    pub(crate) sendthrough: String,
    /// Shadowsocks server key.
    pub(crate) server_key: String,
    /// Whether to sniff destinations.
    pub(crate) sniffing: bool,
    /// Node speed limit, in Mbit/s.
    pub(crate) speedlimit: u64,
    /// Protocol name.
    #[serde(rename = "type")]
    pub(crate) node_type: String,
}

/// `server.networkSettings`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub(crate) struct NetworkSettings {
    /// Accept the PROXY protocol on the inbound.
    pub(crate) accept_proxy_protocol: bool,
    /// Path, for ws and h2.
    pub(crate) path: String,
    /// Host, for h2.
    pub(crate) host: String,
    /// Encryption, for quic.
    pub(crate) security: String,
    /// Key, for quic.
    pub(crate) key: String,
    /// HTTP headers, for ws.
    pub(crate) headers: Option<serde_json::Value>,
    /// Service name, for grpc.
    pub(crate) service_name: String,
    /// Header obfuscation, for tcp, quic and kcp.
    pub(crate) header: Option<serde_json::Value>,
    /// Transport name.
    pub(crate) transport: String,
    /// Seed, for kcp.
    pub(crate) seed: String,
    /// Congestion control, for kcp.
    pub(crate) congestion: bool,
    /// XTLS flow.
    pub(crate) flow: String,
}

/// `server.securitySettings`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct SecuritySettings {
    /// TLS: accept insecure clients.
    #[serde(rename = "allowInsecure")]
    pub(crate) allow_insecure: bool,
    /// TLS: uTLS fingerprint.
    pub(crate) fingerprint: String,
    /// TLS: refuse unknown SNI.
    #[serde(rename = "rejectUnknownSni")]
    pub(crate) reject_unknown_sni: bool,
    /// TLS: certificate domain.
    #[serde(rename = "serverName")]
    pub(crate) server_name: String,
    /// TLS: comma-separated ALPN list.
    pub(crate) alpn: String,
    /// Reality: fallback destination.
    pub(crate) dest: String,
    /// Reality: debug output.
    pub(crate) show: bool,
    /// Reality: private key.
    #[serde(rename = "privatekey")]
    pub(crate) private_key: String,
    /// Reality: minimum client version.
    #[serde(rename = "minclientver")]
    pub(crate) min_client_ver: String,
    /// Reality: maximum client version.
    #[serde(rename = "maxclientver")]
    pub(crate) max_client_ver: String,
    /// Reality: maximum clock skew, in milliseconds.
    #[serde(rename = "maxtimediff")]
    pub(crate) max_time_diff: u64,
    /// Reality: PROXY protocol version sent to `dest`.
    #[serde(rename = "proxyprotocol")]
    pub(crate) proxy_protocol: u64,
    /// Reality: accepted server names.
    #[serde(rename = "serverNames")]
    pub(crate) server_names: Vec<String>,
    /// Reality: accepted short ids.
    #[serde(rename = "shortids")]
    pub(crate) short_ids: Vec<String>,
}

/// Body of `GET /api/backend/service/{id}`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct ServiceList {
    /// One entry per user.
    pub(crate) services: Vec<Service>,
}

/// One user in the roster.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct Service {
    /// User identifier.
    pub(crate) id: u64,
    /// User credential.
    pub(crate) uuid: String,
    /// User email.
    pub(crate) email: String,
    /// Allowed simultaneous addresses, across all nodes.  Zero: no limit.
    pub(crate) iplimit: i64,
    /// Addresses the panel currently counts as online, across all nodes.
    pub(crate) ipcount: i64,
    /// User speed limit, in Mbit/s.
    pub(crate) speedlimit: u64,
}

/// Body of `GET /api/backend/rules/{id}`.
///
/// Accept both a bare list and one wrapped like the node's own rules.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum RuleList {
    /// `{"rules": [...]}`
    Wrapped {
        /// The rules.
        rules: Vec<RuleSpec>,
    },
    /// `[...]`
    Bare(Vec<RuleSpec>),
}

impl RuleList {
    /// Return the rules in this list.
    pub(crate) fn into_rules(self) -> Vec<RuleSpec> {
        match self {
            RuleList::Wrapped { rules } | RuleList::Bare(rules) => rules,
        }
    }
}

/// Body of the report endpoints.
#[derive(Debug, Serialize)]
pub(crate) struct PostData<'a, T> {
    /// The records being reported.
    pub(crate) data: &'a [T],
}

/// Convert a panel speed in Mbit/s to bytes per second.
pub(crate) fn mbps_to_bytes_per_sec(mbps: u64) -> u64 {
    mbps.saturating_mul(1_000_000) / 8
}
