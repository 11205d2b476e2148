//! The node descriptor: what this node should serve.

use std::str::FromStr;

use serde_json::Value;
use strum::{Display, EnumString, IntoStaticStr};

use crate::model::{mbps_to_bytes_per_sec, ServerConfig};
use crate::rules::RuleSpec;
use crate::{Error, Result};

/// The proxy protocol a node speaks.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display, EnumString, IntoStaticStr)]
#[strum(ascii_case_insensitive)]
#[non_exhaustive]
pub enum NodeType {
    /// VLESS.
    Vless,
    /// VMess.
    Vmess,
    /// Trojan.
    Trojan,
    /// Plain Shadowsocks.
    Shadowsocks,
    /// Shadowsocks carried over a streaming transport (ws, grpc or quic).
    ///
    /// Needs a second inbound for the transport; see the controller's
    /// inbound planning.
    #[strum(serialize = "Shadowsocks-Plugin")]
    ShadowsocksPlugin,
}

/// Obfuscation header of a TCP transport.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum TcpHeader {
    /// No obfuscation.
    None,
    /// Disguise as HTTP requests for `path`.
    Http {
        /// Request path.
        path: String,
    },
}

/// The transport that carries the proxy protocol.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum Transport {
    /// Raw TCP.
    Tcp {
        /// Header obfuscation.
        header: TcpHeader,
    },
    /// WebSocket.
    Ws {
        /// Request path.
        path: String,
        /// `Host` header, from the configured headers.
        host: String,
    },
    /// HTTP/2.
    H2 {
        /// Request path.
        path: String,
        /// Host name.
        host: String,
    },
    /// gRPC.
    Grpc {
        /// gRPC service name.
        service_name: String,
    },
    /// QUIC.
    Quic {
        /// Packet encryption.
        security: String,
        /// Encryption key.
        key: String,
        /// Packet header obfuscation type.
        header_type: String,
    },
    /// mKCP.
    Kcp {
        /// Obfuscation seed.
        seed: String,
        /// Whether congestion control is enabled.
        congestion: bool,
        /// Packet header obfuscation type.
        header_type: String,
    },
}

impl Transport {
    /// Return the name of this transport as the panel spells it.
    pub fn name(&self) -> &'static str {
        match self {
            Transport::Tcp { .. } => "tcp",
            Transport::Ws { .. } => "ws",
            Transport::H2 { .. } => "h2",
            Transport::Grpc { .. } => "grpc",
            Transport::Quic { .. } => "quic",
            Transport::Kcp { .. } => "kcp",
        }
    }

    /// Return true if this transport can carry a Shadowsocks plugin.
    fn carries_plugin(&self) -> bool {
        matches!(
            self,
            Transport::Ws { .. } | Transport::Grpc { .. } | Transport::Quic { .. }
        )
    }
}

/// TLS settings of a node.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub struct TlsSettings {
    /// The certificate's domain.  Never empty.
    pub server_name: String,
    /// Comma-separated ALPN protocols; may be empty.
    pub alpn: String,
    /// uTLS fingerprint to present.
    pub fingerprint: String,
    /// Refuse handshakes with an unknown SNI.
    pub reject_unknown_sni: bool,
    /// Accept insecure clients.
    pub allow_insecure: bool,
}

/// Reality settings of a node.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub struct RealitySettings {
    /// Where to forward unauthenticated handshakes.
    pub dest: String,
    /// Emit Reality debug output.
    pub show: bool,
    /// Private key.
    pub private_key: String,
    /// Accepted server names.
    pub server_names: Vec<String>,
    /// Accepted short ids.
    pub short_ids: Vec<String>,
    /// Minimum client version.
    pub min_client_ver: String,
    /// Maximum client version.
    pub max_client_ver: String,
    /// Maximum accepted clock skew, in milliseconds.
    pub max_time_diff: u64,
    /// PROXY protocol version to send to `dest`.
    pub proxy_protocol: u64,
}

/// Security layer of a node.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum Security {
    /// Plaintext (as far as the transport goes).
    None,
    /// TLS.
    Tls(TlsSettings),
    /// Reality.
    Reality(RealitySettings),
}

/// How the node's TLS certificate is obtained.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[non_exhaustive]
pub enum CertMode {
    /// No certificate management.
    None,
    /// ACME with a DNS challenge.
    Dns,
    /// ACME with an HTTP challenge.
    Http,
    /// A certificate file provided by the operator.
    File,
}

impl CertMode {
    /// Return true if certificates in this mode are renewed automatically.
    pub fn is_managed(self) -> bool {
        matches!(self, CertMode::Dns | CertMode::Http)
    }
}

/// Everything the panel tells us about the node we should serve.
///
/// Two descriptors are equal exactly when they would produce the same
/// inbound, so the reconciler compares them to decide whether to rebuild.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub struct NodeDescriptor {
    /// Our node identifier.
    pub node_id: u32,
    /// The protocol we speak.
    pub node_type: NodeType,
    /// The port we listen on.  Never zero.
    pub port: u16,
    /// The address we listen on; empty means all addresses.
    pub listen_ip: String,
    /// The public address of the node.
    pub address: String,
    /// Shadowsocks cipher.
    pub cipher: String,
    /// Shadowsocks server key.
    pub server_key: String,
    /// Source address for outgoing connections; may be empty.
    pub send_through: String,
    /// Whether to sniff destinations.
    pub sniffing: bool,
    /// Accept the PROXY protocol from a front-end.
    pub accept_proxy_protocol: bool,
    /// The transport.
    pub transport: Transport,
    /// The security layer.
    pub security: Security,
    /// XTLS flow for VLESS users.
    pub flow: String,
    /// How our certificate is managed.
    pub cert_mode: CertMode,
    /// Speed limit applying to every user, in bytes/s.  Zero: none.
    pub speed_limit: u64,
    /// Detection rules attached to the node.
    pub routes: Vec<RuleSpec>,
}

/// The flows we pass through; anything else becomes `xtls-rprx-direct`.
const KEPT_FLOWS: &[&str] = &["xtls-rprx-vision", "xtls-rprx-vision-udp443"];

/// The flow used when the panel asks for none we know.
const DEFAULT_FLOW: &str = "xtls-rprx-direct";

impl NodeDescriptor {
    /// Parse the body of a node request for node `node_id`.
    pub fn parse(node_id: u32, body: &[u8]) -> Result<Self> {
        let config: ServerConfig = serde_json::from_slice(body)
            .map_err(|e| Error::invalid_response(&format!("node {}", node_id), e))?;
        Self::from_wire(node_id, config)
    }

    /// Build a descriptor from its wire form.
    pub(crate) fn from_wire(node_id: u32, config: ServerConfig) -> Result<Self> {
        let ServerConfig { server: s, routes } = config;

        if s.port == 0 {
            return Err(Error::InvalidNode("server port must be > 0".into()));
        }
        let port = u16::try_from(s.port)
            .map_err(|_| Error::InvalidNode(format!("server port {} is out of range", s.port)))?;
        if s.node_type.is_empty() {
            return Err(Error::InvalidNode("server type is empty".into()));
        }
        let mut node_type = NodeType::from_str(&s.node_type)
            .map_err(|_| Error::InvalidNode(format!("unsupported server type {:?}", s.node_type)))?;

        let security = match s.security.as_str() {
            "" | "none" => Security::None,
            "tls" => {
                let t = &s.security_settings;
                if t.server_name.is_empty() {
                    return Err(Error::InvalidNode(
                        "TLS certificate domain (serverName) is empty".into(),
                    ));
                }
                Security::Tls(TlsSettings {
                    server_name: t.server_name.clone(),
                    alpn: t.alpn.clone(),
                    fingerprint: t.fingerprint.clone(),
                    reject_unknown_sni: t.reject_unknown_sni,
                    allow_insecure: t.allow_insecure,
                })
            }
            "reality" => {
                let r = &s.security_settings;
                Security::Reality(RealitySettings {
                    dest: r.dest.clone(),
                    show: r.show,
                    private_key: r.private_key.clone(),
                    server_names: r.server_names.clone(),
                    short_ids: r.short_ids.clone(),
                    min_client_ver: r.min_client_ver.clone(),
                    max_client_ver: r.max_client_ver.clone(),
                    max_time_diff: r.max_time_diff,
                    proxy_protocol: r.proxy_protocol,
                })
            }
            other => {
                return Err(Error::InvalidNode(format!("unsupported security {:?}", other)));
            }
        };

        let transport = parse_transport(&s.network_settings)?;
        if node_type == NodeType::Shadowsocks && transport.carries_plugin() {
            node_type = NodeType::ShadowsocksPlugin;
        }

        let cert_mode = match s.certmode.as_str() {
            "" => CertMode::None,
            mode => CertMode::from_str(mode)
                .map_err(|_| Error::InvalidNode(format!("unsupported cert mode {:?}", mode)))?,
        };

        let flow = if KEPT_FLOWS.contains(&s.network_settings.flow.as_str()) {
            s.network_settings.flow.clone()
        } else {
            DEFAULT_FLOW.to_owned()
        };

        Ok(NodeDescriptor {
            node_id,
            node_type,
            port,
            listen_ip: s.listenip,
            address: s.address,
            cipher: s.cipher,
            server_key: s.server_key,
            send_through: s.sendthrough,
            sniffing: s.sniffing,
            accept_proxy_protocol: s.network_settings.accept_proxy_protocol,
            transport,
            security,
            flow,
            cert_mode,
            speed_limit: mbps_to_bytes_per_sec(s.speedlimit),
            routes,
        })
    }

    /// Return the domain our certificate is for, if we use TLS.
    pub fn cert_domain(&self) -> Option<&str> {
        match &self.security {
            Security::Tls(tls) => Some(&tls.server_name),
            _ => None,
        }
    }
}

/// Return the string at `key` in a JSON object, or "".
fn json_str<'a>(value: Option<&'a Value>, key: &str) -> &'a str {
    value
        .and_then(|v| v.get(key))
        .and_then(Value::as_str)
        .unwrap_or_default()
}

/// Interpret `networkSettings`.
fn parse_transport(n: &crate::model::NetworkSettings) -> Result<Transport> {
    let header_type = || json_str(n.header.as_ref(), "type").to_owned();
    Ok(match n.transport.as_str() {
        "" | "tcp" => {
            let header = if json_str(n.header.as_ref(), "type") == "http" {
                let path = n
                    .header
                    .as_ref()
                    .and_then(|h| h.get("request"))
                    .and_then(|r| r.get("path"));
                // The path is sometimes a list of paths; keep the first.
                let path = match path {
                    Some(Value::Array(paths)) => paths.first().and_then(Value::as_str),
                    Some(p) => p.as_str(),
                    None => None,
                };
                TcpHeader::Http {
                    path: path.unwrap_or_default().to_owned(),
                }
            } else {
                TcpHeader::None
            };
            Transport::Tcp { header }
        }
        "ws" => Transport::Ws {
            path: n.path.clone(),
            host: json_str(n.headers.as_ref(), "Host").to_owned(),
        },
        "h2" => Transport::H2 {
            path: n.path.clone(),
            host: n.host.clone(),
        },
        "grpc" => Transport::Grpc {
            service_name: n.service_name.clone(),
        },
        "quic" => Transport::Quic {
            security: n.security.clone(),
            key: n.key.clone(),
            header_type: header_type(),
        },
        "kcp" => Transport::Kcp {
            seed: n.seed.clone(),
            congestion: n.congestion,
            header_type: header_type(),
        },
        other => {
            return Err(Error::InvalidNode(format!("unsupported transport {:?}", other)));
        }
    })
}
