//! Turning a node descriptor into inbounds.

use std::sync::Arc;

use xnode_panel::{NodeDescriptor, NodeType, Security, TcpHeader, Transport};

use crate::{Error, Result};

/// Return the inbound tag of `node`: `<type>_<port>_<node id>`.
pub fn inbound_tag(node: &NodeDescriptor) -> String {
    format!("{}_{}_{}", node.node_type, node.port, node.node_id)
}

/// What an inbound is for.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub enum InboundRole {
    /// The node's only inbound, serving its users directly.
    Primary,
    /// The Shadowsocks half of a Shadowsocks-plugin node.
    ///
    /// It serves the users over plain TCP; the carrier forwards to it.
    PluginShadowsocks,
    /// The inbound that terminates a Shadowsocks-plugin node's streaming
    /// transport and forwards to the Shadowsocks half.
    ///
    /// It has no users of its own.
    PluginCarrier,
}

/// One inbound the engine should run for a node.
#[derive(Debug, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub struct InboundPlan {
    /// The tag of this inbound.
    pub tag: String,
    /// The port it listens on.
    pub port: u16,
    /// What it is for.
    pub role: InboundRole,
    /// The node settings it should use.
    ///
    /// For [`InboundRole::PluginShadowsocks`] this is the node with its
    /// transport replaced by plain TCP and no security layer.
    pub node: Arc<NodeDescriptor>,
}

impl InboundPlan {
    /// Return true if users should be provisioned on this inbound.
    pub fn has_users(&self) -> bool {
        self.role != InboundRole::PluginCarrier
    }
}

/// Return the tag of the carrier inbound that goes with `tag`.
pub fn carrier_tag(tag: &str) -> String {
    format!("dokodemo-door_{}+1", tag)
}

/// Plan the inbounds for `node`.
///
/// The first plan is always the one tagged with [`inbound_tag`], which
/// carries the users and the limiter.
pub fn plan_inbounds(node: &Arc<NodeDescriptor>) -> Result<Vec<InboundPlan>> {
    let tag = inbound_tag(node);
    if node.node_type != NodeType::ShadowsocksPlugin {
        return Ok(vec![InboundPlan {
            tag,
            port: node.port,
            role: InboundRole::Primary,
            node: Arc::clone(node),
        }]);
    }

    let carrier_port = node.port.checked_add(1).ok_or_else(|| {
        Error::InvalidPlan(format!(
            "port {} leaves no room for the plugin carrier",
            node.port
        ))
    })?;
    let mut plain = NodeDescriptor::clone(node);
    plain.transport = Transport::Tcp {
        header: TcpHeader::None,
    };
    plain.security = Security::None;

    Ok(vec![
        InboundPlan {
            tag: tag.clone(),
            port: node.port,
            role: InboundRole::PluginShadowsocks,
            node: Arc::new(plain),
        },
        InboundPlan {
            tag: carrier_tag(&tag),
            port: carrier_port,
            role: InboundRole::PluginCarrier,
            node: Arc::clone(node),
        },
    ])
}
