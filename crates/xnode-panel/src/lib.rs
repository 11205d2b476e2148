#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]

mod client;
mod config;
mod err;
mod model;
mod node;
mod roster;
mod rules;
mod source;

pub use client::PanelClient;
pub use config::{PanelConfig, PanelConfigBuilder};
pub use err::{Error, Result};
pub use node::{
    CertMode, NodeDescriptor, NodeType, RealitySettings, Security, TcpHeader, TlsSettings,
    Transport,
};
pub use roster::{parse_roster, ServiceInfo};
pub use rules::{compile_rules, load_local_rules, DetectRule, RuleSpec, LOCAL_RULE_ID};
pub use source::{ClientInfo, Fetched, OnlineRecord, RemoteSource, TrafficRecord};
