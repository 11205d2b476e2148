#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]

mod config;
mod controller;
mod diff;
mod err;
mod external;
pub mod memory;
mod plan;
mod tasks;

pub use config::{ControllerConfig, ControllerConfigBuilder};
pub use controller::{Controller, Phase, PollOutcome, ReportSummary};
pub use diff::RosterDiff;
pub use err::{Error, Result};
pub use external::{
    CertRenewer, DetectHit, EngineError, Externals, ProxyEngine, RuleManager, TrafficStats,
};
pub use plan::{carrier_tag, inbound_tag, plan_inbounds, InboundPlan, InboundRole};
