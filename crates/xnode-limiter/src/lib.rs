#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]

mod err;
mod limiter;
mod online;
mod state;
mod user;

pub use err::{Error, Result};
pub use limiter::{Admission, Limiter};
pub use online::{OnlineDevice, OnlineDeviceTracker};
pub use user::{compose_limit, Uid, UserKey, UserLimit};
