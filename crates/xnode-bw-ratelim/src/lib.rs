#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]

mod gate;
mod io;

pub use gate::{Blocked, Permit, RateGate};
pub use io::{LimitedRead, LimitedWrite};

/// A byte rate, with the size of the largest burst we allow.
///
/// A `bytes_per_sec` of zero means "no limit".
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TrafficRateLimit {
    /// Tokens (bytes) added to the bucket each second.
    bytes_per_sec: u64,
    /// Capacity of the bucket.
    max_burst: u64,
}

impl TrafficRateLimit {
    /// A limit of `bytes_per_sec`, with a burst of one second's worth of
    /// traffic.
    pub fn per_second(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec,
            max_burst: bytes_per_sec,
        }
    }

    /// A limit of `bytes_per_sec`, with an explicit burst size.
    ///
    /// A burst smaller than one byte is raised to one.
    pub fn with_burst(bytes_per_sec: u64, max_burst: u64) -> Self {
        Self {
            bytes_per_sec,
            max_burst: max_burst.max(1),
        }
    }

    /// Return the refill rate, in bytes per second.
    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec
    }

    /// Return the bucket capacity, in bytes.
    pub fn max_burst(&self) -> u64 {
        self.max_burst
    }

    /// Return true if this limit doesn't limit anything.
    pub fn is_unlimited(&self) -> bool {
        self.bytes_per_sec == 0
    }
}
