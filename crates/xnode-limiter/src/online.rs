//! Bookkeeping of the addresses each user is connected from.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::Uid;

/// One address that a user has been seen connecting from.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[non_exhaustive]
pub struct OnlineDevice {
    /// The user, if they were in the roster when we saw them.
    pub uid: Option<Uid>,
    /// The source address.
    pub ip: IpAddr,
}

/// The set of source addresses seen for each user since the last drain.
///
/// Users are identified by their engine-facing name (a
/// [`UserKey`](crate::UserKey) string).
#[derive(Debug, Default)]
pub struct OnlineDeviceTracker {
    /// Map from user name to the addresses we've seen them use.
    seen: HashMap<String, HashMap<IpAddr, Option<Uid>>>,
}

impl OnlineDeviceTracker {
    /// Return a new empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `user` has connected from `ip`.
    ///
    /// Return false if this would take the user over `device_limit`
    /// distinct addresses.  In that case `ip` is not recorded, so that a
    /// later attempt can succeed once another address has gone away.
    ///
    /// A `device_limit` of zero means no limit.
    pub fn record(&mut self, user: &str, ip: IpAddr, uid: Option<Uid>, device_limit: u32) -> bool {
        let ips = self.seen.entry(user.to_owned()).or_default();
        if ips.insert(ip, uid).is_some() {
            // Already known: no change in device count.
            return true;
        }
        if device_limit > 0 && ips.len() > device_limit as usize {
            ips.remove(&ip);
            return false;
        }
        true
    }

    /// Return the number of distinct addresses seen for `user`.
    pub fn count(&self, user: &str) -> usize {
        self.seen.get(user).map_or(0, HashMap::len)
    }

    /// Return true if nothing has been recorded since the last drain.
    pub fn is_empty(&self) -> bool {
        self.seen.values().all(HashMap::is_empty)
    }

    /// Return every address recorded so far, and forget them all.
    ///
    /// The result is sorted.
    pub fn drain(&mut self) -> Vec<OnlineDevice> {
        let mut out: Vec<OnlineDevice> = self
            .seen
            .drain()
            .flat_map(|(_, ips)| ips.into_iter())
            .map(|(ip, uid)| OnlineDevice { uid, ip })
            .collect();
        out.sort();
        out
    }
}
