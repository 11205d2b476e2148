//! Limit state of one inbound tag.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use tracing::trace;
use xnode_bw_ratelim::{RateGate, TrafficRateLimit};

use crate::limiter::Admission;
use crate::{compose_limit, OnlineDevice, OnlineDeviceTracker, UserKey, UserLimit};

/// Everything the limiter knows about one inbound tag.
///
/// Invariant: `buckets` only holds gates whose composed limit is non-zero.
/// Admission also gives users missing from `users` a gate at the node
/// limit; those gates are dropped by the next delta or forget.
#[derive(Debug)]
pub(crate) struct InboundLimitState {
    /// Speed limit applying to every user of this inbound, in bytes/s.
    node_speed_limit: u64,
    /// Static limits, keyed by engine-facing user name.
    users: HashMap<UserKey, UserLimit>,
    /// Live gates, created on first admission.
    buckets: HashMap<UserKey, Arc<RateGate>>,
    /// Addresses seen since the last drain.
    online: OnlineDeviceTracker,
}

impl InboundLimitState {
    /// Create the state for `tag` with a full roster.
    pub(crate) fn new(tag: &str, node_speed_limit: u64, users: impl IntoIterator<Item = UserLimit>) -> Self {
        let users = users.into_iter().map(|u| (u.key(tag), u)).collect();
        InboundLimitState {
            node_speed_limit,
            users,
            buckets: HashMap::new(),
            online: OnlineDeviceTracker::new(),
        }
    }

    /// Decide whether `user` may connect from `ip`.
    pub(crate) fn admit(&mut self, user: &str, ip: IpAddr) -> Admission {
        let (uid, device_limit, speed_limit) = match self.users.get(user) {
            Some(u) => (Some(u.uid), u.device_limit, u.speed_limit),
            None => (None, 0, 0),
        };

        if !self.online.record(user, ip, uid, device_limit) {
            trace!("{}: rejecting {}: device limit {} reached", user, ip, device_limit);
            return Admission::Rejected;
        }

        let effective = compose_limit(self.node_speed_limit, speed_limit);
        if effective == 0 {
            return Admission::Unlimited;
        }
        if let Some(gate) = self.buckets.get(user) {
            return Admission::Limited(Arc::clone(gate));
        }
        let gate = Arc::new(RateGate::new(TrafficRateLimit::per_second(effective)));
        self.buckets
            .insert(UserKey::from(user.to_owned()), Arc::clone(&gate));
        Admission::Limited(gate)
    }

    /// Upsert `users`, adjusting any live gates in place.
    pub(crate) fn apply_delta(&mut self, tag: &str, users: impl IntoIterator<Item = UserLimit>, now: Instant) {
        for user in users {
            let key = user.key(tag);
            let effective = compose_limit(self.node_speed_limit, user.speed_limit);
            if effective == 0 {
                self.buckets.remove(&key);
            } else if let Some(gate) = self.buckets.get(&key) {
                let limit = TrafficRateLimit::per_second(effective);
                if gate.limit() != limit {
                    gate.reconfigure(limit, now);
                }
            }
            self.users.insert(key, user);
        }
        self.drop_stray_gates();
    }

    /// Forget `keys` entirely: limits and gates.
    pub(crate) fn forget(&mut self, keys: &[UserKey]) {
        for key in keys {
            self.users.remove(key);
            self.buckets.remove(key);
        }
        self.drop_stray_gates();
    }

    /// Drop the gates of users we have no limits for.
    fn drop_stray_gates(&mut self) {
        let users = &self.users;
        let before = self.buckets.len();
        self.buckets.retain(|key, _| users.contains_key(key));
        let dropped = before - self.buckets.len();
        if dropped > 0 {
            trace!("dropped {} gate(s) of unknown users", dropped);
        }
    }

    /// Return the live gate of `user`, if there is one.
    pub(crate) fn bucket(&self, user: &str) -> Option<Arc<RateGate>> {
        self.buckets.get(user).cloned()
    }

    /// Return the number of users with limits on this inbound.
    pub(crate) fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Drain the addresses seen since the last drain.
    pub(crate) fn drain_online(&mut self) -> Vec<OnlineDevice> {
        self.online.drain()
    }
}
