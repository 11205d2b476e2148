//! The table of per-inbound limit states.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tor_rtcompat::{DynTimeProvider, Runtime, SleepProvider as _};
use tracing::debug;
use xnode_bw_ratelim::RateGate;
use xnode_error::internal;

use crate::state::InboundLimitState;
use crate::{Error, OnlineDevice, Result, UserKey, UserLimit};

/// The outcome of an admission check.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Admission {
    /// Let the connection through without metering.
    Unlimited,
    /// Meter the connection through this gate.
    ///
    /// Every connection of the same user on the same inbound gets the
    /// same gate.
    Limited(Arc<RateGate>),
    /// Refuse the connection: the user is over their device limit.
    Rejected,
}

impl Admission {
    /// Return true if the connection should be refused.
    pub fn is_rejected(&self) -> bool {
        matches!(self, Admission::Rejected)
    }

    /// Return the gate to meter the connection through, if any.
    pub fn gate(&self) -> Option<&Arc<RateGate>> {
        match self {
            Admission::Limited(gate) => Some(gate),
            _ => None,
        }
    }
}

/// One entry in the table of tags.
///
/// `None` once the tag has been torn down: an admission that found this
/// slot before teardown sees an inactive tag, never a half-removed one.
type Slot = Arc<Mutex<Option<InboundLimitState>>>;

/// Speed and device limits for every active inbound tag.
///
/// This is shared between the reconciler, which activates tags and updates
/// rosters, and the proxy engine, which calls [`admit`](Limiter::admit) for
/// every connection.
pub struct Limiter {
    /// Clock used when reconfiguring gates.
    time: DynTimeProvider,
    /// Map from inbound tag to its state.
    inbounds: RwLock<HashMap<String, Slot>>,
}

impl Limiter {
    /// Create a new `Limiter` with no active tags.
    pub fn new<R: Runtime>(runtime: R) -> Self {
        Limiter {
            time: DynTimeProvider::new(runtime),
            inbounds: RwLock::new(HashMap::new()),
        }
    }

    /// Return the slot for `tag`, if it is active.
    fn slot(&self, tag: &str) -> Result<Option<Slot>> {
        let inbounds = self
            .inbounds
            .read()
            .map_err(|_| internal!("limiter table poisoned"))?;
        Ok(inbounds.get(tag).cloned())
    }

    /// Lock `slot`.
    fn lock(slot: &Slot) -> Result<MutexGuard<'_, Option<InboundLimitState>>> {
        Ok(slot
            .lock()
            .map_err(|_| internal!("inbound limit state poisoned"))?)
    }

    /// Run `f` on the state of `tag`, or fail if the tag is not active.
    fn with_state<T>(&self, tag: &str, f: impl FnOnce(&mut InboundLimitState) -> T) -> Result<T> {
        let not_active = || Error::TagNotActive { tag: tag.to_owned() };
        let slot = self.slot(tag)?.ok_or_else(not_active)?;
        let mut guard = Self::lock(&slot)?;
        let state = guard.as_mut().ok_or_else(not_active)?;
        Ok(f(state))
    }

    /// Decide whether `user` may open a connection from `ip` on `tag`.
    ///
    /// `user` is the engine-facing user name, `tag|email|uid`.  Users we
    /// don't know about are admitted without limits.  If `tag` isn't
    /// active, the connection is admitted unmetered.
    pub fn admit(&self, tag: &str, user: &str, ip: IpAddr) -> Result<Admission> {
        let Some(slot) = self.slot(tag)? else {
            debug!("No limiter for tag {:?}", tag);
            return Ok(Admission::Unlimited);
        };
        let mut guard = Self::lock(&slot)?;
        let Some(state) = guard.as_mut() else {
            debug!("No limiter for tag {:?}", tag);
            return Ok(Admission::Unlimited);
        };
        Ok(state.admit(user, ip))
    }

    /// Install a fresh state for `tag`, replacing any existing one.
    pub fn activate_tag(
        &self,
        tag: &str,
        node_speed_limit: u64,
        users: impl IntoIterator<Item = UserLimit>,
    ) -> Result<()> {
        let state = InboundLimitState::new(tag, node_speed_limit, users);
        debug!(
            "Activating limiter for {:?}: node limit {} bytes/s, {} users",
            tag,
            node_speed_limit,
            state.user_count()
        );
        let mut inbounds = self
            .inbounds
            .write()
            .map_err(|_| internal!("limiter table poisoned"))?;
        if let Some(slot) = inbounds.get(tag) {
            *Self::lock(slot)? = Some(state);
        } else {
            inbounds.insert(tag.to_owned(), Arc::new(Mutex::new(Some(state))));
        }
        Ok(())
    }

    /// Add or update `users` on `tag`.
    ///
    /// Live gates are reconfigured in place when a user's effective limit
    /// changes, and dropped when it becomes unlimited.  Gates handed to
    /// users that `tag` has no limits for are dropped as well.
    pub fn apply_roster_delta(
        &self,
        tag: &str,
        users: impl IntoIterator<Item = UserLimit>,
    ) -> Result<()> {
        let now = self.time.now();
        self.with_state(tag, |state| state.apply_delta(tag, users, now))
    }

    /// Remove the users `keys` from `tag`, together with their gates.
    pub fn forget_users(&self, tag: &str, keys: &[UserKey]) -> Result<()> {
        self.with_state(tag, |state| state.forget(keys))
    }

    /// Remove all state for `tag`.
    ///
    /// Does nothing if the tag isn't active.
    pub fn deactivate_tag(&self, tag: &str) -> Result<()> {
        let mut inbounds = self
            .inbounds
            .write()
            .map_err(|_| internal!("limiter table poisoned"))?;
        if let Some(slot) = inbounds.remove(tag) {
            *Self::lock(&slot)? = None;
            debug!("Deactivated limiter for {:?}", tag);
        }
        Ok(())
    }

    /// Return every address seen on `tag` since the last call, and forget
    /// them.
    ///
    /// Limits and gates are unaffected.
    pub fn drain_online_devices(&self, tag: &str) -> Result<Vec<OnlineDevice>> {
        self.with_state(tag, InboundLimitState::drain_online)
    }

    /// Return the live gate for `user` on `tag`, if there is one.
    pub fn bucket(&self, tag: &str, user: &str) -> Result<Option<Arc<RateGate>>> {
        self.with_state(tag, |state| state.bucket(user))
    }

    /// Return true if `tag` is active.
    pub fn is_active(&self, tag: &str) -> Result<bool> {
        Ok(self.slot(tag)?.is_some())
    }
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list @@ -->
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::Barrier;
    use tor_rtmock::MockRuntime;
    use tracing_test::traced_test;
    use xnode_error::{ErrorKind, HasKind as _};

    const TAG: &str = "Vless_443_7";

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([192, 0, 2, last])
    }

    fn limiter() -> Limiter {
        Limiter::new(MockRuntime::new())
    }

    fn alice(device_limit: u32, speed_limit: u64) -> UserLimit {
        UserLimit::new(1, "alice", device_limit, speed_limit)
    }

    fn alice_key() -> String {
        alice(0, 0).key(TAG).to_string()
    }

    #[test]
    #[traced_test]
    fn unknown_tag_is_unlimited() {
        let l = limiter();
        assert_matches!(l.admit("nope", "x", ip(1)).unwrap(), Admission::Unlimited);
        assert!(logs_contain("No limiter for tag \"nope\""));
    }

    #[test]
    fn unknown_user_is_unlimited() {
        let l = limiter();
        l.activate_tag(TAG, 0, vec![alice(1, 0)]).unwrap();
        assert_matches!(l.admit(TAG, "stranger", ip(1)).unwrap(), Admission::Unlimited);
    }

    #[test]
    fn unknown_user_gets_node_limit() {
        let l = limiter();
        l.activate_tag(TAG, 1000, vec![]).unwrap();
        let a = l.admit(TAG, "stranger", ip(1)).unwrap();
        assert_eq!(a.gate().unwrap().limit().bytes_per_sec(), 1000);
    }

    #[test]
    fn device_limit_enforced() {
        let l = limiter();
        l.activate_tag(TAG, 0, vec![alice(2, 0)]).unwrap();
        let k = alice_key();
        assert!(!l.admit(TAG, &k, ip(1)).unwrap().is_rejected());
        assert!(!l.admit(TAG, &k, ip(2)).unwrap().is_rejected());
        assert!(l.admit(TAG, &k, ip(3)).unwrap().is_rejected());
        // Known addresses keep working.
        assert!(!l.admit(TAG, &k, ip(1)).unwrap().is_rejected());

        // After the cycle's drain, the rejected address gets its chance.
        let drained = l.drain_online_devices(TAG).unwrap();
        assert_eq!(drained.len(), 2);
        assert!(drained.iter().all(|d| d.uid == Some(1)));
        assert!(!l.admit(TAG, &k, ip(3)).unwrap().is_rejected());
    }

    #[test]
    fn drain_twice() {
        let l = limiter();
        l.activate_tag(TAG, 0, vec![alice(0, 0)]).unwrap();
        let k = alice_key();
        l.admit(TAG, &k, ip(1)).unwrap();
        l.admit(TAG, &k, ip(2)).unwrap();
        l.admit(TAG, "stranger", ip(3)).unwrap();
        let drained = l.drain_online_devices(TAG).unwrap();
        assert_eq!(
            drained,
            vec![
                OnlineDevice { uid: None, ip: ip(3) },
                OnlineDevice { uid: Some(1), ip: ip(1) },
                OnlineDevice { uid: Some(1), ip: ip(2) },
            ]
        );
        assert!(l.drain_online_devices(TAG).unwrap().is_empty());
    }

    #[test]
    fn drain_keeps_buckets() {
        let l = limiter();
        l.activate_tag(TAG, 0, vec![alice(0, 500)]).unwrap();
        let k = alice_key();
        let g1 = l.admit(TAG, &k, ip(1)).unwrap().gate().cloned().unwrap();
        l.drain_online_devices(TAG).unwrap();
        let g2 = l.bucket(TAG, &k).unwrap().unwrap();
        assert!(Arc::ptr_eq(&g1, &g2));
    }

    #[test]
    fn shared_gate_per_user() {
        let l = limiter();
        l.activate_tag(TAG, 0, vec![alice(0, 1000)]).unwrap();
        let k = alice_key();
        let g1 = l.admit(TAG, &k, ip(1)).unwrap().gate().cloned().unwrap();
        let g2 = l.admit(TAG, &k, ip(2)).unwrap().gate().cloned().unwrap();
        assert!(Arc::ptr_eq(&g1, &g2));
        assert_eq!(g1.limit().bytes_per_sec(), 1000);
        assert_eq!(g1.limit().max_burst(), 1000);
    }

    #[test]
    fn concurrent_first_admission() {
        const N: usize = 16;
        let l = Arc::new(limiter());
        l.activate_tag(TAG, 0, vec![alice(0, 1000)]).unwrap();
        let barrier = Arc::new(Barrier::new(N));
        let handles: Vec<_> = (0..N)
            .map(|i| {
                let l = Arc::clone(&l);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    l.admit(TAG, &alice_key(), ip(i as u8)).unwrap().gate().cloned().unwrap()
                })
            })
            .collect();
        let gates: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(gates.iter().all(|g| Arc::ptr_eq(g, &gates[0])));
    }

    #[test]
    fn concurrent_device_limit() {
        const N: usize = 16;
        let l = Arc::new(limiter());
        l.activate_tag(TAG, 0, vec![alice(3, 0)]).unwrap();
        let barrier = Arc::new(Barrier::new(N));
        let handles: Vec<_> = (0..N)
            .map(|i| {
                let l = Arc::clone(&l);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    l.admit(TAG, &alice_key(), ip(i as u8)).unwrap().is_rejected()
                })
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|rejected| !rejected)
            .count();
        assert_eq!(admitted, 3);
    }

    #[test]
    fn delta_idempotent() {
        let l = limiter();
        l.activate_tag(TAG, 0, vec![alice(0, 1000)]).unwrap();
        let k = alice_key();
        let g1 = l.admit(TAG, &k, ip(1)).unwrap().gate().cloned().unwrap();
        l.apply_roster_delta(TAG, vec![alice(0, 1000)]).unwrap();
        l.apply_roster_delta(TAG, vec![alice(0, 1000)]).unwrap();
        let g2 = l.bucket(TAG, &k).unwrap().unwrap();
        assert!(Arc::ptr_eq(&g1, &g2));
        assert_eq!(g2.limit().bytes_per_sec(), 1000);
    }

    #[test]
    fn delta_to_unlimited_drops_gate() {
        let l = limiter();
        l.activate_tag(TAG, 0, vec![alice(0, 1000)]).unwrap();
        let k = alice_key();
        l.admit(TAG, &k, ip(1)).unwrap();
        assert!(l.bucket(TAG, &k).unwrap().is_some());
        l.apply_roster_delta(TAG, vec![alice(0, 0)]).unwrap();
        assert!(l.bucket(TAG, &k).unwrap().is_none());
        assert_matches!(l.admit(TAG, &k, ip(1)).unwrap(), Admission::Unlimited);
    }

    #[test]
    fn delta_on_inactive_tag() {
        let l = limiter();
        let e = l.apply_roster_delta(TAG, vec![alice(0, 0)]).unwrap_err();
        assert_matches!(&e, Error::TagNotActive { tag } if tag == TAG);
        assert_eq!(e.kind(), ErrorKind::TagNotActive);
        assert_matches!(l.drain_online_devices(TAG), Err(Error::TagNotActive { .. }));
        assert_matches!(l.forget_users(TAG, &[]), Err(Error::TagNotActive { .. }));
    }

    #[test]
    fn forget_drops_gate_and_limits() {
        let l = limiter();
        l.activate_tag(TAG, 0, vec![alice(1, 1000)]).unwrap();
        let k = alice_key();
        l.admit(TAG, &k, ip(1)).unwrap();
        l.forget_users(TAG, &[alice(1, 1000).key(TAG)]).unwrap();
        assert!(l.bucket(TAG, &k).unwrap().is_none());
        // No longer known: no device limit, no speed limit.
        assert_matches!(l.admit(TAG, &k, ip(2)).unwrap(), Admission::Unlimited);
    }

    #[test]
    fn delta_drops_gates_of_unknown_users() {
        let l = limiter();
        let bob = UserLimit::new(2, "bob", 0, 500);
        l.activate_tag(TAG, 1000, vec![alice(0, 0), bob.clone()]).unwrap();
        let k = alice_key();
        let bob_key = bob.key(TAG).to_string();
        let bob_gate = l.admit(TAG, &bob_key, ip(9)).unwrap().gate().cloned().unwrap();

        l.forget_users(TAG, &[alice(0, 0).key(TAG)]).unwrap();
        // Still connected: admitted at the node limit.
        let g = l.admit(TAG, &k, ip(1)).unwrap().gate().cloned().unwrap();
        assert_eq!(g.limit().bytes_per_sec(), 1000);
        let strangers: Vec<String> = (0..100).map(|i| format!("{}|nobody{}|0", TAG, i)).collect();
        for s in &strangers {
            assert!(l.admit(TAG, s, ip(2)).unwrap().gate().is_some());
        }
        l.drain_online_devices(TAG).unwrap();

        l.apply_roster_delta(TAG, Vec::<UserLimit>::new()).unwrap();
        assert!(l.bucket(TAG, &k).unwrap().is_none());
        assert!(strangers.iter().all(|s| l.bucket(TAG, s).unwrap().is_none()));
        let kept = l.bucket(TAG, &bob_key).unwrap().unwrap();
        assert!(Arc::ptr_eq(&kept, &bob_gate));
    }

    #[test]
    fn forget_drops_gates_of_unknown_users() {
        let l = limiter();
        l.activate_tag(TAG, 1000, vec![alice(0, 0)]).unwrap();
        let stranger = format!("{}|nobody|0", TAG);
        l.admit(TAG, &stranger, ip(1)).unwrap();
        assert!(l.bucket(TAG, &stranger).unwrap().is_some());
        l.forget_users(TAG, &[]).unwrap();
        assert!(l.bucket(TAG, &stranger).unwrap().is_none());
    }

    #[test]
    fn activate_replaces() {
        let l = limiter();
        l.activate_tag(TAG, 0, vec![alice(0, 1000)]).unwrap();
        let k = alice_key();
        let g1 = l.admit(TAG, &k, ip(1)).unwrap().gate().cloned().unwrap();
        l.activate_tag(TAG, 0, vec![alice(0, 1000)]).unwrap();
        assert!(l.bucket(TAG, &k).unwrap().is_none());
        let g2 = l.admit(TAG, &k, ip(1)).unwrap().gate().cloned().unwrap();
        assert!(!Arc::ptr_eq(&g1, &g2));
    }

    #[test]
    fn deactivate_idempotent() {
        let l = limiter();
        l.activate_tag(TAG, 0, vec![alice(1, 0)]).unwrap();
        assert!(l.is_active(TAG).unwrap());
        l.deactivate_tag(TAG).unwrap();
        l.deactivate_tag(TAG).unwrap();
        assert!(!l.is_active(TAG).unwrap());
        assert_matches!(l.admit(TAG, &alice_key(), ip(1)).unwrap(), Admission::Unlimited);
    }

    #[test]
    fn end_to_end_node_then_user_limit() {
        let l = limiter();
        l.activate_tag(TAG, 10_000_000, vec![alice(0, 0)]).unwrap();
        let k = alice_key();
        let g1 = l.admit(TAG, &k, ip(1)).unwrap().gate().cloned().unwrap();
        assert_eq!(g1.limit().bytes_per_sec(), 10_000_000);
        assert_eq!(g1.limit().max_burst(), 10_000_000);

        l.apply_roster_delta(TAG, vec![alice(0, 5_000_000)]).unwrap();
        let g2 = l.admit(TAG, &k, ip(1)).unwrap().gate().cloned().unwrap();
        assert!(Arc::ptr_eq(&g1, &g2));
        assert_eq!(g2.limit().bytes_per_sec(), 5_000_000);
    }
}
