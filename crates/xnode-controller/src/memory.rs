//! In-memory implementations of the external components.
//!
//! These keep the state the controller gives them in tables, so that it
//! can be inspected.  They are what the binary runs in detached mode, and
//! what the tests drive the controller against.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use xnode_limiter::UserKey;
use xnode_panel::{DetectRule, ServiceInfo};

use crate::{DetectHit, EngineError, InboundPlan, ProxyEngine, RuleManager, TrafficStats};

/// How many operations a [`MemoryEngine`] keeps for [`take_ops`](MemoryEngine::take_ops).
pub const MAX_RECORDED_OPS: usize = 1024;

/// Lock `m`.
///
/// No critical section in this module can leave a table half-updated, so
/// a lock poisoned by a panic elsewhere is still safe to use.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Something the controller asked a [`MemoryEngine`] to do.
#[derive(Debug, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum EngineOp {
    /// An inbound was added.
    AddInbound(String),
    /// An inbound was removed.
    RemoveInbound(String),
    /// An outbound was added.
    AddOutbound(String),
    /// An outbound was removed.
    RemoveOutbound(String),
    /// Users were added to an inbound.
    AddUsers(String, Vec<UserKey>),
    /// Users were removed from an inbound.
    RemoveUsers(String, Vec<UserKey>),
}

/// The tables of a [`MemoryEngine`].
#[derive(Debug, Default)]
struct EngineTables {
    /// Inbounds, by tag.
    inbounds: BTreeMap<String, InboundPlan>,
    /// Outbound tags.
    outbounds: BTreeSet<String>,
    /// Users of each inbound.
    users: BTreeMap<String, BTreeSet<UserKey>>,
    /// The latest successful operations, oldest first.
    ops: VecDeque<EngineOp>,
    /// If true, refuse to add inbounds.
    refuse_inbounds: bool,
}

impl EngineTables {
    /// Record `op`, forgetting the oldest if there are too many.
    fn record(&mut self, op: EngineOp) {
        if self.ops.len() == MAX_RECORDED_OPS {
            self.ops.pop_front();
        }
        self.ops.push_back(op);
    }
}

/// A proxy engine that only remembers what it was told.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    /// The engine's state.
    tables: Mutex<EngineTables>,
}

/// Name of the in-memory engine in errors.
const ENGINE: &str = "memory engine";

impl MemoryEngine {
    /// Return a new empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the tables.
    fn tables(&self) -> MutexGuard<'_, EngineTables> {
        lock(&self.tables)
    }

    /// Return the tags of all inbounds.
    pub fn inbound_tags(&self) -> Vec<String> {
        self.tables().inbounds.keys().cloned().collect()
    }

    /// Return the inbound `tag`, if there is one.
    pub fn inbound(&self, tag: &str) -> Option<InboundPlan> {
        self.tables().inbounds.get(tag).cloned()
    }

    /// Return the tags of all outbounds.
    pub fn outbound_tags(&self) -> Vec<String> {
        self.tables().outbounds.iter().cloned().collect()
    }

    /// Return the users of the inbound `tag`, sorted.
    pub fn users(&self, tag: &str) -> Vec<UserKey> {
        self.tables()
            .users
            .get(tag)
            .map(|u| u.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Return the operations performed since the last call.
    ///
    /// Only the latest [`MAX_RECORDED_OPS`] are kept.
    pub fn take_ops(&self) -> Vec<EngineOp> {
        self.tables().ops.drain(..).collect()
    }

    /// Make every later [`add_inbound`](ProxyEngine::add_inbound) fail
    /// (or succeed again).
    pub fn refuse_inbounds(&self, refuse: bool) {
        self.tables().refuse_inbounds = refuse;
    }
}

impl ProxyEngine for MemoryEngine {
    fn add_inbound(&self, plan: &InboundPlan) -> Result<(), EngineError> {
        let action = || format!("add inbound {}", plan.tag);
        let mut t = self.tables();
        if t.refuse_inbounds {
            return Err(EngineError::new(ENGINE, action(), "refused"));
        }
        if t.inbounds.contains_key(&plan.tag) {
            return Err(EngineError::new(ENGINE, action(), "tag already in use"));
        }
        t.inbounds.insert(plan.tag.clone(), plan.clone());
        t.users.insert(plan.tag.clone(), BTreeSet::new());
        t.record(EngineOp::AddInbound(plan.tag.clone()));
        Ok(())
    }

    fn remove_inbound(&self, tag: &str) -> Result<(), EngineError> {
        let mut t = self.tables();
        if t.inbounds.remove(tag).is_none() {
            return Err(EngineError::new(
                ENGINE,
                format!("remove inbound {}", tag),
                "no such inbound",
            ));
        }
        t.users.remove(tag);
        t.record(EngineOp::RemoveInbound(tag.to_owned()));
        Ok(())
    }

    fn add_outbound(&self, plan: &InboundPlan) -> Result<(), EngineError> {
        let mut t = self.tables();
        if !t.outbounds.insert(plan.tag.clone()) {
            return Err(EngineError::new(
                ENGINE,
                format!("add outbound {}", plan.tag),
                "tag already in use",
            ));
        }
        t.record(EngineOp::AddOutbound(plan.tag.clone()));
        Ok(())
    }

    fn remove_outbound(&self, tag: &str) -> Result<(), EngineError> {
        let mut t = self.tables();
        if !t.outbounds.remove(tag) {
            return Err(EngineError::new(
                ENGINE,
                format!("remove outbound {}", tag),
                "no such outbound",
            ));
        }
        t.record(EngineOp::RemoveOutbound(tag.to_owned()));
        Ok(())
    }

    fn add_users(&self, plan: &InboundPlan, users: &[ServiceInfo]) -> Result<(), EngineError> {
        let mut t = self.tables();
        let keys: Vec<UserKey> = users
            .iter()
            .map(|u| UserKey::new(&plan.tag, &u.email, u.uid))
            .collect();
        let Some(existing) = t.users.get_mut(&plan.tag) else {
            return Err(EngineError::new(
                ENGINE,
                format!("add users to {}", plan.tag),
                "no such inbound",
            ));
        };
        existing.extend(keys.iter().cloned());
        t.record(EngineOp::AddUsers(plan.tag.clone(), keys));
        Ok(())
    }

    fn remove_users(&self, tag: &str, users: &[UserKey]) -> Result<(), EngineError> {
        let mut t = self.tables();
        let Some(existing) = t.users.get_mut(tag) else {
            return Err(EngineError::new(
                ENGINE,
                format!("remove users from {}", tag),
                "no such inbound",
            ));
        };
        for u in users {
            existing.remove(u);
        }
        t.record(EngineOp::RemoveUsers(tag.to_owned(), users.to_vec()));
        Ok(())
    }
}

/// Per-user traffic counters kept in memory.
#[derive(Debug, Default)]
pub struct MemoryTraffic {
    /// Upload and download, by user.
    counters: Mutex<HashMap<UserKey, (u64, u64)>>,
}

impl MemoryTraffic {
    /// Return a new set of counters, all zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count `upload` and `download` more bytes for `user`.
    pub fn record(&self, user: &UserKey, upload: u64, download: u64) {
        let mut counters = lock(&self.counters);
        let (up, down) = counters.entry(user.clone()).or_default();
        *up = up.saturating_add(upload);
        *down = down.saturating_add(download);
    }
}

impl TrafficStats for MemoryTraffic {
    fn read(&self, user: &UserKey) -> (u64, u64) {
        let counters = lock(&self.counters);
        counters.get(user).copied().unwrap_or_default()
    }

    fn reset(&self, user: &UserKey) {
        lock(&self.counters).remove(user);
    }
}

/// The tables of a [`MemoryRules`].
#[derive(Debug, Default)]
struct RuleTables {
    /// Rules in force, by tag.
    rules: HashMap<String, Vec<DetectRule>>,
    /// Blocked connections not yet taken, by tag.
    hits: HashMap<String, Vec<DetectHit>>,
}

/// A rule matcher working on destinations it is handed.
#[derive(Debug, Default)]
pub struct MemoryRules {
    /// The matcher's state.
    tables: Mutex<RuleTables>,
}

impl MemoryRules {
    /// Return a new matcher with no rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the rules in force on `tag`.
    pub fn rules(&self, tag: &str) -> Vec<DetectRule> {
        let t = lock(&self.tables);
        t.rules.get(tag).cloned().unwrap_or_default()
    }

    /// Check a connection by `user` on `tag` to `destination`.
    ///
    /// Return true, and record a hit, if some rule blocks it.
    pub fn check(&self, tag: &str, user: &str, destination: &str) -> bool {
        let mut t = lock(&self.tables);
        let Some(rule) = t
            .rules
            .get(tag)
            .and_then(|rules| rules.iter().find(|r| r.is_match(destination)))
        else {
            return false;
        };
        let hit = DetectHit::new(user, rule.id(), destination);
        t.hits.entry(tag.to_owned()).or_default().push(hit);
        true
    }
}

impl RuleManager for MemoryRules {
    fn replace_rules(&self, tag: &str, rules: Vec<DetectRule>) -> Result<(), EngineError> {
        let mut t = lock(&self.tables);
        if rules.is_empty() {
            t.rules.remove(tag);
        } else {
            t.rules.insert(tag.to_owned(), rules);
        }
        Ok(())
    }

    fn take_hits(&self, tag: &str) -> Vec<DetectHit> {
        let mut t = lock(&self.tables);
        t.hits.remove(tag).unwrap_or_default()
    }
}
