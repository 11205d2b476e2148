//! The reconciler: keeps the engine and the limiter in step with the panel.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use futures::FutureExt as _;
use tor_rtcompat::{Runtime, SleepProviderExt as _};
use tracing::{debug, info};
use xnode_error::{error_report, internal, warn_report};
use xnode_limiter::{Limiter, UserKey, UserLimit};
use xnode_panel::{
    compile_rules, DetectRule, NodeDescriptor, OnlineRecord, RemoteSource, ServiceInfo,
    Security, TrafficRecord,
};

use crate::tasks::PeriodicTask;
use crate::{
    inbound_tag, plan_inbounds, ControllerConfig, EngineError, Error, Externals, InboundPlan,
    Result, RosterDiff,
};

/// Where a [`Controller`] is in its life.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub enum Phase {
    /// Created, not started.
    Idle,
    /// Fetching the initial configuration and bringing the node up.
    Bootstrapping,
    /// Serving, waiting for the next cycle.
    Steady,
    /// Running a node poll cycle.
    Reconciling,
    /// Stopped, or failed to start.
    Stopped,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "not started",
            Phase::Bootstrapping => "starting",
            Phase::Steady => "running",
            Phase::Reconciling => "reconciling",
            Phase::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// What a node poll cycle did.
#[derive(Debug, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum PollOutcome {
    /// Nothing: we are still in the startup grace period.
    Grace,
    /// The node and the roster are as they were.
    Unchanged,
    /// The node is unchanged; some users were added or removed.
    RosterUpdated {
        /// Entries added (including the new values of changed users).
        added: usize,
        /// Entries removed (including the old values of changed users).
        removed: usize,
    },
    /// The node changed: its inbounds were torn down and rebuilt.
    Rebuilt {
        /// The tag of the new inbound.
        tag: String,
    },
}

/// What a report cycle reported.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct ReportSummary {
    /// Users whose traffic the panel accepted.
    pub traffic_users: usize,
    /// Online addresses the panel accepted.
    pub online_addresses: usize,
    /// Online addresses of users missing from the roster, which we can't
    /// report.
    pub unknown_addresses: usize,
    /// Connections blocked by detection rules since the last cycle.
    pub detections: usize,
}

/// The inbounds we have standing in the engine.
#[derive(Debug, Clone)]
struct Wired {
    /// The tag of the inbound carrying the users.
    tag: String,
    /// The node the inbounds were built from.
    node: Arc<NodeDescriptor>,
    /// All the inbounds.
    plans: Vec<InboundPlan>,
}

/// The controller's picture of the world.
///
/// Only the node poll cycle changes it.
#[derive(Debug, Clone)]
struct Snapshot {
    /// The latest node descriptor we were given.
    node: Arc<NodeDescriptor>,
    /// The latest roster we were given.
    roster: Vec<ServiceInfo>,
    /// Rules that are always in force.
    local_rules: Vec<DetectRule>,
    /// Rules from the panel.
    remote_rules: Vec<DetectRule>,
    /// What is running in the engine, if anything.
    wired: Option<Wired>,
    /// When the node came up.
    started_at: Instant,
}

impl Snapshot {
    /// Return every rule that should be in force.
    fn rules(&self) -> Vec<DetectRule> {
        self.local_rules
            .iter()
            .chain(&self.remote_rules)
            .cloned()
            .collect()
    }
}

/// The limits of `s`, as the limiter wants them.
fn user_limit(s: &ServiceInfo) -> UserLimit {
    UserLimit::new(s.uid, s.email.clone(), s.device_limit, s.speed_limit)
}

/// Lock `m`, reporting poisoning as a bug.
fn lock<'a, T>(m: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    m.lock()
        .map_err(|_| internal!("controller {} lock poisoned", what).into())
}

/// Keeps one node in step with its management panel.
///
/// See the crate documentation for what the cycles do.
pub struct Controller<R: Runtime> {
    /// Our runtime.
    runtime: R,
    /// Intervals and the like.
    config: ControllerConfig,
    /// The panel.
    source: Arc<dyn RemoteSource>,
    /// The limiter admissions are checked against.
    limiter: Arc<Limiter>,
    /// The components we drive.
    ext: Externals,
    /// Our phase.
    phase: Mutex<Phase>,
    /// Our picture of the world, once bootstrapped.
    state: Mutex<Option<Snapshot>>,
    /// Our running periodic tasks.
    tasks: Mutex<Vec<PeriodicTask>>,
}

impl<R: Runtime> Controller<R> {
    /// Create a new controller.  It does nothing until started.
    pub fn new(
        runtime: R,
        config: ControllerConfig,
        source: Arc<dyn RemoteSource>,
        limiter: Arc<Limiter>,
        externals: Externals,
    ) -> Self {
        Controller {
            runtime,
            config,
            source,
            limiter,
            ext: externals,
            phase: Mutex::new(Phase::Idle),
            state: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Return our current phase.
    pub fn phase(&self) -> Result<Phase> {
        Ok(*lock(&self.phase, "phase")?)
    }

    /// Return the tag of the inbound carrying our users, if it is up.
    pub fn tag(&self) -> Result<Option<String>> {
        let state = lock(&self.state, "state")?;
        Ok(state
            .as_ref()
            .and_then(|s| s.wired.as_ref())
            .map(|w| w.tag.clone()))
    }

    /// Return the latest node descriptor, once bootstrapped.
    pub fn node(&self) -> Result<Option<Arc<NodeDescriptor>>> {
        let state = lock(&self.state, "state")?;
        Ok(state.as_ref().map(|s| Arc::clone(&s.node)))
    }

    /// Return the latest roster.
    pub fn roster(&self) -> Result<Vec<ServiceInfo>> {
        let state = lock(&self.state, "state")?;
        Ok(state.as_ref().map(|s| s.roster.clone()).unwrap_or_default())
    }

    /// Set our phase to `to`, if it is `from`.
    ///
    /// Return the phase we found.
    fn transition(&self, from: Phase, to: Phase) -> Result<Phase> {
        let mut phase = lock(&self.phase, "phase")?;
        let found = *phase;
        if found == from {
            *phase = to;
        }
        Ok(found)
    }

    /// Unconditionally set our phase.
    fn set_phase(&self, to: Phase) -> Result<()> {
        *lock(&self.phase, "phase")? = to;
        Ok(())
    }

    /// Return a copy of our picture of the world.
    fn snapshot(&self) -> Result<Snapshot> {
        lock(&self.state, "state")?
            .clone()
            .ok_or_else(|| internal!("controller has no state after bootstrap").into())
    }

    /// Replace our picture of the world.
    fn store(&self, snap: &Snapshot) -> Result<()> {
        *lock(&self.state, "state")? = Some(snap.clone());
        Ok(())
    }

    /// Return the prefix of our log lines about `node`.
    fn log_prefix(&self, node: &NodeDescriptor) -> String {
        let info = self.source.describe();
        format!(
            "[{}] {}(NodeID={})",
            info.api_host, node.node_type, node.node_id
        )
    }

    /// Fetch the node and the roster, and bring the node up.
    ///
    /// Any failure is fatal: the node is left down and the controller
    /// [`Stopped`](Phase::Stopped).
    pub async fn bootstrap(&self) -> Result<()> {
        let found = self.transition(Phase::Idle, Phase::Bootstrapping)?;
        if found != Phase::Idle {
            return Err(Error::WrongPhase(found));
        }
        match self.bootstrap_inner().await {
            Ok(()) => self.set_phase(Phase::Steady),
            Err(e) => {
                self.set_phase(Phase::Stopped)?;
                Err(e)
            }
        }
    }

    /// Body of [`bootstrap`](Self::bootstrap).
    async fn bootstrap_inner(&self) -> Result<()> {
        let node = self
            .source
            .fetch_node()
            .await
            .map_err(|e| Error::remote("fetch node", e))?
            .fresh()
            .ok_or_else(|| internal!("node not modified on first fetch"))?;
        let node = Arc::new(node);
        let prefix = self.log_prefix(&node);

        let roster = self
            .source
            .fetch_roster()
            .await
            .map_err(|e| Error::remote("fetch roster", e))?
            .fresh()
            .ok_or_else(|| internal!("roster not modified on first fetch"))?;

        let mut snap = Snapshot {
            remote_rules: compile_rules(&node.routes),
            local_rules: self.source.local_rules(),
            node,
            roster,
            wired: None,
            started_at: self.runtime.now(),
        };
        let wired = self.build(&snap.node, &snap.roster)?;
        let rules = snap.rules();
        if !rules.is_empty() {
            if let Err(e) = self.ext.rules.replace_rules(&wired.tag, rules) {
                self.teardown(&wired, &prefix)?;
                return Err(e.into());
            }
        }
        info!(
            "{} Serving {} on port {} with {} user(s)",
            prefix,
            wired.tag,
            snap.node.port,
            snap.roster.len()
        );
        snap.wired = Some(wired);
        self.store(&snap)
    }

    /// Bootstrap, then launch the periodic tasks.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.bootstrap().await?;
        let snap = self.snapshot()?;
        let prefix = self.log_prefix(&snap.node);

        let mut tasks = Vec::new();
        let c = Arc::clone(self);
        tasks.push(PeriodicTask::spawn(
            &self.runtime,
            "node poll",
            self.config.node_poll_interval(),
            move || {
                let c = Arc::clone(&c);
                async move {
                    match c.poll_node_once().await {
                        Ok(outcome) => debug!("Node poll: {:?}", outcome),
                        Err(e) => warn_report!(e, "Node poll cycle abandoned"),
                    }
                }
                .boxed()
            },
        )?);

        let c = Arc::clone(self);
        tasks.push(PeriodicTask::spawn(
            &self.runtime,
            "report",
            self.config.report_interval(),
            move || {
                let c = Arc::clone(&c);
                async move {
                    if let Err(e) = c.report_once().await {
                        warn_report!(e, "Report cycle abandoned");
                    }
                }
                .boxed()
            },
        )?);

        let managed_tls =
            matches!(snap.node.security, Security::Tls(_)) && snap.node.cert_mode.is_managed();
        if managed_tls && self.ext.cert.is_some() {
            let c = Arc::clone(self);
            tasks.push(PeriodicTask::spawn(
                &self.runtime,
                "certificate renewal",
                self.config.cert_renew_interval(),
                move || {
                    let c = Arc::clone(&c);
                    async move {
                        if let Err(e) = c.renew_cert_once().await {
                            warn_report!(e, "Certificate renewal failed");
                        }
                    }
                    .boxed()
                },
            )?);
        }

        let names: Vec<_> = tasks.iter().map(PeriodicTask::name).collect();
        lock(&self.tasks, "tasks")?.extend(tasks);
        info!("{} Task Scheduler started: {}", prefix, names.join(", "));
        Ok(())
    }

    /// Stand up the inbounds for `node` with `roster`, and activate the
    /// limiter for them.
    ///
    /// On failure, whatever was stood up is torn down again.
    fn build(&self, node: &Arc<NodeDescriptor>, roster: &[ServiceInfo]) -> Result<Wired> {
        let wired = Wired {
            tag: inbound_tag(node),
            node: Arc::clone(node),
            plans: plan_inbounds(node)?,
        };
        if let Err(e) = self.wire(&wired, roster) {
            // Some of these never got added; that's fine.
            let _ = self.teardown(&wired, &self.log_prefix(node));
            return Err(e);
        }
        Ok(wired)
    }

    /// Body of [`build`](Self::build).
    fn wire(&self, wired: &Wired, roster: &[ServiceInfo]) -> Result<()> {
        let engine = &self.ext.engine;
        for plan in &wired.plans {
            engine.add_inbound(plan)?;
            engine.add_outbound(plan)?;
            if plan.has_users() && !roster.is_empty() {
                engine.add_users(plan, roster)?;
            }
        }
        self.limiter
            .activate_tag(&wired.tag, wired.node.speed_limit, roster.iter().map(user_limit))?;
        Ok(())
    }

    /// Tear down everything `wired` stood up.
    ///
    /// Every step is attempted; the first failure is returned.
    fn teardown(&self, wired: &Wired, prefix: &str) -> Result<()> {
        let mut first_err: Option<Error> = None;
        let mut note = |r: Result<()>| {
            if let Err(e) = r {
                debug!("{} Teardown of {}: {}", prefix, wired.tag, e);
                first_err.get_or_insert(e);
            }
        };
        note(self.limiter.deactivate_tag(&wired.tag).map_err(Error::from));
        note(
            self.ext
                .rules
                .replace_rules(&wired.tag, Vec::new())
                .map_err(Error::from),
        );
        for plan in &wired.plans {
            note(self.ext.engine.remove_inbound(&plan.tag).map_err(Error::from));
            note(self.ext.engine.remove_outbound(&plan.tag).map_err(Error::from));
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Run one node poll cycle.
    ///
    /// Remote failures abandon the cycle, leaving everything as it was.
    pub async fn poll_node_once(&self) -> Result<PollOutcome> {
        let mut snap = self.snapshot()?;
        let found = self.transition(Phase::Steady, Phase::Reconciling)?;
        if found != Phase::Steady {
            return Err(Error::WrongPhase(found));
        }
        let since_start = self.runtime.now().saturating_duration_since(snap.started_at);
        let outcome = if since_start < self.config.startup_grace() {
            debug!("Skipping node poll during startup grace period");
            Ok(PollOutcome::Grace)
        } else {
            self.reconcile(&mut snap).await
        };
        self.transition(Phase::Reconciling, Phase::Steady)?;
        outcome
    }

    /// Body of [`poll_node_once`](Self::poll_node_once).
    async fn reconcile(&self, snap: &mut Snapshot) -> Result<PollOutcome> {
        if let Some(node) = self
            .source
            .fetch_node()
            .await
            .map_err(|e| Error::remote("fetch node", e))?
            .fresh()
        {
            if node != *snap.node {
                snap.node = Arc::new(node);
                // Keep it even if the rest of the cycle fails: the panel
                // won't send it again.
                self.store(snap)?;
            }
        }
        let prefix = self.log_prefix(&snap.node);

        let roster = self
            .source
            .fetch_roster()
            .await
            .map_err(|e| Error::remote("fetch roster", e))?
            .fresh()
            .unwrap_or_else(|| snap.roster.clone());

        let outcome = self.converge(snap, &roster, &prefix);
        snap.roster = roster;
        self.store(snap)?;
        let outcome = outcome?;

        self.refresh_rules(snap, &prefix).await;
        self.store(snap)?;
        Ok(outcome)
    }

    /// Make the engine and the limiter match `snap.node` and `roster`.
    fn converge(
        &self,
        snap: &mut Snapshot,
        roster: &[ServiceInfo],
        prefix: &str,
    ) -> Result<PollOutcome> {
        if let Some(wired) = &snap.wired {
            if wired.node == snap.node {
                let diff = RosterDiff::between(&snap.roster, roster);
                if diff.is_empty() {
                    return Ok(PollOutcome::Unchanged);
                }
                self.apply_diff(wired, &diff, prefix)?;
                return Ok(PollOutcome::RosterUpdated {
                    added: diff.added.len(),
                    removed: diff.removed.len(),
                });
            }
        }

        if let Some(old) = snap.wired.take() {
            info!("{} Node changed; replacing {}", prefix, old.tag);
            self.teardown(&old, prefix)?;
        }
        if !snap.node.routes.is_empty() {
            snap.remote_rules = compile_rules(&snap.node.routes);
        }
        let wired = self.build(&snap.node, roster)?;
        let rules = snap.rules();
        if !rules.is_empty() {
            if let Err(e) = self.ext.rules.replace_rules(&wired.tag, rules) {
                warn_report!(e, "{} Unable to apply detection rules", prefix);
            }
        }
        let tag = wired.tag.clone();
        info!("{} Rebuilt {} with {} user(s)", prefix, tag, roster.len());
        snap.wired = Some(wired);
        Ok(PollOutcome::Rebuilt { tag })
    }

    /// Apply a roster change to a node that is otherwise unchanged.
    fn apply_diff(&self, wired: &Wired, diff: &RosterDiff, prefix: &str) -> Result<()> {
        let tag = &wired.tag;
        let engine = &self.ext.engine;

        if !diff.removed.is_empty() {
            let keys: Vec<UserKey> = diff
                .removed
                .iter()
                .map(|s| UserKey::new(tag, &s.email, s.uid))
                .collect();
            match engine.remove_users(tag, &keys) {
                Ok(()) => info!("{} {} Service(s) deleted", prefix, keys.len()),
                Err(e) => warn_report!(e, "{} Unable to remove users", prefix),
            }
            // Changed users keep their key, and their gate.
            let readded: HashSet<UserKey> = diff
                .added
                .iter()
                .map(|s| UserKey::new(tag, &s.email, s.uid))
                .collect();
            let gone: Vec<UserKey> = keys.into_iter().filter(|k| !readded.contains(k)).collect();
            self.limiter.forget_users(tag, &gone)?;
        }

        if !diff.added.is_empty() {
            for plan in wired.plans.iter().filter(|p| p.has_users()) {
                match engine.add_users(plan, &diff.added) {
                    Ok(()) => info!("{} {} New Service(s) added", prefix, diff.added.len()),
                    Err(e) => warn_report!(e, "{} Unable to add users", prefix),
                }
            }
            self.limiter
                .apply_roster_delta(tag, diff.added.iter().map(user_limit))?;
        }
        Ok(())
    }

    /// Fetch the remote rules, and put them in force if they changed.
    ///
    /// Failures are logged: the rules in force stay as they are.
    async fn refresh_rules(&self, snap: &mut Snapshot, prefix: &str) {
        let fetched = match self.source.fetch_rules().await {
            Ok(fetched) => fetched.fresh(),
            Err(e) => {
                warn_report!(e, "{} Unable to fetch detection rules", prefix);
                return;
            }
        };
        let Some(remote) = fetched.filter(|r| !r.is_empty()) else {
            return;
        };
        snap.remote_rules = remote;
        let Some(wired) = &snap.wired else {
            return;
        };
        let rules = snap.rules();
        let n = rules.len();
        match self.ext.rules.replace_rules(&wired.tag, rules) {
            Ok(()) => info!("{} {} detection rule(s) in force", prefix, n),
            Err(e) => warn_report!(e, "{} Unable to apply detection rules", prefix),
        }
    }

    /// Run one report cycle.
    ///
    /// Traffic counters are only reset once the panel has accepted them.
    pub async fn report_once(&self) -> Result<ReportSummary> {
        let snap = self.snapshot()?;
        let mut summary = ReportSummary::default();
        let Some(wired) = &snap.wired else {
            debug!("Nothing to report: node is not up");
            return Ok(summary);
        };
        let prefix = self.log_prefix(&snap.node);
        let traffic = &self.ext.traffic;

        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        let mut records = Vec::new();
        for s in &snap.roster {
            let key = UserKey::new(&wired.tag, &s.email, s.uid);
            if !seen.insert(key.clone()) {
                continue;
            }
            let (upload, download) = traffic.read(&key);
            if upload > 0 || download > 0 {
                records.push(TrafficRecord::new(s.uid, upload, download));
                keys.push(key);
            }
        }
        if !records.is_empty() {
            match self.source.report_traffic(&records).await {
                Ok(()) => {
                    for key in &keys {
                        traffic.reset(key);
                    }
                    summary.traffic_users = records.len();
                    info!("{} Reported traffic of {} user(s)", prefix, records.len());
                }
                Err(e) => warn_report!(e, "{} Unable to report traffic", prefix),
            }
        }

        match self.limiter.drain_online_devices(&wired.tag) {
            Ok(devices) => {
                let online: Vec<OnlineRecord> = devices
                    .iter()
                    .filter_map(|d| d.uid.map(|uid| OnlineRecord::new(uid, d.ip)))
                    .collect();
                summary.unknown_addresses = devices.len() - online.len();
                if summary.unknown_addresses > 0 {
                    debug!(
                        "{} Not reporting {} online address(es) of unknown users",
                        prefix, summary.unknown_addresses
                    );
                }
                if !online.is_empty() {
                    match self.source.report_online(&online).await {
                        Ok(()) => {
                            summary.online_addresses = online.len();
                            info!("{} Reported {} online address(es)", prefix, online.len());
                        }
                        Err(e) => warn_report!(e, "{} Unable to report online users", prefix),
                    }
                }
            }
            Err(e) => warn_report!(e, "{} Unable to collect online users", prefix),
        }

        let hits = self.ext.rules.take_hits(&wired.tag);
        if !hits.is_empty() {
            info!(
                "{} blocked {} access by detection rules",
                prefix,
                hits.len()
            );
        }
        summary.detections = hits.len();
        Ok(summary)
    }

    /// Ask the certificate manager to renew our certificate.
    ///
    /// Return false if there is nothing to renew: no certificate manager,
    /// or a node without a managed TLS certificate.  A renewal that takes
    /// longer than the configured timeout is abandoned and reported as
    /// failed.
    pub async fn renew_cert_once(&self) -> Result<bool> {
        let Some(renewer) = &self.ext.cert else {
            return Ok(false);
        };
        let node = self.snapshot()?.node;
        if !node.cert_mode.is_managed() {
            return Ok(false);
        }
        let Some(domain) = self
            .config
            .cert_domain_override()
            .or_else(|| node.cert_domain())
        else {
            return Ok(false);
        };
        let limit = self.config.cert_renew_timeout();
        self.runtime
            .timeout(limit, renewer.renew(node.cert_mode, domain))
            .await
            .map_err(|_| {
                EngineError::new(
                    "certificate manager",
                    format!("renew the certificate of {}", domain),
                    format!("no answer within {}s", limit.as_secs()),
                )
            })??;
        info!(
            "{} Renewed certificate for {}",
            self.log_prefix(&node),
            domain
        );
        Ok(true)
    }

    /// Stop the periodic tasks, waiting for any cycle in progress.
    ///
    /// The node keeps serving with its last configuration.  If a task can't
    /// be cancelled, the others are still stopped and the first failure is
    /// returned.
    pub async fn stop(&self) -> Result<()> {
        let tasks = std::mem::take(&mut *lock(&self.tasks, "tasks")?);
        let mut result = Ok(());
        for task in tasks {
            let name = task.name();
            if let Err(e) = task.stop().await {
                error_report!(e, "Unable to stop the {} task", name);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        self.set_phase(Phase::Stopped)?;
        info!("Task Scheduler stopped");
        result
    }
}

impl<R: Runtime> fmt::Debug for Controller<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("config", &self.config)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}
