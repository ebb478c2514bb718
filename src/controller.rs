//! The reconciliation loop.
//!
//! One cycle: collect desired endpoints from every source, resolve conflicts,
//! then for every zone read the current records through its registry, plan,
//! narrow the plan by policy and (when leading) apply it. Zones are isolated
//! from each other: a failing or hanging zone is reported and skipped, the
//! rest of the cycle carries on, and the next cycle simply recomputes the
//! diff.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use serde::Serialize;
use tokio::{
    sync::{broadcast, Semaphore},
    task::JoinSet,
    time::Instant,
};
use tracing::{debug, error, info, warn};

use crate::{
    conflict::ConflictResolver,
    endpoint::{normalize_dns_name, Changes, Endpoint},
    leader::Leadership,
    plan::Plan,
    policy::Policy,
    registry::Registry,
    source::Source,
};

/// How often the loop wakes up to check the schedule.
const TICK: Duration = Duration::from_secs(1);

/// A change notification never delays a run by more than this.
const EVENT_BATCH_WINDOW: Duration = Duration::from_secs(5);

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub plan: Plan,
    pub policy: Policy,
    pub resolver: ConflictResolver,
    /// Time between two scheduled cycles.
    pub interval: Duration,
    /// Minimum spacing between cycles started by change notifications.
    pub min_event_sync_interval: Duration,
    /// Upper bound for one source query and for one zone's pipeline.
    pub call_timeout: Duration,
    /// Maximum sources or zones worked on at once.
    pub concurrency: usize,
    /// Plan and log, never write.
    pub dry_run: bool,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            plan: Plan::default(),
            policy: Policy::Sync,
            resolver: ConflictResolver::default(),
            interval: Duration::from_secs(60),
            min_event_sync_interval: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
            concurrency: 4,
            dry_run: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reports & events
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum ZoneOutcome {
    NoChanges,
    Applied,
    DryRun,
    NotLeader,
    ReadFailed { error: String },
    WriteFailed { error: String },
    TimedOut,
}

impl ZoneOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ZoneOutcome::ReadFailed { .. } | ZoneOutcome::WriteFailed { .. } | ZoneOutcome::TimedOut
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ZoneReport {
    pub zone: String,
    pub outcome: ZoneOutcome,
    pub changes: Changes,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub leader: bool,
    pub desired: usize,
    pub source_errors: Vec<String>,
    pub zones: Vec<ZoneReport>,
    pub duration_ms: u64,
}

impl CycleReport {
    pub fn zone(&self, name: &str) -> Option<&ZoneReport> {
        self.zones.iter().find(|z| z.zone == name)
    }

    pub fn is_clean(&self) -> bool {
        self.source_errors.is_empty() && !self.zones.iter().any(|z| z.outcome.is_failure())
    }
}

/// Emitted while a cycle runs, for dry-run tooling and logging consumers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum CycleEvent {
    CycleStarted { cycle: u64 },
    ZonePlanned { cycle: u64, zone: String, changes: Changes },
    ZoneFailed { cycle: u64, zone: String, error: String },
    CycleFinished { cycle: u64, clean: bool },
}

// ─────────────────────────────────────────────────────────────────────────────
// Scheduler
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct ScheduleState {
    next_run_at: Instant,
    last_run_at: Option<Instant>,
}

/// Decides when the next cycle starts. Scheduled runs happen every
/// `interval`; change notifications pull the next run forward, but never
/// closer than `min_event_sync_interval` after the previous run.
#[derive(Debug)]
pub struct Scheduler {
    interval: Duration,
    min_event_sync_interval: Duration,
    state: Mutex<ScheduleState>,
}

impl Scheduler {
    pub fn new(interval: Duration, min_event_sync_interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            min_event_sync_interval,
            state: Mutex::new(ScheduleState {
                next_run_at: now,
                last_run_at: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScheduleState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A change notification arrived.
    pub fn schedule_run(&self, now: Instant) {
        let mut state = self.lock();
        let soonest = (now + EVENT_BATCH_WINDOW).min(state.next_run_at);
        state.next_run_at = match state.last_run_at {
            Some(last) => soonest.max(last + self.min_event_sync_interval),
            None => soonest,
        };
    }

    /// `true` when a cycle should start now; books the following one.
    pub fn should_run(&self, now: Instant) -> bool {
        let mut state = self.lock();
        if now < state.next_run_at {
            return false;
        }
        state.next_run_at = now + self.interval;
        state.last_run_at = Some(now);
        true
    }

    pub fn next_run_at(&self) -> Instant {
        self.lock().next_run_at
    }
}

/// Handle for informers or the ops endpoint to request an early cycle.
#[derive(Clone)]
pub struct TriggerHandle {
    scheduler: Arc<Scheduler>,
}

impl TriggerHandle {
    pub fn trigger(&self) {
        debug!("change notification received; scheduling reconcile");
        self.scheduler.schedule_run(Instant::now());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Controller
// ─────────────────────────────────────────────────────────────────────────────

struct Zone {
    name: String,
    registry: Arc<dyn Registry>,
    /// Serializes read → plan → write for this zone across overlapping cycles.
    lock: tokio::sync::Mutex<()>,
}

struct Inner {
    sources: Vec<Arc<dyn Source>>,
    zones: Vec<Arc<Zone>>,
    leadership: Arc<dyn Leadership>,
    settings: ControllerSettings,
    scheduler: Arc<Scheduler>,
    events: broadcast::Sender<CycleEvent>,
    last_report: RwLock<Option<CycleReport>>,
    cycles: Mutex<u64>,
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

impl Controller {
    pub fn new(
        settings: ControllerSettings,
        sources: Vec<Arc<dyn Source>>,
        registries: Vec<Arc<dyn Registry>>,
        leadership: Arc<dyn Leadership>,
    ) -> Self {
        let scheduler = Arc::new(Scheduler::new(
            settings.interval,
            settings.min_event_sync_interval,
            Instant::now(),
        ));
        let zones = registries
            .into_iter()
            .map(|registry| {
                Arc::new(Zone {
                    name: normalize_dns_name(registry.zone()),
                    registry,
                    lock: tokio::sync::Mutex::new(()),
                })
            })
            .collect();
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        Self {
            inner: Arc::new(Inner {
                sources,
                zones,
                leadership,
                settings,
                scheduler,
                events,
                last_report: RwLock::new(None),
                cycles: Mutex::new(0),
            }),
        }
    }

    pub fn trigger_handle(&self) -> TriggerHandle {
        TriggerHandle {
            scheduler: Arc::clone(&self.inner.scheduler),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CycleEvent> {
        self.inner.events.subscribe()
    }

    pub fn last_report(&self) -> Option<CycleReport> {
        self.inner
            .last_report
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn zones(&self) -> Vec<String> {
        self.inner.zones.iter().map(|z| z.name.clone()).collect()
    }

    fn emit(&self, event: CycleEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn next_cycle(&self) -> u64 {
        let mut n = self.inner.cycles.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *n += 1;
        *n
    }

    /// Run cycles until `shutdown` resolves. A cycle in flight at shutdown is
    /// dropped: finished writes stand, the rest is left for the next start.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if self.inner.scheduler.should_run(Instant::now()) {
                tokio::select! {
                    _ = self.run_once() => {}
                    _ = &mut shutdown => {
                        warn!("shutdown requested mid-cycle; remaining writes abandoned");
                        return;
                    }
                }
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = &mut shutdown => {
                    info!("Terminating main controller loop");
                    return;
                }
            }
        }
    }

    /// One full reconciliation cycle.
    pub async fn run_once(&self) -> CycleReport {
        let started = Instant::now();
        let cycle = self.next_cycle();
        self.emit(CycleEvent::CycleStarted { cycle });
        info!(cycle, "reconcile cycle started");

        let (desired, source_errors) = self.collect_desired().await;
        let desired = self.inner.settings.resolver.resolve_all(desired);
        let desired_count = desired.len();
        let mut by_zone = self.partition_by_zone(desired);

        let leader = self.inner.leadership.is_leader();
        if !leader {
            info!(cycle, "not the leader; changes will be computed but not applied");
        }

        let semaphore = Arc::new(Semaphore::new(self.inner.settings.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for (idx, zone) in self.inner.zones.iter().enumerate() {
            let this = self.clone();
            let zone = Arc::clone(zone);
            let desired = by_zone.remove(&idx).unwrap_or_default();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                (idx, this.reconcile_zone(cycle, &zone, desired, leader).await)
            });
        }

        let mut zones: Vec<(usize, ZoneReport)> = Vec::with_capacity(self.inner.zones.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => zones.push(report),
                Err(e) => error!(cycle, "zone task failed: {e}"),
            }
        }
        zones.sort_by_key(|(idx, _)| *idx);

        let report = CycleReport {
            cycle,
            leader,
            desired: desired_count,
            source_errors,
            zones: zones.into_iter().map(|(_, r)| r).collect(),
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };

        let clean = report.is_clean();
        info!(
            cycle,
            clean,
            desired = report.desired,
            zones = report.zones.len(),
            duration_ms = report.duration_ms,
            "reconcile cycle finished"
        );
        self.emit(CycleEvent::CycleFinished { cycle, clean });
        *self
            .inner
            .last_report
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(report.clone());
        report
    }

    /// Query every source. A failing or slow source contributes nothing
    /// this cycle; the others are unaffected.
    async fn collect_desired(&self) -> (Vec<Endpoint>, Vec<String>) {
        let limit = self.inner.settings.call_timeout;
        let semaphore = Arc::new(Semaphore::new(self.inner.settings.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for (idx, source) in self.inner.sources.iter().enumerate() {
            let source = Arc::clone(source);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result = tokio::time::timeout(limit, source.endpoints()).await;
                (idx, source.name().to_string(), result)
            });
        }

        let mut results = Vec::with_capacity(self.inner.sources.len());
        let mut errors = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, name, Ok(Ok(endpoints)))) => {
                    debug!(source = %name, endpoints = endpoints.len(), "source returned endpoints");
                    results.push((idx, endpoints));
                }
                Ok((_, name, Ok(Err(e)))) => {
                    error!(source = %name, "source failed, ignoring it this cycle: {e:#}");
                    errors.push(format!("{name}: {e:#}"));
                }
                Ok((_, name, Err(_))) => {
                    error!(source = %name, timeout_secs = limit.as_secs(), "source timed out, ignoring it this cycle");
                    errors.push(format!("{name}: timed out"));
                }
                Err(e) => {
                    error!("source task failed: {e}");
                    errors.push(format!("source task: {e}"));
                }
            }
        }

        results.sort_by_key(|(idx, _)| *idx);
        let desired = results.into_iter().flat_map(|(_, eps)| eps).collect();
        (desired, errors)
    }

    /// Assign each desired endpoint to the most specific zone containing it.
    fn partition_by_zone(&self, desired: Vec<Endpoint>) -> HashMap<usize, Vec<Endpoint>> {
        let mut out: HashMap<usize, Vec<Endpoint>> = HashMap::new();
        for ep in desired {
            let name = normalize_dns_name(&ep.dns_name);
            let best = self
                .inner
                .zones
                .iter()
                .enumerate()
                .filter(|(_, z)| name == z.name || name.ends_with(&format!(".{}", z.name)))
                .max_by_key(|(_, z)| z.name.len())
                .map(|(idx, _)| idx);
            match best {
                Some(idx) => out.entry(idx).or_default().push(ep),
                None => debug!(dns_name = %ep.dns_name, "no managed zone for endpoint"),
            }
        }
        out
    }

    async fn reconcile_zone(
        &self,
        cycle: u64,
        zone: &Zone,
        desired: Vec<Endpoint>,
        leader: bool,
    ) -> ZoneReport {
        let _guard = zone.lock.lock().await;
        let limit = self.inner.settings.call_timeout;

        let (outcome, changes) =
            match tokio::time::timeout(limit, self.zone_pipeline(cycle, zone, &desired, leader)).await {
                Ok(result) => result,
                Err(_) => {
                    error!(zone = %zone.name, timeout_secs = limit.as_secs(), "zone timed out; remaining work left for the next cycle");
                    (ZoneOutcome::TimedOut, Changes::default())
                }
            };

        match &outcome {
            ZoneOutcome::ReadFailed { error } | ZoneOutcome::WriteFailed { error } => {
                self.emit(CycleEvent::ZoneFailed {
                    cycle,
                    zone: zone.name.clone(),
                    error: error.clone(),
                });
            }
            ZoneOutcome::TimedOut => self.emit(CycleEvent::ZoneFailed {
                cycle,
                zone: zone.name.clone(),
                error: "timed out".to_string(),
            }),
            _ => {}
        }

        ZoneReport {
            zone: zone.name.clone(),
            outcome,
            changes,
        }
    }

    async fn zone_pipeline(
        &self,
        cycle: u64,
        zone: &Zone,
        desired: &[Endpoint],
        leader: bool,
    ) -> (ZoneOutcome, Changes) {
        let settings = &self.inner.settings;

        // No plan against a zone we could not read.
        let current = match zone.registry.records().await {
            Ok(records) => records,
            Err(e) => {
                error!(zone = %zone.name, "skipping zone this cycle: {e}");
                return (ZoneOutcome::ReadFailed { error: e.to_string() }, Changes::default());
            }
        };

        let changes = settings
            .plan
            .calculate(&current, desired, |ep| zone.registry.owns(ep));
        let changes = settings.policy.apply(changes);

        self.emit(CycleEvent::ZonePlanned {
            cycle,
            zone: zone.name.clone(),
            changes: changes.clone(),
        });

        if !changes.has_changes() {
            info!(zone = %zone.name, "All records are already up to date");
            return (ZoneOutcome::NoChanges, changes);
        }

        for ep in &changes.create {
            info!(zone = %zone.name, "planned CREATE {ep}");
        }
        for (old, new) in changes.update_old.iter().zip(&changes.update_new) {
            info!(zone = %zone.name, "planned UPDATE {old} ⇒ {new}");
        }
        for ep in &changes.delete {
            info!(zone = %zone.name, "planned DELETE {ep}");
        }

        if settings.dry_run {
            info!(zone = %zone.name, operations = changes.len(), "dry run; not applying");
            return (ZoneOutcome::DryRun, changes);
        }
        if !leader {
            return (ZoneOutcome::NotLeader, changes);
        }

        match zone.registry.apply_changes(&changes).await {
            Ok(()) => {
                info!(zone = %zone.name, operations = changes.len(), "changes applied");
                (ZoneOutcome::Applied, changes)
            }
            Err(e) => {
                error!(zone = %zone.name, "applying changes failed; will retry next cycle: {e}");
                (ZoneOutcome::WriteFailed { error: e.to_string() }, changes)
            }
        }
    }
}
