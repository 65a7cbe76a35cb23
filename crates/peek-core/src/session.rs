//! Session lifecycle: start (with switch and rollback), stop, periodic monitoring and
//! crash recovery.
//!
//! All mutations of the session indices happen under one coordinator lock so the
//! peeker-to-session map can never hold two sessions for the same peeker. Reads go
//! straight to the concurrent maps and observe a point-in-time view.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{DistancePolicy, PeekConfig};
use crate::cooldown::{unordered_pair, CooldownBook};
use crate::directory::ActorDirectory;
use crate::error::{DirectoryError, PeekError, PeekResult};
use crate::events::{Notifier, PeekEvent, SessionStats, StatsSink};
use crate::metrics;
use crate::scheduler::{TaskId, TaskKind, TickScheduler};
use crate::snapshot::{SnapshotService, StateSnapshot};
use crate::types::{ActorId, ActorView, InteractionMode, Location, RealmId};
use crate::validation;

pub type SessionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Voluntary,
    /// The peeker moved on to another target.
    Switched,
    PeekerDisconnected,
    TargetDisconnected,
    TargetRealmChanged,
    DistanceExceeded,
    TooFarFromOrigin,
    Timeout,
    /// The observed actor started a peek of their own.
    ObservedStartedPeeking,
    Shutdown,
    ConsistencyRepair,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Voluntary => "voluntary",
            StopReason::Switched => "switched",
            StopReason::PeekerDisconnected => "peeker_disconnected",
            StopReason::TargetDisconnected => "target_disconnected",
            StopReason::TargetRealmChanged => "target_realm_changed",
            StopReason::DistanceExceeded => "distance_exceeded",
            StopReason::TooFarFromOrigin => "too_far_from_origin",
            StopReason::Timeout => "timeout",
            StopReason::ObservedStartedPeeking => "observed_started_peeking",
            StopReason::Shutdown => "shutdown",
            StopReason::ConsistencyRepair => "consistency_repair",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeekSession {
    pub id: SessionId,
    pub peeker_id: ActorId,
    pub peeker_name: String,
    pub target_id: ActorId,
    pub target_name: String,
    pub started_at: DateTime<Utc>,
    pub started_tick: u64,
    pub last_update_tick: u64,
    /// Pre-session state of the peeker. Carried over unchanged on a switch.
    pub snapshot: StateSnapshot,
    pub origin_realm: RealmId,
    pub last_target_location: Option<Location>,
    pub last_peeker_location: Option<Location>,
    pub crossed_realm: bool,
    pub active: bool,
}

impl PeekSession {
    fn new(peeker: &ActorView, target: &ActorView, snapshot: StateSnapshot, now: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            peeker_id: peeker.id,
            peeker_name: peeker.name.clone(),
            target_id: target.id,
            target_name: target.name.clone(),
            started_at: Utc::now(),
            started_tick: now,
            last_update_tick: now,
            origin_realm: snapshot.location.realm.clone(),
            crossed_realm: snapshot.location.realm != target.location.realm,
            snapshot,
            last_target_location: None,
            last_peeker_location: None,
            active: true,
        }
    }

    pub fn with_target_location(mut self, location: Location) -> Self {
        if location.realm != self.origin_realm {
            self.crossed_realm = true;
        }
        self.last_target_location = Some(location);
        self
    }

    pub fn with_peeker_location(mut self, location: Location) -> Self {
        self.last_peeker_location = Some(location);
        self
    }

    pub fn with_last_update(mut self, tick: u64) -> Self {
        self.last_update_tick = tick;
        self
    }

    pub fn elapsed_ticks(&self, now: u64) -> u64 {
        now.saturating_sub(self.started_tick)
    }
}

/// Result of a stop, returned to the caller after restoration was attempted.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEnded {
    pub session: PeekSession,
    pub reason: StopReason,
    pub restored: bool,
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    NothingToRecover,
    Restored,
    /// The actor is peeking right now; the persisted snapshot belongs to that session.
    SessionStillActive,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorReport {
    pub inspected: usize,
    pub stopped: usize,
    pub pulled_back: usize,
    pub follows_scheduled: usize,
}

/// Index drift fixed by [`SessionCoordinator::repair_indices`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexRepairs {
    pub orphan_peeker_entries: usize,
    pub orphan_target_entries: usize,
    pub missing_peeker_entries: usize,
    pub missing_target_entries: usize,
    pub duplicate_sessions: usize,
}

impl IndexRepairs {
    pub fn total(&self) -> usize {
        self.orphan_peeker_entries
            + self.orphan_target_entries
            + self.missing_peeker_entries
            + self.missing_target_entries
            + self.duplicate_sessions
    }
}

struct SessionInner {
    config: PeekConfig,
    scheduler: Arc<TickScheduler>,
    snapshots: SnapshotService,
    directory: Arc<dyn ActorDirectory>,
    stats: Arc<dyn StatsSink>,
    notifier: Arc<dyn Notifier>,
    lock: Mutex<()>,
    sessions: DashMap<SessionId, PeekSession>,
    by_peeker: DashMap<ActorId, SessionId>,
    by_target: DashMap<ActorId, HashSet<SessionId>>,
    pair_cooldowns: CooldownBook<(ActorId, ActorId)>,
}

#[derive(Clone)]
pub struct SessionCoordinator {
    inner: Arc<SessionInner>,
}

impl SessionCoordinator {
    pub fn new(
        config: PeekConfig,
        scheduler: Arc<TickScheduler>,
        snapshots: SnapshotService,
        stats: Arc<dyn StatsSink>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let directory = snapshots.directory().clone();
        Self {
            inner: Arc::new(SessionInner {
                config,
                scheduler,
                snapshots,
                directory,
                stats,
                notifier,
                lock: Mutex::new(()),
                sessions: DashMap::new(),
                by_peeker: DashMap::new(),
                by_target: DashMap::new(),
                pair_cooldowns: CooldownBook::new(),
            }),
        }
    }

    fn from_weak(weak: &Weak<SessionInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn config(&self) -> &PeekConfig {
        &self.inner.config
    }

    // ----- queries -----

    pub fn is_peeking(&self, actor: ActorId) -> bool {
        self.inner.by_peeker.contains_key(&actor)
    }

    pub fn is_being_peeked(&self, actor: ActorId) -> bool {
        self.inner
            .by_target
            .get(&actor)
            .map(|ids| !ids.is_empty())
            .unwrap_or(false)
    }

    pub fn session_of(&self, peeker: ActorId) -> Option<PeekSession> {
        let id = *self.inner.by_peeker.get(&peeker)?;
        self.session(id)
    }

    pub fn session(&self, id: SessionId) -> Option<PeekSession> {
        self.inner.sessions.get(&id).map(|s| s.value().clone())
    }

    pub fn peekers_of(&self, target: ActorId) -> Vec<ActorId> {
        let Some(ids) = self.inner.by_target.get(&target).map(|ids| ids.clone()) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.inner.sessions.get(id).map(|s| s.peeker_id))
            .collect()
    }

    pub fn active_sessions(&self) -> Vec<PeekSession> {
        self.inner
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.inner.sessions.len()
    }

    // ----- start -----

    /// Starts (or switches) a session for `peeker` onto `target`.
    ///
    /// Every step after validation is undone if a later one fails: a brand-new peeker
    /// gets its captured state restored, a switching peeker gets its previous session
    /// reinstated.
    pub fn start_session(&self, peeker: ActorId, target: ActorId) -> PeekResult<PeekSession> {
        let _guard = self.inner.lock.lock();
        self.start_locked(peeker, target)
    }

    fn start_locked(&self, peeker: ActorId, target: ActorId) -> PeekResult<PeekSession> {
        let inner = &self.inner;
        if peeker == target {
            return Err(PeekError::SelfTarget);
        }
        self.reachable(peeker)?;
        self.reachable(target)?;

        if let Some(current) = self.session_of(peeker) {
            if current.target_id == target {
                return Err(PeekError::AlreadyPeeking);
            }
        }
        if let Some(theirs) = self.session_of(target) {
            if theirs.target_id != peeker {
                return Err(PeekError::TargetIsPeeking);
            }
        }

        // 1. nobody may keep observing an actor that starts peeking
        self.release_observers_locked(peeker, Some(target))?;
        // read after step 1, which may have restored a target that was observing us
        let peeker_view = self.reachable(peeker)?;
        let target_view = self.reachable(target)?;

        // 2. a switch takes the previous session out of the indices
        let previous = inner
            .by_peeker
            .get(&peeker)
            .map(|id| *id)
            .and_then(|id| self.deregister(id));

        // 3. validation
        if let Err(err) = self.validate_start(&peeker_view, &target_view, previous.as_ref()) {
            if let Some(prev) = previous {
                self.register(prev);
            }
            return Err(err);
        }

        // 4. snapshot: captured and verified once per peek, reused across switches
        let snapshot = match &previous {
            Some(prev) => prev.snapshot.clone(),
            None => self.capture_and_persist(peeker)?,
        };

        // 5. register
        let now = inner.scheduler.current_tick();
        let session = PeekSession::new(&peeker_view, &target_view, snapshot, now);
        let session_id = session.id;
        self.register(session.clone());

        // 6. enter observation
        if let Err(err) = self.enter_observation(&peeker_view, &target_view, previous.is_some()) {
            self.rollback(&session, previous);
            return Err(err);
        }

        let session = session
            .with_target_location(target_view.location.clone())
            .with_peeker_location(target_view.location.clone());
        inner.sessions.insert(session_id, session.clone());
        self.arm_timeout(session_id);

        let kind = if previous.is_some() { "switch" } else { "new" };
        metrics::SESSIONS_STARTED.with_label_values(&[kind]).inc();
        metrics::ACTIVE_SESSIONS.set(inner.sessions.len() as i64);

        if let Some(prev) = previous {
            self.cancel_tasks(prev.id);
            self.record_stats(&prev, StopReason::Switched, now);
            metrics::SESSIONS_ENDED
                .with_label_values(&[StopReason::Switched.as_str()])
                .inc();
            inner.notifier.notify(&PeekEvent::SwitchedAway {
                peeker,
                previous_target: prev.target_id,
                new_target: target,
            });
            info!(
                peeker = %peeker,
                previous_target = %prev.target_id,
                target = %target,
                session_id = %session_id,
                "peek session switched"
            );
        } else {
            info!(
                peeker = %peeker,
                target = %target,
                session_id = %session_id,
                "peek session started"
            );
        }
        inner.notifier.notify(&PeekEvent::SessionStarted {
            session_id,
            peeker,
            target,
            switched: kind == "switch",
        });
        Ok(session)
    }

    fn reachable(&self, actor: ActorId) -> PeekResult<ActorView> {
        self.inner
            .directory
            .lookup(actor)
            .ok_or(PeekError::ActorOffline(actor))
    }

    fn validate_start(
        &self,
        peeker: &ActorView,
        target: &ActorView,
        previous: Option<&PeekSession>,
    ) -> PeekResult<()> {
        let config = &self.inner.config;
        let origin = match previous {
            Some(prev) => &prev.snapshot.location,
            None => {
                validation::check_stationary(config, peeker)?;
                if self.inner.sessions.len() >= config.max_active_sessions {
                    return Err(PeekError::SessionLimitExceeded);
                }
                &peeker.location
            }
        };
        let observers = self
            .inner
            .by_target
            .get(&target.id)
            .map(|ids| ids.len())
            .unwrap_or(0);
        if observers >= config.max_sessions_per_target {
            return Err(PeekError::TargetSessionLimit);
        }
        validation::check_distance_policy(config, origin, &target.location)
    }

    fn capture_and_persist(&self, peeker: ActorId) -> PeekResult<StateSnapshot> {
        let snapshots = &self.inner.snapshots;
        let snapshot = snapshots.capture(peeker)?;
        if let Err(violation) = snapshot.validate() {
            return Err(PeekError::SnapshotPersistFailed(violation.to_string()));
        }
        if let Err(err) = snapshots.persist(peeker, &snapshot) {
            if let Err(clear_err) = snapshots.clear(peeker) {
                warn!(peeker = %peeker, error = %clear_err, "failed to clear unverified snapshot");
            }
            return Err(err);
        }
        Ok(snapshot)
    }

    fn enter_observation(
        &self,
        peeker: &ActorView,
        target: &ActorView,
        switching: bool,
    ) -> PeekResult<()> {
        let directory = &self.inner.directory;
        let failed = |err: DirectoryError| PeekError::TeleportFailed {
            realm: target.location.realm.clone(),
            cross_realm: peeker.location.realm != target.location.realm,
            reason: err.to_string(),
        };
        if !switching {
            directory
                .set_mode(peeker.id, InteractionMode::Spectator)
                .map_err(failed)?;
            directory.clear_conditions(peeker.id).map_err(failed)?;
        }
        directory
            .teleport(peeker.id, &target.location.realm, target.location.position)
            .map_err(failed)
    }

    fn rollback(&self, session: &PeekSession, previous: Option<PeekSession>) {
        let inner = &self.inner;
        self.deregister(session.id);
        metrics::SESSION_ROLLBACKS.inc();
        match previous {
            Some(prev) => {
                let peeker = prev.peeker_id;
                self.register(prev);
                if let Err(err) = inner.directory.set_mode(peeker, InteractionMode::Spectator) {
                    warn!(peeker = %peeker, error = %err, "failed to keep observer mode after switch rollback");
                }
                warn!(peeker = %peeker, "switch rolled back, previous session reinstated");
            }
            None => {
                let peeker = session.peeker_id;
                match inner.snapshots.restore(peeker, &session.snapshot) {
                    Ok(()) => {
                        if let Err(err) = inner.snapshots.clear(peeker) {
                            warn!(peeker = %peeker, error = %err, "failed to clear snapshot after rollback");
                        }
                    }
                    Err(err) => {
                        warn!(peeker = %peeker, error = %err, "rollback restore failed, snapshot kept for recovery");
                    }
                }
                warn!(peeker = %peeker, session_id = %session.id, "session start rolled back");
            }
        }
    }

    // ----- stop -----

    /// Ends the peeker's session. Idempotent: a second call reports
    /// [`PeekError::NotPeekingAnyone`] and changes nothing.
    pub fn stop_session(&self, peeker: ActorId, reason: StopReason) -> PeekResult<SessionEnded> {
        let _guard = self.inner.lock.lock();
        self.stop_locked(peeker, reason)
    }

    fn stop_locked(&self, peeker: ActorId, reason: StopReason) -> PeekResult<SessionEnded> {
        let id = self
            .inner
            .by_peeker
            .get(&peeker)
            .map(|id| *id)
            .ok_or(PeekError::NotPeekingAnyone)?;
        self.stop_by_id_locked(id, reason).map_err(|err| match err {
            PeekError::SessionNotFound => {
                self.inner.by_peeker.remove_if(&peeker, |_, sid| *sid == id);
                PeekError::NotPeekingAnyone
            }
            other => other,
        })
    }

    /// Stops one specific session, leaving any newer session of the same peeker alone.
    pub(crate) fn stop_session_by_id(
        &self,
        id: SessionId,
        reason: StopReason,
    ) -> PeekResult<SessionEnded> {
        let _guard = self.inner.lock.lock();
        self.stop_by_id_locked(id, reason)
    }

    fn stop_by_id_locked(&self, id: SessionId, reason: StopReason) -> PeekResult<SessionEnded> {
        let inner = &self.inner;
        let mut session = self.deregister(id).ok_or(PeekError::SessionNotFound)?;
        session.active = false;
        self.cancel_tasks(id);

        let now = inner.scheduler.current_tick();
        let restored = self.restore_peeker(&session);
        let duration_secs = self.record_stats(&session, reason, now);

        metrics::SESSIONS_ENDED
            .with_label_values(&[reason.as_str()])
            .inc();
        metrics::ACTIVE_SESSIONS.set(inner.sessions.len() as i64);
        inner.notifier.notify(&PeekEvent::SessionEnded {
            session_id: id,
            peeker: session.peeker_id,
            target: session.target_id,
            reason,
            restored,
        });
        info!(
            peeker = %session.peeker_id,
            target = %session.target_id,
            session_id = %id,
            reason = reason.as_str(),
            restored,
            duration_secs,
            "peek session ended"
        );
        Ok(SessionEnded {
            session,
            reason,
            restored,
            duration_secs,
        })
    }

    /// Puts the peeker back where the session found them. The persisted snapshot is
    /// cleared only once that succeeded.
    fn restore_peeker(&self, session: &PeekSession) -> bool {
        let snapshots = &self.inner.snapshots;
        let peeker = session.peeker_id;
        if self.inner.directory.lookup(peeker).is_none() {
            snapshots.persist_for_retry(peeker, &session.snapshot);
            return false;
        }
        match snapshots.restore(peeker, &session.snapshot) {
            Ok(()) => {
                if let Err(err) = snapshots.clear(peeker) {
                    warn!(peeker = %peeker, error = %err, "restored but failed to clear snapshot");
                }
                true
            }
            Err(err) => {
                warn!(peeker = %peeker, error = %err, "restore failed, keeping snapshot for retry");
                snapshots.persist_for_retry(peeker, &session.snapshot);
                false
            }
        }
    }

    fn record_stats(&self, session: &PeekSession, reason: StopReason, now: u64) -> u64 {
        let duration_secs = self
            .inner
            .config
            .ticks_to_secs(session.elapsed_ticks(now));
        let stats = SessionStats {
            peeker_id: session.peeker_id,
            peeker_name: session.peeker_name.clone(),
            target_id: session.target_id,
            target_name: session.target_name.clone(),
            duration_secs,
            crossed_realm: session.crossed_realm,
            reason,
        };
        if let Err(err) = self.inner.stats.record_session(&stats) {
            warn!(peeker = %session.peeker_id, error = %err, "failed to record session stats");
        }
        duration_secs
    }

    /// Ends every session observing `actor`. When `next_target` is one of those
    /// observers the pair goes on cooldown, and an active pair cooldown rejects the
    /// whole call before anything is stopped.
    pub fn release_observers(
        &self,
        actor: ActorId,
        next_target: Option<ActorId>,
    ) -> PeekResult<usize> {
        let _guard = self.inner.lock.lock();
        self.release_observers_locked(actor, next_target)
    }

    fn release_observers_locked(
        &self,
        actor: ActorId,
        next_target: Option<ActorId>,
    ) -> PeekResult<usize> {
        let inner = &self.inner;
        let watchers: Vec<(SessionId, ActorId)> = inner
            .by_target
            .get(&actor)
            .map(|ids| ids.clone())
            .unwrap_or_default()
            .into_iter()
            .filter_map(|id| inner.sessions.get(&id).map(|s| (id, s.peeker_id)))
            .collect();
        if watchers.is_empty() {
            return Ok(0);
        }

        let now = inner.scheduler.current_tick();
        if let Some(next) = next_target {
            let mutual = watchers.iter().any(|(_, watcher)| *watcher == next);
            if mutual && inner.pair_cooldowns.is_active(&unordered_pair(actor, next), now) {
                debug!(actor = %actor, target = %next, "mutual peek rejected by pair cooldown");
                return Err(PeekError::TooFrequent);
            }
        }

        let mut stopped = 0;
        for (id, watcher) in watchers {
            if self
                .stop_by_id_locked(id, StopReason::ObservedStartedPeeking)
                .is_ok()
            {
                stopped += 1;
            }
            if Some(watcher) == next_target {
                inner.pair_cooldowns.start(
                    unordered_pair(actor, watcher),
                    now,
                    inner.config.switch_cooldown_ticks(),
                );
            }
        }
        Ok(stopped)
    }

    /// Ends every session the actor takes part in, as peeker or as target.
    pub fn end_sessions_involving(&self, actor: ActorId) -> usize {
        let _guard = self.inner.lock.lock();
        let mut stopped = 0;
        if self.stop_locked(actor, StopReason::PeekerDisconnected).is_ok() {
            stopped += 1;
        }
        let observers: Vec<SessionId> = self
            .inner
            .by_target
            .get(&actor)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        for id in observers {
            if self
                .stop_by_id_locked(id, StopReason::TargetDisconnected)
                .is_ok()
            {
                stopped += 1;
            }
        }
        stopped
    }

    /// Stops every session, restoring each peeker.
    pub fn shutdown(&self) -> usize {
        let _guard = self.inner.lock.lock();
        let ids: Vec<SessionId> = self.inner.sessions.iter().map(|e| *e.key()).collect();
        let stopped = ids
            .into_iter()
            .filter(|id| self.stop_by_id_locked(*id, StopReason::Shutdown).is_ok())
            .count();
        info!(stopped, "peek sessions shut down");
        stopped
    }

    // ----- monitoring -----

    /// Periodic pass over every active session. Sessions younger than the grace
    /// window are skipped.
    pub fn on_tick(&self) -> MonitorReport {
        let inner = &self.inner;
        let now = inner.scheduler.current_tick();
        let mut report = MonitorReport::default();

        for session in self.active_sessions() {
            if session.elapsed_ticks(now) < inner.config.session_grace_ticks {
                continue;
            }
            report.inspected += 1;

            let Some(peeker) = inner.directory.lookup(session.peeker_id) else {
                report.stopped += self.stop_quietly(session.id, StopReason::PeekerDisconnected);
                continue;
            };
            let Some(target) = inner.directory.lookup(session.target_id) else {
                report.stopped += self.stop_quietly(session.id, StopReason::TargetDisconnected);
                continue;
            };
            let target_location = target.location.clone();

            let realm_changed = session
                .last_target_location
                .as_ref()
                .map(|last| last.realm != target_location.realm)
                .unwrap_or(false);
            if realm_changed {
                if self.handle_realm_change(&session, &target_location) {
                    report.follows_scheduled += 1;
                } else {
                    report.stopped += 1;
                }
                continue;
            }

            if inner
                .scheduler
                .contains(&TaskId::scoped(TaskKind::RealmFollow, session.id))
            {
                self.touch(&session, &peeker, &target_location, now);
                continue;
            }

            let max_distance = inner.config.max_peek_distance;
            if max_distance > 0.0 {
                if let Some(distance) = session.snapshot.location.distance_in_realm(&target_location) {
                    if distance > max_distance {
                        debug!(session_id = %session.id, distance, "target left the allowed radius");
                        report.stopped += self.stop_quietly(session.id, StopReason::TooFarFromOrigin);
                        continue;
                    }
                }
            }

            let drifted = match peeker.location.distance_in_realm(&target_location) {
                Some(distance) => {
                    inner.config.max_drift_distance > 0.0
                        && distance > inner.config.max_drift_distance
                }
                None => true,
            };
            if drifted {
                match inner.config.distance_policy {
                    DistancePolicy::EndSession => {
                        report.stopped += self.stop_quietly(session.id, StopReason::DistanceExceeded);
                        continue;
                    }
                    DistancePolicy::TeleportBack => {
                        match self.pull_back(&session, &peeker, &target_location) {
                            Ok(()) => report.pulled_back += 1,
                            Err(err) => {
                                warn!(session_id = %session.id, error = %err, "pull-back failed, ending session");
                                report.stopped +=
                                    self.stop_quietly(session.id, StopReason::DistanceExceeded);
                                continue;
                            }
                        }
                    }
                }
            }
            self.touch(&session, &peeker, &target_location, now);
        }
        report
    }

    fn stop_quietly(&self, id: SessionId, reason: StopReason) -> usize {
        match self.stop_session_by_id(id, reason) {
            Ok(_) => 1,
            Err(_) => 0,
        }
    }

    /// Returns true when a follow was scheduled, false when the session ended.
    fn handle_realm_change(&self, session: &PeekSession, target_location: &Location) -> bool {
        let inner = &self.inner;
        if !inner.config.realm_follow_enabled {
            inner.notifier.notify(&PeekEvent::TargetRealmChanged {
                session_id: session.id,
                peeker: session.peeker_id,
                target: session.target_id,
                realm: target_location.realm.clone(),
                follow_in_ticks: None,
            });
            self.stop_quietly(session.id, StopReason::TargetRealmChanged);
            return false;
        }

        let delay = inner.config.realm_follow_delay_ticks;
        let weak = Arc::downgrade(&self.inner);
        let session_id = session.id;
        inner.scheduler.add_task(
            TaskId::scoped(TaskKind::RealmFollow, session_id),
            TaskKind::RealmFollow,
            delay,
            move || {
                if let Some(coordinator) = SessionCoordinator::from_weak(&weak) {
                    coordinator.follow_target(session_id);
                }
            },
        );
        if let Some(mut entry) = inner.sessions.get_mut(&session_id) {
            *entry = entry.clone().with_target_location(target_location.clone());
        }
        inner.notifier.notify(&PeekEvent::TargetRealmChanged {
            session_id,
            peeker: session.peeker_id,
            target: session.target_id,
            realm: target_location.realm.clone(),
            follow_in_ticks: Some(delay),
        });
        debug!(session_id = %session_id, realm = %target_location.realm, delay, "realm follow scheduled");
        true
    }

    fn follow_target(&self, session_id: SessionId) {
        let inner = &self.inner;
        let Some(session) = self.session(session_id) else {
            return;
        };
        let Some(target) = inner.directory.lookup(session.target_id) else {
            self.stop_quietly(session_id, StopReason::TargetDisconnected);
            return;
        };
        let result = inner.directory.teleport(
            session.peeker_id,
            &target.location.realm,
            target.location.position,
        );
        match result {
            Ok(()) => {
                if let Some(mut entry) = inner.sessions.get_mut(&session_id) {
                    *entry = entry
                        .clone()
                        .with_target_location(target.location.clone())
                        .with_peeker_location(target.location.clone())
                        .with_last_update(inner.scheduler.current_tick());
                }
                debug!(session_id = %session_id, realm = %target.location.realm, "followed target into new realm");
            }
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "realm follow failed, ending session");
                self.stop_quietly(session_id, StopReason::TargetRealmChanged);
            }
        }
    }

    fn pull_back(
        &self,
        session: &PeekSession,
        peeker: &ActorView,
        target_location: &Location,
    ) -> PeekResult<()> {
        self.inner
            .directory
            .teleport(session.peeker_id, &target_location.realm, target_location.position)
            .map_err(|err| PeekError::TeleportFailed {
                realm: target_location.realm.clone(),
                cross_realm: peeker.location.realm != target_location.realm,
                reason: err.to_string(),
            })?;
        debug!(session_id = %session.id, "peeker pulled back to target");
        Ok(())
    }

    fn touch(&self, session: &PeekSession, peeker: &ActorView, target: &Location, now: u64) {
        if let Some(mut entry) = self.inner.sessions.get_mut(&session.id) {
            *entry = entry
                .clone()
                .with_target_location(target.clone())
                .with_peeker_location(peeker.location.clone())
                .with_last_update(now);
        }
    }

    // ----- tasks -----

    fn arm_timeout(&self, session_id: SessionId) {
        let Some(ticks) = self.inner.config.session_max_duration_ticks() else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        self.inner.scheduler.add_task(
            TaskId::scoped(TaskKind::SessionTimeout, session_id),
            TaskKind::SessionTimeout,
            ticks,
            move || {
                if let Some(coordinator) = SessionCoordinator::from_weak(&weak) {
                    coordinator.stop_quietly(session_id, StopReason::Timeout);
                }
            },
        );
    }

    fn cancel_tasks(&self, session_id: SessionId) {
        let scheduler = &self.inner.scheduler;
        scheduler.remove_by_id(&TaskId::scoped(TaskKind::SessionTimeout, session_id));
        scheduler.remove_by_id(&TaskId::scoped(TaskKind::RealmFollow, session_id));
    }

    // ----- recovery -----

    /// Restores an actor from a snapshot left behind by an unclean exit. An invalid
    /// snapshot is discarded; a failed restore keeps the snapshot for the next attempt.
    pub fn perform_crash_recovery(&self, actor: ActorId) -> PeekResult<RecoveryOutcome> {
        let inner = &self.inner;
        let _guard = inner.lock.lock();
        if inner.by_peeker.contains_key(&actor) {
            return Ok(RecoveryOutcome::SessionStillActive);
        }

        let snapshot = match inner.snapshots.load(actor) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return Ok(RecoveryOutcome::NothingToRecover),
            Err(err) => {
                metrics::RECOVERIES.with_label_values(&["load_failed"]).inc();
                warn!(actor = %actor, error = %err, "failed to load snapshot for recovery");
                return Err(PeekError::RestoreFailed(err.to_string()));
            }
        };

        if let Err(violation) = snapshot.validate() {
            warn!(
                actor = %actor,
                violation = %violation,
                "persisted snapshot is invalid, discarding it; pre-peek state is lost"
            );
            if let Err(err) = inner.snapshots.clear(actor) {
                warn!(actor = %actor, error = %err, "failed to discard invalid snapshot");
            }
            metrics::RECOVERIES.with_label_values(&["discarded"]).inc();
            return Err(PeekError::SnapshotDiscarded(violation.to_string()));
        }

        match inner.snapshots.restore(actor, &snapshot) {
            Ok(()) => {
                if let Err(err) = inner.snapshots.clear(actor) {
                    warn!(actor = %actor, error = %err, "recovered but failed to clear snapshot");
                }
                metrics::RECOVERIES.with_label_values(&["restored"]).inc();
                inner.notifier.notify(&PeekEvent::RecoveryCompleted {
                    actor,
                    restored: true,
                });
                info!(actor = %actor, "recovered pre-peek state");
                Ok(RecoveryOutcome::Restored)
            }
            Err(err) => {
                metrics::RECOVERIES.with_label_values(&["failed"]).inc();
                inner.notifier.notify(&PeekEvent::RecoveryCompleted {
                    actor,
                    restored: false,
                });
                warn!(actor = %actor, error = %err, "crash recovery failed, snapshot kept");
                Err(err)
            }
        }
    }

    // ----- indices -----

    fn register(&self, session: PeekSession) {
        let inner = &self.inner;
        inner.by_peeker.insert(session.peeker_id, session.id);
        inner
            .by_target
            .entry(session.target_id)
            .or_default()
            .insert(session.id);
        inner.sessions.insert(session.id, session);
    }

    fn deregister(&self, id: SessionId) -> Option<PeekSession> {
        let inner = &self.inner;
        let (_, session) = inner.sessions.remove(&id)?;
        inner
            .by_peeker
            .remove_if(&session.peeker_id, |_, sid| *sid == id);
        if let Some(mut ids) = inner.by_target.get_mut(&session.target_id) {
            ids.remove(&id);
        }
        inner
            .by_target
            .remove_if(&session.target_id, |_, ids| ids.is_empty());
        Some(session)
    }

    /// Rebuilds the secondary indices from the session table, reporting what had
    /// drifted. A peeker found with more than one session keeps the newest one.
    pub fn repair_indices(&self) -> IndexRepairs {
        let inner = &self.inner;
        let _guard = inner.lock.lock();
        let mut repairs = IndexRepairs::default();

        // newest session per peeker as (id, started_tick)
        let mut newest: HashMap<ActorId, (SessionId, u64)> = HashMap::new();
        let mut duplicates = Vec::new();
        for entry in inner.sessions.iter() {
            let session = entry.value();
            let candidate = (session.id, session.started_tick);
            match newest.insert(session.peeker_id, candidate) {
                Some(kept) if kept.1 >= candidate.1 => {
                    newest.insert(session.peeker_id, kept);
                    duplicates.push(candidate.0);
                }
                Some(kept) => duplicates.push(kept.0),
                None => {}
            }
        }
        // the surviving session carries the same snapshot, so nothing is restored here
        for id in duplicates {
            if let Some(session) = self.deregister(id) {
                self.cancel_tasks(id);
                warn!(
                    session_id = %id,
                    peeker = %session.peeker_id,
                    "dropping duplicate session for one peeker"
                );
                metrics::SESSIONS_ENDED
                    .with_label_values(&[StopReason::ConsistencyRepair.as_str()])
                    .inc();
                repairs.duplicate_sessions += 1;
            }
        }

        let orphan_peekers: Vec<ActorId> = inner
            .by_peeker
            .iter()
            .filter(|e| {
                inner
                    .sessions
                    .get(e.value())
                    .map(|s| s.peeker_id != *e.key())
                    .unwrap_or(true)
            })
            .map(|e| *e.key())
            .collect();
        for peeker in orphan_peekers {
            warn!(peeker = %peeker, "removing orphaned peeker index entry");
            inner.by_peeker.remove(&peeker);
            repairs.orphan_peeker_entries += 1;
        }

        for mut entry in inner.by_target.iter_mut() {
            let target = *entry.key();
            let before = entry.len();
            entry.retain(|id| {
                inner
                    .sessions
                    .get(id)
                    .map(|s| s.target_id == target)
                    .unwrap_or(false)
            });
            let removed = before - entry.len();
            if removed > 0 {
                warn!(target = %target, removed, "removing orphaned target index entries");
                repairs.orphan_target_entries += removed;
            }
        }
        inner.by_target.retain(|_, ids| !ids.is_empty());

        for entry in inner.sessions.iter() {
            let session = entry.value();
            let indexed = inner
                .by_peeker
                .get(&session.peeker_id)
                .map(|id| *id == session.id)
                .unwrap_or(false);
            if !indexed {
                warn!(session_id = %session.id, "session missing from peeker index");
                inner.by_peeker.insert(session.peeker_id, session.id);
                repairs.missing_peeker_entries += 1;
            }
            let mut targets = inner.by_target.entry(session.target_id).or_default();
            if targets.insert(session.id) {
                warn!(session_id = %session.id, "session missing from target index");
                repairs.missing_target_entries += 1;
            }
        }

        metrics::ACTIVE_SESSIONS.set(inner.sessions.len() as i64);
        repairs
    }

    #[cfg(test)]
    pub(crate) fn corrupt_index_for_test(&self, f: impl FnOnce(&IndexMaps<'_>)) {
        f(&IndexMaps {
            sessions: &self.inner.sessions,
            by_peeker: &self.inner.by_peeker,
            by_target: &self.inner.by_target,
        });
    }
}

#[cfg(test)]
pub(crate) struct IndexMaps<'a> {
    pub sessions: &'a DashMap<SessionId, PeekSession>,
    pub by_peeker: &'a DashMap<ActorId, SessionId>,
    pub by_target: &'a DashMap<ActorId, HashSet<SessionId>>,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::directory::InMemoryDirectory;
    use crate::events::{InMemoryStats, RecordingNotifier};
    use crate::store::InMemorySnapshotStore;
    use crate::types::{Position, TimedCondition};

    pub(crate) struct Fixture {
        pub directory: Arc<InMemoryDirectory>,
        pub store: Arc<InMemorySnapshotStore>,
        pub stats: Arc<InMemoryStats>,
        pub notifier: Arc<RecordingNotifier>,
        pub scheduler: Arc<TickScheduler>,
        pub sessions: SessionCoordinator,
    }

    impl Fixture {
        pub fn new(config: PeekConfig) -> Self {
            let directory = InMemoryDirectory::new();
            directory.add_realm(RealmId::new("overworld"));
            directory.add_realm(RealmId::new("nether"));
            let store = InMemorySnapshotStore::new();
            let stats = InMemoryStats::new();
            let notifier = RecordingNotifier::new();
            let scheduler = Arc::new(TickScheduler::new());
            let snapshots = SnapshotService::new(directory.clone(), store.clone());
            let sessions = SessionCoordinator::new(
                config,
                scheduler.clone(),
                snapshots,
                stats.clone(),
                notifier.clone(),
            );
            Self {
                directory,
                store,
                stats,
                notifier,
                scheduler,
                sessions,
            }
        }

        pub fn actor(&self, name: &str, realm: &str, x: f64) -> ActorId {
            let id = Uuid::new_v4();
            let location = Location::new(RealmId::new(realm), Position::new(x, 64.0, 0.0));
            self.directory.connect(ActorView::new(id, name, location));
            id
        }

        pub fn advance(&self, ticks: u64) {
            for _ in 0..ticks {
                self.scheduler.process_tick();
            }
        }
    }

    #[test]
    fn start_then_stop_restores_peeker() {
        let fx = Fixture::new(PeekConfig::default());
        let alice = fx.actor("alice", "overworld", 0.0);
        let bob = fx.actor("bob", "overworld", 100.0);
        fx.directory.update(alice, |v| {
            v.conditions = vec![TimedCondition::new("speed", 1, 200)];
            v.special.fire_ticks = 40;
        });

        let session = fx.sessions.start_session(alice, bob).unwrap();
        assert!(fx.sessions.is_peeking(alice));
        assert!(fx.sessions.is_being_peeked(bob));
        assert!(fx.store.contains(alice));
        let during = fx.directory.lookup(alice).unwrap();
        assert_eq!(during.mode, InteractionMode::Spectator);
        assert!(during.conditions.is_empty());
        assert_eq!(during.location.position.x, 100.0);

        let ended = fx.sessions.stop_session(alice, StopReason::Voluntary).unwrap();
        assert_eq!(ended.session.id, session.id);
        assert!(ended.restored);
        let after = fx.directory.lookup(alice).unwrap();
        assert_eq!(after.mode, InteractionMode::Survival);
        assert_eq!(after.location.position.x, 0.0);
        assert_eq!(after.conditions.len(), 1);
        assert_eq!(after.special.fire_ticks, 40);
        assert!(!fx.store.contains(alice));
        assert_eq!(fx.stats.records().len(), 1);
    }

    #[test]
    fn stop_is_idempotent() {
        let fx = Fixture::new(PeekConfig::default());
        let alice = fx.actor("alice", "overworld", 0.0);
        let bob = fx.actor("bob", "overworld", 10.0);
        fx.sessions.start_session(alice, bob).unwrap();

        fx.sessions.stop_session(alice, StopReason::Voluntary).unwrap();
        let position = fx.directory.lookup(alice).unwrap().location;
        assert_eq!(
            fx.sessions.stop_session(alice, StopReason::Voluntary),
            Err(PeekError::NotPeekingAnyone)
        );
        assert_eq!(fx.directory.lookup(alice).unwrap().location, position);
        assert_eq!(fx.stats.records().len(), 1);
    }

    #[test]
    fn offline_peeker_keeps_snapshot_for_recovery() {
        let fx = Fixture::new(PeekConfig::default());
        let alice = fx.actor("alice", "overworld", 0.0);
        let bob = fx.actor("bob", "overworld", 10.0);
        fx.sessions.start_session(alice, bob).unwrap();

        let view = fx.directory.disconnect(alice).unwrap();
        let ended = fx
            .sessions
            .stop_session(alice, StopReason::PeekerDisconnected)
            .unwrap();
        assert!(!ended.restored);
        assert!(fx.store.contains(alice));

        fx.directory.connect(view);
        assert_eq!(
            fx.sessions.perform_crash_recovery(alice),
            Ok(RecoveryOutcome::Restored)
        );
        assert_eq!(fx.directory.lookup(alice).unwrap().location.position.x, 0.0);
        assert!(!fx.store.contains(alice));
    }

    #[test]
    fn moving_peeker_is_rejected_before_any_change() {
        let fx = Fixture::new(PeekConfig::default());
        let alice = fx.actor("alice", "overworld", 0.0);
        let bob = fx.actor("bob", "overworld", 10.0);
        fx.directory.update(alice, |v| v.velocity = [1.0, 0.0, 0.0]);
        assert_eq!(
            fx.sessions.start_session(alice, bob),
            Err(PeekError::NotStationary)
        );
        assert!(fx.store.is_empty());
        assert_eq!(fx.sessions.active_count(), 0);
    }

    #[test]
    fn per_target_limit_applies() {
        let fx = Fixture::new(PeekConfig {
            max_sessions_per_target: 1,
            ..PeekConfig::default()
        });
        let target = fx.actor("target", "overworld", 0.0);
        let first = fx.actor("first", "overworld", 5.0);
        let second = fx.actor("second", "overworld", 6.0);
        fx.sessions.start_session(first, target).unwrap();
        assert_eq!(
            fx.sessions.start_session(second, target),
            Err(PeekError::TargetSessionLimit)
        );
        assert_eq!(fx.sessions.peekers_of(target), vec![first]);
    }

    #[test]
    fn cannot_peek_someone_who_is_peeking() {
        let fx = Fixture::new(PeekConfig::default());
        let a = fx.actor("a", "overworld", 0.0);
        let b = fx.actor("b", "overworld", 5.0);
        let c = fx.actor("c", "overworld", 9.0);
        fx.sessions.start_session(b, c).unwrap();
        assert_eq!(
            fx.sessions.start_session(a, b),
            Err(PeekError::TargetIsPeeking)
        );
    }

    #[test]
    fn session_timeout_fires_through_scheduler() {
        let fx = Fixture::new(PeekConfig {
            tick_millis: 1_000,
            session_max_duration_secs: 3,
            ..PeekConfig::default()
        });
        let alice = fx.actor("alice", "overworld", 0.0);
        let bob = fx.actor("bob", "overworld", 10.0);
        fx.sessions.start_session(alice, bob).unwrap();
        fx.advance(2);
        assert!(fx.sessions.is_peeking(alice));
        fx.advance(1);
        assert!(!fx.sessions.is_peeking(alice));
        assert_eq!(fx.stats.records()[0].reason, StopReason::Timeout);
    }

    #[test]
    fn monitoring_pulls_drifting_peeker_back() {
        let fx = Fixture::new(PeekConfig {
            session_grace_ticks: 0,
            max_drift_distance: 10.0,
            ..PeekConfig::default()
        });
        let alice = fx.actor("alice", "overworld", 0.0);
        let bob = fx.actor("bob", "overworld", 50.0);
        fx.sessions.start_session(alice, bob).unwrap();
        fx.directory.move_to(
            alice,
            Location::new(RealmId::new("overworld"), Position::new(200.0, 64.0, 0.0)),
        );

        let report = fx.sessions.on_tick();
        assert_eq!(report.pulled_back, 1);
        assert_eq!(fx.directory.lookup(alice).unwrap().location.position.x, 50.0);
    }

    #[test]
    fn monitoring_ends_session_when_drift_policy_is_end() {
        let fx = Fixture::new(PeekConfig {
            session_grace_ticks: 0,
            max_drift_distance: 10.0,
            distance_policy: DistancePolicy::EndSession,
            ..PeekConfig::default()
        });
        let alice = fx.actor("alice", "overworld", 0.0);
        let bob = fx.actor("bob", "overworld", 50.0);
        fx.sessions.start_session(alice, bob).unwrap();
        fx.directory.move_to(
            alice,
            Location::new(RealmId::new("overworld"), Position::new(200.0, 64.0, 0.0)),
        );

        let report = fx.sessions.on_tick();
        assert_eq!(report.stopped, 1);
        assert_eq!(report.pulled_back, 0);
        assert!(!fx.sessions.is_peeking(alice));
        assert_eq!(fx.stats.records()[0].reason, StopReason::DistanceExceeded);
        assert_eq!(fx.directory.lookup(alice).unwrap().location.position.x, 0.0);
    }

    #[test]
    fn monitoring_ends_session_when_target_leaves_origin_radius() {
        let fx = Fixture::new(PeekConfig {
            session_grace_ticks: 0,
            max_peek_distance: 100.0,
            ..PeekConfig::default()
        });
        let alice = fx.actor("alice", "overworld", 0.0);
        let bob = fx.actor("bob", "overworld", 50.0);
        fx.sessions.start_session(alice, bob).unwrap();
        fx.directory.move_to(
            bob,
            Location::new(RealmId::new("overworld"), Position::new(300.0, 64.0, 0.0)),
        );

        let report = fx.sessions.on_tick();
        assert_eq!(report.stopped, 1);
        assert!(!fx.sessions.is_being_peeked(bob));
        assert_eq!(fx.stats.records()[0].reason, StopReason::TooFarFromOrigin);
        assert_eq!(fx.directory.lookup(alice).unwrap().location.position.x, 0.0);
    }

    #[test]
    fn global_session_ceiling_rejects_new_sessions_only() {
        let fx = Fixture::new(PeekConfig {
            max_active_sessions: 1,
            ..PeekConfig::default()
        });
        let alice = fx.actor("alice", "overworld", 0.0);
        let bob = fx.actor("bob", "overworld", 50.0);
        let carol = fx.actor("carol", "overworld", -50.0);
        fx.sessions.start_session(alice, bob).unwrap();

        assert_eq!(
            fx.sessions.start_session(carol, bob),
            Err(PeekError::SessionLimitExceeded)
        );
        assert!(!fx.sessions.is_peeking(carol));
        assert_eq!(fx.directory.lookup(carol).unwrap().location.position.x, -50.0);

        // switching keeps the count unchanged
        let switched = fx.sessions.start_session(alice, carol).unwrap();
        assert_eq!(switched.target_id, carol);
        assert_eq!(fx.sessions.active_count(), 1);
    }

    #[test]
    fn monitoring_skips_sessions_in_grace_window() {
        let fx = Fixture::new(PeekConfig {
            session_grace_ticks: 20,
            ..PeekConfig::default()
        });
        let alice = fx.actor("alice", "overworld", 0.0);
        let bob = fx.actor("bob", "overworld", 50.0);
        fx.sessions.start_session(alice, bob).unwrap();
        fx.directory.disconnect(bob);
        assert_eq!(fx.sessions.on_tick().inspected, 0);
        assert!(fx.sessions.is_peeking(alice));

        fx.advance(20);
        let report = fx.sessions.on_tick();
        assert_eq!(report.stopped, 1);
        assert_eq!(fx.stats.records()[0].reason, StopReason::TargetDisconnected);
    }

    #[test]
    fn realm_change_schedules_follow() {
        let fx = Fixture::new(PeekConfig {
            session_grace_ticks: 0,
            realm_follow_delay_ticks: 5,
            ..PeekConfig::default()
        });
        let alice = fx.actor("alice", "overworld", 0.0);
        let bob = fx.actor("bob", "overworld", 50.0);
        fx.sessions.start_session(alice, bob).unwrap();
        fx.directory.move_to(
            bob,
            Location::new(RealmId::new("nether"), Position::new(8.0, 40.0, 8.0)),
        );

        assert_eq!(fx.sessions.on_tick().follows_scheduled, 1);
        assert_eq!(
            fx.directory.lookup(alice).unwrap().location.realm,
            RealmId::new("overworld")
        );
        fx.advance(5);
        let peeker = fx.directory.lookup(alice).unwrap();
        assert_eq!(peeker.location.realm, RealmId::new("nether"));
        assert!(fx.sessions.session_of(alice).unwrap().crossed_realm);
    }

    #[test]
    fn realm_change_ends_session_when_follow_disabled() {
        let fx = Fixture::new(PeekConfig {
            session_grace_ticks: 0,
            realm_follow_enabled: false,
            ..PeekConfig::default()
        });
        let alice = fx.actor("alice", "overworld", 0.0);
        let bob = fx.actor("bob", "overworld", 50.0);
        fx.sessions.start_session(alice, bob).unwrap();
        fx.directory.move_to(
            bob,
            Location::new(RealmId::new("nether"), Position::new(0.0, 64.0, 0.0)),
        );
        fx.sessions.on_tick();
        assert!(!fx.sessions.is_peeking(alice));
        assert_eq!(fx.stats.records()[0].reason, StopReason::TargetRealmChanged);
    }

    #[test]
    fn shutdown_restores_everyone() {
        let fx = Fixture::new(PeekConfig::default());
        let target = fx.actor("target", "overworld", 0.0);
        let a = fx.actor("a", "overworld", 20.0);
        let b = fx.actor("b", "overworld", 30.0);
        fx.sessions.start_session(a, target).unwrap();
        fx.sessions.start_session(b, target).unwrap();
        assert_eq!(fx.sessions.shutdown(), 2);
        assert_eq!(fx.sessions.active_count(), 0);
        assert_eq!(fx.directory.lookup(a).unwrap().location.position.x, 20.0);
        assert!(fx.store.is_empty());
    }
}
