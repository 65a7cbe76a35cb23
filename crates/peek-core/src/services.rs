//! Wiring of every component behind one handle, plus the tick driver entry point.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::PeekConfig;
use crate::consistency::{ConsistencyChecker, ConsistencyReport};
use crate::directory::ActorDirectory;
use crate::error::PeekResult;
use crate::events::{Notifier, StatsSink, TracingNotifier};
use crate::request::RequestCoordinator;
use crate::scheduler::{TaskKind, TickScheduler};
use crate::session::{MonitorReport, RecoveryOutcome, SessionCoordinator};
use crate::snapshot::SnapshotService;
use crate::store::SnapshotStore;
use crate::types::ActorId;

/// External systems the core talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub directory: Arc<dyn ActorDirectory>,
    pub store: Arc<dyn SnapshotStore>,
    pub stats: Arc<dyn StatsSink>,
    pub notifier: Arc<dyn Notifier>,
}

impl Collaborators {
    pub fn new(
        directory: Arc<dyn ActorDirectory>,
        store: Arc<dyn SnapshotStore>,
        stats: Arc<dyn StatsSink>,
    ) -> Self {
        Self {
            directory,
            store,
            stats,
            notifier: Arc::new(TracingNotifier),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }
}

/// What one call to [`PeekServices::tick`] did.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub tick: u64,
    pub tasks_fired: usize,
    pub monitor: Option<MonitorReport>,
    pub consistency: Option<ConsistencyReport>,
}

pub struct PeekServices {
    config: PeekConfig,
    scheduler: Arc<TickScheduler>,
    snapshots: SnapshotService,
    sessions: SessionCoordinator,
    requests: RequestCoordinator,
    checker: ConsistencyChecker,
}

impl PeekServices {
    pub fn new(config: PeekConfig, collaborators: Collaborators) -> Self {
        let config = config.normalize();
        let scheduler = Arc::new(TickScheduler::new());
        let snapshots =
            SnapshotService::new(collaborators.directory.clone(), collaborators.store.clone());
        let sessions = SessionCoordinator::new(
            config.clone(),
            scheduler.clone(),
            snapshots.clone(),
            collaborators.stats.clone(),
            collaborators.notifier.clone(),
        );
        let requests = RequestCoordinator::new(
            config.clone(),
            scheduler.clone(),
            collaborators.directory.clone(),
            sessions.clone(),
            collaborators.notifier.clone(),
        );
        let checker = ConsistencyChecker::new(
            config.clone(),
            scheduler.clone(),
            collaborators.directory.clone(),
            sessions.clone(),
            requests.clone(),
        );
        info!(
            tick_millis = config.tick_millis,
            request_timeout_secs = config.request_timeout_secs,
            max_active_sessions = config.max_active_sessions,
            "peek services ready"
        );
        Self {
            config,
            scheduler,
            snapshots,
            sessions,
            requests,
            checker,
        }
    }

    pub fn config(&self) -> &PeekConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<TickScheduler> {
        &self.scheduler
    }

    pub fn snapshots(&self) -> &SnapshotService {
        &self.snapshots
    }

    pub fn sessions(&self) -> &SessionCoordinator {
        &self.sessions
    }

    pub fn requests(&self) -> &RequestCoordinator {
        &self.requests
    }

    pub fn checker(&self) -> &ConsistencyChecker {
        &self.checker
    }

    /// Advances time by one quantum: due tasks fire, then monitoring and the
    /// consistency audit run on their configured cadence.
    pub fn tick(&self) -> TickReport {
        let tasks_fired = self.scheduler.process_tick();
        let tick = self.scheduler.current_tick();
        let mut report = TickReport {
            tick,
            tasks_fired,
            ..TickReport::default()
        };
        if tick % self.config.monitor_interval_ticks == 0 {
            report.monitor = Some(self.sessions.on_tick());
        }
        if tick % self.config.consistency_interval_ticks == 0 {
            report.consistency = Some(self.checker.run());
        }
        report
    }

    pub fn advance(&self, ticks: u64) {
        for _ in 0..ticks {
            self.tick();
        }
    }

    /// Runs crash recovery for a (re)connecting actor.
    pub fn on_actor_join(&self, actor: ActorId) -> PeekResult<RecoveryOutcome> {
        let outcome = self.sessions.perform_crash_recovery(actor);
        match &outcome {
            Ok(RecoveryOutcome::Restored) => info!(actor = %actor, "actor recovered on join"),
            Ok(_) => debug!(actor = %actor, "nothing to recover on join"),
            Err(err) => warn!(actor = %actor, error = %err, "recovery on join failed"),
        }
        outcome
    }

    /// Drops the actor's requests and invites and ends every session it takes part in.
    pub fn on_actor_leave(&self, actor: ActorId) -> usize {
        let cancelled = self.requests.forget_actor(actor);
        let stopped = self.sessions.end_sessions_involving(actor);
        debug!(actor = %actor, cancelled, stopped, "actor left");
        stopped
    }

    /// Ends every session and drops deferred work that would start or move one.
    pub fn shutdown(&self) -> usize {
        let stopped = self.sessions.shutdown();
        let dropped = self.scheduler.remove_by_kind(TaskKind::AutoAccept)
            + self.scheduler.remove_by_kind(TaskKind::RealmFollow);
        info!(stopped, dropped, "peek services shut down");
        stopped
    }
}
