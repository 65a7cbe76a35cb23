//! Periodic audit of the session and request indices.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::PeekConfig;
use crate::directory::ActorDirectory;
use crate::metrics;
use crate::request::RequestCoordinator;
use crate::scheduler::TickScheduler;
use crate::session::{IndexRepairs, SessionCoordinator, SessionId, StopReason};
use crate::types::ActorId;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub index_repairs: IndexRepairs,
    /// Sessions ended because their peeker or target no longer exists.
    pub vanished_sessions: usize,
    /// Sessions running longer than the warning threshold; reported, never ended.
    pub long_running: Vec<SessionId>,
    pub stale_requests: usize,
}

impl ConsistencyReport {
    pub fn repairs(&self) -> usize {
        self.index_repairs.total() + self.vanished_sessions + self.stale_requests
    }

    pub fn is_clean(&self) -> bool {
        self.repairs() == 0 && self.long_running.is_empty()
    }
}

pub struct ConsistencyChecker {
    config: PeekConfig,
    scheduler: Arc<TickScheduler>,
    directory: Arc<dyn ActorDirectory>,
    sessions: SessionCoordinator,
    requests: RequestCoordinator,
}

impl ConsistencyChecker {
    pub fn new(
        config: PeekConfig,
        scheduler: Arc<TickScheduler>,
        directory: Arc<dyn ActorDirectory>,
        sessions: SessionCoordinator,
        requests: RequestCoordinator,
    ) -> Self {
        Self {
            config,
            scheduler,
            directory,
            sessions,
            requests,
        }
    }

    pub fn run(&self) -> ConsistencyReport {
        let mut report = ConsistencyReport {
            index_repairs: self.sessions.repair_indices(),
            ..ConsistencyReport::default()
        };
        count_repairs("orphan_peeker", report.index_repairs.orphan_peeker_entries);
        count_repairs("orphan_target", report.index_repairs.orphan_target_entries);
        count_repairs("missing_peeker", report.index_repairs.missing_peeker_entries);
        count_repairs("missing_target", report.index_repairs.missing_target_entries);
        count_repairs("duplicate_session", report.index_repairs.duplicate_sessions);

        let now = self.scheduler.current_tick();
        let warn_after = self.config.secs_to_ticks(self.config.long_session_warn_secs);
        for session in self.sessions.active_sessions() {
            if self.vanished(session.peeker_id) || self.vanished(session.target_id) {
                warn!(
                    session_id = %session.id,
                    peeker = %session.peeker_id,
                    target = %session.target_id,
                    "session references an actor that no longer exists"
                );
                if self
                    .sessions
                    .stop_session_by_id(session.id, StopReason::ConsistencyRepair)
                    .is_ok()
                {
                    report.vanished_sessions += 1;
                }
                continue;
            }
            if warn_after > 0 && session.elapsed_ticks(now) >= warn_after {
                warn!(
                    session_id = %session.id,
                    peeker = %session.peeker_id,
                    elapsed_secs = self.config.ticks_to_secs(session.elapsed_ticks(now)),
                    "long-running peek session"
                );
                report.long_running.push(session.id);
            }
        }
        count_repairs("vanished_actor", report.vanished_sessions);

        report.stale_requests = self.requests.sweep_stale();
        count_repairs("stale_request", report.stale_requests);

        if report.repairs() > 0 {
            info!(repairs = report.repairs(), "consistency check repaired drift");
        }
        report
    }

    fn vanished(&self, actor: ActorId) -> bool {
        self.directory.lookup(actor).is_none()
    }
}

fn count_repairs(kind: &str, count: usize) {
    if count > 0 {
        metrics::CONSISTENCY_REPAIRS
            .with_label_values(&[kind])
            .inc_by(count as u64);
    }
}
