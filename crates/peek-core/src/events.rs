//! Outbound collaborator contracts: lifecycle notifications and session statistics.
//! Neither is allowed to influence the outcome of the operation that emitted it.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::error::StatsError;
use crate::request::RequestId;
use crate::session::{SessionId, StopReason};
use crate::types::{ActorId, RealmId};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeekEvent {
    RequestSent {
        request_id: RequestId,
        requester: ActorId,
        target: ActorId,
        auto_accept: bool,
    },
    RequestAccepted {
        request_id: RequestId,
        requester: ActorId,
        target: ActorId,
    },
    RequestDenied {
        request_id: RequestId,
        requester: ActorId,
        target: ActorId,
    },
    RequestExpired {
        request_id: RequestId,
        requester: ActorId,
        target: ActorId,
    },
    RequestCancelled {
        request_id: RequestId,
        requester: ActorId,
        target: ActorId,
    },
    InviteSent {
        inviter: ActorId,
        invitee: ActorId,
    },
    InviteConsumed {
        inviter: ActorId,
        invitee: ActorId,
    },
    InviteExpired {
        inviter: ActorId,
        invitee: ActorId,
    },
    SessionStarted {
        session_id: SessionId,
        peeker: ActorId,
        target: ActorId,
        switched: bool,
    },
    /// Sent to the previous target when its peeker moved on to someone else.
    SwitchedAway {
        peeker: ActorId,
        previous_target: ActorId,
        new_target: ActorId,
    },
    SessionEnded {
        session_id: SessionId,
        peeker: ActorId,
        target: ActorId,
        reason: StopReason,
        restored: bool,
    },
    TargetRealmChanged {
        session_id: SessionId,
        peeker: ActorId,
        target: ActorId,
        realm: RealmId,
        follow_in_ticks: Option<u64>,
    },
    RecoveryCompleted {
        actor: ActorId,
        restored: bool,
    },
}

pub trait Notifier: Send + Sync {
    fn notify(&self, event: &PeekEvent);
}

/// Logs every event; the default when no presentation layer is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, event: &PeekEvent) {
        info!(event = ?event, "peek event");
    }
}

/// Keeps every event in memory, for tests.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<PeekEvent>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<PeekEvent> {
        self.events.lock().clone()
    }

    pub fn take(&self) -> Vec<PeekEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn count_matching<F>(&self, predicate: F) -> usize
    where
        F: Fn(&PeekEvent) -> bool,
    {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: &PeekEvent) {
        self.events.lock().push(event.clone());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStats {
    pub peeker_id: ActorId,
    pub peeker_name: String,
    pub target_id: ActorId,
    pub target_name: String,
    pub duration_secs: u64,
    pub crossed_realm: bool,
    pub reason: StopReason,
}

/// Fire-and-forget from the coordinator's point of view.
pub trait StatsSink: Send + Sync {
    fn record_session(&self, stats: &SessionStats) -> Result<(), StatsError>;
}

#[derive(Default)]
pub struct InMemoryStats {
    records: Mutex<Vec<SessionStats>>,
}

impl InMemoryStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<SessionStats> {
        self.records.lock().clone()
    }
}

impl StatsSink for InMemoryStats {
    fn record_session(&self, stats: &SessionStats) -> Result<(), StatsError> {
        self.records.lock().push(stats.clone());
        Ok(())
    }
}
