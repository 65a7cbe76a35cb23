use thiserror::Error;

use crate::types::{ActorId, RealmId};

/// Coarse classification used for logging and by callers that only care whether an
/// operation was declined or actually broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Session,
    Request,
    Teleport,
    Persistence,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PeekError {
    // validation
    #[error("cannot peek yourself")]
    SelfTarget,
    #[error("actor {0} is not reachable")]
    ActorOffline(ActorId),
    #[error("peeker must stand still")]
    NotStationary,
    #[error("{count} hostile(s) nearby")]
    HostilesNearby { count: usize },
    #[error("target is too close ({distance:.1} < {min:.1})")]
    TooClose { distance: f64, min: f64 },
    #[error("target is too far ({distance:.1} > {max:.1})")]
    TooFar { distance: f64, max: f64 },
    #[error("cross-realm peeking is disabled")]
    CrossRealmDisabled,
    #[error("cooldown active for {remaining_secs}s")]
    CooldownActive { remaining_secs: u64 },
    #[error("switching between these actors too frequently")]
    TooFrequent,
    #[error("target does not accept peek requests")]
    TargetPrivate,

    // session
    #[error("session not found")]
    SessionNotFound,
    #[error("session already exists")]
    SessionAlreadyExists,
    #[error("active session limit reached")]
    SessionLimitExceeded,
    #[error("target is already observed by the maximum number of peekers")]
    TargetSessionLimit,
    #[error("already peeking this target")]
    AlreadyPeeking,
    #[error("actor is being peeked")]
    BeingPeeked,
    #[error("target is peeking someone else")]
    TargetIsPeeking,
    #[error("not peeking anyone")]
    NotPeekingAnyone,

    // request
    #[error("request not found")]
    RequestNotFound,
    #[error("request expired")]
    RequestExpired,
    #[error("a pending request already exists")]
    RequestAlreadyExists,
    #[error("target has too many pending decisions")]
    TargetBusy,
    #[error("no pending invite")]
    InviteNotFound,

    // teleport
    #[error("teleport into {realm} failed (cross realm: {cross_realm}): {reason}")]
    TeleportFailed {
        realm: RealmId,
        cross_realm: bool,
        reason: String,
    },

    // persistence / restore
    #[error("snapshot persistence failed: {0}")]
    SnapshotPersistFailed(String),
    #[error("persisted snapshot was invalid and has been discarded: {0}")]
    SnapshotDiscarded(String),
    #[error("state restore failed: {0}")]
    RestoreFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PeekError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PeekError::SelfTarget
            | PeekError::ActorOffline(_)
            | PeekError::NotStationary
            | PeekError::HostilesNearby { .. }
            | PeekError::TooClose { .. }
            | PeekError::TooFar { .. }
            | PeekError::CrossRealmDisabled
            | PeekError::CooldownActive { .. }
            | PeekError::TooFrequent
            | PeekError::TargetPrivate => ErrorKind::Validation,
            PeekError::SessionNotFound
            | PeekError::SessionAlreadyExists
            | PeekError::SessionLimitExceeded
            | PeekError::TargetSessionLimit
            | PeekError::AlreadyPeeking
            | PeekError::BeingPeeked
            | PeekError::TargetIsPeeking
            | PeekError::NotPeekingAnyone => ErrorKind::Session,
            PeekError::RequestNotFound
            | PeekError::RequestExpired
            | PeekError::RequestAlreadyExists
            | PeekError::TargetBusy
            | PeekError::InviteNotFound => ErrorKind::Request,
            PeekError::TeleportFailed { .. } => ErrorKind::Teleport,
            PeekError::SnapshotPersistFailed(_)
            | PeekError::SnapshotDiscarded(_)
            | PeekError::RestoreFailed(_) => ErrorKind::Persistence,
            PeekError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Stable, translatable code for user-facing layers.
    pub fn code(&self) -> &'static str {
        match self {
            PeekError::SelfTarget => "peek.validation.self_target",
            PeekError::ActorOffline(_) => "peek.validation.actor_offline",
            PeekError::NotStationary => "peek.validation.not_stationary",
            PeekError::HostilesNearby { .. } => "peek.validation.hostiles_nearby",
            PeekError::TooClose { .. } => "peek.validation.too_close",
            PeekError::TooFar { .. } => "peek.validation.too_far",
            PeekError::CrossRealmDisabled => "peek.validation.cross_realm_disabled",
            PeekError::CooldownActive { .. } => "peek.validation.cooldown_active",
            PeekError::TooFrequent => "peek.validation.too_frequent",
            PeekError::TargetPrivate => "peek.validation.target_private",
            PeekError::SessionNotFound => "peek.session.not_found",
            PeekError::SessionAlreadyExists => "peek.session.already_exists",
            PeekError::SessionLimitExceeded => "peek.session.limit_exceeded",
            PeekError::TargetSessionLimit => "peek.session.target_limit",
            PeekError::AlreadyPeeking => "peek.session.already_peeking",
            PeekError::BeingPeeked => "peek.session.being_peeked",
            PeekError::TargetIsPeeking => "peek.session.target_is_peeking",
            PeekError::NotPeekingAnyone => "peek.session.not_peeking",
            PeekError::RequestNotFound => "peek.request.not_found",
            PeekError::RequestExpired => "peek.request.expired",
            PeekError::RequestAlreadyExists => "peek.request.already_exists",
            PeekError::TargetBusy => "peek.request.target_busy",
            PeekError::InviteNotFound => "peek.request.invite_not_found",
            PeekError::TeleportFailed { .. } => "peek.teleport.failed",
            PeekError::SnapshotPersistFailed(_) => "peek.persistence.save_failed",
            PeekError::SnapshotDiscarded(_) => "peek.persistence.snapshot_discarded",
            PeekError::RestoreFailed(_) => "peek.persistence.restore_failed",
            PeekError::Internal(_) => "peek.internal",
        }
    }
}

/// Failures reported by the actor directory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("actor {0} is not reachable")]
    Offline(ActorId),
    #[error("realm {0} does not exist")]
    UnknownRealm(RealmId),
    #[error("teleport rejected: {0}")]
    TeleportRejected(String),
    #[error("directory error: {0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("persistence backend error: {0}")]
    Backend(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<PersistenceError> for PeekError {
    fn from(err: PersistenceError) -> Self {
        PeekError::SnapshotPersistFailed(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("stats backend error: {0}")]
    Backend(String),
}

pub type PeekResult<T> = Result<T, PeekError>;
