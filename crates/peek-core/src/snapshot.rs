//! Capture, validation, restoration, and durable persistence of an actor's
//! pre-session state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::directory::ActorDirectory;
use crate::error::{PeekError, PeekResult};
use crate::store::SnapshotStore;
use crate::types::{
    ActorId, InteractionMode, Location, SpecialFields, TimedCondition,
};

pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;
pub const MAX_FIRE_TICKS: i32 = 32_767;
pub const MAX_AIR_TICKS: i32 = 300;
pub const MAX_VEHICLE_COOLDOWN_TICKS: i32 = 32_767;
pub const MAX_CONDITION_TICKS: i32 = 1_000_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub format_version: u32,
    pub actor_id: ActorId,
    pub actor_name: String,
    pub location: Location,
    pub mode: InteractionMode,
    #[serde(default)]
    pub conditions: Vec<TimedCondition>,
    #[serde(default)]
    pub special: SpecialFields,
    pub captured_at: DateTime<Utc>,
}

impl StateSnapshot {
    pub fn with_location(mut self, location: Location) -> Self {
        self.location = location;
        self
    }

    pub fn with_special(mut self, special: SpecialFields) -> Self {
        self.special = special;
        self
    }

    pub fn with_conditions(mut self, conditions: Vec<TimedCondition>) -> Self {
        self.conditions = conditions;
        self
    }

    /// Bounds-checks every field. Invalid snapshots must be discarded, never applied.
    pub fn validate(&self) -> Result<(), SnapshotViolation> {
        if self.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(SnapshotViolation::UnsupportedVersion(self.format_version));
        }
        if self.location.realm.is_blank() {
            return Err(SnapshotViolation::MissingRealm);
        }
        if !self.location.position.is_finite() {
            return Err(SnapshotViolation::NonFinitePosition);
        }
        check_range("fire_ticks", self.special.fire_ticks, MAX_FIRE_TICKS)?;
        check_range("air_ticks", self.special.air_ticks, MAX_AIR_TICKS)?;
        check_range(
            "vehicle_cooldown_ticks",
            self.special.vehicle_cooldown_ticks,
            MAX_VEHICLE_COOLDOWN_TICKS,
        )?;
        for condition in &self.conditions {
            if condition.kind.trim().is_empty() {
                return Err(SnapshotViolation::UnnamedCondition);
            }
            check_range(
                "condition.remaining_ticks",
                condition.remaining_ticks,
                MAX_CONDITION_TICKS,
            )?;
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

fn check_range(field: &'static str, value: i32, max: i32) -> Result<(), SnapshotViolation> {
    if (0..=max).contains(&value) {
        Ok(())
    } else {
        Err(SnapshotViolation::OutOfRange { field, value, max })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotViolation {
    #[error("unsupported snapshot format version {0}")]
    UnsupportedVersion(u32),
    #[error("snapshot has no realm")]
    MissingRealm,
    #[error("snapshot position is not finite")]
    NonFinitePosition,
    #[error("{field} = {value} outside 0..={max}")]
    OutOfRange {
        field: &'static str,
        value: i32,
        max: i32,
    },
    #[error("timed condition without a kind")]
    UnnamedCondition,
}

/// Reads live state through the directory and persists it through the store.
#[derive(Clone)]
pub struct SnapshotService {
    directory: Arc<dyn ActorDirectory>,
    store: Arc<dyn SnapshotStore>,
}

impl SnapshotService {
    pub fn new(directory: Arc<dyn ActorDirectory>, store: Arc<dyn SnapshotStore>) -> Self {
        Self { directory, store }
    }

    pub fn capture(&self, actor: ActorId) -> PeekResult<StateSnapshot> {
        let view = self
            .directory
            .lookup(actor)
            .ok_or(PeekError::ActorOffline(actor))?;
        Ok(StateSnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            actor_id: view.id,
            actor_name: view.name,
            location: view.location,
            mode: view.mode,
            conditions: view.conditions,
            special: view.special,
            captured_at: Utc::now(),
        })
    }

    /// Applies mode, clears transient conditions, teleports to the saved location
    /// (or the actor's current realm if the saved one no longer exists), then
    /// re-applies saved conditions and scalar timers.
    pub fn restore(&self, actor: ActorId, snapshot: &StateSnapshot) -> PeekResult<()> {
        snapshot
            .validate()
            .map_err(|violation| PeekError::RestoreFailed(violation.to_string()))?;
        let current = self
            .directory
            .lookup(actor)
            .ok_or_else(|| PeekError::RestoreFailed(format!("actor {actor} is offline")))?;

        let restore_err = |step: &str, err: crate::error::DirectoryError| {
            PeekError::RestoreFailed(format!("{step}: {err}"))
        };

        self.directory
            .set_mode(actor, snapshot.mode)
            .map_err(|e| restore_err("set mode", e))?;
        self.directory
            .clear_conditions(actor)
            .map_err(|e| restore_err("clear conditions", e))?;

        let realm = if self.directory.realm_exists(&snapshot.location.realm) {
            snapshot.location.realm.clone()
        } else {
            warn!(
                actor = %actor,
                saved_realm = %snapshot.location.realm,
                fallback_realm = %current.location.realm,
                "saved realm no longer exists, restoring into current realm"
            );
            current.location.realm.clone()
        };
        self.directory
            .teleport(actor, &realm, snapshot.location.position)
            .map_err(|e| restore_err("teleport", e))?;

        if !snapshot.conditions.is_empty() {
            self.directory
                .apply_conditions(actor, &snapshot.conditions)
                .map_err(|e| restore_err("apply conditions", e))?;
        }
        self.directory
            .apply_special(actor, snapshot.special)
            .map_err(|e| restore_err("apply special fields", e))?;

        debug!(actor = %actor, realm = %realm, "restored pre-session state");
        Ok(())
    }

    /// Persists and verifies the write by reading it back.
    pub fn persist(&self, actor: ActorId, snapshot: &StateSnapshot) -> PeekResult<()> {
        self.store.save_snapshot(actor, Some(snapshot))?;
        match self.store.load_snapshot(actor)? {
            Some(stored) if stored == *snapshot => Ok(()),
            Some(_) => Err(PeekError::SnapshotPersistFailed(
                "read-back differs from written snapshot".into(),
            )),
            None => Err(PeekError::SnapshotPersistFailed(
                "read-back found no snapshot".into(),
            )),
        }
    }

    /// Best-effort persist used when restoration cannot happen now.
    pub fn persist_for_retry(&self, actor: ActorId, snapshot: &StateSnapshot) -> bool {
        match self.store.save_snapshot(actor, Some(snapshot)) {
            Ok(()) => {
                info!(actor = %actor, "snapshot kept for later recovery");
                true
            }
            Err(err) => {
                warn!(actor = %actor, error = %err, "failed to persist snapshot for retry");
                false
            }
        }
    }

    pub fn load(&self, actor: ActorId) -> PeekResult<Option<StateSnapshot>> {
        Ok(self.store.load_snapshot(actor)?)
    }

    pub fn clear(&self, actor: ActorId) -> PeekResult<()> {
        Ok(self.store.save_snapshot(actor, None)?)
    }

    pub fn directory(&self) -> &Arc<dyn ActorDirectory> {
        &self.directory
    }
}
