//! Precondition checks shared by request sending and session creation. Each returns the
//! first failing precondition.

use crate::config::PeekConfig;
use crate::directory::ActorDirectory;
use crate::error::{PeekError, PeekResult};
use crate::types::{ActorView, Location};

pub fn check_stationary(config: &PeekConfig, view: &ActorView) -> PeekResult<()> {
    if view.privileged || view.speed() <= config.stationary_epsilon {
        Ok(())
    } else {
        Err(PeekError::NotStationary)
    }
}

pub fn check_hostiles(
    config: &PeekConfig,
    directory: &dyn ActorDirectory,
    view: &ActorView,
) -> PeekResult<()> {
    if view.privileged || config.hostile_check_radius <= 0.0 {
        return Ok(());
    }
    match directory.hostiles_near(view.id, config.hostile_check_radius) {
        0 => Ok(()),
        count => Err(PeekError::HostilesNearby { count }),
    }
}

/// Realm and distance policy between where the peeker really is (`origin`) and the
/// target.
pub fn check_distance_policy(
    config: &PeekConfig,
    origin: &Location,
    target: &Location,
) -> PeekResult<()> {
    let Some(distance) = origin.distance_in_realm(target) else {
        return if config.allow_cross_realm {
            Ok(())
        } else {
            Err(PeekError::CrossRealmDisabled)
        };
    };
    if config.min_peek_distance > 0.0 && distance < config.min_peek_distance {
        return Err(PeekError::TooClose {
            distance,
            min: config.min_peek_distance,
        });
    }
    if config.max_peek_distance > 0.0 && distance > config.max_peek_distance {
        return Err(PeekError::TooFar {
            distance,
            max: config.max_peek_distance,
        });
    }
    Ok(())
}
