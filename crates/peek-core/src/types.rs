//! Value types shared by every coordinator: actor identity, realms, positions, and the
//! live view of an actor handed out by the [`ActorDirectory`](crate::directory::ActorDirectory).

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type ActorId = Uuid;

/// Stable identifier of an isolated world/dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RealmId(String);

impl RealmId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for RealmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Spatial position plus orientation.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default)]
    pub yaw: f32,
    #[serde(default)]
    pub pitch: f32,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self {
            x,
            y,
            z,
            yaw: 0.0,
            pitch: 0.0,
        }
    }

    pub fn with_orientation(mut self, yaw: f32, pitch: f32) -> Self {
        self.yaw = yaw;
        self.pitch = pitch;
        self
    }

    pub fn distance(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite()
            && self.y.is_finite()
            && self.z.is_finite()
            && self.yaw.is_finite()
            && self.pitch.is_finite()
    }
}

/// A position inside a specific realm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub realm: RealmId,
    pub position: Position,
}

impl Location {
    pub fn new(realm: RealmId, position: Position) -> Self {
        Self { realm, position }
    }

    /// Distance when both locations share a realm, `None` across realms.
    pub fn distance_in_realm(&self, other: &Location) -> Option<f64> {
        (self.realm == other.realm).then(|| self.position.distance(&other.position))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionMode {
    Survival,
    Creative,
    Adventure,
    Spectator,
}

impl InteractionMode {
    pub fn is_observer(self) -> bool {
        matches!(self, InteractionMode::Spectator)
    }
}

/// A status condition with a remaining duration, e.g. a potion effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedCondition {
    pub kind: String,
    pub amplifier: u8,
    pub remaining_ticks: i32,
    #[serde(default)]
    pub ambient: bool,
    #[serde(default = "default_true")]
    pub visible: bool,
}

impl TimedCondition {
    pub fn new(kind: impl Into<String>, amplifier: u8, remaining_ticks: i32) -> Self {
        Self {
            kind: kind.into(),
            amplifier,
            remaining_ticks,
            ambient: false,
            visible: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Scalar timers restored alongside the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpecialFields {
    pub fire_ticks: i32,
    pub air_ticks: i32,
    pub vehicle_cooldown_ticks: i32,
}

/// Point-in-time view of a reachable actor.
#[derive(Debug, Clone, PartialEq)]
pub struct ActorView {
    pub id: ActorId,
    pub name: String,
    pub location: Location,
    /// Blocks per tick.
    pub velocity: [f64; 3],
    pub mode: InteractionMode,
    pub conditions: Vec<TimedCondition>,
    pub special: SpecialFields,
    /// Bypasses the stationary and hostile-presence checks.
    pub privileged: bool,
}

impl ActorView {
    pub fn new(id: ActorId, name: impl Into<String>, location: Location) -> Self {
        Self {
            id,
            name: name.into(),
            location,
            velocity: [0.0; 3],
            mode: InteractionMode::Survival,
            conditions: Vec::new(),
            special: SpecialFields {
                fire_ticks: 0,
                air_ticks: 300,
                vehicle_cooldown_ticks: 0,
            },
            privileged: false,
        }
    }

    pub fn speed(&self) -> f64 {
        let [x, y, z] = self.velocity;
        (x * x + y * y + z * z).sqrt()
    }
}
