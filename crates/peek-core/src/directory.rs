use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::error::DirectoryError;
use crate::types::{
    ActorId, ActorView, InteractionMode, Location, Position, RealmId, SpecialFields,
    TimedCondition,
};

/// Live actor state owned by the host process.
///
/// `lookup` returning `None` means the actor is disconnected; callers treat that as a
/// normal outcome, never as an error.
pub trait ActorDirectory: Send + Sync {
    fn lookup(&self, id: ActorId) -> Option<ActorView>;

    fn realm_exists(&self, realm: &RealmId) -> bool;

    fn set_mode(&self, id: ActorId, mode: InteractionMode) -> Result<(), DirectoryError>;

    fn teleport(
        &self,
        id: ActorId,
        realm: &RealmId,
        position: Position,
    ) -> Result<(), DirectoryError>;

    fn clear_conditions(&self, id: ActorId) -> Result<(), DirectoryError>;

    fn apply_conditions(
        &self,
        id: ActorId,
        conditions: &[TimedCondition],
    ) -> Result<(), DirectoryError>;

    fn apply_special(&self, id: ActorId, special: SpecialFields) -> Result<(), DirectoryError>;

    /// Hostile entities within `radius` of the actor.
    fn hostiles_near(&self, id: ActorId, radius: f64) -> usize;
}

/// In-memory directory for tests and the harness.
#[derive(Default)]
pub struct InMemoryDirectory {
    actors: DashMap<ActorId, ActorView>,
    realms: RwLock<HashSet<RealmId>>,
    hostiles: DashMap<ActorId, usize>,
    blocked_realms: RwLock<HashSet<RealmId>>,
}

impl InMemoryDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_realm(&self, realm: RealmId) {
        self.realms.write().insert(realm);
    }

    pub fn remove_realm(&self, realm: &RealmId) {
        self.realms.write().remove(realm);
    }

    /// Connects an actor; its realm is registered implicitly.
    pub fn connect(&self, view: ActorView) {
        self.add_realm(view.location.realm.clone());
        self.actors.insert(view.id, view);
    }

    pub fn disconnect(&self, id: ActorId) -> Option<ActorView> {
        self.actors.remove(&id).map(|(_, view)| view)
    }

    pub fn update<F>(&self, id: ActorId, f: F) -> bool
    where
        F: FnOnce(&mut ActorView),
    {
        match self.actors.get_mut(&id) {
            Some(mut view) => {
                f(&mut view);
                true
            }
            None => false,
        }
    }

    pub fn move_to(&self, id: ActorId, location: Location) -> bool {
        self.add_realm(location.realm.clone());
        self.update(id, |view| view.location = location)
    }

    pub fn set_hostiles(&self, id: ActorId, count: usize) {
        self.hostiles.insert(id, count);
    }

    /// Makes every teleport into `realm` fail until unblocked.
    pub fn block_teleports_into(&self, realm: RealmId) {
        self.blocked_realms.write().insert(realm);
    }

    pub fn unblock_teleports_into(&self, realm: &RealmId) {
        self.blocked_realms.write().remove(realm);
    }

    fn with_actor<F>(&self, id: ActorId, f: F) -> Result<(), DirectoryError>
    where
        F: FnOnce(&mut ActorView),
    {
        if self.update(id, f) {
            Ok(())
        } else {
            Err(DirectoryError::Offline(id))
        }
    }
}

impl ActorDirectory for InMemoryDirectory {
    fn lookup(&self, id: ActorId) -> Option<ActorView> {
        self.actors.get(&id).map(|view| view.clone())
    }

    fn realm_exists(&self, realm: &RealmId) -> bool {
        self.realms.read().contains(realm)
    }

    fn set_mode(&self, id: ActorId, mode: InteractionMode) -> Result<(), DirectoryError> {
        self.with_actor(id, |view| view.mode = mode)
    }

    fn teleport(
        &self,
        id: ActorId,
        realm: &RealmId,
        position: Position,
    ) -> Result<(), DirectoryError> {
        if !self.realm_exists(realm) {
            return Err(DirectoryError::UnknownRealm(realm.clone()));
        }
        if self.blocked_realms.read().contains(realm) {
            return Err(DirectoryError::TeleportRejected(format!(
                "teleports into {realm} are blocked"
            )));
        }
        self.with_actor(id, |view| {
            view.location = Location::new(realm.clone(), position);
            view.velocity = [0.0; 3];
        })
    }

    fn clear_conditions(&self, id: ActorId) -> Result<(), DirectoryError> {
        self.with_actor(id, |view| view.conditions.clear())
    }

    fn apply_conditions(
        &self,
        id: ActorId,
        conditions: &[TimedCondition],
    ) -> Result<(), DirectoryError> {
        self.with_actor(id, |view| {
            for condition in conditions {
                view.conditions.retain(|c| c.kind != condition.kind);
                view.conditions.push(condition.clone());
            }
        })
    }

    fn apply_special(&self, id: ActorId, special: SpecialFields) -> Result<(), DirectoryError> {
        self.with_actor(id, |view| view.special = special)
    }

    fn hostiles_near(&self, id: ActorId, _radius: f64) -> usize {
        self.hostiles.get(&id).map(|count| *count).unwrap_or(0)
    }
}
