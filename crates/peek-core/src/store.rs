//! Persistence contract for pre-session snapshots plus the bundled adapters.

use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::error::PersistenceError;
use crate::snapshot::StateSnapshot;
use crate::types::ActorId;

/// Keyed by actor id, scoped to one logical world/save. Must work for actors that are
/// not currently connected. Saving `None` deletes the record.
pub trait SnapshotStore: Send + Sync {
    fn save_snapshot(
        &self,
        actor: ActorId,
        snapshot: Option<&StateSnapshot>,
    ) -> Result<(), PersistenceError>;

    fn load_snapshot(&self, actor: ActorId) -> Result<Option<StateSnapshot>, PersistenceError>;
}

#[derive(Default)]
pub struct InMemorySnapshotStore {
    records: DashMap<ActorId, StateSnapshot>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, actor: ActorId) -> bool {
        self.records.contains_key(&actor)
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn save_snapshot(
        &self,
        actor: ActorId,
        snapshot: Option<&StateSnapshot>,
    ) -> Result<(), PersistenceError> {
        match snapshot {
            Some(snapshot) => {
                self.records.insert(actor, snapshot.clone());
            }
            None => {
                self.records.remove(&actor);
            }
        }
        Ok(())
    }

    fn load_snapshot(&self, actor: ActorId) -> Result<Option<StateSnapshot>, PersistenceError> {
        Ok(self.records.get(&actor).map(|s| s.clone()))
    }
}

/// One pretty-printed JSON document per actor under `root`.
pub struct JsonFileSnapshotStore {
    root: PathBuf,
}

impl JsonFileSnapshotStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, actor: ActorId) -> PathBuf {
        self.root.join(format!("{actor}.json"))
    }
}

impl SnapshotStore for JsonFileSnapshotStore {
    fn save_snapshot(
        &self,
        actor: ActorId,
        snapshot: Option<&StateSnapshot>,
    ) -> Result<(), PersistenceError> {
        let path = self.path_for(actor);
        let Some(snapshot) = snapshot else {
            return match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(actor = %actor, path = %path.display(), "deleted persisted snapshot");
                    Ok(())
                }
                Err(err) if err.kind() == IoErrorKind::NotFound => Ok(()),
                Err(err) => Err(err.into()),
            };
        };

        // Write to a sibling file first so a crash mid-write never truncates the record.
        let payload = serde_json::to_vec_pretty(snapshot)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, payload)?;
        fs::rename(&tmp, &path)?;
        debug!(actor = %actor, path = %path.display(), "persisted snapshot");
        Ok(())
    }

    fn load_snapshot(&self, actor: ActorId) -> Result<Option<StateSnapshot>, PersistenceError> {
        let path = self.path_for(actor);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == IoErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::tests::sample_snapshot;
    use crate::types::{Location, Position, RealmId};
    use uuid::Uuid;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("peek-store-{}", Uuid::new_v4()))
    }

    #[test]
    fn in_memory_save_none_deletes() {
        let store = InMemorySnapshotStore::new();
        let actor = Uuid::new_v4();
        let snapshot = sample_snapshot(actor);

        store.save_snapshot(actor, Some(&snapshot)).unwrap();
        assert_eq!(store.load_snapshot(actor).unwrap(), Some(snapshot));

        store.save_snapshot(actor, None).unwrap();
        assert_eq!(store.load_snapshot(actor).unwrap(), None);
        assert!(store.is_empty());
    }

    #[test]
    fn json_store_round_trips_and_deletes() {
        let dir = scratch_dir();
        let store = JsonFileSnapshotStore::open(&dir).unwrap();
        let actor = Uuid::new_v4();
        let snapshot = sample_snapshot(actor);

        assert_eq!(store.load_snapshot(actor).unwrap(), None);
        store.save_snapshot(actor, Some(&snapshot)).unwrap();
        assert!(dir.join(format!("{actor}.json")).exists());
        assert_eq!(store.load_snapshot(actor).unwrap(), Some(snapshot));

        store.save_snapshot(actor, None).unwrap();
        store.save_snapshot(actor, None).unwrap();
        assert_eq!(store.load_snapshot(actor).unwrap(), None);

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn json_store_reads_back_exact_coordinates() {
        let dir = scratch_dir();
        let store = JsonFileSnapshotStore::open(&dir).unwrap();
        let actor = Uuid::new_v4();

        let mut coordinates = vec![
            (-13_869_478.113_136_467, 106.322_852_078_134_3),
            (0.1 + 0.2, -1.0 / 3.0),
            (29_999_983.123_456_78, 1e-7),
        ];
        coordinates.extend((1..200).map(|i| {
            let i = f64::from(i);
            (i * 7_919.131_072_013_7 - 1e6 / 3.0, (i * 0.618_033_988_749_894_9).sin() * 1e5)
        }));

        for (x, z) in coordinates {
            let position = Position::new(x, 64.0 + x.fract(), z).with_orientation(
                (x / 7.0) as f32,
                (z / 11.0) as f32,
            );
            let snapshot = sample_snapshot(actor)
                .with_location(Location::new(RealmId::new("overworld"), position));
            store.save_snapshot(actor, Some(&snapshot)).unwrap();
            assert_eq!(store.load_snapshot(actor).unwrap(), Some(snapshot), "x={x} z={z}");
        }

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn json_store_reports_corrupt_records() {
        let dir = scratch_dir();
        let store = JsonFileSnapshotStore::open(&dir).unwrap();
        let actor = Uuid::new_v4();
        fs::write(dir.join(format!("{actor}.json")), b"{not json").unwrap();

        assert!(matches!(
            store.load_snapshot(actor),
            Err(PersistenceError::Serde(_))
        ));
        fs::remove_dir_all(dir).ok();
    }
}
