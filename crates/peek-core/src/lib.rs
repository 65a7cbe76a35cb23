//! Coordination core for temporary observation ("peek") sessions.
//!
//! A peeker asks to observe a target; once accepted the peeker's state is captured and
//! persisted, the peeker becomes a non-interacting observer next to the target, and on
//! exit everything is restored. Time advances only through the tick driver
//! ([`PeekServices::tick`]), which also runs session monitoring and the periodic
//! consistency audit.

pub mod config;
pub mod consistency;
pub mod cooldown;
pub mod directory;
pub mod error;
pub mod events;
pub mod metrics;
pub mod request;
pub mod scheduler;
pub mod services;
pub mod session;
pub mod snapshot;
pub mod store;
pub mod types;
pub mod validation;

pub use config::{DistancePolicy, PeekConfig};
pub use consistency::{ConsistencyChecker, ConsistencyReport};
pub use directory::{ActorDirectory, InMemoryDirectory};
pub use error::{DirectoryError, ErrorKind, PeekError, PeekResult, PersistenceError, StatsError};
pub use events::{
    InMemoryStats, Notifier, PeekEvent, RecordingNotifier, SessionStats, StatsSink,
    TracingNotifier,
};
pub use request::{Invite, PeekRequest, RequestCoordinator, RequestId, RequestStatus, SendOutcome};
pub use scheduler::{TaskId, TaskKind, TickScheduler};
pub use services::{Collaborators, PeekServices, TickReport};
pub use session::{
    MonitorReport, PeekSession, RecoveryOutcome, SessionCoordinator, SessionEnded, SessionId,
    StopReason,
};
pub use snapshot::{SnapshotService, StateSnapshot};
pub use store::{InMemorySnapshotStore, JsonFileSnapshotStore, SnapshotStore};
pub use types::{
    ActorId, ActorView, InteractionMode, Location, Position, RealmId, SpecialFields,
    TimedCondition,
};
