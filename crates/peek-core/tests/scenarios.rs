use std::path::PathBuf;
use std::sync::Arc;

use peek_core::{
    ActorDirectory, ActorId, ActorView, Collaborators, ErrorKind, InMemoryDirectory, InMemorySnapshotStore,
    InMemoryStats, InteractionMode, JsonFileSnapshotStore, Location, PeekConfig, PeekError,
    PeekEvent, PeekServices, Position, RealmId, RecordingNotifier, RecoveryOutcome,
    RequestStatus, SendOutcome, SessionStats, SnapshotStore, SpecialFields, StatsError,
    StatsSink, StopReason, TimedCondition,
};
use uuid::Uuid;

struct World {
    services: PeekServices,
    directory: Arc<InMemoryDirectory>,
    store: Arc<dyn SnapshotStore>,
    stats: Arc<InMemoryStats>,
    events: Arc<RecordingNotifier>,
}

impl World {
    fn new(config: PeekConfig) -> Self {
        Self::with_store(config, InMemorySnapshotStore::new())
    }

    fn with_store(config: PeekConfig, store: Arc<dyn SnapshotStore>) -> Self {
        let directory = InMemoryDirectory::new();
        directory.add_realm(RealmId::new("overworld"));
        directory.add_realm(RealmId::new("nether"));
        Self::over(config, directory, store)
    }

    fn over(
        config: PeekConfig,
        directory: Arc<InMemoryDirectory>,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        let stats = InMemoryStats::new();
        let events = RecordingNotifier::new();
        let collaborators = Collaborators::new(directory.clone(), store.clone(), stats.clone())
            .with_notifier(events.clone());
        Self {
            services: PeekServices::new(config, collaborators),
            directory,
            store,
            stats,
            events,
        }
    }

    fn spawn(&self, name: &str, realm: &str, x: f64) -> ActorId {
        let id = Uuid::new_v4();
        let location = Location::new(RealmId::new(realm), Position::new(x, 64.0, 0.0));
        self.directory.connect(ActorView::new(id, name, location));
        id
    }

    fn x_of(&self, actor: ActorId) -> f64 {
        self.directory.lookup(actor).unwrap().location.position.x
    }

    fn request(&self, requester: ActorId, target: ActorId) -> peek_core::PeekRequest {
        match self.services.requests().send_request(requester, target).unwrap() {
            SendOutcome::Pending(request) => request,
            SendOutcome::Started(session) => panic!("unexpected session {session:?}"),
        }
    }

    fn peek(&self, peeker: ActorId, target: ActorId) {
        self.request(peeker, target);
        self.services
            .requests()
            .accept_request(target, Some(peeker))
            .unwrap();
    }
}

fn fast_config() -> PeekConfig {
    PeekConfig {
        tick_millis: 1_000,
        request_timeout_secs: 3,
        request_cooldown_secs: 0,
        ..PeekConfig::default()
    }
}

fn scratch_dir() -> PathBuf {
    std::env::temp_dir().join(format!("peek-scenario-{}", Uuid::new_v4()))
}

#[test_timeout::timeout]
fn accepted_request_starts_a_session() {
    let world = World::new(PeekConfig::default());
    let p = world.spawn("p", "overworld", 0.0);
    let t = world.spawn("t", "overworld", 40.0);

    let request = world.request(p, t);
    assert_eq!(
        world.services.requests().pending_requests_for(t),
        vec![request.clone()]
    );
    let session = world
        .services
        .requests()
        .accept_request(t, None)
        .unwrap();

    let sessions = world.services.sessions();
    assert!(sessions.is_peeking(p));
    assert!(sessions.is_being_peeked(t));
    assert_eq!(session.target_id, t);
    assert_eq!(
        world.services.requests().request_status(request.id),
        Some(RequestStatus::Accepted)
    );
    assert_eq!(world.x_of(p), 40.0);
    assert_eq!(
        world.directory.lookup(p).unwrap().mode,
        InteractionMode::Spectator
    );
}

#[test_timeout::timeout]
fn unanswered_request_expires() {
    let world = World::new(fast_config());
    let p = world.spawn("p", "overworld", 0.0);
    let t = world.spawn("t", "overworld", 40.0);

    let request = world.request(p, t);
    world.services.advance(2);
    assert_eq!(
        world.services.requests().request_status(request.id),
        Some(RequestStatus::Pending)
    );
    world.services.advance(1);

    let requests = world.services.requests();
    assert_eq!(
        requests.request_status(request.id),
        Some(RequestStatus::Expired)
    );
    assert!(requests.pending_request_from(p).is_none());
    assert!(requests.pending_requests_for(t).is_empty());
    assert_eq!(
        world
            .events
            .count_matching(|e| matches!(e, PeekEvent::RequestExpired { .. })),
        1
    );
    assert_eq!(
        requests.accept_request(t, Some(p)),
        Err(PeekError::RequestExpired)
    );
}

#[test_timeout::timeout]
fn switching_targets_keeps_the_original_snapshot() {
    let world = World::new(fast_config());
    let p = world.spawn("p", "overworld", 0.0);
    let t1 = world.spawn("t1", "overworld", 40.0);
    let t2 = world.spawn("t2", "nether", 5.0);
    world.directory.update(p, |v| {
        v.conditions = vec![TimedCondition::new("regeneration", 0, 400)]
    });

    world.peek(p, t1);
    let original = world.services.sessions().session_of(p).unwrap().snapshot;

    world.peek(p, t2);
    let session = world.services.sessions().session_of(p).unwrap();
    assert_eq!(session.target_id, t2);
    assert_eq!(session.snapshot, original);
    assert_eq!(world.store.load_snapshot(p).unwrap(), Some(original.clone()));
    assert!(!world.services.sessions().is_being_peeked(t1));
    assert_eq!(
        world.events.count_matching(|e| matches!(
            e,
            PeekEvent::SwitchedAway { previous_target, new_target, .. }
                if *previous_target == t1 && *new_target == t2
        )),
        1
    );

    world
        .services
        .sessions()
        .stop_session(p, StopReason::Voluntary)
        .unwrap();
    let restored = world.directory.lookup(p).unwrap();
    assert_eq!(restored.location, original.location);
    assert_eq!(restored.conditions, original.conditions);
}

#[test_timeout::timeout]
fn crash_recovery_restores_from_disk() {
    let dir = scratch_dir();
    let directory = InMemoryDirectory::new();
    directory.add_realm(RealmId::new("overworld"));
    let store: Arc<dyn SnapshotStore> = Arc::new(JsonFileSnapshotStore::open(&dir).unwrap());
    let world = World::over(PeekConfig::default(), directory.clone(), store);
    let p = world.spawn("p", "overworld", 0.0);
    let t = world.spawn("t", "overworld", 40.0);
    world.peek(p, t);
    assert_eq!(world.x_of(p), 40.0);

    // crash: in-memory session state is gone, the snapshot file is not
    drop(world);
    let reopened: Arc<dyn SnapshotStore> = Arc::new(JsonFileSnapshotStore::open(&dir).unwrap());
    let world = World::over(PeekConfig::default(), directory, reopened);
    assert!(world.store.load_snapshot(p).unwrap().is_some());

    assert_eq!(
        world.services.on_actor_join(p),
        Ok(RecoveryOutcome::Restored)
    );
    let restored = world.directory.lookup(p).unwrap();
    assert_eq!(restored.location.position.x, 0.0);
    assert_eq!(restored.mode, InteractionMode::Survival);
    assert_eq!(world.store.load_snapshot(p).unwrap(), None);
    assert_eq!(
        world.services.on_actor_join(p),
        Ok(RecoveryOutcome::NothingToRecover)
    );
    let _ = std::fs::remove_dir_all(dir);
}

#[test_timeout::timeout]
fn sessions_start_over_disk_store_from_fractional_positions() {
    let dir = scratch_dir();
    let store: Arc<dyn SnapshotStore> = Arc::new(JsonFileSnapshotStore::open(&dir).unwrap());
    let world = World::with_store(fast_config(), store);
    let t = world.spawn("t", "overworld", 40.0);

    for i in 1..=100 {
        let i = f64::from(i);
        let origin = Location::new(
            RealmId::new("overworld"),
            Position::new(
                -13_869_478.113_136_467 / i,
                64.0 + 1.0 / i,
                106.322_852_078_134_3 * i.sqrt(),
            ),
        );
        let p = Uuid::new_v4();
        world
            .directory
            .connect(ActorView::new(p, format!("p{i}"), origin.clone()));

        world.peek(p, t);
        let ended = world
            .services
            .sessions()
            .stop_session(p, StopReason::Voluntary)
            .unwrap();
        assert!(ended.restored);
        assert_eq!(world.directory.lookup(p).unwrap().location, origin);
        assert_eq!(world.store.load_snapshot(p).unwrap(), None);
    }
    let _ = std::fs::remove_dir_all(dir);
}

#[test_timeout::timeout]
fn invalid_persisted_snapshot_is_discarded() {
    let world = World::new(PeekConfig::default());
    let p = world.spawn("p", "overworld", 0.0);
    let broken = world
        .services
        .snapshots()
        .capture(p)
        .unwrap()
        .with_special(SpecialFields {
            fire_ticks: 40_000,
            ..SpecialFields::default()
        });
    world.store.save_snapshot(p, Some(&broken)).unwrap();
    world.directory.move_to(
        p,
        Location::new(RealmId::new("overworld"), Position::new(99.0, 64.0, 0.0)),
    );

    let err = world.services.on_actor_join(p).unwrap_err();
    assert!(matches!(err, PeekError::SnapshotDiscarded(_)));
    assert_eq!(err.kind(), ErrorKind::Persistence);
    assert_eq!(world.store.load_snapshot(p).unwrap(), None);
    assert_eq!(world.x_of(p), 99.0);
}

#[test_timeout::timeout]
fn failed_recovery_keeps_snapshot_for_retry() {
    let world = World::new(PeekConfig::default());
    let p = world.spawn("p", "overworld", 0.0);
    let t = world.spawn("t", "overworld", 40.0);
    world.peek(p, t);
    let view = world.directory.disconnect(p).unwrap();
    world.services.on_actor_leave(p);
    assert!(world.store.load_snapshot(p).unwrap().is_some());

    // still offline: restore cannot happen
    assert!(matches!(
        world.services.on_actor_join(p),
        Err(PeekError::RestoreFailed(_))
    ));
    assert!(world.store.load_snapshot(p).unwrap().is_some());

    world.directory.connect(view);
    assert_eq!(
        world.services.on_actor_join(p),
        Ok(RecoveryOutcome::Restored)
    );
    assert_eq!(world.x_of(p), 0.0);
}

#[test_timeout::timeout]
fn target_disconnect_ends_session_on_next_monitor_pass() {
    let world = World::new(PeekConfig::default());
    let p = world.spawn("p", "overworld", 0.0);
    let t = world.spawn("t", "overworld", 40.0);
    world.peek(p, t);
    let grace = world.services.config().session_grace_ticks;
    world.services.advance(grace);
    assert!(world.services.sessions().is_peeking(p));

    world.directory.disconnect(t);
    world
        .services
        .advance(world.services.config().monitor_interval_ticks);

    assert!(!world.services.sessions().is_peeking(p));
    assert_eq!(world.x_of(p), 0.0);
    let records = world.stats.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, StopReason::TargetDisconnected);
}

#[test_timeout::timeout]
fn mutual_peek_is_rate_limited() {
    let world = World::new(PeekConfig::default());
    let p = world.spawn("p", "overworld", 0.0);
    let t = world.spawn("t", "overworld", 40.0);
    let sessions = world.services.sessions();

    sessions.start_session(t, p).unwrap();
    sessions.start_session(p, t).unwrap();
    assert!(!sessions.is_peeking(t));
    assert_eq!(world.x_of(t), 40.0);
    assert_eq!(sessions.session_of(p).unwrap().target_id, t);

    assert_eq!(sessions.start_session(t, p), Err(PeekError::TooFrequent));
    assert_eq!(sessions.session_of(p).unwrap().target_id, t);

    let cooldown = world
        .services
        .config()
        .secs_to_ticks(world.services.config().switch_cooldown_secs);
    world.services.advance(cooldown);
    sessions.start_session(t, p).unwrap();
    assert!(!sessions.is_peeking(p));
    assert_eq!(sessions.session_of(t).unwrap().target_id, p);
}

#[test_timeout::timeout]
fn stop_twice_reports_not_peeking() {
    let world = World::new(PeekConfig::default());
    let p = world.spawn("p", "overworld", 0.0);
    let t = world.spawn("t", "overworld", 40.0);
    world.peek(p, t);

    let sessions = world.services.sessions();
    assert!(sessions.stop_session(p, StopReason::Voluntary).is_ok());
    let err = sessions.stop_session(p, StopReason::Voluntary).unwrap_err();
    assert_eq!(err, PeekError::NotPeekingAnyone);
    assert_eq!(err.code(), "peek.session.not_peeking");
}

#[test_timeout::timeout]
fn failed_teleport_rolls_back_new_session() {
    let world = World::new(PeekConfig::default());
    let p = world.spawn("p", "overworld", 0.0);
    let t = world.spawn("t", "nether", 0.0);
    world.directory.update(p, |v| v.special.air_ticks = 120);
    world.directory.block_teleports_into(RealmId::new("nether"));

    let err = world.services.sessions().start_session(p, t).unwrap_err();
    assert!(matches!(
        err,
        PeekError::TeleportFailed {
            cross_realm: true,
            ..
        }
    ));
    let view = world.directory.lookup(p).unwrap();
    assert_eq!(view.mode, InteractionMode::Survival);
    assert_eq!(view.location.realm, RealmId::new("overworld"));
    assert_eq!(view.special.air_ticks, 120);
    assert!(!world.services.sessions().is_peeking(p));
    assert!(!world.services.sessions().is_being_peeked(t));
    assert_eq!(world.store.load_snapshot(p).unwrap(), None);
}

#[test_timeout::timeout]
fn failed_teleport_during_switch_reinstates_previous_session() {
    let world = World::new(PeekConfig::default());
    let p = world.spawn("p", "overworld", 0.0);
    let t1 = world.spawn("t1", "overworld", 40.0);
    let t2 = world.spawn("t2", "nether", 0.0);
    let sessions = world.services.sessions();
    let first = sessions.start_session(p, t1).unwrap();

    world.directory.block_teleports_into(RealmId::new("nether"));
    assert!(matches!(
        sessions.start_session(p, t2),
        Err(PeekError::TeleportFailed { .. })
    ));

    let current = sessions.session_of(p).unwrap();
    assert_eq!(current.id, first.id);
    assert_eq!(current.target_id, t1);
    assert_eq!(sessions.peekers_of(t1), vec![p]);
    assert!(!sessions.is_being_peeked(t2));
    assert_eq!(
        world.directory.lookup(p).unwrap().mode,
        InteractionMode::Spectator
    );
    assert!(world.store.load_snapshot(p).unwrap().is_some());
}

#[test_timeout::timeout]
fn failed_session_start_leaves_request_pending() {
    let world = World::new(PeekConfig::default());
    let p = world.spawn("p", "overworld", 0.0);
    let t = world.spawn("t", "overworld", 40.0);
    let request = world.request(p, t);

    world.directory.update(p, |v| v.velocity = [0.5, 0.0, 0.0]);
    assert_eq!(
        world.services.requests().accept_request(t, Some(p)),
        Err(PeekError::NotStationary)
    );
    assert_eq!(
        world.services.requests().request_status(request.id),
        Some(RequestStatus::Pending)
    );

    world.directory.update(p, |v| v.velocity = [0.0, 0.0, 0.0]);
    world
        .services
        .requests()
        .accept_request(t, Some(p))
        .unwrap();
}

#[test_timeout::timeout]
fn auto_accept_starts_session_after_delay() {
    let world = World::new(PeekConfig::default());
    let p = world.spawn("p", "overworld", 0.0);
    let t = world.spawn("t", "overworld", 40.0);
    world.services.requests().set_auto_accept(p, true);

    let request = world.request(p, t);
    assert!(request.auto_accept);
    world
        .services
        .advance(world.services.config().auto_accept_delay_ticks);

    assert!(world.services.sessions().is_peeking(p));
    assert_eq!(
        world.services.requests().request_status(request.id),
        Some(RequestStatus::Accepted)
    );
}

#[test_timeout::timeout]
fn invite_skips_negotiation_once() {
    let world = World::new(PeekConfig::default());
    let p = world.spawn("p", "overworld", 0.0);
    let t = world.spawn("t", "overworld", 40.0);
    world.services.requests().send_invite(t, p).unwrap();

    match world.services.requests().send_request(p, t).unwrap() {
        SendOutcome::Started(session) => assert_eq!(session.peeker_id, p),
        SendOutcome::Pending(request) => panic!("invite ignored: {request:?}"),
    }
    world
        .services
        .sessions()
        .stop_session(p, StopReason::Voluntary)
        .unwrap();

    // consumed: the next attempt negotiates again
    assert!(matches!(
        world.services.requests().send_request(p, t).unwrap(),
        SendOutcome::Pending(_)
    ));
}

#[test_timeout::timeout]
fn leaving_actor_ends_sessions_and_requests() {
    let world = World::new(PeekConfig::default());
    let p = world.spawn("p", "overworld", 0.0);
    let q = world.spawn("q", "overworld", 10.0);
    let t = world.spawn("t", "overworld", 40.0);
    world.peek(p, t);
    world.request(q, t);

    world.directory.disconnect(t);
    assert_eq!(world.services.on_actor_leave(t), 1);
    assert!(!world.services.sessions().is_peeking(p));
    assert!(world.services.requests().pending_request_from(q).is_none());
    assert_eq!(world.x_of(p), 0.0);
}

struct BrokenStats;

impl StatsSink for BrokenStats {
    fn record_session(&self, _stats: &SessionStats) -> Result<(), StatsError> {
        Err(StatsError::Backend("unavailable".into()))
    }
}

#[test_timeout::timeout]
fn stats_failure_does_not_block_stop() {
    let directory = InMemoryDirectory::new();
    directory.add_realm(RealmId::new("overworld"));
    let collaborators = Collaborators::new(
        directory.clone(),
        InMemorySnapshotStore::new(),
        Arc::new(BrokenStats),
    );
    let services = PeekServices::new(PeekConfig::default(), collaborators);
    let p = Uuid::new_v4();
    let t = Uuid::new_v4();
    for (id, x) in [(p, 0.0), (t, 40.0)] {
        directory.connect(ActorView::new(
            id,
            "actor",
            Location::new(RealmId::new("overworld"), Position::new(x, 64.0, 0.0)),
        ));
    }

    services.sessions().start_session(p, t).unwrap();
    let ended = services
        .sessions()
        .stop_session(p, StopReason::Voluntary)
        .unwrap();
    assert!(ended.restored);
    assert!(!services.sessions().is_peeking(p));
}

#[test_timeout::timeout]
fn concurrent_starts_leave_one_session_per_peeker() {
    let world = World::new(PeekConfig::default());
    let p = world.spawn("p", "overworld", 0.0);
    let targets: Vec<ActorId> = (0..8)
        .map(|i| world.spawn(&format!("t{i}"), "overworld", 10.0 + i as f64))
        .collect();
    let sessions = world.services.sessions().clone();

    std::thread::scope(|scope| {
        for target in &targets {
            let sessions = sessions.clone();
            let target = *target;
            scope.spawn(move || {
                for _ in 0..5 {
                    let _ = sessions.start_session(p, target);
                }
            });
        }
        scope.spawn(|| {
            for _ in 0..50 {
                world.services.tick();
            }
        });
    });

    let active = sessions.active_sessions();
    assert_eq!(active.iter().filter(|s| s.peeker_id == p).count(), 1);
    let target = active[0].target_id;
    assert_eq!(sessions.peekers_of(target), vec![p]);
    let report = world.services.checker().run();
    assert_eq!(report.index_repairs.total(), 0);

    sessions.stop_session(p, StopReason::Voluntary).unwrap();
    assert_eq!(world.x_of(p), 0.0);
}

#[test_timeout::timeout]
fn json_snapshots_survive_shutdown_of_offline_peekers() {
    let dir = scratch_dir();
    let store: Arc<dyn SnapshotStore> = Arc::new(JsonFileSnapshotStore::open(&dir).unwrap());
    let world = World::with_store(PeekConfig::default(), store);
    let p = world.spawn("p", "overworld", 0.0);
    let q = world.spawn("q", "overworld", 5.0);
    let t = world.spawn("t", "overworld", 40.0);
    world.peek(p, t);
    world.peek(q, t);
    world.directory.disconnect(q);

    assert_eq!(world.services.shutdown(), 2);
    assert_eq!(world.store.load_snapshot(p).unwrap(), None);
    assert!(world.store.load_snapshot(q).unwrap().is_some());
    assert_eq!(world.x_of(p), 0.0);
    let _ = std::fs::remove_dir_all(dir);
}
