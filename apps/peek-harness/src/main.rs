mod cli;
mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use peek_core::{
    metrics, ActorId, ActorView, Collaborators, InMemoryDirectory, InMemoryStats,
    JsonFileSnapshotStore, Location, PeekConfig, PeekServices, Position, RealmId, SendOutcome,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cli::Cli;
use crate::telemetry::init_tracing;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_filter);

    let mut config = PeekConfig::from_env();
    if cli.fast {
        config.tick_millis = 1_000;
        config.monitor_interval_ticks = 1;
        config.session_grace_ticks = 2;
        config.realm_follow_delay_ticks = 2;
        config.auto_accept_delay_ticks = 1;
    }

    let snapshot_dir = cli
        .snapshot_dir
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("peek-harness"));
    let store = Arc::new(
        JsonFileSnapshotStore::open(&snapshot_dir)
            .with_context(|| format!("opening snapshot dir {}", snapshot_dir.display()))?,
    );

    let directory = InMemoryDirectory::new();
    directory.add_realm(RealmId::new("overworld"));
    directory.add_realm(RealmId::new("nether"));
    let stats = InMemoryStats::new();
    let services = PeekServices::new(
        config,
        Collaborators::new(directory.clone(), store, stats.clone()),
    );

    let spawn = |name: &str, x: f64| -> ActorId {
        let id = Uuid::new_v4();
        let location = Location::new(RealmId::new("overworld"), Position::new(x, 64.0, 0.0));
        directory.connect(ActorView::new(id, name, location));
        id
    };
    let alice = spawn("alice", 0.0);
    let bob = spawn("bob", 120.0);
    let carol = spawn("carol", -40.0);
    info!(%alice, %bob, %carol, snapshot_dir = %snapshot_dir.display(), "actors ready");

    // alice asks to peek bob, bob accepts
    let requests = services.requests();
    match requests.send_request(alice, bob)? {
        SendOutcome::Pending(request) => info!(request_id = %request.id, "request pending"),
        SendOutcome::Started(session) => info!(session_id = %session.id, "started via invite"),
    }
    let session = requests.accept_request(bob, Some(alice))?;
    info!(session_id = %session.id, "alice is peeking bob");

    // carol gets in without negotiating through an invite from bob
    requests.send_invite(bob, carol)?;
    if let SendOutcome::Started(session) = requests.send_request(carol, bob)? {
        info!(session_id = %session.id, "carol is peeking bob");
    }

    let settle = services.config().session_grace_ticks + services.config().monitor_interval_ticks;
    services.advance(settle);

    // bob walks through a portal
    directory.move_to(
        bob,
        Location::new(RealmId::new("nether"), Position::new(15.0, 40.0, 15.0)),
    );
    services.advance(
        services.config().monitor_interval_ticks + services.config().realm_follow_delay_ticks,
    );

    // alice drops and comes back
    let alice_view = directory
        .disconnect(alice)
        .context("alice was not connected")?;
    services.on_actor_leave(alice);
    directory.connect(alice_view);
    match services.on_actor_join(alice) {
        Ok(outcome) => info!(?outcome, "alice rejoined"),
        Err(err) => warn!(error = %err, code = err.code(), "alice recovery failed"),
    }

    services.advance(cli.ticks);

    for session in services.sessions().active_sessions() {
        println!(
            "active: {} -> {} (session {}, crossed realm: {})",
            session.peeker_name, session.target_name, session.id, session.crossed_realm
        );
    }
    for record in stats.records() {
        println!(
            "ended: {} -> {} after {}s ({})",
            record.peeker_name,
            record.target_name,
            record.duration_secs,
            record.reason.as_str()
        );
    }

    let stopped = services.shutdown();
    info!(stopped, "harness finished");
    print!("{}", metrics::render());
    Ok(())
}
