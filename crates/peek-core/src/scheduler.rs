//! Countdown-based cooperative task scheduler.
//!
//! Tasks never run on their own thread: the tick driver calls
//! [`TickScheduler::process_tick`] once per quantum and every due callback runs
//! synchronously inside that call. The task map itself is a concurrent map so that
//! command threads may add or cancel tasks while a tick is being processed.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

pub type TaskCallback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Task id scoped to an owning object, e.g. `request-expiry:<uuid>`.
    pub fn scoped(kind: TaskKind, owner: impl fmt::Display) -> Self {
        Self(format!("{}:{}", kind.as_str(), owner))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Type tag used for selective cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    RequestExpiry,
    AutoAccept,
    InviteExpiry,
    SessionTimeout,
    RealmFollow,
    Custom(&'static str),
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::RequestExpiry => "request-expiry",
            TaskKind::AutoAccept => "auto-accept",
            TaskKind::InviteExpiry => "invite-expiry",
            TaskKind::SessionTimeout => "session-timeout",
            TaskKind::RealmFollow => "realm-follow",
            TaskKind::Custom(name) => name,
        }
    }
}

struct TickTask {
    kind: TaskKind,
    remaining: u64,
    // Mutex keeps the map `Sync` without requiring `Sync` callbacks.
    callback: Mutex<Option<TaskCallback>>,
}

#[derive(Default)]
pub struct TickScheduler {
    tasks: DashMap<TaskId, TickTask>,
    tick: AtomicU64,
}

impl TickScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ticks processed so far. Coordinators use this as their clock.
    pub fn current_tick(&self) -> u64 {
        self.tick.load(Ordering::Acquire)
    }

    /// Registers `callback` to run after `ticks` calls to `process_tick`. A zero
    /// countdown fires on the next tick. Re-using an id replaces the pending task.
    pub fn add_task<F>(&self, id: TaskId, kind: TaskKind, ticks: u64, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let task = TickTask {
            kind,
            remaining: ticks.max(1),
            callback: Mutex::new(Some(Box::new(callback))),
        };
        if self.tasks.insert(id.clone(), task).is_some() {
            debug!(task = %id, "replaced pending tick task");
        } else {
            trace!(task = %id, kind = kind.as_str(), ticks, "scheduled tick task");
        }
    }

    pub fn remove_by_id(&self, id: &TaskId) -> bool {
        self.tasks.remove(id).is_some()
    }

    pub fn remove_by_kind(&self, kind: TaskKind) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|_, task| task.kind != kind);
        before.saturating_sub(self.tasks.len())
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn remaining_ticks(&self, id: &TaskId) -> Option<u64> {
        self.tasks.get(id).map(|task| task.remaining)
    }

    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Advances every task by one tick and fires the ones that reach zero.
    ///
    /// The id list is copied before iterating, so callbacks may add or cancel tasks;
    /// tasks added during this tick start counting on the next one. A due task
    /// cancelled by an earlier callback in the same tick does not fire. A panicking
    /// callback is logged and does not affect the others.
    pub fn process_tick(&self) -> usize {
        let tick = self.tick.fetch_add(1, Ordering::AcqRel) + 1;
        let ids: Vec<TaskId> = self.tasks.iter().map(|entry| entry.key().clone()).collect();

        let mut due = Vec::new();
        for id in ids {
            let Some(mut task) = self.tasks.get_mut(&id) else {
                continue;
            };
            task.remaining = task.remaining.saturating_sub(1);
            if task.remaining == 0 {
                due.push(id);
            }
        }

        let mut fired = 0usize;
        for id in due {
            let Some((_, task)) = self.tasks.remove_if(&id, |_, task| task.remaining == 0) else {
                continue;
            };
            let Some(callback) = task.callback.into_inner() else {
                continue;
            };
            fired += 1;
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
                warn!(
                    task = %id,
                    kind = task.kind.as_str(),
                    tick,
                    panic = panic_message(payload.as_ref()),
                    "tick task callback failed"
                );
            }
        }
        fired
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}

impl fmt::Debug for TickScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TickScheduler")
            .field("tick", &self.current_tick())
            .field("pending", &self.tasks.len())
            .finish()
    }
}
