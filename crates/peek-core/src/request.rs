//! Request negotiation between a requester and a target, plus invites and per-actor
//! preferences.
//!
//! Only pending requests are indexed; a request leaves every index the moment it
//! reaches a terminal status.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PeekConfig;
use crate::cooldown::{unordered_pair, CooldownBook};
use crate::directory::ActorDirectory;
use crate::error::{PeekError, PeekResult};
use crate::events::{Notifier, PeekEvent};
use crate::metrics;
use crate::scheduler::{TaskId, TaskKind, TickScheduler};
use crate::session::{PeekSession, SessionCoordinator};
use crate::types::{ActorId, ActorView};
use crate::validation;

pub type RequestId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Accepted,
    Denied,
    Expired,
    Cancelled,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }

    fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pending => "sent",
            RequestStatus::Accepted => "accepted",
            RequestStatus::Denied => "denied",
            RequestStatus::Expired => "expired",
            RequestStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeekRequest {
    pub id: RequestId,
    pub requester_id: ActorId,
    pub requester_name: String,
    pub target_id: ActorId,
    pub target_name: String,
    pub created_at: DateTime<Utc>,
    pub created_tick: u64,
    pub expires_tick: u64,
    pub auto_accept: bool,
    pub status: RequestStatus,
}

impl PeekRequest {
    pub fn with_status(mut self, status: RequestStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_tick
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invite {
    pub inviter: ActorId,
    pub invitee: ActorId,
    pub created_tick: u64,
    pub expires_tick: u64,
}

struct ClosedRequest {
    request: PeekRequest,
    closed_tick: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Preferences {
    auto_accept: bool,
    private: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Waiting for the target's decision.
    Pending(PeekRequest),
    /// An invite from the target was consumed and the session started right away.
    Started(PeekSession),
}

struct RequestInner {
    config: PeekConfig,
    scheduler: Arc<TickScheduler>,
    directory: Arc<dyn ActorDirectory>,
    sessions: SessionCoordinator,
    notifier: Arc<dyn Notifier>,
    lock: Mutex<()>,
    requests: DashMap<RequestId, PeekRequest>,
    by_requester: DashMap<ActorId, RequestId>,
    by_target: DashMap<ActorId, HashSet<RequestId>>,
    /// Terminal requests, retained for one request timeout so late decisions can be
    /// told apart from unknown ones.
    closed: DashMap<RequestId, ClosedRequest>,
    /// Keyed by (inviter, invitee).
    invites: DashMap<(ActorId, ActorId), Invite>,
    preferences: DashMap<ActorId, Preferences>,
    cooldowns: CooldownBook<ActorId>,
}

#[derive(Clone)]
pub struct RequestCoordinator {
    inner: Arc<RequestInner>,
}

impl RequestCoordinator {
    pub fn new(
        config: PeekConfig,
        scheduler: Arc<TickScheduler>,
        directory: Arc<dyn ActorDirectory>,
        sessions: SessionCoordinator,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            inner: Arc::new(RequestInner {
                config,
                scheduler,
                directory,
                sessions,
                notifier,
                lock: Mutex::new(()),
                requests: DashMap::new(),
                by_requester: DashMap::new(),
                by_target: DashMap::new(),
                closed: DashMap::new(),
                invites: DashMap::new(),
                preferences: DashMap::new(),
                cooldowns: CooldownBook::new(),
            }),
        }
    }

    fn from_weak(weak: &Weak<RequestInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    // ----- send -----

    pub fn send_request(&self, requester: ActorId, target: ActorId) -> PeekResult<SendOutcome> {
        let inner = &self.inner;
        let _guard = inner.lock.lock();
        let now = inner.scheduler.current_tick();

        // 1. one outgoing request at a time, then the shared preconditions
        if inner.by_requester.contains_key(&requester) {
            return Err(PeekError::RequestAlreadyExists);
        }
        let (requester_view, target_view) = self.validate_send(requester, target, now)?;

        // 2. invite fast path
        if inner.invites.contains_key(&(target, requester)) {
            let session = inner.sessions.start_session(requester, target)?;
            self.consume_invite(target, requester);
            metrics::REQUESTS.with_label_values(&["invite_consumed"]).inc();
            return Ok(SendOutcome::Started(session));
        }

        // 3. stop anyone observing the requester
        inner.sessions.release_observers(requester, Some(target))?;

        // 4. target capacity
        let pending_for_target = inner
            .by_target
            .get(&target)
            .map(|ids| ids.len())
            .unwrap_or(0);
        if pending_for_target >= inner.config.max_pending_per_target {
            return Err(PeekError::TargetBusy);
        }

        // 5. create, index, arm timers
        let auto_accept = self.preferences(requester).auto_accept;
        let request = PeekRequest {
            id: Uuid::new_v4(),
            requester_id: requester,
            requester_name: requester_view.name,
            target_id: target,
            target_name: target_view.name,
            created_at: Utc::now(),
            created_tick: now,
            expires_tick: now.saturating_add(inner.config.request_timeout_ticks()),
            auto_accept,
            status: RequestStatus::Pending,
        };
        self.index(request.clone());
        self.arm_expiry(request.id);
        if auto_accept {
            self.arm_auto_accept(request.id);
        }

        // 6. requester cooldown
        inner
            .cooldowns
            .start(requester, now, inner.config.request_cooldown_ticks());

        metrics::REQUESTS
            .with_label_values(&[RequestStatus::Pending.as_str()])
            .inc();
        inner.notifier.notify(&PeekEvent::RequestSent {
            request_id: request.id,
            requester,
            target,
            auto_accept,
        });
        info!(
            request_id = %request.id,
            requester = %requester,
            target = %target,
            auto_accept,
            "peek request sent"
        );
        Ok(SendOutcome::Pending(request))
    }

    fn validate_send(
        &self,
        requester: ActorId,
        target: ActorId,
        now: u64,
    ) -> PeekResult<(ActorView, ActorView)> {
        let inner = &self.inner;
        let config = &inner.config;
        if requester == target {
            return Err(PeekError::SelfTarget);
        }
        if let Some(remaining) = inner.cooldowns.remaining(&requester, now) {
            return Err(PeekError::CooldownActive {
                remaining_secs: config.ticks_to_secs(remaining).max(1),
            });
        }
        let requester_view = inner
            .directory
            .lookup(requester)
            .ok_or(PeekError::ActorOffline(requester))?;
        let target_view = inner
            .directory
            .lookup(target)
            .ok_or(PeekError::ActorOffline(target))?;

        if self.preferences(target).private && !inner.invites.contains_key(&(target, requester)) {
            return Err(PeekError::TargetPrivate);
        }

        let current = inner.sessions.session_of(requester);
        if let Some(session) = &current {
            if session.target_id == target {
                return Err(PeekError::AlreadyPeeking);
            }
        }
        let origin = current
            .as_ref()
            .map(|s| &s.snapshot.location)
            .unwrap_or(&requester_view.location);
        validation::check_distance_policy(config, origin, &target_view.location)?;
        if current.is_none() {
            validation::check_hostiles(config, inner.directory.as_ref(), &requester_view)?;
        }
        Ok((requester_view, target_view))
    }

    // ----- decisions -----

    /// Accepts the request from `requester`, or the oldest pending one when `None`.
    /// The session is started first; if that fails the request stays pending and the
    /// session error is returned as is.
    pub fn accept_request(
        &self,
        target: ActorId,
        requester: Option<ActorId>,
    ) -> PeekResult<PeekSession> {
        let inner = &self.inner;
        let _guard = inner.lock.lock();
        let request = self.find_for_target(target, requester)?;
        let now = inner.scheduler.current_tick();
        if request.is_expired(now) {
            self.finish_locked(request.id, RequestStatus::Expired);
            return Err(PeekError::RequestExpired);
        }

        let session = inner
            .sessions
            .start_session(request.requester_id, request.target_id)?;
        self.finish_locked(request.id, RequestStatus::Accepted);
        Ok(session)
    }

    pub fn deny_request(
        &self,
        target: ActorId,
        requester: Option<ActorId>,
    ) -> PeekResult<PeekRequest> {
        let _guard = self.inner.lock.lock();
        let request = self.find_for_target(target, requester)?;
        if request.is_expired(self.inner.scheduler.current_tick()) {
            self.finish_locked(request.id, RequestStatus::Expired);
            return Err(PeekError::RequestExpired);
        }
        self.finish_locked(request.id, RequestStatus::Denied)
            .ok_or(PeekError::RequestNotFound)
    }

    /// Withdraws the requester's own pending request.
    pub fn cancel_request(&self, requester: ActorId) -> PeekResult<PeekRequest> {
        let _guard = self.inner.lock.lock();
        let id = self
            .inner
            .by_requester
            .get(&requester)
            .map(|id| *id)
            .ok_or_else(|| self.missing(None, Some(requester)))?;
        let request = self.request(id).ok_or(PeekError::RequestNotFound)?;
        if request.is_expired(self.inner.scheduler.current_tick()) {
            self.finish_locked(id, RequestStatus::Expired);
            return Err(PeekError::RequestExpired);
        }
        self.finish_locked(id, RequestStatus::Cancelled)
            .ok_or(PeekError::RequestNotFound)
    }

    /// Purges pending requests in either direction between two actors.
    pub fn cancel_requests_between(&self, a: ActorId, b: ActorId) -> usize {
        let _guard = self.inner.lock.lock();
        let pair = unordered_pair(a, b);
        let ids: Vec<RequestId> = self
            .inner
            .requests
            .iter()
            .filter(|e| unordered_pair(e.requester_id, e.target_id) == pair)
            .map(|e| *e.key())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.finish_locked(id, RequestStatus::Cancelled))
            .count()
    }

    /// Drops every request and invite involving `actor`.
    pub fn forget_actor(&self, actor: ActorId) -> usize {
        let inner = &self.inner;
        let _guard = inner.lock.lock();
        let ids: Vec<RequestId> = inner
            .requests
            .iter()
            .filter(|e| e.requester_id == actor || e.target_id == actor)
            .map(|e| *e.key())
            .collect();
        let cancelled = ids
            .into_iter()
            .filter_map(|id| self.finish_locked(id, RequestStatus::Cancelled))
            .count();
        let invites: Vec<(ActorId, ActorId)> = inner
            .invites
            .iter()
            .filter(|e| e.key().0 == actor || e.key().1 == actor)
            .map(|e| *e.key())
            .collect();
        for (inviter, invitee) in invites {
            self.drop_invite(inviter, invitee);
        }
        cancelled
    }

    fn expire(&self, id: RequestId) {
        let _guard = self.inner.lock.lock();
        if self.finish_locked(id, RequestStatus::Expired).is_some() {
            debug!(request_id = %id, "peek request expired");
        }
    }

    fn auto_accept(&self, id: RequestId) {
        let Some(request) = self.request(id) else {
            return;
        };
        match self.accept_request(request.target_id, Some(request.requester_id)) {
            Ok(session) => {
                debug!(request_id = %id, session_id = %session.id, "request auto-accepted")
            }
            Err(err) => {
                warn!(request_id = %id, error = %err, "auto-accept failed, request stays pending")
            }
        }
    }

    /// Expires pending requests whose deadline passed without their expiry task firing.
    pub fn sweep_stale(&self) -> usize {
        let _guard = self.inner.lock.lock();
        let now = self.inner.scheduler.current_tick();
        let stale: Vec<RequestId> = self
            .inner
            .requests
            .iter()
            .filter(|e| e.is_expired(now))
            .map(|e| *e.key())
            .collect();
        let swept = stale
            .into_iter()
            .filter_map(|id| self.finish_locked(id, RequestStatus::Expired))
            .count();
        if swept > 0 {
            warn!(swept, "expired stale peek requests");
        }
        let retention = self.inner.config.request_timeout_ticks();
        self.inner
            .closed
            .retain(|_, closed| now.saturating_sub(closed.closed_tick) < retention);
        self.inner.cooldowns.purge(now);
        swept
    }

    /// Caller holds the lock. Without a requester, overdue requests ahead of the oldest
    /// live one are expired on the way.
    fn find_for_target(
        &self,
        target: ActorId,
        requester: Option<ActorId>,
    ) -> PeekResult<PeekRequest> {
        let inner = &self.inner;
        match requester {
            Some(requester) => {
                let id = inner.by_requester.get(&requester).map(|id| *id);
                id.and_then(|id| self.request(id))
                    .filter(|r| r.target_id == target)
                    .ok_or_else(|| self.missing(Some(target), Some(requester)))
            }
            None => {
                let now = inner.scheduler.current_tick();
                let mut oldest = None;
                for request in self.pending_requests_for(target) {
                    if request.is_expired(now) {
                        self.finish_locked(request.id, RequestStatus::Expired);
                    } else {
                        oldest = Some(request);
                        break;
                    }
                }
                oldest.ok_or_else(|| self.missing(Some(target), None))
            }
        }
    }

    /// `RequestExpired` when a matching request timed out recently, so a decision that
    /// lost the race against expiry is reported as such.
    fn missing(&self, target: Option<ActorId>, requester: Option<ActorId>) -> PeekError {
        let expired = self.inner.closed.iter().any(|closed| {
            let request = &closed.request;
            request.status == RequestStatus::Expired
                && target.map_or(true, |t| request.target_id == t)
                && requester.map_or(true, |r| request.requester_id == r)
        });
        if expired {
            PeekError::RequestExpired
        } else {
            PeekError::RequestNotFound
        }
    }

    /// Moves a pending request to a terminal status, removing it from every index and
    /// cancelling its timers. `None` when it was no longer pending.
    fn finish_locked(&self, id: RequestId, status: RequestStatus) -> Option<PeekRequest> {
        let inner = &self.inner;
        let (_, request) = inner.requests.remove(&id)?;
        inner
            .by_requester
            .remove_if(&request.requester_id, |_, rid| *rid == id);
        if let Some(mut ids) = inner.by_target.get_mut(&request.target_id) {
            ids.remove(&id);
        }
        inner
            .by_target
            .remove_if(&request.target_id, |_, ids| ids.is_empty());
        inner
            .scheduler
            .remove_by_id(&TaskId::scoped(TaskKind::RequestExpiry, id));
        inner
            .scheduler
            .remove_by_id(&TaskId::scoped(TaskKind::AutoAccept, id));

        let request = request.with_status(status);
        inner.closed.insert(
            id,
            ClosedRequest {
                request: request.clone(),
                closed_tick: inner.scheduler.current_tick(),
            },
        );
        metrics::REQUESTS.with_label_values(&[status.as_str()]).inc();
        let (request_id, requester, target) = (id, request.requester_id, request.target_id);
        let event = match status {
            RequestStatus::Accepted => PeekEvent::RequestAccepted {
                request_id,
                requester,
                target,
            },
            RequestStatus::Denied => PeekEvent::RequestDenied {
                request_id,
                requester,
                target,
            },
            RequestStatus::Expired => PeekEvent::RequestExpired {
                request_id,
                requester,
                target,
            },
            RequestStatus::Cancelled | RequestStatus::Pending => PeekEvent::RequestCancelled {
                request_id,
                requester,
                target,
            },
        };
        inner.notifier.notify(&event);
        info!(
            request_id = %id,
            requester = %requester,
            target = %target,
            status = status.as_str(),
            "peek request closed"
        );
        Some(request)
    }

    fn index(&self, request: PeekRequest) {
        let inner = &self.inner;
        inner.by_requester.insert(request.requester_id, request.id);
        inner
            .by_target
            .entry(request.target_id)
            .or_default()
            .insert(request.id);
        inner.requests.insert(request.id, request);
    }

    fn arm_expiry(&self, id: RequestId) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.scheduler.add_task(
            TaskId::scoped(TaskKind::RequestExpiry, id),
            TaskKind::RequestExpiry,
            self.inner.config.request_timeout_ticks(),
            move || {
                if let Some(coordinator) = RequestCoordinator::from_weak(&weak) {
                    coordinator.expire(id);
                }
            },
        );
    }

    fn arm_auto_accept(&self, id: RequestId) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.scheduler.add_task(
            TaskId::scoped(TaskKind::AutoAccept, id),
            TaskKind::AutoAccept,
            self.inner.config.auto_accept_delay_ticks,
            move || {
                if let Some(coordinator) = RequestCoordinator::from_weak(&weak) {
                    coordinator.auto_accept(id);
                }
            },
        );
    }

    // ----- invites -----

    /// Pre-authorises `invitee` to peek `inviter` once, skipping the accept step.
    pub fn send_invite(&self, inviter: ActorId, invitee: ActorId) -> PeekResult<Invite> {
        let inner = &self.inner;
        let _guard = inner.lock.lock();
        if inviter == invitee {
            return Err(PeekError::SelfTarget);
        }
        inner
            .directory
            .lookup(invitee)
            .ok_or(PeekError::ActorOffline(invitee))?;

        let now = inner.scheduler.current_tick();
        let invite = Invite {
            inviter,
            invitee,
            created_tick: now,
            expires_tick: now.saturating_add(inner.config.invite_timeout_ticks()),
        };
        inner.invites.insert((inviter, invitee), invite.clone());

        let weak = Arc::downgrade(&self.inner);
        inner.scheduler.add_task(
            invite_task_id(inviter, invitee),
            TaskKind::InviteExpiry,
            inner.config.invite_timeout_ticks(),
            move || {
                if let Some(coordinator) = RequestCoordinator::from_weak(&weak) {
                    let _guard = coordinator.inner.lock.lock();
                    if coordinator.drop_invite(inviter, invitee) {
                        coordinator
                            .inner
                            .notifier
                            .notify(&PeekEvent::InviteExpired { inviter, invitee });
                    }
                }
            },
        );
        inner
            .notifier
            .notify(&PeekEvent::InviteSent { inviter, invitee });
        info!(inviter = %inviter, invitee = %invitee, "peek invite sent");
        Ok(invite)
    }

    pub fn revoke_invite(&self, inviter: ActorId, invitee: ActorId) -> PeekResult<()> {
        let _guard = self.inner.lock.lock();
        if self.drop_invite(inviter, invitee) {
            Ok(())
        } else {
            Err(PeekError::InviteNotFound)
        }
    }

    pub fn has_invite(&self, inviter: ActorId, invitee: ActorId) -> bool {
        self.inner.invites.contains_key(&(inviter, invitee))
    }

    fn consume_invite(&self, inviter: ActorId, invitee: ActorId) {
        if self.drop_invite(inviter, invitee) {
            self.inner
                .notifier
                .notify(&PeekEvent::InviteConsumed { inviter, invitee });
            info!(inviter = %inviter, invitee = %invitee, "peek invite consumed");
        }
    }

    fn drop_invite(&self, inviter: ActorId, invitee: ActorId) -> bool {
        self.inner
            .scheduler
            .remove_by_id(&invite_task_id(inviter, invitee));
        self.inner.invites.remove(&(inviter, invitee)).is_some()
    }

    // ----- preferences -----

    /// Requests sent by `actor` are accepted on the target's behalf after
    /// `auto_accept_delay_ticks` unless decided earlier.
    pub fn set_auto_accept(&self, actor: ActorId, enabled: bool) {
        self.inner.preferences.entry(actor).or_default().auto_accept = enabled;
    }

    pub fn set_private(&self, actor: ActorId, private: bool) {
        self.inner.preferences.entry(actor).or_default().private = private;
    }

    fn preferences(&self, actor: ActorId) -> Preferences {
        self.inner
            .preferences
            .get(&actor)
            .map(|p| *p)
            .unwrap_or_default()
    }

    // ----- queries -----

    pub fn request(&self, id: RequestId) -> Option<PeekRequest> {
        self.inner.requests.get(&id).map(|r| r.value().clone())
    }

    /// Status of a pending or recently closed request.
    pub fn request_status(&self, id: RequestId) -> Option<RequestStatus> {
        if let Some(request) = self.inner.requests.get(&id) {
            return Some(request.status);
        }
        self.inner.closed.get(&id).map(|c| c.request.status)
    }

    pub fn pending_request_from(&self, requester: ActorId) -> Option<PeekRequest> {
        let id = *self.inner.by_requester.get(&requester)?;
        self.request(id)
    }

    /// Pending requests addressed to `target`, oldest first.
    pub fn pending_requests_for(&self, target: ActorId) -> Vec<PeekRequest> {
        let ids = self
            .inner
            .by_target
            .get(&target)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        let mut requests: Vec<PeekRequest> =
            ids.iter().filter_map(|id| self.request(*id)).collect();
        requests.sort_by_key(|r| (r.created_tick, r.created_at));
        requests
    }

    pub fn pending_count(&self) -> usize {
        self.inner.requests.len()
    }
}

fn invite_task_id(inviter: ActorId, invitee: ActorId) -> TaskId {
    TaskId::scoped(TaskKind::InviteExpiry, format!("{inviter}:{invitee}"))
}
