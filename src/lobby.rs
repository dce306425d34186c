//! Matching lobby
//!
//! The service object that owns presence, the waiting queue, sessions and the
//! message log. Every method takes `&mut self` and runs to completion without
//! suspending, so one call is one atomic unit with respect to every other
//! request: a match decision, the queue removals and the session insert can
//! never interleave with a competing request.
//!
//! Events for users other than the caller (match found, session ended,
//! incoming messages, search timeouts) are queued as [`Notice`]s and handed to
//! the transport only after the call returns, see [`Lobby::drain_notices`].

use std::collections::BTreeMap;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::LobbyConfig;
use crate::error::AppError;
use crate::geo::Location;
use crate::matching::{select_partner, MatchOutcome, MatchPlan, Proximity};
use crate::message::ServerMessage;
use crate::presence::{PresenceRegistry, Registration};
use crate::queue::{WaitingEntry, WaitingQueue};
use crate::relay::{ChatMessage, HistoryOrder, MessageRelay};
use crate::session::{Session, SessionManager, SessionSummary};
use crate::types::{ConnectionId, EndReason, QueueType, SessionId, UserId, UserState};
use crate::user::{User, UserProfile};

/// A message for one user, produced by a lobby operation
#[derive(Debug, Clone)]
pub struct Notice {
    pub to: UserId,
    pub message: ServerMessage,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LobbyStats {
    pub online_users: usize,
    pub active_sessions: usize,
    pub waiting: BTreeMap<QueueType, usize>,
}

/// What one maintenance pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub stale_entries: usize,
    pub searches_timed_out: usize,
    pub sessions_timed_out: usize,
    pub sessions_purged: usize,
}

#[derive(Debug)]
pub struct Lobby {
    config: LobbyConfig,
    presence: PresenceRegistry,
    queue: WaitingQueue,
    sessions: SessionManager,
    relay: MessageRelay,
    notices: Vec<Notice>,
}

impl Lobby {
    pub fn new(config: LobbyConfig) -> Self {
        let relay = MessageRelay::new(config.max_message_chars);
        Self {
            config,
            presence: PresenceRegistry::new(),
            queue: WaitingQueue::new(),
            sessions: SessionManager::new(),
            relay,
            notices: Vec::new(),
        }
    }

    pub fn config(&self) -> &LobbyConfig {
        &self.config
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn queue(&self) -> &WaitingQueue {
        &self.queue
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Take every notice queued so far, in production order
    pub fn drain_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    fn notify(&mut self, to: UserId, message: ServerMessage) {
        self.notices.push(Notice { to, message });
    }

    // ---- presence -------------------------------------------------------

    pub fn register(
        &mut self,
        connection: ConnectionId,
        request: Registration,
        now: Instant,
    ) -> Result<UserProfile, AppError> {
        let user = self.presence.register(connection, request, now)?;
        let (user_id, location, profile) = (user.id, user.location.clone(), user.profile());
        // A re-registration may move a user that is already waiting
        self.queue.set_location(user_id, location);
        Ok(profile)
    }

    /// Remove the user on `connection` and cascade
    ///
    /// Evicts its queue entry and ends its active session with reason
    /// `Disconnect`. Returns the removed user, or `None` if the connection had
    /// none (so calling this twice is harmless).
    pub fn deregister(&mut self, connection: ConnectionId, now: Instant) -> Option<UserId> {
        let user = self.presence.deregister(connection)?;

        self.queue.dequeue(user.id);
        if let Some(session_id) = self.sessions.active_for(user.id).map(|s| s.id) {
            // Only fails if the session is already ended, which active_for rules out
            let _ = self.close_session(session_id, Some(user.id), EndReason::Disconnect, now);
        }

        info!("User {} ('{}') deregistered", user.id, user.display_name);
        debug!(
            "Online: {}, waiting: {}, active sessions: {}",
            self.presence.online_count(),
            self.queue.total(),
            self.sessions.active_count()
        );
        Some(user.id)
    }

    /// Heartbeat
    ///
    /// A heartbeat from a participant also counts as activity in its session,
    /// so a video call without chat text is not ended as idle.
    pub fn touch(&mut self, user_id: UserId, now: Instant) {
        self.presence.touch(user_id, now);
        if let Some(session_id) = self.sessions.active_for(user_id).map(|s| s.id) {
            self.sessions.record_activity(session_id, now);
        }
    }

    pub fn user_for(&self, connection: ConnectionId) -> Result<UserId, AppError> {
        self.presence.user_for(connection)
    }

    pub fn lookup(&self, user_id: UserId) -> Result<&User, AppError> {
        self.presence.lookup(user_id)
    }

    // ---- queue ----------------------------------------------------------

    /// Wait in `queue_type`, returning the 1-based position
    ///
    /// Switching queue type replaces the previous entry. Joining the queue the
    /// user already waits in is `AlreadySearching` and keeps the position.
    pub fn join_queue(
        &mut self,
        user_id: UserId,
        queue_type: QueueType,
        location: Option<Location>,
        now: Instant,
    ) -> Result<usize, AppError> {
        self.presence.lookup(user_id)?;
        if self.sessions.active_for(user_id).is_some() {
            return Err(AppError::AlreadyInSession);
        }
        self.presence.touch(user_id, now);

        if self
            .queue
            .entry_of(user_id)
            .is_some_and(|e| e.queue_type == queue_type)
        {
            return Err(AppError::AlreadySearching);
        }
        if let (Some(user), Some(location)) = (self.presence.get_mut(user_id), location) {
            user.location = Some(location);
        }

        let location = self.presence.lookup(user_id)?.location.clone();
        let ticket = self.queue.enqueue(user_id, queue_type, location, now).ticket;
        self.presence.set_state(user_id, UserState::Waiting);

        info!("User {} joined {} queue", user_id, queue_type);
        Ok(self.position(queue_type, ticket))
    }

    /// Stop searching; returns whether the user was waiting
    ///
    /// Too late once a match has committed: the session stands and must be
    /// ended explicitly.
    pub fn leave_queue(&mut self, user_id: UserId) -> Result<bool, AppError> {
        self.presence.lookup(user_id)?;
        let was_waiting = self.queue.dequeue(user_id).is_some();
        if was_waiting {
            self.presence.set_state(user_id, UserState::Idle);
            info!("User {} left the queue", user_id);
        }
        Ok(was_waiting)
    }

    fn position(&self, queue_type: QueueType, ticket: u64) -> usize {
        self.queue
            .snapshot(queue_type)
            .iter()
            .position(|e| e.ticket == ticket)
            .map_or(0, |i| i + 1)
    }

    // ---- matching -------------------------------------------------------

    /// Find a partner for `user_id` now
    ///
    /// The requester's own entry is taken out of the queue for the duration of
    /// the attempt. A lost race is retried up to `max_match_attempts` times;
    /// without a match the requester ends up queued (at its old position if it
    /// was already waiting in the same queue) and `Waiting` is returned.
    pub fn request_match(
        &mut self,
        user_id: UserId,
        queue_type: Option<QueueType>,
        now: Instant,
    ) -> Result<MatchOutcome, AppError> {
        self.presence.lookup(user_id)?;
        if self.sessions.active_for(user_id).is_some() {
            return Err(AppError::AlreadyInSession);
        }
        self.presence.touch(user_id, now);

        let parked = self.queue.dequeue(user_id);
        let queue_type = queue_type
            .or(parked.as_ref().map(|e| e.queue_type))
            .unwrap_or(QueueType::Chat);
        self.presence.set_state(user_id, UserState::Matching);
        self.purge_stale(queue_type, now);

        self.match_with_retries(user_id, queue_type, parked, now, |lobby| {
            lobby.plan_match(user_id, queue_type, now)
        })
    }

    /// Plan and commit until a session forms, the queue has nobody to offer,
    /// or `max_match_attempts` plans in a row have gone stale
    fn match_with_retries<P>(
        &mut self,
        user_id: UserId,
        queue_type: QueueType,
        parked: Option<WaitingEntry>,
        now: Instant,
        mut planner: P,
    ) -> Result<MatchOutcome, AppError>
    where
        P: FnMut(&Lobby) -> Result<Option<MatchPlan>, AppError>,
    {
        for attempt in 1..=self.config.max_match_attempts {
            let plan = match planner(&*self) {
                Ok(Some(plan)) => plan,
                Ok(None) => break,
                Err(e) => {
                    self.park(user_id, queue_type, parked, now);
                    return Err(e);
                }
            };
            match self.commit_match(plan, now) {
                Ok(outcome) => return Ok(outcome),
                Err(AppError::RaceLost) => {
                    debug!("Match attempt {} for {} lost a race, retrying", attempt, user_id);
                }
                Err(e) => {
                    self.park(user_id, queue_type, parked, now);
                    return Err(e);
                }
            }
        }

        self.park(user_id, queue_type, parked, now);
        debug!("No partner yet for {} in {} queue", user_id, queue_type);
        Ok(MatchOutcome::Waiting { queue_type })
    }

    /// Queue the requester after a match attempt that produced no session
    fn park(&mut self, user_id: UserId, queue_type: QueueType, parked: Option<WaitingEntry>, now: Instant) {
        if self.presence.get(user_id).is_none() {
            return;
        }
        match parked {
            Some(entry) if entry.queue_type == queue_type => {
                self.queue.restore(entry);
            }
            _ => {
                let location = self.presence.get(user_id).and_then(|u| u.location.clone());
                self.queue.enqueue(user_id, queue_type, location, now);
            }
        }
        self.presence.set_state(user_id, UserState::Waiting);
    }

    /// Select a partner from a snapshot of the queue, without changing anything
    pub fn plan_match(
        &self,
        requester: UserId,
        queue_type: QueueType,
        now: Instant,
    ) -> Result<Option<MatchPlan>, AppError> {
        let me = self.presence.lookup(requester)?;
        if self.sessions.active_for(requester).is_some() {
            return Err(AppError::AlreadyInSession);
        }

        let snapshot = self.queue.snapshot(queue_type);
        let eligible = snapshot.iter().filter(|e| self.is_eligible(me, e, now));

        Ok(select_partner(me.location.as_ref(), eligible).map(|candidate| MatchPlan {
            requester,
            queue_type,
            candidate,
        }))
    }

    fn is_eligible(&self, me: &User, entry: &WaitingEntry, now: Instant) -> bool {
        if entry.user_id == me.id {
            return false;
        }
        let Some(candidate) = self.presence.get(entry.user_id) else {
            return false;
        };
        candidate.state == UserState::Waiting
            && !candidate.is_stale(now, self.config.stale_after)
            && self.sessions.active_for(candidate.id).is_none()
            && me.compatible_with(candidate)
    }

    /// Turn a plan into a session, or fail with `RaceLost`
    ///
    /// Re-validates the candidate against the live queue: it must still hold
    /// the exact entry the plan was made from. Both queue entries are removed
    /// and the session inserted in the same call.
    pub fn commit_match(&mut self, plan: MatchPlan, now: Instant) -> Result<MatchOutcome, AppError> {
        let requester = plan.requester;
        let candidate = plan.candidate.user_id;
        let proximity = plan.candidate.proximity;

        if requester == candidate {
            return Err(AppError::InvalidInput("cannot match a user with itself".to_string()));
        }
        self.presence.lookup(requester)?;
        if self.sessions.active_for(requester).is_some() {
            return Err(AppError::AlreadyInSession);
        }

        let available = self.presence.get(candidate).is_some_and(|c| {
            c.state == UserState::Waiting && !c.is_stale(now, self.config.stale_after)
        }) && self.sessions.active_for(candidate).is_none();
        if !available || self.queue.take_if(candidate, plan.candidate.ticket).is_none() {
            return Err(AppError::RaceLost);
        }
        self.queue.dequeue(requester);

        let session_id = self
            .sessions
            .create(requester, candidate, plan.queue_type, proximity, now)?
            .id;
        self.presence.set_state(requester, UserState::InSession);
        self.presence.set_state(candidate, UserState::InSession);

        info!(
            "Matched {} with {} in session {} ({:?})",
            requester, candidate, session_id, proximity
        );

        for (to, partner) in [(requester, candidate), (candidate, requester)] {
            if let Some(profile) = self.presence.get(partner).map(User::profile) {
                self.notify(to, match_found(session_id, profile, proximity));
            }
        }

        Ok(MatchOutcome::Matched {
            session_id,
            partner_id: candidate,
            proximity,
        })
    }

    /// Drop stale entries from one queue
    fn purge_stale(&mut self, queue_type: QueueType, now: Instant) -> usize {
        let stale: Vec<UserId> = self
            .queue
            .snapshot(queue_type)
            .iter()
            .filter(|e| {
                self.presence
                    .get(e.user_id)
                    .map_or(true, |u| u.is_stale(now, self.config.stale_after))
            })
            .map(|e| e.user_id)
            .collect();

        for user_id in &stale {
            self.queue.dequeue(*user_id);
            if self.presence.get(*user_id).is_some() {
                self.presence.set_state(*user_id, UserState::Idle);
                self.notify(*user_id, ServerMessage::SearchTimeout { queue_type });
            }
            debug!("Stale entry for {} purged from {} queue", user_id, queue_type);
        }
        stale.len()
    }

    // ---- sessions -------------------------------------------------------

    pub fn active_session(&self, user_id: UserId) -> Option<&Session> {
        self.sessions.active_for(user_id)
    }

    pub fn active_session_summary(&self, user_id: UserId) -> Option<SessionSummary> {
        self.sessions.active_for(user_id).map(Session::summary)
    }

    /// Partner in the user's active session
    pub fn partner_of(&self, user_id: UserId) -> Option<UserId> {
        self.sessions.active_for(user_id)?.partner_of(user_id)
    }

    /// A participant ends its session
    ///
    /// `Skip` re-enqueues the skipper (and tries to match it right away); the
    /// other participant goes idle and must request a new match itself.
    /// Returns the skipper's new match outcome, if any.
    pub fn end_session(
        &mut self,
        user_id: UserId,
        session_id: SessionId,
        reason: EndReason,
        now: Instant,
    ) -> Result<Option<MatchOutcome>, AppError> {
        self.presence.lookup(user_id)?;
        let queue_type = self.sessions.active_with(session_id, user_id)?.queue_type;
        self.close_session(session_id, Some(user_id), reason, now)?;

        if reason == EndReason::Skip {
            return self.request_match(user_id, Some(queue_type), now).map(Some);
        }
        Ok(None)
    }

    /// End a session and tell both participants
    fn close_session(
        &mut self,
        session_id: SessionId,
        ended_by: Option<UserId>,
        reason: EndReason,
        now: Instant,
    ) -> Result<(), AppError> {
        let participants = self.sessions.end(session_id, ended_by, reason, now)?.participants();

        for user_id in participants {
            self.presence.set_state(user_id, UserState::Idle);
            let by_partner = ended_by.is_some_and(|u| u != user_id);
            self.notify(
                user_id,
                ServerMessage::SessionEnded {
                    session_id,
                    reason,
                    by_partner,
                },
            );
        }

        info!("Session {} ended ({})", session_id, reason);
        Ok(())
    }

    // ---- messages -------------------------------------------------------

    /// Persist a message and queue it for the partner
    pub fn send_message(
        &mut self,
        user_id: UserId,
        session_id: SessionId,
        text: &str,
        now: Instant,
    ) -> Result<ChatMessage, AppError> {
        self.presence.lookup(user_id)?;
        let partner = self
            .sessions
            .active_with(session_id, user_id)?
            .partner_of(user_id)
            .ok_or(AppError::InvalidSession)?;

        let message = self.relay.append(session_id, user_id, text)?.clone();
        self.sessions.record_activity(session_id, now);
        self.presence.touch(user_id, now);

        self.notify(
            partner,
            ServerMessage::Message {
                message: message.clone(),
            },
        );
        Ok(message)
    }

    /// Recent messages of a session the user took part in
    ///
    /// Available while the session record exists, including its grace period.
    pub fn history(
        &self,
        user_id: UserId,
        session_id: SessionId,
        limit: Option<usize>,
        order: HistoryOrder,
    ) -> Result<Vec<ChatMessage>, AppError> {
        self.presence.lookup(user_id)?;
        match self.sessions.get(session_id) {
            Some(session) if session.contains(user_id) => {}
            _ => return Err(AppError::InvalidSession),
        }

        let limit = limit
            .unwrap_or(self.config.history_limit)
            .min(self.config.history_limit);
        Ok(self.relay.history(session_id, limit, order))
    }

    // ---- maintenance ----------------------------------------------------

    pub fn stats(&self) -> LobbyStats {
        LobbyStats {
            online_users: self.presence.online_count(),
            active_sessions: self.sessions.active_count(),
            waiting: QueueType::ALL
                .iter()
                .map(|qt| (*qt, self.queue.len(*qt)))
                .collect(),
        }
    }

    /// Periodic cleanup
    ///
    /// Purges stale queue entries, gives up searches older than the search
    /// window, ends idle sessions with `Timeout` and physically removes ended
    /// sessions whose grace period has elapsed.
    pub fn sweep(&mut self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();

        for queue_type in QueueType::ALL {
            report.stale_entries += self.purge_stale(queue_type, now);
        }

        let expired: Vec<(UserId, QueueType)> = self
            .queue
            .iter()
            .filter(|e| now.saturating_duration_since(e.enqueued_at) > self.config.search_timeout)
            .map(|e| (e.user_id, e.queue_type))
            .collect();
        for (user_id, queue_type) in expired {
            self.queue.dequeue(user_id);
            self.presence.set_state(user_id, UserState::Idle);
            self.notify(user_id, ServerMessage::SearchTimeout { queue_type });
            info!("Search for {} in {} queue timed out", user_id, queue_type);
            report.searches_timed_out += 1;
        }

        for session_id in self.sessions.idle_sessions(now, self.config.session_idle_timeout) {
            if self
                .close_session(session_id, None, EndReason::Timeout, now)
                .is_ok()
            {
                report.sessions_timed_out += 1;
            }
        }

        for session_id in self.sessions.purge_ended(now, self.config.session_grace) {
            self.relay.purge(session_id);
            report.sessions_purged += 1;
        }

        if report != SweepReport::default() {
            debug!("Sweep: {:?}", report);
        }
        report
    }
}

fn match_found(session_id: SessionId, partner: UserProfile, proximity: Proximity) -> ServerMessage {
    ServerMessage::MatchFound {
        session_id,
        partner,
        distance_km: proximity.distance_km(),
        tier: proximity.tier().map(|t| t.label()),
    }
}
