//! Session Manager
//!
//! Lifecycle of matched pairs: `Active -> Ended -> purged`. A user takes part
//! in at most one active session at a time.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::error::AppError;
use crate::matching::Proximity;
use crate::types::{EndReason, QueueType, SessionId, SessionStatus, UserId};

/// 1:1 chat session between two matched users
///
/// The pair is unordered conceptually; slot A is the requester that
/// committed the match, slot B the partner it selected.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub participant_a: UserId,
    pub participant_b: UserId,
    pub queue_type: QueueType,
    pub created_at: Instant,
    pub last_activity_at: Instant,
    pub status: SessionStatus,
    pub proximity: Proximity,
    pub end_reason: Option<EndReason>,
    pub ended_by: Option<UserId>,
    pub ended_at: Option<Instant>,
}

impl Session {
    pub fn new(
        participant_a: UserId,
        participant_b: UserId,
        queue_type: QueueType,
        proximity: Proximity,
        now: Instant,
    ) -> Self {
        Self {
            id: SessionId::new(),
            participant_a,
            participant_b,
            queue_type,
            created_at: now,
            last_activity_at: now,
            status: SessionStatus::Active,
            proximity,
            end_reason: None,
            ended_by: None,
            ended_at: None,
        }
    }

    /// Get the partner of a participant
    ///
    /// Returns None if `user_id` is not in this session.
    pub fn partner_of(&self, user_id: UserId) -> Option<UserId> {
        if self.participant_a == user_id {
            Some(self.participant_b)
        } else if self.participant_b == user_id {
            Some(self.participant_a)
        } else {
            None
        }
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.participant_a == user_id || self.participant_b == user_id
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    pub fn participants(&self) -> [UserId; 2] {
        [self.participant_a, self.participant_b]
    }

    /// Wire view
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id,
            participants: self.participants(),
            queue_type: self.queue_type,
            status: self.status,
            distance_km: self.proximity.distance_km(),
            tier: self.proximity.tier().map(|t| t.label()),
            end_reason: self.end_reason,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub participants: [UserId; 2],
    pub queue_type: QueueType,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_km: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
}

/// All sessions still on record, plus the active-session index
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: HashMap<SessionId, Session>,
    /// UserId -> its single active session
    active: HashMap<UserId, SessionId>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an active session for two users who have none
    pub fn create(
        &mut self,
        user_a: UserId,
        user_b: UserId,
        queue_type: QueueType,
        proximity: Proximity,
        now: Instant,
    ) -> Result<&Session, AppError> {
        if user_a == user_b {
            return Err(AppError::InvalidSession);
        }
        if self.active.contains_key(&user_a) || self.active.contains_key(&user_b) {
            return Err(AppError::AlreadyInSession);
        }

        let session = Session::new(user_a, user_b, queue_type, proximity, now);
        let id = session.id;
        self.active.insert(user_a, id);
        self.active.insert(user_b, id);
        Ok(self.sessions.entry(id).or_insert(session))
    }

    /// Mark an active session ended
    ///
    /// `ended_by` must be a participant, unless it is `None` (administrative end).
    pub fn end(
        &mut self,
        session_id: SessionId,
        ended_by: Option<UserId>,
        reason: EndReason,
        now: Instant,
    ) -> Result<&Session, AppError> {
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(AppError::InvalidSession)?;
        if !session.is_active() {
            return Err(AppError::InvalidSession);
        }
        if let Some(user) = ended_by {
            if !session.contains(user) {
                return Err(AppError::InvalidSession);
            }
        }

        session.status = SessionStatus::Ended;
        session.end_reason = Some(reason);
        session.ended_by = ended_by;
        session.ended_at = Some(now);

        for user in session.participants() {
            if self.active.get(&user) == Some(&session_id) {
                self.active.remove(&user);
            }
        }
        Ok(&*session)
    }

    pub fn get(&self, session_id: SessionId) -> Option<&Session> {
        self.sessions.get(&session_id)
    }

    pub fn active_for(&self, user_id: UserId) -> Option<&Session> {
        self.active
            .get(&user_id)
            .and_then(|id| self.sessions.get(id))
    }

    /// Active session with `user_id` as participant, or `InvalidSession`
    pub fn active_with(&self, session_id: SessionId, user_id: UserId) -> Result<&Session, AppError> {
        match self.sessions.get(&session_id) {
            Some(session) if session.is_active() && session.contains(user_id) => Ok(session),
            _ => Err(AppError::InvalidSession),
        }
    }

    pub fn record_activity(&mut self, session_id: SessionId, now: Instant) {
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.last_activity_at = now;
        }
    }

    /// Active sessions without activity for longer than `idle_timeout`
    pub fn idle_sessions(&self, now: Instant, idle_timeout: Duration) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|s| s.is_active())
            .filter(|s| now.saturating_duration_since(s.last_activity_at) > idle_timeout)
            .map(|s| s.id)
            .collect()
    }

    /// Drop ended sessions whose grace period has elapsed
    pub fn purge_ended(&mut self, now: Instant, grace: Duration) -> Vec<SessionId> {
        let expired: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| match s.ended_at {
                Some(ended_at) => now.saturating_duration_since(ended_at) >= grace,
                None => false,
            })
            .map(|s| s.id)
            .collect();

        for id in &expired {
            self.sessions.remove(id);
            debug!("Session {} purged", id);
        }
        expired
    }

    pub fn active_count(&self) -> usize {
        self.active.len() / 2
    }

    /// No records on file, ended ones included
    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
