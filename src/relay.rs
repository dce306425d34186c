//! Message Relay storage
//!
//! Append-only message log per session. Messages are ordered by insertion
//! sequence, which is also `sent_at` order since the log has a single writer.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::AppError;
use crate::types::{MessageId, SessionId, UserId};
use crate::validation::sanitize_message;

/// A chat message within a session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub session_id: SessionId,
    pub sender_id: UserId,
    pub text: String,
    pub sent_at: DateTime<Utc>,
    /// Insertion sequence, unique across the relay
    pub seq: u64,
}

/// History page order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryOrder {
    Chronological,
    NewestFirst,
}

#[derive(Debug)]
pub struct MessageRelay {
    logs: HashMap<SessionId, Vec<ChatMessage>>,
    next_seq: u64,
    max_chars: usize,
}

impl MessageRelay {
    pub fn new(max_chars: usize) -> Self {
        Self {
            logs: HashMap::new(),
            next_seq: 0,
            max_chars,
        }
    }

    /// Validate and append a message
    ///
    /// Session membership is checked by the caller.
    pub fn append(
        &mut self,
        session_id: SessionId,
        sender_id: UserId,
        text: &str,
    ) -> Result<&ChatMessage, AppError> {
        let text = sanitize_message(text, self.max_chars)?;

        let seq = self.next_seq;
        self.next_seq += 1;

        let log = self.logs.entry(session_id).or_default();
        // Keep sent_at non-decreasing even if the wall clock steps back
        let now = Utc::now();
        let sent_at = log.last().map_or(now, |m| m.sent_at.max(now));
        log.push(ChatMessage {
            id: MessageId::new(),
            session_id,
            sender_id,
            text,
            sent_at,
            seq,
        });
        log.last().ok_or(AppError::InvalidSession)
    }

    /// Up to `limit` most recent messages of a session
    pub fn history(&self, session_id: SessionId, limit: usize, order: HistoryOrder) -> Vec<ChatMessage> {
        let Some(log) = self.logs.get(&session_id) else {
            return Vec::new();
        };

        let start = log.len().saturating_sub(limit);
        let page = &log[start..];
        match order {
            HistoryOrder::Chronological => page.to_vec(),
            HistoryOrder::NewestFirst => page.iter().rev().cloned().collect(),
        }
    }

    /// Drop a session's log
    pub fn purge(&mut self, session_id: SessionId) -> usize {
        self.logs.remove(&session_id).map_or(0, |log| log.len())
    }

    #[cfg(test)]
    fn count(&self, session_id: SessionId) -> usize {
        self.logs.get(&session_id).map_or(0, Vec::len)
    }
}
