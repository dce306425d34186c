//! Waiting Queue
//!
//! Ordered pool of users seeking a match, partitioned by queue type. Every
//! entry carries a ticket: a sequence number unique for the lifetime of the
//! queue. Tickets give the insertion order and serve as the compare-and-swap
//! token when a match is committed.

use std::collections::{BTreeMap, HashMap};

use tokio::time::Instant;

use crate::geo::Location;
use crate::types::{QueueType, UserId};

#[derive(Debug, Clone, PartialEq)]
pub struct WaitingEntry {
    pub user_id: UserId,
    pub queue_type: QueueType,
    pub enqueued_at: Instant,
    pub location: Option<Location>,
    pub ticket: u64,
}

#[derive(Debug, Default)]
pub struct WaitingQueue {
    queues: HashMap<QueueType, BTreeMap<u64, WaitingEntry>>,
    /// UserId -> (queue, ticket) of its single outstanding entry
    index: HashMap<UserId, (QueueType, u64)>,
    next_ticket: u64,
}

impl WaitingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh entry at the back of `queue_type`
    ///
    /// Any prior entry for the user, in any queue type, is removed first.
    pub fn enqueue(
        &mut self,
        user_id: UserId,
        queue_type: QueueType,
        location: Option<Location>,
        now: Instant,
    ) -> &WaitingEntry {
        self.dequeue(user_id);

        let ticket = self.next_ticket;
        self.next_ticket += 1;

        self.insert(WaitingEntry {
            user_id,
            queue_type,
            enqueued_at: now,
            location,
            ticket,
        })
    }

    /// Put back an entry previously taken out, keeping its original position
    ///
    /// Replaces any newer entry the user may have.
    pub fn restore(&mut self, entry: WaitingEntry) -> &WaitingEntry {
        self.dequeue(entry.user_id);
        self.insert(entry)
    }

    fn insert(&mut self, entry: WaitingEntry) -> &WaitingEntry {
        let (user_id, queue_type, ticket) = (entry.user_id, entry.queue_type, entry.ticket);
        self.index.insert(user_id, (queue_type, ticket));
        self.queues
            .entry(queue_type)
            .or_default()
            .entry(ticket)
            .or_insert(entry)
    }

    /// Remove the user's entry, returning it if there was one
    pub fn dequeue(&mut self, user_id: UserId) -> Option<WaitingEntry> {
        let (queue_type, ticket) = self.index.remove(&user_id)?;
        self.queues.get_mut(&queue_type)?.remove(&ticket)
    }

    /// Remove the user's entry only if it still carries `ticket`
    pub fn take_if(&mut self, user_id: UserId, ticket: u64) -> Option<WaitingEntry> {
        match self.index.get(&user_id) {
            Some(&(_, current)) if current == ticket => self.dequeue(user_id),
            _ => None,
        }
    }

    /// Update the location of a queued entry in place; position is kept
    pub fn set_location(&mut self, user_id: UserId, location: Option<Location>) -> bool {
        let Some(&(queue_type, ticket)) = self.index.get(&user_id) else {
            return false;
        };
        match self.queues.get_mut(&queue_type).and_then(|q| q.get_mut(&ticket)) {
            Some(entry) => {
                entry.location = location;
                true
            }
            None => false,
        }
    }

    pub fn entry_of(&self, user_id: UserId) -> Option<&WaitingEntry> {
        let (queue_type, ticket) = self.index.get(&user_id)?;
        self.queues.get(queue_type)?.get(ticket)
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.index.contains_key(&user_id)
    }

    /// Point-in-time copy of one queue, oldest first
    pub fn snapshot(&self, queue_type: QueueType) -> Vec<WaitingEntry> {
        self.queues
            .get(&queue_type)
            .map(|q| q.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Entries across all queue types, oldest first within each type
    pub fn iter(&self) -> impl Iterator<Item = &WaitingEntry> {
        self.queues.values().flat_map(|q| q.values())
    }

    pub fn len(&self, queue_type: QueueType) -> usize {
        self.queues.get(&queue_type).map_or(0, BTreeMap::len)
    }

    pub fn total(&self) -> usize {
        self.index.len()
    }
}
