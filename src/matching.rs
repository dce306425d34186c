//! Partner selection
//!
//! Pure ranking over a queue snapshot. Eligibility (staleness, preferences,
//! the requester itself) is decided by the caller; this module only orders
//! eligible candidates:
//!
//! 1. A candidate whose distance is known beats one ranked by tier only.
//! 2. Among distance-ranked candidates the strictly nearest wins.
//! 3. Among tier-ranked candidates the strictly best tier wins.
//!
//! Ties keep the earlier (older) candidate, so queue order is the final
//! tie-break.

use serde::Serialize;

use crate::geo::{haversine_km, LocalityTier, Location};
use crate::queue::WaitingEntry;
use crate::types::{QueueType, SessionId, UserId};

/// How close a selected partner is
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Proximity {
    /// Great-circle distance in kilometres
    Distance(f64),
    /// Locality tier, used when either side lacks coordinates
    Tier(LocalityTier),
}

impl Proximity {
    /// Measure `candidate` against `origin`
    pub fn between(origin: Option<&Location>, candidate: Option<&Location>) -> Proximity {
        let coords = origin
            .and_then(Location::coordinates)
            .zip(candidate.and_then(Location::coordinates));
        match coords {
            Some((a, b)) => Proximity::Distance(haversine_km(a, b)),
            None => Proximity::Tier(LocalityTier::between(origin, candidate)),
        }
    }

    /// Strictly better than `other`
    pub fn beats(&self, other: &Proximity) -> bool {
        match (self, other) {
            (Proximity::Distance(a), Proximity::Distance(b)) => a < b,
            (Proximity::Distance(_), Proximity::Tier(_)) => true,
            (Proximity::Tier(_), Proximity::Distance(_)) => false,
            (Proximity::Tier(a), Proximity::Tier(b)) => a > b,
        }
    }

    pub fn distance_km(&self) -> Option<f64> {
        match self {
            Proximity::Distance(km) => Some(*km),
            Proximity::Tier(_) => None,
        }
    }

    pub fn tier(&self) -> Option<LocalityTier> {
        match self {
            Proximity::Tier(tier) => Some(*tier),
            Proximity::Distance(_) => None,
        }
    }
}

/// The chosen candidate and the ticket it was queued under
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub user_id: UserId,
    pub ticket: u64,
    pub proximity: Proximity,
}

/// Pick the best candidate for a requester located at `origin`
///
/// `candidates` must already be filtered to eligible entries, in queue order.
pub fn select_partner<'a, I>(origin: Option<&Location>, candidates: I) -> Option<Selection>
where
    I: IntoIterator<Item = &'a WaitingEntry>,
{
    let mut best: Option<Selection> = None;

    for entry in candidates {
        let proximity = Proximity::between(origin, entry.location.as_ref());
        let better = match &best {
            Some(current) => proximity.beats(&current.proximity),
            None => true,
        };
        if better {
            best = Some(Selection {
                user_id: entry.user_id,
                ticket: entry.ticket,
                proximity,
            });
        }
    }

    best
}

/// A selected pair awaiting commit
///
/// Produced from a snapshot; by the time it is committed the candidate may
/// be gone, which the commit detects through the ticket.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchPlan {
    pub requester: UserId,
    pub queue_type: QueueType,
    pub candidate: Selection,
}

/// Result of a match request
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Matched {
        session_id: SessionId,
        partner_id: UserId,
        proximity: Proximity,
    },
    /// No partner yet; the requester is queued
    Waiting { queue_type: QueueType },
}
