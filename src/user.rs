//! User record
//!
//! Represents a registered user bound to exactly one live connection.

use std::collections::BTreeSet;

use serde::Serialize;
use tokio::time::Instant;

use crate::geo::Location;
use crate::types::{ConnectionId, UserId, UserState};

/// Preference value meaning "no filter"
pub const ANY_PREFERENCE: &str = "any";

/// Registered user
///
/// Holds identity, matching metadata and lifecycle state. The transport
/// handle itself stays with the server; the user only knows its connection id.
#[derive(Debug, Clone)]
pub struct User {
    /// Unique identifier for this user
    pub id: UserId,
    /// Connection this user is bound to
    pub connection: ConnectionId,
    /// Display name (chosen or generated)
    pub display_name: String,
    /// Whether the display name was generated
    pub is_anonymous: bool,
    /// Attribute tags, lowercased (e.g. a gender)
    pub attributes: BTreeSet<String>,
    /// Attribute a partner must carry, if any
    pub preference: Option<String>,
    /// Last known location
    pub location: Option<Location>,
    /// Lifecycle state
    pub state: UserState,
    /// Last heartbeat or activity
    pub last_seen_at: Instant,
}

impl User {
    pub fn new(
        connection: ConnectionId,
        display_name: String,
        is_anonymous: bool,
        location: Option<Location>,
        now: Instant,
    ) -> Self {
        Self {
            id: UserId::new(),
            connection,
            display_name,
            is_anonymous,
            attributes: BTreeSet::new(),
            preference: None,
            location,
            state: UserState::Idle,
            last_seen_at: now,
        }
    }

    /// Replace attribute tags (normalized to lowercase, blanks dropped)
    pub fn set_attributes<I>(&mut self, attributes: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.attributes = attributes
            .into_iter()
            .map(|a| a.trim().to_lowercase())
            .filter(|a| !a.is_empty())
            .collect();
    }

    /// Set the partner preference; "any" or blank clears it
    pub fn set_preference(&mut self, preference: Option<String>) {
        self.preference = preference
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty() && p != ANY_PREFERENCE);
    }

    /// Whether this user's preference admits `other`
    pub fn accepts(&self, other: &User) -> bool {
        match &self.preference {
            Some(wanted) => other.attributes.contains(wanted),
            None => true,
        }
    }

    /// Both sides accept each other
    pub fn compatible_with(&self, other: &User) -> bool {
        self.accepts(other) && other.accepts(self)
    }

    /// Heartbeat silence exceeded
    pub fn is_stale(&self, now: Instant, stale_after: std::time::Duration) -> bool {
        now.saturating_duration_since(self.last_seen_at) > stale_after
    }

    /// Public view sent to partners and to the user itself
    pub fn profile(&self) -> UserProfile {
        UserProfile {
            id: self.id,
            display_name: self.display_name.clone(),
            attributes: self.attributes.iter().cloned().collect(),
            location: self.location.as_ref().map(Location::coarse),
        }
    }
}

/// Public user view
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserProfile {
    pub id: UserId,
    pub display_name: String,
    pub attributes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn user(name: &str) -> User {
        User::new(ConnectionId::new(), name.to_string(), false, None, Instant::now())
    }

    #[test]
    fn test_user_creation() {
        let user = user("Alice");
        assert_eq!(user.state, UserState::Idle);
        assert!(user.attributes.is_empty());
        assert!(user.preference.is_none());
    }

    #[test]
    fn test_preference_any_clears() {
        let mut user = user("Alice");
        user.set_preference(Some("Female".to_string()));
        assert_eq!(user.preference.as_deref(), Some("female"));
        user.set_preference(Some("ANY".to_string()));
        assert!(user.preference.is_none());
    }

    #[test]
    fn test_compatibility_is_mutual() {
        let mut a = user("Alice");
        let mut b = user("Bob");
        a.set_attributes(vec!["female".to_string()]);
        b.set_attributes(vec!["Male ".to_string()]);

        assert!(a.compatible_with(&b));

        a.set_preference(Some("male".to_string()));
        assert!(a.compatible_with(&b));

        b.set_preference(Some("male".to_string()));
        assert!(!a.compatible_with(&b));
        assert!(!b.compatible_with(&a));
    }

    #[test]
    fn test_staleness() {
        let user = user("Alice");
        let later = user.last_seen_at + Duration::from_secs(121);
        assert!(user.is_stale(later, Duration::from_secs(120)));
        assert!(!user.is_stale(user.last_seen_at, Duration::from_secs(120)));
    }

    #[test]
    fn test_profile_hides_coordinates() {
        let mut user = user("Alice");
        user.location = Some(Location {
            city: Some("Paris".into()),
            lat: Some(48.85),
            lon: Some(2.35),
            ..Default::default()
        });
        let profile = user.profile();
        let location = profile.location.unwrap();
        assert_eq!(location.city.as_deref(), Some("Paris"));
        assert!(location.lat.is_none());
    }
}
