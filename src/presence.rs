//! User Presence Registry
//!
//! Single source of truth mapping a live connection to a registered user.

use std::collections::HashMap;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::AppError;
use crate::geo::Location;
use crate::types::{ConnectionId, UserId, UserState};
use crate::user::User;
use crate::validation::{generate_pseudonym, validate_display_name};

/// Registration request
#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub display_name: Option<String>,
    pub location: Option<Location>,
    pub attributes: Vec<String>,
    pub preference: Option<String>,
}

/// Registered users, indexed by id and by connection
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    users: HashMap<UserId, User>,
    by_connection: HashMap<ConnectionId, UserId>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user on a connection
    ///
    /// A connection carries at most one user: registering again on the same
    /// connection updates the existing profile in place and keeps its id and state.
    pub fn register(
        &mut self,
        connection: ConnectionId,
        request: Registration,
        now: Instant,
    ) -> Result<&User, AppError> {
        let (display_name, is_anonymous) = match request.display_name.as_deref() {
            Some(name) if !name.trim().is_empty() => (validate_display_name(name)?, false),
            _ => (generate_pseudonym(), true),
        };

        let user_id = match self.by_connection.get(&connection) {
            Some(&existing) => {
                debug!("Connection {} re-registered user {}", connection, existing);
                existing
            }
            None => {
                let user = User::new(connection, display_name.clone(), is_anonymous, None, now);
                let id = user.id;
                self.users.insert(id, user);
                self.by_connection.insert(connection, id);
                id
            }
        };

        let user = self
            .users
            .get_mut(&user_id)
            .ok_or(AppError::NotRegistered)?;
        user.display_name = display_name;
        user.is_anonymous = is_anonymous;
        user.location = request.location;
        user.set_attributes(request.attributes);
        user.set_preference(request.preference);
        user.last_seen_at = now;

        info!("User {} registered as '{}'", user.id, user.display_name);
        Ok(&*user)
    }

    /// Remove the user bound to `connection`
    ///
    /// Returns the removed record, or `None` when nothing was registered
    /// (deregistering twice is a no-op).
    pub fn deregister(&mut self, connection: ConnectionId) -> Option<User> {
        let user_id = self.by_connection.remove(&connection)?;
        self.users.remove(&user_id)
    }

    /// Refresh `last_seen_at`; unknown users are ignored
    pub fn touch(&mut self, user_id: UserId, now: Instant) {
        if let Some(user) = self.users.get_mut(&user_id) {
            user.last_seen_at = now;
        }
    }

    pub fn lookup(&self, user_id: UserId) -> Result<&User, AppError> {
        self.users.get(&user_id).ok_or(AppError::NotRegistered)
    }

    pub fn get(&self, user_id: UserId) -> Option<&User> {
        self.users.get(&user_id)
    }

    pub fn get_mut(&mut self, user_id: UserId) -> Option<&mut User> {
        self.users.get_mut(&user_id)
    }

    /// User registered on a connection
    pub fn user_for(&self, connection: ConnectionId) -> Result<UserId, AppError> {
        self.by_connection
            .get(&connection)
            .copied()
            .ok_or(AppError::NotRegistered)
    }

    pub fn connection_of(&self, user_id: UserId) -> Option<ConnectionId> {
        self.users.get(&user_id).map(|u| u.connection)
    }

    pub fn set_state(&mut self, user_id: UserId, state: UserState) {
        if let Some(user) = self.users.get_mut(&user_id) {
            user.state = state;
        }
    }

    pub fn online_count(&self) -> usize {
        self.users.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
