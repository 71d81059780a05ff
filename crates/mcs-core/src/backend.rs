//! Hexagonal port for the chat backend (Matrix client-server API).
//!
//! The HTTP adapter lives in `mcs-matrix`; tests implement fakes.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    domain::{EventId, MatrixUserId, RoomId},
    Result,
};

/// `m.room.power_levels` content, limited to the fields this system reads
/// and writes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerLevels {
    #[serde(default)]
    pub users: BTreeMap<String, i64>,
    #[serde(default)]
    pub users_default: i64,
    #[serde(default)]
    pub events_default: i64,
    #[serde(default = "default_moderator")]
    pub state_default: i64,
    #[serde(default = "default_moderator")]
    pub invite: i64,
    #[serde(default = "default_moderator")]
    pub kick: i64,
    #[serde(default = "default_moderator")]
    pub ban: i64,
    #[serde(default = "default_moderator")]
    pub redact: i64,
}

fn default_moderator() -> i64 {
    50
}

impl Default for PowerLevels {
    fn default() -> Self {
        Self {
            users: BTreeMap::new(),
            users_default: 0,
            events_default: 0,
            state_default: 50,
            invite: 50,
            kick: 50,
            ban: 50,
            redact: 50,
        }
    }
}

/// The minimum level required to post in observer-locked rooms.
pub const POST_LEVEL: i64 = 10;
/// Level granted to support recipients.
pub const RECIPIENT_LEVEL: i64 = 50;
/// Level pinned on the read-only observer.
pub const OBSERVER_LEVEL: i64 = 0;
/// Level retained by the creating identity.
pub const ADMIN_LEVEL: i64 = 100;

impl PowerLevels {
    /// Levels for a room with a read-only observer: recipients can post and
    /// moderate, ordinary members post at the default level, the observer is
    /// pinned below the posting threshold. Applied inside the room-creation
    /// request so there is never a window where the observer can post.
    ///
    /// The override replaces the server's default `users` map wholesale, so
    /// the creator must be pinned here too; otherwise it falls to
    /// `users_default` and loses its own invite and state rights.
    pub fn observer_lockdown(
        creator: &MatrixUserId,
        recipients: &[MatrixUserId],
        observer: &MatrixUserId,
    ) -> Self {
        let mut users = BTreeMap::new();
        for r in recipients {
            users.insert(r.0.clone(), RECIPIENT_LEVEL);
        }
        users.insert(creator.0.clone(), ADMIN_LEVEL);
        users.insert(observer.0.clone(), OBSERVER_LEVEL);
        Self {
            users,
            users_default: POST_LEVEL,
            events_default: POST_LEVEL,
            ..Self::default()
        }
    }

    pub fn can_post(&self, user: &MatrixUserId) -> bool {
        let level = self
            .users
            .get(&user.0)
            .copied()
            .unwrap_or(self.users_default);
        level >= self.events_default
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoomKind {
    /// An `m.space` container.
    Space,
    /// An ordinary conversation room.
    Chat,
}

#[derive(Clone, Debug)]
pub struct CreateRoomRequest {
    pub name: String,
    pub topic: Option<String>,
    pub kind: RoomKind,
    pub invites: Vec<MatrixUserId>,
    /// Initial power levels, applied atomically with creation.
    pub power_levels: Option<PowerLevels>,
}

impl CreateRoomRequest {
    pub fn space(name: impl Into<String>, topic: Option<String>) -> Self {
        Self {
            name: name.into(),
            topic,
            kind: RoomKind::Space,
            invites: Vec::new(),
            power_levels: None,
        }
    }
}

/// A message event pulled out of the sync stream.
#[derive(Clone, Debug)]
pub struct RoomEvent {
    pub room_id: RoomId,
    pub event_id: EventId,
    pub sender: MatrixUserId,
    pub body: String,
    /// Server timestamp, milliseconds since epoch.
    pub origin_server_ts: i64,
}

#[derive(Clone, Debug)]
pub struct SyncBatch {
    /// Cursor to pass as `since` on the next poll.
    pub next_batch: String,
    pub events: Vec<RoomEvent>,
}

/// Port over the chat backend. Token-authenticated, REST-like.
#[async_trait]
pub trait MatrixBackend: Send + Sync {
    async fn whoami(&self) -> Result<MatrixUserId>;

    async fn create_room(&self, req: CreateRoomRequest) -> Result<RoomId>;
    async fn invite(&self, room: &RoomId, user: &MatrixUserId) -> Result<()>;
    async fn join(&self, room: &RoomId) -> Result<()>;
    async fn leave(&self, room: &RoomId) -> Result<()>;
    async fn joined_members(&self, room: &RoomId) -> Result<Vec<MatrixUserId>>;

    async fn send_text(&self, room: &RoomId, body: &str) -> Result<EventId>;
    /// `m.notice` variant, for system/service messages bots should ignore.
    async fn send_notice(&self, room: &RoomId, body: &str) -> Result<EventId>;

    async fn power_levels(&self, room: &RoomId) -> Result<PowerLevels>;
    async fn set_power_levels(&self, room: &RoomId, levels: &PowerLevels) -> Result<()>;

    /// Assert the parent->child half of a space relationship.
    async fn set_space_child(&self, parent: &RoomId, child: &RoomId) -> Result<()>;
    /// Assert the child->parent half of a space relationship.
    async fn set_space_parent(&self, child: &RoomId, parent: &RoomId) -> Result<()>;

    /// Cursor-based poll for new events. `since = None` returns the current
    /// cursor (and whatever the server includes in the initial batch).
    async fn sync_since(&self, since: Option<&str>, timeout: Duration) -> Result<SyncBatch>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> MatrixUserId {
        MatrixUserId(format!("@{id}:localhost"))
    }

    #[test]
    fn observer_lockdown_blocks_observer_but_not_members() {
        let recipients = vec![user("admin"), user("support")];
        let observer = user("observer");
        let levels = PowerLevels::observer_lockdown(&user("bot"), &recipients, &observer);

        assert!(!levels.can_post(&observer));
        assert!(levels.can_post(&user("admin")));
        assert!(levels.can_post(&user("support")));
        // Ordinary members (the end user) post at the default level.
        assert!(levels.can_post(&user("visitor")));
        assert!(levels.events_default > OBSERVER_LEVEL);
    }

    #[test]
    fn observer_lockdown_keeps_creator_above_invite_threshold() {
        let levels =
            PowerLevels::observer_lockdown(&user("bot"), &[user("admin")], &user("observer"));

        // The creator keeps the rights it needs for drift-repair invites
        // and space state after the override replaces the users map.
        let creator = levels.users.get("@bot:localhost").copied();
        assert_eq!(creator, Some(ADMIN_LEVEL));
        assert!(creator.unwrap() >= levels.invite);
        assert!(creator.unwrap() >= levels.state_default);
    }

    #[test]
    fn power_levels_round_trip_missing_fields() {
        // Servers may omit fields that have protocol defaults.
        let parsed: PowerLevels = serde_json::from_str(r#"{"users":{"@a:x":100}}"#).unwrap();
        assert_eq!(parsed.users.get("@a:x"), Some(&100));
        assert_eq!(parsed.state_default, 50);
        assert_eq!(parsed.events_default, 0);
    }
}
