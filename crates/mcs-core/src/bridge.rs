//! Bridge router: Telegram-side conversation provisioning and inbound relay.
//!
//! One Matrix room per Telegram chat. Department selection finds or creates
//! the chat's room under a per-chat lock, so a user double-tapping a
//! department button cannot race two room creations for the same chat.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    backend::{CreateRoomRequest, MatrixBackend, PowerLevels, RoomKind},
    channel::Keyboard,
    config::{Config, Department},
    domain::{DepartmentId, MatrixUserId, RoomId, TgChatId, TgUserId},
    errors::Error,
    mapping::{ChatMapping, ChatRoomStore},
    spaces::{ChannelSurface, SpaceManager},
    Result,
};

/// The Telegram user on the other end of a chat, as the update reported it.
#[derive(Clone, Debug)]
pub struct ExternalContact {
    pub chat_id: TgChatId,
    pub user_id: TgUserId,
    pub display_name: String,
    pub username: Option<String>,
}

impl ExternalContact {
    /// `Bob (@bob)` or just `Bob` when no username is set.
    fn handle(&self) -> String {
        match &self.username {
            Some(u) => format!("{} (@{u})", self.display_name),
            None => self.display_name.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SelectOutcome {
    pub room_id: RoomId,
    /// True when the existing conversation was reconnected silently instead
    /// of a new room being created.
    pub reused: bool,
}

/// Per-chat mutexes so concurrent updates for the same chat serialize their
/// check-then-create sections.
#[derive(Default)]
struct ChatLocks {
    locks: std::sync::Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl ChatLocks {
    fn for_chat(&self, chat: TgChatId) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(chat.0)
            .or_default()
            .clone()
    }
}

pub struct BridgeRouter {
    cfg: Arc<Config>,
    backend: Arc<dyn MatrixBackend>,
    spaces: Arc<SpaceManager>,
    store: Arc<Mutex<ChatRoomStore>>,
    /// The bot's own user id, pinned at admin level in rooms it creates.
    me: MatrixUserId,
    locks: ChatLocks,
}

impl BridgeRouter {
    pub fn new(
        cfg: Arc<Config>,
        backend: Arc<dyn MatrixBackend>,
        spaces: Arc<SpaceManager>,
        store: Arc<Mutex<ChatRoomStore>>,
        me: MatrixUserId,
    ) -> Self {
        Self {
            cfg,
            backend,
            spaces,
            store,
            me,
            locks: ChatLocks::default(),
        }
    }

    pub fn department_keyboard(&self) -> Keyboard {
        Keyboard::departments(&self.cfg.departments)
    }

    pub fn department_for_command(&self, command: &str) -> Option<&Department> {
        self.cfg.department_for_command(command)
    }

    pub fn department(&self, id: &DepartmentId) -> Option<&Department> {
        self.cfg.department(id)
    }

    /// Find or create the room for this chat and department. Reuses the
    /// mapped room when it is still reachable, repairing recipient drift on
    /// the way; replaces it when the room is gone or the department changed.
    pub async fn select_department(
        &self,
        contact: &ExternalContact,
        dept_id: &DepartmentId,
    ) -> Result<SelectOutcome> {
        let dept = self
            .cfg
            .department(dept_id)
            .cloned()
            .ok_or_else(|| Error::Config(format!("unknown department: {dept_id}")))?;

        let lock = self.locks.for_chat(contact.chat_id);
        let _guard = lock.lock().await;

        let existing = self
            .store
            .lock()
            .await
            .get(contact.chat_id)
            .filter(|m| m.department_id == *dept_id)
            .cloned();

        if let Some(mapping) = existing {
            match self.backend.joined_members(&mapping.room_id).await {
                Ok(members) => {
                    self.repair_invites(&mapping.room_id, &dept, &members).await;
                    info!(chat = contact.chat_id.0, room = %mapping.room_id, "reconnected existing conversation");
                    return Ok(SelectOutcome {
                        room_id: mapping.room_id,
                        reused: true,
                    });
                }
                Err(e) if e.invalidates_room() => {
                    warn!(chat = contact.chat_id.0, room = %mapping.room_id, "mapped room unreachable, provisioning fresh: {e}");
                    self.store.lock().await.remove(contact.chat_id);
                }
                Err(e) => return Err(e),
            }
        }

        let room = self.provision(contact, &dept).await?;
        Ok(SelectOutcome {
            room_id: room,
            reused: false,
        })
    }

    /// Forward a Telegram text message into the chat's mapped room. Returns
    /// false when nothing was forwarded (no conversation yet, or the text is
    /// a bot command).
    pub async fn relay_inbound(&self, contact: &ExternalContact, text: &str) -> Result<bool> {
        if text.starts_with('/') {
            return Ok(false);
        }
        let Some(room) = self
            .store
            .lock()
            .await
            .get(contact.chat_id)
            .map(|m| m.room_id.clone())
        else {
            return Ok(false);
        };

        let body = format!("{}: {text}", contact.handle());
        self.backend.send_text(&room, &body).await?;
        Ok(true)
    }

    /// The department currently mapped for a chat, if any.
    pub async fn current_department(&self, chat: TgChatId) -> Option<DepartmentId> {
        self.store
            .lock()
            .await
            .get(chat)
            .map(|m| m.department_id.clone())
    }

    async fn provision(&self, contact: &ExternalContact, dept: &Department) -> Result<RoomId> {
        let space = match self
            .spaces
            .ensure_department_space(ChannelSurface::Telegram, dept)
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(department = %dept.id, "space unavailable, creating room without container: {e}");
                None
            }
        };
        // Persist whatever the hierarchy manager now knows, even on partial
        // failure, so a restart does not re-create the spaces that did work.
        let snapshot = self.spaces.snapshot().await;
        self.store.lock().await.set_space_ids(snapshot);

        let mut invites: Vec<MatrixUserId> = dept.recipients.clone();
        let observer = self.cfg.enabled_observer().cloned();
        if let Some(obs) = &observer {
            if !invites.contains(obs) {
                invites.push(obs.clone());
            }
        }
        let power_levels = observer
            .as_ref()
            .map(|obs| PowerLevels::observer_lockdown(&self.me, &dept.recipients, obs));

        let room = self
            .backend
            .create_room(CreateRoomRequest {
                name: format!(
                    "{} ({}) - {} #tg{}",
                    contact.display_name,
                    ChannelSurface::Telegram.label(),
                    dept.name,
                    contact.chat_id.0
                ),
                topic: Some(format!("Telegram conversation - {}", dept.name)),
                kind: RoomKind::Chat,
                invites,
                power_levels,
            })
            .await?;
        info!(chat = contact.chat_id.0, room = %room, department = %dept.id, "provisioned telegram room");

        if let Some(space) = space {
            self.spaces.attach_room(&space, &room).await;
        }

        // The notice is context for the agents; its failure never unwinds a
        // successfully provisioned conversation.
        let notice = format!("New Telegram conversation started with {}", contact.handle());
        if let Err(e) = self.backend.send_notice(&room, &notice).await {
            warn!(room = %room, "intro notice failed: {e}");
        }

        self.store.lock().await.insert(
            contact.chat_id,
            ChatMapping {
                room_id: room.clone(),
                department_id: dept.id.clone(),
                tg_user_id: contact.user_id,
                display_name: contact.display_name.clone(),
            },
        );

        Ok(room)
    }

    /// Re-invite configured recipients (and the observer) who are missing
    /// from the room. Each failure is logged and skipped so one bad invite
    /// cannot block the reconnect.
    async fn repair_invites(&self, room: &RoomId, dept: &Department, members: &[MatrixUserId]) {
        let mut wanted: Vec<&MatrixUserId> = dept.recipients.iter().collect();
        if let Some(obs) = self.cfg.enabled_observer() {
            wanted.push(obs);
        }

        for user in wanted {
            if members.contains(user) {
                continue;
            }
            if let Err(e) = self.backend.invite(room, user).await {
                warn!(room = %room, user = %user, "drift repair invite failed: {e}");
            }
        }
    }
}
