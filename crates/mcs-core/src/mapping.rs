//! Persistent chat <-> room mapping for the Telegram surface.
//!
//! Unlike the web session store (one file per visitor), this is a single
//! process-wide file: the bot serves every Telegram chat and must survive a
//! restart without losing which room each conversation lives in. The space
//! ids the hierarchy manager discovered are persisted alongside so a restart
//! does not re-create container spaces.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    domain::{DepartmentId, RoomId, TgChatId, TgUserId},
    session::write_atomic,
    spaces::SpaceIds,
    Result,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMapping {
    pub room_id: RoomId,
    pub department_id: DepartmentId,
    pub tg_user_id: TgUserId,
    pub display_name: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct MappingFile {
    #[serde(default)]
    chat_to_room: HashMap<i64, ChatMapping>,
    #[serde(default)]
    room_to_chat: HashMap<String, i64>,
    #[serde(default)]
    space_ids: SpaceIds,
}

/// Write-through store for the Telegram chat <-> room mapping.
pub struct ChatRoomStore {
    path: PathBuf,
    data: MappingFile,
}

impl ChatRoomStore {
    /// Load from disk. A missing file starts empty; a corrupted file is
    /// logged and replaced with an empty mapping rather than refusing to
    /// start.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = match read_mapping(&path) {
            Ok(data) => data,
            Err(e) => {
                warn!(path = %path.display(), "mapping file unreadable, starting empty: {e}");
                MappingFile::default()
            }
        };
        Self { path, data }
    }

    pub fn get(&self, chat: TgChatId) -> Option<&ChatMapping> {
        self.data.chat_to_room.get(&chat.0)
    }

    pub fn chat_for_room(&self, room: &RoomId) -> Option<TgChatId> {
        self.data.room_to_chat.get(&room.0).copied().map(TgChatId)
    }

    /// All rooms the relay should be watching.
    pub fn watched_rooms(&self) -> Vec<RoomId> {
        self.data.room_to_chat.keys().cloned().map(RoomId).collect()
    }

    pub fn insert(&mut self, chat: TgChatId, mapping: ChatMapping) {
        // Replacing a chat's mapping must also retire the old reverse edge,
        // or the relay would keep forwarding from the abandoned room.
        if let Some(old) = self.data.chat_to_room.get(&chat.0) {
            self.data.room_to_chat.remove(&old.room_id.0);
        }
        self.data
            .room_to_chat
            .insert(mapping.room_id.0.clone(), chat.0);
        self.data.chat_to_room.insert(chat.0, mapping);
        self.persist();
    }

    pub fn remove(&mut self, chat: TgChatId) -> Option<ChatMapping> {
        let removed = self.data.chat_to_room.remove(&chat.0);
        if let Some(mapping) = &removed {
            self.data.room_to_chat.remove(&mapping.room_id.0);
            self.persist();
        }
        removed
    }

    pub fn space_ids(&self) -> SpaceIds {
        self.data.space_ids.clone()
    }

    pub fn set_space_ids(&mut self, ids: SpaceIds) {
        self.data.space_ids = ids;
        self.persist();
    }

    /// Persistence failures are logged, not propagated: the in-memory state
    /// stays authoritative for the rest of the process lifetime.
    fn persist(&self) {
        let payload = match serde_json::to_string_pretty(&self.data) {
            Ok(p) => p,
            Err(e) => {
                warn!("mapping serialization failed: {e}");
                return;
            }
        };
        if let Err(e) = write_atomic(&self.path, &payload) {
            warn!(path = %self.path.display(), "mapping write failed: {e}");
        }
    }
}

fn read_mapping(path: &Path) -> Result<MappingFile> {
    if !path.exists() {
        return Ok(MappingFile::default());
    }
    let txt = std::fs::read_to_string(path)?;
    if txt.trim().is_empty() {
        return Ok(MappingFile::default());
    }
    Ok(serde_json::from_str(&txt)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(room: &str, dept: &str) -> ChatMapping {
        ChatMapping {
            room_id: RoomId(room.to_string()),
            department_id: DepartmentId(dept.to_string()),
            tg_user_id: TgUserId(7),
            display_name: "Bob".to_string(),
        }
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("mcs-mapping-{name}-{}.json", std::process::id()))
    }

    #[test]
    fn survives_restart() {
        let path = temp_path("restart");
        let _ = std::fs::remove_file(&path);

        {
            let mut store = ChatRoomStore::load(&path);
            store.insert(TgChatId(42), mapping("!a:hs", "support"));
            let mut ids = SpaceIds::default();
            ids.root = Some(RoomId("!root:hs".to_string()));
            store.set_space_ids(ids);
        }

        let store = ChatRoomStore::load(&path);
        assert_eq!(store.get(TgChatId(42)).unwrap().room_id.0, "!a:hs");
        assert_eq!(
            store.chat_for_room(&RoomId("!a:hs".to_string())),
            Some(TgChatId(42))
        );
        assert_eq!(store.space_ids().root.unwrap().0, "!root:hs");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn replacing_a_mapping_retires_the_old_reverse_edge() {
        let path = temp_path("replace");
        let _ = std::fs::remove_file(&path);

        let mut store = ChatRoomStore::load(&path);
        store.insert(TgChatId(1), mapping("!old:hs", "support"));
        store.insert(TgChatId(1), mapping("!new:hs", "sales"));

        assert_eq!(store.chat_for_room(&RoomId("!old:hs".to_string())), None);
        assert_eq!(
            store.chat_for_room(&RoomId("!new:hs".to_string())),
            Some(TgChatId(1))
        );
        assert_eq!(store.watched_rooms(), vec![RoomId("!new:hs".to_string())]);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn corrupted_file_starts_empty() {
        let path = temp_path("corrupt");
        std::fs::write(&path, "not json {{{").unwrap();

        let store = ChatRoomStore::load(&path);
        assert!(store.get(TgChatId(1)).is_none());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn remove_is_a_no_op_for_unknown_chats() {
        let path = temp_path("remove");
        let _ = std::fs::remove_file(&path);

        let mut store = ChatRoomStore::load(&path);
        assert!(store.remove(TgChatId(9)).is_none());
        store.insert(TgChatId(9), mapping("!r:hs", "support"));
        assert!(store.remove(TgChatId(9)).is_some());
        assert!(store.watched_rooms().is_empty());

        let _ = std::fs::remove_file(&path);
    }
}
