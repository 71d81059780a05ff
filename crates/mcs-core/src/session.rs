//! Session store: the local, network-free record of which room each
//! department conversation lives in.
//!
//! One `Session` per end user. Every mutation is written through to a
//! primary backend with an optional fallback, and a corrupted backing store
//! self-heals to an empty session instead of failing reads.

use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    domain::{DepartmentId, RoomId},
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    /// The user is a member and this is the canonical room for the
    /// department.
    Active,
    /// The user stepped away (e.g. switched departments). The mapping is
    /// retained so the user can be re-invited into the same room.
    Left,
    /// The room is confirmed gone or inaccessible server-side. Terminal
    /// until cleanup purges the record.
    Invalid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipAction {
    Join,
    Leave,
}

/// Append-only membership log entry. Lets diagnostics distinguish "left by
/// switch" from "left by error".
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MembershipEvent {
    pub action: MembershipAction,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DepartmentRoomRecord {
    pub department_id: DepartmentId,
    pub room_id: Option<RoomId>,
    pub status: RoomStatus,
    pub last_activity: DateTime<Utc>,
    pub conversation_count: u32,
    pub membership_history: Vec<MembershipEvent>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub identity: String,
    pub department_history: Vec<DepartmentRoomRecord>,
    pub selected_department: Option<DepartmentId>,
    pub is_returning_user: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Session {
    fn new(identity: String) -> Self {
        let now = Utc::now();
        Self {
            identity,
            department_history: Vec::new(),
            selected_department: None,
            is_returning_user: false,
            created_at: now,
            last_activity: now,
        }
    }
}

/// Persistence medium for one session. Synchronous and local by contract.
pub trait SessionBackend: Send + Sync {
    fn load(&self) -> Result<Option<String>>;
    fn store(&self, payload: &str) -> Result<()>;
}

/// File-backed session storage. Writes go to a temp file first and are
/// renamed into place so a crash mid-write cannot leave a half-written
/// session behind.
pub struct FileSessionBackend {
    path: PathBuf,
}

impl FileSessionBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SessionBackend for FileSessionBackend {
    fn load(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let txt = std::fs::read_to_string(&self.path)?;
        if txt.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(txt))
    }

    fn store(&self, payload: &str) -> Result<()> {
        write_atomic(&self.path, payload)
    }
}

pub(crate) fn write_atomic(path: &Path, payload: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, payload)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// In-memory backend for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemorySessionBackend {
    cell: Mutex<Option<String>>,
}

impl MemorySessionBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_payload(payload: &str) -> Self {
        Self {
            cell: Mutex::new(Some(payload.to_string())),
        }
    }

    pub fn payload(&self) -> Option<String> {
        self.cell.lock().unwrap().clone()
    }
}

impl SessionBackend for MemorySessionBackend {
    fn load(&self) -> Result<Option<String>> {
        Ok(self.cell.lock().unwrap().clone())
    }

    fn store(&self, payload: &str) -> Result<()> {
        *self.cell.lock().unwrap() = Some(payload.to_string());
        Ok(())
    }
}

/// The session store. Owns the `Session` exclusively; all mutation goes
/// through this API and every mutation persists write-through.
pub struct SessionStore {
    primary: Box<dyn SessionBackend>,
    fallback: Option<Box<dyn SessionBackend>>,
    session: Session,
}

impl SessionStore {
    /// Open the store, loading from the primary backend, then the fallback.
    /// A corrupted or unreadable payload reinitializes to an empty session
    /// rather than failing.
    pub fn open(
        primary: Box<dyn SessionBackend>,
        fallback: Option<Box<dyn SessionBackend>>,
    ) -> Self {
        let loaded = load_session(primary.as_ref())
            .or_else(|| fallback.as_deref().and_then(load_session));

        let session = match loaded {
            Some(mut s) => {
                s.is_returning_user = true;
                s
            }
            None => Session::new(generate_identity()),
        };

        Self {
            primary,
            fallback,
            session,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn selected_department(&self) -> Option<&DepartmentId> {
        self.session.selected_department.as_ref()
    }

    pub fn select_department(&mut self, dept: &DepartmentId) {
        self.session.selected_department = Some(dept.clone());
        self.session.last_activity = Utc::now();
        self.persist();
    }

    /// Record the room for a department with the given status. Always
    /// appends a membership-history entry and refreshes `last_activity`.
    ///
    /// An existing record for the same department and room is transitioned
    /// in place, except that invalid records are terminal: setting a room
    /// that was invalidated starts a new record. Marking a record active
    /// demotes any other active record for the same department to left, so
    /// at most one record per department is ever active.
    pub fn set_department_room(
        &mut self,
        dept: &DepartmentId,
        room: &RoomId,
        status: RoomStatus,
        reason: &str,
    ) {
        let now = Utc::now();

        if status == RoomStatus::Active {
            for rec in self.session.department_history.iter_mut() {
                if rec.department_id == *dept
                    && rec.status == RoomStatus::Active
                    && rec.room_id.as_ref() != Some(room)
                {
                    rec.status = RoomStatus::Left;
                    rec.last_activity = now;
                    rec.membership_history.push(MembershipEvent {
                        action: MembershipAction::Leave,
                        reason: "superseded".to_string(),
                        at: now,
                    });
                }
            }
        }

        let action = match status {
            RoomStatus::Active => MembershipAction::Join,
            RoomStatus::Left | RoomStatus::Invalid => MembershipAction::Leave,
        };

        let existing = self.session.department_history.iter_mut().find(|r| {
            r.department_id == *dept
                && r.room_id.as_ref() == Some(room)
                && r.status != RoomStatus::Invalid
        });

        match existing {
            Some(rec) => {
                let entering_active = status == RoomStatus::Active && rec.status != RoomStatus::Active;
                rec.status = status;
                rec.last_activity = now;
                if entering_active {
                    rec.conversation_count += 1;
                }
                rec.membership_history.push(MembershipEvent {
                    action,
                    reason: reason.to_string(),
                    at: now,
                });
            }
            None => {
                self.session.department_history.push(DepartmentRoomRecord {
                    department_id: dept.clone(),
                    room_id: Some(room.clone()),
                    status,
                    last_activity: now,
                    conversation_count: u32::from(status == RoomStatus::Active),
                    membership_history: vec![MembershipEvent {
                        action,
                        reason: reason.to_string(),
                        at: now,
                    }],
                });
            }
        }

        self.session.last_activity = now;
        self.persist();
    }

    /// The current record for a department: the active record if one exists,
    /// else the most recently left one (the re-invitation memory). Invalid
    /// records are never returned.
    pub fn get_department_room(&self, dept: &DepartmentId) -> Option<&DepartmentRoomRecord> {
        let records = self
            .session
            .department_history
            .iter()
            .filter(|r| r.department_id == *dept);

        let mut latest_left: Option<&DepartmentRoomRecord> = None;
        for rec in records {
            match rec.status {
                RoomStatus::Active => return Some(rec),
                RoomStatus::Left => {
                    if latest_left
                        .map(|prev| rec.last_activity > prev.last_activity)
                        .unwrap_or(true)
                    {
                        latest_left = Some(rec);
                    }
                }
                RoomStatus::Invalid => {}
            }
        }
        latest_left
    }

    /// All departments with an active room.
    pub fn all_active_rooms(&self) -> Vec<(DepartmentId, RoomId)> {
        self.session
            .department_history
            .iter()
            .filter(|r| r.status == RoomStatus::Active)
            .filter_map(|r| r.room_id.clone().map(|room| (r.department_id.clone(), room)))
            .collect()
    }

    /// Refresh `last_activity` on the department's current record.
    pub fn touch(&mut self, dept: &DepartmentId) {
        let now = Utc::now();
        if let Some(rec) = self
            .session
            .department_history
            .iter_mut()
            .find(|r| r.department_id == *dept && r.status == RoomStatus::Active)
        {
            rec.last_activity = now;
        }
        self.session.last_activity = now;
        self.persist();
    }

    /// Drop all records for a department. No-op if none exist.
    pub fn clear_department_room(&mut self, dept: &DepartmentId) {
        let before = self.session.department_history.len();
        self.session
            .department_history
            .retain(|r| r.department_id != *dept);
        if self.session.department_history.len() != before {
            self.session.last_activity = Utc::now();
            self.persist();
        }
    }

    /// Purge invalid records older than `max_age_days`. Left and active
    /// records are never removed by age: a left record is the memory that
    /// prevents duplicate-room creation on return.
    pub fn cleanup_invalid_rooms(&mut self, max_age_days: i64) -> usize {
        let cutoff = Utc::now() - Duration::days(max_age_days);
        let before = self.session.department_history.len();
        self.session
            .department_history
            .retain(|r| !(r.status == RoomStatus::Invalid && r.last_activity < cutoff));
        let removed = before - self.session.department_history.len();
        if removed > 0 {
            self.persist();
        }
        removed
    }

    /// Write-through persistence. Backend failures are logged, not
    /// propagated: losing a write loses resilience, not correctness, and the
    /// conversation must not die over it.
    fn persist(&self) {
        let payload = match serde_json::to_string(&self.session) {
            Ok(p) => p,
            Err(e) => {
                warn!("failed to serialize session: {e}");
                return;
            }
        };

        match self.primary.store(&payload) {
            Ok(()) => {}
            Err(e) => {
                warn!("primary session store failed: {e}");
                if let Some(fb) = &self.fallback {
                    if let Err(e) = fb.store(&payload) {
                        warn!("fallback session store failed: {e}");
                    }
                }
                return;
            }
        }

        if let Some(fb) = &self.fallback {
            if let Err(e) = fb.store(&payload) {
                warn!("fallback session store failed: {e}");
            }
        }
    }
}

fn load_session(backend: &dyn SessionBackend) -> Option<Session> {
    let payload = match backend.load() {
        Ok(Some(p)) => p,
        Ok(None) => return None,
        Err(e) => {
            warn!("session backend unreadable, starting fresh: {e}");
            return None;
        }
    };
    match serde_json::from_str::<Session>(&payload) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!("session payload corrupted, starting fresh: {e}");
            None
        }
    }
}

fn generate_identity() -> String {
    format!(
        "visitor-{}-{:x}",
        Utc::now().timestamp_millis(),
        std::process::id()
    )
}
