//! Conversation client: the connection/reconciliation engine for the web
//! surface.
//!
//! Per department the client runs an explicit state machine
//! (`disconnected -> connecting -> active <-> validating -> active |
//! recovering -> active | failed`). Every outbound message is gated on
//! validating that the locally-cached current room is still the room the
//! session store holds for the selected department; disagreement blocks the
//! send until one recovery pass resolves it. This is what prevents a message
//! for department B landing in department A's room after rapid switching.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    backend::{CreateRoomRequest, MatrixBackend, PowerLevels, RoomKind, ADMIN_LEVEL},
    config::{Config, Department},
    domain::{DepartmentId, EventId, MatrixUserId, RoomId},
    errors::Error,
    session::{FileSessionBackend, RoomStatus, SessionStore},
    spaces::{ChannelSurface, SpaceManager},
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Active,
    Validating,
    Recovering,
    Failed,
}

/// Details the user entered in the contact form, used for room naming.
#[derive(Clone, Debug, Default)]
pub struct UserDetails {
    pub display_name: String,
    pub email: Option<String>,
}

pub struct ConversationClient {
    cfg: Arc<Config>,
    backend: Arc<dyn MatrixBackend>,
    /// Second identity that is invited into every created room and never
    /// leaves it. Rooms are invite-only, so after a department-switch leave
    /// the user's own token has no way back in; the service identity is the
    /// member that re-invites it. Callers without a separate service token
    /// pass the same backend twice (re-entry then degrades to invalidation).
    service: Arc<dyn MatrixBackend>,
    spaces: Arc<SpaceManager>,
    state: Mutex<ClientState>,
}

struct ClientState {
    store: SessionStore,
    phase: ConnectionPhase,
    current_room: Option<RoomId>,
    me: Option<MatrixUserId>,
    service_user: Option<MatrixUserId>,
}

impl ConversationClient {
    /// Build the client on the configured file-backed session store.
    pub fn from_config(
        cfg: Arc<Config>,
        backend: Arc<dyn MatrixBackend>,
        service: Arc<dyn MatrixBackend>,
        spaces: Arc<SpaceManager>,
    ) -> Self {
        let store = SessionStore::open(
            Box::new(FileSessionBackend::new(&cfg.session_file)),
            Some(Box::new(FileSessionBackend::new(&cfg.session_fallback_file))),
        );
        Self::new(cfg, backend, service, spaces, store)
    }

    pub fn new(
        cfg: Arc<Config>,
        backend: Arc<dyn MatrixBackend>,
        service: Arc<dyn MatrixBackend>,
        spaces: Arc<SpaceManager>,
        mut store: SessionStore,
    ) -> Self {
        store.cleanup_invalid_rooms(cfg.invalid_room_retention_days);
        Self {
            cfg,
            backend,
            service,
            spaces,
            state: Mutex::new(ClientState {
                store,
                phase: ConnectionPhase::Disconnected,
                current_room: None,
                me: None,
                service_user: None,
            }),
        }
    }

    pub async fn phase(&self) -> ConnectionPhase {
        self.state.lock().await.phase
    }

    pub async fn current_room(&self) -> Option<RoomId> {
        self.state.lock().await.current_room.clone()
    }

    /// Record the department the UI has selected without connecting. The
    /// next send is gated against this selection.
    pub async fn select_department(&self, dept: &DepartmentId) {
        self.state.lock().await.store.select_department(dept);
    }

    /// Connect to a department: reuse the validated remembered room, recover
    /// into it if membership was lost, or create a fresh room when nothing
    /// usable remains.
    pub async fn connect(
        &self,
        user: Option<&UserDetails>,
        dept_id: &DepartmentId,
    ) -> Result<RoomId> {
        let dept = self
            .cfg
            .department(dept_id)
            .cloned()
            .ok_or_else(|| Error::Config(format!("unknown department: {dept_id}")))?;

        let mut st = self.state.lock().await;
        st.phase = ConnectionPhase::Connecting;
        st.store.select_department(dept_id);

        let remembered = st
            .store
            .get_department_room(dept_id)
            .and_then(|r| r.room_id.clone().map(|room| (room, r.status)));

        if let Some((room, status)) = remembered {
            st.phase = ConnectionPhase::Validating;
            match self.try_reuse(&mut st, &room).await {
                Ok(true) => {
                    if status == RoomStatus::Left {
                        st.store
                            .set_department_room(dept_id, &room, RoomStatus::Active, "reentry");
                        info!(department = %dept_id, room = %room, "re-entered remembered room");
                    } else {
                        st.store.touch(dept_id);
                    }
                    st.current_room = Some(room.clone());
                    st.phase = ConnectionPhase::Active;
                    return Ok(room);
                }
                Ok(false) => {
                    warn!(department = %dept_id, room = %room, "remembered room unrecoverable, creating fresh");
                    st.store
                        .set_department_room(dept_id, &room, RoomStatus::Invalid, "unrecoverable");
                }
                Err(e) => {
                    st.phase = ConnectionPhase::Failed;
                    return Err(e);
                }
            }
        }

        match self.create_department_room(&mut st, user, &dept).await {
            Ok(room) => {
                st.store
                    .set_department_room(dept_id, &room, RoomStatus::Active, "created");
                st.current_room = Some(room.clone());
                st.phase = ConnectionPhase::Active;
                Ok(room)
            }
            Err(e) => {
                st.phase = ConnectionPhase::Failed;
                Err(e)
            }
        }
    }

    /// Without an id this is a no-op with respect to room membership. With a
    /// preserved department every *other* active department transitions to
    /// left (the mapping is retained, not deleted) and the underlying room
    /// is left server-side best-effort — failures are logged and do not
    /// block the rest of the cleanup.
    pub async fn disconnect(&self, preserve: Option<&DepartmentId>) -> Result<()> {
        let Some(preserve) = preserve else {
            return Ok(());
        };

        let mut st = self.state.lock().await;
        let others: Vec<_> = st
            .store
            .all_active_rooms()
            .into_iter()
            .filter(|(dept, _)| dept != preserve)
            .collect();

        for (dept, room) in others {
            if let Err(e) = self.backend.leave(&room).await {
                warn!(department = %dept, room = %room, "leave failed during department switch: {e}");
            }
            st.store
                .set_department_room(&dept, &room, RoomStatus::Left, "switched-department");
            if st.current_room.as_ref() == Some(&room) {
                st.current_room = None;
            }
        }

        // Re-point the cursor at the preserved department's room if it has
        // one.
        if st.current_room.is_none() {
            st.current_room = st
                .store
                .get_department_room(preserve)
                .filter(|r| r.status == RoomStatus::Active)
                .and_then(|r| r.room_id.clone());
        }

        Ok(())
    }

    /// Validate that the current room agrees with the department's stored
    /// room, recovering once on disagreement. Returns false only when they
    /// disagree *and* recovery (re-invite + re-verify) fails.
    pub async fn validate_and_recover_room_state(&self, dept: &DepartmentId) -> Result<bool> {
        let mut st = self.state.lock().await;
        self.validate_and_recover(&mut st, dept).await
    }

    /// Gated send: re-validates the current room against the selected
    /// department, attempts one recovery pass, and fails with a
    /// distinguishable error rather than delivering into the wrong room.
    pub async fn send_message(&self, text: &str) -> Result<EventId> {
        let mut st = self.state.lock().await;
        let dept = st
            .store
            .selected_department()
            .cloned()
            .ok_or_else(|| Error::External("no department selected".to_string()))?;

        st.phase = ConnectionPhase::Validating;
        let valid = self.validate_and_recover(&mut st, &dept).await?;
        if !valid {
            st.phase = ConnectionPhase::Failed;
            let expected = st
                .store
                .get_department_room(&dept)
                .and_then(|r| r.room_id.clone());
            return Err(Error::RoomMismatch {
                department: dept.0.clone(),
                expected: expected.map(|r| r.0),
                current: st.current_room.clone().map(|r| r.0),
            });
        }
        st.phase = ConnectionPhase::Active;

        let room = st.current_room.clone().ok_or_else(|| Error::RoomMismatch {
            department: dept.0.clone(),
            expected: None,
            current: None,
        })?;

        let event = self.backend.send_text(&room, text).await?;
        st.store.touch(&dept);
        Ok(event)
    }

    async fn me(&self, st: &mut ClientState) -> Result<MatrixUserId> {
        if let Some(me) = &st.me {
            return Ok(me.clone());
        }
        let me = self.backend.whoami().await?;
        st.me = Some(me.clone());
        Ok(me)
    }

    async fn service_user(&self, st: &mut ClientState) -> Result<MatrixUserId> {
        if let Some(user) = &st.service_user {
            return Ok(user.clone());
        }
        let user = self.service.whoami().await?;
        st.service_user = Some(user.clone());
        Ok(user)
    }

    /// Check membership in the remembered room, re-entering it if the
    /// membership was lost. Reads and invites go through the service
    /// identity, which stayed a member after any leave the user's own token
    /// performed. `Ok(false)` means the room is gone or inaccessible;
    /// transient failures propagate so the caller can retry.
    async fn try_reuse(&self, st: &mut ClientState, room: &RoomId) -> Result<bool> {
        let me = self.me(st).await?;

        match self.service.joined_members(room).await {
            Ok(members) if members.contains(&me) => return Ok(true),
            Ok(_) => {}
            Err(e) if e.invalidates_room() => return Ok(false),
            Err(e) => return Err(e),
        }

        st.phase = ConnectionPhase::Recovering;

        // Re-entry into an invite-only room needs a fresh invite from a
        // current member; the join with the user's own token is what must
        // succeed.
        if let Err(e) = self.service.invite(room, &me).await {
            if !e.invalidates_room() {
                warn!(room = %room, "re-invite failed, attempting join anyway: {e}");
            }
        }
        match self.backend.join(room).await {
            Ok(()) => {}
            Err(e) if e.invalidates_room() => return Ok(false),
            Err(e) => return Err(e),
        }

        // Re-verify: the join call succeeding is not trusted on its own.
        match self.service.joined_members(room).await {
            Ok(members) => Ok(members.contains(&me)),
            Err(e) if e.invalidates_room() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_department_room(
        &self,
        st: &mut ClientState,
        user: Option<&UserDetails>,
        dept: &Department,
    ) -> Result<RoomId> {
        let me = self.me(st).await?;
        let service_user = self.service_user(st).await?;

        // Container assignment is best-effort: a failed space never blocks
        // the conversation itself.
        let space = match self
            .spaces
            .ensure_department_space(ChannelSurface::Web, dept)
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(department = %dept.id, "space unavailable, creating room without container: {e}");
                None
            }
        };

        let mut invites: Vec<MatrixUserId> = dept
            .recipients
            .iter()
            .filter(|r| **r != me)
            .cloned()
            .collect();
        if service_user != me && !invites.contains(&service_user) {
            invites.push(service_user.clone());
        }
        let observer = self.cfg.enabled_observer().cloned();
        if let Some(obs) = &observer {
            if !invites.contains(obs) && *obs != me {
                invites.push(obs.clone());
            }
        }

        let power_levels = observer.as_ref().map(|obs| {
            let mut levels = PowerLevels::observer_lockdown(&me, &dept.recipients, obs);
            if service_user != me {
                levels.users.insert(service_user.0.clone(), ADMIN_LEVEL);
            }
            levels
        });

        let display = user
            .map(|u| u.display_name.as_str())
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(st.store.session().identity.as_str())
            .to_string();

        let room = self
            .backend
            .create_room(CreateRoomRequest {
                name: format!("{display} ({}) - {}", ChannelSurface::Web.label(), dept.name),
                topic: Some(
                    dept.description
                        .clone()
                        .unwrap_or_else(|| format!("Support conversation - {}", dept.name)),
                ),
                kind: RoomKind::Chat,
                invites,
                power_levels,
            })
            .await?;
        info!(department = %dept.id, room = %room, "created department room");

        if let Some(space) = space {
            self.spaces.attach_room(&space, &room).await;
        }

        Ok(room)
    }

    async fn validate_and_recover(
        &self,
        st: &mut ClientState,
        dept: &DepartmentId,
    ) -> Result<bool> {
        let expected = st
            .store
            .get_department_room(dept)
            .filter(|r| r.status == RoomStatus::Active)
            .and_then(|r| r.room_id.clone());

        let Some(expected) = expected else {
            return Ok(false);
        };

        if st.current_room.as_ref() == Some(&expected) {
            return Ok(true);
        }

        // The in-memory pointer disagrees with the store: treat as
        // corruption and recover into the store's room.
        warn!(
            department = %dept,
            expected = %expected,
            current = ?st.current_room,
            "current room disagrees with stored record, recovering"
        );
        st.phase = ConnectionPhase::Recovering;
        let recovered = self.try_reuse(st, &expected).await?;
        if !recovered {
            st.store
                .set_department_room(dept, &expected, RoomStatus::Invalid, "recovery failed");
            return Ok(false);
        }

        // The selection may have moved while recovery awaited; only mutate
        // the pointer if this department is still the one selected.
        if st.store.selected_department() != Some(dept) {
            return Ok(false);
        }
        st.current_room = Some(expected);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SyncBatch;
    use crate::config::{Observer, SpaceNaming};
    use crate::session::{MemorySessionBackend, SessionStore};
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    const ME: &str = "@visitor:localhost";
    const SERVICE: &str = "@service:localhost";

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Membership {
        Invited,
        Joined,
    }

    type Rooms = Arc<StdMutex<HashMap<String, HashMap<String, Membership>>>>;

    struct FakeBackend {
        identity: String,
        rooms: Rooms,
        room_seq: Arc<AtomicUsize>,
        created: StdMutex<Vec<CreateRoomRequest>>,
        leaves: StdMutex<Vec<String>>,
        invites: StdMutex<Vec<(String, String)>>,
        fail_joins: StdMutex<HashSet<String>>,
        /// Enforce invite-only room rules (non-members cannot read, invite,
        /// or join) instead of letting every call through.
        strict: bool,
    }

    impl FakeBackend {
        fn new() -> Self {
            Self::with_identity(ME, false, Arc::default(), Arc::default())
        }

        fn with_identity(identity: &str, strict: bool, rooms: Rooms, seq: Arc<AtomicUsize>) -> Self {
            Self {
                identity: identity.to_string(),
                rooms,
                room_seq: seq,
                created: StdMutex::new(vec![]),
                leaves: StdMutex::new(vec![]),
                invites: StdMutex::new(vec![]),
                fail_joins: StdMutex::new(HashSet::new()),
                strict,
            }
        }

        /// The user token and a service token sharing one strict homeserver.
        fn service_pair() -> (Arc<FakeBackend>, Arc<FakeBackend>) {
            let rooms: Rooms = Arc::default();
            let seq = Arc::new(AtomicUsize::new(0));
            (
                Arc::new(Self::with_identity(ME, true, rooms.clone(), seq.clone())),
                Arc::new(Self::with_identity(SERVICE, true, rooms, seq)),
            )
        }

        fn drop_member(&self, room: &str, user: &str) {
            if let Some(members) = self.rooms.lock().unwrap().get_mut(room) {
                members.remove(user);
            }
        }

        fn delete_room(&self, room: &str) {
            self.rooms.lock().unwrap().remove(room);
        }

        fn fail_join(&self, room: &str) {
            self.fail_joins.lock().unwrap().insert(room.to_string());
        }

        fn created_count(&self) -> usize {
            self.created.lock().unwrap().len()
        }

        fn is_joined(&self, members: &HashMap<String, Membership>) -> bool {
            members.get(&self.identity) == Some(&Membership::Joined)
        }
    }

    #[async_trait]
    impl MatrixBackend for FakeBackend {
        async fn whoami(&self) -> Result<MatrixUserId> {
            Ok(MatrixUserId(self.identity.clone()))
        }

        async fn create_room(&self, req: CreateRoomRequest) -> Result<RoomId> {
            let n = self.room_seq.fetch_add(1, Ordering::SeqCst);
            let id = match req.kind {
                RoomKind::Space => format!("!space{n}:localhost"),
                RoomKind::Chat => format!("!room{n}:localhost"),
            };
            let mut members = HashMap::new();
            members.insert(self.identity.clone(), Membership::Joined);
            for invitee in &req.invites {
                members.insert(invitee.0.clone(), Membership::Joined);
            }
            self.rooms.lock().unwrap().insert(id.clone(), members);
            self.created.lock().unwrap().push(req);
            Ok(RoomId(id))
        }

        async fn invite(&self, room: &RoomId, user: &MatrixUserId) -> Result<()> {
            let mut rooms = self.rooms.lock().unwrap();
            let Some(members) = rooms.get_mut(&room.0) else {
                return Err(Error::NotFound {
                    op: "invite",
                    detail: room.0.clone(),
                });
            };
            if self.strict && members.get(&self.identity) != Some(&Membership::Joined) {
                return Err(Error::Forbidden {
                    op: "invite",
                    detail: "M_FORBIDDEN".to_string(),
                });
            }
            members.entry(user.0.clone()).or_insert(Membership::Invited);
            self.invites
                .lock()
                .unwrap()
                .push((room.0.clone(), user.0.clone()));
            Ok(())
        }

        async fn join(&self, room: &RoomId) -> Result<()> {
            if self.fail_joins.lock().unwrap().contains(&room.0) {
                return Err(Error::Forbidden {
                    op: "join",
                    detail: "M_FORBIDDEN".to_string(),
                });
            }
            let mut rooms = self.rooms.lock().unwrap();
            let Some(members) = rooms.get_mut(&room.0) else {
                return Err(Error::NotFound {
                    op: "join",
                    detail: room.0.clone(),
                });
            };
            if self.strict && !members.contains_key(&self.identity) {
                return Err(Error::Forbidden {
                    op: "join",
                    detail: "M_FORBIDDEN".to_string(),
                });
            }
            members.insert(self.identity.clone(), Membership::Joined);
            Ok(())
        }

        async fn leave(&self, room: &RoomId) -> Result<()> {
            self.leaves.lock().unwrap().push(room.0.clone());
            self.drop_member(&room.0, &self.identity);
            Ok(())
        }

        async fn joined_members(&self, room: &RoomId) -> Result<Vec<MatrixUserId>> {
            let rooms = self.rooms.lock().unwrap();
            let Some(members) = rooms.get(&room.0) else {
                return Err(Error::NotFound {
                    op: "joined_members",
                    detail: room.0.clone(),
                });
            };
            if self.strict && !self.is_joined(members) {
                return Err(Error::Forbidden {
                    op: "joined_members",
                    detail: "M_FORBIDDEN".to_string(),
                });
            }
            Ok(members
                .iter()
                .filter(|(_, m)| **m == Membership::Joined)
                .map(|(u, _)| MatrixUserId(u.clone()))
                .collect())
        }

        async fn send_text(&self, room: &RoomId, _body: &str) -> Result<EventId> {
            if !self.rooms.lock().unwrap().contains_key(&room.0) {
                return Err(Error::NotFound {
                    op: "send_text",
                    detail: room.0.clone(),
                });
            }
            Ok(EventId(format!("$ev-{}", room.0)))
        }

        async fn send_notice(&self, room: &RoomId, body: &str) -> Result<EventId> {
            self.send_text(room, body).await
        }

        async fn power_levels(&self, _room: &RoomId) -> Result<PowerLevels> {
            Ok(PowerLevels::default())
        }

        async fn set_power_levels(&self, _room: &RoomId, _levels: &PowerLevels) -> Result<()> {
            Ok(())
        }

        async fn set_space_child(&self, _parent: &RoomId, _child: &RoomId) -> Result<()> {
            Ok(())
        }

        async fn set_space_parent(&self, _child: &RoomId, _parent: &RoomId) -> Result<()> {
            Ok(())
        }

        async fn sync_since(&self, _since: Option<&str>, _timeout: Duration) -> Result<SyncBatch> {
            Ok(SyncBatch {
                next_batch: "s0".to_string(),
                events: vec![],
            })
        }
    }

    fn dept_cfg(id: &str) -> Department {
        Department {
            id: DepartmentId(id.to_string()),
            name: format!("{id} team"),
            icon: None,
            description: None,
            recipients: vec![
                MatrixUserId("@admin:localhost".to_string()),
                MatrixUserId("@support:localhost".to_string()),
            ],
            telegram_command: None,
        }
    }

    fn test_config(observer: Option<Observer>) -> Arc<Config> {
        Arc::new(Config {
            homeserver_url: "http://localhost:8008".to_string(),
            access_token: "tok".to_string(),
            telegram_bot_token: "bot".to_string(),
            departments: vec![dept_cfg("support"), dept_cfg("sales")],
            observer,
            spaces: SpaceNaming::default(),
            system_senders: vec![],
            poll_interval: Duration::from_millis(10),
            poll_timeout: Duration::from_millis(100),
            mapping_file: PathBuf::from("/tmp/unused.json"),
            session_file: PathBuf::from("/tmp/unused-session.json"),
            session_fallback_file: PathBuf::from("/tmp/unused-session.bak.json"),
            invalid_room_retention_days: 7,
        })
    }

    fn client(cfg: Arc<Config>, backend: Arc<FakeBackend>) -> ConversationClient {
        let spaces = Arc::new(SpaceManager::new(backend.clone(), cfg.spaces.clone()));
        let store = SessionStore::open(Box::new(MemorySessionBackend::new()), None);
        ConversationClient::new(cfg, backend.clone(), backend, spaces, store)
    }

    fn dept(id: &str) -> DepartmentId {
        DepartmentId(id.to_string())
    }

    #[tokio::test]
    async fn connect_creates_room_with_recipients_and_observer() {
        let backend = Arc::new(FakeBackend::new());
        let cfg = test_config(Some(Observer {
            user_id: MatrixUserId("@observer:localhost".to_string()),
            enabled: true,
        }));
        let client = client(cfg, backend.clone());

        let room = client
            .connect(
                Some(&UserDetails {
                    display_name: "Alice".to_string(),
                    email: None,
                }),
                &dept("support"),
            )
            .await
            .unwrap();

        assert_eq!(client.phase().await, ConnectionPhase::Active);
        assert_eq!(client.current_room().await, Some(room));

        let created = backend.created.lock().unwrap().clone();
        let chat = created
            .iter()
            .find(|r| r.kind == RoomKind::Chat)
            .expect("a chat room was created");
        assert!(chat.name.starts_with("Alice (Web Chat) - "));
        let invited: Vec<_> = chat.invites.iter().map(|u| u.0.as_str()).collect();
        assert!(invited.contains(&"@admin:localhost"));
        assert!(invited.contains(&"@support:localhost"));
        assert!(invited.contains(&"@observer:localhost"));

        // The lockdown rides in the creation request itself, with the
        // creator pinned so it keeps invite and state rights.
        let levels = chat.power_levels.as_ref().unwrap();
        assert!(!levels.can_post(&MatrixUserId("@observer:localhost".to_string())));
        assert!(levels.can_post(&MatrixUserId("@admin:localhost".to_string())));
        assert_eq!(levels.users.get(ME), Some(&ADMIN_LEVEL));
    }

    #[tokio::test]
    async fn connect_reuses_valid_active_room() {
        let backend = Arc::new(FakeBackend::new());
        let cfg = test_config(None);
        let client = client(cfg, backend.clone());

        let first = client.connect(None, &dept("support")).await.unwrap();
        let creates = backend.created_count();
        let second = client.connect(None, &dept("support")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(backend.created_count(), creates);
    }

    #[tokio::test]
    async fn connect_recovers_membership_in_remembered_room() {
        let backend = Arc::new(FakeBackend::new());
        let cfg = test_config(None);
        let client = client(cfg, backend.clone());

        let room = client.connect(None, &dept("support")).await.unwrap();
        backend.drop_member(&room.0, ME);

        let creates = backend.created_count();
        let reconnected = client.connect(None, &dept("support")).await.unwrap();
        assert_eq!(room, reconnected);
        assert_eq!(backend.created_count(), creates);
    }

    #[tokio::test]
    async fn connect_replaces_deleted_room_and_invalidates_record() {
        let backend = Arc::new(FakeBackend::new());
        let cfg = test_config(None);
        let client = client(cfg, backend.clone());

        let old = client.connect(None, &dept("support")).await.unwrap();
        backend.delete_room(&old.0);

        let fresh = client.connect(None, &dept("support")).await.unwrap();
        assert_ne!(old, fresh);
        assert_eq!(client.current_room().await, Some(fresh));
    }

    #[tokio::test]
    async fn disconnect_without_id_is_a_membership_no_op() {
        let backend = Arc::new(FakeBackend::new());
        let cfg = test_config(None);
        let client = client(cfg, backend.clone());

        client.connect(None, &dept("support")).await.unwrap();
        client.disconnect(None).await.unwrap();
        assert!(backend.leaves.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn disconnect_preserving_one_department_leaves_the_others() {
        let backend = Arc::new(FakeBackend::new());
        let cfg = test_config(None);
        let client = client(cfg, backend.clone());

        let room_a = client.connect(None, &dept("support")).await.unwrap();
        let room_b = client.connect(None, &dept("sales")).await.unwrap();

        client.disconnect(Some(&dept("support"))).await.unwrap();

        // B's room was left server-side, but the mapping is retained.
        assert_eq!(backend.leaves.lock().unwrap().clone(), vec![room_b.0.clone()]);
        assert_eq!(client.current_room().await, Some(room_a.clone()));

        // Reconnecting to B reuses the remembered room instead of creating a
        // duplicate.
        let creates = backend.created_count();
        let back = client.connect(None, &dept("sales")).await.unwrap();
        assert_eq!(back, room_b);
        assert_eq!(backend.created_count(), creates);
    }

    #[tokio::test]
    async fn reentry_after_switch_is_reinvited_by_service_identity() {
        let (user, service) = FakeBackend::service_pair();
        let cfg = test_config(None);
        let spaces = Arc::new(SpaceManager::new(user.clone(), cfg.spaces.clone()));
        let store = SessionStore::open(Box::new(MemorySessionBackend::new()), None);
        let client = ConversationClient::new(cfg, user.clone(), service.clone(), spaces, store);

        let room_b = client.connect(None, &dept("sales")).await.unwrap();
        client.connect(None, &dept("support")).await.unwrap();
        client.disconnect(Some(&dept("support"))).await.unwrap();
        assert_eq!(user.leaves.lock().unwrap().clone(), vec![room_b.0.clone()]);

        // The leave was real: the user's own token can no longer read or
        // rejoin the invite-only room on its own.
        let creates = user.created_count();
        let back = client.connect(None, &dept("sales")).await.unwrap();
        assert_eq!(back, room_b);
        assert_eq!(user.created_count(), creates);

        let invites = service.invites.lock().unwrap().clone();
        assert!(invites.contains(&(room_b.0.clone(), ME.to_string())));
    }

    #[tokio::test]
    async fn send_recovers_when_pointer_lags_selection() {
        let backend = Arc::new(FakeBackend::new());
        let cfg = test_config(None);
        let client = client(cfg, backend.clone());

        let room_a = client.connect(None, &dept("support")).await.unwrap();
        let _room_b = client.connect(None, &dept("sales")).await.unwrap();

        // Selection moves back to support without a connect; the pointer
        // still references sales.
        client.select_department(&dept("support")).await;

        let ev = client.send_message("hello").await.unwrap();
        assert_eq!(ev.0, format!("$ev-{}", room_a.0));
        assert_eq!(client.current_room().await, Some(room_a));
    }

    #[tokio::test]
    async fn send_fails_fast_when_recovery_fails() {
        let backend = Arc::new(FakeBackend::new());
        let cfg = test_config(None);
        let client = client(cfg, backend.clone());

        let room_a = client.connect(None, &dept("support")).await.unwrap();
        client.connect(None, &dept("sales")).await.unwrap();
        client.select_department(&dept("support")).await;

        // Recovery into support's room cannot succeed.
        backend.drop_member(&room_a.0, ME);
        backend.fail_join(&room_a.0);

        let err = client.send_message("hello").await.unwrap_err();
        assert!(matches!(err, Error::RoomMismatch { .. }));
        assert_eq!(client.phase().await, ConnectionPhase::Failed);
    }

    #[tokio::test]
    async fn send_without_selection_is_rejected() {
        let backend = Arc::new(FakeBackend::new());
        let cfg = test_config(None);
        let client = client(cfg, backend);

        let err = client.send_message("hello").await.unwrap_err();
        assert!(matches!(err, Error::External(_)));
    }
}
