//! Space hierarchy manager: the root > channel > department container tree.
//!
//! All `ensure_*` calls are idempotent via a cached id tree guarded by one
//! lock held across check-then-create, and every
//! relationship is asserted on both sides (`m.space.child` on the parent,
//! `m.space.parent` on the child). `repair_hierarchy` re-walks the known
//! tree and re-asserts every edge, so a one-sided link heals on the next
//! pass.

use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    backend::{CreateRoomRequest, MatrixBackend},
    config::{Department, SpaceNaming},
    domain::RoomId,
    Result,
};

/// A communication surface. Not to be confused with a department: the tree
/// is root > surface > department, so web and Telegram conversations for the
/// same department live in separate containers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelSurface {
    Web,
    Telegram,
}

impl ChannelSurface {
    pub fn label(&self) -> &'static str {
        match self {
            ChannelSurface::Web => "Web Chat",
            ChannelSurface::Telegram => "Telegram",
        }
    }

    fn key(&self) -> &'static str {
        match self {
            ChannelSurface::Web => "web",
            ChannelSurface::Telegram => "telegram",
        }
    }
}

/// The cached container ids. Serializable so the bridge can persist them
/// alongside its chat mapping and survive restarts without re-creating
/// spaces.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SpaceIds {
    pub root: Option<RoomId>,
    /// Keyed by surface (`web` / `telegram`).
    #[serde(default)]
    pub channels: HashMap<String, RoomId>,
    /// Keyed by `{surface}/{department}`.
    #[serde(default)]
    pub departments: HashMap<String, RoomId>,
}

impl SpaceIds {
    /// Every parent/child edge derivable from the cached ids.
    fn edges(&self) -> Vec<(RoomId, RoomId)> {
        let mut edges = Vec::new();
        if let Some(root) = &self.root {
            for (_, channel) in self.channels.iter() {
                edges.push((root.clone(), channel.clone()));
            }
        }
        for (key, dept_space) in self.departments.iter() {
            let Some((surface, _)) = key.split_once('/') else {
                continue;
            };
            if let Some(channel) = self.channels.get(surface) {
                edges.push((channel.clone(), dept_space.clone()));
            }
        }
        edges
    }
}

pub struct SpaceManager {
    backend: Arc<dyn MatrixBackend>,
    naming: SpaceNaming,
    ids: Mutex<SpaceIds>,
}

impl SpaceManager {
    pub fn new(backend: Arc<dyn MatrixBackend>, naming: SpaceNaming) -> Self {
        Self {
            backend,
            naming,
            ids: Mutex::new(SpaceIds::default()),
        }
    }

    /// Seed the cache from persisted state (bridge startup).
    pub async fn seed(&self, ids: SpaceIds) {
        *self.ids.lock().await = ids;
    }

    pub async fn snapshot(&self) -> SpaceIds {
        self.ids.lock().await.clone()
    }

    pub async fn ensure_root_space(&self) -> Result<RoomId> {
        let mut ids = self.ids.lock().await;
        self.root_space(&mut ids).await
    }

    pub async fn ensure_channel_space(&self, surface: ChannelSurface) -> Result<RoomId> {
        let mut ids = self.ids.lock().await;
        self.channel_space(&mut ids, surface).await
    }

    /// Resolve the container a new room for this department should live in,
    /// creating any missing part of the tree.
    pub async fn ensure_department_space(
        &self,
        surface: ChannelSurface,
        dept: &Department,
    ) -> Result<RoomId> {
        // One lock across the whole check-then-create: two chats selecting
        // the same department concurrently must not each build the tree.
        let mut ids = self.ids.lock().await;
        let key = format!("{}/{}", surface.key(), dept.id);
        if let Some(id) = ids.departments.get(&key).cloned() {
            return Ok(id);
        }

        let channel = self.channel_space(&mut ids, surface).await?;
        let name = render(&self.naming.department_template, surface.label(), Some(&dept.name));
        let id = self
            .backend
            .create_room(CreateRoomRequest::space(
                name,
                dept.description.clone(),
            ))
            .await?;
        info!(space = %id, department = %dept.id, "created department space");

        self.link(&channel, &id).await;

        ids.departments.insert(key, id.clone());
        Ok(id)
    }

    async fn root_space(&self, ids: &mut SpaceIds) -> Result<RoomId> {
        if let Some(id) = ids.root.clone() {
            return Ok(id);
        }

        let id = self
            .backend
            .create_room(CreateRoomRequest::space(
                self.naming.root_name.clone(),
                Some("Support conversations".to_string()),
            ))
            .await?;
        info!(space = %id, "created root space");

        ids.root = Some(id.clone());
        Ok(id)
    }

    async fn channel_space(&self, ids: &mut SpaceIds, surface: ChannelSurface) -> Result<RoomId> {
        if let Some(id) = ids.channels.get(surface.key()).cloned() {
            return Ok(id);
        }

        let root = self.root_space(ids).await?;
        let name = render(&self.naming.channel_template, surface.label(), None);
        let id = self
            .backend
            .create_room(CreateRoomRequest::space(
                name,
                Some(format!("{} conversations", surface.label())),
            ))
            .await?;
        info!(space = %id, surface = surface.key(), "created channel space");

        self.link(&root, &id).await;

        ids.channels.insert(surface.key().to_string(), id.clone());
        Ok(id)
    }

    /// Put a conversation room under its department container.
    pub async fn attach_room(&self, space: &RoomId, room: &RoomId) {
        self.link(space, room).await;
    }

    /// Re-assert every known parent/child edge on both sides. Individual
    /// link failures are logged and skipped; returns the number of edges
    /// fully asserted.
    pub async fn repair_hierarchy(&self) -> usize {
        let edges = self.ids.lock().await.edges();
        let mut repaired = 0usize;
        for (parent, child) in edges {
            let mut ok = true;
            if let Err(e) = self.backend.set_space_child(&parent, &child).await {
                warn!(parent = %parent, child = %child, "failed to assert child link: {e}");
                ok = false;
            }
            if let Err(e) = self.backend.set_space_parent(&child, &parent).await {
                warn!(parent = %parent, child = %child, "failed to assert parent link: {e}");
                ok = false;
            }
            if ok {
                repaired += 1;
            }
        }
        repaired
    }

    /// Assert both halves of a relationship. The parent-side link is the one
    /// clients navigate by; a failed child-side link is left for
    /// `repair_hierarchy`.
    async fn link(&self, parent: &RoomId, child: &RoomId) {
        if let Err(e) = self.backend.set_space_child(parent, child).await {
            warn!(parent = %parent, child = %child, "failed to set space child: {e}");
        }
        if let Err(e) = self.backend.set_space_parent(child, parent).await {
            warn!(parent = %parent, child = %child, "failed to set space parent: {e}");
        }
    }
}

fn render(template: &str, channel: &str, department: Option<&str>) -> String {
    let mut out = template.replace("{channel}", channel);
    if let Some(dept) = department {
        out = out.replace("{department}", dept);
    }
    out
}
