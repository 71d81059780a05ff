//! HTTP adapter for the chat backend port, speaking the Matrix
//! client-server v3 API with a bearer access token.
//!
//! Error mapping is what the core logic keys recovery decisions on:
//! 403/401 become `Forbidden`, 404 becomes `NotFound` (both invalidate a
//! room), 429 and 5xx become `Transient`, as do connect and read timeouts.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use mcs_core::backend::{CreateRoomRequest, MatrixBackend, PowerLevels, RoomEvent, RoomKind, SyncBatch};
use mcs_core::domain::{EventId, MatrixUserId, RoomId};
use mcs_core::{Error, Result};

const API: &str = "/_matrix/client/v3";

/// Inline sync filter: the relay only needs room timelines, so drop
/// presence, account data, ephemeral events and full member state from
/// every poll.
const SYNC_FILTER: &str = r#"{"room":{"state":{"lazy_load_members":true},"timeline":{"types":["m.room.message"]},"ephemeral":{"types":[]},"account_data":{"types":[]}},"presence":{"types":[]},"account_data":{"types":[]}}"#;

pub struct MatrixHttp {
    http: reqwest::Client,
    base: String,
    token: String,
    /// Transaction ids must not repeat across restarts, or the server
    /// deduplicates the send; seed with wall-clock time.
    txn_base: u64,
    txn_seq: AtomicU64,
}

impl MatrixHttp {
    pub fn new(homeserver_url: &str, access_token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::External(format!("http client: {e}")))?;
        let txn_base = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Ok(Self {
            http,
            base: homeserver_url.trim_end_matches('/').to_string(),
            token: access_token.to_string(),
            txn_base,
            txn_seq: AtomicU64::new(0),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{API}{path}", self.base)
    }

    /// The `via` hint for space link events: the server part of a room id.
    fn via(&self, room: &RoomId) -> Vec<String> {
        room.0
            .split_once(':')
            .map(|(_, server)| vec![server.to_string()])
            .unwrap_or_default()
    }

    fn txn_id(&self) -> String {
        format!(
            "mcs{}.{}",
            self.txn_base,
            self.txn_seq.fetch_add(1, Ordering::Relaxed)
        )
    }

    async fn request<T: DeserializeOwned>(
        &self,
        op: &'static str,
        method: Method,
        url: String,
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        let mut req = self
            .http
            .request(method, &url)
            .bearer_auth(&self.token);
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req.send().await.map_err(|e| map_transport(op, e))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| map_transport(op, e))?;

        if !status.is_success() {
            return Err(map_status(op, status, &text));
        }

        debug!(op, url, "matrix request ok");
        serde_json::from_str(&text)
            .map_err(|e| Error::External(format!("{op}: bad response body: {e}")))
    }
}

fn map_transport(op: &'static str, e: reqwest::Error) -> Error {
    if e.is_timeout() || e.is_connect() {
        Error::Transient {
            op,
            detail: e.to_string(),
        }
    } else {
        Error::External(format!("{op}: {e}"))
    }
}

fn map_status(op: &'static str, status: StatusCode, body: &str) -> Error {
    let detail = error_detail(body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Forbidden { op, detail },
        StatusCode::NOT_FOUND => Error::NotFound { op, detail },
        StatusCode::TOO_MANY_REQUESTS => Error::Transient { op, detail },
        s if s.is_server_error() => Error::Transient { op, detail },
        _ => Error::External(format!("{op}: {status}: {detail}")),
    }
}

/// Prefer the standard `{"errcode": ..., "error": ...}` shape, falling back
/// to the raw body.
fn error_detail(body: &str) -> String {
    #[derive(Deserialize)]
    struct MatrixError {
        errcode: Option<String>,
        error: Option<String>,
    }
    match serde_json::from_str::<MatrixError>(body) {
        Ok(e) => match (e.errcode, e.error) {
            (Some(code), Some(msg)) => format!("{code}: {msg}"),
            (Some(code), None) => code,
            (None, Some(msg)) => msg,
            (None, None) => body.trim().to_string(),
        },
        Err(_) => body.trim().to_string(),
    }
}

#[derive(Deserialize)]
struct WhoamiResponse {
    user_id: MatrixUserId,
}

#[derive(Deserialize)]
struct CreateRoomResponse {
    room_id: RoomId,
}

#[derive(Deserialize)]
struct SendResponse {
    event_id: EventId,
}

#[derive(Deserialize)]
struct JoinedMembersResponse {
    joined: BTreeMap<String, serde_json::Value>,
}

#[derive(Serialize)]
struct MessageContent<'a> {
    msgtype: &'static str,
    body: &'a str,
}

#[derive(Deserialize)]
struct SyncResponse {
    next_batch: String,
    #[serde(default)]
    rooms: SyncRooms,
}

#[derive(Default, Deserialize)]
struct SyncRooms {
    #[serde(default)]
    join: BTreeMap<String, JoinedRoom>,
}

#[derive(Deserialize)]
struct JoinedRoom {
    #[serde(default)]
    timeline: Timeline,
}

#[derive(Default, Deserialize)]
struct Timeline {
    #[serde(default)]
    events: Vec<TimelineEvent>,
}

#[derive(Deserialize)]
struct TimelineEvent {
    #[serde(rename = "type")]
    kind: String,
    event_id: EventId,
    sender: MatrixUserId,
    #[serde(default)]
    origin_server_ts: i64,
    #[serde(default)]
    content: serde_json::Value,
}

#[async_trait]
impl MatrixBackend for MatrixHttp {
    async fn whoami(&self) -> Result<MatrixUserId> {
        let resp: WhoamiResponse = self
            .request("whoami", Method::GET, self.url("/account/whoami"), None)
            .await?;
        Ok(resp.user_id)
    }

    async fn create_room(&self, req: CreateRoomRequest) -> Result<RoomId> {
        let mut body = json!({
            "name": req.name,
            "preset": "private_chat",
            "invite": req.invites,
        });
        if let Some(topic) = &req.topic {
            body["topic"] = json!(topic);
        }
        if req.kind == RoomKind::Space {
            body["creation_content"] = json!({ "type": "m.space" });
        }
        // Riding the levels in the creation request makes the lockdown
        // atomic with the room's existence.
        if let Some(levels) = &req.power_levels {
            body["power_level_content_override"] = serde_json::to_value(levels)
                .map_err(|e| Error::External(format!("create_room: power levels: {e}")))?;
        }

        let resp: CreateRoomResponse = self
            .request("create_room", Method::POST, self.url("/createRoom"), Some(body))
            .await?;
        Ok(resp.room_id)
    }

    async fn invite(&self, room: &RoomId, user: &MatrixUserId) -> Result<()> {
        let url = self.url(&format!("/rooms/{}/invite", room.0));
        let _: serde_json::Value = self
            .request("invite", Method::POST, url, Some(json!({ "user_id": user })))
            .await?;
        Ok(())
    }

    async fn join(&self, room: &RoomId) -> Result<()> {
        let url = self.url(&format!("/rooms/{}/join", room.0));
        let _: serde_json::Value = self
            .request("join", Method::POST, url, Some(json!({})))
            .await?;
        Ok(())
    }

    async fn leave(&self, room: &RoomId) -> Result<()> {
        let url = self.url(&format!("/rooms/{}/leave", room.0));
        let _: serde_json::Value = self
            .request("leave", Method::POST, url, Some(json!({})))
            .await?;
        Ok(())
    }

    async fn joined_members(&self, room: &RoomId) -> Result<Vec<MatrixUserId>> {
        let url = self.url(&format!("/rooms/{}/joined_members", room.0));
        let resp: JoinedMembersResponse =
            self.request("joined_members", Method::GET, url, None).await?;
        Ok(resp.joined.into_keys().map(MatrixUserId).collect())
    }

    async fn send_text(&self, room: &RoomId, body: &str) -> Result<EventId> {
        self.send_message(room, "m.text", body).await
    }

    async fn send_notice(&self, room: &RoomId, body: &str) -> Result<EventId> {
        self.send_message(room, "m.notice", body).await
    }

    async fn power_levels(&self, room: &RoomId) -> Result<PowerLevels> {
        let url = self.url(&format!("/rooms/{}/state/m.room.power_levels", room.0));
        self.request("power_levels", Method::GET, url, None).await
    }

    async fn set_power_levels(&self, room: &RoomId, levels: &PowerLevels) -> Result<()> {
        let url = self.url(&format!("/rooms/{}/state/m.room.power_levels", room.0));
        let body = serde_json::to_value(levels)
            .map_err(|e| Error::External(format!("set_power_levels: {e}")))?;
        let _: serde_json::Value = self
            .request("set_power_levels", Method::PUT, url, Some(body))
            .await?;
        Ok(())
    }

    async fn set_space_child(&self, parent: &RoomId, child: &RoomId) -> Result<()> {
        let url = self.url(&format!(
            "/rooms/{}/state/m.space.child/{}",
            parent.0, child.0
        ));
        let body = json!({ "via": self.via(child), "suggested": false });
        let _: serde_json::Value = self
            .request("set_space_child", Method::PUT, url, Some(body))
            .await?;
        Ok(())
    }

    async fn set_space_parent(&self, child: &RoomId, parent: &RoomId) -> Result<()> {
        let url = self.url(&format!(
            "/rooms/{}/state/m.space.parent/{}",
            child.0, parent.0
        ));
        let body = json!({ "via": self.via(parent), "canonical": true });
        let _: serde_json::Value = self
            .request("set_space_parent", Method::PUT, url, Some(body))
            .await?;
        Ok(())
    }

    async fn sync_since(&self, since: Option<&str>, timeout: Duration) -> Result<SyncBatch> {
        let timeout_ms = timeout.as_millis().to_string();
        let mut params = vec![("timeout", timeout_ms.as_str()), ("filter", SYNC_FILTER)];
        if let Some(since) = since {
            params.push(("since", since));
        }
        let url = reqwest::Url::parse_with_params(&self.url("/sync"), &params)
            .map_err(|e| Error::External(format!("sync: bad url: {e}")))?;

        let resp: SyncResponse = self.request("sync", Method::GET, url.to_string(), None).await?;

        let mut events = Vec::new();
        for (room_id, room) in resp.rooms.join {
            for ev in room.timeline.events {
                if ev.kind != "m.room.message" {
                    continue;
                }
                let msgtype = ev.content.get("msgtype").and_then(|v| v.as_str());
                if !matches!(msgtype, Some("m.text") | Some("m.emote")) {
                    continue;
                }
                let Some(body) = ev.content.get("body").and_then(|v| v.as_str()) else {
                    continue;
                };
                events.push(RoomEvent {
                    room_id: RoomId(room_id.clone()),
                    event_id: ev.event_id,
                    sender: ev.sender,
                    body: body.to_string(),
                    origin_server_ts: ev.origin_server_ts,
                });
            }
        }

        Ok(SyncBatch {
            next_batch: resp.next_batch,
            events,
        })
    }
}

impl MatrixHttp {
    async fn send_message(
        &self,
        room: &RoomId,
        msgtype: &'static str,
        body: &str,
    ) -> Result<EventId> {
        let url = self.url(&format!(
            "/rooms/{}/send/m.room.message/{}",
            room.0,
            self.txn_id()
        ));
        let content = serde_json::to_value(MessageContent { msgtype, body })
            .map_err(|e| Error::External(format!("send: {e}")))?;
        let resp: SendResponse = self.request("send", Method::PUT, url, Some(content)).await?;
        Ok(resp.event_id)
    }
}
