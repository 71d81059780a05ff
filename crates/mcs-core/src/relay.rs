//! Outbound relay: long-poll the chat backend and forward room messages to
//! their mapped Telegram chats.
//!
//! The loop is deliberately lossy in one direction only: a message that
//! cannot be delivered to Telegram is logged and dropped, never retried, so
//! one unreachable chat cannot stall the relay for everyone else. Loss on
//! the polling side is handled by re-polling the same cursor.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    backend::{MatrixBackend, RoomEvent},
    channel::ChannelPort,
    config::Config,
    domain::{EventId, MatrixUserId},
    mapping::ChatRoomStore,
    Result,
};

/// Bound on the forwarded-event memory. Old entries fall out FIFO; the
/// start-time filter keeps an expired entry from causing a re-forward in
/// practice.
const SEEN_CAP: usize = 4096;

pub struct RelayLoop {
    backend: Arc<dyn MatrixBackend>,
    channel: Arc<dyn ChannelPort>,
    store: Arc<Mutex<ChatRoomStore>>,
    ignored_senders: Vec<MatrixUserId>,
    poll_interval: Duration,
    poll_timeout: Duration,
    /// Events timestamped before process start are history, not traffic.
    started_at_ms: i64,
    cursor: Option<String>,
    seen: HashSet<EventId>,
    seen_order: VecDeque<EventId>,
}

impl RelayLoop {
    pub fn new(
        cfg: &Config,
        backend: Arc<dyn MatrixBackend>,
        channel: Arc<dyn ChannelPort>,
        store: Arc<Mutex<ChatRoomStore>>,
        own_user: MatrixUserId,
    ) -> Self {
        let mut ignored_senders = cfg.system_senders.clone();
        ignored_senders.push(own_user);
        Self {
            backend,
            channel,
            store,
            ignored_senders,
            poll_interval: cfg.poll_interval,
            poll_timeout: cfg.poll_timeout,
            started_at_ms: chrono::Utc::now().timestamp_millis(),
            cursor: None,
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
        }
    }

    /// One poll cycle: fetch, filter, forward. Returns the number of
    /// messages actually delivered. A transport error leaves the cursor
    /// untouched so the next cycle retries the same window.
    pub async fn poll_once(&mut self) -> Result<usize> {
        let batch = self
            .backend
            .sync_since(self.cursor.as_deref(), self.poll_timeout)
            .await?;
        self.cursor = Some(batch.next_batch);

        let mut delivered = 0;
        for event in batch.events {
            if self.forward(&event).await {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Run until cancelled, backing off on consecutive poll failures.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("relay loop started");
        let mut failures: u32 = 0;
        loop {
            let delivered = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("relay loop stopping");
                    return;
                }
                result = self.poll_once() => {
                    match result {
                        Ok(n) => {
                            if n > 0 {
                                debug!(delivered = n, "relayed messages");
                            }
                            failures = 0;
                            n
                        }
                        Err(e) => {
                            failures = failures.saturating_add(1);
                            warn!(failures, "poll failed: {e}");
                            0
                        }
                    }
                }
            };

            let Some(delay) = self.next_delay(delivered, failures) else {
                continue;
            };
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("relay loop stopping");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// The long-poll itself is the pacing: a cycle that delivered messages
    /// re-polls immediately, an idle cycle waits one interval, and failures
    /// back off exponentially.
    fn next_delay(&self, delivered: usize, failures: u32) -> Option<Duration> {
        if failures > 0 {
            Some(self.poll_interval * 2u32.saturating_pow(failures.min(5)))
        } else if delivered == 0 {
            Some(self.poll_interval)
        } else {
            None
        }
    }

    async fn forward(&mut self, event: &RoomEvent) -> bool {
        if event.origin_server_ts < self.started_at_ms {
            return false;
        }
        if self.ignored_senders.contains(&event.sender) {
            return false;
        }
        if self.seen.contains(&event.event_id) {
            return false;
        }

        let Some(chat) = self.store.lock().await.chat_for_room(&event.room_id) else {
            return false;
        };

        self.remember(event.event_id.clone());

        let text = format!("{}: {}", event.sender.localpart(), event.body);
        match self.channel.send_text(chat, &text).await {
            Ok(()) => true,
            Err(e) => {
                // Dedup already recorded it: failed deliveries are dropped,
                // not retried.
                warn!(room = %event.room_id, chat = chat.0, event = %event.event_id, "delivery failed, dropping: {e}");
                false
            }
        }
    }

    fn remember(&mut self, id: EventId) {
        if self.seen.insert(id.clone()) {
            self.seen_order.push_back(id);
            if self.seen_order.len() > SEEN_CAP {
                if let Some(old) = self.seen_order.pop_front() {
                    self.seen.remove(&old);
                }
            }
        }
    }
}
