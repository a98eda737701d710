//! Message Engine — the core delivery pipeline.
//!
//! Implements the five-step chat delivery protocol end to end: splitting
//! envelope from payload, receiver-side deduplication, sender-side pending
//! queues, and opportunistic retry on evidence of peer liveness. Owned by a
//! single task reached through `MessageEngineHandle`, the same shape as
//! `device::DeviceRegistryHandle` — `pending_content`, `pending_retry`, and
//! `seen_message_ids` are each named single-writer structures.
//!
//! Chat message persistence itself is an external collaborator: this module
//! writes received payload bytes into the injected `BlobStore`'s `messages`
//! collection and otherwise only reports status transitions (`delivered`,
//! `failed`, `received`) to the embedding application over an
//! `mpsc::UnboundedReceiver<MessageEvent>`, rather than owning a full chat
//! history itself.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::protocol::{Frame, FrameBody, MessageId, MsgType};
use crate::storage::{swallow, BlobStore, KvStore};
use crate::time::now_millis;
use crate::transport::{PeerId, TransportAdapter};

pub const MESSAGES_COLLECTION: &str = "messages";
pub const PENDING_RETRY_STORAGE_KEY: &str = "pending-retry-queue";
/// Default cap on the dedup set's size.
const SEEN_ID_CAP: usize = 10_000;
/// Default age cap on dedup entries.
const SEEN_ID_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

fn messages_blob_key(message_id: &MessageId) -> String {
    format!("msg-content-{message_id}")
}

/// A retry-queue entry on the sender side.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub id: MessageId,
    pub to: PeerId,
    pub content: Vec<u8>,
    pub msg_type: MsgType,
    pub timestamp: u64,
    pub retry_count: u32,
    pub max_retries: Option<u32>,
    /// Wall-clock ms of the last step-1 resend, used to rate-limit retries
    /// triggered by `note_liveness` — a chatty peer shouldn't cause a resend
    /// on every single inbound frame.
    last_retry_at: u64,
}

/// Status events the embedding application observes. `Received` reports a
/// successful inbound delivery so the app can render it; `Failed` reports
/// retries exhausted.
#[derive(Debug, Clone)]
pub enum MessageEvent {
    Delivered { message_id: MessageId, delivered_at: u64 },
    Failed { message_id: MessageId },
    Received { from: PeerId, message_id: MessageId, content: Vec<u8>, msg_type: MsgType },
}

enum Command {
    Send {
        to: PeerId,
        message_id: MessageId,
        content: Vec<u8>,
        msg_type: MsgType,
        max_retries: Option<u32>,
    },
    Inbound(Frame),
    NoteLiveness(PeerId),
    PendingCount(oneshot::Sender<usize>),
    SeenCount(oneshot::Sender<usize>),
}

#[derive(Clone)]
pub struct MessageEngineHandle {
    tx: mpsc::Sender<Command>,
}

impl MessageEngineHandle {
    pub fn spawn(
        local_id: PeerId,
        adapter: Arc<TransportAdapter>,
        blobs: Arc<dyn BlobStore>,
        kv: Arc<dyn KvStore>,
        config: EngineConfig,
    ) -> (Self, mpsc::UnboundedReceiver<MessageEvent>) {
        let (tx, rx) = mpsc::channel(256);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx, local_id, adapter, blobs, kv, config, events_tx));
        (Self { tx }, events_rx)
    }

    /// Begin sending a chat message (step 1 of the five-step protocol).
    /// `max_retries` of `None` means retry indefinitely.
    pub async fn send_message(
        &self,
        to: PeerId,
        message_id: MessageId,
        content: Vec<u8>,
        msg_type: MsgType,
        max_retries: Option<u32>,
    ) {
        let _ = self
            .tx
            .send(Command::Send {
                to,
                message_id,
                content,
                msg_type,
                max_retries,
            })
            .await;
    }

    /// Feed an inbound frame that belongs to the five-step protocol. The
    /// caller (the handler registry wiring in `engine.rs`) is responsible
    /// for only forwarding `MessageId`/`RequestContent`/`MessageContent`/
    /// `DeliveryAck` tags here.
    pub async fn handle_inbound(&self, frame: Frame) {
        let _ = self.tx.send(Command::Inbound(frame)).await;
    }

    /// Evidence of liveness from `peer_id` (any inbound frame at all)
    /// triggers an opportunistic retry of step 1 for every pending message
    /// addressed to that peer.
    pub async fn note_liveness(&self, peer_id: PeerId) {
        let _ = self.tx.send(Command::NoteLiveness(peer_id)).await;
    }

    pub async fn pending_count(&self) -> usize {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(Command::PendingCount(reply_tx)).await;
        reply_rx.await.unwrap_or(0)
    }

    pub async fn seen_count(&self) -> usize {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(Command::SeenCount(reply_tx)).await;
        reply_rx.await.unwrap_or(0)
    }
}

struct State {
    local_id: PeerId,
    pending_content: HashMap<MessageId, (Vec<u8>, MsgType)>,
    pending_retry: HashMap<MessageId, PendingMessage>,
    seen_order: VecDeque<(MessageId, u64)>,
    seen_set: HashSet<MessageId>,
    adapter: Arc<TransportAdapter>,
    blobs: Arc<dyn BlobStore>,
    kv: Arc<dyn KvStore>,
    config: EngineConfig,
    events: mpsc::UnboundedSender<MessageEvent>,
}

impl State {
    fn mark_seen(&mut self, message_id: MessageId, now: u64) {
        if self.seen_set.insert(message_id.clone()) {
            self.seen_order.push_back((message_id, now));
        }
        self.prune_seen(now);
    }

    fn prune_seen(&mut self, now: u64) {
        while self.seen_order.len() > SEEN_ID_CAP {
            if let Some((id, _)) = self.seen_order.pop_front() {
                self.seen_set.remove(&id);
            }
        }
        while let Some((_, seen_at)) = self.seen_order.front() {
            if now.saturating_sub(*seen_at) > SEEN_ID_TTL.as_millis() as u64 {
                if let Some((id, _)) = self.seen_order.pop_front() {
                    self.seen_set.remove(&id);
                }
            } else {
                break;
            }
        }
    }

    async fn persist_pending_retry(&self) {
        let records: Vec<PendingMessageRecord> = self
            .pending_retry
            .values()
            .map(PendingMessageRecord::from)
            .collect();
        let encoded = match postcard::to_stdvec(&records) {
            Ok(bytes) => crate::storage::encode_record(&bytes),
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode pending-retry queue");
                return;
            }
        };
        swallow(
            "persist pending-retry queue",
            self.kv.set(PENDING_RETRY_STORAGE_KEY, encoded).await,
        );
    }

    async fn send_frame(&self, to: &PeerId, body: FrameBody) -> Result<(), EngineError> {
        let frame = Frame::new(self.local_id.clone(), to.clone(), now_millis(), body);
        self.adapter.send_frame(to, frame).await
    }
}

/// Postcard-serializable mirror of `PendingMessage` (`PeerId`/`MessageId`
/// already derive `Serialize`/`Deserialize`; this wrapper exists only so the
/// queue persistence format doesn't need to change if `PendingMessage` ever
/// grows a non-serializable field).
#[derive(serde::Serialize, serde::Deserialize)]
struct PendingMessageRecord {
    id: MessageId,
    to: PeerId,
    content: Vec<u8>,
    msg_type: MsgType,
    timestamp: u64,
    retry_count: u32,
    max_retries: Option<u32>,
}

impl From<&PendingMessage> for PendingMessageRecord {
    fn from(value: &PendingMessage) -> Self {
        Self {
            id: value.id.clone(),
            to: value.to.clone(),
            content: value.content.clone(),
            msg_type: value.msg_type,
            timestamp: value.timestamp,
            retry_count: value.retry_count,
            max_retries: value.max_retries,
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    mut rx: mpsc::Receiver<Command>,
    local_id: PeerId,
    adapter: Arc<TransportAdapter>,
    blobs: Arc<dyn BlobStore>,
    kv: Arc<dyn KvStore>,
    config: EngineConfig,
    events: mpsc::UnboundedSender<MessageEvent>,
) {
    let mut state = State {
        local_id,
        pending_content: HashMap::new(),
        pending_retry: HashMap::new(),
        seen_order: VecDeque::new(),
        seen_set: HashSet::new(),
        adapter,
        blobs,
        kv,
        config,
        events,
    };

    while let Some(command) = rx.recv().await {
        match command {
            Command::Send {
                to,
                message_id,
                content,
                msg_type,
                max_retries,
            } => {
                let now = now_millis();
                state
                    .pending_content
                    .insert(message_id.clone(), (content.clone(), msg_type));
                state.pending_retry.insert(
                    message_id.clone(),
                    PendingMessage {
                        id: message_id.clone(),
                        to: to.clone(),
                        content,
                        msg_type,
                        timestamp: now,
                        retry_count: 0,
                        max_retries,
                        last_retry_at: now,
                    },
                );
                state.persist_pending_retry().await;

                let result = state
                    .send_frame(&to, FrameBody::MessageId { message_id: message_id.clone(), msg_type })
                    .await;
                if let Err(err) = result {
                    tracing::debug!(error = %err, %message_id, "step 1 send failed, message remains queued for retry");
                }
            }

            Command::Inbound(frame) => {
                let from = frame.from.clone();
                match frame.body {
                    FrameBody::MessageId { message_id, msg_type } => {
                        let now = now_millis();
                        if state.seen_set.contains(&message_id) {
                            // Step 5 short-circuit: already delivered, just re-ack.
                            let _ = state
                                .send_frame(&from, FrameBody::DeliveryAck { message_id })
                                .await;
                        } else {
                            let _ = msg_type;
                            let _ = state
                                .send_frame(&from, FrameBody::RequestContent { message_id })
                                .await;
                        }
                    }

                    FrameBody::RequestContent { message_id } => {
                        if let Some((content, msg_type)) = state.pending_content.get(&message_id).cloned() {
                            let result = state
                                .send_frame(
                                    &from,
                                    FrameBody::MessageContent {
                                        message_id: message_id.clone(),
                                        content,
                                        msg_type,
                                    },
                                )
                                .await;
                            if result.is_ok() {
                                // Step 4: the sender removes the message_id
                                // from its pending-content map once content
                                // has been sent; it stays in pending_retry
                                // until the ack arrives.
                                state.pending_content.remove(&message_id);
                            }
                        }
                    }

                    FrameBody::MessageContent { message_id, content, msg_type } => {
                        let now = now_millis();
                        swallow(
                            "persist received message content",
                            state
                                .blobs
                                .set(MESSAGES_COLLECTION, &messages_blob_key(&message_id), content.clone())
                                .await,
                        );
                        state.mark_seen(message_id.clone(), now);
                        let _ = state.events.send(MessageEvent::Received {
                            from: from.clone(),
                            message_id: message_id.clone(),
                            content,
                            msg_type,
                        });
                        let _ = state.send_frame(&from, FrameBody::DeliveryAck { message_id }).await;
                    }

                    FrameBody::DeliveryAck { message_id } => {
                        if state.pending_retry.remove(&message_id).is_some() {
                            state.pending_content.remove(&message_id);
                            state.persist_pending_retry().await;
                            let _ = state.events.send(MessageEvent::Delivered {
                                message_id,
                                delivered_at: now_millis(),
                            });
                        }
                        // A duplicate or late ack for an already-delivered
                        // message is simply ignored (idempotent).
                    }

                    _ => {
                        tracing::debug!(from = %from, "message engine received a frame outside its catalog");
                    }
                }
            }

            Command::NoteLiveness(peer_id) => {
                let now = now_millis();
                let backoff_ms = state.config.retry_backoff_base.as_millis() as u64;
                // The very first retry attempt is never backoff-gated: a
                // message enqueued and then immediately followed by liveness
                // evidence (the common case — the peer was offline, now an
                // inbound frame from it arrives) must retry right away, not
                // wait out the base backoff meant to rate-limit *repeated*
                // retries against a chatty peer.
                let due: Vec<MessageId> = state
                    .pending_retry
                    .values()
                    .filter(|m| m.to == peer_id && (m.retry_count == 0 || now.saturating_sub(m.last_retry_at) >= backoff_ms))
                    .map(|m| m.id.clone())
                    .collect();

                for message_id in due {
                    let (to, msg_type, exceeded) = {
                        let entry = state.pending_retry.get_mut(&message_id).unwrap();
                        entry.retry_count += 1;
                        entry.last_retry_at = now;
                        let exceeded = entry
                            .max_retries
                            .map(|max| entry.retry_count > max)
                            .unwrap_or(false);
                        (entry.to.clone(), entry.msg_type, exceeded)
                    };

                    if exceeded {
                        state.pending_retry.remove(&message_id);
                        state.pending_content.remove(&message_id);
                        state.persist_pending_retry().await;
                        let _ = state.events.send(MessageEvent::Failed { message_id });
                        continue;
                    }

                    // Retry sends only step 1 again; the content is still
                    // staged in pending_content.
                    let result = state
                        .send_frame(&to, FrameBody::MessageId { message_id: message_id.clone(), msg_type })
                        .await;
                    if let Err(err) = result {
                        tracing::debug!(error = %err, %message_id, "retry send failed, will retry on next liveness evidence");
                    }
                }
                state.persist_pending_retry().await;
            }

            Command::PendingCount(reply) => {
                let _ = reply.send(state.pending_retry.len());
            }
            Command::SeenCount(reply) => {
                let _ = reply.send(state.seen_set.len());
            }
        }
    }
}
