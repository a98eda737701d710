//! The wire protocol: every frame type the engine can send or receive.
//!
//! A `#[derive(Serialize, Deserialize)]` enum of message variants, encoded
//! with `postcard`, grouped by which subsystem (message engine, discovery
//! gossip, bootstrap elector, key exchange, heartbeat) sends and receives
//! them, plus three wire-compatibility no-ops.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::PublicKey;
use crate::transport::PeerId;

/// A message identifier, unique per sender. Newtype over `String` rather
/// than a fixed-width integer because it's an opaque identifier the sender
/// mints — nothing in the protocol needs it to be orderable or compact on
/// the wire.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate a fresh random id. Used by callers that don't already have
    /// an application-level identifier for the message they're sending.
    pub fn new_random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The kind of content a chat message carries. `Image`/`File`/`Video`
/// messages carry a reference handle into the external blob store rather
/// than the bytes themselves; only `Text` and `System` carry content
/// inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsgType {
    Text,
    Image,
    File,
    Video,
    System,
}

/// One entry in a `device_list_response` — the wire shape of a device, which
/// is narrower than `device::Device`: no derived `is_online`, no transient
/// `is_bootstrap` (that field is never persisted or transmitted directly;
/// the bootstrap flag is reconstructed locally from the `is_bootstrap`/
/// `real_peer_id` fields carried on `device_list_response` itself, see
/// `discovery.rs`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceListEntry {
    pub peer_id: PeerId,
    pub username: String,
    /// Content hash / handle for the avatar blob, not the avatar bytes.
    pub avatar_ref: Option<String>,
    pub last_heartbeat: u64,
    pub first_discovered: u64,
    pub user_info_version: u64,
    pub public_key: Option<PublicKey>,
}

/// The full set of frame bodies in the protocol catalog.
///
/// Three variants (`RelayMessage`, `RelayResponse`,
/// `NetworkAccelerationStatus`) exist purely for wire compatibility with a
/// prior deployment that defined them; this engine never originates them and
/// registers no handler for them, so they fall through to the registry's
/// ordinary "no handler for this tag" drop-and-log path (see DESIGN.md:
/// included as no-ops rather than omitted, since keeping them costs nothing
/// here).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FrameBody {
    // ── Message Engine (five-step protocol) ──────────────────────────
    MessageId {
        message_id: MessageId,
        msg_type: MsgType,
    },
    RequestContent {
        message_id: MessageId,
    },
    MessageContent {
        message_id: MessageId,
        content: Vec<u8>,
        msg_type: MsgType,
    },
    DeliveryAck {
        message_id: MessageId,
    },

    // ── Discovery Gossip ──────────────────────────────────────────────
    DiscoveryNotification {
        from_username: String,
        from_avatar: Option<String>,
        profile_version: u64,
    },
    DiscoveryResponse {
        username: String,
        avatar: Option<String>,
    },
    UsernameQuery,
    UsernameResponse {
        username: String,
        avatar: Option<String>,
    },
    DeviceListRequest {
        real_peer_id: Option<PeerId>,
        username: Option<String>,
        avatar: Option<String>,
    },
    DeviceListResponse {
        devices: Vec<DeviceListEntry>,
        is_bootstrap: Option<bool>,
        real_peer_id: Option<PeerId>,
        username: Option<String>,
        avatar: Option<String>,
    },

    // ── Heartbeat & Profile Sync ──────────────────────────────────────
    OnlineCheckQuery {
        username: String,
        avatar: Option<String>,
        user_info_version: u64,
    },
    OnlineCheckResponse {
        is_online: bool,
        username: String,
        avatar: Option<String>,
        user_info_version: u64,
    },
    UserInfoQuery,
    UserInfoResponse {
        username: String,
        avatar: Option<String>,
        version: u64,
    },
    UserInfoUpdate {
        username: String,
        avatar: Option<String>,
        version: u64,
    },

    // ── Key Exchange & Continuity ───────────────────────────────────
    KeyExchangeRequest {
        public_key: PublicKey,
    },
    KeyExchangeResponse {
        public_key: PublicKey,
    },

    // ── Wire-compatibility no-ops ─────────────────────────────────────
    RelayMessage,
    RelayResponse,
    NetworkAccelerationStatus,
}

impl FrameBody {
    /// The tag used to key handler registration and request/response
    /// waiters. Kept separate from the `FrameBody` payload itself so the
    /// handler registry (`registry.rs`) and request router (`router.rs`)
    /// can be generic over "which kind of frame is this" without matching
    /// out every field.
    pub fn tag(&self) -> FrameType {
        match self {
            FrameBody::MessageId { .. } => FrameType::MessageId,
            FrameBody::RequestContent { .. } => FrameType::RequestContent,
            FrameBody::MessageContent { .. } => FrameType::MessageContent,
            FrameBody::DeliveryAck { .. } => FrameType::DeliveryAck,
            FrameBody::DiscoveryNotification { .. } => FrameType::DiscoveryNotification,
            FrameBody::DiscoveryResponse { .. } => FrameType::DiscoveryResponse,
            FrameBody::UsernameQuery => FrameType::UsernameQuery,
            FrameBody::UsernameResponse { .. } => FrameType::UsernameResponse,
            FrameBody::DeviceListRequest { .. } => FrameType::DeviceListRequest,
            FrameBody::DeviceListResponse { .. } => FrameType::DeviceListResponse,
            FrameBody::OnlineCheckQuery { .. } => FrameType::OnlineCheckQuery,
            FrameBody::OnlineCheckResponse { .. } => FrameType::OnlineCheckResponse,
            FrameBody::UserInfoQuery => FrameType::UserInfoQuery,
            FrameBody::UserInfoResponse { .. } => FrameType::UserInfoResponse,
            FrameBody::UserInfoUpdate { .. } => FrameType::UserInfoUpdate,
            FrameBody::KeyExchangeRequest { .. } => FrameType::KeyExchangeRequest,
            FrameBody::KeyExchangeResponse { .. } => FrameType::KeyExchangeResponse,
            FrameBody::RelayMessage => FrameType::RelayMessage,
            FrameBody::RelayResponse => FrameType::RelayResponse,
            FrameBody::NetworkAccelerationStatus => FrameType::NetworkAccelerationStatus,
        }
    }
}

/// The frame-type tag, independent of any payload. This is what the handler
/// registry indexes on and what request/response waiters key against —
/// see `registry.rs` and `router.rs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FrameType {
    MessageId,
    RequestContent,
    MessageContent,
    DeliveryAck,
    DiscoveryNotification,
    DiscoveryResponse,
    UsernameQuery,
    UsernameResponse,
    DeviceListRequest,
    DeviceListResponse,
    OnlineCheckQuery,
    OnlineCheckResponse,
    UserInfoQuery,
    UserInfoResponse,
    UserInfoUpdate,
    KeyExchangeRequest,
    KeyExchangeResponse,
    RelayMessage,
    RelayResponse,
    NetworkAccelerationStatus,
}

/// Every frame additionally carries `from`, `to`, `timestamp`. This is the
/// actual unit that crosses the transport boundary; `FrameBody` alone never
/// does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub from: PeerId,
    pub to: PeerId,
    pub timestamp: u64,
    pub body: FrameBody,
}

impl Frame {
    pub fn new(from: PeerId, to: PeerId, timestamp: u64, body: FrameBody) -> Self {
        Self {
            from,
            to,
            timestamp,
            body,
        }
    }

    /// Encode to bytes using postcard.
    pub fn to_bytes(&self) -> Result<Vec<u8>, crate::error::EngineError> {
        postcard::to_stdvec(self).map_err(crate::error::EngineError::serialization)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, crate::error::EngineError> {
        postcard::from_bytes(bytes).map_err(crate::error::EngineError::serialization)
    }
}
