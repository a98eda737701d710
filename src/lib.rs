//! `peer-chat-engine`: a transport-agnostic peer protocol engine for
//! browser-hosted P2P chat.
//!
//! The crate is organized the way the design separates concerns: each
//! module owns one subsystem (identity, transport, discovery, message
//! delivery, bootstrap election, key continuity, heartbeat/profile sync,
//! storage) and the [`engine`] module wires them into one facade,
//! [`engine::Engine`], that an embedding application actually constructs.
//!
//! Nothing here binds to a particular async runtime feature set beyond
//! `tokio`'s channel/time primitives, and nothing binds to a particular
//! connector: the [`transport::Transport`] trait and [`storage::KvStore`]/
//! [`storage::BlobStore`] traits are the seams an embedder supplies — a
//! WebRTC data channel and IndexedDB in a browser, or the in-memory fakes
//! under `transport::fake`/`storage` for tests.

pub mod bootstrap;
pub mod config;
pub mod device;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod heartbeat;
pub mod identity;
pub mod key_exchange;
pub mod message_engine;
pub mod profile;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod storage;
pub mod time;
pub mod transport;

pub use config::EngineConfig;
pub use device::{Device, KeyExchangeStatus};
pub use discovery::DiscoveryEvent;
pub use engine::Engine;
pub use error::EngineError;
pub use identity::{PrivateKeyHandle, PublicKey, Signer};
pub use key_exchange::KeyChangeEvent;
pub use message_engine::MessageEvent;
pub use protocol::{MessageId, MsgType};
pub use storage::{BlobStore, KvStore};
pub use transport::{PeerId, Transport};
