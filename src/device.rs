//! Device Registry.
//!
//! The central record of every known remote peer, plus the single-writer
//! map that owns them. Mutation is funneled through one `tokio::task`
//! reached only via the `Clone`-able `DeviceRegistryHandle` — a
//! command-channel owner task, generalized from "one-shot request/response"
//! to "fire-and-forget mutation, optionally with a reply" commands.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::config::EngineConfig;
use crate::identity::PublicKey;
use crate::protocol::DeviceListEntry;
use crate::storage::{decode_record, encode_record, swallow, BlobStore, KvStore};
use crate::time::now_millis;
use crate::transport::PeerId;

pub const DEVICES_STORAGE_KEY: &str = "discovered-devices";
pub const AVATARS_COLLECTION: &str = "avatars";

/// Key-exchange lifecycle for a device's public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyExchangeStatus {
    None,
    Pending,
    Exchanged,
    Verified,
    Compromised,
}

/// The central record of a known remote peer. `avatar_ref` is a blob-store
/// key, not the avatar bytes themselves — the bytes live in the injected
/// `BlobStore`'s `avatars` collection, keyed by `peer_id`, matching the wire
/// shape `DeviceListEntry` also uses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub peer_id: PeerId,
    pub username: String,
    pub avatar_ref: Option<String>,
    pub last_heartbeat: u64,
    pub first_discovered: u64,
    pub user_info_version: u64,
    pub public_key: Option<PublicKey>,
    pub key_exchange_status: KeyExchangeStatus,
    pub is_bootstrap: bool,
    pub real_peer_id: Option<PeerId>,
}

impl Device {
    pub fn new(peer_id: PeerId, username: String, now: u64) -> Self {
        Self {
            peer_id,
            username,
            avatar_ref: None,
            last_heartbeat: now,
            first_discovered: now,
            user_info_version: 0,
            public_key: None,
            key_exchange_status: KeyExchangeStatus::None,
            is_bootstrap: false,
            real_peer_id: None,
        }
    }

    /// `is_online` is explicitly non-persistent and derived, so it is never
    /// a struct field — callers compute it against a threshold and the
    /// current time, the same shape `is_bootstrap`'s invariant check needs
    /// anyway.
    pub fn is_online(&self, now: u64, online_threshold: Duration) -> bool {
        now.saturating_sub(self.last_heartbeat) < online_threshold.as_millis() as u64
    }

    pub fn to_wire(&self) -> DeviceListEntry {
        DeviceListEntry {
            peer_id: self.peer_id.clone(),
            username: self.username.clone(),
            avatar_ref: self.avatar_ref.clone(),
            last_heartbeat: self.last_heartbeat,
            first_discovered: self.first_discovered,
            user_info_version: self.user_info_version,
            public_key: self.public_key.clone(),
        }
    }

    pub fn from_wire(entry: DeviceListEntry) -> Self {
        Self {
            peer_id: entry.peer_id,
            username: entry.username,
            avatar_ref: entry.avatar_ref,
            last_heartbeat: entry.last_heartbeat,
            first_discovered: entry.first_discovered,
            user_info_version: entry.user_info_version,
            public_key: entry.public_key,
            key_exchange_status: KeyExchangeStatus::None,
            is_bootstrap: false,
            real_peer_id: None,
        }
    }
}

enum Command {
    AddOrUpdate(Device, oneshot::Sender<()>),
    AddDevices(Vec<Device>, oneshot::Sender<()>),
    Remove(PeerId, oneshot::Sender<()>),
    Get(PeerId, oneshot::Sender<Option<Device>>),
    Snapshot(oneshot::Sender<Vec<Device>>),
    SetKeyExchangeStatus(PeerId, KeyExchangeStatus, oneshot::Sender<()>),
    SetPublicKey(PeerId, PublicKey, oneshot::Sender<()>),
    SetBootstrap(PeerId, PeerId, oneshot::Sender<()>),
    /// Apply a `user_info_query`/`response`/`update` triple's payload,
    /// subject to the no-rollback rule: applied only if `version` is
    /// strictly greater than what's on file for this peer.
    UpdateUserInfo(PeerId, String, Option<String>, u64, oneshot::Sender<()>),
    /// Recompute `is_online` for every device and expire anything past the
    /// 3-day threshold. Returns the expired peer ids.
    Maintain(oneshot::Sender<Vec<PeerId>>),
    SetAvatar(PeerId, Vec<u8>, oneshot::Sender<()>),
    GetAvatar(PeerId, oneshot::Sender<Option<Vec<u8>>>),
}

/// The only way to reach the device registry's state; cheap to clone, wraps
/// an `mpsc::Sender`. Every method sends a command and awaits its reply,
/// giving callers synchronous-looking semantics over the owner task.
#[derive(Clone)]
pub struct DeviceRegistryHandle {
    tx: mpsc::Sender<Command>,
}

impl DeviceRegistryHandle {
    /// Spawn the owner task, seeded from whatever was previously persisted.
    pub fn spawn(kv: Arc<dyn KvStore>, blobs: Arc<dyn BlobStore>, config: EngineConfig) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(run(rx, kv, blobs, config));
        Self { tx }
    }

    pub async fn add_or_update(&self, device: Device) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(Command::AddOrUpdate(device, reply_tx)).await;
        let _ = reply_rx.await;
    }

    pub async fn add_devices(&self, devices: Vec<Device>) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(Command::AddDevices(devices, reply_tx)).await;
        let _ = reply_rx.await;
    }

    pub async fn remove(&self, peer_id: PeerId) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(Command::Remove(peer_id, reply_tx)).await;
        let _ = reply_rx.await;
    }

    pub async fn get(&self, peer_id: PeerId) -> Option<Device> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(Command::Get(peer_id, reply_tx)).await;
        reply_rx.await.unwrap_or(None)
    }

    pub async fn snapshot(&self) -> Vec<Device> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(Command::Snapshot(reply_tx)).await;
        reply_rx.await.unwrap_or_default()
    }

    pub async fn set_key_exchange_status(&self, peer_id: PeerId, status: KeyExchangeStatus) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self
            .tx
            .send(Command::SetKeyExchangeStatus(peer_id, status, reply_tx))
            .await;
        let _ = reply_rx.await;
    }

    pub async fn set_public_key(&self, peer_id: PeerId, key: PublicKey) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(Command::SetPublicKey(peer_id, key, reply_tx)).await;
        let _ = reply_rx.await;
    }

    /// Mark `peer_id` as acting bootstrap for the well-known id
    /// `real_peer_id`.
    pub async fn set_bootstrap(&self, peer_id: PeerId, real_peer_id: PeerId) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self
            .tx
            .send(Command::SetBootstrap(peer_id, real_peer_id, reply_tx))
            .await;
        let _ = reply_rx.await;
    }

    /// Apply a peer's advertised username/avatar/version, ignoring it if
    /// `version` is not newer than what's already on file.
    pub async fn update_user_info(&self, peer_id: PeerId, username: String, avatar_ref: Option<String>, version: u64) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self
            .tx
            .send(Command::UpdateUserInfo(peer_id, username, avatar_ref, version, reply_tx))
            .await;
        let _ = reply_rx.await;
    }

    /// Run one periodic maintenance pass: recompute online status for all
    /// devices, expire anything past the 3-day threshold. Returns the ids
    /// that were expired and removed.
    pub async fn maintain(&self) -> Vec<PeerId> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(Command::Maintain(reply_tx)).await;
        reply_rx.await.unwrap_or_default()
    }

    /// Persist an avatar and set `avatar_ref` to the peer's id, the blob
    /// store key used for this collection.
    pub async fn set_avatar(&self, peer_id: PeerId, bytes: Vec<u8>) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(Command::SetAvatar(peer_id, bytes, reply_tx)).await;
        let _ = reply_rx.await;
    }

    pub async fn get_avatar(&self, peer_id: PeerId) -> Option<Vec<u8>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(Command::GetAvatar(peer_id, reply_tx)).await;
        reply_rx.await.unwrap_or(None)
    }
}

struct State {
    devices: HashMap<PeerId, Device>,
    kv: Arc<dyn KvStore>,
    blobs: Arc<dyn BlobStore>,
    config: EngineConfig,
}

impl State {
    fn recompute_online(&mut self, peer_id: &PeerId, now: u64) {
        let online_threshold = self.config.online_threshold;
        if let Some(device) = self.devices.get_mut(peer_id) {
            if !device.is_online(now, online_threshold) {
                device.is_bootstrap = false;
                device.real_peer_id = None;
            }
        }
    }

    fn add_or_update(&mut self, incoming: Device, now: u64) {
        let peer_id = incoming.peer_id.clone();
        match self.devices.get(&peer_id).cloned() {
            None => {
                let mut device = incoming;
                if device.first_discovered == 0 {
                    device.first_discovered = now;
                }
                self.devices.insert(peer_id.clone(), device);
            }
            Some(mut existing) => {
                existing.username = incoming.username;
                existing.avatar_ref = incoming.avatar_ref;
                existing.last_heartbeat = existing.last_heartbeat.max(incoming.last_heartbeat);
                self.devices.insert(peer_id.clone(), existing);
            }
        }
        self.recompute_online(&peer_id, now);
    }

    fn add_devices(&mut self, incoming_list: Vec<Device>, now: u64) {
        for incoming in incoming_list {
            let peer_id = incoming.peer_id.clone();
            match self.devices.get(&peer_id).cloned() {
                None => {
                    let mut device = incoming;
                    if device.first_discovered == 0 {
                        device.first_discovered = now;
                    }
                    self.devices.insert(peer_id.clone(), device);
                }
                Some(mut existing) => {
                    if !incoming.username.is_empty() {
                        existing.username = incoming.username;
                    }
                    if incoming.avatar_ref.is_some() {
                        existing.avatar_ref = incoming.avatar_ref;
                    }
                    existing.last_heartbeat = existing.last_heartbeat.max(incoming.last_heartbeat);
                    self.devices.insert(peer_id.clone(), existing);
                }
            }
            self.recompute_online(&peer_id, now);
        }
    }

    fn maintain(&mut self, now: u64) -> Vec<PeerId> {
        let expiry_threshold = self.config.expiry_threshold;

        let peer_ids: Vec<PeerId> = self.devices.keys().cloned().collect();
        for peer_id in &peer_ids {
            self.recompute_online(peer_id, now);
        }

        let expired: Vec<PeerId> = self
            .devices
            .values()
            .filter(|d| now.saturating_sub(d.last_heartbeat) > expiry_threshold.as_millis() as u64)
            .map(|d| d.peer_id.clone())
            .collect();
        for peer_id in &expired {
            self.devices.remove(peer_id);
        }
        expired
    }

    async fn persist(&self) {
        let records: Vec<Device> = self.devices.values().cloned().collect();
        let result = (|| -> Result<Vec<u8>, crate::error::EngineError> {
            postcard::to_stdvec(&records).map_err(crate::error::EngineError::serialization)
        })();
        match result {
            Ok(bytes) => {
                let encoded = encode_record(&bytes);
                swallow("persist device registry", self.kv.set(DEVICES_STORAGE_KEY, encoded).await);
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode device registry for persistence");
            }
        }
    }
}

/// Reload the device registry's last-persisted state. `is_online` is always
/// recomputed by the caller (it's never stored); `is_bootstrap` resets to
/// `false` on every device.
async fn load(kv: &Arc<dyn KvStore>) -> Vec<Device> {
    let stored = match kv.get(DEVICES_STORAGE_KEY).await {
        Ok(Some(value)) => value,
        _ => return Vec::new(),
    };
    let bytes = match decode_record(&stored) {
        Ok(bytes) => bytes,
        Err(_) => return Vec::new(),
    };
    let mut records: Vec<Device> = postcard::from_bytes(&bytes).unwrap_or_default();
    for device in &mut records {
        device.is_bootstrap = false;
        device.real_peer_id = None;
    }
    records
}

async fn run(
    mut rx: mpsc::Receiver<Command>,
    kv: Arc<dyn KvStore>,
    blobs: Arc<dyn BlobStore>,
    config: EngineConfig,
) {
    let initial = load(&kv).await;
    let mut state = State {
        devices: initial.into_iter().map(|d| (d.peer_id.clone(), d)).collect(),
        kv,
        blobs,
        config,
    };

    while let Some(command) = rx.recv().await {
        match command {
            Command::AddOrUpdate(device, reply) => {
                state.add_or_update(device, now_millis());
                state.persist().await;
                let _ = reply.send(());
            }
            Command::AddDevices(devices, reply) => {
                state.add_devices(devices, now_millis());
                state.persist().await;
                let _ = reply.send(());
            }
            Command::Remove(peer_id, reply) => {
                state.devices.remove(&peer_id);
                state.persist().await;
                let _ = reply.send(());
            }
            Command::Get(peer_id, reply) => {
                let _ = reply.send(state.devices.get(&peer_id).cloned());
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(state.devices.values().cloned().collect());
            }
            Command::SetKeyExchangeStatus(peer_id, status, reply) => {
                if let Some(device) = state.devices.get_mut(&peer_id) {
                    device.key_exchange_status = status;
                }
                state.persist().await;
                let _ = reply.send(());
            }
            Command::SetPublicKey(peer_id, key, reply) => {
                if let Some(device) = state.devices.get_mut(&peer_id) {
                    device.public_key = Some(key);
                }
                state.persist().await;
                let _ = reply.send(());
            }
            Command::SetBootstrap(peer_id, real_peer_id, reply) => {
                let online_threshold = state.config.online_threshold;
                let now = now_millis();
                if let Some(device) = state.devices.get_mut(&peer_id) {
                    // is_bootstrap is false whenever is_online is false.
                    // Only a currently-online device can be marked as
                    // acting bootstrap.
                    if device.is_online(now, online_threshold) {
                        device.is_bootstrap = true;
                        device.real_peer_id = Some(real_peer_id);
                    }
                }
                state.persist().await;
                let _ = reply.send(());
            }
            Command::UpdateUserInfo(peer_id, username, avatar_ref, version, reply) => {
                if let Some(device) = state.devices.get_mut(&peer_id) {
                    if version > device.user_info_version {
                        device.username = username;
                        device.avatar_ref = avatar_ref;
                        device.user_info_version = version;
                    }
                    device.last_heartbeat = now_millis();
                }
                state.persist().await;
                let _ = reply.send(());
            }
            Command::Maintain(reply) => {
                let expired = state.maintain(now_millis());
                state.persist().await;
                let _ = reply.send(expired);
            }
            Command::SetAvatar(peer_id, bytes, reply) => {
                swallow(
                    "persist avatar",
                    state.blobs.set(AVATARS_COLLECTION, peer_id.as_str(), bytes).await,
                );
                if let Some(device) = state.devices.get_mut(&peer_id) {
                    device.avatar_ref = Some(peer_id.as_str().to_string());
                }
                state.persist().await;
                let _ = reply.send(());
            }
            Command::GetAvatar(peer_id, reply) => {
                let bytes = state
                    .blobs
                    .get(AVATARS_COLLECTION, peer_id.as_str())
                    .await
                    .unwrap_or(None);
                let _ = reply.send(bytes);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryBlobStore, InMemoryKvStore};

    fn handle() -> DeviceRegistryHandle {
        DeviceRegistryHandle::spawn(
            Arc::new(InMemoryKvStore::new()),
            Arc::new(InMemoryBlobStore::new()),
            EngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn add_or_update_inserts_new_device_as_online() {
        let registry = handle();
        let now = now_millis();
        let device = Device::new(PeerId::from("bob"), "Bob".to_string(), now);
        registry.add_or_update(device).await;

        let stored = registry.get(PeerId::from("bob")).await.unwrap();
        assert_eq!(stored.username, "Bob");
        assert!(stored.is_online(now, EngineConfig::default().online_threshold));
    }

    #[tokio::test]
    async fn add_or_update_keeps_max_of_stored_and_incoming_heartbeat() {
        let registry = handle();
        let now = now_millis();
        let mut first = Device::new(PeerId::from("bob"), "Bob".to_string(), now);
        first.last_heartbeat = now;
        registry.add_or_update(first).await;

        let mut stale_update = Device::new(PeerId::from("bob"), "Bob".to_string(), now);
        stale_update.last_heartbeat = now.saturating_sub(10_000);
        registry.add_or_update(stale_update).await;

        let stored = registry.get(PeerId::from("bob")).await.unwrap();
        assert_eq!(stored.last_heartbeat, now);
    }

    #[tokio::test]
    async fn bootstrap_flag_is_refused_for_an_offline_device() {
        let registry = handle();
        let now = now_millis();
        let online_threshold = EngineConfig::default().online_threshold.as_millis() as u64;

        let mut device = Device::new(PeerId::from("bob"), "Bob".to_string(), now);
        device.last_heartbeat = now - online_threshold - 1;
        registry.add_or_update(device).await;

        registry
            .set_bootstrap(PeerId::from("bob"), PeerId::from("universe-bootstrap"))
            .await;

        let stored = registry.get(PeerId::from("bob")).await.unwrap();
        assert!(!stored.is_bootstrap, "an offline device must never be marked bootstrap");
    }

    #[tokio::test]
    async fn maintain_expires_devices_past_the_expiry_threshold() {
        let registry = handle();
        let now = now_millis();
        let expiry = EngineConfig::default().expiry_threshold.as_millis() as u64;

        let mut stale = Device::new(PeerId::from("carol"), "Carol".to_string(), now);
        stale.last_heartbeat = now - expiry - 1;
        registry.add_or_update(stale).await;

        let mut fresh = Device::new(PeerId::from("dave"), "Dave".to_string(), now);
        fresh.last_heartbeat = now;
        registry.add_or_update(fresh).await;

        let expired = registry.maintain().await;
        assert_eq!(expired, vec![PeerId::from("carol")]);
        assert!(registry.get(PeerId::from("carol")).await.is_none());
        assert!(registry.get(PeerId::from("dave")).await.is_some());
    }

    #[tokio::test]
    async fn add_devices_preserves_first_discovered_for_existing_entries() {
        let registry = handle();
        let now = now_millis();
        let mut original = Device::new(PeerId::from("erin"), "Erin".to_string(), now);
        original.first_discovered = 100;
        registry.add_or_update(original).await;

        let mut incoming = Device::new(PeerId::from("erin"), "Erin2".to_string(), now);
        incoming.first_discovered = 999_999;
        registry.add_devices(vec![incoming]).await;

        let stored = registry.get(PeerId::from("erin")).await.unwrap();
        assert_eq!(stored.first_discovered, 100);
        assert_eq!(stored.username, "Erin2");
    }

    #[tokio::test]
    async fn persisted_state_round_trips_through_storage_with_bootstrap_reset() {
        let kv = Arc::new(InMemoryKvStore::new());
        let blobs: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::new());
        let registry =
            DeviceRegistryHandle::spawn(kv.clone() as Arc<dyn KvStore>, blobs.clone(), EngineConfig::default());

        let now = now_millis();
        registry.add_or_update(Device::new(PeerId::from("bob"), "Bob".to_string(), now)).await;
        registry.set_bootstrap(PeerId::from("bob"), PeerId::from("universe-bootstrap")).await;

        // A fresh registry reloading the same kv store should see the
        // device again, but with is_bootstrap reset to false.
        let reloaded = DeviceRegistryHandle::spawn(kv as Arc<dyn KvStore>, blobs, EngineConfig::default());
        let stored = reloaded.get(PeerId::from("bob")).await.unwrap();
        assert_eq!(stored.username, "Bob");
        assert!(!stored.is_bootstrap);
    }

    #[tokio::test]
    async fn update_user_info_ignores_a_stale_version() {
        let registry = handle();
        let now = now_millis();
        registry.add_or_update(Device::new(PeerId::from("bob"), "Bob".to_string(), now)).await;
        registry.update_user_info(PeerId::from("bob"), "Bobby".to_string(), None, 5).await;
        registry.update_user_info(PeerId::from("bob"), "Stale".to_string(), None, 3).await;

        let stored = registry.get(PeerId::from("bob")).await.unwrap();
        assert_eq!(stored.username, "Bobby");
        assert_eq!(stored.user_info_version, 5);
    }

    #[tokio::test]
    async fn avatar_bytes_round_trip_through_the_blob_store() {
        let registry = handle();
        let now = now_millis();
        registry.add_or_update(Device::new(PeerId::from("bob"), "Bob".to_string(), now)).await;
        registry.set_avatar(PeerId::from("bob"), vec![1, 2, 3]).await;

        let stored = registry.get(PeerId::from("bob")).await.unwrap();
        assert_eq!(stored.avatar_ref, Some("bob".to_string()));
        assert_eq!(registry.get_avatar(PeerId::from("bob")).await, Some(vec![1, 2, 3]));
    }
}
