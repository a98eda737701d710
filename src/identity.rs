//! Identity & Key Store.
//!
//! Owns the local signing keypair's lifecycle and a cache of per-peer public
//! keys, and detects when a previously-seen peer's key changes. The
//! cryptographic primitive library itself (signing, verification, keypair
//! generation) is an injected capability — this module never touches actual
//! key material, only the opaque `PublicKey` bytes a `Signer` hands back.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::error::EngineError;
use crate::storage::{decode_record, encode_record, swallow, KvStore};
use crate::transport::PeerId;

/// Persisted-metadata key for the local keypair; sits alongside the local
/// user profile metadata in the small-value store.
pub const LOCAL_IDENTITY_STORAGE_KEY: &str = "local-identity";

/// An opaque public key. The engine stores and compares these byte-for-byte;
/// it never interprets the bytes as any particular curve or encoding — that
/// knowledge belongs to the injected `Signer`/verifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(Vec<u8>);

impl From<Vec<u8>> for PublicKey {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A handle to a locally-held private key. Opaque to the engine: it's
/// whatever the injected `Signer` needs to later produce signatures, and the
/// engine never inspects or serializes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivateKeyHandle(Vec<u8>);

impl From<Vec<u8>> for PrivateKeyHandle {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// The cryptographic primitive library's contract, as far as this engine is
/// concerned: it can mint new keypairs. Verification/signing of actual
/// message payloads is out of scope for the core engine; the engine's job is
/// key *lifecycle and continuity*, not transport-level authentication.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn generate_keypair(&self) -> (PublicKey, PrivateKeyHandle);
}

/// A deterministic `Signer` for tests: every "keypair" is just an
/// incrementing counter turned into bytes, so tests can assert on exact key
/// values instead of only on "some key was produced".
#[derive(Default)]
pub struct StaticSigner {
    counter: std::sync::atomic::AtomicU64,
}

#[async_trait]
impl Signer for StaticSigner {
    async fn generate_keypair(&self) -> (PublicKey, PrivateKeyHandle) {
        let n = self
            .counter
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let bytes = n.to_be_bytes().to_vec();
        (PublicKey::from(bytes.clone()), PrivateKeyHandle::from(bytes))
    }
}

/// Outcome of recording a newly-received peer public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRecordOutcome {
    /// No prior key was on file; the new key is now stored as `exchanged`.
    FirstExchange,
    /// The incoming key is byte-identical to the one already on file.
    Unchanged,
    /// The incoming key differs from the one on file. The caller (the key
    /// exchange layer) must consult the user before overwriting it; this
    /// module does not update the stored key itself in this case.
    ChangeDetected {
        old_public_key: PublicKey,
        new_public_key: PublicKey,
    },
}

/// Local keypair + per-peer public key cache.
///
/// Single-writer by construction: it's meant to be owned by one task (or
/// wrapped in the same owner-task pattern as the device registry) rather
/// than shared behind a lock, since nothing about key continuity needs
/// concurrent writers.
pub struct KeyStore<S: Signer> {
    signer: S,
    local_key: Option<(PublicKey, PrivateKeyHandle)>,
    local_key_version: u64,
    peer_keys: HashMap<PeerId, PublicKey>,
}

impl<S: Signer> KeyStore<S> {
    pub fn new(signer: S) -> Self {
        Self {
            signer,
            local_key: None,
            local_key_version: 0,
            peer_keys: HashMap::new(),
        }
    }

    /// Returns the local public key, generating a keypair lazily on first
    /// use.
    ///
    /// Persistence of the generated key is the caller's responsibility
    /// (typically the engine facade, which owns the `KvStore` handle) —
    /// this method only manages the in-memory lifecycle. Whether that
    /// persisted copy is encrypted or stored plain is a decision for
    /// whatever persists it, not this type.
    pub async fn ensure_local_keypair(&mut self) -> PublicKey {
        if self.local_key.is_none() {
            let pair = self.signer.generate_keypair().await;
            self.local_key = Some(pair);
        }
        self.local_key.as_ref().unwrap().0.clone()
    }

    /// Overwrite the local keypair and bump the local key-version counter.
    /// Stored peer public keys are untouched — regenerating our own key has
    /// no bearing on what we've recorded about others.
    pub async fn regenerate_local_keypair(&mut self) -> PublicKey {
        let pair = self.signer.generate_keypair().await;
        self.local_key_version += 1;
        let public = pair.0.clone();
        self.local_key = Some(pair);
        public
    }

    pub fn local_key_version(&self) -> u64 {
        self.local_key_version
    }

    /// Look up the stored public key for a peer, if any.
    pub fn peer_public_key(&self, peer_id: &PeerId) -> Option<&PublicKey> {
        self.peer_keys.get(peer_id)
    }

    /// Record a newly-received public key for `peer_id`: no prior key →
    /// `exchanged`; equal to prior → noop; different from prior →
    /// `change_detected`, and the stored key is left alone until the caller
    /// confirms the change (see `key_exchange.rs`).
    pub fn record_peer_public_key(
        &mut self,
        peer_id: PeerId,
        key: PublicKey,
    ) -> KeyRecordOutcome {
        match self.peer_keys.get(&peer_id) {
            None => {
                self.peer_keys.insert(peer_id, key);
                KeyRecordOutcome::FirstExchange
            }
            Some(existing) if *existing == key => KeyRecordOutcome::Unchanged,
            Some(existing) => KeyRecordOutcome::ChangeDetected {
                old_public_key: existing.clone(),
                new_public_key: key,
            },
        }
    }

    /// Apply a user's trust decision after a `ChangeDetected` outcome:
    /// overwrite the stored key with the new one. Called only when the user
    /// accepted the change.
    pub fn accept_key_change(&mut self, peer_id: PeerId, new_key: PublicKey) {
        self.peer_keys.insert(peer_id, new_key);
    }

    /// Explicit "storage_error on store failure is logged and swallowed"
    /// helper for call sites that want a uniform way to report that without
    /// duplicating the `tracing::warn!` + discard pattern everywhere.
    pub fn log_storage_error(context: &str, err: EngineError) {
        tracing::warn!(context, error = %err, "storage operation failed, continuing");
    }
}

#[async_trait]
impl Signer for Arc<dyn Signer> {
    async fn generate_keypair(&self) -> (PublicKey, PrivateKeyHandle) {
        (**self).generate_keypair().await
    }
}

/// Postcard-serializable snapshot of the local keypair, persisted under
/// [`LOCAL_IDENTITY_STORAGE_KEY`] so a restarted process doesn't mint a
/// fresh one on every launch.
#[derive(Serialize, Deserialize)]
struct LocalIdentityRecord {
    public: PublicKey,
    private: PrivateKeyHandle,
    version: u64,
}

enum Command {
    EnsureLocalKeypair(oneshot::Sender<PublicKey>),
    RegenerateLocalKeypair(oneshot::Sender<PublicKey>),
    LocalKeyVersion(oneshot::Sender<u64>),
    PeerPublicKey(PeerId, oneshot::Sender<Option<PublicKey>>),
    RecordPeerPublicKey(PeerId, PublicKey, oneshot::Sender<KeyRecordOutcome>),
    AcceptKeyChange(PeerId, PublicKey, oneshot::Sender<()>),
}

/// Task-owned handle to a `KeyStore`, the same shape as
/// `device::DeviceRegistryHandle`: the key store is single-writer, reached
/// concurrently by `key_exchange.rs`, `heartbeat.rs`, and the bootstrap
/// elector.
#[derive(Clone)]
pub struct KeyStoreHandle {
    tx: mpsc::Sender<Command>,
}

impl KeyStoreHandle {
    pub fn spawn(signer: Arc<dyn Signer>, kv: Arc<dyn KvStore>) -> Self {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(run(rx, signer, kv));
        Self { tx }
    }

    pub async fn ensure_local_keypair(&self) -> PublicKey {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(Command::EnsureLocalKeypair(reply_tx)).await;
        reply_rx.await.expect("key store task must not die while handles exist")
    }

    pub async fn regenerate_local_keypair(&self) -> PublicKey {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(Command::RegenerateLocalKeypair(reply_tx)).await;
        reply_rx.await.expect("key store task must not die while handles exist")
    }

    pub async fn local_key_version(&self) -> u64 {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(Command::LocalKeyVersion(reply_tx)).await;
        reply_rx.await.unwrap_or(0)
    }

    pub async fn peer_public_key(&self, peer_id: PeerId) -> Option<PublicKey> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(Command::PeerPublicKey(peer_id, reply_tx)).await;
        reply_rx.await.unwrap_or(None)
    }

    pub async fn record_peer_public_key(&self, peer_id: PeerId, key: PublicKey) -> KeyRecordOutcome {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self
            .tx
            .send(Command::RecordPeerPublicKey(peer_id, key, reply_tx))
            .await;
        reply_rx
            .await
            .expect("key store task must not die while handles exist")
    }

    pub async fn accept_key_change(&self, peer_id: PeerId, new_key: PublicKey) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self
            .tx
            .send(Command::AcceptKeyChange(peer_id, new_key, reply_tx))
            .await;
        let _ = reply_rx.await;
    }
}

async fn load(kv: &Arc<dyn KvStore>) -> Option<(PublicKey, PrivateKeyHandle, u64)> {
    let stored = match kv.get(LOCAL_IDENTITY_STORAGE_KEY).await {
        Ok(Some(value)) => value,
        _ => return None,
    };
    let bytes = decode_record(&stored).ok()?;
    let record: LocalIdentityRecord = postcard::from_bytes(&bytes).ok()?;
    Some((record.public, record.private, record.version))
}

async fn persist(kv: &Arc<dyn KvStore>, public: &PublicKey, private: &PrivateKeyHandle, version: u64) {
    let record = LocalIdentityRecord {
        public: public.clone(),
        private: private.clone(),
        version,
    };
    match postcard::to_stdvec(&record) {
        Ok(bytes) => {
            let encoded = encode_record(&bytes);
            swallow("persist local identity", kv.set(LOCAL_IDENTITY_STORAGE_KEY, encoded).await);
        }
        Err(err) => tracing::warn!(error = %err, "failed to encode local identity for persistence"),
    }
}

async fn run(mut rx: mpsc::Receiver<Command>, signer: Arc<dyn Signer>, kv: Arc<dyn KvStore>) {
    let mut store = KeyStore::new(signer);
    if let Some((public, private, version)) = load(&kv).await {
        store.local_key = Some((public, private));
        store.local_key_version = version;
    }

    while let Some(command) = rx.recv().await {
        match command {
            Command::EnsureLocalKeypair(reply) => {
                let is_new = store.local_key.is_none();
                let public = store.ensure_local_keypair().await;
                if is_new {
                    let private = store.local_key.as_ref().unwrap().1.clone();
                    persist(&kv, &public, &private, store.local_key_version).await;
                }
                let _ = reply.send(public);
            }
            Command::RegenerateLocalKeypair(reply) => {
                let public = store.regenerate_local_keypair().await;
                let private = store.local_key.as_ref().unwrap().1.clone();
                persist(&kv, &public, &private, store.local_key_version).await;
                let _ = reply.send(public);
            }
            Command::LocalKeyVersion(reply) => {
                let _ = reply.send(store.local_key_version());
            }
            Command::PeerPublicKey(peer_id, reply) => {
                let _ = reply.send(store.peer_public_key(&peer_id).cloned());
            }
            Command::RecordPeerPublicKey(peer_id, key, reply) => {
                let outcome = store.record_peer_public_key(peer_id, key);
                let _ = reply.send(outcome);
            }
            Command::AcceptKeyChange(peer_id, new_key, reply) => {
                store.accept_key_change(peer_id, new_key);
                let _ = reply.send(());
            }
        }
    }
}
