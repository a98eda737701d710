//! Local user profile.
//!
//! Read by nearly every subsystem (discovery notifications carry the local
//! username/avatar/version; heartbeat queries and `user_info_update`
//! broadcasts carry the same triple) but written only when the embedding
//! application changes the local user's username or avatar. That
//! read-many/write-rarely shape is a plain `RwLock` rather than an owner
//! task, because reads vastly outnumber writes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::device::AVATARS_COLLECTION;
use crate::storage::{decode_record, encode_record, swallow, BlobStore, KvStore};
use crate::transport::PeerId;

/// Persisted-metadata key for the local user's profile.
pub const LOCAL_PROFILE_STORAGE_KEY: &str = "local-user-profile";
/// Blob-store id for the local user's own avatar, in the `avatars`
/// collection alongside peer avatars.
pub const MY_AVATAR_BLOB_ID: &str = "my-avatar";

/// The local user's profile. `avatar_ref` mirrors `Device`'s out-of-band
/// avatar convention: the bytes live in the `BlobStore`'s `avatars`
/// collection under [`MY_AVATAR_BLOB_ID`], not inline here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalUserProfile {
    pub username: String,
    pub avatar_ref: Option<String>,
    pub peer_id: Option<PeerId>,
    pub version: u64,
}

impl LocalUserProfile {
    fn new(username: String) -> Self {
        Self {
            username,
            avatar_ref: None,
            peer_id: None,
            version: 0,
        }
    }
}

/// Shared handle to the local profile. Cheap to clone (wraps an `Arc`).
#[derive(Clone)]
pub struct ProfileHandle {
    inner: Arc<RwLock<LocalUserProfile>>,
    kv: Arc<dyn KvStore>,
    blobs: Arc<dyn BlobStore>,
}

impl ProfileHandle {
    /// Load a previously-persisted profile, or seed a fresh one with
    /// `default_username` if this is the first run.
    pub async fn load_or_default(kv: Arc<dyn KvStore>, blobs: Arc<dyn BlobStore>, default_username: String) -> Self {
        let profile = match kv.get(LOCAL_PROFILE_STORAGE_KEY).await {
            Ok(Some(value)) => decode_record(&value)
                .ok()
                .and_then(|bytes| postcard::from_bytes::<LocalUserProfile>(&bytes).ok())
                .unwrap_or_else(|| LocalUserProfile::new(default_username.clone())),
            _ => LocalUserProfile::new(default_username),
        };
        Self {
            inner: Arc::new(RwLock::new(profile)),
            kv,
            blobs,
        }
    }

    async fn persist(&self, profile: &LocalUserProfile) {
        match postcard::to_stdvec(profile) {
            Ok(bytes) => {
                let encoded = encode_record(&bytes);
                swallow(
                    "persist local user profile",
                    self.kv.set(LOCAL_PROFILE_STORAGE_KEY, encoded).await,
                );
            }
            Err(err) => tracing::warn!(error = %err, "failed to encode local user profile for persistence"),
        }
    }

    pub async fn snapshot(&self) -> LocalUserProfile {
        self.inner.read().await.clone()
    }

    /// Record the transport-assigned local peer id once `open()` completes.
    /// Not a semantic profile change, so this never bumps `version`.
    pub async fn set_peer_id(&self, peer_id: PeerId) {
        let mut profile = self.inner.write().await;
        profile.peer_id = Some(peer_id);
        let snapshot = profile.clone();
        drop(profile);
        self.persist(&snapshot).await;
    }

    /// Update the username. Bumps `version` only if it actually changed,
    /// and returns the resulting profile so the caller can decide whether
    /// to broadcast.
    pub async fn update_username(&self, username: String) -> LocalUserProfile {
        let mut profile = self.inner.write().await;
        if profile.username != username {
            profile.username = username;
            profile.version += 1;
        }
        let snapshot = profile.clone();
        drop(profile);
        self.persist(&snapshot).await;
        snapshot
    }

    /// Replace the avatar (`None` clears it). Bumps `version` only on an
    /// actual change.
    pub async fn update_avatar(&self, bytes: Option<Vec<u8>>) -> LocalUserProfile {
        let new_ref = match &bytes {
            Some(data) => {
                swallow(
                    "persist local avatar",
                    self.blobs.set(AVATARS_COLLECTION, MY_AVATAR_BLOB_ID, data.clone()).await,
                );
                Some(MY_AVATAR_BLOB_ID.to_string())
            }
            None => {
                swallow(
                    "clear local avatar",
                    self.blobs.delete(AVATARS_COLLECTION, MY_AVATAR_BLOB_ID).await,
                );
                None
            }
        };

        let mut profile = self.inner.write().await;
        if profile.avatar_ref != new_ref {
            profile.avatar_ref = new_ref;
            profile.version += 1;
        }
        let snapshot = profile.clone();
        drop(profile);
        self.persist(&snapshot).await;
        snapshot
    }

    pub async fn avatar_bytes(&self) -> Option<Vec<u8>> {
        self.blobs.get(AVATARS_COLLECTION, MY_AVATAR_BLOB_ID).await.unwrap_or(None)
    }
}
