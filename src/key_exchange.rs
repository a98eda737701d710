//! Key Exchange & Continuity.
//!
//! Drives `key_exchange_request`/`key_exchange_response`, feeds results
//! through the Identity & Key Store's continuity check (`identity.rs`), and
//! on a detected key change enqueues a `KeyChangeEvent` into a one-at-a-time
//! user-decision queue: a `tokio::sync::oneshot` the embedding application
//! answers, fed through an `mpsc` the application drains, which is naturally
//! FIFO for a single consumer.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::device::{DeviceRegistryHandle, KeyExchangeStatus};
use crate::error::EngineError;
use crate::identity::{KeyRecordOutcome, KeyStoreHandle, PublicKey};
use crate::protocol::{Frame, FrameBody, FrameType};
use crate::router::RequestRouter;
use crate::time::now_millis;
use crate::transport::{PeerId, TransportAdapter};

/// A detected public-key change for a peer, awaiting a user trust decision.
/// Dropping this without sending on `decision` leaves the device parked at
/// `key_exchange_status = pending` forever, which is an acceptable (if
/// inert) outcome — the engine itself never times out a pending trust
/// decision.
#[derive(Debug)]
pub struct KeyChangeEvent {
    pub peer_id: PeerId,
    pub old_public_key: PublicKey,
    pub new_public_key: PublicKey,
    pub decision: oneshot::Sender<bool>,
}

pub struct KeyExchangeService {
    adapter: Arc<TransportAdapter>,
    router: Arc<RequestRouter>,
    keys: KeyStoreHandle,
    devices: DeviceRegistryHandle,
    events: mpsc::UnboundedSender<KeyChangeEvent>,
    request_timeout: std::time::Duration,
}

impl KeyExchangeService {
    pub fn new(
        adapter: Arc<TransportAdapter>,
        router: Arc<RequestRouter>,
        keys: KeyStoreHandle,
        devices: DeviceRegistryHandle,
        request_timeout: std::time::Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<KeyChangeEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                adapter,
                router,
                keys,
                devices,
                events,
                request_timeout,
            }),
            events_rx,
        )
    }

    fn local_id(&self) -> PeerId {
        self.adapter.local_id().unwrap_or_else(|| PeerId::from("<unbound>"))
    }

    /// Initiate (or re-initiate) a key exchange with `peer_id`, on first
    /// contact or on a user-triggered re-exchange.
    pub async fn initiate(&self, peer_id: PeerId) -> Result<(), EngineError> {
        self.devices.set_key_exchange_status(peer_id.clone(), KeyExchangeStatus::Pending).await;
        let local_public = self.keys.ensure_local_keypair().await;
        let frame = Frame::new(
            self.local_id(),
            peer_id.clone(),
            now_millis(),
            FrameBody::KeyExchangeRequest { public_key: local_public },
        );
        self.adapter.send_frame(&peer_id, frame).await?;

        let response = self
            .router
            .wait_for(FrameType::KeyExchangeResponse, peer_id.clone(), self.request_timeout)
            .await?;
        if let FrameBody::KeyExchangeResponse { public_key } = response.body {
            self.apply_peer_key(peer_id, public_key).await;
        }
        Ok(())
    }

    /// Inbound `key_exchange_request`: reply with our own public key, then
    /// run the same continuity check against the requester's key.
    pub async fn handle_request(&self, frame: Frame) {
        let from = frame.from.clone();
        let FrameBody::KeyExchangeRequest { public_key } = frame.body else {
            return;
        };

        let local_public = self.keys.ensure_local_keypair().await;
        let reply = Frame::new(
            self.local_id(),
            from.clone(),
            now_millis(),
            FrameBody::KeyExchangeResponse { public_key: local_public },
        );
        if let Err(err) = self.adapter.send_frame(&from, reply).await {
            tracing::debug!(error = %err, peer = %from, "key_exchange_response failed to send");
        }

        self.apply_peer_key(from, public_key).await;
    }

    /// Feed a peer's public key through the continuity check and update the
    /// device registry / user-decision queue accordingly.
    async fn apply_peer_key(&self, peer_id: PeerId, key: PublicKey) {
        match self.keys.record_peer_public_key(peer_id.clone(), key.clone()).await {
            KeyRecordOutcome::FirstExchange => {
                self.devices.set_public_key(peer_id.clone(), key).await;
                self.devices
                    .set_key_exchange_status(peer_id, KeyExchangeStatus::Exchanged)
                    .await;
            }
            KeyRecordOutcome::Unchanged => {
                // No dialog, no status change — a key that round-trips to
                // the same bytes is classified unchanged, not a change.
            }
            KeyRecordOutcome::ChangeDetected { old_public_key, new_public_key } => {
                self.devices
                    .set_key_exchange_status(peer_id.clone(), KeyExchangeStatus::Pending)
                    .await;
                let (decision_tx, decision_rx) = oneshot::channel();
                let event = KeyChangeEvent {
                    peer_id: peer_id.clone(),
                    old_public_key,
                    new_public_key: new_public_key.clone(),
                    decision: decision_tx,
                };
                if self.events.send(event).is_err() {
                    tracing::warn!(peer = %peer_id, "no listener for key-change events; leaving status pending");
                    return;
                }

                let keys = self.keys.clone();
                let devices = self.devices.clone();
                tokio::spawn(async move {
                    match decision_rx.await {
                        Ok(true) => {
                            keys.accept_key_change(peer_id.clone(), new_public_key.clone()).await;
                            devices.set_public_key(peer_id.clone(), new_public_key).await;
                            devices.set_key_exchange_status(peer_id, KeyExchangeStatus::Verified).await;
                        }
                        Ok(false) => {
                            devices.set_key_exchange_status(peer_id, KeyExchangeStatus::Compromised).await;
                        }
                        Err(_) => {
                            tracing::debug!(%peer_id, "key-change decision channel dropped without an answer");
                        }
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::identity::{Signer, StaticSigner};
    use crate::storage::{InMemoryBlobStore, InMemoryKvStore, KvStore};
    use crate::transport::fake::{FakeNetwork, FakeTransport};

    fn registry() -> DeviceRegistryHandle {
        DeviceRegistryHandle::spawn(
            Arc::new(InMemoryKvStore::new()),
            Arc::new(InMemoryBlobStore::new()),
            EngineConfig::default(),
        )
    }

    fn signer() -> Arc<dyn Signer> {
        Arc::new(StaticSigner::default())
    }

    struct Fixture {
        alice: Arc<KeyExchangeService>,
        alice_events: mpsc::UnboundedReceiver<KeyChangeEvent>,
        bob: Arc<KeyExchangeService>,
    }

    async fn fixture() -> Fixture {
        let network = FakeNetwork::new();
        let alice_adapter = Arc::new(TransportAdapter::new(FakeTransport::new(network.clone())));
        let bob_adapter = Arc::new(TransportAdapter::new(FakeTransport::new(network.clone())));

        let alice_router = Arc::new(RequestRouter::new());
        let bob_router = Arc::new(RequestRouter::new());

        let alice_kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let bob_kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());

        let (alice, alice_events) = KeyExchangeService::new(
            alice_adapter.clone(),
            alice_router.clone(),
            KeyStoreHandle::spawn(signer(), alice_kv),
            registry(),
            EngineConfig::default().request_timeout,
        );
        let (bob, _bob_events) = KeyExchangeService::new(
            bob_adapter.clone(),
            bob_router.clone(),
            KeyStoreHandle::spawn(signer(), bob_kv),
            registry(),
            EngineConfig::default().request_timeout,
        );

        for (adapter, router, svc) in [
            (&alice_adapter, &alice_router, alice.clone()),
            (&bob_adapter, &bob_router, bob.clone()),
        ] {
            let router = router.clone();
            adapter.register_handler(
                FrameType::KeyExchangeResponse,
                Arc::new(move |frame: Frame| {
                    router.resolve(frame);
                }),
            );
            let svc = svc.clone();
            adapter.register_handler(
                FrameType::KeyExchangeRequest,
                Arc::new(move |frame: Frame| {
                    let svc = svc.clone();
                    tokio::spawn(async move { svc.handle_request(frame).await });
                }),
            );
        }

        alice_adapter.open_as("alice").await.unwrap();
        bob_adapter.open_as("bob").await.unwrap();

        Fixture { alice, alice_events, bob }
    }

    #[tokio::test]
    async fn first_exchange_marks_device_exchanged() {
        let f = fixture().await;
        f.alice.initiate(PeerId::from("bob")).await.unwrap();

        let stored = f.alice.devices.get(PeerId::from("bob")).await.unwrap();
        assert_eq!(stored.key_exchange_status, KeyExchangeStatus::Exchanged);
        assert!(stored.public_key.is_some());
    }

    #[tokio::test]
    async fn unchanged_key_on_re_exchange_produces_no_event() {
        let f = fixture().await;
        f.alice.initiate(PeerId::from("bob")).await.unwrap();
        f.alice.initiate(PeerId::from("bob")).await.unwrap();

        // Still exchanged, not bumped to pending/verified by a no-op re-send.
        let stored = f.alice.devices.get(PeerId::from("bob")).await.unwrap();
        assert_eq!(stored.key_exchange_status, KeyExchangeStatus::Exchanged);
    }

    #[tokio::test]
    async fn key_change_enqueues_event_and_refusal_marks_compromised() {
        let mut f = fixture().await;
        f.alice.initiate(PeerId::from("bob")).await.unwrap();

        // Bob regenerates his keypair (simulated directly since the Signer
        // fake is deterministic only per-instance) and re-initiates.
        let new_key = PublicKey::from(vec![200, 201, 202]);
        // Directly drive alice's continuity check with a changed key, as if
        // bob's key_exchange_response carried it.
        f.alice.apply_peer_key(PeerId::from("bob"), new_key.clone()).await;

        let event = f.alice_events.recv().await.expect("a KeyChangeEvent should have been enqueued");
        assert_eq!(event.peer_id, PeerId::from("bob"));
        let _ = event.decision.send(false);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let stored = f.alice.devices.get(PeerId::from("bob")).await.unwrap();
        assert_eq!(stored.key_exchange_status, KeyExchangeStatus::Compromised);
        // The stored key must remain the original, untrusted one.
        assert_ne!(stored.public_key, Some(new_key));
    }
}
