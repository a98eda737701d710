//! The public facade: wires every subsystem module onto one pair of
//! `Transport` instances and exposes the operations an embedding
//! application actually calls.
//!
//! Two separate `Transport` instances are required at construction: `main`
//! is this process's ordinary, anonymously-bound identity, used for
//! everything except the bootstrap rendezvous; `rendezvous` is a second,
//! not-yet-opened binding dedicated to contending for the well-known
//! bootstrap id (see `bootstrap.rs`'s module doc for why these can't share
//! one `Transport`). An embedder backed by a single physical connector
//! supplies two independent bindings over it (e.g. two WebRTC data channel
//! managers, or two calls to whatever factory produces a bound `Transport`).

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::bootstrap::{self, ElectionOutcome};
use crate::config::EngineConfig;
use crate::device::{Device, DeviceRegistryHandle};
use crate::discovery::{DiscoveryEvent, DiscoveryService};
use crate::error::EngineError;
use crate::heartbeat::HeartbeatService;
use crate::identity::{KeyStoreHandle, PublicKey, Signer};
use crate::key_exchange::{KeyChangeEvent, KeyExchangeService};
use crate::message_engine::{MessageEngineHandle, MessageEvent};
use crate::profile::{LocalUserProfile, ProfileHandle};
use crate::protocol::{Frame, FrameBody, FrameType, MessageId, MsgType};
use crate::registry::Handler;
use crate::router::RequestRouter;
use crate::storage::{BlobStore, KvStore};
use crate::time::now_millis;
use crate::transport::{PeerId, Transport, TransportAdapter};

/// Event streams the embedding application drains after [`Engine::start`] —
/// only a handful of things reach the user directly; everything else is
/// handled internally and only surfaces through the device/profile state.
pub struct EngineEvents {
    pub messages: mpsc::UnboundedReceiver<MessageEvent>,
    pub discovery: mpsc::UnboundedReceiver<DiscoveryEvent>,
    pub key_changes: mpsc::UnboundedReceiver<KeyChangeEvent>,
}

/// The assembled engine. Every field is a cheaply-`Clone`able handle, so
/// `Engine` itself is cheap to clone and hand to multiple call sites.
#[derive(Clone)]
pub struct Engine {
    main_adapter: Arc<TransportAdapter>,
    router: Arc<RequestRouter>,
    devices: DeviceRegistryHandle,
    keys: KeyStoreHandle,
    profile: ProfileHandle,
    messages: MessageEngineHandle,
    discovery: Arc<DiscoveryService>,
    key_exchange: Arc<KeyExchangeService>,
    heartbeat: Arc<HeartbeatService>,
    config: EngineConfig,
}

impl Engine {
    /// Assemble every subsystem and register all inbound handlers, but do
    /// not open the transport yet — call [`Engine::start`] once the caller
    /// is ready to come online. Handlers must be registered before `open()`
    /// completes, so early frames aren't missed.
    pub async fn new(
        config: EngineConfig,
        main_transport: Arc<dyn Transport>,
        kv: Arc<dyn KvStore>,
        blobs: Arc<dyn BlobStore>,
        signer: Arc<dyn Signer>,
        default_username: String,
    ) -> Result<(Self, EngineEvents), EngineError> {
        config.validate()?;

        let main_adapter = Arc::new(TransportAdapter::new(main_transport));
        let router = Arc::new(RequestRouter::new());
        let devices = DeviceRegistryHandle::spawn(kv.clone(), blobs.clone(), config.clone());
        let keys = KeyStoreHandle::spawn(signer, kv.clone());
        let profile = ProfileHandle::load_or_default(kv.clone(), blobs.clone(), default_username).await;

        let (messages, message_events) = MessageEngineHandle::spawn(
            // `local_id` is unknown until `open()` completes; handlers that
            // need to stamp an outbound frame's `from` read it from the
            // adapter lazily instead, so an `<unbound>` placeholder here
            // never actually reaches the wire.
            PeerId::from("<unbound>"),
            main_adapter.clone(),
            blobs.clone(),
            kv.clone(),
            config.clone(),
        );
        let (discovery, discovery_events) =
            DiscoveryService::new(main_adapter.clone(), router.clone(), devices.clone(), config.clone());
        let (key_exchange, key_change_events) = KeyExchangeService::new(
            main_adapter.clone(),
            router.clone(),
            keys.clone(),
            devices.clone(),
            config.request_timeout,
        );
        let heartbeat = HeartbeatService::new(
            main_adapter.clone(),
            router.clone(),
            devices.clone(),
            profile.clone(),
            config.clone(),
        );

        register_handlers(&main_adapter, &router, &messages, &discovery, &key_exchange, &heartbeat, &profile);

        // Opportunistic retry trigger: any inbound frame at all from a peer
        // is evidence it's reachable again, so nudge the message
        // engine to retry whatever's still queued for that peer.
        {
            let messages_for_liveness = messages.clone();
            main_adapter.on_every_frame(Arc::new(move |frame: Frame| {
                let messages = messages_for_liveness.clone();
                let from = frame.from.clone();
                tokio::spawn(async move { messages.note_liveness(from).await });
            }));
        }

        let engine = Self {
            main_adapter,
            router,
            devices,
            keys,
            profile,
            messages,
            discovery,
            key_exchange,
            heartbeat,
            config,
        };
        let events = EngineEvents {
            messages: message_events,
            discovery: discovery_events,
            key_changes: key_change_events,
        };
        Ok((engine, events))
    }

    /// Open the main transport binding, record the assigned peer id on the
    /// local profile, and spawn the heartbeat's periodic liveness sweep.
    /// Must be called exactly once.
    pub async fn open(&self) -> Result<PeerId, EngineError> {
        let local_id = self.main_adapter.open().await?;
        self.profile.set_peer_id(local_id.clone()).await;
        tokio::spawn(self.heartbeat.clone().run_periodic());
        Ok(local_id)
    }

    /// Run the bootstrap election against a second, distinct `Transport`
    /// instance dedicated to the well-known rendezvous id. Must
    /// be called after [`Engine::open`], since the client branch needs the
    /// main adapter's assigned id to announce itself.
    pub async fn elect_bootstrap(&self, rendezvous_transport: Arc<dyn Transport>) -> ElectionOutcome {
        let rendezvous_adapter = Arc::new(TransportAdapter::new(rendezvous_transport));
        let profile = self.profile.snapshot().await;
        bootstrap::elect(
            rendezvous_adapter,
            self.main_adapter.clone(),
            self.router.clone(),
            self.devices.clone(),
            profile.username,
            profile.avatar_ref,
        )
        .await
    }

    /// Send a chat message (step 1 of the five-step protocol). Callers typically mint
    /// `message_id` with [`MessageId::new_random`] unless the embedding
    /// application already has an identifier for it.
    pub async fn send_message(
        &self,
        to: PeerId,
        message_id: MessageId,
        content: Vec<u8>,
        msg_type: MsgType,
        max_retries: Option<u32>,
    ) {
        self.messages
            .send_message(to, message_id, content, msg_type, max_retries)
            .await;
    }

    /// Active discovery: the user typed in a peer id directly.
    pub async fn discover_peer(&self, target: PeerId) {
        let profile = self.profile.snapshot().await;
        self.discovery
            .discover_peer(target, profile.username, profile.avatar_ref, profile.version)
            .await;
    }

    /// Query every known device, online or not, for renewed liveness.
    pub async fn manual_refresh(&self) {
        self.discovery.manual_refresh().await;
    }

    /// Initiate (or re-initiate) a key exchange with a peer.
    pub async fn initiate_key_exchange(&self, peer_id: PeerId) -> Result<(), EngineError> {
        self.key_exchange.initiate(peer_id).await
    }

    /// Update the local username, broadcasting the change to every known
    /// device if it actually changed.
    pub async fn update_username(&self, username: String) {
        let before = self.profile.snapshot().await.version;
        let after = self.profile.update_username(username).await;
        if after.version != before {
            self.heartbeat.broadcast_profile_update().await;
        }
    }

    /// Replace (or clear, with `None`) the local avatar, broadcasting the
    /// change if it actually changed.
    pub async fn update_avatar(&self, bytes: Option<Vec<u8>>) {
        let before = self.profile.snapshot().await.version;
        let after = self.profile.update_avatar(bytes).await;
        if after.version != before {
            self.heartbeat.broadcast_profile_update().await;
        }
    }

    pub async fn profile(&self) -> LocalUserProfile {
        self.profile.snapshot().await
    }

    pub async fn known_devices(&self) -> Vec<Device> {
        self.devices.snapshot().await
    }

    pub async fn device(&self, peer_id: PeerId) -> Option<Device> {
        self.devices.get(peer_id).await
    }

    /// Run one device-registry maintenance pass: recompute online status,
    /// expire anything past the retention threshold.
    pub async fn maintain_devices(&self) -> Vec<PeerId> {
        self.devices.maintain().await
    }

    pub async fn peer_public_key(&self, peer_id: PeerId) -> Option<PublicKey> {
        self.keys.peer_public_key(peer_id).await
    }

    /// Overwrite the local signing keypair and bump its version counter.
    /// Stored peer public keys are untouched; every subsequent
    /// outbound `key_exchange_request` carries the new public key.
    pub async fn regenerate_local_keypair(&self) -> PublicKey {
        self.keys.regenerate_local_keypair().await
    }

    pub async fn local_key_version(&self) -> u64 {
        self.keys.local_key_version().await
    }

    pub fn local_id(&self) -> Option<PeerId> {
        self.main_adapter.local_id()
    }
}

/// Answer a `username_query` directly with the local profile's current
/// username and avatar. This pair predates `user_info_query`/`response` and
/// carries no version number, so it's wired as a one-line responder here
/// rather than through `heartbeat.rs`'s no-rollback machinery — see
/// DESIGN.md.
fn register_username_query_handler(adapter: &Arc<TransportAdapter>, profile: &ProfileHandle) {
    let adapter_for_reply = adapter.clone();
    let profile = profile.clone();
    adapter.register_handler(
        FrameType::UsernameQuery,
        Arc::new(move |frame: Frame| {
            let adapter = adapter_for_reply.clone();
            let profile = profile.clone();
            tokio::spawn(async move {
                let local_id = adapter.local_id().unwrap_or_else(|| PeerId::from("<unbound>"));
                let snapshot = profile.snapshot().await;
                let reply = Frame::new(
                    local_id,
                    frame.from.clone(),
                    now_millis(),
                    FrameBody::UsernameResponse {
                        username: snapshot.username,
                        avatar: snapshot.avatar_ref,
                    },
                );
                let _ = adapter.send_frame(&frame.from, reply).await;
            });
        }),
    );
}

/// Wire every subsystem's inbound frame handling onto the main adapter.
/// Must run before [`Engine::open`].
#[allow(clippy::too_many_arguments)]
fn register_handlers(
    adapter: &Arc<TransportAdapter>,
    router: &Arc<RequestRouter>,
    messages: &MessageEngineHandle,
    discovery: &Arc<DiscoveryService>,
    key_exchange: &Arc<KeyExchangeService>,
    heartbeat: &Arc<HeartbeatService>,
    profile: &ProfileHandle,
) {
    // Five-step chat delivery: the message engine owns its own protocol
    // state machine and never needs request/response correlation.
    for tag in [
        FrameType::MessageId,
        FrameType::RequestContent,
        FrameType::MessageContent,
        FrameType::DeliveryAck,
    ] {
        let engine = messages.clone();
        adapter.register_handler(
            tag,
            Arc::new(move |frame: Frame| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.handle_inbound(frame).await });
            }),
        );
    }

    // Discovery gossip. DiscoveryNotification/DeviceListRequest are always
    // unsolicited inbound events; DiscoveryResponse/DeviceListResponse are
    // awaited via `RequestRouter::wait_for` by the code that sent the
    // matching request, but may also arrive unsolicited (a pushed device
    // list), so each tries the router first and falls back to the
    // service's own unsolicited handler.
    {
        let local_username_source = profile.clone();
        let svc = discovery.clone();
        adapter.register_handler(
            FrameType::DiscoveryNotification,
            Arc::new(move |frame: Frame| {
                let svc = svc.clone();
                let profile = local_username_source.clone();
                tokio::spawn(async move {
                    let snapshot = profile.snapshot().await;
                    svc.handle_notification(frame, snapshot.username, snapshot.avatar_ref).await;
                });
            }),
        );
    }
    {
        let router = router.clone();
        let svc = discovery.clone();
        adapter.register_handler(
            FrameType::DiscoveryResponse,
            Arc::new(move |frame: Frame| {
                if !router.resolve(frame) {
                    // No active `discover_peer` waiter: an unsolicited
                    // discovery_response has no defined handling beyond
                    // request/response correlation, so it's dropped.
                    let _ = &svc;
                }
            }),
        );
    }
    adapter.register_handler(
        FrameType::DeviceListRequest,
        Arc::new({
            let svc = discovery.clone();
            move |frame: Frame| {
                let svc = svc.clone();
                tokio::spawn(async move { svc.handle_list_request(frame).await });
            }
        }),
    );
    {
        let router = router.clone();
        let svc = discovery.clone();
        adapter.register_handler(
            FrameType::DeviceListResponse,
            Arc::new(move |frame: Frame| {
                if router.resolve(frame.clone()) {
                    return;
                }
                let svc = svc.clone();
                tokio::spawn(async move { svc.handle_device_list_response(frame).await });
            }),
        );
    }

    // Heartbeat & profile sync.
    register_username_query_handler(adapter, profile);
    adapter.register_handler(FrameType::UsernameResponse, no_op_router_resolve(router.clone()));
    adapter.register_handler(
        FrameType::OnlineCheckQuery,
        Arc::new({
            let svc = heartbeat.clone();
            move |frame: Frame| {
                let svc = svc.clone();
                tokio::spawn(async move { svc.handle_online_check_query(frame).await });
            }
        }),
    );
    adapter.register_handler(FrameType::OnlineCheckResponse, no_op_router_resolve(router.clone()));
    adapter.register_handler(
        FrameType::UserInfoQuery,
        Arc::new({
            let svc = heartbeat.clone();
            move |frame: Frame| {
                let svc = svc.clone();
                tokio::spawn(async move { svc.handle_user_info_query(frame).await });
            }
        }),
    );
    adapter.register_handler(FrameType::UserInfoResponse, no_op_router_resolve(router.clone()));
    adapter.register_handler(
        FrameType::UserInfoUpdate,
        Arc::new({
            let svc = heartbeat.clone();
            move |frame: Frame| {
                let svc = svc.clone();
                tokio::spawn(async move { svc.handle_user_info_update(frame).await });
            }
        }),
    );

    // Key exchange & continuity.
    adapter.register_handler(
        FrameType::KeyExchangeRequest,
        Arc::new({
            let svc = key_exchange.clone();
            move |frame: Frame| {
                let svc = svc.clone();
                tokio::spawn(async move { svc.handle_request(frame).await });
            }
        }),
    );
    adapter.register_handler(FrameType::KeyExchangeResponse, no_op_router_resolve(router.clone()));

    // RelayMessage/RelayResponse/NetworkAccelerationStatus: intentionally
    // left unregistered. They fall through to the registry's "no handler
    // for this tag" drop-and-log path — see DESIGN.md.
}

/// A handler that only ever resolves a pending `RequestRouter` waiter. Used
/// for response-only tags where the only defined reaction is "whoever sent
/// the matching request is waiting for this".
fn no_op_router_resolve(router: Arc<RequestRouter>) -> Handler {
    Arc::new(move |frame: Frame| {
        router.resolve(frame);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StaticSigner;
    use crate::storage::{InMemoryBlobStore, InMemoryKvStore};
    use crate::transport::fake::{FakeNetwork, FakeTransport};

    async fn build(network: &FakeNetwork, username: &str) -> (Engine, EngineEvents) {
        let transport = FakeTransport::new(network.clone());
        Engine::new(
            EngineConfig::default(),
            transport,
            Arc::new(InMemoryKvStore::new()),
            Arc::new(InMemoryBlobStore::new()),
            Arc::new(StaticSigner::default()),
            username.to_string(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn basic_text_message_round_trips_through_the_assembled_engine() {
        let network = FakeNetwork::new();
        let (alice, _alice_events) = build(&network, "alice").await;
        let (bob, mut bob_events) = build(&network, "bob").await;

        alice.open().await.unwrap();
        bob.open().await.unwrap();

        let bob_id = bob.local_id().unwrap();
        let message_id = MessageId::from("m1");
        alice
            .send_message(bob_id, message_id.clone(), b"hello bob".to_vec(), MsgType::Text, None)
            .await;

        let received = tokio::time::timeout(std::time::Duration::from_secs(1), bob_events.messages.recv())
            .await
            .expect("bob should receive the message")
            .expect("channel should not close");
        match received {
            MessageEvent::Received { content, message_id: id, .. } => {
                assert_eq!(content, b"hello bob");
                assert_eq!(id, message_id);
            }
            other => panic!("expected Received, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn discover_peer_completes_handshake_and_records_the_device() {
        let network = FakeNetwork::new();
        let (alice, _alice_events) = build(&network, "alice").await;
        let (bob, _bob_events) = build(&network, "bob").await;

        alice.open().await.unwrap();
        bob.open().await.unwrap();

        let bob_id = bob.local_id().unwrap();
        alice.discover_peer(bob_id.clone()).await;

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let stored = alice.device(bob_id).await;
        assert!(stored.is_some(), "alice should have recorded bob after a completed discovery handshake");
        assert_eq!(stored.unwrap().username, "bob");
    }

    #[tokio::test]
    async fn regenerate_local_keypair_changes_the_key_and_bumps_its_version() {
        let network = FakeNetwork::new();
        let (alice, _events) = build(&network, "alice").await;
        alice.open().await.unwrap();

        let original = alice.keys.ensure_local_keypair().await;
        assert_eq!(alice.local_key_version().await, 0);

        let regenerated = alice.regenerate_local_keypair().await;
        assert_ne!(original, regenerated);
        assert_eq!(alice.local_key_version().await, 1);
    }

    #[tokio::test]
    async fn first_engine_wins_bootstrap_election() {
        let network = FakeNetwork::new();
        let (alice, _events) = build(&network, "alice").await;
        alice.open().await.unwrap();

        let rendezvous_transport = FakeTransport::new(network.clone());
        let outcome = alice.elect_bootstrap(rendezvous_transport).await;
        assert!(outcome.is_bootstrap);
    }

    #[tokio::test]
    async fn username_query_is_answered_directly_from_the_profile() {
        let network = FakeNetwork::new();
        let (alice, _events) = build(&network, "alice").await;
        let bob_transport = FakeTransport::new(network.clone());
        let bob_adapter = Arc::new(TransportAdapter::new(bob_transport));

        let router = Arc::new(RequestRouter::new());
        {
            let router = router.clone();
            bob_adapter.register_handler(
                FrameType::UsernameResponse,
                Arc::new(move |frame: Frame| {
                    router.resolve(frame);
                }),
            );
        }

        alice.open().await.unwrap();
        bob_adapter.open_as("bob").await.unwrap();

        let alice_id = alice.local_id().unwrap();
        bob_adapter
            .send_frame(
                &alice_id,
                Frame::new(PeerId::from("bob"), alice_id.clone(), now_millis(), FrameBody::UsernameQuery),
            )
            .await
            .unwrap();

        let response = router
            .wait_for(FrameType::UsernameResponse, alice_id, std::time::Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(response.body, FrameBody::UsernameResponse { username, .. } if username == "alice"));
    }

    #[tokio::test]
    async fn any_inbound_frame_triggers_queued_message_retry_without_manual_intervention() {
        let network = FakeNetwork::new();
        let alice_transport = FakeTransport::new(network.clone());
        let (alice, _alice_events) = Engine::new(
            EngineConfig::default(),
            alice_transport.clone(),
            Arc::new(InMemoryKvStore::new()),
            Arc::new(InMemoryBlobStore::new()),
            Arc::new(StaticSigner::default()),
            "alice".to_string(),
        )
        .await
        .unwrap();
        let (bob, mut bob_events) = build(&network, "bob").await;

        alice.open().await.unwrap();
        bob.open().await.unwrap();
        let bob_id = bob.local_id().unwrap();

        alice_transport.set_unreachable(bob_id.clone(), true);
        let message_id = MessageId::from("m-offline");
        alice
            .send_message(bob_id.clone(), message_id.clone(), b"hi".to_vec(), MsgType::Text, None)
            .await;

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(100), bob_events.messages.recv())
                .await
                .is_err(),
            "bob should not have received anything while unreachable"
        );

        // Bob becomes reachable and sends alice an unrelated frame (a
        // device-list query). Alice never calls anything message-engine
        // specific here — the engine itself must notice bob is alive again
        // and retry the queued send on its own.
        alice_transport.set_unreachable(bob_id.clone(), false);
        bob.discover_peer(alice.local_id().unwrap()).await;

        let received = tokio::time::timeout(std::time::Duration::from_secs(1), bob_events.messages.recv())
            .await
            .expect("bob should receive the retried message")
            .expect("channel should not close");
        match received {
            MessageEvent::Received { message_id: id, .. } => assert_eq!(id, message_id),
            other => panic!("expected Received, got {other:?}"),
        }
    }
}
