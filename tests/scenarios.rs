//! End-to-end scenario coverage, built entirely on the in-memory fakes
//! (`storage::InMemory{Kv,Blob}Store`, `transport::fake::{FakeNetwork,
//! FakeTransport}`, `identity::StaticSigner`) the way the per-module unit
//! tests exercise one subsystem at a time, except each scenario here drives
//! the fully assembled `Engine` the way an embedding application would.

use std::sync::{Arc, Once};
use std::time::Duration;

use peer_chat_engine::device::{DeviceRegistryHandle, KeyExchangeStatus};
use peer_chat_engine::discovery::DiscoveryEvent;
use peer_chat_engine::engine::{Engine, EngineEvents};
use peer_chat_engine::identity::{KeyStoreHandle, StaticSigner};
use peer_chat_engine::key_exchange::KeyExchangeService;
use peer_chat_engine::message_engine::{MessageEngineHandle, MessageEvent};
use peer_chat_engine::protocol::{Frame, FrameBody, FrameType};
use peer_chat_engine::router::RequestRouter;
use peer_chat_engine::storage::{InMemoryBlobStore, InMemoryKvStore};
use peer_chat_engine::time::now_millis;
use peer_chat_engine::transport::fake::{FakeNetwork, FakeTransport};
use peer_chat_engine::transport::TransportAdapter;
use peer_chat_engine::{EngineConfig, MessageId, MsgType, PeerId};

static INIT_LOGGING: Once = Once::new();

/// One-time `tracing-subscriber` init so a failing scenario's diagnostics
/// show up under `--nocapture`.
fn init_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

async fn build(network: &FakeNetwork, username: &str) -> anyhow::Result<(Engine, EngineEvents)> {
    let transport = FakeTransport::new(network.clone());
    let (engine, events) = Engine::new(
        EngineConfig::default(),
        transport,
        Arc::new(InMemoryKvStore::new()),
        Arc::new(InMemoryBlobStore::new()),
        Arc::new(StaticSigner::default()),
        username.to_string(),
    )
    .await?;
    Ok((engine, events))
}

/// S1: a text message sent to an online, reachable peer completes all five
/// steps and is observed by both sides.
#[tokio::test]
async fn s1_basic_text_message_delivers_end_to_end() -> anyhow::Result<()> {
    init_logging();
    let network = FakeNetwork::new();
    let (alice, _alice_events) = build(&network, "alice").await?;
    let (bob, mut bob_events) = build(&network, "bob").await?;

    alice.open().await?;
    bob.open().await?;
    let bob_id = bob.local_id().expect("bob is open");

    let message_id = MessageId::new_random();
    alice
        .send_message(bob_id, message_id.clone(), b"hello from alice".to_vec(), MsgType::Text, None)
        .await;

    let received = tokio::time::timeout(Duration::from_secs(1), bob_events.messages.recv())
        .await?
        .expect("bob's event channel stays open");
    match received {
        MessageEvent::Received { content, message_id: id, .. } => {
            assert_eq!(content, b"hello from alice");
            assert_eq!(id, message_id);
        }
        other => panic!("expected Received, got {other:?}"),
    }

    Ok(())
}

/// S2: the same `message_id` arriving twice (a crossed retry, or a sender
/// resending step 1 before seeing the ack) is deduplicated on the receiver
/// and never surfaces a second `Received` event, though it is still acked.
/// Driven directly against `MessageEngineHandle` (the owner-task handle),
/// the way `message_engine.rs`'s own tests do, since this scenario is about
/// the dedup set rather than the assembled facade.
#[tokio::test]
async fn s2_duplicate_message_id_is_deduplicated_on_redelivery() -> anyhow::Result<()> {
    init_logging();
    let network = FakeNetwork::new();
    let alice_adapter = Arc::new(TransportAdapter::new(FakeTransport::new(network.clone())));
    let bob_adapter = Arc::new(TransportAdapter::new(FakeTransport::new(network.clone())));
    alice_adapter.open_as("alice").await?;
    bob_adapter.open_as("bob").await?;

    let (alice_messages, mut alice_events) = MessageEngineHandle::spawn(
        PeerId::from("alice"),
        alice_adapter.clone(),
        Arc::new(InMemoryBlobStore::new()),
        Arc::new(InMemoryKvStore::new()),
        EngineConfig::default(),
    );
    let (bob_messages, mut bob_events) = MessageEngineHandle::spawn(
        PeerId::from("bob"),
        bob_adapter.clone(),
        Arc::new(InMemoryBlobStore::new()),
        Arc::new(InMemoryKvStore::new()),
        EngineConfig::default(),
    );

    for tag in [FrameType::MessageId, FrameType::RequestContent, FrameType::MessageContent, FrameType::DeliveryAck] {
        let alice_clone = alice_messages.clone();
        alice_adapter.register_handler(
            tag,
            Arc::new(move |frame: Frame| {
                let engine = alice_clone.clone();
                tokio::spawn(async move { engine.handle_inbound(frame).await });
            }),
        );
        let bob_clone = bob_messages.clone();
        bob_adapter.register_handler(
            tag,
            Arc::new(move |frame: Frame| {
                let engine = bob_clone.clone();
                tokio::spawn(async move { engine.handle_inbound(frame).await });
            }),
        );
    }

    let message_id = MessageId::from("duplicate-test");
    alice_messages
        .send_message(PeerId::from("bob"), message_id.clone(), b"only once".to_vec(), MsgType::Text, None)
        .await;

    let first = tokio::time::timeout(Duration::from_secs(1), bob_events.recv()).await?.unwrap();
    assert!(matches!(first, MessageEvent::Received { .. }));
    let _delivered = tokio::time::timeout(Duration::from_secs(1), alice_events.recv()).await?.unwrap();
    assert_eq!(bob_messages.seen_count().await, 1);

    // Simulate a crossed retry: another `message_id` frame for the same id
    // lands on bob after delivery already completed.
    let retry = Frame::new(
        PeerId::from("alice"),
        PeerId::from("bob"),
        now_millis(),
        FrameBody::MessageId { message_id: message_id.clone(), msg_type: MsgType::Text },
    );
    bob_messages.handle_inbound(retry).await;

    assert_eq!(bob_messages.seen_count().await, 1, "the dedup set must not grow on redelivery");
    let unexpected = tokio::time::timeout(Duration::from_millis(150), bob_events.recv()).await;
    if let Ok(Some(event)) = unexpected {
        panic!("bob must not emit a second Received for a deduplicated message_id: {event:?}");
    }

    Ok(())
}

/// S3: a message sent while the recipient is unreachable stays queued for
/// retry; once the recipient becomes reachable and liveness is observed,
/// the queued step 1 resend completes delivery.
#[tokio::test]
async fn s3_message_queued_while_offline_delivers_once_peer_is_reachable() -> anyhow::Result<()> {
    init_logging();
    let network = FakeNetwork::new();
    let alice_transport = FakeTransport::new(network.clone());
    let alice_adapter = Arc::new(TransportAdapter::new(alice_transport.clone()));
    let bob_adapter = Arc::new(TransportAdapter::new(FakeTransport::new(network.clone())));
    alice_adapter.open_as("alice").await?;
    bob_adapter.open_as("bob").await?;

    let (alice_messages, mut alice_events) = MessageEngineHandle::spawn(
        PeerId::from("alice"),
        alice_adapter.clone(),
        Arc::new(InMemoryBlobStore::new()),
        Arc::new(InMemoryKvStore::new()),
        EngineConfig::default(),
    );
    let (bob_messages, mut bob_events) = MessageEngineHandle::spawn(
        PeerId::from("bob"),
        bob_adapter.clone(),
        Arc::new(InMemoryBlobStore::new()),
        Arc::new(InMemoryKvStore::new()),
        EngineConfig::default(),
    );

    for tag in [FrameType::MessageId, FrameType::RequestContent, FrameType::MessageContent, FrameType::DeliveryAck] {
        let alice_clone = alice_messages.clone();
        alice_adapter.register_handler(
            tag,
            Arc::new(move |frame: Frame| {
                let engine = alice_clone.clone();
                tokio::spawn(async move { engine.handle_inbound(frame).await });
            }),
        );
        let bob_clone = bob_messages.clone();
        bob_adapter.register_handler(
            tag,
            Arc::new(move |frame: Frame| {
                let engine = bob_clone.clone();
                tokio::spawn(async move { engine.handle_inbound(frame).await });
            }),
        );
    }

    alice_transport.set_unreachable(PeerId::from("bob"), true);

    let message_id = MessageId::from("offline-retry");
    alice_messages
        .send_message(PeerId::from("bob"), message_id.clone(), b"are you there".to_vec(), MsgType::Text, None)
        .await;

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(alice_messages.pending_count().await, 1, "the message stays queued while bob is unreachable");
    let no_event = tokio::time::timeout(Duration::from_millis(100), bob_events.recv()).await;
    assert!(no_event.is_err(), "bob must not have received anything yet");

    alice_transport.set_unreachable(PeerId::from("bob"), false);
    alice_messages.note_liveness(PeerId::from("bob")).await;

    let received = tokio::time::timeout(Duration::from_secs(1), bob_events.recv())
        .await?
        .expect("bob's channel stays open");
    assert!(matches!(received, MessageEvent::Received { .. }));
    let delivered = tokio::time::timeout(Duration::from_secs(1), alice_events.recv())
        .await?
        .expect("alice's channel stays open");
    assert!(matches!(delivered, MessageEvent::Delivered { message_id: ref id, .. } if *id == message_id));
    assert_eq!(alice_messages.pending_count().await, 0);

    Ok(())
}

/// S4: discovery is transitive. Bob already knows Carol (from a prior
/// direct discovery); once Alice discovers Bob, the recursive
/// `device_list_request`/`response` fan-out should teach Alice about Carol
/// too, without Alice ever contacting Carol directly during the handshake.
#[tokio::test]
async fn s4_recursive_discovery_learns_a_peer_of_a_peer() -> anyhow::Result<()> {
    init_logging();
    let network = FakeNetwork::new();
    let (alice, _alice_events) = build(&network, "alice").await?;
    let (bob, mut bob_events) = build(&network, "bob").await?;
    let (carol, _carol_events) = build(&network, "carol").await?;

    alice.open().await?;
    bob.open().await?;
    carol.open().await?;

    let bob_id = bob.local_id().expect("bob is open");
    let carol_id = carol.local_id().expect("carol is open");

    // Bob discovers Carol first, so Bob's registry already has her by the
    // time Alice comes looking.
    bob.discover_peer(carol_id.clone()).await;
    let bob_saw_carol = tokio::time::timeout(Duration::from_secs(1), bob_events.discovery.recv())
        .await?
        .expect("bob's discovery channel stays open");
    assert!(matches!(bob_saw_carol, DiscoveryEvent::ContactDiscovered { peer_id, .. } if peer_id == carol_id));

    alice.discover_peer(bob_id.clone()).await;

    tokio::time::sleep(Duration::from_millis(100)).await;

    let alice_devices = alice.known_devices().await;
    assert!(
        alice_devices.iter().any(|d| d.peer_id == bob_id),
        "alice should know bob directly"
    );
    assert!(
        alice_devices.iter().any(|d| d.peer_id == carol_id),
        "alice should have learned about carol transitively through bob's device list"
    );

    Ok(())
}

/// S5: a peer's public key changes after first exchange. The embedding
/// application is asked to decide, and refusing the change leaves the
/// device `Compromised` with the original key left on record.
///
/// Alice is the fully assembled `Engine`; bob is built from the lower-level
/// `KeyExchangeService`/`KeyStoreHandle` pieces directly (the same way
/// `key_exchange.rs`'s own tests construct a peer) purely so the test can
/// force bob's keypair to rotate between the two handshakes, which the
/// `Engine` facade has no public operation for.
#[tokio::test]
async fn s5_refused_key_change_marks_the_device_compromised() -> anyhow::Result<()> {
    init_logging();
    let network = FakeNetwork::new();
    let (alice, mut alice_events) = build(&network, "alice").await?;
    alice.open().await?;

    let bob_adapter = Arc::new(TransportAdapter::new(FakeTransport::new(network.clone())));
    let bob_router = Arc::new(RequestRouter::new());
    let bob_keys = KeyStoreHandle::spawn(Arc::new(StaticSigner::default()), Arc::new(InMemoryKvStore::new()));
    let bob_devices = DeviceRegistryHandle::spawn(
        Arc::new(InMemoryKvStore::new()),
        Arc::new(InMemoryBlobStore::new()),
        EngineConfig::default(),
    );
    let (bob_key_exchange, _bob_key_events) = KeyExchangeService::new(
        bob_adapter.clone(),
        bob_router.clone(),
        bob_keys.clone(),
        bob_devices.clone(),
        EngineConfig::default().request_timeout,
    );
    bob_adapter.register_handler(
        FrameType::KeyExchangeRequest,
        Arc::new({
            let svc = bob_key_exchange.clone();
            move |frame: Frame| {
                let svc = svc.clone();
                tokio::spawn(async move { svc.handle_request(frame).await });
            }
        }),
    );
    let bob_id = bob_adapter.open().await?;

    // First contact: establishes the initial key, no user decision involved.
    alice.initiate_key_exchange(bob_id.clone()).await?;
    let before = alice.device(bob_id.clone()).await.expect("bob recorded after first exchange");
    assert_eq!(before.key_exchange_status, KeyExchangeStatus::Exchanged);
    let original_key = before.public_key.clone().expect("a key was recorded");

    // Bob regenerates his keypair (e.g. reinstalled the app); the next
    // handshake now carries a different public key than what alice has on
    // file, which must be classified as a detected change rather than a
    // silent overwrite.
    bob_keys.regenerate_local_keypair().await;
    alice.initiate_key_exchange(bob_id.clone()).await?;

    let event = tokio::time::timeout(Duration::from_secs(1), alice_events.key_changes.recv())
        .await?
        .expect("a KeyChangeEvent should have been enqueued for the detected change");
    assert_eq!(event.peer_id, bob_id);
    assert_eq!(event.old_public_key, original_key);
    let _ = event.decision.send(false);

    tokio::time::sleep(Duration::from_millis(30)).await;
    let after = alice.device(bob_id).await.expect("bob is still known");
    assert_eq!(after.key_exchange_status, KeyExchangeStatus::Compromised);
    assert_eq!(after.public_key, Some(original_key), "the untrusted new key must never be stored");

    Ok(())
}

/// S6: two processes race to bind the fixed well-known bootstrap id.
/// Exactly one becomes the bootstrap; the other falls back to client mode
/// and learns the bootstrap's device list, including any peers the
/// bootstrap already knew about.
#[tokio::test]
async fn s6_bootstrap_election_has_exactly_one_winner() -> anyhow::Result<()> {
    init_logging();
    let network = FakeNetwork::new();
    let (first, _first_events) = build(&network, "first").await?;
    let (second, _second_events) = build(&network, "second").await?;

    first.open().await?;
    second.open().await?;

    // Run both elections concurrently, as two independent processes starting
    // up at roughly the same time would — the election's startup jitter
    // exists specifically to make simultaneous startup survivable.
    let first_rendezvous = FakeTransport::new(network.clone());
    let second_rendezvous = FakeTransport::new(network.clone());
    let (first_outcome, second_outcome) =
        tokio::join!(first.elect_bootstrap(first_rendezvous), second.elect_bootstrap(second_rendezvous));

    assert_ne!(
        first_outcome.is_bootstrap, second_outcome.is_bootstrap,
        "exactly one of the two processes must win the well-known id"
    );

    let client = if first_outcome.is_bootstrap { &second } else { &first };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let bootstrap_id = if first_outcome.is_bootstrap {
        first.local_id().unwrap()
    } else {
        second.local_id().unwrap()
    };
    let known = client.known_devices().await;
    let bootstrap_record = known.iter().find(|d| d.peer_id == bootstrap_id);
    assert!(
        bootstrap_record.is_some(),
        "the losing process should have recorded the winner as a known device"
    );
    assert!(bootstrap_record.unwrap().is_bootstrap);

    Ok(())
}
