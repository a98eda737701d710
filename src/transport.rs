//! Transport Adapter and the `Transport` contract it wraps.
//!
//! The underlying peer connector — whatever actually opens a socket, QUIC
//! stream, or WebRTC data channel to a peer — is an injected capability.
//! The `Transport` trait below is that seam, so the engine can run against
//! an in-memory fake in tests (`transport::fake`) or a real connector
//! without changing a line of subsystem code.
//!
//! `TransportAdapter` wraps a `Transport`, enforces the 10s channel-open
//! timeout on every send, dispatches inbound frames through a
//! `HandlerRegistry`, and re-opens the connection every 10s after a
//! `disconnected`/`close` lifecycle event until it succeeds — all state the
//! bare `Transport` trait doesn't know about.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::EngineError;
use crate::protocol::{Frame, FrameType};
use crate::registry::{Handler, HandlerRegistry};

/// The channel-open timeout for a single `send_frame` call.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);
/// The timeout for the initial `open()` call.
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(30);
/// How long the adapter waits between reconnection attempts.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

/// An opaque, transport-assigned peer identifier. Newtype over `String` —
/// the engine never interprets these bytes, only compares and stores them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PeerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Connection lifecycle events the transport reports.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Open(PeerId),
    Disconnected,
    Close,
    Error(String),
}

/// The injected peer connector's contract: open a binding (either to a
/// requested id, or anonymously), send a single frame to a peer, and
/// subscribe to inbound frames / lifecycle events.
///
/// This trait makes no assumption about topics, ALPNs, or even that the
/// underlying medium is QUIC — only that frames round-trip losslessly. The
/// serialization format itself is opaque to the engine.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Bind to a specific requested id (used by the bootstrap elector to
    /// contend for the well-known rendezvous identifier). Fails if the id
    /// is already taken by another process reachable through this
    /// connector.
    async fn open_as(&self, id: &str) -> Result<PeerId, EngineError>;

    /// Bind to a transport-assigned anonymous id (the common case for an
    /// ordinary client).
    async fn open_anonymous(&self) -> Result<PeerId, EngineError>;

    /// Open a short-lived channel to `to`, write one frame, and wait for the
    /// buffer to flush before closing it. The 10s channel-open timeout is
    /// enforced by `TransportAdapter`, not by implementations of this trait,
    /// so fakes don't need their own timeout logic.
    async fn send(&self, to: &PeerId, frame: Frame) -> Result<(), EngineError>;

    /// Install the callback invoked for every inbound frame. Implementations
    /// call this back as soon as a frame arrives — dispatch to specific
    /// subsystems happens one layer up, in `HandlerRegistry`.
    fn on_inbound(&self, callback: Arc<dyn Fn(Frame) + Send + Sync>);

    /// Install a callback invoked for lifecycle transitions. May be called
    /// more than once; every installed callback fires for every event.
    fn on_lifecycle(&self, callback: Arc<dyn Fn(LifecycleEvent) + Send + Sync>);

    /// Tear down the binding. Idempotent.
    async fn destroy(&self);
}

/// Wraps an injected `Transport`, adding timeouts, handler dispatch, and
/// automatic reconnection.
pub struct TransportAdapter {
    inner: Arc<dyn Transport>,
    registry: Arc<RwLock<HandlerRegistry>>,
    ready: Arc<AtomicBool>,
    local_id: Arc<RwLock<Option<PeerId>>>,
    requested_id: Arc<RwLock<Option<String>>>,
    observers: Arc<RwLock<Vec<Handler>>>,
}

impl TransportAdapter {
    /// Wrap a transport. Does not open the connection yet — call `open()`
    /// (or `open_as`) once all handlers that need to see early frames have
    /// been registered, since they must be in place before `open()`
    /// completes.
    pub fn new(inner: Arc<dyn Transport>) -> Self {
        let registry = Arc::new(RwLock::new(HandlerRegistry::new()));
        let ready = Arc::new(AtomicBool::new(false));
        let local_id = Arc::new(RwLock::new(None));
        let requested_id = Arc::new(RwLock::new(None));
        let observers: Arc<RwLock<Vec<Handler>>> = Arc::new(RwLock::new(Vec::new()));
        let (lifecycle_tx, mut lifecycle_rx) = mpsc::unbounded_channel();

        let registry_for_inbound = registry.clone();
        let observers_for_inbound = observers.clone();
        inner.on_inbound(Arc::new(move |frame: Frame| {
            // Every inbound frame, regardless of tag or whether anyone's
            // registered to handle it, is evidence of liveness from its
            // sender. Observers run before tag dispatch so a dropped frame
            // still counts.
            for observer in observers_for_inbound.read().unwrap().iter() {
                observer(frame.clone());
            }
            let dispatched = registry_for_inbound.read().unwrap().dispatch(frame.clone());
            if !dispatched {
                tracing::debug!(tag = ?frame.body.tag(), from = %frame.from, "dropped frame with no registered handler");
            }
        }));

        let ready_for_lifecycle = ready.clone();
        inner.on_lifecycle(Arc::new(move |event: LifecycleEvent| {
            match &event {
                LifecycleEvent::Open(_) => ready_for_lifecycle.store(true, Ordering::SeqCst),
                LifecycleEvent::Disconnected | LifecycleEvent::Close => {
                    ready_for_lifecycle.store(false, Ordering::SeqCst)
                }
                LifecycleEvent::Error(_) => {}
            }
            let _ = lifecycle_tx.send(event);
        }));

        // Reconnection supervisor: re-opens the binding 10s after every
        // disconnect/close, retrying until it succeeds.
        let inner_for_reconnect = inner.clone();
        let ready_for_reconnect = ready.clone();
        let local_id_for_reconnect = local_id.clone();
        let requested_id_for_reconnect = requested_id.clone();
        tokio::spawn(async move {
            while let Some(event) = lifecycle_rx.recv().await {
                if matches!(event, LifecycleEvent::Disconnected | LifecycleEvent::Close) {
                    loop {
                        tokio::time::sleep(RECONNECT_INTERVAL).await;
                        let requested = requested_id_for_reconnect.read().unwrap().clone();
                        let result = match requested {
                            Some(id) => inner_for_reconnect.open_as(&id).await,
                            None => inner_for_reconnect.open_anonymous().await,
                        };
                        match result {
                            Ok(id) => {
                                *local_id_for_reconnect.write().unwrap() = Some(id);
                                ready_for_reconnect.store(true, Ordering::SeqCst);
                                break;
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "reconnect attempt failed, retrying");
                            }
                        }
                    }
                }
            }
        });

        Self {
            inner,
            registry,
            ready,
            local_id,
            requested_id,
            observers,
        }
    }

    /// Open anonymously, with a 30s timeout.
    pub async fn open(&self) -> Result<PeerId, EngineError> {
        *self.requested_id.write().unwrap() = None;
        let id = tokio::time::timeout(OPEN_TIMEOUT, self.inner.open_anonymous())
            .await
            .map_err(|_| EngineError::ConnectionTimeout(PeerId::from("<anonymous>")))??;
        *self.local_id.write().unwrap() = Some(id.clone());
        self.ready.store(true, Ordering::SeqCst);
        Ok(id)
    }

    /// Open bound to a specific requested id (used by the bootstrap
    /// elector), with the same 30s timeout.
    pub async fn open_as(&self, requested: &str) -> Result<PeerId, EngineError> {
        self.open_as_with_timeout(requested, OPEN_TIMEOUT).await
    }

    /// Same as `open_as`, with a caller-chosen timeout. The bootstrap
    /// elector uses this with a 3s budget instead of the ordinary 30s
    /// `open()` budget, since a failed rendezvous bind should fall back to
    /// client mode quickly rather than block startup.
    pub async fn open_as_with_timeout(&self, requested: &str, timeout: Duration) -> Result<PeerId, EngineError> {
        *self.requested_id.write().unwrap() = Some(requested.to_string());
        let id = tokio::time::timeout(timeout, self.inner.open_as(requested))
            .await
            .map_err(|_| EngineError::ConnectionTimeout(PeerId::from(requested)))??;
        *self.local_id.write().unwrap() = Some(id.clone());
        self.ready.store(true, Ordering::SeqCst);
        Ok(id)
    }

    pub fn local_id(&self) -> Option<PeerId> {
        self.local_id.read().unwrap().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Send one frame to `peer_id`, bounded by the 10s channel-open timeout.
    /// Fails fast with `TransportNotReady` if the adapter hasn't completed
    /// `open()` or has dropped to disconnected.
    pub async fn send_frame(&self, peer_id: &PeerId, frame: Frame) -> Result<(), EngineError> {
        if !self.is_ready() {
            return Err(EngineError::TransportNotReady);
        }
        tokio::time::timeout(SEND_TIMEOUT, self.inner.send(peer_id, frame))
            .await
            .map_err(|_| EngineError::ConnectionTimeout(peer_id.clone()))?
    }

    /// Register a handler for a frame type. Should be called before `open()`
    /// for any tag the caller can't afford to miss an early frame for.
    pub fn register_handler(&self, frame_type: FrameType, handler: Handler) {
        self.registry.write().unwrap().register(frame_type, handler);
    }

    /// Register an observer invoked for every inbound frame, independent of
    /// tag-based dispatch (the message engine's opportunistic retry fires on
    /// any inbound frame, not just frames it would otherwise handle). Unlike
    /// `register_handler`, this never marks a frame as dispatched and never
    /// suppresses the "no handler" log.
    pub fn on_every_frame(&self, observer: Handler) {
        self.observers.write().unwrap().push(observer);
    }

    /// Subscribe to lifecycle events (open/disconnected/close/error) as an
    /// independent receiver, for subsystems (like the heartbeat layer) that
    /// want to react to connectivity changes themselves.
    pub fn subscribe_lifecycle(&self) -> mpsc::UnboundedReceiver<LifecycleEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.on_lifecycle(Arc::new(move |event| {
            let _ = tx.send(event);
        }));
        rx
    }

    pub async fn destroy(&self) {
        self.inner.destroy().await;
        self.ready.store(false, Ordering::SeqCst);
    }
}

/// An in-memory `Transport` fake for tests: every `FakeTransport` bound
/// against the same `FakeNetwork` can reach every other one through `mpsc`
/// channels, standing in for a real connector without any real networking.
pub mod fake {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    type Mailboxes = Arc<Mutex<HashMap<PeerId, mpsc::UnboundedSender<Frame>>>>;

    /// Shared registry of mailboxes every `FakeTransport` in a test
    /// publishes to and reads from — the in-memory equivalent of a relay
    /// server all peers can reach.
    #[derive(Clone, Default)]
    pub struct FakeNetwork {
        mailboxes: Mailboxes,
    }

    impl FakeNetwork {
        pub fn new() -> Self {
            Self::default()
        }
    }

    pub struct FakeTransport {
        network: FakeNetwork,
        self_weak: std::sync::Weak<FakeTransport>,
        id: RwLock<Option<PeerId>>,
        inbound_cb: RwLock<Option<Arc<dyn Fn(Frame) + Send + Sync>>>,
        lifecycle_cbs: RwLock<Vec<Arc<dyn Fn(LifecycleEvent) + Send + Sync>>>,
        unreachable: RwLock<HashSet<PeerId>>,
    }

    impl FakeTransport {
        /// `Arc::new_cyclic` gives the transport a weak handle to itself
        /// before construction finishes, so `bind` can spawn a pump task
        /// that outlives the `&self` borrow of `open_as`/`open_anonymous`.
        pub fn new(network: FakeNetwork) -> Arc<Self> {
            Arc::new_cyclic(|weak| Self {
                network,
                self_weak: weak.clone(),
                id: RwLock::new(None),
                inbound_cb: RwLock::new(None),
                lifecycle_cbs: RwLock::new(Vec::new()),
                unreachable: RwLock::new(HashSet::new()),
            })
        }

        /// Test hook: make `peer_id` unreachable from this transport, to
        /// simulate an offline peer.
        pub fn set_unreachable(&self, peer_id: PeerId, unreachable: bool) {
            let mut set = self.unreachable.write().unwrap();
            if unreachable {
                set.insert(peer_id);
            } else {
                set.remove(&peer_id);
            }
        }

        fn fire_lifecycle(&self, event: LifecycleEvent) {
            for cb in self.lifecycle_cbs.read().unwrap().iter() {
                cb(event.clone());
            }
        }

        async fn bind(&self, id: PeerId) -> Result<PeerId, EngineError> {
            let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
            {
                let mut mailboxes = self.network.mailboxes.lock().unwrap();
                if mailboxes.contains_key(&id) {
                    return Err(EngineError::PeerUnavailable(id));
                }
                mailboxes.insert(id.clone(), tx);
            }
            *self.id.write().unwrap() = Some(id.clone());

            if let Some(strong) = self.self_weak.upgrade() {
                tokio::spawn(async move {
                    while let Some(frame) = rx.recv().await {
                        if let Some(cb) = strong.inbound_cb.read().unwrap().clone() {
                            cb(frame);
                        }
                    }
                });
            }

            self.fire_lifecycle(LifecycleEvent::Open(id.clone()));
            Ok(id)
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn open_as(&self, id: &str) -> Result<PeerId, EngineError> {
            self.bind(PeerId::from(id)).await
        }

        async fn open_anonymous(&self) -> Result<PeerId, EngineError> {
            let id = PeerId::from(format!("anon-{}", uuid::Uuid::new_v4()));
            self.bind(id).await
        }

        async fn send(&self, to: &PeerId, frame: Frame) -> Result<(), EngineError> {
            if self.unreachable.read().unwrap().contains(to) {
                return Err(EngineError::PeerUnavailable(to.clone()));
            }
            let sender = {
                let mailboxes = self.network.mailboxes.lock().unwrap();
                mailboxes.get(to).cloned()
            };
            match sender {
                Some(tx) => tx
                    .send(frame)
                    .map_err(|_| EngineError::PeerUnavailable(to.clone())),
                None => Err(EngineError::PeerUnavailable(to.clone())),
            }
        }

        fn on_inbound(&self, callback: Arc<dyn Fn(Frame) + Send + Sync>) {
            *self.inbound_cb.write().unwrap() = Some(callback);
        }

        fn on_lifecycle(&self, callback: Arc<dyn Fn(LifecycleEvent) + Send + Sync>) {
            self.lifecycle_cbs.write().unwrap().push(callback);
        }

        async fn destroy(&self) {
            if let Some(id) = self.id.write().unwrap().take() {
                self.network.mailboxes.lock().unwrap().remove(&id);
            }
            self.fire_lifecycle(LifecycleEvent::Close);
        }
    }
}
