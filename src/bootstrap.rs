//! Bootstrap Elector.
//!
//! Contends for the fixed, well-known rendezvous identifier at startup. The
//! injected `Transport` contract models one connector binding one identity
//! at a time, so winning the well-known id requires a *second*, independent
//! `Transport` instance distinct from the engine's own main adapter (which
//! keeps its ordinary, anonymously-assigned identity for everything else).
//! A `Device` record for the bootstrap stores `peer_id` as its ordinary
//! messaging identity and `real_peer_id` as the well-known id it's also
//! bound to, which only makes sense if the two bindings are actually
//! separate connections. Recorded in `DESIGN.md`.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::device::{Device, DeviceRegistryHandle};
use crate::error::EngineError;
use crate::protocol::{Frame, FrameBody, FrameType};
use crate::router::RequestRouter;
use crate::time::now_millis;
use crate::transport::{PeerId, Transport, TransportAdapter};

/// The fixed, globally-known peer identifier contended for at startup.
pub const UNIVERSE_BOOTSTRAP_ID: &str = "universe-bootstrap";
/// Anti-thundering-herd startup jitter upper bound.
const JITTER_MAX_MS: u64 = 1000;
/// Budget for the rendezvous bind attempt.
const ELECTION_TIMEOUT: Duration = Duration::from_secs(3);

/// Outcome of one election attempt, reported back to the engine facade so
/// it can decide whether to keep the rendezvous adapter resident.
#[derive(Debug, Clone)]
pub struct ElectionOutcome {
    pub is_bootstrap: bool,
}

/// Random 0–1000ms jitter before attempting to bind.
async fn jitter() {
    let millis = rand::rng().random_range(0..=JITTER_MAX_MS);
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

/// Run the election once at startup. `rendezvous_adapter` must wrap a fresh,
/// not-yet-opened `Transport` distinct from the engine's main adapter.
/// `own_adapter` must already be open, since the bootstrap branch needs to
/// advertise its own real identity to clients, and the client branch sends
/// its request through it.
pub async fn elect(
    rendezvous_adapter: Arc<TransportAdapter>,
    own_adapter: Arc<TransportAdapter>,
    router: Arc<RequestRouter>,
    devices: DeviceRegistryHandle,
    local_username: String,
    local_avatar: Option<String>,
) -> ElectionOutcome {
    jitter().await;

    match rendezvous_adapter
        .open_as_with_timeout(UNIVERSE_BOOTSTRAP_ID, ELECTION_TIMEOUT)
        .await
    {
        Ok(_) => {
            become_bootstrap(rendezvous_adapter, own_adapter, devices);
            ElectionOutcome { is_bootstrap: true }
        }
        Err(err) => {
            tracing::info!(error = %err, "bootstrap id unavailable, falling back to client role");
            become_client(own_adapter, router, devices, local_username, local_avatar).await;
            ElectionOutcome { is_bootstrap: false }
        }
    }
}

/// We won the rendezvous id: register a handler that answers
/// `device_list_request` from our own device registry, and records each
/// requester's advertised identity.
fn become_bootstrap(rendezvous_adapter: Arc<TransportAdapter>, own_adapter: Arc<TransportAdapter>, devices: DeviceRegistryHandle) {
    let responder_adapter = rendezvous_adapter.clone();
    rendezvous_adapter.register_handler(
        FrameType::DeviceListRequest,
        Arc::new(move |frame: Frame| {
            let adapter = responder_adapter.clone();
            let own_adapter = own_adapter.clone();
            let devices = devices.clone();
            tokio::spawn(async move {
                answer_device_list_request(frame, adapter, own_adapter, devices).await;
            });
        }),
    );
}

async fn answer_device_list_request(
    frame: Frame,
    rendezvous_adapter: Arc<TransportAdapter>,
    own_adapter: Arc<TransportAdapter>,
    devices: DeviceRegistryHandle,
) {
    let FrameBody::DeviceListRequest { real_peer_id, username, avatar } = frame.body else {
        return;
    };

    if let Some(real_peer_id) = real_peer_id {
        let now = now_millis();
        let mut device = Device::new(real_peer_id, username.unwrap_or_default(), now);
        device.avatar_ref = avatar;
        devices.add_or_update(device).await;
    }

    let snapshot = devices.snapshot().await;
    let wire_devices = snapshot.iter().map(Device::to_wire).collect();
    let own_id = own_adapter.local_id();

    let _ = rendezvous_adapter
        .send_frame(
            &frame.from,
            Frame::new(
                PeerId::from(UNIVERSE_BOOTSTRAP_ID),
                frame.from.clone(),
                now_millis(),
                FrameBody::DeviceListResponse {
                    devices: wire_devices,
                    is_bootstrap: Some(true),
                    real_peer_id: own_id,
                    username: None,
                    avatar: None,
                },
            ),
        )
        .await;
}

/// We lost the rendezvous id: connect to it as an ordinary client, announce
/// ourselves, and merge whatever device list comes back.
async fn become_client(
    own_adapter: Arc<TransportAdapter>,
    router: Arc<RequestRouter>,
    devices: DeviceRegistryHandle,
    local_username: String,
    local_avatar: Option<String>,
) {
    let local_id = match own_adapter.local_id() {
        Some(id) => id,
        None => {
            tracing::warn!("cannot run bootstrap client handshake before the main adapter has opened");
            return;
        }
    };
    let bootstrap_id = PeerId::from(UNIVERSE_BOOTSTRAP_ID);

    let request = Frame::new(
        local_id.clone(),
        bootstrap_id.clone(),
        now_millis(),
        FrameBody::DeviceListRequest {
            real_peer_id: Some(local_id.clone()),
            username: Some(local_username),
            avatar: local_avatar,
        },
    );
    let send_result = own_adapter.send_frame(&bootstrap_id, request).await;
    if let Err(err) = send_result {
        tracing::info!(error = %err, "no bootstrap peer reachable yet");
        return;
    }

    let response = router
        .wait_for(FrameType::DeviceListResponse, bootstrap_id.clone(), ELECTION_TIMEOUT)
        .await;
    match response {
        Ok(frame) => merge_bootstrap_response(frame, devices).await,
        Err(EngineError::RequestTimeout) => {
            tracing::info!("bootstrap peer did not respond to our device_list_request");
        }
        Err(err) => tracing::debug!(error = %err, "bootstrap handshake failed"),
    }
}

async fn merge_bootstrap_response(frame: Frame, devices: DeviceRegistryHandle) {
    let FrameBody::DeviceListResponse { devices: wire_devices, real_peer_id, username, avatar, .. } = frame.body else {
        return;
    };

    devices
        .add_devices(wire_devices.into_iter().map(Device::from_wire).collect())
        .await;

    if let Some(real_peer_id) = real_peer_id {
        let now = now_millis();
        let mut bootstrap_device = Device::new(real_peer_id.clone(), username.unwrap_or_default(), now);
        bootstrap_device.avatar_ref = avatar;
        bootstrap_device.is_bootstrap = true;
        bootstrap_device.real_peer_id = Some(PeerId::from(UNIVERSE_BOOTSTRAP_ID));
        devices.add_or_update(bootstrap_device).await;
        // Covers the case where this peer was already known (e.g. from a
        // prior gossip round) — add_or_update's merge path doesn't touch
        // is_bootstrap/real_peer_id for an existing record.
        devices.set_bootstrap(real_peer_id, PeerId::from(UNIVERSE_BOOTSTRAP_ID)).await;
    }
}
