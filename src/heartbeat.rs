//! Heartbeat & Profile Sync.
//!
//! Two independent jobs share this module because they're driven by the
//! same periodic tick and the same wire pair shape (query/response, plus one
//! unsolicited push): liveness probing (`online_check_query/response`, which
//! also doubles as this peer's only source of truth for a remote device's
//! `last_heartbeat`) and username/avatar propagation
//! (`user_info_query/response/update`, gated by the no-rollback version
//! rule already enforced in `device::DeviceRegistryHandle::update_user_info`).

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::device::DeviceRegistryHandle;
use crate::profile::ProfileHandle;
use crate::protocol::{Frame, FrameBody, FrameType};
use crate::router::RequestRouter;
use crate::time::now_millis;
use crate::transport::{PeerId, TransportAdapter};

pub struct HeartbeatService {
    adapter: Arc<TransportAdapter>,
    router: Arc<RequestRouter>,
    devices: DeviceRegistryHandle,
    profile: ProfileHandle,
    config: EngineConfig,
}

impl HeartbeatService {
    pub fn new(
        adapter: Arc<TransportAdapter>,
        router: Arc<RequestRouter>,
        devices: DeviceRegistryHandle,
        profile: ProfileHandle,
        config: EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            adapter,
            router,
            devices,
            profile,
            config,
        })
    }

    fn local_id(&self) -> PeerId {
        self.adapter.local_id().unwrap_or_else(|| PeerId::from("<unbound>"))
    }

    async fn send(&self, to: &PeerId, body: FrameBody) -> Result<(), crate::error::EngineError> {
        let frame = Frame::new(self.local_id(), to.clone(), now_millis(), body);
        self.adapter.send_frame(to, frame).await
    }

    /// Run the periodic liveness sweep forever, at `config.device_check_interval`.
    /// Intended to be spawned once by the engine facade.
    pub async fn run_periodic(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.device_check_interval);
        loop {
            ticker.tick().await;
            self.check_all_devices().await;
        }
    }

    /// One liveness sweep: ping every known device, online or not, so a
    /// peer that came back can be noticed.
    pub async fn check_all_devices(self: &Arc<Self>) {
        let snapshot = self.devices.snapshot().await;
        for device in snapshot {
            self.check_one_device(device.peer_id).await;
        }
    }

    async fn check_one_device(self: &Arc<Self>, peer_id: PeerId) {
        let profile = self.profile.snapshot().await;
        let result = self
            .send(
                &peer_id,
                FrameBody::OnlineCheckQuery {
                    username: profile.username.clone(),
                    avatar: profile.avatar_ref.clone(),
                    user_info_version: profile.version,
                },
            )
            .await;
        if result.is_err() {
            return;
        }

        if let Ok(frame) = self
            .router
            .wait_for(FrameType::OnlineCheckResponse, peer_id, self.config.device_check_timeout)
            .await
        {
            self.handle_online_check_response(frame).await;
        }
    }

    /// If `claimed_version` differs from what's on file for `peer_id`
    /// *before* this exchange's own update is applied, schedule a
    /// `user_info_query` to fetch the canonical profile. Fire-and-forget
    /// — the response, once it arrives, drives the same no-rollback update
    /// as every other profile source. Must be called with the
    /// pre-update stored version, since the online_check exchange's own
    /// fields would otherwise race the update this triggers.
    fn schedule_user_info_sync_if_stale(self: &Arc<Self>, peer_id: PeerId, stored_version: u64, claimed_version: u64) {
        if stored_version == claimed_version {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            if this.send(&peer_id, FrameBody::UserInfoQuery).await.is_err() {
                return;
            }
            if let Ok(frame) = this
                .router
                .wait_for(FrameType::UserInfoResponse, peer_id, this.config.device_check_timeout)
                .await
            {
                this.handle_user_info_response(frame).await;
            }
        });
    }

    /// Inbound `online_check_query`: the mere fact we received it means the
    /// sender is alive, so bump its `last_heartbeat` via the no-rollback
    /// user-info update, then answer with our own liveness + profile. A
    /// version mismatch also schedules a `user_info_query` round trip.
    pub async fn handle_online_check_query(self: &Arc<Self>, frame: Frame) {
        let from = frame.from.clone();
        let FrameBody::OnlineCheckQuery { username, avatar, user_info_version } = frame.body else {
            return;
        };
        let stored_version = self.devices.get(from.clone()).await.map(|d| d.user_info_version).unwrap_or(0);
        self.schedule_user_info_sync_if_stale(from.clone(), stored_version, user_info_version);
        self.devices.update_user_info(from.clone(), username, avatar, user_info_version).await;

        let profile = self.profile.snapshot().await;
        let _ = self
            .send(
                &from,
                FrameBody::OnlineCheckResponse {
                    is_online: true,
                    username: profile.username,
                    avatar: profile.avatar_ref,
                    user_info_version: profile.version,
                },
            )
            .await;
    }

    /// Inbound `online_check_response`, whether received via the periodic
    /// sweep's `wait_for` or (in principle) pushed out of band. A version
    /// mismatch also schedules a `user_info_query` round trip, the same
    /// check run symmetrically on the response side.
    pub async fn handle_online_check_response(self: &Arc<Self>, frame: Frame) {
        let from = frame.from.clone();
        let FrameBody::OnlineCheckResponse { username, avatar, user_info_version, .. } = frame.body else {
            return;
        };
        let stored_version = self.devices.get(from.clone()).await.map(|d| d.user_info_version).unwrap_or(0);
        self.schedule_user_info_sync_if_stale(from.clone(), stored_version, user_info_version);
        self.devices.update_user_info(from, username, avatar, user_info_version).await;
    }

    /// Inbound `user_info_query`: answer with our current profile.
    pub async fn handle_user_info_query(&self, frame: Frame) {
        let from = frame.from.clone();
        let profile = self.profile.snapshot().await;
        let _ = self
            .send(
                &from,
                FrameBody::UserInfoResponse {
                    username: profile.username,
                    avatar: profile.avatar_ref,
                    version: profile.version,
                },
            )
            .await;
    }

    /// Inbound `user_info_response`, answering a `user_info_query` this peer
    /// sent.
    pub async fn handle_user_info_response(&self, frame: Frame) {
        let from = frame.from.clone();
        let FrameBody::UserInfoResponse { username, avatar, version } = frame.body else {
            return;
        };
        self.devices.update_user_info(from, username, avatar, version).await;
    }

    /// Inbound `user_info_update`: an unsolicited push from a peer whose
    /// profile changed, applied under the same no-rollback rule.
    pub async fn handle_user_info_update(&self, frame: Frame) {
        let from = frame.from.clone();
        let FrameBody::UserInfoUpdate { username, avatar, version } = frame.body else {
            return;
        };
        self.devices.update_user_info(from, username, avatar, version).await;
    }

    /// Push the local profile to every known device on a semantic profile
    /// change. Online and offline devices both get a send attempt;
    /// a failed send to an offline one is simply dropped.
    pub async fn broadcast_profile_update(&self) {
        let profile = self.profile.snapshot().await;
        let snapshot = self.devices.snapshot().await;
        for device in snapshot {
            let _ = self
                .send(
                    &device.peer_id,
                    FrameBody::UserInfoUpdate {
                        username: profile.username.clone(),
                        avatar: profile.avatar_ref.clone(),
                        version: profile.version,
                    },
                )
                .await;
        }
    }
}
