//! Request/Response Router.
//!
//! Matches inbound frames back to the outbound request that's waiting for
//! them. Grounded directly in the `PendingRequests` pattern from
//! `event_loop/mod.rs` in the retrieval pack's `reveries-network` example: a
//! map from a request key to a `oneshot::Sender`, registered right before
//! the request goes out, resolved (or left to time out) when the matching
//! response arrives. That example keys on `kad::QueryId`/
//! `OutboundRequestId`; this router keys on `(FrameType, PeerId)` since
//! frames don't carry their own correlation id — the five-step chat protocol
//! correlates purely by "the next frame of the expected type from this
//! peer". Multiple concurrent waiters for the same `(FrameType, PeerId)` are
//! permitted — each gets its own token and resolves in FIFO order against
//! that key's queue — so one caller's in-flight request is never silently
//! evicted by another's.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::EngineError;
use crate::protocol::{Frame, FrameType};
use crate::transport::PeerId;

type WaiterKey = (FrameType, PeerId);
type WaiterToken = u64;

/// Routes inbound frames to whichever outbound request is waiting for a
/// response of that type from that peer.
#[derive(Default)]
pub struct RequestRouter {
    waiters: Mutex<HashMap<WaiterKey, VecDeque<(WaiterToken, oneshot::Sender<Frame>)>>>,
    next_token: AtomicU64,
}

impl RequestRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a wait for the next frame of `response_type` from `peer_id`,
    /// then block (up to `timeout`) for it to arrive. Returns
    /// `EngineError::RequestTimeout` as an ordinary value on expiry — not an
    /// exception callers need to special-case.
    ///
    /// A second, concurrent wait for the same `(response_type, peer_id)`
    /// pair does not evict the first: both are queued under that key and
    /// `resolve` drains them in FIFO order as matching frames arrive.
    pub async fn wait_for(
        &self,
        response_type: FrameType,
        peer_id: PeerId,
        timeout: Duration,
    ) -> Result<Frame, EngineError> {
        let (tx, rx) = oneshot::channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        {
            let mut waiters = self.waiters.lock().unwrap();
            waiters.entry((response_type, peer_id.clone())).or_default().push_back((token, tx));
        }

        let result = tokio::time::timeout(timeout, rx).await;

        match result {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) | Err(_) => {
                // On timeout or cancellation, remove only this waiter's own
                // token from the key's queue, leaving any other concurrent
                // waiter for the same key untouched.
                let mut waiters = self.waiters.lock().unwrap();
                let key = (response_type, peer_id);
                if let Some(queue) = waiters.get_mut(&key) {
                    queue.retain(|(t, _)| *t != token);
                    if queue.is_empty() {
                        waiters.remove(&key);
                    }
                }
                Err(EngineError::RequestTimeout)
            }
        }
    }

    /// Resolve the oldest pending waiter for its `(tag, from)` key with an
    /// inbound frame, if one is registered. Returns whether a waiter was
    /// found — callers that also want plain fan-out dispatch (not just
    /// request/response correlation) should fall through to
    /// `HandlerRegistry::dispatch` when this returns `false`.
    pub fn resolve(&self, frame: Frame) -> bool {
        let key = (frame.body.tag(), frame.from.clone());
        let mut waiters = self.waiters.lock().unwrap();
        let Some(queue) = waiters.get_mut(&key) else {
            return false;
        };
        let Some((_, tx)) = queue.pop_front() else {
            return false;
        };
        if queue.is_empty() {
            waiters.remove(&key);
        }
        drop(waiters);
        let _ = tx.send(frame);
        true
    }

    /// Cancel the oldest pending wait for a key without resolving it (used
    /// when the caller gives up before the timeout, e.g. the peer was found
    /// offline by some other means). Returns whether a waiter was actually
    /// pending.
    pub fn cancel(&self, response_type: FrameType, peer_id: &PeerId) -> bool {
        let mut waiters = self.waiters.lock().unwrap();
        let key = (response_type, peer_id.clone());
        let Some(queue) = waiters.get_mut(&key) else {
            return false;
        };
        let removed = queue.pop_front().is_some();
        if queue.is_empty() {
            waiters.remove(&key);
        }
        removed
    }

    /// Number of waiters currently pending — used in tests and in
    /// diagnostics logging.
    pub fn pending_count(&self) -> usize {
        self.waiters.lock().unwrap().values().map(VecDeque::len).sum()
    }
}
