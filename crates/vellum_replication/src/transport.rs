//! Transport layer abstraction for replication.

use crate::error::{ReplicationError, ReplicationResult};
use crate::leader::LeaderService;
use crate::protocol::{CborDecode, CborEncode, ReplicationRequest, ReplicationResponse};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Carries requests to a leader and its answers back.
///
/// One call is one exchange; retrying is the caller's business. An
/// implementation returns a retryable error for anything that might work
/// on a second try.
pub trait ReplicationTransport: Send + Sync {
    /// Sends a request and waits for the answer.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::Transport`] or
    /// [`ReplicationError::Timeout`] when the exchange fails.
    fn call(&self, request: &ReplicationRequest) -> ReplicationResult<ReplicationResponse>;
}

impl<T: ReplicationTransport + ?Sized> ReplicationTransport for Arc<T> {
    fn call(&self, request: &ReplicationRequest) -> ReplicationResult<ReplicationResponse> {
        (**self).call(request)
    }
}

/// An in-process transport to a [`LeaderService`].
///
/// Requests and responses go through their CBOR encoding, as they would
/// over a network.
#[derive(Debug)]
pub struct LoopbackTransport {
    leader: Arc<LeaderService>,
    connected: AtomicBool,
}

impl LoopbackTransport {
    /// Connects to a leader.
    pub fn new(leader: Arc<LeaderService>) -> Self {
        Self {
            leader,
            connected: AtomicBool::new(true),
        }
    }

    /// Simulates the link going down or coming back.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// The leader at the other end.
    pub fn leader(&self) -> &Arc<LeaderService> {
        &self.leader
    }
}

impl ReplicationTransport for LoopbackTransport {
    fn call(&self, request: &ReplicationRequest) -> ReplicationResult<ReplicationResponse> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ReplicationError::transport_retryable("connection refused"));
        }
        let body = request.encode_cbor()?;
        let answer = self.leader.handle_bytes(&body)?;
        ReplicationResponse::decode_cbor(&answer)
    }
}
