//! Peer connection capability.
//!
//! The negotiation state machine in [`crate::bridge`] drives an opaque peer
//! connection through this trait. Address discovery and channel transport are
//! the implementation's business; it reports back through a [`PeerEventSink`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::bridge::{BridgeEvent, BridgeId};
use crate::identity::DomainKey;
use crate::registry::RegistryInput;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PeerError {
    #[error("peer connection setup failed: {0}")]
    Setup(String),
    #[error("session description rejected: {0}")]
    Description(String),
    #[error("candidate rejected: {0}")]
    Candidate(String),
    #[error("data channel send failed: {0}")]
    Channel(String),
    #[error("peer connection closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Callbacks from a peer connection, delivered to the owning bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    LocalCandidate(String),
    ChannelOpen,
    ChannelClose,
    ChannelError(String),
    ChannelMessage(Bytes),
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Produces a local offer SDP. Does not apply it.
    async fn create_offer(&self) -> Result<String, PeerError>;
    /// Produces a local answer SDP for the applied remote offer. Does not apply it.
    async fn create_answer(&self) -> Result<String, PeerError>;
    async fn set_local_description(&self, kind: SdpKind, sdp: &str) -> Result<(), PeerError>;
    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), PeerError>;
    /// Discards the applied local offer so a remote offer can be accepted instead.
    async fn rollback(&self) -> Result<(), PeerError>;
    async fn add_candidate(&self, candidate: &str) -> Result<(), PeerError>;
    /// Writes to the reliable ordered channel. Only valid after `ChannelOpen`.
    async fn send(&self, data: Bytes) -> Result<(), PeerError>;
    async fn close(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>, PeerError>;
}

/// Handle a peer connection uses to report events back to its bridge.
///
/// Events are tagged with the bridge id, so anything emitted after the bridge
/// is torn down is discarded by the registry.
#[derive(Clone)]
pub struct PeerEventSink {
    key: DomainKey,
    bridge: BridgeId,
    tx: mpsc::UnboundedSender<RegistryInput>,
}

impl PeerEventSink {
    pub(crate) fn new(
        key: DomainKey,
        bridge: BridgeId,
        tx: mpsc::UnboundedSender<RegistryInput>,
    ) -> Self {
        Self { key, bridge, tx }
    }

    pub fn domain(&self) -> &DomainKey {
        &self.key
    }

    /// Returns false once the registry has gone away.
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.tx
            .send(RegistryInput::bridge(
                self.key.clone(),
                self.bridge,
                BridgeEvent::Peer(event),
            ))
            .is_ok()
    }
}

impl fmt::Debug for PeerEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerEventSink")
            .field("key", &self.key)
            .field("bridge", &self.bridge)
            .finish()
    }
}
