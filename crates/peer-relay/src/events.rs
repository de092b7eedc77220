use bytes::Bytes;

use crate::error::RelayError;
use crate::identity::{DomainKey, PeerIdentity};

/// Identifies the bridge an event came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSummary {
    pub user: String,
    pub application: String,
    pub domain: DomainKey,
}

impl PeerSummary {
    pub fn new(peer: &PeerIdentity, domain: &DomainKey) -> Self {
        Self {
            user: peer.user.clone(),
            application: peer.application.clone(),
            domain: domain.clone(),
        }
    }
}

/// Everything the registry reports to the layer above it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    AccessGranted { user_id: String },
    AccessDenied,
    Connected(PeerSummary),
    Disconnected(PeerSummary),
    Error {
        peer: Option<PeerSummary>,
        error: RelayError,
    },
    /// Bytes received on a connected channel.
    Message { peer: PeerSummary, data: Bytes },
}
