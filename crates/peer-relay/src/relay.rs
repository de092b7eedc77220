use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::error::{RelayError, RelayResult};
use crate::identity::AccessSession;
use crate::signal::{InboundSignal, RelayEnvelope};

/// Status the relay returns when the destination peer has no live subscription yet.
pub const PEER_UNREACHABLE: u16 = 504;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("relay send failed with status {status}: {reason}")]
pub struct SendFailure {
    pub status: u16,
    pub reason: String,
}

impl SendFailure {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.status == PEER_UNREACHABLE
    }
}

impl From<SendFailure> for RelayError {
    fn from(failure: SendFailure) -> Self {
        if failure.is_transient() {
            RelayError::TransportTransient {
                status: failure.status,
            }
        } else {
            RelayError::TransportFatal {
                status: failure.status,
                reason: failure.reason,
            }
        }
    }
}

pub type InboundStream = BoxStream<'static, RelayResult<InboundSignal>>;

#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Called whenever the registry's access session changes.
    fn authorize(&self, _session: Option<&AccessSession>) {}

    async fn send(&self, envelope: RelayEnvelope) -> Result<(), SendFailure>;

    /// Opens the long-lived inbound stream for the authorized user.
    async fn subscribe(&self, user_id: &str) -> RelayResult<InboundStream>;
}
