use thiserror::Error;

use crate::identity::DomainKey;
use crate::peer::PeerError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("negotiation error: {0}")]
    Negotiation(String),
    #[error("relay peer not reachable yet (status {status})")]
    TransportTransient { status: u16 },
    #[error("relay rejected signal (status {status}): {reason}")]
    TransportFatal { status: u16, reason: String },
    #[error("invalid access token: expected `<user>:<secret>`")]
    TokenFormat,
    #[error("data channel error: {0}")]
    Channel(String),
    #[error("no access session; set an access token first")]
    AccessDenied,
    #[error("invalid peer identity: {0}")]
    InvalidIdentity(String),
    #[error("no bridge registered for {0}")]
    UnknownPeer(DomainKey),
    #[error("bridge is closed")]
    Closed,
    #[error("relay subscription failed: {0}")]
    Subscription(String),
    #[error("discarding faulty signal message: {0}")]
    MalformedSignal(String),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type RelayResult<T> = Result<T, RelayError>;
