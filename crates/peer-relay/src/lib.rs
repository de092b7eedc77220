//! Peer-to-peer session negotiation over a signaling relay.
//!
//! A [`RelayRegistry`] holds the access session and the relay subscription, and
//! keeps at most one [`SessionBridge`] per remote peer. Each bridge runs the
//! offer/answer/candidate exchange against an injected [`PeerConnection`] and
//! reports progress as [`RelayEvent`]s.

pub mod bridge;
pub mod config;
pub mod error;
pub mod events;
pub mod http_relay;
pub mod identity;
pub mod mock;
pub mod peer;
pub mod registry;
pub mod relay;
pub mod rtc;
pub mod signal;

pub use bridge::{BridgeId, BridgeState, SessionBridge};
pub use config::RelayConfig;
pub use error::{RelayError, RelayResult};
pub use events::{PeerSummary, RelayEvent};
pub use http_relay::HttpRelay;
pub use identity::{AccessSession, DomainKey, PeerIdentity};
pub use peer::{PeerConnection, PeerConnectionFactory, PeerError, PeerEvent, PeerEventSink, SdpKind};
pub use registry::{ConnectOptions, QueuedInput, RelayRegistry};
pub use relay::{InboundStream, RelayTransport, SendFailure};
pub use rtc::{WebRtcPeerConfig, WebRtcPeerFactory};
pub use signal::{InboundSignal, RelayEnvelope, SignalMessage};
