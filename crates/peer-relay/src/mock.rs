//! In-memory relay and peer connection doubles.
//!
//! `MockRelay` records every send attempt and can be scripted to fail; inbound
//! traffic is injected with [`MockRelay::deliver`]. `MockPeerFactory` hands out
//! [`MockPeer`]s that log each capability call and let tests raise peer events.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::channel::mpsc;
use parking_lot::Mutex;

use crate::error::{RelayError, RelayResult};
use crate::identity::{AccessSession, DomainKey, PeerIdentity};
use crate::peer::{PeerConnection, PeerConnectionFactory, PeerError, PeerEvent, PeerEventSink, SdpKind};
use crate::relay::{InboundStream, PEER_UNREACHABLE, RelayTransport, SendFailure};
use crate::signal::{InboundSignal, RelayEnvelope, SignalMessage};

type InboundSender = mpsc::UnboundedSender<RelayResult<InboundSignal>>;

#[derive(Default)]
pub struct MockRelay {
    attempts: Mutex<Vec<RelayEnvelope>>,
    sent: Mutex<Vec<RelayEnvelope>>,
    failures: Mutex<VecDeque<u16>>,
    inbound: Mutex<Option<InboundSender>>,
    subscriptions: Mutex<Vec<String>>,
    session: Mutex<Option<AccessSession>>,
    subscribe_error: Mutex<Option<RelayError>>,
    forward: Mutex<Option<Arc<MockRelay>>>,
}

impl MockRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fails the next send with `status`.
    pub fn fail_next(&self, status: u16) {
        self.fail_next_n(status, 1);
    }

    pub fn fail_next_n(&self, status: u16, count: usize) {
        let mut failures = self.failures.lock();
        failures.extend(std::iter::repeat_n(status, count));
    }

    /// Delivers every accepted envelope to `other`'s subscriber. Sends fail with 504 while it has none.
    pub fn forward_to(&self, other: Arc<MockRelay>) {
        *self.forward.lock() = Some(other);
    }

    /// Envelopes the relay accepted, in order.
    pub fn sent(&self) -> Vec<RelayEnvelope> {
        self.sent.lock().clone()
    }

    pub fn sent_messages(&self) -> Vec<SignalMessage> {
        self.sent.lock().iter().map(|env| env.message.clone()).collect()
    }

    /// Every send attempt, including failed ones.
    pub fn attempts(&self) -> Vec<SignalMessage> {
        self.attempts
            .lock()
            .iter()
            .map(|env| env.message.clone())
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }

    pub fn authorized(&self) -> Option<AccessSession> {
        self.session.lock().clone()
    }

    /// Makes the next `subscribe` call fail with `error`.
    pub fn reject_subscriptions(&self, error: RelayError) {
        *self.subscribe_error.lock() = Some(error);
    }

    /// Pushes an inbound signal to the current subscriber. Returns false if nobody is listening.
    pub fn deliver(&self, source: PeerIdentity, message: SignalMessage) -> bool {
        self.deliver_raw(Ok(InboundSignal::new(source, message)))
    }

    pub fn deliver_raw(&self, item: RelayResult<InboundSignal>) -> bool {
        match self.inbound.lock().as_ref() {
            Some(tx) => tx.unbounded_send(item).is_ok(),
            None => false,
        }
    }

    /// Ends the current subscription stream.
    pub fn close_subscription(&self) {
        self.inbound.lock().take();
    }
}

#[async_trait]
impl RelayTransport for MockRelay {
    fn authorize(&self, session: Option<&AccessSession>) {
        *self.session.lock() = session.cloned();
    }

    async fn send(&self, envelope: RelayEnvelope) -> Result<(), SendFailure> {
        self.attempts.lock().push(envelope.clone());
        let scripted = self.failures.lock().pop_front();
        if let Some(status) = scripted {
            return Err(SendFailure::new(status, "scripted failure"));
        }
        let forward = self.forward.lock().clone();
        if let Some(other) = forward {
            if !other.deliver(envelope.source.clone(), envelope.message.clone()) {
                return Err(SendFailure::new(PEER_UNREACHABLE, "destination not subscribed"));
            }
        }
        self.sent.lock().push(envelope);
        Ok(())
    }

    async fn subscribe(&self, user_id: &str) -> RelayResult<InboundStream> {
        if let Some(error) = self.subscribe_error.lock().take() {
            return Err(error);
        }
        self.subscriptions.lock().push(user_id.to_string());
        let (tx, rx) = mpsc::unbounded();
        *self.inbound.lock() = Some(tx);
        Ok(rx.boxed())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCall {
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpKind, String),
    SetRemote(SdpKind, String),
    Rollback,
    AddCandidate(String),
    Send(Bytes),
    Close,
}

#[derive(Default)]
pub struct MockPeerFactory {
    peers: Mutex<Vec<Arc<MockPeer>>>,
    fail_next: AtomicBool,
    fail_offer: AtomicBool,
}

impl MockPeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_create(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// The next peer created refuses to produce an offer.
    pub fn fail_next_offer(&self) {
        self.fail_offer.store(true, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn peer(&self, index: usize) -> Option<Arc<MockPeer>> {
        self.peers.lock().get(index).cloned()
    }

    pub fn last(&self) -> Option<Arc<MockPeer>> {
        self.peers.lock().last().cloned()
    }

    /// Most recent peer created for `key`.
    pub fn peer_for(&self, key: &DomainKey) -> Option<Arc<MockPeer>> {
        self.peers
            .lock()
            .iter()
            .rev()
            .find(|peer| peer.domain() == key)
            .cloned()
    }
}

#[async_trait]
impl PeerConnectionFactory for MockPeerFactory {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>, PeerError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(PeerError::Setup("scripted failure".into()));
        }
        let mut peers = self.peers.lock();
        let peer = MockPeer::new(events, peers.len());
        peer.reject_offer
            .store(self.fail_offer.swap(false, Ordering::SeqCst), Ordering::SeqCst);
        let peer = Arc::new(peer);
        peers.push(Arc::clone(&peer));
        Ok(peer)
    }
}

pub struct MockPeer {
    events: PeerEventSink,
    index: usize,
    calls: Mutex<Vec<PeerCall>>,
    closed: AtomicBool,
    reject_remote: AtomicBool,
    reject_offer: AtomicBool,
}

impl MockPeer {
    fn new(events: PeerEventSink, index: usize) -> Self {
        Self {
            events,
            index,
            calls: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            reject_remote: AtomicBool::new(false),
            reject_offer: AtomicBool::new(false),
        }
    }

    pub fn domain(&self) -> &DomainKey {
        self.events.domain()
    }

    /// Raises a peer event as the real connection would from its callbacks.
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.events.emit(event)
    }

    pub fn reject_remote_descriptions(&self) {
        self.reject_remote.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<PeerCall> {
        self.calls.lock().clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                PeerCall::AddCandidate(candidate) => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                PeerCall::Send(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn record(&self, call: PeerCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn create_offer(&self) -> Result<String, PeerError> {
        self.record(PeerCall::CreateOffer);
        if self.reject_offer.load(Ordering::SeqCst) {
            return Err(PeerError::Description("scripted offer failure".into()));
        }
        Ok(format!("v=0 mock-offer-{}", self.index))
    }

    async fn create_answer(&self) -> Result<String, PeerError> {
        self.record(PeerCall::CreateAnswer);
        Ok(format!("v=0 mock-answer-{}", self.index))
    }

    async fn set_local_description(&self, kind: SdpKind, sdp: &str) -> Result<(), PeerError> {
        self.record(PeerCall::SetLocal(kind, sdp.to_string()));
        Ok(())
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), PeerError> {
        if self.reject_remote.load(Ordering::SeqCst) {
            return Err(PeerError::Description(format!("rejected {kind:?}")));
        }
        self.record(PeerCall::SetRemote(kind, sdp.to_string()));
        Ok(())
    }

    async fn rollback(&self) -> Result<(), PeerError> {
        self.record(PeerCall::Rollback);
        Ok(())
    }

    async fn add_candidate(&self, candidate: &str) -> Result<(), PeerError> {
        self.record(PeerCall::AddCandidate(candidate.to_string()));
        Ok(())
    }

    async fn send(&self, data: Bytes) -> Result<(), PeerError> {
        if self.is_closed() {
            return Err(PeerError::Closed);
        }
        self.record(PeerCall::Send(data));
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.record(PeerCall::Close);
    }
}
