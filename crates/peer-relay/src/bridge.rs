//! Per-peer negotiation state machine.
//!
//! A [`SessionBridge`] walks one remote peer through the offer/answer/candidate
//! exchange and owns the resulting data channel. Every method runs inside a
//! registry handler, so state is never touched concurrently. Relay sends and
//! timers run as detached tasks that post their completion back to the
//! registry as a [`BridgeEvent`] tagged with the bridge id.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::{RelayError, RelayResult};
use crate::events::{PeerSummary, RelayEvent};
use crate::identity::{DomainKey, PeerIdentity};
use crate::peer::{PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventSink, SdpKind};
use crate::registry::RegistryInput;
use crate::relay::{RelayTransport, SendFailure};
use crate::signal::{RelayEnvelope, SignalMessage};

pub type BridgeId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    OfferSent,
    OfferReceived,
    Exchanged,
    Connected,
    Disconnected,
}

#[derive(Debug)]
pub(crate) enum BridgeEvent {
    Peer(PeerEvent),
    SignalSent {
        message: SignalMessage,
        outcome: Result<(), SendFailure>,
        retry: bool,
    },
    RetryElapsed,
    NegotiationDeadline,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct BridgeTiming {
    pub retry_delay: Duration,
    pub negotiation_timeout: Option<Duration>,
}

/// Shared collaborators handed to every bridge the registry opens.
pub(crate) struct BridgeContext {
    pub relay: Arc<dyn RelayTransport>,
    pub peers: Arc<dyn PeerConnectionFactory>,
    pub inputs: mpsc::UnboundedSender<RegistryInput>,
    pub events: mpsc::UnboundedSender<RelayEvent>,
    pub timing: BridgeTiming,
}

struct Outbound {
    envelope: RelayEnvelope,
    retry: bool,
}

enum RetryState {
    Idle,
    Armed(JoinHandle<()>),
    /// The backlog head is on the wire; the line stays held until it resolves.
    InFlight,
}

impl RetryState {
    fn holds_line(&self) -> bool {
        !matches!(self, RetryState::Idle)
    }
}

pub struct SessionBridge {
    id: BridgeId,
    key: DomainKey,
    peer: PeerIdentity,
    source: PeerIdentity,
    state: BridgeState,
    initiated: bool,
    remote_description_set: bool,
    candidate_queue: VecDeque<String>,
    signal_backlog: VecDeque<SignalMessage>,
    retry: RetryState,
    deadline: Option<JoinHandle<()>>,
    pending_data: VecDeque<Bytes>,
    connection: Option<Arc<dyn PeerConnection>>,
    outbound: mpsc::UnboundedSender<Outbound>,
    inputs: mpsc::UnboundedSender<RegistryInput>,
    events: mpsc::UnboundedSender<RelayEvent>,
    timing: BridgeTiming,
}

impl SessionBridge {
    pub(crate) async fn open(
        id: BridgeId,
        key: DomainKey,
        peer: PeerIdentity,
        source: PeerIdentity,
        ctx: &BridgeContext,
    ) -> RelayResult<Self> {
        let sink = PeerEventSink::new(key.clone(), id, ctx.inputs.clone());
        let connection = ctx.peers.create(sink).await?;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(signal_pump(
            Arc::clone(&ctx.relay),
            outbound_rx,
            ctx.inputs.clone(),
            key.clone(),
            id,
        ));
        debug!(target = "relay", domain = %key, bridge = id, peer = %peer, "bridge opened");
        Ok(Self {
            id,
            key,
            peer,
            source,
            state: BridgeState::Idle,
            initiated: false,
            remote_description_set: false,
            candidate_queue: VecDeque::new(),
            signal_backlog: VecDeque::new(),
            retry: RetryState::Idle,
            deadline: None,
            pending_data: VecDeque::new(),
            connection: Some(connection),
            outbound,
            inputs: ctx.inputs.clone(),
            events: ctx.events.clone(),
            timing: ctx.timing,
        })
    }

    pub fn id(&self) -> BridgeId {
        self.id
    }

    pub fn domain(&self) -> &DomainKey {
        &self.key
    }

    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    /// Identity this bridge signs its relay envelopes with.
    pub fn source(&self) -> &PeerIdentity {
        &self.source
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn is_initiator(&self) -> bool {
        self.initiated
    }

    pub fn is_terminated(&self) -> bool {
        self.state == BridgeState::Disconnected
    }

    pub fn retry_armed(&self) -> bool {
        matches!(self.retry, RetryState::Armed(_))
    }

    pub fn queued_candidates(&self) -> impl Iterator<Item = &str> {
        self.candidate_queue.iter().map(String::as_str)
    }

    pub fn signal_backlog(&self) -> impl Iterator<Item = &SignalMessage> {
        self.signal_backlog.iter()
    }

    pub fn pending_data_len(&self) -> usize {
        self.pending_data.len()
    }

    pub fn summary(&self) -> PeerSummary {
        PeerSummary::new(&self.peer, &self.key)
    }

    /// Creates and sends a local offer. Only valid from `Idle`.
    pub async fn initiate(&mut self) -> RelayResult<()> {
        if self.state != BridgeState::Idle {
            return Err(RelayError::Negotiation(format!(
                "cannot initiate from {:?}",
                self.state
            )));
        }
        let connection = self.connection()?;
        let sdp = connection.create_offer().await?;
        connection
            .set_local_description(SdpKind::Offer, &sdp)
            .await?;
        self.initiated = true;
        self.state = BridgeState::OfferSent;
        self.arm_deadline();
        debug!(target = "relay", domain = %self.key, "offer created");
        self.signal(SignalMessage::Offer { sdp });
        Ok(())
    }

    pub async fn on_signal(&mut self, message: SignalMessage) {
        if self.is_terminated() {
            trace!(
                target = "relay",
                domain = %self.key,
                kind = message.kind(),
                "ignoring signal for terminated bridge"
            );
            return;
        }
        trace!(target = "relay", domain = %self.key, kind = message.kind(), "signal received");
        self.arm_deadline();
        let result = match message {
            SignalMessage::Offer { sdp } => self.accept_offer(sdp).await,
            SignalMessage::Answer { sdp } => self.accept_answer(sdp).await,
            SignalMessage::Candidate { candidate } => {
                self.accept_candidate(candidate).await;
                Ok(())
            }
            SignalMessage::Disconnect => {
                self.terminate(true).await;
                Ok(())
            }
            SignalMessage::Unrecognized => {
                warn!(
                    target = "relay",
                    domain = %self.key,
                    "unrecognized signal message from relay"
                );
                Ok(())
            }
        };
        if let Err(error) = result {
            self.fail(error).await;
        }
    }

    async fn accept_offer(&mut self, sdp: String) -> RelayResult<()> {
        let connection = self.connection()?;
        if self.state == BridgeState::OfferSent && !self.remote_description_set {
            if !self.yields_on_collision() {
                debug!(target = "relay", domain = %self.key, "offer collision; keeping local offer");
                return Ok(());
            }
            debug!(target = "relay", domain = %self.key, "offer collision; yielding to remote offer");
            connection.rollback().await?;
            self.initiated = false;
            self.state = BridgeState::Idle;
        }
        if self.remote_description_set || self.state != BridgeState::Idle {
            self.reject(format!("offer received in state {:?}", self.state));
            return Ok(());
        }
        self.state = BridgeState::OfferReceived;
        connection
            .set_remote_description(SdpKind::Offer, &sdp)
            .await?;
        self.flush_candidates(&connection).await;
        let answer = connection.create_answer().await?;
        connection
            .set_local_description(SdpKind::Answer, &answer)
            .await?;
        self.state = BridgeState::Exchanged;
        self.arm_deadline();
        debug!(target = "relay", domain = %self.key, "answer created");
        self.signal(SignalMessage::Answer { sdp: answer });
        Ok(())
    }

    /// When both sides offer at once, the side whose identity sorts first
    /// (user, then application) drops its own offer and answers the other.
    fn yields_on_collision(&self) -> bool {
        (&self.source.user, &self.source.application) < (&self.peer.user, &self.peer.application)
    }

    async fn accept_answer(&mut self, sdp: String) -> RelayResult<()> {
        if !self.initiated || self.state != BridgeState::OfferSent || self.remote_description_set {
            self.reject(format!(
                "answer received in state {:?} (initiator: {})",
                self.state, self.initiated
            ));
            return Ok(());
        }
        let connection = self.connection()?;
        connection
            .set_remote_description(SdpKind::Answer, &sdp)
            .await?;
        self.flush_candidates(&connection).await;
        self.state = BridgeState::Exchanged;
        debug!(target = "relay", domain = %self.key, "offer exchanged");
        Ok(())
    }

    async fn accept_candidate(&mut self, candidate: String) {
        if !self.remote_description_set {
            self.candidate_queue.push_back(candidate);
            trace!(
                target = "relay",
                domain = %self.key,
                queued = self.candidate_queue.len(),
                "queued remote candidate until offer exchange"
            );
            return;
        }
        if let Some(connection) = self.connection.clone() {
            self.apply_candidate(&connection, &candidate).await;
        }
    }

    async fn flush_candidates(&mut self, connection: &Arc<dyn PeerConnection>) {
        self.remote_description_set = true;
        let queued = std::mem::take(&mut self.candidate_queue);
        if !queued.is_empty() {
            debug!(
                target = "relay",
                domain = %self.key,
                count = queued.len(),
                "applying queued remote candidates"
            );
        }
        for candidate in queued {
            self.apply_candidate(connection, &candidate).await;
        }
    }

    async fn apply_candidate(&self, connection: &Arc<dyn PeerConnection>, candidate: &str) {
        if let Err(err) = connection.add_candidate(candidate).await {
            warn!(
                target = "relay",
                domain = %self.key,
                error = %err,
                "failed to add remote candidate"
            );
        }
    }

    /// Writes application bytes, queueing them until the channel opens.
    pub async fn send(&mut self, data: Bytes) -> RelayResult<()> {
        match self.state {
            BridgeState::Disconnected => Err(RelayError::Closed),
            BridgeState::Connected => {
                let connection = self.connection()?;
                connection.send(data).await.map_err(RelayError::from)
            }
            _ => {
                self.pending_data.push_back(data);
                Ok(())
            }
        }
    }

    pub(crate) async fn handle(&mut self, event: BridgeEvent) {
        match event {
            BridgeEvent::Peer(event) => self.on_peer_event(event).await,
            BridgeEvent::SignalSent {
                message,
                outcome,
                retry,
            } => self.on_signal_sent(message, outcome, retry),
            BridgeEvent::RetryElapsed => self.on_retry_elapsed(),
            BridgeEvent::NegotiationDeadline => self.on_deadline().await,
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        if self.is_terminated() {
            return;
        }
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                self.signal(SignalMessage::Candidate { candidate });
            }
            PeerEvent::ChannelOpen => self.on_channel_open().await,
            PeerEvent::ChannelClose => {
                debug!(target = "relay", domain = %self.key, "data channel closed");
                self.terminate(true).await;
            }
            PeerEvent::ChannelError(err) => {
                warn!(target = "relay", domain = %self.key, error = %err, "data channel error");
                self.emit_error(RelayError::Channel(err));
            }
            PeerEvent::ChannelMessage(data) => {
                self.emit(RelayEvent::Message {
                    peer: self.summary(),
                    data,
                });
            }
        }
    }

    async fn on_channel_open(&mut self) {
        if self.state == BridgeState::Connected {
            return;
        }
        self.state = BridgeState::Connected;
        if let Some(deadline) = self.deadline.take() {
            deadline.abort();
        }
        let pending = std::mem::take(&mut self.pending_data);
        if let Some(connection) = self.connection.clone() {
            for data in pending {
                if let Err(err) = connection.send(data).await {
                    warn!(
                        target = "relay",
                        domain = %self.key,
                        error = %err,
                        "failed to flush queued channel data"
                    );
                    self.emit_error(RelayError::Channel(err.to_string()));
                }
            }
        }
        info!(target = "relay", domain = %self.key, "peer connected");
        self.emit(RelayEvent::Connected(self.summary()));
    }

    /// Sends a signal to the peer, or queues it behind the backlog while a retry holds the line.
    pub(crate) fn signal(&mut self, message: SignalMessage) {
        if self.retry.holds_line() {
            self.signal_backlog.push_back(message);
            trace!(
                target = "relay",
                domain = %self.key,
                backlog = self.signal_backlog.len(),
                "signal queued behind backlog"
            );
            return;
        }
        self.dispatch(message, false);
    }

    fn dispatch(&self, message: SignalMessage, retry: bool) {
        let envelope = RelayEnvelope {
            source: self.source.clone(),
            destination: self.peer.clone(),
            message,
        };
        if self.outbound.send(Outbound { envelope, retry }).is_err() {
            warn!(target = "relay", domain = %self.key, "signal pump stopped; dropping signal");
        }
    }

    fn on_signal_sent(
        &mut self,
        message: SignalMessage,
        outcome: Result<(), SendFailure>,
        retry: bool,
    ) {
        if self.is_terminated() {
            return;
        }
        match outcome {
            Ok(()) if retry => {
                self.signal_backlog.pop_front();
                self.retry = RetryState::Idle;
                debug!(
                    target = "relay",
                    domain = %self.key,
                    remaining = self.signal_backlog.len(),
                    "relay accepted backlogged signal"
                );
                self.drain_backlog();
            }
            Ok(()) => {
                trace!(target = "relay", domain = %self.key, kind = message.kind(), "signal delivered");
            }
            Err(failure) if failure.is_transient() => {
                if retry {
                    self.retry = RetryState::Idle;
                } else {
                    self.signal_backlog.push_back(message);
                }
                debug!(
                    target = "relay",
                    domain = %self.key,
                    status = failure.status,
                    backlog = self.signal_backlog.len(),
                    "peer not reachable yet; retry scheduled"
                );
                self.arm_retry();
            }
            Err(failure) => {
                warn!(
                    target = "relay",
                    domain = %self.key,
                    kind = message.kind(),
                    status = failure.status,
                    reason = %failure.reason,
                    "relay rejected signal; dropping it"
                );
                self.emit_error(RelayError::from(failure));
                if retry {
                    self.signal_backlog.pop_front();
                    self.retry = RetryState::Idle;
                    self.drain_backlog();
                }
            }
        }
    }

    fn drain_backlog(&mut self) {
        let backlog = std::mem::take(&mut self.signal_backlog);
        for message in backlog {
            self.signal(message);
        }
    }

    fn on_retry_elapsed(&mut self) {
        if !matches!(self.retry, RetryState::Armed(_)) {
            return;
        }
        self.retry = RetryState::Idle;
        let Some(head) = self.signal_backlog.front().cloned() else {
            return;
        };
        trace!(
            target = "relay",
            domain = %self.key,
            kind = head.kind(),
            backlog = self.signal_backlog.len(),
            "retrying backlog head"
        );
        self.retry = RetryState::InFlight;
        self.dispatch(head, true);
    }

    fn arm_retry(&mut self) {
        if self.retry.holds_line() {
            return;
        }
        let timer = self.schedule(self.timing.retry_delay, BridgeEvent::RetryElapsed);
        self.retry = RetryState::Armed(timer);
    }

    fn arm_deadline(&mut self) {
        let Some(timeout) = self.timing.negotiation_timeout else {
            return;
        };
        if self.deadline.is_some() || self.state == BridgeState::Connected {
            return;
        }
        self.deadline = Some(self.schedule(timeout, BridgeEvent::NegotiationDeadline));
    }

    async fn on_deadline(&mut self) {
        self.deadline = None;
        if matches!(
            self.state,
            BridgeState::Connected | BridgeState::Disconnected
        ) {
            return;
        }
        let error = RelayError::Negotiation(format!(
            "no connection established before deadline (state {:?})",
            self.state
        ));
        self.fail(error).await;
    }

    fn schedule(&self, delay: Duration, event: BridgeEvent) -> JoinHandle<()> {
        let inputs = self.inputs.clone();
        let key = self.key.clone();
        let id = self.id;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inputs.send(RegistryInput::bridge(key, id, event));
        })
    }

    /// Tears the bridge down. Idempotent; only the first call emits `Disconnected`.
    pub async fn terminate(&mut self, suppress_signal: bool) {
        if self.is_terminated() {
            return;
        }
        if !suppress_signal {
            self.dispatch(SignalMessage::Disconnect, false);
        }
        let dropped = self.teardown().await;
        info!(
            target = "relay",
            domain = %self.key,
            dropped_signals = dropped,
            "peer disconnected"
        );
        self.emit(RelayEvent::Disconnected(self.summary()));
    }

    /// Closes a bridge that was never announced: no signal, no `Disconnected` event.
    pub(crate) async fn discard(&mut self) {
        if self.is_terminated() {
            return;
        }
        self.teardown().await;
        debug!(target = "relay", domain = %self.key, "bridge discarded");
    }

    async fn teardown(&mut self) -> usize {
        self.cancel_timers();
        let dropped = self.signal_backlog.len();
        self.signal_backlog.clear();
        self.candidate_queue.clear();
        self.pending_data.clear();
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }
        self.state = BridgeState::Disconnected;
        dropped
    }

    async fn fail(&mut self, error: RelayError) {
        warn!(
            target = "relay",
            domain = %self.key,
            error = %error,
            "negotiation failed; terminating bridge"
        );
        self.emit_error(error);
        self.terminate(false).await;
    }

    fn reject(&self, reason: String) {
        let error = RelayError::Negotiation(reason);
        warn!(target = "relay", domain = %self.key, error = %error, "ignoring signal");
    }

    fn cancel_timers(&mut self) {
        if let RetryState::Armed(timer) = std::mem::replace(&mut self.retry, RetryState::Idle) {
            timer.abort();
        }
        if let Some(deadline) = self.deadline.take() {
            deadline.abort();
        }
    }

    fn connection(&self) -> RelayResult<Arc<dyn PeerConnection>> {
        self.connection.clone().ok_or(RelayError::Closed)
    }

    fn emit(&self, event: RelayEvent) {
        let _ = self.events.send(event);
    }

    fn emit_error(&self, error: RelayError) {
        self.emit(RelayEvent::Error {
            peer: Some(self.summary()),
            error,
        });
    }
}

impl Drop for SessionBridge {
    fn drop(&mut self) {
        self.cancel_timers();
    }
}

/// Sends one envelope at a time, in submission order, reporting each outcome.
async fn signal_pump(
    relay: Arc<dyn RelayTransport>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    inputs: mpsc::UnboundedSender<RegistryInput>,
    key: DomainKey,
    id: BridgeId,
) {
    while let Some(Outbound { envelope, retry }) = outbound.recv().await {
        let message = envelope.message.clone();
        let outcome = relay.send(envelope).await;
        let event = BridgeEvent::SignalSent {
            message,
            outcome,
            retry,
        };
        if inputs.send(RegistryInput::bridge(key.clone(), id, event)).is_err() {
            break;
        }
    }
}
