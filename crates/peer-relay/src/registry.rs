//! Relay registry: access session, inbound routing and bridge lifecycle.
//!
//! The registry is a single-owner actor. Callers drive it with [`RelayRegistry::step`]
//! (or [`RelayRegistry::process_pending`]); every asynchronous completion comes
//! back through one input queue, so bridge state is only ever touched from here.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::bridge::{BridgeContext, BridgeEvent, BridgeId, BridgeState, BridgeTiming, SessionBridge};
use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::events::{PeerSummary, RelayEvent};
use crate::identity::{AccessSession, DomainKey, PeerIdentity};
use crate::peer::PeerConnectionFactory;
use crate::relay::RelayTransport;
use crate::signal::{InboundSignal, SignalMessage};

#[derive(Debug)]
pub(crate) struct BridgeInput {
    pub key: DomainKey,
    pub bridge: BridgeId,
    pub event: BridgeEvent,
}

#[derive(Debug)]
pub(crate) enum RegistryInput {
    Inbound(InboundSignal),
    SubscriptionFailed(RelayError),
    SubscriptionEnded,
    Bridge(BridgeInput),
}

impl RegistryInput {
    pub(crate) fn bridge(key: DomainKey, bridge: BridgeId, event: BridgeEvent) -> Self {
        RegistryInput::Bridge(BridgeInput { key, bridge, event })
    }
}

/// Input taken off the registry queue by [`RelayRegistry::next_input`].
#[derive(Debug)]
pub struct QueuedInput(RegistryInput);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Send an offer right away instead of waiting for the peer's.
    pub initiate: bool,
}

impl ConnectOptions {
    pub fn passive() -> Self {
        Self { initiate: false }
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self { initiate: true }
    }
}

pub struct RelayRegistry {
    config: RelayConfig,
    provider_domain: String,
    ctx: BridgeContext,
    inputs: mpsc::UnboundedReceiver<RegistryInput>,
    events: Option<mpsc::UnboundedReceiver<RelayEvent>>,
    access: Option<AccessSession>,
    subscription: Option<JoinHandle<()>>,
    bridges: HashMap<DomainKey, SessionBridge>,
    next_bridge_id: BridgeId,
}

impl RelayRegistry {
    pub fn new(
        config: RelayConfig,
        relay: Arc<dyn RelayTransport>,
        peers: Arc<dyn PeerConnectionFactory>,
    ) -> Self {
        let (inputs_tx, inputs) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let provider_domain = config.provider_domain();
        let ctx = BridgeContext {
            relay,
            peers,
            inputs: inputs_tx,
            events: events_tx,
            timing: BridgeTiming {
                retry_delay: config.retry_delay,
                negotiation_timeout: config.negotiation_timeout,
            },
        };
        Self {
            config,
            provider_domain,
            ctx,
            inputs,
            events: Some(events),
            access: None,
            subscription: None,
            bridges: HashMap::new(),
            next_bridge_id: 1,
        }
    }

    /// Hands out the event receiver. Only the first call returns it.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<RelayEvent>> {
        self.events.take()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn provider_domain(&self) -> &str {
        &self.provider_domain
    }

    pub fn access(&self) -> Option<&AccessSession> {
        self.access.as_ref()
    }

    pub fn domain_key(&self, peer: &PeerIdentity) -> DomainKey {
        DomainKey::for_peer(peer, &self.provider_domain)
    }

    pub fn bridge(&self, key: &DomainKey) -> Option<&SessionBridge> {
        self.bridges.get(key)
    }

    pub fn bridges(&self) -> impl Iterator<Item = &SessionBridge> {
        self.bridges.values()
    }

    pub fn len(&self) -> usize {
        self.bridges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bridges.is_empty()
    }

    /// Installs (or with `None`, clears) the access token and (re)subscribes to the relay.
    ///
    /// A malformed token is rejected before anything changes. Switching to a
    /// different user terminates the bridges opened under the old identity.
    pub async fn set_access_token(&mut self, token: Option<&str>) -> RelayResult<()> {
        match token {
            Some(token) => {
                let session = AccessSession::from_token(token, &self.config.application)?;
                let user_id = session.user_id.clone();
                let stale: Vec<DomainKey> = self
                    .bridges
                    .values()
                    .filter(|bridge| bridge.source() != &session.source)
                    .map(|bridge| bridge.domain().clone())
                    .collect();
                if !stale.is_empty() {
                    info!(
                        target = "relay",
                        user_id = %user_id,
                        count = stale.len(),
                        "identity changed; closing bridges"
                    );
                }
                for key in stale {
                    if let Some(bridge) = self.bridges.get_mut(&key) {
                        bridge.terminate(false).await;
                    }
                    self.reap(&key);
                }
                self.ctx.relay.authorize(Some(&session));
                self.access = Some(session);
                self.subscribe(user_id.clone());
                info!(target = "relay", user_id = %user_id, "access granted");
                self.emit(RelayEvent::AccessGranted { user_id });
            }
            None => {
                self.stop_subscription();
                self.access = None;
                self.ctx.relay.authorize(None);
                info!(target = "relay", "access cleared");
                self.emit(RelayEvent::AccessDenied);
            }
        }
        Ok(())
    }

    fn subscribe(&mut self, user_id: String) {
        self.stop_subscription();
        let relay = Arc::clone(&self.ctx.relay);
        let inputs = self.ctx.inputs.clone();
        self.subscription = Some(tokio::spawn(async move {
            let mut stream = match relay.subscribe(&user_id).await {
                Ok(stream) => stream,
                Err(err) => {
                    let _ = inputs.send(RegistryInput::SubscriptionFailed(err));
                    return;
                }
            };
            debug!(target = "relay", user_id = %user_id, "relay stream established");
            while let Some(item) = stream.next().await {
                let input = match item {
                    Ok(signal) => RegistryInput::Inbound(signal),
                    Err(err) => RegistryInput::SubscriptionFailed(err),
                };
                if inputs.send(input).is_err() {
                    return;
                }
            }
            let _ = inputs.send(RegistryInput::SubscriptionEnded);
        }));
    }

    fn stop_subscription(&mut self) {
        if let Some(task) = self.subscription.take() {
            task.abort();
        }
    }

    /// Opens (or reuses) the bridge for `peer`, optionally sending an offer.
    pub async fn connect(
        &mut self,
        peer: PeerIdentity,
        options: ConnectOptions,
    ) -> RelayResult<DomainKey> {
        let source = self
            .access
            .as_ref()
            .map(|access| access.source.clone())
            .ok_or(RelayError::AccessDenied)?;
        peer.validate()?;
        let key = self.domain_key(&peer);

        if let Some(existing) = self.bridges.get_mut(&key) {
            if options.initiate && existing.state() == BridgeState::Idle {
                if let Err(err) = existing.initiate().await {
                    existing.discard().await;
                    self.reap(&key);
                    return Err(err);
                }
            } else {
                debug!(target = "relay", domain = %key, "reusing live bridge");
            }
            return Ok(key);
        }

        let id = self.next_bridge_id;
        self.next_bridge_id += 1;
        let mut bridge = SessionBridge::open(id, key.clone(), peer, source, &self.ctx).await?;
        if options.initiate {
            if let Err(err) = bridge.initiate().await {
                warn!(target = "relay", domain = %key, error = %err, "failed to send offer");
                bridge.discard().await;
                return Err(err);
            }
        }
        info!(
            target = "relay",
            domain = %key,
            initiate = options.initiate,
            "bridge registered"
        );
        self.bridges.insert(key.clone(), bridge);
        Ok(key)
    }

    /// Routes one relay message, opening a passive bridge for unknown peers.
    ///
    /// A `disconnect` from a peer with no bridge is dropped instead of opening
    /// one just to tear it down; that is the one inbound signal that does not
    /// land on a live bridge.
    pub async fn dispatch_inbound(&mut self, inbound: InboundSignal) {
        let InboundSignal { source, message } = inbound;
        if let Err(err) = source.validate() {
            warn!(target = "relay", error = %err, "discarding signal with faulty source");
            return;
        }
        let key = self.domain_key(&source);
        if !self.bridges.contains_key(&key) {
            if message == SignalMessage::Disconnect {
                trace!(target = "relay", domain = %key, "disconnect for unknown peer");
                return;
            }
            let summary = PeerSummary::new(&source, &key);
            if let Err(error) = self.connect(source, ConnectOptions::passive()).await {
                warn!(target = "relay", domain = %key, error = %error, "failed to open passive bridge");
                self.emit(RelayEvent::Error {
                    peer: Some(summary),
                    error,
                });
                return;
            }
        }
        if let Some(bridge) = self.bridges.get_mut(&key) {
            bridge.on_signal(message).await;
        }
        self.reap(&key);
    }

    pub async fn terminate(&mut self, key: &DomainKey) -> RelayResult<()> {
        let bridge = self
            .bridges
            .get_mut(key)
            .ok_or_else(|| RelayError::UnknownPeer(key.clone()))?;
        bridge.terminate(false).await;
        self.reap(key);
        Ok(())
    }

    pub async fn send(&mut self, key: &DomainKey, data: Bytes) -> RelayResult<()> {
        let bridge = self
            .bridges
            .get_mut(key)
            .ok_or_else(|| RelayError::UnknownPeer(key.clone()))?;
        bridge.send(data).await
    }

    /// Terminates every bridge and drops the relay subscription.
    pub async fn shutdown(&mut self) {
        self.stop_subscription();
        let keys: Vec<DomainKey> = self.bridges.keys().cloned().collect();
        for key in keys {
            if let Some(bridge) = self.bridges.get_mut(&key) {
                bridge.terminate(false).await;
            }
            self.reap(&key);
        }
        debug!(target = "relay", "registry shut down");
    }

    /// Waits for the next input and handles it.
    pub async fn step(&mut self) -> bool {
        match self.next_input().await {
            Some(input) => {
                self.handle(input).await;
                true
            }
            None => false,
        }
    }

    /// Takes the next input off the queue without handling it. Cancel safe.
    pub async fn next_input(&mut self) -> Option<QueuedInput> {
        self.inputs.recv().await.map(QueuedInput)
    }

    pub async fn handle(&mut self, input: QueuedInput) {
        self.handle_input(input.0).await;
    }

    /// Handles every input already queued, without waiting.
    pub async fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(input) = self.inputs.try_recv() {
            self.handle_input(input).await;
            handled += 1;
        }
        handled
    }

    async fn handle_input(&mut self, input: RegistryInput) {
        match input {
            RegistryInput::Inbound(signal) => self.dispatch_inbound(signal).await,
            RegistryInput::SubscriptionFailed(RelayError::MalformedSignal(reason)) => {
                warn!(target = "relay", reason = %reason, "discarding faulty signal message");
            }
            RegistryInput::SubscriptionFailed(error) => {
                warn!(target = "relay", error = %error, "relay subscription failed");
                self.emit(RelayEvent::Error { peer: None, error });
            }
            RegistryInput::SubscriptionEnded => {
                warn!(target = "relay", "relay stream ended");
            }
            RegistryInput::Bridge(BridgeInput { key, bridge, event }) => {
                match self.bridges.get_mut(&key) {
                    Some(entry) if entry.id() == bridge => entry.handle(event).await,
                    _ => {
                        trace!(target = "relay", domain = %key, bridge, "dropping event for retired bridge");
                        return;
                    }
                }
                self.reap(&key);
            }
        }
    }

    fn reap(&mut self, key: &DomainKey) {
        if self.bridges.get(key).is_some_and(SessionBridge::is_terminated) {
            self.bridges.remove(key);
            debug!(
                target = "relay",
                domain = %key,
                remaining = self.bridges.len(),
                "bridge removed"
            );
        }
    }

    fn emit(&self, event: RelayEvent) {
        let _ = self.ctx.events.send(event);
    }
}

impl Drop for RelayRegistry {
    fn drop(&mut self) {
        self.stop_subscription();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockPeerFactory, MockRelay, PeerCall};

    fn registry() -> (RelayRegistry, Arc<MockRelay>, Arc<MockPeerFactory>) {
        let relay = MockRelay::new();
        let peers = MockPeerFactory::new();
        let config = RelayConfig::new("https://relay.test", "chat")
            .unwrap()
            .with_negotiation_timeout(None);
        let registry = RelayRegistry::new(config, relay.clone(), peers.clone());
        (registry, relay, peers)
    }

    async fn settle(registry: &mut RelayRegistry) {
        loop {
            for _ in 0..16 {
                tokio::task::yield_now().await;
            }
            if registry.process_pending().await == 0 {
                break;
            }
        }
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<RelayEvent>) -> Vec<RelayEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn malformed_token_leaves_state_untouched() {
        let (mut registry, relay, _) = registry();
        let mut events = registry.take_events().unwrap();
        assert!(registry.take_events().is_none());

        registry.set_access_token(Some("alice:secret")).await.unwrap();
        settle(&mut registry).await;
        assert!(matches!(
            registry.set_access_token(Some("alice")).await,
            Err(RelayError::TokenFormat)
        ));
        assert_eq!(registry.access().unwrap().user_id, "alice");
        assert_eq!(relay.subscriptions(), vec!["alice".to_string()]);
        assert_eq!(
            drain(&mut events),
            vec![RelayEvent::AccessGranted {
                user_id: "alice".into()
            }]
        );
    }

    #[tokio::test]
    async fn clearing_token_denies_access() {
        let (mut registry, relay, _) = registry();
        let mut events = registry.take_events().unwrap();
        registry.set_access_token(Some("alice:secret")).await.unwrap();
        registry.set_access_token(None).await.unwrap();
        assert!(registry.access().is_none());
        assert!(relay.authorized().is_none());
        assert_eq!(drain(&mut events).last(), Some(&RelayEvent::AccessDenied));
        assert!(matches!(
            registry
                .connect(PeerIdentity::new("bob", "chat"), ConnectOptions::default())
                .await,
            Err(RelayError::AccessDenied)
        ));
    }

    #[tokio::test]
    async fn connect_sends_offer_and_registers_bridge() {
        let (mut registry, relay, peers) = registry();
        registry.set_access_token(Some("alice:secret")).await.unwrap();
        let key = registry
            .connect(PeerIdentity::new("bob", "chat"), ConnectOptions::default())
            .await
            .unwrap();
        assert_eq!(key.as_str(), "chat_.bob_.relay.test");
        settle(&mut registry).await;

        let bridge = registry.bridge(&key).unwrap();
        assert_eq!(bridge.state(), BridgeState::OfferSent);
        assert!(bridge.is_initiator());
        let sent = relay.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].source, PeerIdentity::new("alice", "chat"));
        assert_eq!(sent[0].destination, PeerIdentity::new("bob", "chat"));
        assert!(matches!(sent[0].message, SignalMessage::Offer { .. }));
        assert_eq!(peers.created(), 1);
    }

    #[tokio::test]
    async fn connect_reuses_live_bridge() {
        let (mut registry, relay, peers) = registry();
        registry.set_access_token(Some("alice:secret")).await.unwrap();
        let bob = PeerIdentity::new("bob", "chat");
        let first = registry.connect(bob.clone(), ConnectOptions::passive()).await.unwrap();
        let second = registry.connect(bob.clone(), ConnectOptions::default()).await.unwrap();
        let third = registry.connect(bob, ConnectOptions::default()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(second, third);
        assert_eq!(registry.len(), 1);
        assert_eq!(peers.created(), 1);
        settle(&mut registry).await;
        assert_eq!(relay.sent_messages().len(), 1, "one offer only");
    }

    #[tokio::test]
    async fn failed_offer_closes_bridge_without_announcing_it() {
        let (mut registry, relay, peers) = registry();
        let mut events = registry.take_events().unwrap();
        registry.set_access_token(Some("alice:secret")).await.unwrap();
        settle(&mut registry).await;
        drain(&mut events);

        peers.fail_next_offer();
        assert!(matches!(
            registry
                .connect(PeerIdentity::new("bob", "chat"), ConnectOptions::default())
                .await,
            Err(RelayError::Peer(_))
        ));
        settle(&mut registry).await;
        assert!(registry.is_empty());
        assert!(peers.last().unwrap().is_closed());
        assert!(relay.attempts().is_empty());
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn switching_user_closes_bridges_of_old_identity() {
        let (mut registry, _, peers) = registry();
        let mut events = registry.take_events().unwrap();
        registry.set_access_token(Some("alice:secret")).await.unwrap();
        let bob = registry
            .connect(PeerIdentity::new("bob", "chat"), ConnectOptions::passive())
            .await
            .unwrap();

        registry.set_access_token(Some("alice:rotated")).await.unwrap();
        assert!(registry.bridge(&bob).is_some(), "same user keeps its bridges");

        registry.set_access_token(Some("carol:secret")).await.unwrap();
        assert!(registry.bridge(&bob).is_none());
        assert!(peers.last().unwrap().is_closed());
        let disconnects = drain(&mut events)
            .into_iter()
            .filter(|event| matches!(event, RelayEvent::Disconnected(_)))
            .count();
        assert_eq!(disconnects, 1);

        let dave = registry
            .connect(PeerIdentity::new("dave", "chat"), ConnectOptions::passive())
            .await
            .unwrap();
        assert_eq!(
            registry.bridge(&dave).unwrap().source(),
            &PeerIdentity::new("carol", "chat")
        );
    }

    #[tokio::test]
    async fn connect_rejects_invalid_identity() {
        let (mut registry, _, _) = registry();
        registry.set_access_token(Some("alice:secret")).await.unwrap();
        assert!(matches!(
            registry
                .connect(PeerIdentity::new("", "chat"), ConnectOptions::default())
                .await,
            Err(RelayError::InvalidIdentity(_))
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn failed_peer_setup_registers_nothing() {
        let (mut registry, _, peers) = registry();
        registry.set_access_token(Some("alice:secret")).await.unwrap();
        peers.fail_next_create();
        assert!(matches!(
            registry
                .connect(PeerIdentity::new("bob", "chat"), ConnectOptions::default())
                .await,
            Err(RelayError::Peer(_))
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn inbound_offer_opens_passive_bridge() {
        let (mut registry, relay, peers) = registry();
        registry.set_access_token(Some("alice:secret")).await.unwrap();
        settle(&mut registry).await;
        relay.deliver(
            PeerIdentity::new("carol", "notes"),
            SignalMessage::Offer {
                sdp: "v=0 carol".into(),
            },
        );
        settle(&mut registry).await;

        let key = registry.domain_key(&PeerIdentity::new("carol", "notes"));
        let bridge = registry.bridge(&key).expect("passive bridge");
        assert!(!bridge.is_initiator());
        assert_eq!(bridge.state(), BridgeState::Exchanged);
        let peer = peers.last().unwrap();
        assert!(peer
            .calls()
            .contains(&PeerCall::SetRemote(crate::peer::SdpKind::Offer, "v=0 carol".into())));
        assert!(matches!(
            relay.sent_messages().as_slice(),
            [SignalMessage::Answer { .. }]
        ));
    }

    #[tokio::test]
    async fn inbound_disconnect_for_unknown_peer_is_ignored() {
        let (mut registry, _, peers) = registry();
        registry.set_access_token(Some("alice:secret")).await.unwrap();
        registry
            .dispatch_inbound(InboundSignal::new(
                PeerIdentity::new("bob", "chat"),
                SignalMessage::Disconnect,
            ))
            .await;
        assert!(registry.is_empty());
        assert_eq!(peers.created(), 0);
    }

    #[tokio::test]
    async fn inbound_from_faulty_source_is_discarded() {
        let (mut registry, _, peers) = registry();
        registry.set_access_token(Some("alice:secret")).await.unwrap();
        registry
            .dispatch_inbound(InboundSignal::new(
                PeerIdentity::new("bob_.evil", "chat"),
                SignalMessage::Offer { sdp: "v=0".into() },
            ))
            .await;
        assert!(registry.is_empty());
        assert_eq!(peers.created(), 0);
    }

    #[tokio::test]
    async fn terminate_removes_bridge_and_signals_peer() {
        let (mut registry, relay, peers) = registry();
        let mut events = registry.take_events().unwrap();
        registry.set_access_token(Some("alice:secret")).await.unwrap();
        let key = registry
            .connect(PeerIdentity::new("bob", "chat"), ConnectOptions::default())
            .await
            .unwrap();
        registry.terminate(&key).await.unwrap();
        assert!(registry.bridge(&key).is_none());
        assert!(peers.last().unwrap().is_closed());
        assert!(matches!(
            registry.terminate(&key).await,
            Err(RelayError::UnknownPeer(_))
        ));
        assert!(matches!(
            registry.send(&key, Bytes::from_static(b"late")).await,
            Err(RelayError::UnknownPeer(_))
        ));

        settle(&mut registry).await;
        assert_eq!(
            relay.sent_messages().last(),
            Some(&SignalMessage::Disconnect)
        );
        let disconnects = drain(&mut events)
            .into_iter()
            .filter(|event| matches!(event, RelayEvent::Disconnected(_)))
            .count();
        assert_eq!(disconnects, 1);
    }

    #[tokio::test]
    async fn events_from_retired_bridge_are_dropped() {
        let (mut registry, _, peers) = registry();
        let mut events = registry.take_events().unwrap();
        registry.set_access_token(Some("alice:secret")).await.unwrap();
        let bob = PeerIdentity::new("bob", "chat");
        let key = registry.connect(bob.clone(), ConnectOptions::passive()).await.unwrap();
        let stale = peers.last().unwrap();
        registry.terminate(&key).await.unwrap();
        registry.connect(bob, ConnectOptions::passive()).await.unwrap();
        settle(&mut registry).await;
        drain(&mut events);

        stale.emit(crate::peer::PeerEvent::ChannelOpen);
        settle(&mut registry).await;
        assert_eq!(registry.bridge(&key).unwrap().state(), BridgeState::Idle);
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn subscription_errors_surface_as_events() {
        let (mut registry, relay, _) = registry();
        let mut events = registry.take_events().unwrap();
        relay.reject_subscriptions(RelayError::Subscription("401 unauthorized".into()));
        registry.set_access_token(Some("alice:secret")).await.unwrap();
        settle(&mut registry).await;
        let events = drain(&mut events);
        assert!(matches!(
            events.last(),
            Some(RelayEvent::Error {
                peer: None,
                error: RelayError::Subscription(_)
            })
        ));
    }

    #[tokio::test]
    async fn malformed_inbound_items_are_skipped() {
        let (mut registry, relay, _) = registry();
        let mut events = registry.take_events().unwrap();
        registry.set_access_token(Some("alice:secret")).await.unwrap();
        settle(&mut registry).await;
        drain(&mut events);
        relay.deliver_raw(Err(RelayError::MalformedSignal("not json".into())));
        settle(&mut registry).await;
        assert!(drain(&mut events).is_empty());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn shutdown_terminates_every_bridge() {
        let (mut registry, _, peers) = registry();
        registry.set_access_token(Some("alice:secret")).await.unwrap();
        for user in ["bob", "carol", "dave"] {
            registry
                .connect(PeerIdentity::new(user, "chat"), ConnectOptions::passive())
                .await
                .unwrap();
        }
        registry.shutdown().await;
        assert!(registry.is_empty());
        assert_eq!(peers.created(), 3);
        for index in 0..3 {
            assert!(peers.peer(index).unwrap().is_closed());
        }
    }
}
