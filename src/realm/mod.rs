// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The Realm state machine: owns one (realm id, PSK) pair and composes authentication,
//! membership, capability exchange, sync, discovery and reliable delivery on top of the
//! injected node-level collaborators.

mod config;
mod discovery;
mod manager;
#[cfg(test)]
mod tests;

pub use config::RealmConfig;
pub use manager::{NodeContext, RealmManager, RealmOpts};

use crate::auth::{AuthCallbacks, AuthHandler, AuthMode, ChallengeHandler, PskAuthenticator};
use crate::capability::CapabilityManager;
use crate::delivery::ReliablePublisher;
use crate::error::{Error, Result};
use crate::gossip::{JoinAnnouncement, LeaveValidator, MemberLeave, TopicMsg, ValidLeave};
use crate::lifecycle::{LifecycleCoordinator, Phase};
use crate::membership::{MemberManager, MemberStore};
use crate::network::{
    AddrSource, AddressBookClient, Dht, EventBus, GossipTopic, Host, NetworkEvent, PubSub,
    StreamBox,
};
use crate::resolver::{AddressResolver, Connector};
use crate::stability::StabilityTracker;
use crate::sync::SyncHandler;
use crate::types::{
    validate_hint, ConnectionTicket, LeaveReason, MemberInfo, MemberStats, Multiaddr, NodeId,
    RealmId,
};
use bytes::Bytes;
use dashmap::DashSet;
use rand::Rng;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
    time::{Duration, Instant},
};
use tokio::{sync::watch, task::JoinHandle};

/// Aggregate liveness counters of a running realm.
#[derive(Clone, Copy, Debug, Default)]
pub struct RealmStats {
    /// Membership counters.
    pub members: MemberStats,
    /// Messages waiting in the delivery retry queue.
    pub queued_messages: usize,
}

#[derive(Debug)]
struct PendingAuth {
    attempts: usize,
    next_retry_at: Instant,
}

/// One joined realm.
pub struct Realm {
    id: RealmId,
    name: String,
    local: NodeId,
    keypair: Arc<ed25519_dalek::Keypair>,
    config: RealmConfig,

    host: Arc<dyn Host>,
    pubsub: Arc<dyn PubSub>,
    dht: Option<Arc<dyn Dht>>,
    address_book: Option<Arc<dyn AddressBookClient>>,
    events: Arc<EventBus>,
    coordinator: Arc<LifecycleCoordinator>,

    members: Arc<MemberManager>,
    auth_handler: Arc<AuthHandler>,
    capability: Arc<CapabilityManager>,
    sync: Arc<SyncHandler>,
    stability: Arc<StabilityTracker>,
    connector: Arc<Connector>,
    leave_validator: LeaveValidator,

    // Joined lazily in start(); the mesh cannot be joined synchronously.
    topic: Mutex<Option<Arc<dyn GossipTopic>>>,
    delivery: Mutex<Option<Arc<ReliablePublisher>>>,

    authenticating: DashSet<NodeId>,
    pending_auths: Mutex<HashMap<NodeId, PendingAuth>>,
    sync_retrying: AtomicBool,

    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl Realm {
    /// Builds a realm over the node context. Nothing runs until [`Realm::start`].
    pub(crate) fn new(
        id: RealmId,
        name: String,
        psk: &[u8],
        config: RealmConfig,
        ctx: &NodeContext,
    ) -> Result<Arc<Self>> {
        let authenticator = PskAuthenticator::new(psk, &id)?;
        let store = match &config.store_dir {
            Some(dir) => Some(MemberStore::open(dir, &id)?),
            None => None,
        };

        let local = ctx.host.local_id();
        let members = Arc::new(MemberManager::new(
            id.clone(),
            local.clone(),
            ctx.events.clone(),
            store,
        ));
        let challenge = Arc::new(ChallengeHandler::new(
            authenticator,
            id.clone(),
            local.clone(),
            config.challenge_validity,
            config.exchange_timeout,
        ));
        let resolver = Arc::new(AddressResolver::new(
            ctx.host.peerstore(),
            ctx.dht.clone(),
            ctx.address_book.clone(),
            config.resolver.clone(),
        ));
        let connector = Arc::new(Connector::new(
            ctx.host.clone(),
            resolver,
            members.clone(),
            config.hole_punch,
        ));
        let capability = CapabilityManager::new(
            id.clone(),
            ctx.host.clone(),
            ctx.nat.clone(),
            members.clone(),
            connector.clone(),
            config.capability_broadcast_interval,
            config.exchange_timeout,
        );
        let sync = SyncHandler::new(
            id.clone(),
            ctx.host.clone(),
            members.clone(),
            config.sync_interval,
            config.sync_peer_count,
            config.sync_io_timeout,
            config.member_addr_ttl,
        );
        let stability = Arc::new(StabilityTracker::new(
            config.stability_window,
            config.stability_threshold,
            config.stability_recovery,
        ));
        let leave_validator =
            LeaveValidator::new(id.clone(), config.leave_validity, config.leave_future_skew);
        let (shutdown_tx, _) = watch::channel(false);

        let realm = Arc::new_cyclic(|weak: &Weak<Realm>| {
            let on_success = {
                let weak = weak.clone();
                Arc::new(move |peer: NodeId| {
                    if let Some(realm) = weak.upgrade() {
                        let _ = tokio::spawn(async move {
                            realm.on_peer_authenticated(peer).await;
                        });
                    }
                })
            };
            let on_failure = Arc::new(move |peer: NodeId, err: &Error| {
                debug!("auth with {} failed: {}", peer, err);
            });
            let member_list = {
                let members = members.clone();
                Arc::new(move || members.digests(crate::auth::MEMBER_EXCHANGE_CAP))
            };
            let merge_members = {
                let members = members.clone();
                let peerstore = ctx.host.peerstore();
                let ttl = config.member_addr_ttl;
                Arc::new(move |digests: Vec<crate::types::MemberDigest>| {
                    for digest in &digests {
                        if !digest.addrs.is_empty() {
                            peerstore.add_addrs(
                                &digest.peer,
                                &digest.addrs,
                                AddrSource::MemberList,
                                ttl,
                            );
                        }
                    }
                    let added = members.merge_digests(digests);
                    if !added.is_empty() {
                        debug!("instant sync merged {} members", added.len());
                    }
                })
            };
            let auth_handler = AuthHandler::new(
                ctx.host.clone(),
                id.clone(),
                challenge.clone(),
                AuthCallbacks {
                    on_success,
                    on_failure,
                    member_list,
                    merge_members,
                },
                config.auth_timeout,
                config.exchange_timeout,
            );

            Realm {
                id: id.clone(),
                name,
                local,
                keypair: ctx.keypair.clone(),
                config,
                host: ctx.host.clone(),
                pubsub: ctx.pubsub.clone(),
                dht: ctx.dht.clone(),
                address_book: ctx.address_book.clone(),
                events: ctx.events.clone(),
                coordinator: ctx.coordinator.clone(),
                members,
                auth_handler,
                capability,
                sync,
                stability,
                connector,
                leave_validator,
                topic: Mutex::new(None),
                delivery: Mutex::new(None),
                authenticating: DashSet::new(),
                pending_auths: Mutex::new(HashMap::new()),
                sync_retrying: AtomicBool::new(false),
                shutdown_tx,
                tasks: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }
        });
        Ok(realm)
    }

    /// The realm id.
    pub fn id(&self) -> &RealmId {
        &self.id
    }

    /// Human-readable realm name (defaults to the id).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The local node id.
    pub fn local_id(&self) -> &NodeId {
        &self.local
    }

    /// The authentication mode in force.
    pub fn auth_mode(&self) -> AuthMode {
        self.auth_handler.mode()
    }

    /// Current member records.
    pub fn members(&self) -> Vec<MemberInfo> {
        self.members.list()
    }

    /// Whether `peer` is a realm member.
    pub fn is_member(&self, peer: &NodeId) -> bool {
        self.members.is_member(peer)
    }

    /// The member manager (membership queries and events).
    pub fn membership(&self) -> &Arc<MemberManager> {
        &self.members
    }

    /// The capability cache.
    pub fn capabilities(&self) -> &Arc<CapabilityManager> {
        &self.capability
    }

    /// The flap damper.
    pub fn liveness(&self) -> &Arc<StabilityTracker> {
        &self.stability
    }

    /// The reliable publisher over the realm topic. Errors before [`Realm::start`].
    pub fn messaging(&self) -> Result<Arc<ReliablePublisher>> {
        self.delivery
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| Error::NotStarted(self.id.as_str().to_string()))
    }

    /// Opens a raw stream to a member on a realm-scoped protocol.
    pub async fn open_stream(&self, peer: &NodeId, protocol: &str) -> Result<StreamBox> {
        if !self.members.is_member(peer) {
            return Err(Error::NotAMember(peer.clone()));
        }
        self.host.open_stream(peer, protocol).await
    }

    /// Aggregate counters.
    pub fn stats(&self) -> RealmStats {
        RealmStats {
            members: self.members.stats(),
            queued_messages: self
                .messaging()
                .map(|delivery| delivery.queue_len())
                .unwrap_or(0),
        }
    }

    /// Issues a connection ticket for this node, shareable out of band.
    pub fn ticket(&self) -> Result<String> {
        ConnectionTicket::new(self.local.clone(), self.host.shareable_addrs()).encode()
    }

    fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    fn is_infrastructure(&self, peer: &NodeId) -> bool {
        self.config.infrastructure_peers.contains(peer)
    }

    fn spawn(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handle);
    }

    /// Starts the realm: membership, auth service, gossip topic, capability and sync services,
    /// event loops, and the background DHT join.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed(self.id.as_str().to_string()));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted(self.id.as_str().to_string()));
        }
        info!("starting realm {} as {}", self.id, self.local);

        self.members.start(self.host.shareable_addrs())?;
        self.auth_handler.start();

        // Capability announces feed fresh addresses straight into the peerstore.
        {
            let peerstore = self.host.peerstore();
            let ttl = self.config.discovered_addr_ttl;
            self.capability
                .set_on_capability(Arc::new(move |announce: &crate::types::CapabilityAnnounce| {
                    if !announce.addrs.is_empty() {
                        peerstore.add_addrs(
                            &announce.node,
                            &announce.addrs,
                            AddrSource::Discovered,
                            ttl,
                        );
                    }
                }));
        }

        let topic = self.pubsub.join(&self.id.members_topic()).await?;
        let delivery = ReliablePublisher::new(
            topic.clone(),
            self.local.clone(),
            self.config.delivery.clone(),
        );
        delivery.start(self.shutdown_rx());
        *self
            .topic
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(topic.clone());
        *self
            .delivery
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(delivery);

        // Gossip message loop.
        {
            let realm = self.clone();
            let mut subscription = topic.subscribe();
            let mut shutdown = self.shutdown_rx();
            self.spawn(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        message = subscription.next() => match message {
                            Some(message) => realm.handle_topic_message(message.from, message.data).await,
                            None => break,
                        },
                    }
                }
                trace!("gossip message loop stopped");
            }));
        }

        self.capability.start(self.shutdown_rx());
        self.sync.start(self.shutdown_rx());

        // Transport event loop.
        {
            let realm = self.clone();
            let mut events = self.events.subscribe_network();
            let mut shutdown = self.shutdown_rx();
            self.spawn(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        event = events.recv() => match event {
                            Ok(event) => realm.handle_network_event(event).await,
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                                warn!("network event loop lagged, {} events lost", missed);
                            }
                            Err(_) => break,
                        },
                    }
                }
                trace!("network event loop stopped");
            }));
        }

        // Pending-auth retry loop.
        {
            let realm = self.clone();
            let mut shutdown = self.shutdown_rx();
            let tick_period = self.config.auth_retry_tick;
            self.spawn(tokio::spawn(async move {
                let mut tick = tokio::time::interval(tick_period);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tick.tick() => realm.fire_due_pending_auths(),
                    }
                }
            }));
        }

        // Member expiry sweep, when configured.
        if let Some(expiry) = self.config.member_expiry {
            let realm = self.clone();
            let mut shutdown = self.shutdown_rx();
            let tick_period = self.config.member_expiry_tick;
            self.spawn(tokio::spawn(async move {
                let mut tick = tokio::time::interval(tick_period);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tick.tick() => {
                            let _ = realm.members.prune_expired(expiry);
                        }
                    }
                }
            }));
        }

        // Newcomer full-list request.
        self.request_sync_with_backoff();

        self.coordinator.complete(Phase::PskAuth);

        // DHT publication and provider discovery continue in the background.
        {
            let realm = self.clone();
            self.spawn(tokio::spawn(async move {
                realm.join_background().await;
            }));
        }
        Ok(())
    }

    /// Stops the realm: announce departure, then tear components down in reverse start order.
    pub async fn stop(self: &Arc<Self>) -> Result<()> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(Error::NotStarted(self.id.as_str().to_string()));
        }
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("stopping realm {}", self.id);

        // A failed leave announcement never blocks shutdown.
        if let Err(err) = self.broadcast_member_leave(LeaveReason::Graceful).await {
            debug!("leave announcement failed: {}", err);
        }
        tokio::time::sleep(self.config.leave_propagation_wait).await;

        let _ = self.shutdown_tx.send(true);
        self.capability.stop();
        self.sync.stop();
        self.auth_handler.stop();
        if let Ok(delivery) = self.messaging() {
            delivery.stop();
        }
        let topic = self
            .topic
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(topic) = topic {
            if let Err(err) = topic.close().await {
                debug!("topic close failed: {}", err);
            }
        }
        self.members.stop();

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        Ok(())
    }

    // ---- gossip ----

    async fn handle_topic_message(self: &Arc<Self>, from: NodeId, data: Bytes) {
        if from == self.local {
            return;
        }
        let delivery = match self.messaging() {
            Ok(delivery) => delivery,
            Err(_) => return,
        };
        let payload = match delivery.process_incoming(&data) {
            Ok(payload) => payload,
            Err(err) => {
                trace!("dropping malformed frame from {}: {}", from, err);
                return;
            }
        };

        match TopicMsg::parse(&payload) {
            Some(TopicMsg::Join(peer)) => self.handle_gossip_join(peer, Vec::new()),
            Some(TopicMsg::Join2(announcement)) => {
                self.handle_gossip_join(announcement.peer, announcement.addrs)
            }
            Some(TopicMsg::SyncList(peers)) => {
                for peer in peers {
                    self.handle_gossip_join(peer, Vec::new());
                }
            }
            Some(TopicMsg::SyncList2(digests)) => {
                for digest in &digests {
                    if !digest.addrs.is_empty() {
                        self.host.peerstore().add_addrs(
                            &digest.peer,
                            &digest.addrs,
                            AddrSource::MemberList,
                            self.config.member_addr_ttl,
                        );
                    }
                }
                let _ = self.members.merge_digests(digests);
            }
            Some(TopicMsg::ReqSync) => self.schedule_member_list_response(),
            Some(TopicMsg::Leave(bytes)) => self.handle_leave(&bytes),
            Some(TopicMsg::Ack(bytes)) => delivery.handle_ack_reply(&bytes),
            None => trace!("unrecognised gossip payload from {}", from),
        }
    }

    /// A gossip-announced member. Role is always Member here: role changes are only
    /// authoritative over authenticated channels.
    fn handle_gossip_join(&self, peer: NodeId, addrs: Vec<Multiaddr>) {
        if peer == self.local {
            return;
        }
        if self.members.has_gracefully_left(&peer) {
            trace!("ignoring join gossip for departed {}", peer);
            return;
        }
        if !addrs.is_empty() {
            self.host.peerstore().add_addrs(
                &peer,
                &addrs,
                AddrSource::MemberList,
                self.config.member_addr_ttl,
            );
        }
        if self.members.is_member(&peer) {
            self.members.update_last_seen(&peer);
        } else {
            let _ = self
                .members
                .add(MemberInfo::joined(peer, self.id.clone(), addrs));
        }
    }

    /// Answers a `req:sync` with a jittered, randomised full-list broadcast: when the realm has
    /// many members only a random subset answers, otherwise every request would trigger a
    /// broadcast storm.
    fn schedule_member_list_response(self: &Arc<Self>) {
        let total = self.members.stats().total;
        let responders = self.config.sync_responder_count.max(1);
        let respond = {
            let mut rng = rand::thread_rng();
            rng.gen_range(0, total.max(1)) < responders
        };
        if !respond {
            return;
        }

        let delay = {
            let mut rng = rand::thread_rng();
            Duration::from_millis(rng.gen_range(100, 500))
        };
        let realm = self.clone();
        let _ = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            realm.publish_member_list().await;
        });
    }

    async fn publish_member_list(&self) {
        let digests = self.members.digests(crate::auth::MEMBER_EXCHANGE_CAP);
        let payload = match TopicMsg::encode_member_list(&digests) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("failed to encode member list: {}", err);
                return;
            }
        };
        if let Ok(delivery) = self.messaging() {
            if let Err(err) = delivery.publish(payload).await {
                debug!("member list broadcast failed: {}", err);
            }
        }
    }

    fn handle_leave(&self, bytes: &[u8]) {
        let record = match MemberLeave::decode_bytes(bytes) {
            Ok(record) => record,
            Err(err) => {
                trace!("undecodable leave record: {}", err);
                return;
            }
        };
        // Ids are self-certifying; fall back to the peerstore for foreign id schemes.
        let public_key = NodeId::from_base58(&record.peer_id).ok().and_then(|peer| {
            peer.public_key()
                .or_else(|| self.host.peerstore().public_key(&peer))
        });

        let ValidLeave { peer, reason } =
            match self.leave_validator.validate(&record, public_key) {
                Ok(valid) => valid,
                Err(err) => {
                    debug!("rejected leave record for {}: {}", record.peer_id, err);
                    return;
                }
            };
        if peer == self.local {
            return;
        }

        match reason {
            LeaveReason::Graceful | LeaveReason::Kicked => {
                info!("member {} left realm {} ({:?})", peer, self.id, reason);
                let _ = self.members.remove(&peer, reason);
                self.stability.forget(&peer);
            }
            LeaveReason::Witness => {
                if self.stability.should_suppress_state_change(&peer) {
                    trace!("suppressing witness offline report for flapping {}", peer);
                } else {
                    let _ = self.members.update_status(&peer, false);
                }
            }
        }
    }

    // ---- transport events ----

    async fn handle_network_event(self: &Arc<Self>, event: NetworkEvent) {
        match event {
            NetworkEvent::PeerConnected(peer) => {
                let _ = self.stability.record_transition(&peer);
                if self.members.is_member(&peer) {
                    self.members.update_last_seen(&peer);
                    if !self.stability.should_suppress_state_change(&peer) {
                        let _ = self.members.update_status(&peer, true);
                    }
                    return;
                }
                let realm = self.clone();
                let _ = tokio::spawn(async move {
                    realm.authenticate_and_add_member(peer).await;
                });
            }
            NetworkEvent::PeerDisconnected(peer) => {
                let _ = self.stability.record_transition(&peer);
                if !self.members.is_member(&peer) {
                    return;
                }
                if self.stability.should_suppress_state_change(&peer) {
                    trace!("suppressing offline flip for flapping {}", peer);
                    return;
                }
                let _ = self.members.update_status(&peer, false);
                // Tell the rest of the realm what we saw; receivers treat it as unconfirmed.
                self.broadcast_witness_leave(&peer).await;
            }
            NetworkEvent::AddrsChanged(addrs) => self.on_network_change(addrs).await,
        }
    }

    /// Re-announces capabilities and re-registers addresses after a network change.
    pub async fn on_network_change(&self, new_addrs: Vec<Multiaddr>) {
        self.capability.rebroadcast(new_addrs.clone()).await;
        self.members.refresh_local_addrs(self.host.shareable_addrs());
        if let Some(book) = &self.address_book {
            if let Err(err) = book.register(&new_addrs).await {
                debug!("relay re-registration failed: {}", err);
            }
        }
    }

    // ---- authentication ----

    /// Entry point on a fresh transport connection. Applies role negotiation and the per-peer
    /// dedup guard, then drives an outbound auth attempt.
    pub(crate) async fn authenticate_and_add_member(self: &Arc<Self>, peer: NodeId) {
        if peer == self.local || self.is_infrastructure(&peer) {
            return;
        }
        if self.members.is_member(&peer) {
            self.members.update_last_seen(&peer);
            return;
        }
        if !self.authenticating.insert(peer.clone()) {
            trace!("auth with {} already in flight", peer);
            return;
        }

        self.negotiate_and_authenticate(&peer).await;
        let _ = self.authenticating.remove(&peer);
    }

    async fn negotiate_and_authenticate(&self, peer: &NodeId) {
        // The byte-wise greater id initiates; the other side waits for the inbound attempt and
        // only initiates itself once the wait expires (covers one side seeing the connection
        // late). Together with the dedup set this yields at most one auth per encounter.
        if self.local.as_bytes() <= peer.as_bytes() {
            let deadline = Instant::now() + self.config.negotiation_wait;
            let mut shutdown = self.shutdown_rx();
            while Instant::now() < deadline {
                if self.members.is_member(peer) || *shutdown.borrow() {
                    return;
                }
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tokio::time::sleep(self.config.negotiation_poll) => {}
                }
            }
            if self.members.is_member(peer) {
                return;
            }
            trace!("no inbound auth from {}, becoming initiator", peer);
        }

        match self.auth_handler.authenticate(peer).await {
            Ok(()) => {}
            Err(Error::ProtocolNotSupported(_)) => {
                // The remote realm has not registered its handlers yet; both starts raced.
                debug!("{} not speaking the realm protocol yet, scheduling retry", peer);
                self.schedule_pending_auth(peer);
            }
            Err(err) if err.is_remote() => {
                debug!("auth attempt with {} failed: {}", peer, err);
            }
            Err(err) => warn!("auth attempt with {} failed: {}", peer, err),
        }
    }

    fn schedule_pending_auth(&self, peer: &NodeId) {
        let mut pending = self
            .pending_auths
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if pending.contains_key(peer) {
            return;
        }
        let first_delay = self
            .config
            .pending_auth_schedule
            .first()
            .copied()
            .unwrap_or_else(|| Duration::from_secs(2));
        let _ = pending.insert(
            peer.clone(),
            PendingAuth {
                attempts: 0,
                next_retry_at: Instant::now() + first_delay,
            },
        );
    }

    /// One tick of the retry loop: fire every due pending auth whose peer is still connected
    /// and still not a member.
    fn fire_due_pending_auths(self: &Arc<Self>) {
        let now = Instant::now();
        let due: Vec<NodeId> = {
            let mut pending = self
                .pending_auths
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let schedule = &self.config.pending_auth_schedule;
            let mut due = Vec::new();
            pending.retain(|peer, entry| {
                if self.members.is_member(peer) || !self.host.is_connected(peer) {
                    return false;
                }
                if entry.next_retry_at > now {
                    return true;
                }
                due.push(peer.clone());
                entry.attempts += 1;
                if entry.attempts >= schedule.len() {
                    debug!("abandoning auth retries for {}", peer);
                    return false;
                }
                entry.next_retry_at = now + schedule[entry.attempts];
                true
            });
            due
        };

        for peer in due {
            let realm = self.clone();
            let _ = tokio::spawn(async move {
                realm.authenticate_and_add_member(peer).await;
            });
        }
    }

    /// Success path of either auth direction: promote the peer to member and let the realm know.
    async fn on_peer_authenticated(self: &Arc<Self>, peer: NodeId) {
        if peer == self.local {
            return;
        }
        self.members.clear_gracefully_left(&peer);

        if self.members.is_member(&peer) {
            self.members.update_last_seen(&peer);
            let _ = self.members.update_status(&peer, true);
            return;
        }

        let addrs = self.host.peerstore().addrs(&peer);
        info!("peer {} authenticated into realm {}", peer, self.id);
        let _ = self
            .members
            .add(MemberInfo::joined(peer.clone(), self.id.clone(), addrs.clone()));

        // Announce the join; retried briefly in case the mesh is still forming.
        {
            let realm = self.clone();
            let announcement = JoinAnnouncement {
                peer: peer.clone(),
                addrs,
            };
            let _ = tokio::spawn(async move {
                realm.publish_join_with_retry(&announcement).await;
            });
        }

        // The fresh member gets our capabilities directly, slightly delayed so its handlers
        // finish registering.
        {
            let realm = self.clone();
            let peer = peer.clone();
            let _ = tokio::spawn(async move {
                tokio::time::sleep(realm.config.capability_unicast_delay).await;
                if let Err(err) = realm.capability.send_to_peer(&peer).await {
                    debug!("capability unicast to {} failed: {}", peer, err);
                }
            });
        }

        // And everyone else gets a fresh full list shortly after.
        {
            let realm = self.clone();
            let _ = tokio::spawn(async move {
                tokio::time::sleep(realm.config.member_broadcast_delay).await;
                realm.publish_member_list().await;
            });
        }
    }

    async fn publish_join_with_retry(&self, announcement: &JoinAnnouncement) {
        let payload = match TopicMsg::encode_join(announcement) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("failed to encode join announcement: {}", err);
                return;
            }
        };
        let delivery = match self.messaging() {
            Ok(delivery) => delivery,
            Err(_) => return,
        };

        for (attempt, delay) in self.config.join_publish_schedule.iter().enumerate() {
            match delivery.publish_direct(payload.clone()).await {
                Ok(()) => return,
                Err(err) => {
                    trace!(
                        "join publish attempt {} failed ({}), retrying",
                        attempt + 1,
                        err
                    );
                    tokio::time::sleep(*delay).await;
                }
            }
        }
        // Final attempt goes through the queue so the flush loop keeps trying.
        if let Err(err) = delivery.publish(payload).await {
            debug!("join announcement still failing: {}", err);
        }
    }

    /// Newcomer behaviour: ask the topic for the full member list, backing off until somebody
    /// answers. The atomic guard keeps this to one task per realm.
    fn request_sync_with_backoff(self: &Arc<Self>) {
        if self.sync_retrying.swap(true, Ordering::SeqCst) {
            return;
        }
        let realm = self.clone();
        self.spawn(tokio::spawn(async move {
            let mut shutdown = realm.shutdown_rx();
            let schedule = realm.config.sync_request_schedule.clone();
            let mut attempt = 0usize;
            loop {
                if !realm.members.remote_peers().is_empty() {
                    break;
                }
                if let Ok(delivery) = realm.messaging() {
                    if let Err(err) = delivery.publish_direct(TopicMsg::encode_req_sync()).await {
                        trace!("req:sync publish failed: {}", err);
                    }
                }
                if attempt >= schedule.len() {
                    break;
                }
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(schedule[attempt]) => {}
                }
                attempt += 1;
            }
            realm.sync_retrying.store(false, Ordering::SeqCst);
        }));
    }

    // ---- leaving ----

    /// Signs and publishes a leave record for the local node, then gives it a moment to travel.
    pub(crate) async fn broadcast_member_leave(&self, reason: LeaveReason) -> Result<()> {
        let record = MemberLeave::signed(&self.keypair, &self.local, &self.id, reason);
        let payload = TopicMsg::encode_leave(&record.encode_bytes());
        let delivery = self.messaging()?;
        delivery.publish_direct(payload).await
    }

    /// Reports a peer we observed going offline. Unsigned: witnesses cannot speak for the peer's
    /// key, receivers only flip the online flag.
    async fn broadcast_witness_leave(&self, peer: &NodeId) {
        let mut record =
            MemberLeave::signed(&self.keypair, peer, &self.id, LeaveReason::Witness);
        record.signature.clear();
        let payload = TopicMsg::encode_leave(&record.encode_bytes());
        if let Ok(delivery) = self.messaging() {
            if let Err(err) = delivery.publish_direct(payload).await {
                trace!("witness leave for {} not published: {}", peer, err);
            }
        }
    }

    /// Removes a member by admin decision and tells the realm. The record is unsigned for the
    /// same reason witness reports are.
    pub async fn kick(&self, peer: &NodeId) -> Result<()> {
        if !self.members.is_member(peer) {
            return Err(Error::NotAMember(peer.clone()));
        }
        info!("kicking {} from realm {}", peer, self.id);
        let _ = self.members.remove(peer, LeaveReason::Kicked);
        let mut record =
            MemberLeave::signed(&self.keypair, peer, &self.id, LeaveReason::Kicked);
        record.signature.clear();
        let payload = TopicMsg::encode_leave(&record.encode_bytes());
        self.messaging()?.publish_direct(payload).await
    }

    // ---- connecting ----

    /// Connects to a target given as a bare node id, a multiaddr with `/p2p/<id>`, or a
    /// `dep2p://` ticket. Non-members are dialled raw and promoted once PSK auth completes.
    pub async fn connect(&self, target: &str) -> Result<()> {
        let (peer, hints) = self.parse_target(target)?;
        if peer == self.local {
            return Err(Error::UnrecognisedTarget("cannot connect to self".to_string()));
        }

        if self.members.is_member(&peer) {
            return self.connector.connect_with_hints(&peer, hints).await;
        }

        // Raw dial; the connection event drives authentication, we wait for the promotion.
        self.connector.connect_unchecked(&peer, hints).await?;
        let deadline = Instant::now() + self.config.membership_wait;
        while Instant::now() < deadline {
            if self.members.is_member(&peer) {
                return self.connector.connect(&peer).await;
            }
            tokio::time::sleep(self.config.membership_poll).await;
        }
        Err(Error::AuthWaitTimeout(peer))
    }

    /// [`Realm::connect`] with explicit address hints.
    pub async fn connect_with_hint(&self, peer: &NodeId, hints: Vec<Multiaddr>) -> Result<()> {
        for hint in &hints {
            validate_hint(hint.as_str())?;
        }
        if self.members.is_member(peer) {
            return self.connector.connect_with_hints(peer, hints).await;
        }
        self.connector.connect_unchecked(peer, hints).await?;
        let deadline = Instant::now() + self.config.membership_wait;
        while Instant::now() < deadline {
            if self.members.is_member(peer) {
                return self.connector.connect(peer).await;
            }
            tokio::time::sleep(self.config.membership_poll).await;
        }
        Err(Error::AuthWaitTimeout(peer.clone()))
    }

    fn parse_target(&self, target: &str) -> Result<(NodeId, Vec<Multiaddr>)> {
        if target.starts_with(crate::types::TICKET_SCHEME) {
            let ticket = ConnectionTicket::decode(target)?;
            return Ok((ticket.node, ticket.address_hints));
        }
        if target.starts_with('/') {
            validate_hint(target)?;
            let addr = Multiaddr::new(target);
            let peer = addr
                .peer_id()
                .ok_or_else(|| Error::MalformedMultiaddr("missing /p2p/<id>".to_string()))?;
            return Ok((peer, vec![addr]));
        }
        let peer = NodeId::from_base58(target)
            .map_err(|_| Error::UnrecognisedTarget(target.to_string()))?;
        Ok((peer, Vec::new()))
    }
}

impl std::fmt::Debug for Realm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Realm")
            .field("id", &self.id)
            .field("local", &self.local)
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish()
    }
}
