// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! In-memory substitutes for every node-level collaborator: a process-local "network" of hosts
//! with duplex streams, a gossip mesh, a DHT and NAT stubs. Integration tests wire realms over
//! this instead of a real transport.

use crate::error::{Error, Result};
use crate::lifecycle::LifecycleCoordinator;
use crate::network::{
    AddrSource, Dht, EventBus, GossipTopic, Host, NatService, NetworkEvent, ProtocolId, PubSub,
    StreamBox, StreamHandler, TopicMessage, TopicSubscription,
};
use crate::realm::NodeContext;
use crate::types::{Multiaddr, NodeId, Reachability, RealmId, SignedPeerRecord};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use rand::rngs::OsRng;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const TEST_STREAM_BUF: usize = 4 * 1024 * 1024;

/// A process-local network of test nodes.
#[derive(Clone, Default)]
pub struct TestNet {
    inner: Arc<TestNetInner>,
}

#[derive(Default)]
struct TestNetInner {
    nodes: DashMap<NodeId, TestNodeHandle>,
    topics: DashMap<String, TopicState>,
    providers: DashMap<String, DashSet<NodeId>>,
    records: DashMap<(String, NodeId), SignedPeerRecord>,
}

#[derive(Clone)]
struct TestNodeHandle {
    handlers: Arc<DashMap<ProtocolId, StreamHandler>>,
    events: Arc<EventBus>,
    connected: Arc<DashSet<NodeId>>,
}

#[derive(Default)]
struct TopicState {
    joined: DashSet<NodeId>,
    subscribers: Mutex<Vec<(NodeId, mpsc::Sender<TopicMessage>)>>,
}

impl std::fmt::Debug for TestNet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestNet")
            .field("nodes", &self.inner.nodes.len())
            .finish()
    }
}

impl TestNet {
    /// An empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a node with a fresh identity and registers it on the network.
    pub fn node(&self) -> TestNode {
        let keypair = Arc::new(ed25519_dalek::Keypair::generate(&mut OsRng));
        let id = NodeId::from_public_key(&keypair.public);
        let events = Arc::new(EventBus::new());
        let handle = TestNodeHandle {
            handlers: Arc::new(DashMap::new()),
            events: events.clone(),
            connected: Arc::new(DashSet::new()),
        };
        let _ = self.inner.nodes.insert(id.clone(), handle.clone());

        let peerstore = Arc::new(TestPeerstore::default());
        let host = Arc::new(TestHost {
            net: self.clone(),
            id: id.clone(),
            handle,
            peerstore,
            shareable: Mutex::new(vec![Multiaddr::new("/ip4/192.168.1.5/tcp/4001")]),
        });
        let nat = Arc::new(TestNat::default());
        let coordinator = Arc::new(LifecycleCoordinator::new());
        // Test nodes come up with their addresses already known.
        coordinator.set_address_ready();
        coordinator.set_nat_type_ready();

        TestNode {
            id,
            keypair,
            host,
            nat,
            events,
            coordinator,
            net: self.clone(),
        }
    }

    /// Connects two nodes, firing connection events on both buses.
    pub fn connect(&self, a: &TestNode, b: &TestNode) {
        self.connect_ids(&a.id, &b.id);
    }

    /// Connects two registered nodes by id.
    pub fn connect_ids(&self, a: &NodeId, b: &NodeId) {
        let (handle_a, handle_b) = match (self.inner.nodes.get(a), self.inner.nodes.get(b)) {
            (Some(ha), Some(hb)) => (ha.clone(), hb.clone()),
            _ => return,
        };
        if handle_a.connected.insert(b.clone()) {
            let _ = handle_b.connected.insert(a.clone());
            handle_a
                .events
                .publish_network(NetworkEvent::PeerConnected(b.clone()));
            handle_b
                .events
                .publish_network(NetworkEvent::PeerConnected(a.clone()));
        }
    }

    /// Disconnects two nodes, firing disconnection events on both buses.
    pub fn disconnect(&self, a: &TestNode, b: &TestNode) {
        let (handle_a, handle_b) =
            match (self.inner.nodes.get(&a.id), self.inner.nodes.get(&b.id)) {
                (Some(ha), Some(hb)) => (ha.clone(), hb.clone()),
                _ => return,
            };
        if handle_a.connected.remove(&b.id).is_some() {
            let _ = handle_b.connected.remove(&a.id);
            handle_a
                .events
                .publish_network(NetworkEvent::PeerDisconnected(b.id.clone()));
            handle_b
                .events
                .publish_network(NetworkEvent::PeerDisconnected(a.id.clone()));
        }
    }

    fn topic(&self, name: &str) -> dashmap::mapref::one::Ref<'_, String, TopicState> {
        if let Some(state) = self.inner.topics.get(name) {
            return state;
        }
        let _ = self
            .inner
            .topics
            .entry(name.to_string())
            .or_insert_with(TopicState::default);
        self.inner
            .topics
            .get(name)
            .expect("topic state just inserted")
    }

    fn publish(&self, topic_name: &str, from: &NodeId, data: Bytes) -> Result<()> {
        let topic = self.topic(topic_name);
        let has_other_subscriber = topic.joined.iter().any(|id| id.key() != from);
        if !has_other_subscriber {
            return Err(Error::InsufficientPeers);
        }
        let subscribers = topic
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for (subscriber, tx) in subscribers {
            if &subscriber == from {
                continue;
            }
            let _ = tx.try_send(TopicMessage {
                from: from.clone(),
                data: data.clone(),
            });
        }
        Ok(())
    }
}

/// One test node: identity plus all collaborator stubs.
pub struct TestNode {
    /// Node identity.
    pub id: NodeId,
    /// Signing keypair behind the identity.
    pub keypair: Arc<ed25519_dalek::Keypair>,
    /// The in-memory host.
    pub host: Arc<TestHost>,
    /// Controllable NAT stub.
    pub nat: Arc<TestNat>,
    /// This node's event bus.
    pub events: Arc<EventBus>,
    /// This node's lifecycle coordinator.
    pub coordinator: Arc<LifecycleCoordinator>,
    net: TestNet,
}

impl TestNode {
    /// The node context realms are built over.
    pub fn context(&self) -> NodeContext {
        NodeContext {
            host: self.host.clone(),
            pubsub: Arc::new(TestPubSub {
                net: self.net.clone(),
                node: self.id.clone(),
            }),
            dht: Some(Arc::new(TestDht {
                net: self.net.clone(),
                node: self.id.clone(),
            })),
            nat: self.nat.clone(),
            address_book: None,
            events: self.events.clone(),
            coordinator: self.coordinator.clone(),
            keypair: self.keypair.clone(),
        }
    }

    /// Fires a local address-change event, as the transport would on an interface change.
    pub fn change_addrs(&self, addrs: Vec<Multiaddr>) {
        self.host.set_shareable_addrs(addrs.clone());
        self.events
            .publish_network(NetworkEvent::AddrsChanged(addrs));
    }
}

impl std::fmt::Debug for TestNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestNode").field("id", &self.id).finish()
    }
}

/// In-memory transport host.
pub struct TestHost {
    net: TestNet,
    id: NodeId,
    handle: TestNodeHandle,
    peerstore: Arc<TestPeerstore>,
    shareable: Mutex<Vec<Multiaddr>>,
}

impl TestHost {
    /// Replaces the shareable address set.
    pub fn set_shareable_addrs(&self, addrs: Vec<Multiaddr>) {
        *self
            .shareable
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = addrs;
    }
}

#[async_trait]
impl Host for TestHost {
    fn local_id(&self) -> NodeId {
        self.id.clone()
    }

    fn set_stream_handler(&self, protocol: ProtocolId, handler: StreamHandler) {
        let _ = self.handle.handlers.insert(protocol, handler);
    }

    fn remove_stream_handler(&self, protocol: &str) {
        let _ = self.handle.handlers.remove(protocol);
    }

    async fn open_stream(&self, peer: &NodeId, protocol: &str) -> Result<StreamBox> {
        let remote = self
            .net
            .inner
            .nodes
            .get(peer)
            .ok_or_else(|| Error::ConnectFailed(peer.clone()))?
            .clone();
        let handler = remote
            .handlers
            .get(protocol)
            .map(|entry| entry.clone())
            .ok_or_else(|| Error::ProtocolNotSupported(peer.clone()))?;

        let (local_end, remote_end) = tokio::io::duplex(TEST_STREAM_BUF);
        let opener = self.id.clone();
        let _ = tokio::spawn(handler(opener, Box::new(remote_end)));
        Ok(Box::new(local_end))
    }

    async fn connect(&self, peer: &NodeId, _addrs: &[Multiaddr]) -> Result<()> {
        if !self.net.inner.nodes.contains_key(peer) {
            return Err(Error::ConnectFailed(peer.clone()));
        }
        self.net.connect_ids(&self.id, peer);
        Ok(())
    }

    async fn try_hole_punch(&self, peer: &NodeId) -> Result<()> {
        self.connect(peer, &[]).await
    }

    fn shareable_addrs(&self) -> Vec<Multiaddr> {
        self.shareable
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn is_connected(&self, peer: &NodeId) -> bool {
        self.handle.connected.contains(peer)
    }

    fn peerstore(&self) -> Arc<dyn crate::network::Peerstore> {
        self.peerstore.clone()
    }
}

impl std::fmt::Debug for TestHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestHost").field("id", &self.id).finish()
    }
}

/// Source-tagged in-memory peerstore.
#[derive(Default)]
pub struct TestPeerstore {
    addrs: DashMap<(NodeId, AddrSource), Vec<Multiaddr>>,
    keys: DashMap<NodeId, ed25519_dalek::PublicKey>,
}

impl crate::network::Peerstore for TestPeerstore {
    fn addrs(&self, peer: &NodeId) -> Vec<Multiaddr> {
        let mut all = Vec::new();
        for entry in self.addrs.iter() {
            if &entry.key().0 == peer {
                for addr in entry.value() {
                    if !all.contains(addr) {
                        all.push(addr.clone());
                    }
                }
            }
        }
        all
    }

    fn addrs_from(&self, peer: &NodeId, source: AddrSource) -> Vec<Multiaddr> {
        self.addrs
            .get(&(peer.clone(), source))
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    fn add_addrs(&self, peer: &NodeId, addrs: &[Multiaddr], source: AddrSource, _ttl: Duration) {
        let mut entry = self
            .addrs
            .entry((peer.clone(), source))
            .or_insert_with(Vec::new);
        for addr in addrs {
            if !entry.contains(addr) {
                entry.push(addr.clone());
            }
        }
    }

    fn public_key(&self, peer: &NodeId) -> Option<ed25519_dalek::PublicKey> {
        self.keys.get(peer).map(|entry| *entry)
    }

    fn put_public_key(&self, peer: &NodeId, key: ed25519_dalek::PublicKey) {
        let _ = self.keys.insert(peer.clone(), key);
    }
}

impl std::fmt::Debug for TestPeerstore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestPeerstore").finish()
    }
}

/// Controllable NAT stub.
#[derive(Debug)]
pub struct TestNat {
    reachability: Mutex<Reachability>,
    external: Mutex<Vec<Multiaddr>>,
}

impl Default for TestNat {
    fn default() -> Self {
        Self {
            reachability: Mutex::new(Reachability::Private),
            external: Mutex::new(Vec::new()),
        }
    }
}

impl TestNat {
    /// Sets the diagnosis the stub reports.
    pub fn set(&self, reachability: Reachability, external: Vec<Multiaddr>) {
        *self
            .reachability
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = reachability;
        *self
            .external
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = external;
    }
}

impl NatService for TestNat {
    fn reachability(&self) -> Reachability {
        *self
            .reachability
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn external_addrs(&self) -> Vec<Multiaddr> {
        self.external
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Per-node handle onto the shared gossip mesh.
struct TestPubSub {
    net: TestNet,
    node: NodeId,
}

#[async_trait]
impl PubSub for TestPubSub {
    async fn join(&self, topic: &str) -> Result<Arc<dyn GossipTopic>> {
        let state = self.net.topic(topic);
        let _ = state.joined.insert(self.node.clone());
        drop(state);
        Ok(Arc::new(TestTopic {
            net: self.net.clone(),
            node: self.node.clone(),
            name: topic.to_string(),
        }))
    }
}

struct TestTopic {
    net: TestNet,
    node: NodeId,
    name: String,
}

#[async_trait]
impl GossipTopic for TestTopic {
    async fn publish(&self, data: Bytes) -> Result<()> {
        self.net.publish(&self.name, &self.node, data)
    }

    fn subscribe(&self) -> TopicSubscription {
        let (tx, rx) = mpsc::channel(256);
        let state = self.net.topic(&self.name);
        state
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((self.node.clone(), tx));
        TopicSubscription::new(rx)
    }

    async fn close(&self) -> Result<()> {
        let state = self.net.topic(&self.name);
        let _ = state.joined.remove(&self.node);
        state
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|(id, _)| id != &self.node);
        Ok(())
    }
}

/// Per-node handle onto the shared DHT.
struct TestDht {
    net: TestNet,
    node: NodeId,
}

#[async_trait]
impl Dht for TestDht {
    async fn find_peer(&self, _peer: &NodeId) -> Result<Vec<Multiaddr>> {
        Ok(Vec::new())
    }

    async fn provide_realm(&self, realm: &RealmId) -> Result<()> {
        let providers = self
            .net
            .inner
            .providers
            .entry(realm.as_str().to_string())
            .or_insert_with(DashSet::new);
        let _ = providers.insert(self.node.clone());
        Ok(())
    }

    async fn find_realm_providers(&self, realm: &RealmId) -> Result<Vec<NodeId>> {
        Ok(self
            .net
            .inner
            .providers
            .get(realm.as_str())
            .map(|providers| providers.iter().map(|id| id.clone()).collect())
            .unwrap_or_default())
    }

    async fn publish_peer_record(&self, realm: &RealmId, record: SignedPeerRecord) -> Result<()> {
        let _ = self
            .net
            .inner
            .records
            .insert((realm.as_str().to_string(), self.node.clone()), record);
        Ok(())
    }

    async fn find_peer_record(
        &self,
        realm: &RealmId,
        peer: &NodeId,
    ) -> Result<Option<SignedPeerRecord>> {
        Ok(self
            .net
            .inner
            .records
            .get(&(realm.as_str().to_string(), peer.clone()))
            .map(|entry| entry.clone()))
    }
}

/// A host registered on an otherwise empty network; open_stream and connect always fail.
/// Handy for unit tests that only need the trait surface.
pub fn disconnected_host() -> Arc<dyn Host> {
    let node = TestNet::new().node();
    node.host.clone()
}
