// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Interfaces of the node-level collaborators the Realm core consumes.
//!
//! The Realm subsystem never talks to a concrete transport, DHT, NAT prober or pub-sub mesh;
//! everything goes through the traits here, injected at construction. Tests substitute all of
//! them with the in-memory substrate in `test_utils`.

mod event;
mod framing;

pub use event::{EventBus, MembershipEvent, NetworkEvent};
pub use framing::{FramedStream, MAX_FRAME_LEN};

use crate::error::Result;
use crate::types::{Multiaddr, NodeId, Reachability, RealmId, SignedPeerRecord};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::{fmt, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};

/// A Realm-scoped protocol id, e.g. `/dep2p/realm/<id>/auth/1.0.0`.
pub type ProtocolId = String;

/// A raw bidirectional stream as handed out by the transport.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawStream for T {}

/// A boxed raw stream.
pub type StreamBox = Box<dyn RawStream>;

/// Callback invoked by the transport for every inbound stream on a registered protocol.
pub type StreamHandler =
    Arc<dyn Fn(NodeId, StreamBox) -> BoxFuture<'static, ()> + Send + Sync>;

/// Where an address entry in the peerstore came from. Resolution walks sources in a strict
/// priority order, so the tag matters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddrSource {
    /// Added manually or observed by the transport itself.
    Manual,
    /// Learned from realm membership gossip or member-list exchange.
    MemberList,
    /// Cached from a DHT query.
    Dht,
    /// Cached from a relay addressbook query.
    Relay,
    /// Learned from a capability announce.
    Discovered,
}

/// The node-level transport host.
#[async_trait]
pub trait Host: Send + Sync {
    /// The local node identity, externally assigned and authenticated by the transport.
    fn local_id(&self) -> NodeId;

    /// Registers `handler` for inbound streams on `protocol`.
    fn set_stream_handler(&self, protocol: ProtocolId, handler: StreamHandler);

    /// Removes the handler for `protocol`.
    fn remove_stream_handler(&self, protocol: &str);

    /// Opens an outbound stream to `peer` speaking `protocol`.
    ///
    /// Returns [`crate::Error::ProtocolNotSupported`] when the remote has not (yet) registered
    /// the protocol; callers special-case that into a retry schedule.
    async fn open_stream(&self, peer: &NodeId, protocol: &str) -> Result<StreamBox>;

    /// Dials `peer` on the given addresses (or whatever the transport already knows).
    async fn connect(&self, peer: &NodeId, addrs: &[Multiaddr]) -> Result<()>;

    /// Attempts to traverse NAT towards `peer` after a direct dial failed.
    async fn try_hole_punch(&self, peer: &NodeId) -> Result<()>;

    /// Addresses of the local node that are safe to share with other peers.
    fn shareable_addrs(&self) -> Vec<Multiaddr>;

    /// Whether a live connection to `peer` exists right now.
    fn is_connected(&self, peer: &NodeId) -> bool;

    /// The address book backing this host.
    fn peerstore(&self) -> Arc<dyn Peerstore>;
}

/// Source-tagged address book.
pub trait Peerstore: Send + Sync {
    /// All known addresses for `peer`, any source.
    fn addrs(&self, peer: &NodeId) -> Vec<Multiaddr>;

    /// Addresses for `peer` recorded under `source`.
    fn addrs_from(&self, peer: &NodeId, source: AddrSource) -> Vec<Multiaddr>;

    /// Records addresses for `peer` under `source` with the given time-to-live.
    fn add_addrs(&self, peer: &NodeId, addrs: &[Multiaddr], source: AddrSource, ttl: Duration);

    /// The ed25519 public key of `peer`, when known.
    fn public_key(&self, peer: &NodeId) -> Option<ed25519_dalek::PublicKey>;

    /// Records the public key of `peer`.
    fn put_public_key(&self, peer: &NodeId, key: ed25519_dalek::PublicKey);
}

/// The node-level DHT, seen through realm-shaped queries.
#[async_trait]
pub trait Dht: Send + Sync {
    /// Looks up transport addresses of `peer`.
    async fn find_peer(&self, peer: &NodeId) -> Result<Vec<Multiaddr>>;

    /// Advertises the local node as a participant of `realm`.
    async fn provide_realm(&self, realm: &RealmId) -> Result<()>;

    /// Finds nodes advertising participation in `realm`.
    async fn find_realm_providers(&self, realm: &RealmId) -> Result<Vec<NodeId>>;

    /// Publishes the local node's signed address record for `realm`.
    async fn publish_peer_record(&self, realm: &RealmId, record: SignedPeerRecord) -> Result<()>;

    /// Fetches the signed address record `peer` published for `realm`.
    async fn find_peer_record(
        &self,
        realm: &RealmId,
        peer: &NodeId,
    ) -> Result<Option<SignedPeerRecord>>;
}

/// NAT diagnosis service.
pub trait NatService: Send + Sync {
    /// Current reachability verdict.
    fn reachability(&self) -> Reachability;

    /// Externally visible addresses, when the prober discovered any.
    fn external_addrs(&self) -> Vec<Multiaddr>;
}

/// Client of a relay node's addressbook, the resolution ladder's last rung.
#[async_trait]
pub trait AddressBookClient: Send + Sync {
    /// Queries the relay for addresses of `peer`.
    async fn lookup(&self, peer: &NodeId) -> Result<Vec<Multiaddr>>;

    /// (Re-)registers the local node's addresses with the relay.
    async fn register(&self, addrs: &[Multiaddr]) -> Result<()>;
}

/// The node-level pub-sub layer.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Joins a topic, returning a handle for publishing and subscribing.
    async fn join(&self, topic: &str) -> Result<Arc<dyn GossipTopic>>;
}

/// One joined gossip topic.
#[async_trait]
pub trait GossipTopic: Send + Sync {
    /// Publishes `data` to the topic. Returns [`crate::Error::InsufficientPeers`] while the
    /// mesh has no other subscriber.
    async fn publish(&self, data: Bytes) -> Result<()>;

    /// Subscribes to messages on the topic.
    fn subscribe(&self) -> TopicSubscription;

    /// Leaves the topic.
    async fn close(&self) -> Result<()>;
}

/// A message received from a gossip topic.
#[derive(Clone, Debug)]
pub struct TopicMessage {
    /// The publishing peer.
    pub from: NodeId,
    /// Raw payload.
    pub data: Bytes,
}

/// Stream of messages from one topic subscription.
pub struct TopicSubscription {
    rx: mpsc::Receiver<TopicMessage>,
}

impl TopicSubscription {
    /// Wraps a receiver fed by the pub-sub implementation.
    pub fn new(rx: mpsc::Receiver<TopicMessage>) -> Self {
        Self { rx }
    }

    /// The next message, or `None` once the topic is closed.
    pub async fn next(&mut self) -> Option<TopicMessage> {
        self.rx.recv().await
    }
}

impl fmt::Debug for TopicSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicSubscription").finish()
    }
}
