// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Per-realm capability announcements: reachability, public addresses, relay capability.
//!
//! Every member periodically unicasts its latest announce to every other member, and
//! re-evaluates immediately when the local address set changes.

use crate::error::{Error, Result};
use crate::membership::MemberManager;
use crate::network::{FramedStream, Host, NatService, StreamHandler};
use crate::resolver::Connector;
use crate::types::{
    any_public, unix_now_secs, CapabilityAnnounce, Multiaddr, NodeId, Reachability, RealmId,
};
use dashmap::DashMap;
use std::{
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};
use tokio::{sync::watch, task::JoinHandle};

type CapabilityCallback = Arc<dyn Fn(&CapabilityAnnounce) + Send + Sync>;

/// Announce cache and broadcast loop for one realm.
pub struct CapabilityManager {
    realm: RealmId,
    host: Arc<dyn Host>,
    nat: Arc<dyn NatService>,
    members: Arc<MemberManager>,
    connector: Arc<Connector>,
    cache: DashMap<NodeId, CapabilityAnnounce>,
    on_capability: RwLock<Option<CapabilityCallback>>,
    broadcast_interval: Duration,
    io_timeout: Duration,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl CapabilityManager {
    pub(crate) fn new(
        realm: RealmId,
        host: Arc<dyn Host>,
        nat: Arc<dyn NatService>,
        members: Arc<MemberManager>,
        connector: Arc<Connector>,
        broadcast_interval: Duration,
        io_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            realm,
            host,
            nat,
            members,
            connector,
            cache: DashMap::new(),
            on_capability: RwLock::new(None),
            broadcast_interval,
            io_timeout,
            loop_handle: Mutex::new(None),
        })
    }

    /// Sets the callback fired for every announce received from a member.
    pub(crate) fn set_on_capability(&self, callback: CapabilityCallback) {
        *self
            .on_capability
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(callback);
    }

    /// Registers the announce stream handler and spawns the periodic broadcast loop.
    pub(crate) fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let manager = self.clone();
        let handler: StreamHandler = Arc::new(move |peer, stream| {
            let manager = manager.clone();
            Box::pin(async move {
                if let Err(err) = manager.handle_inbound(peer.clone(), stream).await {
                    debug!("capability announce from {} rejected: {}", peer, err);
                }
            })
        });
        self.host
            .set_stream_handler(self.realm.announce_protocol(), handler);

        let manager = self.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(manager.broadcast_interval);
            // The first tick fires immediately; members may not exist yet, which is fine.
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tick.tick() => {
                        manager.broadcast().await;
                    }
                }
            }
            trace!("capability broadcast loop stopped");
        });
        *self
            .loop_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
    }

    /// Removes the stream handler and stops the broadcast loop.
    pub(crate) fn stop(&self) {
        self.host
            .remove_stream_handler(&self.realm.announce_protocol());
        if let Some(handle) = self
            .loop_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            handle.abort();
        }
    }

    /// Latest announce received from `peer`, if any.
    pub fn cached(&self, peer: &NodeId) -> Option<CapabilityAnnounce> {
        self.cache.get(peer).map(|entry| entry.clone())
    }

    /// Builds the local announce from the NAT service's current view.
    fn build_local_announce(&self) -> CapabilityAnnounce {
        let reachability = self.nat.reachability();
        let addrs = if reachability == Reachability::Public {
            self.nat.external_addrs()
        } else {
            Vec::new()
        };
        CapabilityAnnounce {
            node: self.host.local_id(),
            reachability,
            addrs,
            relay_capable: reachability == Reachability::Public,
            timestamp: unix_now_secs(),
        }
    }

    /// Unicasts the local announce to every member except the local node. Failures are damped:
    /// the next periodic tick retries.
    pub(crate) async fn broadcast(&self) {
        let announce = self.build_local_announce();
        let _ = self.cache.insert(announce.node.clone(), announce.clone());
        for peer in self.members.remote_peers() {
            if let Err(err) = self.send_announce(&peer, &announce).await {
                debug!("capability announce to {} failed: {}", peer, err);
            }
        }
    }

    /// Re-evaluates reachability from a fresh address set and broadcasts immediately. Called on
    /// network-change events.
    pub(crate) async fn rebroadcast(&self, new_addrs: Vec<Multiaddr>) {
        let public = any_public(&new_addrs);
        let announce = CapabilityAnnounce {
            node: self.host.local_id(),
            reachability: if public {
                Reachability::Public
            } else {
                Reachability::Private
            },
            addrs: if public {
                new_addrs.into_iter().filter(|a| !a.is_private()).collect()
            } else {
                Vec::new()
            },
            relay_capable: public,
            timestamp: unix_now_secs(),
        };
        info!(
            "network change: reachability now {:?} in realm {}",
            announce.reachability, self.realm
        );
        let _ = self.cache.insert(announce.node.clone(), announce.clone());
        for peer in self.members.remote_peers() {
            if let Err(err) = self.send_announce(&peer, &announce).await {
                debug!("capability rebroadcast to {} failed: {}", peer, err);
            }
        }
    }

    /// Unicasts the current local announce to a single member (used right after a new member
    /// authenticates).
    pub(crate) async fn send_to_peer(&self, peer: &NodeId) -> Result<()> {
        let announce = self.build_local_announce();
        let _ = self.cache.insert(announce.node.clone(), announce.clone());
        self.send_announce(peer, &announce).await
    }

    async fn send_announce(&self, peer: &NodeId, announce: &CapabilityAnnounce) -> Result<()> {
        // Announces only go to members; ensure a connection first.
        self.connector.connect(peer).await?;
        let stream = self
            .host
            .open_stream(peer, &self.realm.announce_protocol())
            .await?;
        let mut framed = FramedStream::new(stream);
        framed
            .write_frame_timeout(&serde_json::to_vec(announce)?, self.io_timeout)
            .await
    }

    /// One announce per inbound stream.
    async fn handle_inbound(
        &self,
        from: NodeId,
        stream: crate::network::StreamBox,
    ) -> Result<()> {
        let mut framed = FramedStream::new(stream);
        let frame = framed.read_frame_timeout(self.io_timeout).await?;
        let announce: CapabilityAnnounce = serde_json::from_slice(&frame)?;

        if announce.node != from {
            return Err(Error::InvalidPayload(format!(
                "announce subject {} does not match stream peer {}",
                announce.node, from
            )));
        }
        if let Some(existing) = self.cache.get(&announce.node) {
            if existing.timestamp > announce.timestamp {
                trace!("ignoring stale announce from {}", from);
                return Ok(());
            }
        }

        trace!(
            "cached capability announce from {}: {:?}, relay={}",
            from,
            announce.reachability,
            announce.relay_capable
        );
        let _ = self.cache.insert(announce.node.clone(), announce.clone());

        let callback = self
            .on_capability
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(callback) = callback {
            callback(&announce);
        }
        Ok(())
    }
}

impl std::fmt::Debug for CapabilityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityManager")
            .field("realm", &self.realm)
            .field("cached", &self.cache.len())
            .finish()
    }
}
