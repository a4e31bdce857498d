// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! On-demand member synchronization over a versioned request/response protocol, plus the
//! periodic auto-loop that keeps membership converged when gossip messages were missed.

mod codec;

use codec::{SyncRequest, SyncResponse};

use crate::error::{Error, Result};
use crate::membership::MemberManager;
use crate::network::{AddrSource, FramedStream, Host, StreamHandler};
use crate::types::{NodeId, RealmId};
use rand::seq::SliceRandom;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{sync::watch, task::JoinHandle};

/// Runs the realm-scoped sync protocol: responder side via the registered stream handler,
/// initiator side on demand and from the auto-loop.
pub(crate) struct SyncHandler {
    realm: RealmId,
    host: Arc<dyn Host>,
    members: Arc<MemberManager>,
    interval: Duration,
    peer_count: usize,
    io_timeout: Duration,
    addr_ttl: Duration,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SyncHandler {
    pub(crate) fn new(
        realm: RealmId,
        host: Arc<dyn Host>,
        members: Arc<MemberManager>,
        interval: Duration,
        peer_count: usize,
        io_timeout: Duration,
        addr_ttl: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            realm,
            host,
            members,
            interval,
            peer_count,
            io_timeout,
            addr_ttl,
            loop_handle: Mutex::new(None),
        })
    }

    /// Registers the responder stream handler and spawns the auto-loop.
    pub(crate) fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let handler = self.clone();
        let stream_handler: StreamHandler = Arc::new(move |peer, stream| {
            let handler = handler.clone();
            Box::pin(async move {
                if let Err(err) = handler.handle_inbound(stream).await {
                    debug!("sync request from {} failed: {}", peer, err);
                }
            })
        });
        self.host
            .set_stream_handler(self.realm.sync_protocol(), stream_handler);

        let handler = self.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(handler.interval);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tick.tick() => {
                        handler.sync_round().await;
                    }
                }
            }
            trace!("sync auto-loop stopped");
        });
        *self
            .loop_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
    }

    pub(crate) fn stop(&self) {
        self.host.remove_stream_handler(&self.realm.sync_protocol());
        if let Some(handle) = self
            .loop_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            handle.abort();
        }
    }

    /// One auto-loop round: sample a few members and sync with each.
    async fn sync_round(&self) {
        let mut peers = self.members.remote_peers();
        if peers.is_empty() {
            return;
        }
        peers.shuffle(&mut rand::thread_rng());
        peers.truncate(self.peer_count);
        for peer in peers {
            if let Err(err) = self.sync_with(&peer).await {
                debug!("periodic sync with {} failed: {}", peer, err);
            }
        }
    }

    /// Initiator side: ask `peer` for anything newer than our version.
    pub(crate) async fn sync_with(&self, peer: &NodeId) -> Result<()> {
        let stream = self
            .host
            .open_stream(peer, &self.realm.sync_protocol())
            .await?;
        let mut framed = FramedStream::new(stream);

        let request = SyncRequest {
            realm: self.realm.as_str().to_string(),
            version: self.members.version(),
        };
        framed
            .write_frame_timeout(&codec::encode_request(&request), self.io_timeout)
            .await?;

        let response =
            codec::decode_response(&framed.read_frame_timeout(self.io_timeout).await?)?;
        self.apply(peer, response, request.version);
        Ok(())
    }

    fn apply(&self, from: &NodeId, response: SyncResponse, local_version: u64) {
        if response.version <= local_version {
            trace!("sync with {}: already current (v{})", from, local_version);
            return;
        }

        let mut added = 0usize;
        for info in response.added {
            if info.peer == self.host.local_id() || self.members.has_gracefully_left(&info.peer) {
                continue;
            }
            if !info.addrs.is_empty() {
                self.host.peerstore().add_addrs(
                    &info.peer,
                    &info.addrs,
                    AddrSource::MemberList,
                    self.addr_ttl,
                );
            }
            if self.members.add(info) {
                added += 1;
            }
        }
        for peer in &response.removed {
            if peer == &self.host.local_id() {
                continue;
            }
            let _ = self
                .members
                .remove(peer, crate::types::LeaveReason::Witness);
        }

        self.members.adopt_version(response.version);
        debug!(
            "sync with {}: adopted v{}, {} new members",
            from, response.version, added
        );
    }

    /// Responder side of one inbound stream.
    async fn handle_inbound(&self, stream: crate::network::StreamBox) -> Result<()> {
        let mut framed = FramedStream::new(stream);
        let request =
            codec::decode_request(&framed.read_frame_timeout(self.io_timeout).await?)?;

        if request.realm != self.realm.as_str() {
            return Err(Error::WrongRealm {
                expected: self.realm.as_str().to_string(),
                got: request.realm,
            });
        }

        let version = self.members.version();
        let added = if version > request.version {
            self.members.list()
        } else {
            Vec::new()
        };
        let response = SyncResponse {
            version,
            added,
            // Departures travel as signed leave records on the gossip topic; the layout keeps
            // room for explicit removals from future versions.
            removed: Vec::new(),
        };
        framed
            .write_frame_timeout(&codec::encode_response(&response)?, self.io_timeout)
            .await
    }
}

impl std::fmt::Debug for SyncHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHandler")
            .field("realm", &self.realm)
            .field("interval", &self.interval)
            .finish()
    }
}
