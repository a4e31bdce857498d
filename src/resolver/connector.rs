// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use super::AddressResolver;
use crate::error::{Error, Result};
use crate::membership::MemberManager;
use crate::network::Host;
use crate::types::{Multiaddr, NodeId};
use itertools::Itertools;
use std::sync::Arc;

/// Drives connection attempts towards realm members.
///
/// `connect` refuses peers that are not members; the realm's raw-dial path bypasses the gate by
/// calling the transport directly and waiting for PSK auth to promote the peer.
pub struct Connector {
    host: Arc<dyn Host>,
    resolver: Arc<AddressResolver>,
    members: Arc<MemberManager>,
    hole_punch: bool,
}

impl Connector {
    pub(crate) fn new(
        host: Arc<dyn Host>,
        resolver: Arc<AddressResolver>,
        members: Arc<MemberManager>,
        hole_punch: bool,
    ) -> Self {
        Self {
            host,
            resolver,
            members,
            hole_punch,
        }
    }

    /// Connects to a realm member.
    pub async fn connect(&self, peer: &NodeId) -> Result<()> {
        self.connect_with_hints(peer, Vec::new()).await
    }

    /// Connects to a realm member, trying `hints` ahead of resolved addresses.
    pub async fn connect_with_hints(&self, peer: &NodeId, hints: Vec<Multiaddr>) -> Result<()> {
        if !self.members.is_member(peer) {
            return Err(Error::NotAMember(peer.clone()));
        }
        self.dial(peer, hints).await
    }

    /// Transport dial without the member gate. The caller owns waiting for authentication.
    pub(crate) async fn connect_unchecked(
        &self,
        peer: &NodeId,
        hints: Vec<Multiaddr>,
    ) -> Result<()> {
        self.dial(peer, hints).await
    }

    async fn dial(&self, peer: &NodeId, hints: Vec<Multiaddr>) -> Result<()> {
        if self.host.is_connected(peer) {
            return Ok(());
        }

        let resolved = self.resolver.resolve(peer).await?;
        // Hints take priority over resolved addresses.
        let addrs: Vec<Multiaddr> = hints
            .into_iter()
            .chain(resolved.addrs)
            .unique()
            .collect();
        trace!(
            "dialling {} with {} addrs (source {:?})",
            peer,
            addrs.len(),
            resolved.source
        );

        match self.host.connect(peer, &addrs).await {
            Ok(()) => Ok(()),
            Err(err) if self.hole_punch => {
                debug!("direct dial to {} failed ({}), trying hole punch", peer, err);
                self.host
                    .try_hole_punch(peer)
                    .await
                    .map_err(|_| Error::ConnectFailed(peer.clone()))
            }
            Err(err) => Err(err),
        }
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("hole_punch", &self.hole_punch)
            .finish()
    }
}
