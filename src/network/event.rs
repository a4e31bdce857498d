// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::types::{LeaveReason, MemberInfo, Multiaddr, NodeId};
use tokio::sync::broadcast;

const EVENT_CHANNEL_SIZE: usize = 256;

/// Transport-level events the Realm subscribes to.
#[derive(Clone, Debug)]
pub enum NetworkEvent {
    /// A connection to `peer` was established.
    PeerConnected(NodeId),
    /// The last connection to `peer` was closed.
    PeerDisconnected(NodeId),
    /// The local address set changed (interface change, NAT rebind, ...).
    AddrsChanged(Vec<Multiaddr>),
}

/// Membership events the Realm emits for user code.
#[derive(Clone, Debug)]
pub enum MembershipEvent {
    /// A member joined (or was merged from a peer's list).
    Joined(MemberInfo),
    /// A member left.
    Left {
        /// The departed member.
        peer: NodeId,
        /// Why it left.
        reason: LeaveReason,
    },
    /// A member's online flag changed.
    StatusChanged {
        /// The member.
        peer: NodeId,
        /// The new online flag.
        online: bool,
    },
}

/// Process-wide typed event bus, injected at construction. The Realm core never reaches for a
/// global; tests build their own bus per node.
#[derive(Debug)]
pub struct EventBus {
    network_tx: broadcast::Sender<NetworkEvent>,
    membership_tx: broadcast::Sender<MembershipEvent>,
}

impl EventBus {
    /// A fresh bus with nothing subscribed.
    pub fn new() -> Self {
        let (network_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (membership_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            network_tx,
            membership_tx,
        }
    }

    /// Subscribes to transport events.
    pub fn subscribe_network(&self) -> broadcast::Receiver<NetworkEvent> {
        self.network_tx.subscribe()
    }

    /// Publishes a transport event. Lossy when nobody is subscribed.
    pub fn publish_network(&self, event: NetworkEvent) {
        let _ = self.network_tx.send(event);
    }

    /// Subscribes to membership events.
    pub fn subscribe_membership(&self) -> broadcast::Receiver<MembershipEvent> {
        self.membership_tx.subscribe()
    }

    /// Publishes a membership event. Lossy when nobody is subscribed.
    pub fn publish_membership(&self, event: MembershipEvent) {
        let _ = self.membership_tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
