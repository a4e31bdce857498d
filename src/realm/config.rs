// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::delivery::DeliveryConfig;
use crate::resolver::ResolverConfig;
use crate::types::NodeId;
use std::{path::PathBuf, time::Duration};

/// All tunables of one Realm. `Default` carries the production values.
#[derive(Clone, Debug)]
pub struct RealmConfig {
    /// Per-attempt budget for a full challenge-response.
    pub auth_timeout: Duration,
    /// Accepted clock skew on challenge timestamps.
    pub challenge_validity: Duration,
    /// I/O deadline on the post-auth member exchange.
    pub exchange_timeout: Duration,
    /// How long the passive side of role negotiation waits before initiating anyway.
    pub negotiation_wait: Duration,
    /// Poll interval while the passive side waits.
    pub negotiation_poll: Duration,
    /// How long a raw-dial connect waits for PSK auth to promote the peer.
    pub membership_wait: Duration,
    /// Poll interval while waiting for membership.
    pub membership_poll: Duration,
    /// Pause after announcing a graceful leave so it propagates.
    pub leave_propagation_wait: Duration,
    /// Budget for the address-ready gate before DHT publication proceeds anyway.
    pub address_ready_timeout: Duration,
    /// Retry delays for peers that did not speak the realm protocol yet.
    pub pending_auth_schedule: Vec<Duration>,
    /// Tick of the pending-auth retry loop.
    pub auth_retry_tick: Duration,
    /// Retry delays for the post-join gossip announcement.
    pub join_publish_schedule: Vec<Duration>,
    /// Retry delays for the newcomer full-list request.
    pub sync_request_schedule: Vec<Duration>,
    /// Attempts for each DHT publication.
    pub dht_publish_retries: u32,
    /// Delay between DHT publication attempts.
    pub dht_publish_interval: Duration,
    /// Period of provider-record republication.
    pub provider_republish_interval: Duration,
    /// Period of capability broadcasts.
    pub capability_broadcast_interval: Duration,
    /// Delay before unicasting a capability announce to a fresh member.
    pub capability_unicast_delay: Duration,
    /// Delay before broadcasting the full member list after a join.
    pub member_broadcast_delay: Duration,
    /// Period of the member sync auto-loop.
    pub sync_interval: Duration,
    /// Members sampled per sync round.
    pub sync_peer_count: usize,
    /// Random members that answer a full-list request.
    pub sync_responder_count: usize,
    /// I/O deadline on sync streams.
    pub sync_io_timeout: Duration,
    /// TTL for member addresses written into the peerstore.
    pub member_addr_ttl: Duration,
    /// TTL for capability-announce addresses written into the peerstore.
    pub discovered_addr_ttl: Duration,
    /// Validity window of leave records.
    pub leave_validity: Duration,
    /// Accepted future skew on leave records.
    pub leave_future_skew: Duration,
    /// Idle discovery backoff starts here and doubles.
    pub discovery_backoff_min: Duration,
    /// Idle discovery backoff cap.
    pub discovery_backoff_max: Duration,
    /// Concurrent authentications driven by discovery.
    pub max_concurrent_auths: usize,
    /// Stability window of the flap damper.
    pub stability_window: Duration,
    /// Transitions within the window that mark a peer flapping.
    pub stability_threshold: usize,
    /// Suppression time once flapping.
    pub stability_recovery: Duration,
    /// Delivery-core tuning.
    pub delivery: DeliveryConfig,
    /// Resolver tuning.
    pub resolver: ResolverConfig,
    /// Whether the connector may attempt hole punching.
    pub hole_punch: bool,
    /// Bootstrap/relay infrastructure peers that must never be authenticated as members.
    pub infrastructure_peers: Vec<NodeId>,
    /// Directory for the optional member store. `None` disables persistence.
    pub store_dir: Option<PathBuf>,
    /// Drop members not seen for this long. `None` keeps them until they leave.
    pub member_expiry: Option<Duration>,
    /// Tick of the expiry sweep when `member_expiry` is set.
    pub member_expiry_tick: Duration,
}

impl Default for RealmConfig {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(30),
            challenge_validity: Duration::from_secs(30),
            exchange_timeout: Duration::from_secs(10),
            negotiation_wait: Duration::from_secs(5),
            negotiation_poll: Duration::from_millis(500),
            membership_wait: Duration::from_secs(10),
            membership_poll: Duration::from_millis(200),
            leave_propagation_wait: Duration::from_millis(50),
            address_ready_timeout: Duration::from_secs(60),
            pending_auth_schedule: vec![
                Duration::from_secs(2),
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(30),
            ],
            auth_retry_tick: Duration::from_secs(1),
            join_publish_schedule: vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
            ],
            sync_request_schedule: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(15),
            ],
            dht_publish_retries: 3,
            dht_publish_interval: Duration::from_secs(2),
            provider_republish_interval: Duration::from_secs(12 * 60 * 60),
            capability_broadcast_interval: Duration::from_secs(60),
            capability_unicast_delay: Duration::from_millis(200),
            member_broadcast_delay: Duration::from_millis(1500),
            sync_interval: Duration::from_secs(30),
            sync_peer_count: 3,
            sync_responder_count: 3,
            sync_io_timeout: Duration::from_secs(10),
            member_addr_ttl: Duration::from_secs(60 * 60),
            discovered_addr_ttl: Duration::from_secs(10 * 60),
            leave_validity: Duration::from_secs(30),
            leave_future_skew: Duration::from_secs(5),
            discovery_backoff_min: Duration::from_secs(2),
            discovery_backoff_max: Duration::from_secs(60),
            max_concurrent_auths: 5,
            stability_window: Duration::from_secs(60),
            stability_threshold: 3,
            stability_recovery: Duration::from_secs(5 * 60),
            delivery: DeliveryConfig::default(),
            resolver: ResolverConfig::default(),
            hole_punch: true,
            infrastructure_peers: Vec::new(),
            store_dir: None,
            member_expiry: None,
            member_expiry_tick: Duration::from_secs(60),
        }
    }
}
