// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Realm core for a dep2p node.
//!
//! A Realm is a cryptographically scoped cluster of peers sharing a pre-shared key. Peers in a
//! Realm authenticate each other with a PSK-derived challenge-response, synchronize membership
//! over gossip and the DHT, and exchange capability (reachability) information. The transport,
//! NAT probing, DHT and pub-sub implementations are external collaborators consumed through the
//! traits in [`network`].

#![doc(
    html_logo_url = "https://github.com/maidsafe/QA/raw/master/Images/maidsafe_logo.png",
    html_favicon_url = "https://maidsafe.net/img/favicon.ico",
    test(attr(deny(warnings)))
)]
// Forbid some very bad patterns. Forbid is stronger than `deny`, preventing us from suppressing the
// lint with `#[allow(...)]` et-all.
#![forbid(
    arithmetic_overflow,
    mutable_transmutes,
    no_mangle_const_items,
    unknown_crate_types,
    unsafe_code
)]
// Turn on some additional warnings to encourage good style.
#![warn(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    clippy::unicode_not_nfc
)]

#[macro_use]
extern crate tracing;

mod auth;
mod capability;
mod delivery;
mod error;
mod gossip;
mod lifecycle;
mod membership;
pub mod network;
mod realm;
mod resolver;
mod stability;
mod sync;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use crate::{
    auth::AuthMode,
    capability::CapabilityManager,
    delivery::{AckResult, DeliveryConfig, DeliveryStatus, ReliablePublisher},
    error::{Error, Result},
    lifecycle::{LifecycleCoordinator, Phase},
    membership::MemberManager,
    realm::{NodeContext, Realm, RealmConfig, RealmManager, RealmOpts, RealmStats},
    resolver::{AddressResolver, Connector, ResolveSource, Resolved, ResolverConfig},
    stability::StabilityTracker,
    types::{
        CapabilityAnnounce, ConnectionTicket, LeaveReason, MemberDigest, MemberInfo, MemberRole,
        MemberStats, Multiaddr, NodeId, Reachability, RealmId, SignedPeerRecord,
    },
};

#[cfg(test)]
pub(crate) fn init_test_logger() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt::fmt()
            .with_thread_names(true)
            .with_ansi(false)
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_target(false)
            .try_init()
            .unwrap_or_else(|_| println!("Error initializing logger"));
    });
}
