// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! NodeID to address resolution over a strict source-priority ladder.

mod connector;

pub use connector::Connector;

use crate::error::Result;
use crate::network::{AddrSource, AddressBookClient, Dht, Peerstore};
use crate::types::{Multiaddr, NodeId};
use std::{sync::Arc, time::Duration};

/// Which rung of the ladder produced the result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolveSource {
    /// Local/manual peerstore entries.
    Peerstore,
    /// Addresses learned through realm membership.
    MemberList,
    /// Peerstore entries cached from earlier DHT lookups.
    DhtCache,
    /// A live DHT query.
    DhtQuery,
    /// Peerstore entries cached from earlier relay addressbook lookups.
    RelayCache,
    /// A live relay addressbook query.
    RelayQuery,
    /// Nothing found anywhere.
    None,
}

/// Result of a resolution.
#[derive(Clone, Debug)]
pub struct Resolved {
    /// The addresses, possibly empty. An empty result is not an error.
    pub addrs: Vec<Multiaddr>,
    /// Which rung produced them.
    pub source: ResolveSource,
    /// Whether the result came from a cache rather than a live query.
    pub cached: bool,
}

impl Resolved {
    fn none() -> Self {
        Self {
            addrs: Vec::new(),
            source: ResolveSource::None,
            cached: false,
        }
    }
}

/// Knobs for the resolver.
#[derive(Clone, Debug)]
pub struct ResolverConfig {
    /// Whether live DHT queries are allowed.
    pub dht_enabled: bool,
    /// Timeout on a live DHT query.
    pub dht_query_timeout: Duration,
    /// TTL of addresses cached back from live queries.
    pub query_cache_ttl: Duration,
    /// Whether live relay addressbook queries are allowed.
    pub relay_enabled: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            dht_enabled: true,
            dht_query_timeout: Duration::from_secs(5),
            query_cache_ttl: Duration::from_secs(10 * 60),
            relay_enabled: true,
        }
    }
}

/// Resolves a [`NodeId`] to addresses by trying sources in a fixed order and returning the first
/// non-empty result.
pub struct AddressResolver {
    peerstore: Arc<dyn Peerstore>,
    dht: Option<Arc<dyn Dht>>,
    address_book: Option<Arc<dyn AddressBookClient>>,
    config: ResolverConfig,
}

impl AddressResolver {
    pub(crate) fn new(
        peerstore: Arc<dyn Peerstore>,
        dht: Option<Arc<dyn Dht>>,
        address_book: Option<Arc<dyn AddressBookClient>>,
        config: ResolverConfig,
    ) -> Self {
        Self {
            peerstore,
            dht,
            address_book,
            config,
        }
    }

    /// Walks the ladder. Every rung that returns something ends the walk.
    pub async fn resolve(&self, peer: &NodeId) -> Result<Resolved> {
        // 1. Local/manual peerstore entries (includes addresses observed by the transport and
        //    fresh capability-announce entries).
        let mut addrs = self.peerstore.addrs_from(peer, AddrSource::Manual);
        if addrs.is_empty() {
            addrs = self.peerstore.addrs_from(peer, AddrSource::Discovered);
        }
        if !addrs.is_empty() {
            return Ok(Resolved {
                addrs,
                source: ResolveSource::Peerstore,
                cached: true,
            });
        }

        // 2. Addresses learned through realm membership.
        let addrs = self.peerstore.addrs_from(peer, AddrSource::MemberList);
        if !addrs.is_empty() {
            return Ok(Resolved {
                addrs,
                source: ResolveSource::MemberList,
                cached: true,
            });
        }

        // 3. Cached DHT results.
        let addrs = self.peerstore.addrs_from(peer, AddrSource::Dht);
        if !addrs.is_empty() {
            return Ok(Resolved {
                addrs,
                source: ResolveSource::DhtCache,
                cached: true,
            });
        }

        // 4. Live DHT query, cached back under the DHT tag.
        if self.config.dht_enabled {
            if let Some(dht) = &self.dht {
                match tokio::time::timeout(self.config.dht_query_timeout, dht.find_peer(peer))
                    .await
                {
                    Ok(Ok(addrs)) if !addrs.is_empty() => {
                        self.peerstore.add_addrs(
                            peer,
                            &addrs,
                            AddrSource::Dht,
                            self.config.query_cache_ttl,
                        );
                        return Ok(Resolved {
                            addrs,
                            source: ResolveSource::DhtQuery,
                            cached: false,
                        });
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => debug!("dht lookup for {} failed: {}", peer, err),
                    Err(_) => debug!("dht lookup for {} timed out", peer),
                }
            }
        }

        // 5. Cached relay addressbook results.
        let addrs = self.peerstore.addrs_from(peer, AddrSource::Relay);
        if !addrs.is_empty() {
            return Ok(Resolved {
                addrs,
                source: ResolveSource::RelayCache,
                cached: true,
            });
        }

        // 6. Live relay addressbook query, cached back under the relay tag.
        if self.config.relay_enabled {
            if let Some(book) = &self.address_book {
                match book.lookup(peer).await {
                    Ok(addrs) if !addrs.is_empty() => {
                        self.peerstore.add_addrs(
                            peer,
                            &addrs,
                            AddrSource::Relay,
                            self.config.query_cache_ttl,
                        );
                        return Ok(Resolved {
                            addrs,
                            source: ResolveSource::RelayQuery,
                            cached: false,
                        });
                    }
                    Ok(_) => {}
                    Err(err) => debug!("relay addressbook lookup for {} failed: {}", peer, err),
                }
            }
        }

        Ok(Resolved::none())
    }
}

impl std::fmt::Debug for AddressResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressResolver")
            .field("config", &self.config)
            .finish()
    }
}
