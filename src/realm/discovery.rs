// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! DHT-driven realm discovery: publish our participation, find other participants, and drive
//! authentication towards them.

use super::Realm;
use crate::lifecycle::Phase;
use crate::network::AddrSource;
use crate::types::SignedPeerRecord;
use backoff::{backoff::Backoff, ExponentialBackoff};
use std::sync::Arc;
use tokio::sync::Semaphore;

impl Realm {
    /// Background half of joining: wait for the local address set, publish the provider and
    /// signed peer records (with retries), then keep discovering other participants.
    pub(crate) async fn join_background(self: &Arc<Self>) {
        let wait = tokio::time::timeout(
            self.config.address_ready_timeout,
            self.coordinator.wait_address_ready(),
        )
        .await;
        if wait.is_err() {
            // Publish whatever we have; a later network change re-registers fresher addresses.
            warn!(
                "address set not ready after {:?}, publishing realm records anyway",
                self.config.address_ready_timeout
            );
        }

        if self.dht.is_some() {
            self.publish_realm_records().await;
        } else {
            debug!("no DHT wired in, realm {} relies on direct connections", self.id);
        }
        self.coordinator.complete(Phase::DhtPublish);

        if self.dht.is_some() {
            let realm = self.clone();
            self.spawn(tokio::spawn(async move {
                realm.discovery_loop().await;
            }));
        }
        self.coordinator.complete(Phase::MemberDiscovery);

        if self.dht.is_some() {
            let realm = self.clone();
            self.spawn(tokio::spawn(async move {
                realm.republish_loop().await;
            }));
        }
    }

    /// Publishes the provider record and the signed peer record, each with a short retry
    /// schedule. Failures are damped; the republish loop tries again later.
    async fn publish_realm_records(&self) {
        let dht = match &self.dht {
            Some(dht) => dht.clone(),
            None => return,
        };

        for attempt in 1..=self.config.dht_publish_retries {
            match dht.provide_realm(&self.id).await {
                Ok(()) => {
                    trace!("published provider record for realm {}", self.id);
                    break;
                }
                Err(err) => {
                    debug!(
                        "provider publish attempt {}/{} failed: {}",
                        attempt, self.config.dht_publish_retries, err
                    );
                    tokio::time::sleep(self.config.dht_publish_interval).await;
                }
            }
        }

        let record = match SignedPeerRecord::build(
            &self.keypair,
            &self.id,
            self.host.shareable_addrs(),
        ) {
            Ok(record) => record,
            Err(err) => {
                warn!("failed to build signed peer record: {}", err);
                return;
            }
        };
        for attempt in 1..=self.config.dht_publish_retries {
            match dht.publish_peer_record(&self.id, record.clone()).await {
                Ok(()) => {
                    trace!("published signed peer record for realm {}", self.id);
                    break;
                }
                Err(err) => {
                    debug!(
                        "peer record publish attempt {}/{} failed: {}",
                        attempt, self.config.dht_publish_retries, err
                    );
                    tokio::time::sleep(self.config.dht_publish_interval).await;
                }
            }
        }
    }

    /// Finds realm providers and funnels new ones into authentication. Idle rounds back off
    /// exponentially; any round that surfaces a new peer resets the backoff.
    async fn discovery_loop(self: &Arc<Self>) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_auths));
        let mut backoff = ExponentialBackoff {
            initial_interval: self.config.discovery_backoff_min,
            max_interval: self.config.discovery_backoff_max,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };
        let mut shutdown = self.shutdown_rx();

        loop {
            let found = self.discovery_round(&semaphore).await;
            let wait = if found > 0 {
                backoff.reset();
                self.config.discovery_backoff_min
            } else {
                backoff
                    .next_backoff()
                    .unwrap_or(self.config.discovery_backoff_max)
            };

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        trace!("discovery loop stopped");
    }

    /// One sweep over the provider set. Returns how many unseen candidates it found.
    async fn discovery_round(self: &Arc<Self>, semaphore: &Arc<Semaphore>) -> usize {
        let dht = match &self.dht {
            Some(dht) => dht.clone(),
            None => return 0,
        };
        let providers = match dht.find_realm_providers(&self.id).await {
            Ok(providers) => providers,
            Err(err) => {
                debug!("provider lookup for realm {} failed: {}", self.id, err);
                return 0;
            }
        };

        let mut found = 0usize;
        for peer in providers {
            if peer == self.local
                || self.is_infrastructure(&peer)
                || self.members.is_member(&peer)
                || self.authenticating.contains(&peer)
            {
                continue;
            }
            found += 1;

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let realm = self.clone();
            let _ = tokio::spawn(async move {
                realm.approach_candidate(peer).await;
                drop(permit);
            });
        }
        found
    }

    /// Fetch the candidate's signed addresses, dial, and authenticate.
    async fn approach_candidate(self: &Arc<Self>, peer: crate::types::NodeId) {
        let dht = match &self.dht {
            Some(dht) => dht.clone(),
            None => return,
        };

        match dht.find_peer_record(&self.id, &peer).await {
            Ok(Some(record)) => {
                if let Err(err) = record.verify() {
                    debug!("discarding unverifiable peer record for {}: {}", peer, err);
                    return;
                }
                if record.peer_id != peer || record.realm != self.id.as_str() {
                    debug!("peer record for {} names a different subject or realm", peer);
                    return;
                }
                if !record.addrs.is_empty() {
                    self.host.peerstore().add_addrs(
                        &peer,
                        &record.addrs,
                        AddrSource::MemberList,
                        self.config.member_addr_ttl,
                    );
                }
            }
            Ok(None) => trace!("no peer record for {} yet", peer),
            Err(err) => debug!("peer record lookup for {} failed: {}", peer, err),
        }

        if let Err(err) = self.connector.connect_unchecked(&peer, Vec::new()).await {
            debug!("discovery dial to {} failed: {}", peer, err);
            return;
        }
        self.authenticate_and_add_member(peer).await;
    }

    /// Keeps the provider and peer records fresh: the DHT forgets them after a day, so
    /// republish at half that.
    async fn republish_loop(self: &Arc<Self>) {
        let mut shutdown = self.shutdown_rx();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.config.provider_republish_interval) => {
                    self.publish_realm_records().await;
                }
            }
        }
        trace!("provider republish loop stopped");
    }
}
