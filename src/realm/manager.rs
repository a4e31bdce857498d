// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use super::{Realm, RealmConfig};
use crate::error::{Error, Result};
use crate::lifecycle::LifecycleCoordinator;
use crate::network::{AddressBookClient, Dht, EventBus, Host, NatService, PubSub};
use crate::types::RealmId;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

/// Everything a realm needs from the surrounding node, injected at construction. The realm core
/// never reaches for globals; tests wire an in-memory substrate through this.
#[derive(Clone)]
pub struct NodeContext {
    /// The transport host.
    pub host: Arc<dyn Host>,
    /// The pub-sub layer.
    pub pubsub: Arc<dyn PubSub>,
    /// The DHT, when the node runs one.
    pub dht: Option<Arc<dyn Dht>>,
    /// NAT diagnosis.
    pub nat: Arc<dyn NatService>,
    /// Relay addressbook client, when a relay is configured.
    pub address_book: Option<Arc<dyn AddressBookClient>>,
    /// The process-wide event bus.
    pub events: Arc<EventBus>,
    /// The process-wide lifecycle coordinator.
    pub coordinator: Arc<LifecycleCoordinator>,
    /// The node's signing keypair.
    pub keypair: Arc<ed25519_dalek::Keypair>,
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("has_dht", &self.dht.is_some())
            .field("has_address_book", &self.address_book.is_some())
            .finish()
    }
}

/// Options for [`RealmManager::create_with_opts`].
#[derive(Clone, Debug, Default)]
pub struct RealmOpts {
    /// Human-readable name; defaults to the realm id.
    pub name: Option<String>,
    /// Config overriding the defaults.
    pub config: Option<RealmConfig>,
}

/// User-level entry point: join, leave and look up realms on this node.
pub struct RealmManager {
    ctx: NodeContext,
    realms: Mutex<HashMap<String, Arc<Realm>>>,
    current: Mutex<Option<String>>,
}

impl RealmManager {
    /// A manager over the given node context.
    pub fn new(ctx: NodeContext) -> Self {
        Self {
            ctx,
            realms: Mutex::new(HashMap::new()),
            current: Mutex::new(None),
        }
    }

    /// Joins (or creates) a realm and starts it. The first joined realm becomes current.
    pub async fn join(&self, realm_id: &str, psk: &[u8]) -> Result<Arc<Realm>> {
        self.join_with_opts(realm_id, psk, RealmOpts::default())
            .await
    }

    /// [`RealmManager::join`] with explicit options.
    pub async fn join_with_opts(
        &self,
        realm_id: &str,
        psk: &[u8],
        opts: RealmOpts,
    ) -> Result<Arc<Realm>> {
        // Validate both inputs before touching any state.
        let id = RealmId::new(realm_id)?;
        if psk.is_empty() {
            return Err(Error::EmptyPsk);
        }
        {
            let realms = self
                .realms
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if realms.contains_key(realm_id) {
                return Err(Error::AlreadyJoined(realm_id.to_string()));
            }
        }

        let name = opts.name.unwrap_or_else(|| realm_id.to_string());
        let config = opts.config.unwrap_or_default();
        let realm = Realm::new(id, name, psk, config, &self.ctx)?;
        realm.start().await?;

        let mut realms = self
            .realms
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if realms
            .insert(realm_id.to_string(), realm.clone())
            .is_some()
        {
            // Lost a join race for the same id; the newcomer wins, stop the loser quietly.
            warn!("concurrent join of realm {}", realm_id);
        }
        drop(realms);

        let mut current = self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if current.is_none() {
            *current = Some(realm_id.to_string());
        }

        Ok(realm)
    }

    /// Alias of [`RealmManager::join`].
    pub async fn create(&self, realm_id: &str, psk: &[u8]) -> Result<Arc<Realm>> {
        self.join(realm_id, psk).await
    }

    /// Alias of [`RealmManager::join_with_opts`].
    pub async fn create_with_opts(
        &self,
        realm_id: &str,
        psk: &[u8],
        opts: RealmOpts,
    ) -> Result<Arc<Realm>> {
        self.join_with_opts(realm_id, psk, opts).await
    }

    /// Leaves the current realm, announcing departure.
    pub async fn leave(&self) -> Result<()> {
        let current_id = {
            let mut current = self
                .current
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            current.take().ok_or(Error::NotInAnyRealm)?
        };
        let realm = {
            let mut realms = self
                .realms
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            realms.remove(&current_id).ok_or(Error::NotInAnyRealm)?
        };
        realm.stop().await
    }

    /// The current realm.
    pub fn current(&self) -> Option<Arc<Realm>> {
        let current = self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()?;
        self.get(&current)
    }

    /// A realm by id.
    pub fn get(&self, realm_id: &str) -> Option<Arc<Realm>> {
        self.realms
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(realm_id)
            .cloned()
    }

    /// All joined realms.
    pub fn list(&self) -> Vec<Arc<Realm>> {
        self.realms
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for RealmManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealmManager")
            .field(
                "realms",
                &self
                    .realms
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .len(),
            )
            .finish()
    }
}
