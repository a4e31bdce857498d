// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Authoritative member set of one Realm.

mod store;

pub(crate) use store::MemberStore;

use crate::error::{Error, Result};
use crate::network::{EventBus, MembershipEvent};
use crate::types::{
    unix_now_secs, LeaveReason, MemberDigest, MemberInfo, MemberRole, Multiaddr, NodeId, RealmId,
};
use crate::types::MemberStats;
use dashmap::DashMap;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

/// Authoritative map of [`NodeId`] to [`MemberInfo`] for one Realm, plus the set of peers that
/// departed gracefully and must not be resurrected by gossip.
pub struct MemberManager {
    realm: RealmId,
    local: NodeId,
    members: DashMap<NodeId, MemberInfo>,
    gracefully_left: DashMap<NodeId, u64>,
    events: Arc<EventBus>,
    store: Option<MemberStore>,
    // Bumped on every add/remove; the sync protocol's monotonic version.
    version: AtomicU64,
    started: AtomicBool,
}

impl MemberManager {
    pub(crate) fn new(
        realm: RealmId,
        local: NodeId,
        events: Arc<EventBus>,
        store: Option<MemberStore>,
    ) -> Self {
        Self {
            realm,
            local,
            members: DashMap::new(),
            gracefully_left: DashMap::new(),
            events,
            store,
            version: AtomicU64::new(0),
            started: AtomicBool::new(false),
        }
    }

    /// Seeds the map from the store (when configured) and inserts the local node as an online
    /// member with the given shareable addresses.
    pub(crate) fn start(&self, local_addrs: Vec<Multiaddr>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted(self.realm.as_str().to_string()));
        }

        if let Some(store) = &self.store {
            for info in store.load_all()? {
                debug!("recovered member {} from store", info.peer);
                let _ = self.members.insert(info.peer.clone(), info);
            }
        }

        let mut local = MemberInfo::joined(self.local.clone(), self.realm.clone(), local_addrs);
        if let Some(previous) = self.members.get(&self.local) {
            local.joined_at = previous.joined_at;
            local.role = previous.role;
        }
        self.persist(&local);
        let _ = self.members.insert(self.local.clone(), local);
        let _ = self.version.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    /// Adds a member. Idempotent: adding an existing peer only bumps its `last_seen`.
    /// Returns whether the peer was actually new.
    pub fn add(&self, info: MemberInfo) -> bool {
        let peer = info.peer.clone();
        if let Some(mut existing) = self.members.get_mut(&peer) {
            existing.last_seen = unix_now_secs();
            if !info.addrs.is_empty() {
                existing.addrs = info.addrs;
            }
            let updated = existing.clone();
            drop(existing);
            self.persist(&updated);
            return false;
        }

        self.persist(&info);
        let _ = self.members.insert(peer, info.clone());
        let _ = self.version.fetch_add(1, Ordering::SeqCst);
        self.events.publish_membership(MembershipEvent::Joined(info));
        true
    }

    /// Removes a member. Graceful and Kicked departures are remembered so gossip cannot re-add
    /// the peer before it re-authenticates.
    pub fn remove(&self, peer: &NodeId, reason: LeaveReason) -> Option<MemberInfo> {
        let removed = self.members.remove(peer).map(|(_, info)| info);
        if removed.is_some() {
            if matches!(reason, LeaveReason::Graceful | LeaveReason::Kicked) {
                let _ = self.gracefully_left.insert(peer.clone(), unix_now_secs());
            }
            if let Some(store) = &self.store {
                if let Err(err) = store.remove(peer) {
                    warn!("failed to remove {} from member store: {}", peer, err);
                }
            }
            let _ = self.version.fetch_add(1, Ordering::SeqCst);
            self.events.publish_membership(MembershipEvent::Left {
                peer: peer.clone(),
                reason,
            });
        }
        removed
    }

    /// Info for one member.
    pub fn get(&self, peer: &NodeId) -> Option<MemberInfo> {
        self.members.get(peer).map(|entry| entry.clone())
    }

    /// All members.
    pub fn list(&self) -> Vec<MemberInfo> {
        self.members.iter().map(|entry| entry.clone()).collect()
    }

    /// Members currently believed online.
    pub fn list_online(&self) -> Vec<MemberInfo> {
        self.members
            .iter()
            .filter(|entry| entry.online)
            .map(|entry| entry.clone())
            .collect()
    }

    /// Member ids except the local node.
    pub fn remote_peers(&self) -> Vec<NodeId> {
        self.members
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|peer| peer != &self.local)
            .collect()
    }

    /// Whether `peer` is a member.
    pub fn is_member(&self, peer: &NodeId) -> bool {
        self.members.contains_key(peer)
    }

    /// Updates the online flag. Returns whether anything changed.
    pub fn update_status(&self, peer: &NodeId, online: bool) -> bool {
        match self.members.get_mut(peer) {
            Some(mut info) if info.online != online => {
                info.online = online;
                info.last_seen = unix_now_secs();
                let updated = info.clone();
                drop(info);
                self.persist(&updated);
                self.events.publish_membership(MembershipEvent::StatusChanged {
                    peer: peer.clone(),
                    online,
                });
                true
            }
            _ => false,
        }
    }

    /// Bumps `last_seen` for `peer`.
    pub fn update_last_seen(&self, peer: &NodeId) {
        if let Some(mut info) = self.members.get_mut(peer) {
            info.last_seen = unix_now_secs();
        }
    }

    /// Sets a metadata entry. Only call on data received over an authenticated channel.
    pub fn update_metadata(&self, peer: &NodeId, key: String, value: String) -> bool {
        match self.members.get_mut(peer) {
            Some(mut info) => {
                let _ = info.metadata.insert(key, value);
                let updated = info.clone();
                drop(info);
                self.persist(&updated);
                true
            }
            None => false,
        }
    }

    /// Sets a member's role. Only call on data received over an authenticated channel.
    pub fn set_role(&self, peer: &NodeId, role: MemberRole) -> bool {
        match self.members.get_mut(peer) {
            Some(mut info) => {
                info.role = role;
                let updated = info.clone();
                drop(info);
                self.persist(&updated);
                true
            }
            None => false,
        }
    }

    /// Replaces the local member's address list after a network change.
    pub(crate) fn refresh_local_addrs(&self, addrs: Vec<Multiaddr>) {
        if let Some(mut info) = self.members.get_mut(&self.local) {
            info.addrs = addrs;
            info.last_seen = unix_now_secs();
        }
    }

    /// Aggregate counters.
    pub fn stats(&self) -> MemberStats {
        let mut stats = MemberStats::default();
        for entry in self.members.iter() {
            stats.total += 1;
            if entry.online {
                stats.online += 1;
            }
            if entry.role == MemberRole::Admin {
                stats.admins += 1;
            }
        }
        stats
    }

    /// Removes members (never the local node) not seen for longer than `expiry`.
    /// Returns the removed ids.
    pub fn prune_expired(&self, expiry: std::time::Duration) -> Vec<NodeId> {
        let cutoff = unix_now_secs().saturating_sub(expiry.as_secs());
        let stale: Vec<NodeId> = self
            .members
            .iter()
            .filter(|entry| entry.key() != &self.local && entry.last_seen < cutoff)
            .map(|entry| entry.key().clone())
            .collect();
        for peer in &stale {
            debug!("expiring member {} (last seen before cutoff)", peer);
            let _ = self.remove(peer, LeaveReason::Witness);
        }
        stale
    }

    /// Whether `peer` departed gracefully (or was kicked) and has not re-authenticated since.
    pub fn has_gracefully_left(&self, peer: &NodeId) -> bool {
        self.gracefully_left.contains_key(peer)
    }

    /// Clears the graceful-leave marker; called on a successful re-authentication.
    pub(crate) fn clear_gracefully_left(&self, peer: &NodeId) {
        let _ = self.gracefully_left.remove(peer);
    }

    /// The monotonic membership version used by the sync protocol.
    pub(crate) fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Adopts a higher version observed from a peer.
    pub(crate) fn adopt_version(&self, version: u64) {
        let _ = self.version.fetch_max(version, Ordering::SeqCst);
    }

    /// Compact list for the post-auth exchange and gossip full-list messages.
    pub(crate) fn digests(&self, cap: usize) -> Vec<MemberDigest> {
        self.members
            .iter()
            .take(cap)
            .map(|entry| MemberDigest {
                peer: entry.peer.clone(),
                addrs: entry.addrs.clone(),
                last_seen: entry.last_seen,
            })
            .collect()
    }

    /// Merges a remote compact list: unknown peers become members (role Member), peers that left
    /// gracefully are not resurrected, the local node is skipped.
    /// Returns the ids that were actually new.
    pub(crate) fn merge_digests(&self, digests: Vec<MemberDigest>) -> Vec<NodeId> {
        let mut added = Vec::new();
        for digest in digests
            .into_iter()
            .take(crate::auth::MEMBER_EXCHANGE_CAP)
        {
            if digest.peer == self.local
                || self.has_gracefully_left(&digest.peer)
                || self.is_member(&digest.peer)
            {
                continue;
            }
            let mut info =
                MemberInfo::joined(digest.peer.clone(), self.realm.clone(), digest.addrs);
            if digest.last_seen > 0 {
                info.last_seen = digest.last_seen;
            }
            if self.add(info) {
                added.push(digest.peer);
            }
        }
        added
    }
}

impl std::fmt::Debug for MemberManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemberManager")
            .field("realm", &self.realm)
            .field("members", &self.members.len())
            .finish()
    }
}

impl MemberManager {
    fn persist(&self, info: &MemberInfo) {
        if let Some(store) = &self.store {
            if let Err(err) = store.put(info) {
                warn!("failed to persist member {}: {}", info.peer, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn node_id() -> NodeId {
        let keypair = ed25519_dalek::Keypair::generate(&mut OsRng);
        NodeId::from_public_key(&keypair.public)
    }

    fn manager() -> (MemberManager, NodeId) {
        let local = node_id();
        let manager = MemberManager::new(
            RealmId::new("r").expect("realm id"),
            local.clone(),
            Arc::new(EventBus::new()),
            None,
        );
        manager
            .start(vec![Multiaddr::new("/ip4/192.168.1.5/tcp/4001")])
            .expect("start");
        (manager, local)
    }

    #[test]
    fn local_node_is_always_a_member() {
        let (manager, local) = manager();
        assert!(manager.is_member(&local));
        assert_eq!(manager.stats().total, 1);
    }

    #[test]
    fn duplicate_add_is_a_last_seen_bump() {
        let (manager, _) = manager();
        let peer = node_id();
        let realm = RealmId::new("r").expect("realm id");

        let mut first = MemberInfo::joined(peer.clone(), realm.clone(), vec![]);
        first.last_seen = 1;
        assert!(manager.add(first));
        let version = manager.version();

        assert!(!manager.add(MemberInfo::joined(peer.clone(), realm, vec![])));
        assert_eq!(manager.stats().total, 2);
        // A bump does not advance the membership version.
        assert_eq!(manager.version(), version);
        let seen = manager.get(&peer).expect("member").last_seen;
        assert!(seen >= unix_now_secs() - 2);
    }

    #[test]
    fn graceful_leave_blocks_gossip_resurrection() {
        let (manager, _) = manager();
        let peer = node_id();
        let realm = RealmId::new("r").expect("realm id");

        assert!(manager.add(MemberInfo::joined(peer.clone(), realm, vec![])));
        let _ = manager.remove(&peer, LeaveReason::Graceful);
        assert!(manager.has_gracefully_left(&peer));

        let merged = manager.merge_digests(vec![MemberDigest {
            peer: peer.clone(),
            addrs: vec![],
            last_seen: unix_now_secs(),
        }]);
        assert!(merged.is_empty());
        assert!(!manager.is_member(&peer));

        // Re-auth clears the marker; the next merge may add the peer again.
        manager.clear_gracefully_left(&peer);
        let merged = manager.merge_digests(vec![MemberDigest {
            peer: peer.clone(),
            addrs: vec![],
            last_seen: unix_now_secs(),
        }]);
        assert_eq!(merged, vec![peer]);
    }

    #[test]
    fn witness_removal_does_not_mark_graceful() {
        let (manager, _) = manager();
        let peer = node_id();
        let realm = RealmId::new("r").expect("realm id");
        assert!(manager.add(MemberInfo::joined(peer.clone(), realm, vec![])));

        let _ = manager.remove(&peer, LeaveReason::Witness);
        assert!(!manager.has_gracefully_left(&peer));
    }

    #[test]
    fn status_update_reports_changes_only() {
        let (manager, _) = manager();
        let peer = node_id();
        let realm = RealmId::new("r").expect("realm id");
        assert!(manager.add(MemberInfo::joined(peer.clone(), realm, vec![])));

        assert!(!manager.update_status(&peer, true), "already online");
        assert!(manager.update_status(&peer, false));
        assert!(!manager.update_status(&peer, false));
        assert_eq!(manager.stats().online, 1); // just the local node
    }
}
