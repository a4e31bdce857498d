// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Core data types of the Realm subsystem.

mod address;
mod ticket;

pub use address::Multiaddr;
pub(crate) use address::any_public;
pub use ticket::{ConnectionTicket, TICKET_SCHEME};
pub(crate) use ticket::validate_hint;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    time::{SystemTime, UNIX_EPOCH},
};

/// Identifier of a Realm. Non-empty, immutable for the lifetime of a [`crate::Realm`] instance,
/// and embedded in every Realm-scoped protocol id and gossip topic name.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RealmId(String);

impl RealmId {
    /// Validates and wraps a realm id.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::EmptyRealmId);
        }
        Ok(Self(id))
    }

    /// The realm id as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn auth_protocol(&self) -> String {
        format!("/dep2p/realm/{}/auth/1.0.0", self.0)
    }

    pub(crate) fn sync_protocol(&self) -> String {
        format!("/dep2p/realm/{}/sync/1.0.0", self.0)
    }

    pub(crate) fn announce_protocol(&self) -> String {
        format!("/dep2p/realm/{}/announce/1.0.0", self.0)
    }

    pub(crate) fn members_topic(&self) -> String {
        format!("/dep2p/realm/{}/members", self.0)
    }

    /// The DHT provider key under which realm participants advertise themselves.
    pub(crate) fn provider_key(&self) -> String {
        format!("/dep2p/realm/{}/provider", self.0)
    }
}

impl Display for RealmId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a node: the base58 text form of its ed25519 public key.
///
/// `Ord` compares the text byte-wise, which is what initiator/passive role negotiation relies on.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Derives a node id from an ed25519 public key.
    pub fn from_public_key(key: &ed25519_dalek::PublicKey) -> Self {
        Self(bs58::encode(key.as_bytes()).into_string())
    }

    /// Parses a base58 node id, rejecting text that is not valid base58.
    pub fn from_base58(id: &str) -> Result<Self> {
        if id.is_empty() {
            return Err(Error::MalformedNodeId("empty".to_string()));
        }
        let _ = bs58::decode(id)
            .into_vec()
            .map_err(|_| Error::MalformedNodeId(id.to_string()))?;
        Ok(Self(id.to_string()))
    }

    /// The id as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The id as bytes (the byte-wise tiebreaker used during role negotiation).
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Recovers the ed25519 public key an id encodes. Ids are self-certifying: the text is the
    /// base58 form of the key itself.
    pub fn public_key(&self) -> Option<ed25519_dalek::PublicKey> {
        let bytes = bs58::decode(&self.0).into_vec().ok()?;
        ed25519_dalek::PublicKey::from_bytes(&bytes).ok()
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role of a member within a Realm. Role changes are only authoritative over an authenticated
/// channel; gossip-delivered joins always carry [`MemberRole::Member`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberRole {
    /// Ordinary member.
    Member,
    /// Realm administrator.
    Admin,
}

impl MemberRole {
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            MemberRole::Member => 0,
            MemberRole::Admin => 1,
        }
    }

    pub(crate) fn from_wire(byte: u8) -> Self {
        match byte {
            1 => MemberRole::Admin,
            _ => MemberRole::Member,
        }
    }
}

/// Reachability of a node as diagnosed by the NAT service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reachability {
    /// Directly dialable from the public internet.
    Public,
    /// Behind NAT or firewall.
    Private,
    /// Not yet diagnosed.
    Unknown,
}

/// Why a member left the Realm.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaveReason {
    /// The member announced its own departure.
    Graceful,
    /// An admin removed the member.
    Kicked,
    /// A third party observed the member go offline; status change only, pending confirmation.
    Witness,
}

impl LeaveReason {
    pub(crate) fn to_wire(self) -> i32 {
        match self {
            LeaveReason::Graceful => 0,
            LeaveReason::Kicked => 1,
            LeaveReason::Witness => 2,
        }
    }

    pub(crate) fn from_wire(value: i32) -> Option<Self> {
        match value {
            0 => Some(LeaveReason::Graceful),
            1 => Some(LeaveReason::Kicked),
            2 => Some(LeaveReason::Witness),
            _ => None,
        }
    }
}

/// Everything a Realm knows about one member. Keyed by [`NodeId`] within a Realm.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    /// The member's node id.
    pub peer: NodeId,
    /// The realm this record belongs to.
    pub realm: RealmId,
    /// Member role.
    pub role: MemberRole,
    /// Whether the member is currently believed online.
    pub online: bool,
    /// Unix seconds when the member joined.
    pub joined_at: u64,
    /// Unix seconds when the member was last seen.
    pub last_seen: u64,
    /// Known addresses, in preference order.
    pub addrs: Vec<Multiaddr>,
    /// Free-form metadata, authoritative only over authenticated channels.
    pub metadata: BTreeMap<String, String>,
}

impl MemberInfo {
    /// A fresh record for a peer that just authenticated.
    pub fn joined(peer: NodeId, realm: RealmId, addrs: Vec<Multiaddr>) -> Self {
        let now = unix_now_secs();
        Self {
            peer,
            realm,
            role: MemberRole::Member,
            online: true,
            joined_at: now,
            last_seen: now,
            addrs,
            metadata: BTreeMap::new(),
        }
    }
}

/// A member's declared reachability, shared addresses and relay capability.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityAnnounce {
    /// The announcing node.
    #[serde(rename = "NodeID")]
    pub node: NodeId,
    /// Reachability at announce time.
    #[serde(rename = "Reachability")]
    pub reachability: Reachability,
    /// Public addresses; empty unless reachability is [`Reachability::Public`].
    #[serde(rename = "Addrs")]
    pub addrs: Vec<Multiaddr>,
    /// Whether this node can act as a relay for others.
    #[serde(rename = "RelayCapable")]
    pub relay_capable: bool,
    /// Unix seconds the announce was built.
    #[serde(rename = "Timestamp")]
    pub timestamp: u64,
}

/// Compact member record exchanged right after authentication and in gossip full-list messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberDigest {
    /// Member node id.
    #[serde(rename = "PeerID")]
    pub peer: NodeId,
    /// Known addresses.
    #[serde(rename = "Addrs")]
    pub addrs: Vec<Multiaddr>,
    /// Unix seconds last seen.
    #[serde(rename = "LastSeen")]
    pub last_seen: u64,
}

/// Aggregate membership counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemberStats {
    /// Total members including the local node.
    pub total: usize,
    /// Members currently believed online.
    pub online: usize,
    /// Members holding the admin role.
    pub admins: usize,
}

/// A node's signed address bundle, published to the DHT per realm.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPeerRecord {
    /// The subject node.
    pub peer_id: NodeId,
    /// The realm the record was published for.
    pub realm: String,
    /// The node's shareable addresses.
    pub addrs: Vec<Multiaddr>,
    /// Unix seconds the record was built.
    pub ts: u64,
    /// Hex ed25519 public key of the subject.
    pub public_key: String,
    /// Hex ed25519 signature over the unsigned record bytes.
    pub signature: String,
}

impl SignedPeerRecord {
    fn unsigned_bytes(
        peer_id: &NodeId,
        realm: &str,
        addrs: &[Multiaddr],
        ts: u64,
    ) -> Result<Vec<u8>> {
        #[derive(Serialize)]
        struct Unsigned<'a> {
            peer_id: &'a NodeId,
            realm: &'a str,
            addrs: &'a [Multiaddr],
            ts: u64,
        }
        Ok(serde_json::to_vec(&Unsigned {
            peer_id,
            realm,
            addrs,
            ts,
        })?)
    }

    /// Builds and signs a record for the local node.
    pub fn build(
        keypair: &ed25519_dalek::Keypair,
        realm: &RealmId,
        addrs: Vec<Multiaddr>,
    ) -> Result<Self> {
        use signature::Signer;
        let peer_id = NodeId::from_public_key(&keypair.public);
        let ts = unix_now_secs();
        let payload = Self::unsigned_bytes(&peer_id, realm.as_str(), &addrs, ts)?;
        let signature = keypair.sign(&payload);
        Ok(Self {
            peer_id,
            realm: realm.as_str().to_string(),
            addrs,
            ts,
            public_key: hex::encode(keypair.public.as_bytes()),
            signature: hex::encode(signature.to_bytes()),
        })
    }

    /// Verifies the embedded signature and that the embedded key matches the subject id.
    pub fn verify(&self) -> Result<()> {
        use signature::Verifier;
        let key_bytes = hex::decode(&self.public_key).map_err(|_| Error::InvalidSignature)?;
        let key = ed25519_dalek::PublicKey::from_bytes(&key_bytes)
            .map_err(|_| Error::InvalidSignature)?;
        if NodeId::from_public_key(&key) != self.peer_id {
            return Err(Error::InvalidSignature);
        }
        let sig_bytes = hex::decode(&self.signature).map_err(|_| Error::InvalidSignature)?;
        let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes)
            .map_err(|_| Error::InvalidSignature)?;
        let payload = Self::unsigned_bytes(&self.peer_id, &self.realm, &self.addrs, self.ts)?;
        key.verify(&payload, &signature)
            .map_err(|_| Error::InvalidSignature)
    }
}

/// Current unix time in whole seconds.
pub(crate) fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current unix time in nanoseconds.
pub(crate) fn unix_now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn realm_id_rejects_empty() {
        assert!(RealmId::new("").is_err());
        assert!(RealmId::new("alpha").is_ok());
    }

    #[test]
    fn node_id_roundtrips_through_base58() -> eyre::Result<()> {
        let keypair = ed25519_dalek::Keypair::generate(&mut OsRng);
        let id = NodeId::from_public_key(&keypair.public);
        let parsed = NodeId::from_base58(id.as_str())?;
        assert_eq!(id, parsed);
        Ok(())
    }

    #[test]
    fn node_id_rejects_non_base58() {
        assert!(NodeId::from_base58("not-base58-0OIl").is_err());
        assert!(NodeId::from_base58("").is_err());
    }

    #[test]
    fn peer_record_verify_detects_tampering() -> eyre::Result<()> {
        let keypair = ed25519_dalek::Keypair::generate(&mut OsRng);
        let realm = RealmId::new("r")?;
        let mut record = SignedPeerRecord::build(
            &keypair,
            &realm,
            vec![Multiaddr::new("/ip4/203.0.113.5/tcp/4001")],
        )?;
        record.verify()?;

        record.addrs = vec![Multiaddr::new("/ip4/198.51.100.1/tcp/4001")];
        assert!(record.verify().is_err());
        Ok(())
    }

    #[test]
    fn member_digest_json_uses_wire_field_names() -> eyre::Result<()> {
        let keypair = ed25519_dalek::Keypair::generate(&mut OsRng);
        let digest = MemberDigest {
            peer: NodeId::from_public_key(&keypair.public),
            addrs: vec![Multiaddr::new("/ip4/203.0.113.5/tcp/4001")],
            last_seen: 17,
        };
        let json = serde_json::to_string(&digest)?;
        assert!(json.contains("\"PeerID\""));
        assert!(json.contains("\"Addrs\""));
        assert!(json.contains("\"LastSeen\""));
        Ok(())
    }
}
