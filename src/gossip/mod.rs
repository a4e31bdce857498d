// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Messages flowing on the realm-scoped member topic.
//!
//! Every payload carries a textual prefix naming its kind. The compact `join:`/`sync:` forms
//! carry bare ids; the `join2:`/`sync2:` forms carry JSON with addresses, which is what current
//! nodes emit. Both are accepted.

mod leave;

pub(crate) use leave::{LeaveValidator, MemberLeave, ValidLeave};

use crate::types::{MemberDigest, Multiaddr, NodeId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

const JOIN_PREFIX: &str = "join:";
const JOIN2_PREFIX: &str = "join2:";
const SYNC_PREFIX: &str = "sync:";
const SYNC2_PREFIX: &str = "sync2:";
const REQ_SYNC: &str = "req:sync";
const LEAVE_PREFIX: &[u8] = b"leave:";
const ACK_PREFIX: &[u8] = b"ack2:";

/// Body of a `join2:` announcement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct JoinAnnouncement {
    #[serde(rename = "PeerID")]
    pub(crate) peer: NodeId,
    #[serde(rename = "Addrs")]
    pub(crate) addrs: Vec<Multiaddr>,
}

/// Body of a `sync2:` full-list message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct MemberListMessage {
    #[serde(rename = "Members")]
    pub(crate) members: Vec<MemberDigest>,
}

/// A parsed topic message.
#[derive(Clone, Debug)]
pub(crate) enum TopicMsg {
    /// A new member, id only.
    Join(NodeId),
    /// A new member with addresses.
    Join2(JoinAnnouncement),
    /// Full member list, ids only.
    SyncList(Vec<NodeId>),
    /// Full member list with addresses.
    SyncList2(Vec<MemberDigest>),
    /// A newcomer asking for the full list.
    ReqSync,
    /// A signed leave record (protobuf bytes after the prefix).
    Leave(Bytes),
    /// Delivery-layer acknowledgement control frame.
    Ack(Bytes),
}

impl TopicMsg {
    /// Parses a raw topic payload. Unknown prefixes yield `None` and are dropped by the caller.
    pub(crate) fn parse(data: &[u8]) -> Option<Self> {
        if let Some(rest) = strip(data, LEAVE_PREFIX) {
            return Some(TopicMsg::Leave(Bytes::copy_from_slice(rest)));
        }
        if let Some(rest) = strip(data, ACK_PREFIX) {
            return Some(TopicMsg::Ack(Bytes::copy_from_slice(rest)));
        }

        let text = std::str::from_utf8(data).ok()?;
        if text == REQ_SYNC {
            return Some(TopicMsg::ReqSync);
        }
        if let Some(body) = text.strip_prefix(JOIN2_PREFIX) {
            return serde_json::from_str(body).ok().map(TopicMsg::Join2);
        }
        if let Some(id) = text.strip_prefix(JOIN_PREFIX) {
            return NodeId::from_base58(id).ok().map(TopicMsg::Join);
        }
        if let Some(body) = text.strip_prefix(SYNC2_PREFIX) {
            return serde_json::from_str::<MemberListMessage>(body)
                .ok()
                .map(|list| TopicMsg::SyncList2(list.members));
        }
        if let Some(ids) = text.strip_prefix(SYNC_PREFIX) {
            let peers: Vec<NodeId> = ids
                .split(',')
                .filter(|id| !id.is_empty())
                .filter_map(|id| NodeId::from_base58(id).ok())
                .collect();
            return Some(TopicMsg::SyncList(peers));
        }
        None
    }

    /// Encodes a `join2:` announcement.
    pub(crate) fn encode_join(announcement: &JoinAnnouncement) -> crate::error::Result<Bytes> {
        let body = serde_json::to_string(announcement)?;
        Ok(Bytes::from(format!("{}{}", JOIN2_PREFIX, body)))
    }

    /// Encodes a `sync2:` full-list message.
    pub(crate) fn encode_member_list(
        members: &[MemberDigest],
    ) -> crate::error::Result<Bytes> {
        let body = serde_json::to_string(&MemberListMessage {
            members: members.to_vec(),
        })?;
        Ok(Bytes::from(format!("{}{}", SYNC2_PREFIX, body)))
    }

    /// Encodes a `req:sync` request.
    pub(crate) fn encode_req_sync() -> Bytes {
        Bytes::from_static(REQ_SYNC.as_bytes())
    }

    /// Encodes a `leave:` record.
    pub(crate) fn encode_leave(record_bytes: &[u8]) -> Bytes {
        let mut payload = LEAVE_PREFIX.to_vec();
        payload.extend_from_slice(record_bytes);
        Bytes::from(payload)
    }

    /// Encodes a delivery acknowledgement control frame.
    pub(crate) fn encode_ack(reply_bytes: &[u8]) -> Bytes {
        let mut payload = ACK_PREFIX.to_vec();
        payload.extend_from_slice(reply_bytes);
        Bytes::from(payload)
    }
}

fn strip<'a>(data: &'a [u8], prefix: &[u8]) -> Option<&'a [u8]> {
    data.strip_prefix(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use itertools::Itertools;
    use rand::rngs::OsRng;

    fn node_id() -> NodeId {
        let keypair = ed25519_dalek::Keypair::generate(&mut OsRng);
        NodeId::from_public_key(&keypair.public)
    }

    #[test]
    fn join2_roundtrip() -> eyre::Result<()> {
        let announcement = JoinAnnouncement {
            peer: node_id(),
            addrs: vec![Multiaddr::new("/ip4/203.0.113.5/tcp/4001")],
        };
        let encoded = TopicMsg::encode_join(&announcement)?;
        let parsed = TopicMsg::parse(&encoded);
        assert_matches!(parsed, Some(TopicMsg::Join2(got)) => {
            assert_eq!(got.peer, announcement.peer);
            assert_eq!(got.addrs, announcement.addrs);
        });
        Ok(())
    }

    #[test]
    fn bare_join_accepted() {
        let peer = node_id();
        let raw = format!("join:{}", peer);
        assert_matches!(TopicMsg::parse(raw.as_bytes()), Some(TopicMsg::Join(got)) => {
            assert_eq!(got, peer);
        });
    }

    #[test]
    fn compact_sync_id_list_accepted() {
        let peers = vec![node_id(), node_id(), node_id()];
        let raw = format!("sync:{}", peers.iter().map(|p| p.as_str()).join(","));
        assert_matches!(TopicMsg::parse(raw.as_bytes()), Some(TopicMsg::SyncList(got)) => {
            assert_eq!(got, peers);
        });
    }

    #[test]
    fn sync2_roundtrip() -> eyre::Result<()> {
        let members = vec![MemberDigest {
            peer: node_id(),
            addrs: vec![Multiaddr::new("/ip4/10.0.0.1/tcp/1")],
            last_seen: 5,
        }];
        let encoded = TopicMsg::encode_member_list(&members)?;
        assert_matches!(TopicMsg::parse(&encoded), Some(TopicMsg::SyncList2(got)) => {
            assert_eq!(got.len(), 1);
            assert_eq!(got[0].peer, members[0].peer);
        });
        Ok(())
    }

    #[test]
    fn req_sync_and_unknown_prefixes() {
        assert_matches!(TopicMsg::parse(b"req:sync"), Some(TopicMsg::ReqSync));
        assert!(TopicMsg::parse(b"mystery:payload").is_none());
        assert!(TopicMsg::parse(&[0xff, 0xfe]).is_none());
    }

    #[test]
    fn leave_and_ack_keep_raw_bytes() {
        let encoded = TopicMsg::encode_leave(&[1, 2, 3]);
        assert_matches!(TopicMsg::parse(&encoded), Some(TopicMsg::Leave(bytes)) => {
            assert_eq!(&bytes[..], &[1, 2, 3]);
        });
        let encoded = TopicMsg::encode_ack(&[9, 8]);
        assert_matches!(TopicMsg::parse(&encoded), Some(TopicMsg::Ack(bytes)) => {
            assert_eq!(&bytes[..], &[9, 8]);
        });
    }
}
