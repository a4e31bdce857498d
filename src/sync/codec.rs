// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Binary codec of the member sync protocol.
//!
//! The layout is fixed for cross-implementation compatibility: a 1-byte type tag, then the body
//! with big-endian sizes and length-prefixed strings throughout.

use crate::error::{Error, Result};
use crate::types::{MemberInfo, MemberRole, Multiaddr, NodeId, RealmId};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

/// Type tag of a sync request.
pub(crate) const TAG_REQUEST: u8 = 0x01;
/// Type tag of a sync response.
pub(crate) const TAG_RESPONSE: u8 = 0x02;

/// Initiator's opening message: its realm and membership version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SyncRequest {
    pub(crate) realm: String,
    pub(crate) version: u64,
}

/// Responder's answer: its version plus the member delta.
///
/// The encoder currently always sends the full member list as `added` and leaves `removed`
/// empty (departures travel as signed leave records instead), but the layout reserves the
/// removed list and the decoder honours it from newer peers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SyncResponse {
    pub(crate) version: u64,
    pub(crate) added: Vec<MemberInfo>,
    pub(crate) removed: Vec<NodeId>,
}

pub(crate) fn encode_request(request: &SyncRequest) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(TAG_REQUEST);
    put_string(&mut buf, &request.realm);
    buf.put_u64(request.version);
    buf.freeze()
}

pub(crate) fn decode_request(mut buf: &[u8]) -> Result<SyncRequest> {
    expect_tag(&mut buf, TAG_REQUEST)?;
    let realm = get_string(&mut buf)?;
    let version = get_u64(&mut buf)?;
    Ok(SyncRequest { realm, version })
}

pub(crate) fn encode_response(response: &SyncResponse) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    buf.put_u8(TAG_RESPONSE);
    buf.put_u64(response.version);

    let added_count = u16::try_from(response.added.len())
        .map_err(|_| Error::InvalidPayload("too many added members".to_string()))?;
    buf.put_u16(added_count);
    for member in &response.added {
        put_string(&mut buf, member.peer.as_str());
        put_string(&mut buf, member.realm.as_str());
        buf.put_u8(member.role.to_wire());
        buf.put_u8(u8::from(member.online));

        let addr_count = u16::try_from(member.addrs.len())
            .map_err(|_| Error::InvalidPayload("too many addrs".to_string()))?;
        buf.put_u16(addr_count);
        for addr in &member.addrs {
            put_string(&mut buf, addr.as_str());
        }

        let meta_count = u16::try_from(member.metadata.len())
            .map_err(|_| Error::InvalidPayload("too many metadata entries".to_string()))?;
        buf.put_u16(meta_count);
        for (key, value) in &member.metadata {
            put_string(&mut buf, key);
            put_string(&mut buf, value);
        }
    }

    let removed_count = u16::try_from(response.removed.len())
        .map_err(|_| Error::InvalidPayload("too many removed members".to_string()))?;
    buf.put_u16(removed_count);
    for peer in &response.removed {
        put_string(&mut buf, peer.as_str());
    }
    Ok(buf.freeze())
}

pub(crate) fn decode_response(mut buf: &[u8]) -> Result<SyncResponse> {
    expect_tag(&mut buf, TAG_RESPONSE)?;
    let version = get_u64(&mut buf)?;

    let added_count = get_u16(&mut buf)?;
    let mut added = Vec::with_capacity(usize::from(added_count));
    for _ in 0..added_count {
        let peer = NodeId::from_base58(&get_string(&mut buf)?)?;
        let realm = RealmId::new(get_string(&mut buf)?)?;
        let role = MemberRole::from_wire(get_u8(&mut buf)?);
        let online = get_u8(&mut buf)? == 1;

        let addr_count = get_u16(&mut buf)?;
        let mut addrs = Vec::with_capacity(usize::from(addr_count));
        for _ in 0..addr_count {
            addrs.push(Multiaddr::new(get_string(&mut buf)?));
        }

        let meta_count = get_u16(&mut buf)?;
        let mut metadata = BTreeMap::new();
        for _ in 0..meta_count {
            let key = get_string(&mut buf)?;
            let value = get_string(&mut buf)?;
            let _ = metadata.insert(key, value);
        }

        let mut info = MemberInfo::joined(peer, realm, addrs);
        info.role = role;
        info.online = online;
        info.metadata = metadata;
        added.push(info);
    }

    let removed_count = get_u16(&mut buf)?;
    let mut removed = Vec::with_capacity(usize::from(removed_count));
    for _ in 0..removed_count {
        removed.push(NodeId::from_base58(&get_string(&mut buf)?)?);
    }

    Ok(SyncResponse {
        version,
        added,
        removed,
    })
}

fn put_string(buf: &mut BytesMut, value: &str) {
    // Strings longer than u16::MAX never occur in practice: node ids, realm ids and addrs are
    // all bounded well below it.
    let len = value.len().min(usize::from(u16::MAX));
    buf.put_u16(len as u16);
    buf.put_slice(&value.as_bytes()[..len]);
}

fn expect_tag(buf: &mut &[u8], expected: u8) -> Result<()> {
    let tag = get_u8(buf)?;
    if tag != expected {
        return Err(Error::InvalidPayload(format!(
            "unexpected sync message tag {:#04x}",
            tag
        )));
    }
    Ok(())
}

fn get_u8(buf: &mut &[u8]) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(truncated());
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut &[u8]) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(truncated());
    }
    Ok(buf.get_u16())
}

fn get_u64(buf: &mut &[u8]) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(truncated());
    }
    Ok(buf.get_u64())
}

fn get_string(buf: &mut &[u8]) -> Result<String> {
    let len = usize::from(get_u16(buf)?);
    if buf.remaining() < len {
        return Err(truncated());
    }
    let bytes = buf[..len].to_vec();
    buf.advance(len);
    String::from_utf8(bytes).map_err(|_| Error::InvalidPayload("non-utf8 string".to_string()))
}

fn truncated() -> Error {
    Error::InvalidPayload("truncated sync message".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rand::rngs::OsRng;

    fn node_id() -> NodeId {
        let keypair = ed25519_dalek::Keypair::generate(&mut OsRng);
        NodeId::from_public_key(&keypair.public)
    }

    fn sample_member(online: bool) -> MemberInfo {
        let realm = RealmId::new("r").expect("realm id");
        let mut info = MemberInfo::joined(
            node_id(),
            realm,
            vec![
                Multiaddr::new("/ip4/203.0.113.5/tcp/4001"),
                Multiaddr::new("/ip4/192.168.1.5/tcp/4001"),
            ],
        );
        info.online = online;
        let _ = info.metadata.insert("zone".to_string(), "eu".to_string());
        let _ = info.metadata.insert("ver".to_string(), "0.9".to_string());
        info
    }

    #[test]
    fn request_roundtrip() -> eyre::Result<()> {
        let request = SyncRequest {
            realm: "my-realm".to_string(),
            version: 42,
        };
        let decoded = decode_request(&encode_request(&request))?;
        assert_eq!(request, decoded);
        Ok(())
    }

    #[test]
    fn response_roundtrip_is_identity() -> eyre::Result<()> {
        let response = SyncResponse {
            version: 977,
            added: vec![sample_member(true), sample_member(false)],
            removed: vec![node_id(), node_id()],
        };
        let decoded = decode_response(&encode_response(&response)?)?;

        assert_eq!(decoded.version, response.version);
        assert_eq!(decoded.removed, response.removed);
        assert_eq!(decoded.added.len(), response.added.len());
        for (decoded, original) in decoded.added.iter().zip(&response.added) {
            assert_eq!(decoded.peer, original.peer);
            assert_eq!(decoded.realm, original.realm);
            assert_eq!(decoded.role, original.role);
            assert_eq!(decoded.online, original.online);
            assert_eq!(decoded.addrs, original.addrs);
            assert_eq!(decoded.metadata, original.metadata);
        }
        Ok(())
    }

    #[test]
    fn wrong_tag_rejected() {
        let request = SyncRequest {
            realm: "r".to_string(),
            version: 1,
        };
        let encoded = encode_request(&request);
        assert_matches!(decode_response(&encoded), Err(Error::InvalidPayload(_)));
    }

    #[test]
    fn truncated_response_rejected() -> eyre::Result<()> {
        let response = SyncResponse {
            version: 7,
            added: vec![sample_member(true)],
            removed: vec![],
        };
        let encoded = encode_response(&response)?;
        for cut in [1, 5, encoded.len() / 2, encoded.len() - 1] {
            assert!(decode_response(&encoded[..cut]).is_err(), "cut at {}", cut);
        }
        Ok(())
    }

    #[test]
    fn sizes_are_big_endian_on_the_wire() {
        let request = SyncRequest {
            realm: "ab".to_string(),
            version: 1,
        };
        let encoded = encode_request(&request);
        // tag, u16 len of "ab" big-endian, the string, u64 version big-endian.
        assert_eq!(&encoded[..5], &[TAG_REQUEST, 0x00, 0x02, b'a', b'b']);
        assert_eq!(&encoded[5..], &[0, 0, 0, 0, 0, 0, 0, 1]);
    }
}
