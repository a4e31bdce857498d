// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Signed member-leave records and their replay defence.
//!
//! Leave records ride the gossip topic so departures are observed within a gossip hop rather
//! than waiting for liveness timeouts. A record is accepted once per (peer, realm, timestamp);
//! the replay cache remembers seen keys for twice the validity window.

use crate::error::{Error, Result};
use crate::types::{unix_now_nanos, LeaveReason, NodeId, RealmId};
use prost::Message;
use signature::{Signer, Verifier};
use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

/// Wire form of a leave record.
#[derive(Clone, PartialEq, Message)]
pub(crate) struct MemberLeave {
    /// The departing (or departed) member.
    #[prost(string, tag = "1")]
    pub(crate) peer_id: String,
    /// The realm being left.
    #[prost(string, tag = "2")]
    pub(crate) realm_id: String,
    /// [`LeaveReason`] wire value.
    #[prost(int32, tag = "3")]
    pub(crate) reason: i32,
    /// Unix nanoseconds the record was issued.
    #[prost(uint64, tag = "4")]
    pub(crate) timestamp_ns: u64,
    /// ed25519 signature over [`leave_sign_bytes`]; may be empty for witness reports.
    #[prost(bytes = "vec", tag = "5")]
    pub(crate) signature: Vec<u8>,
}

impl MemberLeave {
    /// Builds and signs a record with the local key.
    pub(crate) fn signed(
        keypair: &ed25519_dalek::Keypair,
        peer: &NodeId,
        realm: &RealmId,
        reason: LeaveReason,
    ) -> Self {
        let timestamp_ns = unix_now_nanos();
        let payload = leave_sign_bytes(peer, realm, reason, timestamp_ns);
        let signature = keypair.sign(&payload).to_bytes().to_vec();
        Self {
            peer_id: peer.as_str().to_string(),
            realm_id: realm.as_str().to_string(),
            reason: reason.to_wire(),
            timestamp_ns,
            signature,
        }
    }

    pub(crate) fn encode_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    pub(crate) fn decode_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(Self::decode(bytes)?)
    }
}

/// The byte string a leave record signs: peer id, realm id, reason as 4 big-endian bytes, then
/// the timestamp as 8 big-endian bytes.
pub(crate) fn leave_sign_bytes(
    peer: &NodeId,
    realm: &RealmId,
    reason: LeaveReason,
    timestamp_ns: u64,
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(peer.as_bytes().len() + realm.as_str().len() + 12);
    payload.extend_from_slice(peer.as_bytes());
    payload.extend_from_slice(realm.as_str().as_bytes());
    payload.extend_from_slice(&(reason.to_wire() as u32).to_be_bytes());
    payload.extend_from_slice(&timestamp_ns.to_be_bytes());
    payload
}

/// Outcome of validating an inbound record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ValidLeave {
    pub(crate) peer: NodeId,
    pub(crate) reason: LeaveReason,
}

/// Validates inbound leave records: realm match, timestamp window, replay cache, signature.
pub(crate) struct LeaveValidator {
    realm: RealmId,
    validity: Duration,
    future_skew: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl LeaveValidator {
    pub(crate) fn new(realm: RealmId, validity: Duration, future_skew: Duration) -> Self {
        Self {
            realm,
            validity,
            future_skew,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Validates `record`, verifying the signature with `public_key` when one is attached.
    pub(crate) fn validate(
        &self,
        record: &MemberLeave,
        public_key: Option<ed25519_dalek::PublicKey>,
    ) -> Result<ValidLeave> {
        let peer = NodeId::from_base58(&record.peer_id)?;
        if record.realm_id != self.realm.as_str() {
            return Err(Error::WrongRealm {
                expected: self.realm.as_str().to_string(),
                got: record.realm_id.clone(),
            });
        }
        let reason = LeaveReason::from_wire(record.reason)
            .ok_or_else(|| Error::InvalidPayload(format!("leave reason {}", record.reason)))?;

        let now = unix_now_nanos();
        if record.timestamp_ns > now + self.future_skew.as_nanos() as u64 {
            return Err(Error::ClockSkew);
        }
        if now.saturating_sub(record.timestamp_ns) > self.validity.as_nanos() as u64 {
            return Err(Error::InvalidPayload("stale leave record".to_string()));
        }

        // One acceptance per (peer, realm, timestamp).
        let replay_key = format!(
            "{}:{}:{}",
            record.peer_id, record.realm_id, record.timestamp_ns
        );
        {
            let mut seen = self
                .seen
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let gc_window = self.validity * 2;
            seen.retain(|_, at| at.elapsed() <= gc_window);
            if seen.insert(replay_key, Instant::now()).is_some() {
                return Err(Error::InvalidPayload("replayed leave record".to_string()));
            }
        }

        if !record.signature.is_empty() {
            let key = public_key.ok_or(Error::InvalidSignature)?;
            let signature = ed25519_dalek::Signature::from_bytes(&record.signature)
                .map_err(|_| Error::InvalidSignature)?;
            let payload = leave_sign_bytes(&peer, &self.realm, reason, record.timestamp_ns);
            key.verify(&payload, &signature)
                .map_err(|_| Error::InvalidSignature)?;
        }

        Ok(ValidLeave { peer, reason })
    }
}

impl std::fmt::Debug for LeaveValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaveValidator")
            .field("realm", &self.realm)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rand::rngs::OsRng;

    fn keypair() -> ed25519_dalek::Keypair {
        ed25519_dalek::Keypair::generate(&mut OsRng)
    }

    fn validator() -> LeaveValidator {
        LeaveValidator::new(
            RealmId::new("r").expect("realm id"),
            Duration::from_secs(30),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn signed_record_roundtrips_and_validates() -> eyre::Result<()> {
        let keys = keypair();
        let peer = NodeId::from_public_key(&keys.public);
        let realm = RealmId::new("r")?;
        let record = MemberLeave::signed(&keys, &peer, &realm, LeaveReason::Graceful);

        let decoded = MemberLeave::decode_bytes(&record.encode_bytes())?;
        assert_eq!(decoded, record);

        let valid = validator().validate(&decoded, Some(keys.public))?;
        assert_eq!(valid.peer, peer);
        assert_eq!(valid.reason, LeaveReason::Graceful);
        Ok(())
    }

    #[test]
    fn replayed_record_rejected() -> eyre::Result<()> {
        let keys = keypair();
        let peer = NodeId::from_public_key(&keys.public);
        let realm = RealmId::new("r")?;
        let record = MemberLeave::signed(&keys, &peer, &realm, LeaveReason::Graceful);

        let validator = validator();
        validator.validate(&record, Some(keys.public))?;
        assert_matches!(
            validator.validate(&record, Some(keys.public)),
            Err(Error::InvalidPayload(_))
        );
        Ok(())
    }

    #[test]
    fn forged_signature_rejected() -> eyre::Result<()> {
        let keys = keypair();
        let peer = NodeId::from_public_key(&keys.public);
        let realm = RealmId::new("r")?;
        let mut record = MemberLeave::signed(&keys, &peer, &realm, LeaveReason::Graceful);
        record.signature = vec![7u8; 64];

        assert_matches!(
            validator().validate(&record, Some(keys.public)),
            Err(Error::InvalidSignature)
        );
        Ok(())
    }

    #[test]
    fn wrong_realm_rejected() -> eyre::Result<()> {
        let keys = keypair();
        let peer = NodeId::from_public_key(&keys.public);
        let other = RealmId::new("other")?;
        let record = MemberLeave::signed(&keys, &peer, &other, LeaveReason::Graceful);

        assert_matches!(
            validator().validate(&record, Some(keys.public)),
            Err(Error::WrongRealm { .. })
        );
        Ok(())
    }

    #[test]
    fn stale_and_future_timestamps_rejected() -> eyre::Result<()> {
        let keys = keypair();
        let peer = NodeId::from_public_key(&keys.public);
        let realm = RealmId::new("r")?;

        let mut stale = MemberLeave::signed(&keys, &peer, &realm, LeaveReason::Graceful);
        stale.timestamp_ns = unix_now_nanos() - Duration::from_secs(60).as_nanos() as u64;
        stale.signature.clear();
        assert!(validator().validate(&stale, None).is_err());

        let mut future = MemberLeave::signed(&keys, &peer, &realm, LeaveReason::Graceful);
        future.timestamp_ns = unix_now_nanos() + Duration::from_secs(10).as_nanos() as u64;
        future.signature.clear();
        assert_matches!(validator().validate(&future, None), Err(Error::ClockSkew));
        Ok(())
    }

    #[test]
    fn unsigned_witness_record_accepted() -> eyre::Result<()> {
        let keys = keypair();
        let peer = NodeId::from_public_key(&keys.public);
        let realm = RealmId::new("r")?;
        let mut record = MemberLeave::signed(&keys, &peer, &realm, LeaveReason::Witness);
        record.signature.clear();

        let valid = validator().validate(&record, None)?;
        assert_eq!(valid.reason, LeaveReason::Witness);
        Ok(())
    }
}
