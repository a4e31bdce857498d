// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! PSK-derived mutual authentication.
//!
//! The pre-shared key itself never goes on the wire. Both sides hold an auth key derived from
//! (PSK, realm id); possession is proven with an HMAC over a nonce the verifier chose.

mod challenge;
mod handler;

pub(crate) use challenge::{ChallengeHandler, NONCE_LEN};
pub(crate) use handler::{AuthCallbacks, AuthHandler, MEMBER_EXCHANGE_CAP};

use crate::error::{Error, Result};
use crate::types::{NodeId, RealmId};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Domain separator mixed into auth key derivation.
const AUTH_KEY_CONTEXT: &[u8] = b"/dep2p/realm/auth/1.0.0";

/// How peers prove realm membership. Only PSK is implemented; the other modes reuse the same
/// wire protocol with a substituted verifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthMode {
    /// Pre-shared key possession proof.
    Psk,
    /// Certificate-based (reserved).
    Cert,
    /// Caller-supplied verifier (reserved).
    Custom,
}

/// Verifier and prover for one realm's PSK.
pub(crate) struct PskAuthenticator {
    auth_key: [u8; 32],
}

impl PskAuthenticator {
    /// Derives the auth key from `(psk, realm)`. Deterministic: two nodes with the same inputs
    /// hold the same key.
    pub(crate) fn new(psk: &[u8], realm: &RealmId) -> Result<Self> {
        if psk.is_empty() {
            return Err(Error::EmptyPsk);
        }
        let mut mac = HmacSha256::new_from_slice(psk)
            .map_err(|err| Error::Crypto(format!("auth key derivation: {}", err)))?;
        mac.update(AUTH_KEY_CONTEXT);
        mac.update(realm.as_str().as_bytes());
        let mut auth_key = [0u8; 32];
        auth_key.copy_from_slice(&mac.finalize().into_bytes());
        Ok(Self { auth_key })
    }

    pub(crate) fn mode(&self) -> AuthMode {
        AuthMode::Psk
    }

    /// Proof of auth-key possession bound to `(nonce, timestamp, prover)`.
    pub(crate) fn generate_proof(
        &self,
        nonce: &[u8; NONCE_LEN],
        timestamp: u64,
        prover: &NodeId,
    ) -> Result<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(&self.auth_key)
            .map_err(|err| Error::Crypto(format!("proof generation: {}", err)))?;
        mac.update(nonce);
        mac.update(&timestamp.to_be_bytes());
        mac.update(prover.as_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Verifies `proof` against the expected inputs, in constant time.
    pub(crate) fn verify_proof(
        &self,
        nonce: &[u8; NONCE_LEN],
        timestamp: u64,
        prover: &NodeId,
        proof: &[u8],
    ) -> bool {
        let mut mac = match HmacSha256::new_from_slice(&self.auth_key) {
            Ok(mac) => mac,
            Err(_) => return false,
        };
        mac.update(nonce);
        mac.update(&timestamp.to_be_bytes());
        mac.update(prover.as_bytes());
        mac.verify_slice(proof).is_ok()
    }
}

impl std::fmt::Debug for PskAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("PskAuthenticator").finish()
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

    #[test]
    fn key_derivation_is_deterministic_per_realm() -> eyre::Result<()> {
        let realm_a = RealmId::new("a")?;
        let realm_b = RealmId::new("b")?;
        let one = PskAuthenticator::new(b"secret", &realm_a)?;
        let two = PskAuthenticator::new(b"secret", &realm_a)?;
        let other_realm = PskAuthenticator::new(b"secret", &realm_b)?;

        assert_eq!(one.auth_key, two.auth_key);
        assert_ne!(one.auth_key, other_realm.auth_key);
        Ok(())
    }

    #[test]
    fn proof_verifies_only_with_matching_inputs() -> eyre::Result<()> {
        let realm = RealmId::new("r")?;
        let auth = PskAuthenticator::new(b"secret", &realm)?;
        let wrong_psk = PskAuthenticator::new(b"other", &realm)?;
        let prover = node_id();
        let nonce = [7u8; NONCE_LEN];

        let proof = auth.generate_proof(&nonce, 1_000, &prover)?;
        assert!(auth.verify_proof(&nonce, 1_000, &prover, &proof));
        assert!(!auth.verify_proof(&nonce, 1_001, &prover, &proof));
        assert!(!auth.verify_proof(&[8u8; NONCE_LEN], 1_000, &prover, &proof));
        assert!(!auth.verify_proof(&nonce, 1_000, &node_id(), &proof));
        assert!(!wrong_psk.verify_proof(&nonce, 1_000, &prover, &proof));
        Ok(())
    }

    #[test]
    fn empty_psk_rejected() {
        let realm = RealmId::new("r").expect("valid realm id");
        assert!(PskAuthenticator::new(b"", &realm).is_err());
    }
}
