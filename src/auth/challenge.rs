// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The four-step challenge-response driven over one auth stream.
//!
//! 1. initiator -> responder: who I am, which realm, my clock
//! 2. responder -> initiator: a fresh nonce (after validating realm and clock)
//! 3. initiator -> responder: HMAC proof over the nonce
//! 4. responder -> initiator: verdict
//!
//! Either peer of an encounter can run either side; role negotiation upstream ensures a single
//! initiator per encounter.

use super::PskAuthenticator;
use crate::error::{Error, Result};
use crate::network::FramedStream;
use crate::types::{unix_now_secs, NodeId, RealmId};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

/// Nonce width for challenges.
pub(crate) const NONCE_LEN: usize = 32;

#[derive(Serialize, Deserialize, Debug)]
struct AuthRequest {
    peer: NodeId,
    realm: String,
    timestamp: u64,
}

#[derive(Serialize, Deserialize, Debug)]
struct AuthChallenge {
    nonce: [u8; NONCE_LEN],
    timestamp: u64,
}

#[derive(Serialize, Deserialize, Debug)]
struct AuthProof {
    proof: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug)]
struct AuthVerdict {
    ok: bool,
    error: Option<VerdictError>,
}

/// Distinct failure signals carried in the fourth message.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
enum VerdictError {
    ClockSkew,
    WrongRealm,
    InvalidProof,
    ReplayedNonce,
}

impl VerdictError {
    fn into_error(self, peer: NodeId) -> Error {
        match self {
            VerdictError::ClockSkew => Error::ClockSkew,
            VerdictError::WrongRealm => Error::AuthRejected(peer, "wrong realm".to_string()),
            VerdictError::InvalidProof => Error::InvalidProof(peer),
            VerdictError::ReplayedNonce => Error::ReplayedNonce,
        }
    }
}

/// Drives both sides of the challenge-response for one realm.
pub(crate) struct ChallengeHandler {
    authenticator: PskAuthenticator,
    realm: RealmId,
    local: NodeId,
    validity: Duration,
    io_timeout: Duration,
    // Nonces that already authenticated someone, kept for the validity window to refuse replays.
    consumed_nonces: Mutex<HashMap<[u8; NONCE_LEN], Instant>>,
}

impl ChallengeHandler {
    pub(crate) fn new(
        authenticator: PskAuthenticator,
        realm: RealmId,
        local: NodeId,
        validity: Duration,
        io_timeout: Duration,
    ) -> Self {
        Self {
            authenticator,
            realm,
            local,
            validity,
            io_timeout,
            consumed_nonces: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn mode(&self) -> super::AuthMode {
        self.authenticator.mode()
    }

    fn within_validity(&self, timestamp: u64) -> bool {
        let now = unix_now_secs();
        let skew = now.max(timestamp) - now.min(timestamp);
        skew <= self.validity.as_secs()
    }

    fn consume_nonce(&self, nonce: [u8; NONCE_LEN]) -> bool {
        let mut consumed = self
            .consumed_nonces
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let window = self.validity * 2;
        consumed.retain(|_, at| at.elapsed() <= window);
        consumed.insert(nonce, Instant::now()).is_none()
    }

    /// Runs the initiator side. Returns once the responder confirmed the proof.
    pub(crate) async fn run_initiator(&self, stream: &mut FramedStream) -> Result<()> {
        let request = AuthRequest {
            peer: self.local.clone(),
            realm: self.realm.as_str().to_string(),
            timestamp: unix_now_secs(),
        };
        stream
            .write_frame_timeout(&bincode::serialize(&request)?, self.io_timeout)
            .await?;

        let challenge: AuthChallenge =
            bincode::deserialize(&stream.read_frame_timeout(self.io_timeout).await?)
                .map_err(|err| Error::InvalidPayload(format!("auth challenge: {}", err)))?;

        let proof =
            self.authenticator
                .generate_proof(&challenge.nonce, challenge.timestamp, &self.local)?;
        stream
            .write_frame_timeout(&bincode::serialize(&AuthProof { proof })?, self.io_timeout)
            .await?;

        let verdict: AuthVerdict =
            bincode::deserialize(&stream.read_frame_timeout(self.io_timeout).await?)
                .map_err(|err| Error::InvalidPayload(format!("auth verdict: {}", err)))?;
        if verdict.ok {
            return Ok(());
        }
        Err(verdict
            .error
            .map(|kind| kind.into_error(self.local.clone()))
            .unwrap_or_else(|| {
                Error::AuthRejected(self.local.clone(), "unspecified".to_string())
            }))
    }

    /// Runs the responder side. Returns the authenticated peer id.
    pub(crate) async fn run_responder(&self, stream: &mut FramedStream) -> Result<NodeId> {
        let request: AuthRequest =
            bincode::deserialize(&stream.read_frame_timeout(self.io_timeout).await?)
                .map_err(|err| Error::InvalidPayload(format!("auth request: {}", err)))?;

        if request.realm != self.realm.as_str() {
            self.send_verdict(stream, VerdictError::WrongRealm).await?;
            return Err(Error::WrongRealm {
                expected: self.realm.as_str().to_string(),
                got: request.realm,
            });
        }
        if !self.within_validity(request.timestamp) {
            self.send_verdict(stream, VerdictError::ClockSkew).await?;
            return Err(Error::ClockSkew);
        }

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let timestamp = unix_now_secs();
        stream
            .write_frame_timeout(
                &bincode::serialize(&AuthChallenge { nonce, timestamp })?,
                self.io_timeout,
            )
            .await?;

        let proof: AuthProof =
            bincode::deserialize(&stream.read_frame_timeout(self.io_timeout).await?)
                .map_err(|err| Error::InvalidPayload(format!("auth proof: {}", err)))?;

        if !self
            .authenticator
            .verify_proof(&nonce, timestamp, &request.peer, &proof.proof)
        {
            self.send_verdict(stream, VerdictError::InvalidProof).await?;
            return Err(Error::InvalidProof(request.peer));
        }
        if !self.consume_nonce(nonce) {
            self.send_verdict(stream, VerdictError::ReplayedNonce).await?;
            return Err(Error::ReplayedNonce);
        }

        stream
            .write_frame_timeout(
                &bincode::serialize(&AuthVerdict {
                    ok: true,
                    error: None,
                })?,
                self.io_timeout,
            )
            .await?;
        Ok(request.peer)
    }

    async fn send_verdict(&self, stream: &mut FramedStream, error: VerdictError) -> Result<()> {
        stream
            .write_frame_timeout(
                &bincode::serialize(&AuthVerdict {
                    ok: false,
                    error: Some(error),
                })?,
                self.io_timeout,
            )
            .await
    }
}

impl std::fmt::Debug for ChallengeHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeHandler")
            .field("realm", &self.realm)
            .field("local", &self.local)
            .finish()
    }
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

    fn handler(psk: &[u8], realm: &str, local: NodeId) -> ChallengeHandler {
        let realm = RealmId::new(realm).expect("valid realm id");
        let authenticator = PskAuthenticator::new(psk, &realm).expect("authenticator");
        ChallengeHandler::new(
            authenticator,
            realm,
            local,
            Duration::from_secs(30),
            Duration::from_secs(5),
        )
    }

    fn framed_pair() -> (FramedStream, FramedStream) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (FramedStream::new(Box::new(a)), FramedStream::new(Box::new(b)))
    }

    #[tokio::test]
    async fn matched_psk_authenticates_in_four_messages() -> eyre::Result<()> {
        let initiator_id = node_id();
        let initiator = handler(b"s3cret", "r", initiator_id.clone());
        let responder = handler(b"s3cret", "r", node_id());
        let (mut init_stream, mut resp_stream) = framed_pair();

        let (init_result, resp_result) = tokio::join!(
            initiator.run_initiator(&mut init_stream),
            responder.run_responder(&mut resp_stream),
        );

        init_result?;
        assert_eq!(resp_result?, initiator_id);
        Ok(())
    }

    #[tokio::test]
    async fn mismatched_psk_fails_with_invalid_proof() -> eyre::Result<()> {
        let initiator = handler(b"s3cret", "r", node_id());
        let responder = handler(b"different", "r", node_id());
        let (mut init_stream, mut resp_stream) = framed_pair();

        let (init_result, resp_result) = tokio::join!(
            initiator.run_initiator(&mut init_stream),
            responder.run_responder(&mut resp_stream),
        );

        assert_matches!(init_result, Err(Error::InvalidProof(_)));
        assert_matches!(resp_result, Err(Error::InvalidProof(_)));
        Ok(())
    }

    #[tokio::test]
    async fn wrong_realm_in_request_is_rejected() -> eyre::Result<()> {
        let initiator = handler(b"s3cret", "other", node_id());
        let responder = handler(b"s3cret", "r", node_id());
        let (mut init_stream, mut resp_stream) = framed_pair();

        let (init_result, resp_result) = tokio::join!(
            initiator.run_initiator(&mut init_stream),
            responder.run_responder(&mut resp_stream),
        );

        assert_matches!(init_result, Err(Error::AuthRejected(_, _)));
        assert_matches!(resp_result, Err(Error::WrongRealm { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn skewed_clock_is_rejected() -> eyre::Result<()> {
        let responder = handler(b"s3cret", "r", node_id());
        let (mut init_stream, mut resp_stream) = framed_pair();

        let responder_task = responder.run_responder(&mut resp_stream);
        let initiator_task = async {
            let request = AuthRequest {
                peer: node_id(),
                realm: "r".to_string(),
                timestamp: unix_now_secs() - 120,
            };
            init_stream
                .write_frame(&bincode::serialize(&request)?)
                .await?;
            let verdict: AuthVerdict = bincode::deserialize(&init_stream.read_frame().await?)?;
            Ok::<_, eyre::Error>(verdict)
        };

        let (resp_result, verdict) = tokio::join!(responder_task, initiator_task);
        assert_matches!(resp_result, Err(Error::ClockSkew));
        let verdict = verdict?;
        assert!(!verdict.ok);
        assert_eq!(verdict.error, Some(VerdictError::ClockSkew));
        Ok(())
    }
}
