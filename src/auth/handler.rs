// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Wire-layer driver of the auth protocol, plus the post-auth member-list exchange.
//!
//! Exchanging compact member lists over the auth stream right after the challenge succeeds cuts
//! convergence from the gossip/DHT cycle down to a single extra round trip, without introducing
//! a new protocol.

use super::ChallengeHandler;
use crate::error::{Error, Result};
use crate::network::{FramedStream, Host, StreamHandler};
use crate::types::{MemberDigest, NodeId, RealmId};
use std::{sync::Arc, time::Duration};

/// Both sides cap the member exchange at this many entries.
pub(crate) const MEMBER_EXCHANGE_CAP: usize = 500;

/// Literal prefix of the member-exchange payload inside its frame.
const MEMBER_EXCHANGE_PREFIX: &[u8] = b"members:";

/// Callbacks wiring the handler back into the realm without a direct reference cycle.
#[derive(Clone)]
pub(crate) struct AuthCallbacks {
    /// Invoked once a peer proved PSK possession (either direction).
    pub(crate) on_success: Arc<dyn Fn(NodeId) + Send + Sync>,
    /// Invoked when an auth attempt failed.
    pub(crate) on_failure: Arc<dyn Fn(NodeId, &Error) + Send + Sync>,
    /// Supplies the local compact member list for the exchange.
    pub(crate) member_list: Arc<dyn Fn() -> Vec<MemberDigest> + Send + Sync>,
    /// Merges a remote compact member list into local state.
    pub(crate) merge_members: Arc<dyn Fn(Vec<MemberDigest>) + Send + Sync>,
}

impl std::fmt::Debug for AuthCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthCallbacks").finish()
    }
}

/// Owns the realm-scoped auth stream handler.
pub(crate) struct AuthHandler {
    host: Arc<dyn Host>,
    realm: RealmId,
    challenge: Arc<ChallengeHandler>,
    callbacks: AuthCallbacks,
    attempt_timeout: Duration,
    exchange_timeout: Duration,
}

impl AuthHandler {
    pub(crate) fn new(
        host: Arc<dyn Host>,
        realm: RealmId,
        challenge: Arc<ChallengeHandler>,
        callbacks: AuthCallbacks,
        attempt_timeout: Duration,
        exchange_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            host,
            realm,
            challenge,
            callbacks,
            attempt_timeout,
            exchange_timeout,
        })
    }

    /// Registers the inbound stream handler.
    pub(crate) fn start(self: &Arc<Self>) {
        let handler = self.clone();
        let stream_handler: StreamHandler = Arc::new(move |peer, stream| {
            let handler = handler.clone();
            Box::pin(async move {
                handler.handle_inbound(peer, stream).await;
            })
        });
        self.host
            .set_stream_handler(self.realm.auth_protocol(), stream_handler);
    }

    /// Removes the inbound stream handler.
    pub(crate) fn stop(&self) {
        self.host.remove_stream_handler(&self.realm.auth_protocol());
    }

    /// The verifier mode behind this handler.
    pub(crate) fn mode(&self) -> crate::auth::AuthMode {
        self.challenge.mode()
    }

    /// Server side of a new auth stream.
    async fn handle_inbound(self: Arc<Self>, from: NodeId, stream: crate::network::StreamBox) {
        let mut framed = FramedStream::new(stream);
        let outcome = tokio::time::timeout(
            self.attempt_timeout,
            self.challenge.run_responder(&mut framed),
        )
        .await
        .unwrap_or_else(|_| Err(Error::Timeout("auth responder".to_string())));

        let peer = match outcome {
            Ok(peer) => peer,
            Err(err) => {
                debug!("inbound auth from {} failed: {}", from, err);
                (self.callbacks.on_failure)(from, &err);
                return;
            }
        };

        trace!("inbound auth from {} succeeded in realm {}", peer, self.realm);
        (self.callbacks.on_success)(peer.clone());

        // Member exchange, responder side: receive first, then send.
        if let Err(err) = self.exchange_as_responder(&mut framed).await {
            debug!("member exchange with {} failed: {}", peer, err);
        }
    }

    /// Client side: open the stream, prove possession, exchange member lists.
    pub(crate) async fn authenticate(&self, peer: &NodeId) -> Result<()> {
        let stream = self
            .host
            .open_stream(peer, &self.realm.auth_protocol())
            .await?;
        let mut framed = FramedStream::new(stream);

        let outcome = tokio::time::timeout(
            self.attempt_timeout,
            self.challenge.run_initiator(&mut framed),
        )
        .await
        .unwrap_or_else(|_| Err(Error::Timeout("auth initiator".to_string())));

        if let Err(err) = outcome {
            (self.callbacks.on_failure)(peer.clone(), &err);
            return Err(err);
        }

        trace!("outbound auth to {} succeeded in realm {}", peer, self.realm);
        (self.callbacks.on_success)(peer.clone());

        // Member exchange, initiator side: send first, then receive.
        if let Err(err) = self.exchange_as_initiator(&mut framed).await {
            debug!("member exchange with {} failed: {}", peer, err);
        }
        Ok(())
    }

    async fn exchange_as_initiator(&self, stream: &mut FramedStream) -> Result<()> {
        self.send_member_list(stream).await?;
        self.receive_member_list(stream).await
    }

    async fn exchange_as_responder(&self, stream: &mut FramedStream) -> Result<()> {
        self.receive_member_list(stream).await?;
        self.send_member_list(stream).await
    }

    async fn send_member_list(&self, stream: &mut FramedStream) -> Result<()> {
        let mut list = (self.callbacks.member_list)();
        list.truncate(MEMBER_EXCHANGE_CAP);

        let mut payload = MEMBER_EXCHANGE_PREFIX.to_vec();
        payload.extend_from_slice(&serde_json::to_vec(&list)?);
        stream
            .write_frame_timeout(&payload, self.exchange_timeout)
            .await
    }

    async fn receive_member_list(&self, stream: &mut FramedStream) -> Result<()> {
        let frame = stream.read_frame_timeout(self.exchange_timeout).await?;
        let body = frame
            .strip_prefix(MEMBER_EXCHANGE_PREFIX)
            .ok_or_else(|| Error::InvalidPayload("member exchange prefix".to_string()))?;
        let mut list: Vec<MemberDigest> = serde_json::from_slice(body)?;
        list.truncate(MEMBER_EXCHANGE_CAP);
        (self.callbacks.merge_members)(list);
        Ok(())
    }
}

impl std::fmt::Debug for AuthHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthHandler").field("realm", &self.realm).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::PskAuthenticator;
    use crate::types::Multiaddr;
    use std::sync::Mutex;

    fn digests(n: usize) -> Vec<MemberDigest> {
        (0..n)
            .map(|i| MemberDigest {
                peer: NodeId::from_base58(&format!("2{}", "q".repeat(8))).unwrap_or_else(|_| {
                    panic!("static test id")
                }),
                addrs: vec![Multiaddr::new(format!("/ip4/10.0.0.{}/tcp/4001", i % 250))],
                last_seen: i as u64,
            })
            .collect()
    }

    fn test_handler(list: Vec<MemberDigest>) -> (Arc<AuthHandler>, Arc<Mutex<Vec<MemberDigest>>>) {
        let realm = RealmId::new("r").expect("realm id");
        let keypair = ed25519_dalek::Keypair::generate(&mut rand::rngs::OsRng);
        let local = NodeId::from_public_key(&keypair.public);
        let challenge = Arc::new(ChallengeHandler::new(
            PskAuthenticator::new(b"k", &realm).expect("authenticator"),
            realm.clone(),
            local,
            Duration::from_secs(30),
            Duration::from_secs(5),
        ));
        let merged = Arc::new(Mutex::new(Vec::new()));
        let merged_in_cb = merged.clone();
        let callbacks = AuthCallbacks {
            on_success: Arc::new(|_: NodeId| {}),
            on_failure: Arc::new(|_: NodeId, _: &Error| {}),
            member_list: Arc::new(move || list.clone()),
            merge_members: Arc::new(move |incoming| {
                merged_in_cb
                    .lock()
                    .expect("merged lock")
                    .extend(incoming);
            }),
        };
        let host = crate::test_utils::disconnected_host();
        (
            AuthHandler::new(
                host,
                realm,
                challenge,
                callbacks,
                Duration::from_secs(30),
                Duration::from_secs(5),
            ),
            merged,
        )
    }

    #[tokio::test]
    async fn member_exchange_truncates_to_cap_both_ways() -> eyre::Result<()> {
        let (sender, _) = test_handler(digests(MEMBER_EXCHANGE_CAP + 50));
        let (receiver, merged) = test_handler(Vec::new());

        let (a, b) = tokio::io::duplex(4 * 1024 * 1024);
        let mut initiator = FramedStream::new(Box::new(a));
        let mut responder = FramedStream::new(Box::new(b));

        let (send_res, recv_res) = tokio::join!(
            sender.send_member_list(&mut initiator),
            receiver.receive_member_list(&mut responder),
        );
        send_res?;
        recv_res?;

        assert_eq!(merged.lock().expect("merged lock").len(), MEMBER_EXCHANGE_CAP);
        Ok(())
    }

    #[tokio::test]
    async fn exchange_rejects_payload_without_prefix() -> eyre::Result<()> {
        let (receiver, merged) = test_handler(Vec::new());

        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut writer = FramedStream::new(Box::new(a));
        let mut responder = FramedStream::new(Box::new(b));

        let (_, recv_res) = tokio::join!(
            writer.write_frame(b"[]"),
            receiver.receive_member_list(&mut responder),
        );
        assert!(recv_res.is_err());
        assert!(merged.lock().expect("merged lock").is_empty());
        Ok(())
    }
}
