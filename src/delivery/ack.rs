// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Acknowledgement framing and the pending-ack table.
//!
//! Every delivery-layer payload is framed as `[u16 ack_req_len][ack_req][payload]`; a zero
//! length means no acknowledgement was requested. Replies are routed back as `ack2:` control
//! payloads on the same topic.

use crate::error::{Error, Result};
use crate::types::NodeId;
use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Notify;

/// Acknowledgement request attached ahead of a critical payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct AckRequest {
    /// Id the ackers echo back.
    pub(crate) message_id: String,
    /// Who to acknowledge to.
    pub(crate) reply_to: NodeId,
    /// Whether every required peer must confirm (`true`) or any one of them (`false`).
    pub(crate) require_all: bool,
    /// The peers whose confirmation counts.
    pub(crate) required: Vec<NodeId>,
}

/// An acknowledgement reply.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct AckReply {
    /// The confirmed message.
    pub(crate) message_id: String,
    /// The acknowledging peer.
    pub(crate) from: NodeId,
}

/// Frame codec helpers.
pub(crate) struct AckFrame;

impl AckFrame {
    /// Frames a payload without an acknowledgement request.
    pub(crate) fn plain(payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + payload.len());
        buf.put_u16(0);
        buf.put_slice(payload);
        buf.freeze()
    }

    /// Frames a payload with an acknowledgement request.
    pub(crate) fn with_request(request: &AckRequest, payload: &[u8]) -> Result<Bytes> {
        let request_bytes = bincode::serialize(request)?;
        let len = u16::try_from(request_bytes.len())
            .map_err(|_| Error::InvalidPayload("oversized ack request".to_string()))?;
        let mut buf = BytesMut::with_capacity(2 + request_bytes.len() + payload.len());
        buf.put_u16(len);
        buf.put_slice(&request_bytes);
        buf.put_slice(payload);
        Ok(buf.freeze())
    }

    /// Splits a frame into its optional request and the payload.
    pub(crate) fn split(data: &[u8]) -> Result<(Option<AckRequest>, Bytes)> {
        if data.len() < 2 {
            return Err(Error::InvalidPayload("short delivery frame".to_string()));
        }
        let len = usize::from(u16::from_be_bytes([data[0], data[1]]));
        let rest = &data[2..];
        if rest.len() < len {
            return Err(Error::InvalidPayload("truncated ack request".to_string()));
        }
        if len == 0 {
            return Ok((None, Bytes::copy_from_slice(rest)));
        }
        let request: AckRequest = bincode::deserialize(&rest[..len])
            .map_err(|err| Error::InvalidPayload(format!("ack request: {}", err)))?;
        Ok((Some(request), Bytes::copy_from_slice(&rest[len..])))
    }
}

pub(crate) struct PendingAck {
    required: BTreeSet<NodeId>,
    acked: BTreeSet<NodeId>,
    require_all: bool,
    notify: Arc<Notify>,
}

impl PendingAck {
    fn satisfied(&self) -> bool {
        if self.require_all {
            self.acked.is_superset(&self.required)
        } else {
            !self.acked.is_empty()
        }
    }
}

/// Waiter handle returned when registering a pending acknowledgement.
pub(crate) struct AckWaiter {
    notify: Arc<Notify>,
}

impl AckWaiter {
    pub(crate) async fn wait(&self) {
        self.notify.notified().await
    }
}

/// Concurrent table of in-flight acknowledged publishes.
#[derive(Default)]
pub(crate) struct PendingAckMap {
    inner: DashMap<String, PendingAck>,
}

impl PendingAckMap {
    /// Registers a pending entry and returns its waiter.
    pub(crate) fn insert(&self, request: &AckRequest) -> AckWaiter {
        let notify = Arc::new(Notify::new());
        let _ = self.inner.insert(
            request.message_id.clone(),
            PendingAck {
                required: request.required.iter().cloned().collect(),
                acked: BTreeSet::new(),
                require_all: request.require_all,
                notify: notify.clone(),
            },
        );
        AckWaiter { notify }
    }

    /// Records a reply. Replies from peers outside the required set are dropped: the required
    /// set defines the contract, stray confirmations do not complete an any-mode wait.
    pub(crate) fn record(&self, reply: &AckReply) {
        if let Some(mut pending) = self.inner.get_mut(&reply.message_id) {
            if !pending.required.contains(&reply.from) {
                trace!(
                    "ignoring ack for {} from non-required {}",
                    reply.message_id,
                    reply.from
                );
                return;
            }
            let _ = pending.acked.insert(reply.from.clone());
            if pending.satisfied() {
                // notify_one stores a permit, so a waiter that polls later still completes.
                pending.notify.notify_one();
            }
        }
    }

    /// Removes the entry, returning who acknowledged.
    pub(crate) fn finish(&self, message_id: &str) -> Vec<NodeId> {
        self.inner
            .remove(message_id)
            .map(|(_, pending)| pending.acked.into_iter().collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn pending_ids(&self) -> Vec<String> {
        self.inner.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl std::fmt::Debug for PendingAckMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingAckMap")
            .field("pending", &self.inner.len())
            .finish()
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
    fn plain_frame_roundtrip() -> eyre::Result<()> {
        let framed = AckFrame::plain(b"join:abc");
        let (request, payload) = AckFrame::split(&framed)?;
        assert!(request.is_none());
        assert_eq!(&payload[..], b"join:abc");
        Ok(())
    }

    #[test]
    fn request_frame_roundtrip() -> eyre::Result<()> {
        let request = AckRequest {
            message_id: "m1".to_string(),
            reply_to: node_id(),
            require_all: true,
            required: vec![node_id(), node_id()],
        };
        let framed = AckFrame::with_request(&request, b"payload")?;
        let (decoded, payload) = AckFrame::split(&framed)?;
        let decoded = decoded.expect("request expected");
        assert_eq!(decoded.message_id, request.message_id);
        assert_eq!(decoded.required, request.required);
        assert_eq!(&payload[..], b"payload");
        Ok(())
    }

    #[test]
    fn malformed_frames_rejected() {
        assert!(AckFrame::split(&[]).is_err());
        assert!(AckFrame::split(&[0]).is_err());
        // Claims a 10-byte request but carries none.
        assert!(AckFrame::split(&[0, 10, 1, 2]).is_err());
    }

    #[tokio::test]
    async fn all_mode_requires_every_acker() {
        let map = PendingAckMap::default();
        let (a, b) = (node_id(), node_id());
        let request = AckRequest {
            message_id: "m".to_string(),
            reply_to: node_id(),
            require_all: true,
            required: vec![a.clone(), b.clone()],
        };
        let waiter = map.insert(&request);

        map.record(&AckReply {
            message_id: "m".to_string(),
            from: a,
        });
        let pending = tokio::time::timeout(std::time::Duration::from_millis(20), waiter.wait())
            .await;
        assert!(pending.is_err(), "one of two ackers must not complete");

        map.record(&AckReply {
            message_id: "m".to_string(),
            from: b,
        });
        tokio::time::timeout(std::time::Duration::from_millis(100), waiter.wait())
            .await
            .expect("all ackers confirmed");
        assert_eq!(map.finish("m").len(), 2);
    }

    #[tokio::test]
    async fn stray_acker_does_not_complete_any_mode() {
        let map = PendingAckMap::default();
        let required = node_id();
        let request = AckRequest {
            message_id: "m".to_string(),
            reply_to: node_id(),
            require_all: false,
            required: vec![required.clone()],
        };
        let waiter = map.insert(&request);

        map.record(&AckReply {
            message_id: "m".to_string(),
            from: node_id(), // not in the required set
        });
        let pending = tokio::time::timeout(std::time::Duration::from_millis(20), waiter.wait())
            .await;
        assert!(pending.is_err());

        map.record(&AckReply {
            message_id: "m".to_string(),
            from: required,
        });
        tokio::time::timeout(std::time::Duration::from_millis(100), waiter.wait())
            .await
            .expect("required acker confirmed");
    }
}
