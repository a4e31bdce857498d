// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::error::{Error, Result};
use crate::types::{unix_now_secs, Multiaddr, NodeId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// URI scheme prefix for encoded tickets.
pub const TICKET_SCHEME: &str = "dep2p://";

/// Tickets older than this are rejected at decode time.
pub const TICKET_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

const MAX_HINT_LEN: usize = 500;
const FORBIDDEN_HINT_CHARS: [char; 8] = [';', '|', '&', '$', '`', '\n', '\r', '\\'];

/// An out-of-band connection ticket: a node id plus address hints, shareable as a
/// `dep2p://<base64>` string and accepted by [`crate::Realm::connect`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTicket {
    /// The node the ticket points at.
    pub node: NodeId,
    /// Addresses to try before falling back to resolution.
    pub address_hints: Vec<Multiaddr>,
    /// Unix seconds the ticket was issued.
    pub timestamp: u64,
}

impl ConnectionTicket {
    /// Issues a ticket for `node` with the given hints, stamped now.
    pub fn new(node: NodeId, address_hints: Vec<Multiaddr>) -> Self {
        Self {
            node,
            address_hints,
            timestamp: unix_now_secs(),
        }
    }

    /// Encodes as `dep2p://<base64>`.
    pub fn encode(&self) -> Result<String> {
        let bytes = bincode::serialize(self)?;
        Ok(format!("{}{}", TICKET_SCHEME, base64::encode(bytes)))
    }

    /// Decodes and validates a `dep2p://` ticket string.
    pub fn decode(input: &str) -> Result<Self> {
        let encoded = input
            .strip_prefix(TICKET_SCHEME)
            .ok_or_else(|| Error::MalformedTicket("missing dep2p:// scheme".to_string()))?;
        let bytes = base64::decode(encoded)
            .map_err(|err| Error::MalformedTicket(format!("invalid base64: {}", err)))?;
        let ticket: Self = bincode::deserialize(&bytes)
            .map_err(|err| Error::MalformedTicket(format!("invalid payload: {}", err)))?;
        ticket.validate()?;
        Ok(ticket)
    }

    fn validate(&self) -> Result<()> {
        // Re-parse the id so hand-crafted tickets cannot smuggle arbitrary bytes.
        let _ = NodeId::from_base58(self.node.as_str())?;

        let now = unix_now_secs();
        if now.saturating_sub(self.timestamp) > TICKET_MAX_AGE.as_secs() {
            return Err(Error::TicketExpired);
        }

        for hint in &self.address_hints {
            validate_hint(hint.as_str())?;
        }
        Ok(())
    }
}

/// Rejects address hints that are oversized or contain shell metacharacters. Tickets travel
/// through chat clients and shell command lines; a hint is never safe to assume well-formed.
pub(crate) fn validate_hint(hint: &str) -> Result<()> {
    if hint.len() > MAX_HINT_LEN {
        return Err(Error::MalformedMultiaddr(format!(
            "address hint exceeds {} chars",
            MAX_HINT_LEN
        )));
    }
    if hint.chars().any(|c| FORBIDDEN_HINT_CHARS.contains(&c)) {
        return Err(Error::MalformedMultiaddr(
            "address hint contains forbidden characters".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rand::rngs::OsRng;

    fn test_node_id() -> NodeId {
        let keypair = ed25519_dalek::Keypair::generate(&mut OsRng);
        NodeId::from_public_key(&keypair.public)
    }

    #[test]
    fn ticket_roundtrip_is_exact() -> eyre::Result<()> {
        let node = test_node_id();
        let hint = Multiaddr::new(format!("/ip4/203.0.113.5/tcp/4001/p2p/{}", node));
        let ticket = ConnectionTicket::new(node, vec![hint]);

        let decoded = ConnectionTicket::decode(&ticket.encode()?)?;
        assert_eq!(ticket, decoded);
        Ok(())
    }

    #[test]
    fn stale_ticket_rejected() -> eyre::Result<()> {
        let mut ticket = ConnectionTicket::new(test_node_id(), vec![]);
        ticket.timestamp = unix_now_secs() - 25 * 60 * 60;

        let encoded = ticket.encode()?;
        assert_matches!(ConnectionTicket::decode(&encoded), Err(Error::TicketExpired));
        Ok(())
    }

    #[test]
    fn shell_metacharacters_in_hints_rejected() -> eyre::Result<()> {
        for bad in [
            "/ip4/1.2.3.4/tcp/1;rm -rf /",
            "/ip4/1.2.3.4/tcp/1|cat",
            "/ip4/1.2.3.4/tcp/1&",
            "/ip4/1.2.3.4/tcp/1$HOME",
            "/ip4/1.2.3.4/tcp/1`id`",
            "/ip4/1.2.3.4/tcp/1\nls",
            "/ip4/1.2.3.4/tcp/1\\x",
        ] {
            let ticket = ConnectionTicket::new(test_node_id(), vec![Multiaddr::new(bad)]);
            let encoded = ticket.encode()?;
            assert_matches!(
                ConnectionTicket::decode(&encoded),
                Err(Error::MalformedMultiaddr(_)),
                "{}",
                bad
            );
        }
        Ok(())
    }

    #[test]
    fn oversized_hint_rejected() -> eyre::Result<()> {
        let long = format!("/ip4/1.2.3.4/tcp/{}", "9".repeat(501));
        let ticket = ConnectionTicket::new(test_node_id(), vec![Multiaddr::new(long)]);
        let encoded = ticket.encode()?;
        assert_matches!(
            ConnectionTicket::decode(&encoded),
            Err(Error::MalformedMultiaddr(_))
        );
        Ok(())
    }

    #[test]
    fn tampered_ticket_fails_validation() -> eyre::Result<()> {
        let ticket = ConnectionTicket::new(test_node_id(), vec![]);
        let encoded = ticket.encode()?;
        let raw = base64::decode(encoded.strip_prefix(TICKET_SCHEME).unwrap())?;

        let mut tampered = raw.clone();
        // Flip a byte inside the serialized node id.
        tampered[10] = 0;
        let reencoded = format!("{}{}", TICKET_SCHEME, base64::encode(tampered));
        assert!(ConnectionTicket::decode(&reencoded).is_err());
        Ok(())
    }
}
