// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::types::NodeId;
use std::io;
use thiserror::Error;

/// The type returned by Realm operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Internal error.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum Error {
    // ---- invalid input ----
    #[error("Realm id cannot be empty")]
    EmptyRealmId,
    #[error("Pre-shared key cannot be empty")]
    EmptyPsk,
    #[error("Malformed connection ticket: {0}")]
    MalformedTicket(String),
    #[error("Connection ticket expired (older than the accepted window)")]
    TicketExpired,
    #[error("Malformed multiaddr: {0}")]
    MalformedMultiaddr(String),
    #[error("Malformed node id: {0}")]
    MalformedNodeId(String),
    #[error("Unrecognised connect target: {0}")]
    UnrecognisedTarget(String),

    // ---- state ----
    #[error("Realm manager is not started")]
    ManagerNotStarted,
    #[error("Realm {0} is not started")]
    NotStarted(String),
    #[error("Realm {0} is already started")]
    AlreadyStarted(String),
    #[error("Realm {0} is closed")]
    Closed(String),
    #[error("Already joined realm {0}")]
    AlreadyJoined(String),
    #[error("This node is not in any realm")]
    NotInAnyRealm,
    #[error("Lifecycle phase cannot regress from {current} to {target}")]
    PhaseRegression { current: u8, target: u8 },

    // ---- auth ----
    #[error("Authentication failed for {0}: invalid proof")]
    InvalidProof(NodeId),
    #[error("Challenge timestamp outside the accepted clock-skew window")]
    ClockSkew,
    #[error("Challenge nonce was already used")]
    ReplayedNonce,
    #[error("Challenge names realm {got}, expected {expected}")]
    WrongRealm { expected: String, got: String },
    #[error("Peer {0} does not support the realm protocol yet")]
    ProtocolNotSupported(NodeId),
    #[error("Authentication with {0} was rejected: {1}")]
    AuthRejected(NodeId, String),
    #[error("Timed out waiting for {0} to complete realm authentication")]
    AuthWaitTimeout(NodeId),

    // ---- membership / gating ----
    #[error("Peer {0} is not a member of this realm")]
    NotAMember(NodeId),
    #[error("No route to peer {0}")]
    NoRoute(NodeId),
    #[error("No connected peers in the realm gossip mesh")]
    InsufficientPeers,

    // ---- delivery ----
    #[error("Delivery queue is full")]
    QueueFull,
    #[error("Message {0} exhausted its delivery attempts")]
    MaxRetriesReached(String),
    #[error("Timed out waiting for acknowledgements of message {0}")]
    AckTimeout(String),
    #[error("The acknowledgement layer is disabled")]
    AckDisabled,
    #[error("No critical peers were supplied for an acknowledged publish")]
    NoCriticalPeers,

    // ---- network ----
    #[error("Failed to connect to {0}")]
    ConnectFailed(NodeId),
    #[error("Failed to open a {1} stream to {0}")]
    StreamOpenFailed(NodeId, String),
    #[error("Stream read/write failed: {0}")]
    StreamIo(String),
    #[error("Hole punch to {0} failed")]
    HolePunchFailed(NodeId),
    #[error("Operation timed out: {0}")]
    Timeout(String),
    #[error("Frame of {0} bytes exceeds the 1 MiB wire limit")]
    FrameTooLarge(usize),

    // ---- codecs, crypto, storage ----
    #[error("Invalid wire payload: {0}")]
    InvalidPayload(String),
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Crypto error: {0}")]
    Crypto(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("JSON serialisation error: {0}")]
    JsonSerialisation(#[from] serde_json::Error),
    #[error("Protobuf decode error: {0}")]
    ProtobufDecode(#[from] prost::DecodeError),
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
}

impl Error {
    /// Whether this error came from a remote peer and should be damped (logged and retried where
    /// a schedule exists) rather than surfaced to user code.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            Error::InvalidProof(_)
                | Error::ClockSkew
                | Error::ReplayedNonce
                | Error::WrongRealm { .. }
                | Error::ProtocolNotSupported(_)
                | Error::AuthRejected(_, _)
                | Error::InsufficientPeers
                | Error::ConnectFailed(_)
                | Error::StreamOpenFailed(_, _)
                | Error::StreamIo(_)
                | Error::HolePunchFailed(_)
                | Error::InvalidPayload(_)
                | Error::InvalidSignature
        )
    }
}
