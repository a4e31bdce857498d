// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display, Formatter},
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

/// A textual multiaddr, e.g. `/ip4/203.0.113.5/tcp/4001/p2p/<id>`.
///
/// The transport owns full multiaddr semantics; the Realm core only needs the IP component (for
/// reachability classification) and the trailing `/p2p/` peer id.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Multiaddr(String);

impl Multiaddr {
    /// Wraps an address string.
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    /// The address as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Extracts the IP component of an `/ip4/` or `/ip6/` multiaddr.
    pub fn ip(&self) -> Option<IpAddr> {
        let mut segments = self.0.split('/').filter(|s| !s.is_empty());
        while let Some(segment) = segments.next() {
            match segment {
                "ip4" => return segments.next()?.parse::<Ipv4Addr>().ok().map(IpAddr::V4),
                "ip6" => return segments.next()?.parse::<Ipv6Addr>().ok().map(IpAddr::V6),
                _ => {
                    // Skip this protocol's value, if any.
                    continue;
                }
            }
        }
        None
    }

    /// Extracts the `/p2p/<id>` suffix, if present and well-formed.
    pub fn peer_id(&self) -> Option<NodeId> {
        let mut segments = self.0.split('/').filter(|s| !s.is_empty());
        while let Some(segment) = segments.next() {
            if segment == "p2p" {
                return NodeId::from_base58(segments.next()?).ok();
            }
        }
        None
    }

    /// Whether the address is private. Unparseable inputs classify as private.
    pub fn is_private(&self) -> bool {
        match self.ip() {
            Some(ip) => is_private_ip(&ip),
            None => true,
        }
    }
}

impl Display for Multiaddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Multiaddr {
    fn from(addr: &str) -> Self {
        Self::new(addr)
    }
}

/// Whether any of the addresses classifies as public.
pub(crate) fn any_public(addrs: &[Multiaddr]) -> bool {
    addrs.iter().any(|addr| !addr.is_private())
}

/// Private-range classification used to decide reachability.
pub(crate) fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_link_local()
                || v4.is_private()
                || in_v4_block(v4, [100, 64, 0, 0], 10) // CGNAT
                || in_v4_block(v4, [224, 0, 0, 0], 24) // link-local multicast
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                // fe80::/10 link-local unicast
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                // ff02::/16 and friends: link-local multicast scope
                || (v6.segments()[0] & 0xff0f) == 0xff02
                // fc00::/7 unique local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}

fn in_v4_block(ip: &Ipv4Addr, base: [u8; 4], prefix_len: u32) -> bool {
    let ip = u32::from_be_bytes(ip.octets());
    let base = u32::from_be_bytes(base);
    let mask = u32::MAX << (32 - prefix_len);
    (ip & mask) == (base & mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn private(addr: &str) -> bool {
        Multiaddr::new(addr).is_private()
    }

    #[test]
    fn private_ranges_classify_as_private() {
        for ip in [
            "10.0.0.5",
            "172.16.1.1",
            "192.168.1.1",
            "169.254.0.1",
            "100.64.0.1",
            "127.0.0.1",
        ] {
            assert!(private(&format!("/ip4/{}/tcp/4001", ip)), "{}", ip);
        }
        for ip in ["fc00::1", "fe80::1", "::1"] {
            assert!(private(&format!("/ip6/{}/tcp/4001", ip)), "{}", ip);
        }
    }

    #[test]
    fn public_ranges_classify_as_public() {
        for ip in ["8.8.8.8", "1.1.1.1"] {
            assert!(!private(&format!("/ip4/{}/tcp/4001", ip)), "{}", ip);
        }
        for ip in ["2001:db8::1", "2606:4700:4700::1111"] {
            assert!(!private(&format!("/ip6/{}/tcp/4001", ip)), "{}", ip);
        }
    }

    #[test]
    fn unparseable_classifies_as_private() {
        assert!(private("/dns4/example.com/tcp/4001"));
        assert!(private("nonsense"));
        assert!(private("/ip4/not-an-ip/tcp/4001"));
    }

    #[test]
    fn extracts_trailing_peer_id() {
        let addr = Multiaddr::new("/ip4/203.0.113.5/tcp/4001/p2p/3vQB7B6MrGQZaxCuFg4oh");
        let peer = addr.peer_id().expect("peer id expected");
        assert_eq!(peer.as_str(), "3vQB7B6MrGQZaxCuFg4oh");
        assert!(Multiaddr::new("/ip4/203.0.113.5/tcp/4001").peer_id().is_none());
    }
}
