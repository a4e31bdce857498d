// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Damping of connect/disconnect churn.
//!
//! A peer that oscillates quickly between connected and disconnected would otherwise storm the
//! member map and the gossip topic with status flips. Once a peer crosses the transition
//! threshold inside the rolling window it is marked flapping, and status changes for it are
//! suppressed until the recovery time has passed.

use crate::types::NodeId;
use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::{Duration, Instant},
};

#[derive(Debug, Default)]
struct PeerStability {
    transitions: VecDeque<Instant>,
    flapping_since: Option<Instant>,
}

/// Per-peer rolling window of state transitions.
pub struct StabilityTracker {
    peers: Mutex<HashMap<NodeId, PeerStability>>,
    window: Duration,
    threshold: usize,
    recovery: Duration,
}

impl StabilityTracker {
    /// A tracker with the given window, transition threshold and recovery time.
    pub fn new(window: Duration, threshold: usize, recovery: Duration) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            window,
            threshold,
            recovery,
        }
    }

    /// Records one connect or disconnect transition for `peer`. Returns whether this transition
    /// crossed the flapping threshold.
    pub fn record_transition(&self, peer: &NodeId) -> bool {
        let mut peers = self
            .peers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = peers.entry(peer.clone()).or_default();

        let now = Instant::now();
        entry.transitions.push_back(now);
        while let Some(oldest) = entry.transitions.front() {
            if now.duration_since(*oldest) > self.window {
                let _ = entry.transitions.pop_front();
            } else {
                break;
            }
        }

        if entry.transitions.len() >= self.threshold {
            let newly_flapping = entry.flapping_since.is_none();
            entry.flapping_since = Some(now);
            if newly_flapping {
                info!("peer {} is flapping, damping state changes", peer);
            }
            return newly_flapping;
        }
        false
    }

    /// Whether `peer` is currently marked flapping.
    pub fn is_flapping(&self, peer: &NodeId) -> bool {
        self.should_suppress_state_change(peer)
    }

    /// Whether a member online/offline change for `peer` should be swallowed right now.
    pub fn should_suppress_state_change(&self, peer: &NodeId) -> bool {
        let mut peers = self
            .peers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match peers.get_mut(peer) {
            Some(entry) => match entry.flapping_since {
                Some(since) if since.elapsed() < self.recovery => true,
                Some(_) => {
                    // Recovered; forget the flap.
                    entry.flapping_since = None;
                    entry.transitions.clear();
                    false
                }
                None => false,
            },
            None => false,
        }
    }

    /// Drops tracking state for `peer` (e.g. after it left the realm).
    pub fn forget(&self, peer: &NodeId) {
        let _ = self
            .peers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(peer);
    }
}

impl std::fmt::Debug for StabilityTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StabilityTracker")
            .field("window", &self.window)
            .field("threshold", &self.threshold)
            .field("recovery", &self.recovery)
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
    fn third_transition_in_window_marks_flapping() {
        let tracker = StabilityTracker::new(Duration::from_secs(60), 3, Duration::from_secs(300));
        let peer = node_id();

        assert!(!tracker.record_transition(&peer));
        assert!(!tracker.record_transition(&peer));
        assert!(!tracker.should_suppress_state_change(&peer));

        assert!(tracker.record_transition(&peer));
        assert!(tracker.should_suppress_state_change(&peer));

        // Further transitions keep it flapping but are not a fresh crossing.
        assert!(!tracker.record_transition(&peer));
    }

    #[test]
    fn suppression_expires_after_recovery() {
        let tracker =
            StabilityTracker::new(Duration::from_secs(60), 3, Duration::from_millis(30));
        let peer = node_id();
        for _ in 0..3 {
            let _ = tracker.record_transition(&peer);
        }
        assert!(tracker.should_suppress_state_change(&peer));

        std::thread::sleep(Duration::from_millis(40));
        assert!(!tracker.should_suppress_state_change(&peer));
        // State is reset; a single new transition does not re-flag.
        assert!(!tracker.record_transition(&peer));
        assert!(!tracker.should_suppress_state_change(&peer));
    }

    #[test]
    fn stable_peers_are_never_suppressed() {
        let tracker = StabilityTracker::new(Duration::from_secs(60), 3, Duration::from_secs(300));
        let peer = node_id();
        assert!(!tracker.should_suppress_state_change(&peer));
        let _ = tracker.record_transition(&peer);
        assert!(!tracker.should_suppress_state_change(&peer));
    }
}
