// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Ordered node lifecycle phases and the one-shot signals other components wait on.
//!
//! The coordinator is the sole cross-component synchronization primitive: components never share
//! mutexes, they wait for phase gates. Every signal, once completed, stays completed.

use crate::error::{Error, Result};
use std::sync::{
    atomic::{AtomicBool, AtomicU8, Ordering},
    Arc, Mutex, RwLock,
};
use tokio::sync::watch;

/// Ordered lifecycle phases of a node. Node-level phases run first; realm-level phases are gated
/// on them; shutdown phases invert the start order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Phase {
    /// Nothing started yet.
    Created = 0,
    /// Transport endpoint is listening.
    Transport = 1,
    /// Local identity loaded and announced.
    Identity = 2,
    /// NAT probing finished.
    NatProbe = 3,
    /// Relay client configured (or skipped).
    Relay = 4,
    /// DHT bootstrapped.
    DhtBootstrap = 5,
    /// Node-level services are all up.
    NodeReady = 6,
    /// Realm PSK auth service registered.
    PskAuth = 7,
    /// Realm member discovery running.
    MemberDiscovery = 8,
    /// Realm records published to the DHT.
    DhtPublish = 9,
    /// Fully operational.
    Active = 10,
    /// Shutdown: stop accepting work, announce departure.
    Drain = 11,
    /// Shutdown: realm and node services stopped.
    StopServices = 12,
    /// Shutdown: transport connections closed.
    CloseConnections = 13,
    /// Fully stopped.
    Stopped = 14,
}

impl Phase {
    const ALL: [Phase; 15] = [
        Phase::Created,
        Phase::Transport,
        Phase::Identity,
        Phase::NatProbe,
        Phase::Relay,
        Phase::DhtBootstrap,
        Phase::NodeReady,
        Phase::PskAuth,
        Phase::MemberDiscovery,
        Phase::DhtPublish,
        Phase::Active,
        Phase::Drain,
        Phase::StopServices,
        Phase::CloseConnections,
        Phase::Stopped,
    ];

    fn ordinal(self) -> u8 {
        self as u8
    }
}

/// A one-shot completion signal. Completing is idempotent; waiting after completion returns
/// immediately.
#[derive(Debug)]
pub(crate) struct Gate {
    tx: watch::Sender<bool>,
}

impl Gate {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub(crate) fn complete(&self) {
        let _ = self.tx.send(true);
    }

    pub(crate) fn is_complete(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

type PhaseCallback = Arc<dyn Fn(Phase, Phase) + Send + Sync>;

/// Tracks the current phase and owns the per-phase completion gates plus the address/NAT/relay
/// gates node infrastructure closes as it comes up.
pub struct LifecycleCoordinator {
    current: AtomicU8,
    advance_lock: Mutex<()>,
    gates: Vec<Gate>,
    address_ready: Gate,
    nat_type_ready: Gate,
    relay_connected: Gate,
    relay_configured: AtomicBool,
    callbacks: RwLock<Vec<PhaseCallback>>,
}

impl LifecycleCoordinator {
    /// A coordinator starting at [`Phase::Created`].
    pub fn new() -> Self {
        Self {
            current: AtomicU8::new(Phase::Created.ordinal()),
            advance_lock: Mutex::new(()),
            gates: Phase::ALL.iter().map(|_| Gate::new()).collect(),
            address_ready: Gate::new(),
            nat_type_ready: Gate::new(),
            relay_connected: Gate::new(),
            relay_configured: AtomicBool::new(false),
            callbacks: RwLock::new(Vec::new()),
        }
    }

    /// The current phase.
    pub fn current(&self) -> Phase {
        let ordinal = self.current.load(Ordering::SeqCst);
        Phase::ALL[ordinal as usize]
    }

    /// Advances to `target`, completing every phase gate in `[current, target]`. Equal target is
    /// a no-op; a lower target is an error. Phase-change callbacks run asynchronously.
    pub fn advance_to(&self, target: Phase) -> Result<()> {
        let _guard = self
            .advance_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let from = self.current();
        if target < from {
            return Err(Error::PhaseRegression {
                current: from.ordinal(),
                target: target.ordinal(),
            });
        }
        if target == from {
            return Ok(());
        }

        for ordinal in from.ordinal()..=target.ordinal() {
            let gate = &self.gates[ordinal as usize];
            if !gate.is_complete() {
                gate.complete();
            }
        }
        self.current.store(target.ordinal(), Ordering::SeqCst);
        trace!("lifecycle advanced {:?} -> {:?}", from, target);

        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect();
        if !callbacks.is_empty() {
            let _ = tokio::spawn(async move {
                for callback in callbacks {
                    callback(from, target);
                }
            });
        }
        Ok(())
    }

    /// Fires the gate for `phase` without moving `current`. Idempotent. Used to mark sub-task
    /// completion (e.g. the PSK auth service being registered) ahead of a later advance.
    pub fn complete(&self, phase: Phase) {
        self.gates[phase.ordinal() as usize].complete();
    }

    /// Whether the gate for `phase` has fired.
    pub fn is_complete(&self, phase: Phase) -> bool {
        self.gates[phase.ordinal() as usize].is_complete()
    }

    /// Waits until the gate for `phase` fires. Callers bound this with their own timeout.
    pub async fn wait_for(&self, phase: Phase) {
        self.gates[phase.ordinal() as usize].wait().await
    }

    /// Registers a callback invoked (asynchronously) after every advance.
    pub fn on_phase_change(&self, callback: impl Fn(Phase, Phase) + Send + Sync + 'static) {
        self.callbacks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::new(callback));
    }

    /// Marks the local shareable address set as known. Idempotent.
    pub fn set_address_ready(&self) {
        self.address_ready.complete();
    }

    /// Waits for the address gate.
    pub async fn wait_address_ready(&self) {
        self.address_ready.wait().await
    }

    /// Marks NAT type diagnosis as finished. Idempotent.
    pub fn set_nat_type_ready(&self) {
        self.nat_type_ready.complete();
    }

    /// Waits for the NAT type gate.
    pub async fn wait_nat_type_ready(&self) {
        self.nat_type_ready.wait().await
    }

    /// Declares that a relay is part of this node's configuration, so
    /// [`Self::wait_relay_connected`] must actually wait.
    pub fn set_relay_configured(&self) {
        self.relay_configured.store(true, Ordering::SeqCst);
    }

    /// Marks the configured relay as connected. Idempotent.
    pub fn set_relay_connected(&self) {
        self.relay_connected.complete();
    }

    /// Waits for the relay gate; returns immediately when no relay was configured.
    pub async fn wait_relay_connected(&self) {
        if !self.relay_configured.load(Ordering::SeqCst) {
            return;
        }
        self.relay_connected.wait().await
    }
}

impl Default for LifecycleCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LifecycleCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleCoordinator")
            .field("current", &self.current())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;

    #[tokio::test]
    async fn advance_completes_every_gate_up_to_target() -> eyre::Result<()> {
        let coordinator = LifecycleCoordinator::new();
        coordinator.advance_to(Phase::NodeReady)?;

        for phase in [
            Phase::Created,
            Phase::Transport,
            Phase::NatProbe,
            Phase::NodeReady,
        ] {
            assert!(coordinator.is_complete(phase), "{:?}", phase);
        }
        assert!(!coordinator.is_complete(Phase::PskAuth));
        assert_eq!(coordinator.current(), Phase::NodeReady);
        Ok(())
    }

    #[tokio::test]
    async fn advance_to_lower_phase_fails() -> eyre::Result<()> {
        let coordinator = LifecycleCoordinator::new();
        coordinator.advance_to(Phase::Active)?;
        assert_matches!(
            coordinator.advance_to(Phase::Transport),
            Err(Error::PhaseRegression { .. })
        );
        // Equal target is a no-op, not an error.
        coordinator.advance_to(Phase::Active)?;
        Ok(())
    }

    #[tokio::test]
    async fn complete_marks_gate_without_moving_current() {
        let coordinator = LifecycleCoordinator::new();
        coordinator.complete(Phase::PskAuth);
        coordinator.complete(Phase::PskAuth);
        assert!(coordinator.is_complete(Phase::PskAuth));
        assert_eq!(coordinator.current(), Phase::Created);
    }

    #[tokio::test]
    async fn wait_for_returns_once_completed() -> eyre::Result<()> {
        let coordinator = Arc::new(LifecycleCoordinator::new());
        let waiter = coordinator.clone();
        let handle = tokio::spawn(async move { waiter.wait_for(Phase::PskAuth).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        coordinator.complete(Phase::PskAuth);
        tokio::time::timeout(Duration::from_secs(1), handle).await??;
        Ok(())
    }

    #[tokio::test]
    async fn relay_gate_is_skipped_when_not_configured() {
        let coordinator = LifecycleCoordinator::new();
        // Returns immediately; would hang otherwise.
        tokio::time::timeout(Duration::from_millis(50), coordinator.wait_relay_connected())
            .await
            .expect("no relay configured, wait must not block");
    }

    #[tokio::test]
    async fn relay_gate_waits_when_configured() {
        let coordinator = Arc::new(LifecycleCoordinator::new());
        coordinator.set_relay_configured();

        let pending = tokio::time::timeout(
            Duration::from_millis(50),
            coordinator.wait_relay_connected(),
        )
        .await;
        assert!(pending.is_err(), "gate must still be open");

        coordinator.set_relay_connected();
        tokio::time::timeout(Duration::from_millis(50), coordinator.wait_relay_connected())
            .await
            .expect("gate closed, wait must return");
    }

    #[tokio::test]
    async fn idempotent_auxiliary_gates() {
        let coordinator = LifecycleCoordinator::new();
        coordinator.set_address_ready();
        coordinator.set_address_ready();
        coordinator.set_nat_type_ready();
        coordinator.set_nat_type_ready();
        tokio::time::timeout(Duration::from_millis(50), async {
            coordinator.wait_address_ready().await;
            coordinator.wait_nat_type_ready().await;
        })
        .await
        .expect("both gates closed");
    }
}
