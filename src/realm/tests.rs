// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use super::*;
use crate::delivery::AckFrame;
use crate::init_test_logger;
use crate::network::MembershipEvent;
use crate::test_utils::{TestNet, TestNode};
use crate::types::{unix_now_secs, Reachability};
use eyre::eyre;
use std::time::Duration;

const PSK: &[u8] = b"SSSSSSSSSSSSSSSSSSSSSSSSSSSSSSSS";

async fn wait_until(
    what: &str,
    budget: Duration,
    mut condition: impl FnMut() -> bool,
) -> eyre::Result<()> {
    let deadline = tokio::time::Instant::now() + budget;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    Err(eyre!("timed out waiting for {}", what))
}

async fn joined_realm(node: &TestNode, realm_id: &str, psk: &[u8]) -> eyre::Result<Arc<Realm>> {
    let manager = RealmManager::new(node.context());
    Ok(manager.join(realm_id, psk).await?)
}

#[tokio::test(flavor = "multi_thread")]
async fn two_peers_with_matching_psk_converge() -> eyre::Result<()> {
    init_test_logger();
    let net = TestNet::new();
    let x = net.node();
    let y = net.node();

    let realm_x = joined_realm(&x, "r", PSK).await?;
    let realm_y = joined_realm(&y, "r", PSK).await?;

    net.connect(&x, &y);

    wait_until("both member lists to converge", Duration::from_secs(2), || {
        realm_x.is_member(&y.id) && realm_y.is_member(&x.id)
    })
    .await?;

    let x_view_of_y = realm_x.membership().get(&y.id).ok_or_else(|| eyre!("y missing"))?;
    assert!(x_view_of_y.online);
    let y_view_of_x = realm_y.membership().get(&x.id).ok_or_else(|| eyre!("x missing"))?;
    assert!(y_view_of_x.online);

    // Each side unicasts its capability announce to the fresh member shortly after auth.
    wait_until("capability caches to fill", Duration::from_secs(1), || {
        realm_x.capabilities().cached(&y.id).is_some()
            && realm_y.capabilities().cached(&x.id).is_some()
    })
    .await?;

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn mismatched_psk_never_grows_membership() -> eyre::Result<()> {
    init_test_logger();
    let net = TestNet::new();
    let x = net.node();
    let y = net.node();

    let realm_x = joined_realm(&x, "r", PSK).await?;
    let realm_y = joined_realm(&y, "r", b"TTTTTTTTTTTTTTTTTTTTTTTTTTTTTTTT").await?;

    net.connect(&x, &y);
    tokio::time::sleep(Duration::from_millis(1200)).await;

    assert_eq!(realm_x.members().len(), 1, "only the local node");
    assert_eq!(realm_y.members().len(), 1, "only the local node");
    assert!(!realm_x.is_member(&y.id));
    assert!(!realm_y.is_member(&x.id));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn graceful_leave_removes_and_blocks_resurrection() -> eyre::Result<()> {
    init_test_logger();
    let net = TestNet::new();
    let x = net.node();
    let y = net.node();

    let realm_x = joined_realm(&x, "r", PSK).await?;
    let realm_y = joined_realm(&y, "r", PSK).await?;
    net.connect(&x, &y);
    wait_until("convergence", Duration::from_secs(2), || {
        realm_x.is_member(&y.id) && realm_y.is_member(&x.id)
    })
    .await?;

    realm_x.stop().await?;

    wait_until("y to drop x", Duration::from_secs(2), || {
        !realm_y.is_member(&x.id)
    })
    .await?;
    assert!(realm_y.membership().has_gracefully_left(&x.id));

    // A stale join gossiped by a third party must not resurrect the departed member.
    let attacker = net.node();
    let topic = attacker
        .context()
        .pubsub
        .join(&RealmId::new("r")?.members_topic())
        .await?;
    let stale_join = TopicMsg::encode_join(&JoinAnnouncement {
        peer: x.id.clone(),
        addrs: vec![],
    })?;
    topic.publish(AckFrame::plain(&stale_join)).await?;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!realm_y.is_member(&x.id), "gossip must not resurrect a departed member");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn forged_leave_record_is_rejected() -> eyre::Result<()> {
    init_test_logger();
    let net = TestNet::new();
    let x = net.node();
    let y = net.node();

    let realm_x = joined_realm(&x, "r", PSK).await?;
    let realm_y = joined_realm(&y, "r", PSK).await?;
    net.connect(&x, &y);
    wait_until("convergence", Duration::from_secs(2), || {
        realm_x.is_member(&y.id) && realm_y.is_member(&x.id)
    })
    .await?;

    // A third party forges a graceful leave for y with garbage for a signature.
    let attacker = net.node();
    let topic = attacker
        .context()
        .pubsub
        .join(&RealmId::new("r")?.members_topic())
        .await?;
    let mut forged = MemberLeave::signed(
        &attacker.keypair,
        &y.id,
        &RealmId::new("r")?,
        LeaveReason::Graceful,
    );
    forged.signature = vec![0x42; 64];
    topic
        .publish(AckFrame::plain(&TopicMsg::encode_leave(&forged.encode_bytes())))
        .await?;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(realm_x.is_member(&y.id), "forged leave must be ignored");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn connection_ticket_joins_and_stale_ticket_rejects() -> eyre::Result<()> {
    init_test_logger();
    let net = TestNet::new();
    let x = net.node();
    let y = net.node();

    let realm_x = joined_realm(&x, "r", PSK).await?;
    let realm_y = joined_realm(&y, "r", PSK).await?;

    let ticket = realm_x.ticket()?;
    realm_y.connect(&ticket).await?;
    assert!(realm_y.is_member(&x.id));
    wait_until("x to learn y", Duration::from_secs(2), || {
        realm_x.is_member(&y.id)
    })
    .await?;

    // A ticket stamped 25 hours ago is rejected before any dialling happens.
    let mut stale = ConnectionTicket::new(x.id.clone(), vec![]);
    stale.timestamp = unix_now_secs() - 25 * 60 * 60;
    let err = realm_y.connect(&stale.encode()?).await;
    assert!(matches!(err, Err(Error::TicketExpired)));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn network_change_flips_capability_to_public() -> eyre::Result<()> {
    init_test_logger();
    let net = TestNet::new();
    let x = net.node();
    let y = net.node();

    let realm_x = joined_realm(&x, "r", PSK).await?;
    let realm_y = joined_realm(&y, "r", PSK).await?;
    net.connect(&x, &y);
    wait_until("convergence", Duration::from_secs(2), || {
        realm_x.is_member(&y.id) && realm_y.is_member(&x.id)
    })
    .await?;

    wait_until("initial private announce", Duration::from_secs(1), || {
        matches!(
            realm_y.capabilities().cached(&x.id),
            Some(announce) if announce.reachability == Reachability::Private
        )
    })
    .await?;

    x.change_addrs(vec![Multiaddr::new("/ip4/203.0.113.5/tcp/4001")]);

    wait_until("public announce to reach y", Duration::from_secs(2), || {
        matches!(
            realm_y.capabilities().cached(&x.id),
            Some(announce)
                if announce.reachability == Reachability::Public && announce.relay_capable
        )
    })
    .await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn flapping_peer_status_changes_are_damped() -> eyre::Result<()> {
    init_test_logger();
    let net = TestNet::new();
    let x = net.node();
    let y = net.node();

    let realm_x = joined_realm(&x, "r", PSK).await?;
    let realm_y = joined_realm(&y, "r", PSK).await?;
    net.connect(&x, &y);
    wait_until("convergence", Duration::from_secs(2), || {
        realm_x.is_member(&y.id) && realm_y.is_member(&x.id)
    })
    .await?;

    let mut membership_events = x.events.subscribe_membership();

    // Churn well past the flapping threshold.
    for _ in 0..3 {
        net.disconnect(&x, &y);
        tokio::time::sleep(Duration::from_millis(50)).await;
        net.connect(&x, &y);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(realm_x.liveness().is_flapping(&y.id));
    assert!(realm_x.is_member(&y.id), "flapping must not remove the member");

    let mut status_flips = 0;
    while let Ok(event) = membership_events.try_recv() {
        if matches!(event, MembershipEvent::StatusChanged { ref peer, .. } if peer == &y.id) {
            status_flips += 1;
        }
    }
    assert!(
        status_flips <= 1,
        "status storms must be damped, saw {} flips",
        status_flips
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_inputs_rejected_without_state_change() -> eyre::Result<()> {
    let net = TestNet::new();
    let node = net.node();
    let manager = RealmManager::new(node.context());

    assert!(matches!(manager.join("", PSK).await, Err(Error::EmptyRealmId)));
    assert!(matches!(manager.join("r", b"").await, Err(Error::EmptyPsk)));
    assert!(manager.list().is_empty());
    assert!(manager.current().is_none());

    // A valid join afterwards still works.
    let realm = manager.join("r", PSK).await?;
    assert_eq!(realm.members().len(), 1);
    assert!(matches!(
        manager.join("r", PSK).await,
        Err(Error::AlreadyJoined(_))
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn peer_without_realm_protocol_lands_in_pending_auth() -> eyre::Result<()> {
    init_test_logger();
    let net = TestNet::new();
    let x = net.node();
    // A plain node: connected at the transport level but with no realm handlers registered.
    // Keep its id lower so the realm node is the negotiated initiator and fails fast.
    let mut plain = net.node();
    while plain.id > x.id {
        plain = net.node();
    }

    let realm_x = joined_realm(&x, "r", PSK).await?;
    net.connect(&x, &plain);

    wait_until("pending auth entry", Duration::from_secs(1), || {
        realm_x
            .pending_auths
            .lock()
            .expect("pending lock")
            .contains_key(&plain.id)
    })
    .await?;
    assert!(!realm_x.is_member(&plain.id));

    // The retry loop fires the first due entry after ~2s and reschedules it.
    tokio::time::sleep(Duration::from_millis(3600)).await;
    let attempts = realm_x
        .pending_auths
        .lock()
        .expect("pending lock")
        .get(&plain.id)
        .map(|entry| entry.attempts);
    assert_eq!(attempts, Some(1), "first retry must have fired");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn discovery_converges_without_explicit_connect() -> eyre::Result<()> {
    init_test_logger();
    let net = TestNet::new();
    let x = net.node();
    let y = net.node();

    // No net.connect: the provider records published at join drive discovery.
    let realm_x = joined_realm(&x, "r", PSK).await?;
    let realm_y = joined_realm(&y, "r", PSK).await?;

    wait_until("dht discovery to converge", Duration::from_secs(8), || {
        realm_x.is_member(&y.id) && realm_y.is_member(&x.id)
    })
    .await?;
    Ok(())
}
