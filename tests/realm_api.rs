// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Public-API smoke tests over the in-memory network. Run with `--features test-utils`.

#![cfg(feature = "test-utils")]

use dep2p_realm::test_utils::TestNet;
use dep2p_realm::{Error, RealmManager, RealmOpts};
use eyre::eyre;
use std::time::Duration;

const PSK: &[u8] = b"integration-psk-integration-psk!";

#[tokio::test(flavor = "multi_thread")]
async fn join_connect_and_leave_through_the_public_api() -> eyre::Result<()> {
    let net = TestNet::new();
    let alpha = net.node();
    let beta = net.node();

    let manager_alpha = RealmManager::new(alpha.context());
    let manager_beta = RealmManager::new(beta.context());

    let realm_alpha = manager_alpha
        .join_with_opts(
            "workspace",
            PSK,
            RealmOpts {
                name: Some("the workspace".to_string()),
                config: None,
            },
        )
        .await?;
    let realm_beta = manager_beta.join("workspace", PSK).await?;

    assert_eq!(realm_alpha.name(), "the workspace");
    assert_eq!(manager_alpha.current().map(|r| r.id().clone()), Some(realm_alpha.id().clone()));

    net.connect(&alpha, &beta);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while tokio::time::Instant::now() < deadline {
        if realm_alpha.is_member(&beta.id) && realm_beta.is_member(&alpha.id) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    if !(realm_alpha.is_member(&beta.id) && realm_beta.is_member(&alpha.id)) {
        return Err(eyre!("realms did not converge"));
    }

    let stats = realm_alpha.stats();
    assert_eq!(stats.members.total, 2);

    manager_beta.leave().await?;
    assert!(manager_beta.current().is_none());
    assert!(matches!(manager_beta.leave().await, Err(Error::NotInAnyRealm)));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if !realm_alpha.is_member(&beta.id) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(!realm_alpha.is_member(&beta.id), "leave must propagate");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn reliable_publisher_queues_until_the_mesh_forms() -> eyre::Result<()> {
    let net = TestNet::new();
    let solo = net.node();
    let manager = RealmManager::new(solo.context());
    let realm = manager.join("lonely", PSK).await?;

    // Nobody else subscribes yet, so the publish lands in the retry queue.
    let messaging = realm.messaging()?;
    let _ = messaging.publish(bytes::Bytes::from_static(b"app:hello")).await?;
    assert!(realm.stats().queued_messages >= 1);
    Ok(())
}
