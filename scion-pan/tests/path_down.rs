// Copyright 2025 Anapaya Systems
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Propagation of path down notifications to the connections using the path.

use std::time::{Duration, SystemTime};

use scion_pan::{
    address::ScionAddr,
    config::PathSubsystemConfig,
    conn::{
        dial::DialedConn,
        scmp::{ScmpMessage, ScmpNotification},
    },
    path::PathFingerprint,
    subsystem::PathSubsystem,
};
use test_log::test;

mod common;
use common::*;

async fn wait_for_path(conn: &DialedConn, expected: &PathFingerprint) {
    while conn.path().map(|p| p.fingerprint.clone()).as_ref() != Some(expected) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[test(tokio::test)]
#[ntest::timeout(10_000)]
async fn should_fail_over_all_connections_sharing_a_down_interface() -> anyhow::Result<()> {
    // Only the first path traverses the transit AS reporting the interface down.
    let paths = vec![path(&[1, 2, 3, 4]), path(&[5, 6])];
    let querier = StaticQuerier::new(remote_ia(), paths.clone());
    let subsystem = PathSubsystem::new(PathSubsystemConfig::default(), querier.clone())
        .map_err(anyhow::Error::msg)?;

    let raw_a = TestRawConn::new(addr(local_ia(), "10.0.0.2", 5000));
    let raw_b = TestRawConn::new(addr(local_ia(), "10.0.0.2", 5001));
    let remote = addr(remote_ia(), "10.1.0.2", 6000);
    let conn_a = subsystem.dial_udp(raw_a.clone(), remote, None, None).await?;
    let conn_b = subsystem.dial_udp(raw_b.clone(), remote, None, None).await?;
    assert_eq!(conn_a.path().unwrap().fingerprint, paths[0].fingerprint);
    assert_eq!(conn_b.path().unwrap().fingerprint, paths[0].fingerprint);

    // The message travels back along the reverse of the path the packet was sent on.
    let transit = ia("1-ff00:1:1");
    let notification = ScmpNotification {
        message: ScmpMessage::ExternalInterfaceDown {
            ia: transit,
            interface: 3,
        },
        source: ScionAddr::new(transit, "10.5.0.1".parse().unwrap()),
        path_interfaces: Some(vec![4, 3, 2, 1]),
    };
    subsystem.scmp_handler().handle(&notification, SystemTime::now())?;

    wait_for_path(&conn_a, &paths[1].fingerprint).await;
    wait_for_path(&conn_b, &paths[1].fingerprint).await;

    conn_a.write(b"a").await?;
    conn_b.write(b"b").await?;
    assert_eq!(raw_a.sent()[0].path, paths[1].forwarding_path);
    assert_eq!(raw_b.sent()[0].path, paths[1].forwarding_path);
    assert_eq!(querier.queries().len(), 1);
    Ok(())
}

#[test(tokio::test)]
#[ntest::timeout(10_000)]
async fn should_not_fail_over_closed_connections() -> anyhow::Result<()> {
    let paths = vec![path(&[1, 2]), path(&[5, 6])];
    let querier = StaticQuerier::new(remote_ia(), paths.clone());
    let subsystem = PathSubsystem::new(PathSubsystemConfig::default(), querier)
        .map_err(anyhow::Error::msg)?;
    let raw = TestRawConn::new(addr(local_ia(), "10.0.0.2", 5000));
    let remote = addr(remote_ia(), "10.1.0.2", 6000);
    let open = subsystem.dial_udp(raw.clone(), remote, None, None).await?;
    let closed = subsystem.dial_udp(raw.clone(), remote, None, None).await?;
    closed.close();

    let down = paths[0].interfaces()[0];
    subsystem
        .stats()
        .notify_path_down(paths[0].fingerprint.clone(), down, SystemTime::now());

    wait_for_path(&open, &paths[1].fingerprint).await;
    assert_eq!(closed.path().unwrap().fingerprint, paths[0].fingerprint);
    Ok(())
}
