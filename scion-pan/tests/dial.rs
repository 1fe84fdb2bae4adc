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

//! End-to-end tests of dialed and listening connections over the path subsystem.

use std::sync::Arc;

use scion_pan::{
    config::PathSubsystemConfig,
    conn::{ConnError, NetAddr},
    policy::Pinned,
    subsystem::PathSubsystem,
};
use test_log::test;

mod common;
use common::*;

#[test(tokio::test)]
#[ntest::timeout(10_000)]
async fn should_query_once_and_send_over_selected_path() -> anyhow::Result<()> {
    let paths = vec![path(&[1, 2]), path(&[3, 4, 5, 6])];
    let querier = StaticQuerier::new(remote_ia(), paths.clone());
    let subsystem = PathSubsystem::new(PathSubsystemConfig::default(), querier.clone())
        .map_err(anyhow::Error::msg)?;
    let raw = TestRawConn::new(addr(local_ia(), "10.0.0.2", 5000));
    let remote = addr(remote_ia(), "10.1.0.2", 6000);

    let conn = subsystem.dial_udp(raw.clone(), remote, None, None).await?;
    conn.write(b"first").await?;
    conn.write(b"second").await?;

    assert_eq!(querier.queries(), vec![remote_ia()]);
    let sent = raw.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].path, paths[0].forwarding_path);
    assert_eq!(sent[0].destination, remote);
    assert_eq!(sent[0].payload, b"first");
    Ok(())
}

#[test(tokio::test)]
#[ntest::timeout(10_000)]
async fn should_apply_policy_and_policy_changes() -> anyhow::Result<()> {
    let paths = vec![path(&[1, 2]), path(&[3, 4, 5, 6])];
    let querier = StaticQuerier::new(remote_ia(), paths.clone());
    let subsystem = PathSubsystem::new(PathSubsystemConfig::default(), querier.clone())
        .map_err(anyhow::Error::msg)?;
    let raw = TestRawConn::new(addr(local_ia(), "10.0.0.2", 5000));
    let remote = addr(remote_ia(), "10.1.0.2", 6000);

    let conn = subsystem
        .dial_udp(
            raw.clone(),
            remote,
            Some(Arc::new(Pinned(vec![paths[1].fingerprint.clone()]))),
            None,
        )
        .await?;
    assert_eq!(conn.path().unwrap().fingerprint, paths[1].fingerprint);

    conn.set_policy(Some(Arc::new(Pinned(vec![paths[0].fingerprint.clone()]))));
    assert_eq!(conn.path().unwrap().fingerprint, paths[0].fingerprint);

    // Without a policy all paths are eligible and the current one is kept.
    conn.set_policy(None);
    assert_eq!(conn.path().unwrap().fingerprint, paths[0].fingerprint);
    assert_eq!(querier.queries().len(), 1);
    Ok(())
}

#[test(tokio::test)]
#[ntest::timeout(10_000)]
async fn should_echo_within_local_as() -> anyhow::Result<()> {
    let querier = StaticQuerier::new(remote_ia(), vec![]);
    let subsystem = PathSubsystem::new(PathSubsystemConfig::default(), querier.clone())
        .map_err(anyhow::Error::msg)?;
    let raw = TestRawConn::new(addr(local_ia(), "10.0.0.2", 5000));
    let conn = subsystem.listen_udp(raw.clone(), None);
    let client = addr(local_ia(), "10.0.0.3", 7000);
    raw.inject(client, b"ping");

    let mut buf = [0u8; 32];
    let (n, source) = conn.read_from(&mut buf).await?;
    conn.write_to(&buf[..n], &NetAddr::from(source)).await?;

    let sent = raw.sent();
    assert_eq!(sent[0].destination, client);
    assert_eq!(sent[0].payload, b"ping");
    assert!(sent[0].path.is_empty());
    assert!(querier.queries().is_empty());

    // Nothing was received from remotes in other ASes.
    let err = conn
        .write_to(b"x", &addr(remote_ia(), "10.1.0.2", 6000).into())
        .await
        .unwrap_err();
    assert!(matches!(err, ConnError::NoPath(_)));
    Ok(())
}
