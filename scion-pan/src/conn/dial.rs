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

//! Connections to a single remote.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::SystemTime,
};

use super::{ConnError, RawConn, subscriber::PathRefreshSubscriber, write_msg};
use crate::{
    address::UdpAddr,
    path::{
        NoPathError, Path, pool::PathPoolError, refresher::PathRefresher, stats::PathStatsDb,
    },
    policy::Policy,
    selector::Selector,
};

/// Errors when dialing a remote.
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    /// The paths to the remote could not be obtained.
    #[error("failed to get paths: {0}")]
    Pool(#[from] PathPoolError),
}

/// A connection to a single remote, sending over the path chosen by its [`Selector`].
///
/// The selector receives refreshed paths, filtered by the connection's policy, and down
/// notifications until the connection is closed. Connections to a remote in the local AS do not
/// use paths.
pub struct DialedConn {
    raw: Arc<dyn RawConn>,
    local: UdpAddr,
    remote: UdpAddr,
    selector: Arc<dyn Selector>,
    subscriber: Option<Arc<PathRefreshSubscriber>>,
    closed: AtomicBool,
}

impl DialedConn {
    pub(crate) async fn open(
        refresher: Arc<PathRefresher>,
        stats: Arc<PathStatsDb>,
        raw: Arc<dyn RawConn>,
        remote: UdpAddr,
        policy: Option<Arc<dyn Policy>>,
        selector: Arc<dyn Selector>,
        now: SystemTime,
    ) -> Result<Self, DialError> {
        let local = raw.local_addr();
        let subscriber = if local.ia == remote.ia {
            None
        } else {
            Some(
                PathRefreshSubscriber::open(
                    refresher,
                    stats,
                    local,
                    remote,
                    policy,
                    selector.clone(),
                    now,
                )
                .await?,
            )
        };

        Ok(Self {
            raw,
            local,
            remote,
            selector,
            subscriber,
            closed: AtomicBool::new(false),
        })
    }

    /// Sends `payload` to the remote over the selected path.
    pub async fn write(&self, payload: &[u8]) -> Result<usize, ConnError> {
        if self.local.ia == self.remote.ia {
            return self.write_via(None, payload).await;
        }
        let path = self.selector.path().ok_or(NoPathError {
            destination: self.remote.ia,
        })?;
        self.write_via(Some(&*path), payload).await
    }

    /// Sends `payload` to the remote over the given path, bypassing the selector.
    pub async fn write_via(&self, path: Option<&Path>, payload: &[u8]) -> Result<usize, ConnError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnError::Closed);
        }
        write_msg(self.raw.as_ref(), self.local, self.remote, path, payload).await
    }

    /// Receives the next packet from the remote. Packets from other sources are dropped.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, ConnError> {
        loop {
            let datagram = self.raw.recv_from(buf).await?;
            if datagram.source == self.remote {
                return Ok(datagram.len);
            }
            tracing::debug!(source = %datagram.source, "Dropping packet from unexpected source");
        }
    }

    /// Like [`read`](Self::read), but also returns the path back to the remote the packet
    /// arrived on. `None` if the remote is in the local AS.
    ///
    /// Packets whose path cannot be reversed are dropped.
    pub async fn read_via(&self, buf: &mut [u8]) -> Result<(usize, Option<Arc<Path>>), ConnError> {
        loop {
            let datagram = self.raw.recv_from(buf).await?;
            if datagram.source != self.remote {
                tracing::debug!(source = %datagram.source, "Dropping packet from unexpected source");
                continue;
            }
            match self
                .raw
                .reverse_path(self.remote.ia, self.local.ia, &datagram.path)
            {
                Ok(path) => return Ok((datagram.len, path.map(Arc::new))),
                Err(error) => {
                    tracing::debug!(%error, "Dropping packet with invalid path");
                }
            }
        }
    }

    /// Returns the path currently selected, `None` if there is none or the remote is in the
    /// local AS.
    pub fn path(&self) -> Option<Arc<Path>> {
        if self.local.ia == self.remote.ia {
            return None;
        }
        self.selector.path()
    }

    /// Replaces the policy. The selector is refreshed with the cached paths, filtered by the new
    /// policy.
    pub fn set_policy(&self, policy: Option<Arc<dyn Policy>>) {
        if let Some(subscriber) = &self.subscriber {
            subscriber.set_policy(policy);
        }
    }

    /// Returns the local address.
    pub fn local_addr(&self) -> UdpAddr {
        self.local
    }

    /// Returns the remote address.
    pub fn remote_addr(&self) -> UdpAddr {
        self.remote
    }

    /// Stops path updates, closes the selector and the underlying socket.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(subscriber) = &self.subscriber {
            subscriber.close();
        }
        self.selector.close();
        self.raw.close();
    }
}

impl Drop for DialedConn {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::{
        config::PathSubsystemConfig,
        conn::{ENDHOST_PORT, test_helpers::*},
        path::{ForwardingPath, pool::PathPool, test_helpers::*},
        selector::{DefaultSelector, MockSelector},
    };

    mod helpers {
        use super::*;

        pub struct Setup {
            pub querier: MockQuerier,
            pub refresher: Arc<PathRefresher>,
            pub stats: Arc<PathStatsDb>,
            pub raw: MockRawConn,
        }

        pub fn local() -> UdpAddr {
            UdpAddr::new(src_ia(), "10.0.0.2".parse().unwrap(), 5000)
        }

        pub fn remote() -> UdpAddr {
            UdpAddr::new(dst_ia(), "10.1.0.2".parse().unwrap(), 6000)
        }

        pub fn setup() -> Setup {
            let querier = MockQuerier::new();
            querier.set_paths(
                dst_ia(),
                vec![
                    path_with_ifids(&[1, 2], BASE_TIME + Duration::from_secs(3600)),
                    path_with_ifids(&[3, 4], BASE_TIME + Duration::from_secs(3600)),
                ],
            );
            let config = PathSubsystemConfig::default();
            let pool = Arc::new(PathPool::new(config, Arc::new(querier.clone())));
            Setup {
                querier,
                refresher: Arc::new(PathRefresher::new(pool)),
                stats: Arc::new(PathStatsDb::new(config)),
                raw: MockRawConn::new(local()),
            }
        }

        pub async fn dial(setup: &Setup, remote: UdpAddr) -> Result<DialedConn, DialError> {
            let selector = Arc::new(DefaultSelector::new(setup.stats.clone()));
            DialedConn::open(
                setup.refresher.clone(),
                setup.stats.clone(),
                Arc::new(setup.raw.clone()),
                remote,
                None,
                selector,
                BASE_TIME,
            )
            .await
        }

        pub fn incoming_path(fingerprint: &str) -> ForwardingPath {
            ForwardingPath::new(Bytes::copy_from_slice(fingerprint.as_bytes()), None)
        }
    }

    use helpers::*;

    #[test_log::test(tokio::test)]
    async fn should_send_over_selected_path() {
        let setup = setup();
        let conn = dial(&setup, remote()).await.unwrap();

        conn.write(b"hello").await.unwrap();

        assert_eq!(setup.querier.received_requests(), vec![dst_ia()]);
        let sent = setup.raw.sent();
        let expected = path_with_ifids(&[1, 2], BASE_TIME);
        assert_eq!(sent[0].path, expected.forwarding_path);
        assert_eq!(sent[0].destination, remote());
        assert_eq!(sent[0].payload, b"hello");
    }

    #[test_log::test(tokio::test)]
    async fn should_not_use_paths_within_local_as() {
        let setup = setup();
        let remote = UdpAddr::new(src_ia(), "10.0.0.3".parse().unwrap(), 6000);
        let conn = dial(&setup, remote).await.unwrap();

        conn.write(b"hello").await.unwrap();

        assert!(setup.querier.received_requests().is_empty());
        assert_eq!(conn.path(), None);
        let sent = setup.raw.sent();
        assert_eq!(sent[0].next_hop.port(), ENDHOST_PORT);
        assert!(sent[0].path.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn should_fail_to_dial_without_paths() {
        let setup = setup();
        let unreachable = UdpAddr::new(ia("2-ff00:0:210"), "10.2.0.1".parse().unwrap(), 6000);

        let err = dial(&setup, unreachable).await.err().unwrap();

        assert!(matches!(err, DialError::Pool(PathPoolError::NoPath(_))));
    }

    #[test_log::test(tokio::test)]
    async fn should_fail_write_without_path() {
        let setup = setup();
        let mut selector = MockSelector::new();
        selector.expect_initialize().return_const(());
        selector.expect_path().return_const(None);
        selector.expect_close().return_const(());
        let conn = DialedConn::open(
            setup.refresher.clone(),
            setup.stats.clone(),
            Arc::new(setup.raw.clone()),
            remote(),
            None,
            Arc::new(selector),
            BASE_TIME,
        )
        .await
        .unwrap();

        let err = conn.write(b"x").await.unwrap_err();

        assert!(matches!(
            err,
            ConnError::NoPath(NoPathError { destination }) if destination == dst_ia()
        ));
    }

    #[test_log::test(tokio::test)]
    async fn should_only_read_from_remote() {
        let setup = setup();
        let conn = dial(&setup, remote()).await.unwrap();
        let stranger = UdpAddr::new(dst_ia(), "10.1.0.3".parse().unwrap(), 6000);
        setup.raw.push_incoming(stranger, incoming_path("2 1"), b"spam");
        setup.raw.push_incoming(remote(), incoming_path("bad"), b"invalid");
        setup.raw.push_incoming(remote(), incoming_path("2 1"), b"valid");

        let mut buf = [0u8; 16];
        let (n, path) = conn.read_via(&mut buf).await.unwrap();

        assert_eq!(&buf[..n], b"valid");
        assert_eq!(path.unwrap().fingerprint, "2 1".into());
    }

    #[test_log::test(tokio::test)]
    async fn should_close_once() {
        let setup = setup();
        let conn = dial(&setup, remote()).await.unwrap();

        conn.close();
        conn.close();

        assert!(setup.raw.is_closed());
        assert!(matches!(conn.write(b"x").await, Err(ConnError::Closed)));
        let mut buf = [0u8; 4];
        assert!(matches!(conn.read(&mut buf).await, Err(ConnError::Closed)));
    }
}
