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

//! The path subsystem, owning the state shared by all connections of a host.

use std::{sync::Arc, time::SystemTime};

use tracing::instrument;

use crate::{
    address::UdpAddr,
    config::PathSubsystemConfig,
    conn::{
        RawConn,
        dial::{DialError, DialedConn},
        listen::ListenConn,
        scmp::ScmpDownHandler,
    },
    path::{
        pool::{PathPool, traits::PathQuerier},
        refresher::PathRefresher,
        stats::PathStatsDb,
    },
    policy::Policy,
    reply_selector::{DefaultReplySelector, ReplySelector},
    selector::{DefaultSelector, Selector},
};

/// Owns the path pool, the refresh task and the path statistics.
///
/// Background tasks are stopped by [`shutdown`](Self::shutdown) or when the subsystem is
/// dropped. Connections opened before stay usable, but no longer receive path updates.
pub struct PathSubsystem {
    config: PathSubsystemConfig,
    refresher: Arc<PathRefresher>,
    stats: Arc<PathStatsDb>,
}

impl PathSubsystem {
    /// Creates the subsystem and spawns its background tasks.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        config: PathSubsystemConfig,
        querier: Arc<dyn PathQuerier>,
    ) -> Result<Self, &'static str> {
        config.validate()?;
        let pool = Arc::new(PathPool::new(config, querier));
        tracing::info!("Starting path subsystem");
        Ok(Self {
            config,
            refresher: Arc::new(PathRefresher::new(pool)),
            stats: Arc::new(PathStatsDb::new(config)),
        })
    }

    /// Opens a connection to `remote` over `raw`.
    ///
    /// The paths are filtered by `policy`, if given, and chosen by `selector`, a
    /// [`DefaultSelector`] if none is given. Fails if there is no path to the remote.
    #[instrument(name = "dial", skip_all, fields(%remote))]
    pub async fn dial_udp(
        &self,
        raw: Arc<dyn RawConn>,
        remote: UdpAddr,
        policy: Option<Arc<dyn Policy>>,
        selector: Option<Arc<dyn Selector>>,
    ) -> Result<DialedConn, DialError> {
        let selector =
            selector.unwrap_or_else(|| Arc::new(DefaultSelector::new(self.stats.clone())));
        let conn = DialedConn::open(
            self.refresher.clone(),
            self.stats.clone(),
            raw,
            remote,
            policy,
            selector,
            SystemTime::now(),
        )
        .await?;
        tracing::debug!(local = %conn.local_addr(), "Dialed");
        Ok(conn)
    }

    /// Opens a listening connection over `raw`, replying over paths chosen by `selector`, a
    /// [`DefaultReplySelector`] if none is given.
    pub fn listen_udp(
        &self,
        raw: Arc<dyn RawConn>,
        selector: Option<Arc<dyn ReplySelector>>,
    ) -> ListenConn {
        let selector = selector.unwrap_or_else(|| {
            Arc::new(DefaultReplySelector::new(self.config, self.stats.clone()))
        });
        ListenConn::open(self.stats.clone(), raw, selector)
    }

    /// Returns the path pool.
    pub fn pool(&self) -> &Arc<PathPool> {
        self.refresher.pool()
    }

    /// Returns the path refresher.
    pub fn refresher(&self) -> &Arc<PathRefresher> {
        &self.refresher
    }

    /// Returns the path statistics.
    pub fn stats(&self) -> &Arc<PathStatsDb> {
        &self.stats
    }

    /// Returns a handler turning SCMP interface down messages into path down notifications.
    pub fn scmp_handler(&self) -> ScmpDownHandler {
        ScmpDownHandler::new(self.stats.clone())
    }

    /// Stops the background tasks.
    pub fn shutdown(&self) {
        self.refresher.shutdown();
        self.stats.shutdown();
    }
}

impl Drop for PathSubsystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{conn::test_helpers::MockRawConn, path::test_helpers::*};

    fn querier() -> Arc<MockQuerier> {
        let querier = Arc::new(MockQuerier::new());
        querier.set_paths(
            dst_ia(),
            vec![path_with_ifids(&[1, 2], SystemTime::now() + Duration::from_secs(3600))],
        );
        querier
    }

    #[tokio::test]
    async fn should_reject_invalid_config() {
        let config = PathSubsystemConfig {
            latency_samples: 0,
            ..Default::default()
        };

        assert!(PathSubsystem::new(config, querier()).is_err());
    }

    #[test_log::test(tokio::test)]
    async fn should_dial_with_default_selector() {
        let subsystem = PathSubsystem::new(PathSubsystemConfig::default(), querier()).unwrap();
        let raw = MockRawConn::new(UdpAddr::new(src_ia(), "10.0.0.2".parse().unwrap(), 5000));
        let remote = UdpAddr::new(dst_ia(), "10.1.0.2".parse().unwrap(), 6000);

        let conn = subsystem
            .dial_udp(Arc::new(raw.clone()), remote, None, None)
            .await
            .unwrap();

        assert_eq!(conn.path().unwrap().fingerprint, "1 2".into());
        assert_eq!(subsystem.pool().cached_paths(dst_ia()).len(), 1);
        conn.close();
        assert!(raw.is_closed());
    }
}
