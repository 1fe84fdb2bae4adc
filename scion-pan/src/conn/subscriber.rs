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

//! Feeds path updates of a dialed connection into its selector.

use std::{sync::Arc, time::SystemTime};

use arc_swap::ArcSwap;

use crate::{
    address::{IsdAsn, UdpAddr},
    path::{
        Path, PathFingerprint, PathInterface,
        pool::PathPoolError,
        refresher::{PathRefresher, Refreshee},
        stats::{PathDownNotifyee, PathStatsDb},
    },
    policy::Policy,
    selector::Selector,
};

/// Subscribes to the paths of the remote AS and to down notifications, filters refreshed paths
/// through the policy and hands the result to the selector.
pub(crate) struct PathRefreshSubscriber {
    refresher: Arc<PathRefresher>,
    stats: Arc<PathStatsDb>,
    remote_ia: IsdAsn,
    policy: ArcSwap<Option<Arc<dyn Policy>>>,
    selector: Arc<dyn Selector>,
}

impl PathRefreshSubscriber {
    /// Subscribes and initializes the selector with the current paths.
    pub(crate) async fn open(
        refresher: Arc<PathRefresher>,
        stats: Arc<PathStatsDb>,
        local: UdpAddr,
        remote: UdpAddr,
        policy: Option<Arc<dyn Policy>>,
        selector: Arc<dyn Selector>,
        now: SystemTime,
    ) -> Result<Arc<Self>, PathPoolError> {
        let subscriber = Arc::new(Self {
            refresher: refresher.clone(),
            stats: stats.clone(),
            remote_ia: remote.ia,
            policy: ArcSwap::from_pointee(policy),
            selector: selector.clone(),
        });

        let paths = refresher
            .subscribe(remote.ia, subscriber.clone(), now)
            .await?;
        selector.initialize(local, remote, subscriber.filtered(paths));
        stats.register(subscriber.clone());
        Ok(subscriber)
    }

    /// Replaces the policy and reselects from the cached paths.
    pub(crate) fn set_policy(&self, policy: Option<Arc<dyn Policy>>) {
        self.policy.store(Arc::new(policy));
        let paths = self.refresher.pool().cached_paths(self.remote_ia);
        self.selector.refresh(self.filtered(paths));
    }

    /// Unsubscribes from path refreshes and down notifications.
    pub(crate) fn close(self: &Arc<Self>) {
        let refreshee: Arc<dyn Refreshee> = self.clone();
        self.refresher.unsubscribe(self.remote_ia, &refreshee);
        let notifyee: Arc<dyn PathDownNotifyee> = self.clone();
        self.stats.unregister(&notifyee);
    }

    fn filtered(&self, paths: Vec<Arc<Path>>) -> Vec<Arc<Path>> {
        match self.policy.load().as_ref() {
            Some(policy) => policy.filter(paths),
            None => paths,
        }
    }
}

impl Refreshee for PathRefreshSubscriber {
    fn refresh(&self, _dst: IsdAsn, paths: Vec<Arc<Path>>) {
        self.selector.refresh(self.filtered(paths));
    }
}

impl PathDownNotifyee for PathRefreshSubscriber {
    fn path_down(&self, fingerprint: &PathFingerprint, interface: PathInterface) {
        self.selector.path_down(fingerprint, interface);
    }
}
