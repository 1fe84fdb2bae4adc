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

//! Keeps the paths of subscribed destinations fresh.
//!
//! A single background task wakes up regularly, and shortly before the earliest path in the
//! [`PathPool`] expires, queries new paths for every subscribed destination that is due and hands
//! them to the subscribers of that destination.
//!
//! Failed queries are logged and retried on the next wakeup. There is probably plenty of time until
//! a failure manifests as a problem for the application, i.e. until the paths actually expire.

// Internal:
//
// The task waits on a channel signalling new destinations and on a sleep until the next planned
// refresh. A message carries `true` if the destination is the first one subscribed, in which case
// the subscribe call just queried all paths and counts as the previous refresh.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

use rand::Rng;
use tokio::{select, sync::mpsc};
use tracing::instrument;

use crate::{
    address::IsdAsn,
    config::PathSubsystemConfig,
    path::{
        NoPathError, Path,
        pool::{PathPool, PathPoolError},
    },
    types::TaskGuard,
};

/// Receives refreshed paths for a destination.
pub trait Refreshee: Send + Sync + 'static {
    /// Called with the freshly queried paths to `dst`.
    fn refresh(&self, dst: IsdAsn, paths: Vec<Arc<Path>>);
}

/// Handle to the path refresh task.
///
/// The task is stopped when the refresher is dropped or [`shutdown`](Self::shutdown) is called.
pub struct PathRefresher {
    state: Arc<RefresherState>,
    task: TaskGuard,
}

struct RefresherState {
    pool: Arc<PathPool>,
    subscribers: Mutex<HashMap<IsdAsn, Vec<Arc<dyn Refreshee>>>>,
    new_subscription: mpsc::UnboundedSender<bool>,
}

impl PathRefresher {
    /// Creates a refresher for the pool and spawns the refresh task.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(pool: Arc<PathPool>) -> Self {
        let (new_subscription, subscription_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RefresherState {
            pool,
            subscribers: Mutex::new(HashMap::new()),
            new_subscription,
        });

        let task = {
            let state = state.clone();
            TaskGuard::spawn(|cancel_token| {
                async move {
                    let exit_reason = state.run(subscription_rx, cancel_token).await;
                    tracing::info!(exit_reason, "Path refresher exiting");
                }
            })
        };

        Self { state, task }
    }

    /// Subscribes to paths to `dst`.
    ///
    /// Returns the current paths, querying them if the cached ones are stale. The subscriber
    /// receives all later refreshes until it is unsubscribed.
    pub async fn subscribe(
        &self,
        dst: IsdAsn,
        subscriber: Arc<dyn Refreshee>,
        now: SystemTime,
    ) -> Result<Vec<Arc<Path>>, PathPoolError> {
        self.state.subscribe(dst, subscriber, now).await
    }

    /// Removes the subscriber, compared by identity.
    pub fn unsubscribe(&self, dst: IsdAsn, subscriber: &Arc<dyn Refreshee>) {
        self.state.unsubscribe(dst, subscriber);
    }

    /// Refreshes the paths of all subscribed destinations that are due.
    pub async fn refresh(&self, now: SystemTime) {
        self.state.refresh(now).await;
    }

    /// Returns the pool refreshed by this refresher.
    pub fn pool(&self) -> &Arc<PathPool> {
        &self.state.pool
    }

    /// Stops the refresh task.
    pub fn shutdown(&self) {
        self.task.cancel();
    }
}

impl RefresherState {
    async fn subscribe(
        &self,
        dst: IsdAsn,
        subscriber: Arc<dyn Refreshee>,
        now: SystemTime,
    ) -> Result<Vec<Arc<Path>>, PathPoolError> {
        let paths = self.pool.paths(dst, now).await?;
        if paths.is_empty() {
            return Err(NoPathError { destination: dst }.into());
        }

        let mut subscribers = self.subscribers.lock().expect("lock poisoned");
        let is_new = !subscribers.contains_key(&dst);
        subscribers.entry(dst).or_default().push(subscriber);
        if is_new {
            tracing::debug!(%dst, "New path subscription");
            let first = subscribers.len() == 1;
            // The receiver only goes away once the refresher is shut down.
            let _ = self.new_subscription.send(first);
        }
        self.pool.evict_idle(now, |dst| subscribers.contains_key(dst));

        Ok(paths)
    }

    fn unsubscribe(&self, dst: IsdAsn, subscriber: &Arc<dyn Refreshee>) {
        let mut subscribers = self.subscribers.lock().expect("lock poisoned");
        if let Some(subs) = subscribers.get_mut(&dst) {
            if let Some(idx) = subs
                .iter()
                .position(|s| std::ptr::addr_eq(Arc::as_ptr(s), Arc::as_ptr(subscriber)))
            {
                subs.remove(idx);
            }
            if subs.is_empty() {
                subscribers.remove(&dst);
            }
        }
    }

    #[instrument(name = "path-refresher", skip_all)]
    async fn run(
        &self,
        mut subscription_rx: mpsc::UnboundedReceiver<bool>,
        cancel_token: tokio_util::sync::CancellationToken,
    ) -> &'static str {
        let mut prev_refresh = SystemTime::now();
        let mut next_refresh: Option<SystemTime> = None;

        loop {
            let sleep_until = next_refresh;
            let sleep = async move {
                match sleep_until {
                    Some(next) => {
                        let delay = next
                            .duration_since(SystemTime::now())
                            .unwrap_or(Duration::ZERO);
                        tokio::time::sleep(delay).await
                    }
                    None => std::future::pending().await,
                }
            };

            select! {
                biased;
                _ = cancel_token.cancelled() => {
                    return "cancelled";
                }
                first = subscription_rx.recv() => {
                    let Some(first) = first else {
                        return "subscription channel closed";
                    };
                    // The first subscriber just queried its paths.
                    if first {
                        prev_refresh = SystemTime::now();
                    }
                    next_refresh = self.next_refresh(prev_refresh);
                    tracing::trace!(?next_refresh, "Rescheduled path refresh");
                }
                _ = sleep => {
                    self.refresh(SystemTime::now()).await;
                    prev_refresh = SystemTime::now();
                    next_refresh = self.next_refresh(prev_refresh);
                    tracing::trace!(?next_refresh, "Scheduled path refresh");
                }
            }
        }
    }

    async fn refresh(&self, now: SystemTime) {
        let destinations: Vec<IsdAsn> = {
            let subscribers = self.subscribers.lock().expect("lock poisoned");
            subscribers.keys().copied().collect()
        };

        let config = self.pool.config();
        for dst in destinations {
            let due = self
                .pool
                .entry(dst)
                .is_none_or(|entry| entry.should_query(now, config));
            if !due {
                continue;
            }

            let paths = match self.pool.query_paths(dst, now).await {
                Ok(paths) => paths,
                Err(error) => {
                    tracing::debug!(%dst, %error, "Failed to refresh paths");
                    continue;
                }
            };

            let subscribers: Vec<Arc<dyn Refreshee>> = {
                let subscribers = self.subscribers.lock().expect("lock poisoned");
                subscribers.get(&dst).cloned().unwrap_or_default()
            };
            for subscriber in subscribers {
                subscriber.refresh(dst, paths.clone());
            }
        }

        let subscribers = self.subscribers.lock().expect("lock poisoned");
        self.pool.evict_idle(now, |dst| subscribers.contains_key(dst));
    }

    fn next_refresh(&self, prev_refresh: SystemTime) -> Option<SystemTime> {
        if self.subscribers.lock().expect("lock poisoned").is_empty() {
            return None;
        }
        let config = self.pool.config();
        Some(next_refresh_time(
            prev_refresh,
            self.pool.earliest_expiry(),
            jitter(config.refresh_jitter),
            config,
        ))
    }
}

/// Computes the next refresh after `prev_refresh`.
///
/// Refreshes happen every `refresh_interval`, or earlier if paths expire within
/// `refresh_lead_time`, but never earlier than `refresh_min_interval` after the previous refresh.
/// Otherwise a failing refresh of expired paths would refresh continuously.
fn next_refresh_time(
    prev_refresh: SystemTime,
    earliest_expiry: Option<SystemTime>,
    jitter: Duration,
    config: &PathSubsystemConfig,
) -> SystemTime {
    let mut next = prev_refresh + config.refresh_interval;
    if let Some(expiry) = earliest_expiry {
        let expiry_refresh = expiry
            .checked_sub(config.refresh_lead_time)
            .map_or(prev_refresh, |t| t + jitter);
        next = next.min(expiry_refresh);
    }
    next.max(prev_refresh + config.refresh_min_interval)
}

/// Random offset in whole seconds below `max`, so that not all hosts refresh simultaneously.
fn jitter(max: Duration) -> Duration {
    match max.as_secs() {
        0 => Duration::ZERO,
        secs => Duration::from_secs(rand::rng().random_range(0..secs)),
    }
}
