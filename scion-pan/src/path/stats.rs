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

//! Path statistics shared by all connections.
//!
//! The statistics database records when paths and interfaces were notified to be down, and the
//! latencies measured to destination hosts. Selectors use it to decide which path is more alive or
//! faster.
//!
//! Down notifications are recorded synchronously and then dispatched to all registered
//! [`PathDownNotifyee`]s by a single background task, in FIFO order. The producer never blocks: if
//! the dispatch queue is full, the notification is dropped.

// Internal:
//
// Down times are `Option<SystemTime>`, `None` meaning never notified down. `None` orders before
// any time, so a path never notified down is the "oldest" down.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::{Duration, SystemTime},
};

#[cfg(test)]
use mockall::automock;
use tokio::{select, sync::mpsc};

use crate::{
    address::ScionAddr,
    config::PathSubsystemConfig,
    path::{Path, PathFingerprint, PathInterface},
    types::{Subscribers, TaskGuard},
};

/// Receives path down notifications.
#[cfg_attr(test, automock)]
pub trait PathDownNotifyee: Send + Sync + 'static {
    /// Called when a path or an interface was reported to be down.
    fn path_down(&self, fingerprint: &PathFingerprint, interface: PathInterface);
}

/// Statistics of a path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PathStats {
    /// Time of the last down notification.
    pub notified_down: Option<SystemTime>,
}

/// Statistics of an interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PathInterfaceStats {
    /// Time of the last down notification.
    pub notified_down: Option<SystemTime>,
}

/// A latency measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencySample {
    /// Time of the measurement.
    pub time: SystemTime,
    /// Measured round trip time.
    pub value: Duration,
}

/// Statistics of a destination host.
#[derive(Debug, Clone, Default)]
pub struct DestinationStats {
    /// Latency samples per path, most recent first.
    pub latency: HashMap<PathFingerprint, Vec<LatencySample>>,
}

#[derive(Default)]
struct StatsState {
    paths: HashMap<PathFingerprint, PathStats>,
    interfaces: HashMap<PathInterface, PathInterfaceStats>,
    destinations: HashMap<ScionAddr, DestinationStats>,
}

impl StatsState {
    fn newest_down(&self, p: &Path) -> Option<SystemTime> {
        let path_down = self.paths.get(&p.fingerprint).and_then(|s| s.notified_down);
        p.interfaces()
            .iter()
            .filter_map(|i| self.interfaces.get(i).and_then(|s| s.notified_down))
            .fold(path_down, |newest, t| newest.max(Some(t)))
    }

    fn oldest_down(&self, p: &Path) -> Option<SystemTime> {
        let path_down = self.paths.get(&p.fingerprint).and_then(|s| s.notified_down);
        p.interfaces()
            .iter()
            .filter_map(|i| self.interfaces.get(i).and_then(|s| s.notified_down))
            .fold(path_down, |oldest, t| {
                match oldest {
                    Some(oldest) if oldest <= t => Some(oldest),
                    _ => Some(t),
                }
            })
    }

    fn is_more_alive(&self, a: &Path, b: &Path, timeout: Duration) -> bool {
        let Some(oldest_b) = self.oldest_down(b) else {
            // Nothing is more alive than a path never notified down.
            return false;
        };
        match self.newest_down(a) {
            None => true,
            Some(newest_a) => newest_a + timeout < oldest_b,
        }
    }
}

/// Database of path liveness and latency statistics.
pub struct PathStatsDb {
    config: PathSubsystemConfig,
    state: RwLock<StatsState>,
    notifyees: Subscribers<dyn PathDownNotifyee>,
    down_tx: mpsc::Sender<(PathFingerprint, PathInterface)>,
    dispatcher: TaskGuard,
}

impl PathStatsDb {
    /// Creates a new database and spawns its notification dispatcher.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(config: PathSubsystemConfig) -> Self {
        let notifyees: Subscribers<dyn PathDownNotifyee> = Subscribers::new();
        let (down_tx, mut down_rx) = mpsc::channel::<(PathFingerprint, PathInterface)>(
            config.down_notification_channel_capacity,
        );

        let dispatcher = {
            let notifyees = notifyees.clone();
            TaskGuard::spawn(|cancel_token| {
                async move {
                    let exit_reason = loop {
                        select! {
                            biased;
                            _ = cancel_token.cancelled() => break "cancelled",
                            notification = down_rx.recv() => {
                                let Some((fingerprint, interface)) = notification else {
                                    break "channel closed";
                                };
                                notifyees.for_each(|n| n.path_down(&fingerprint, interface));
                            }
                        }
                    };
                    tracing::info!(exit_reason, "Path down dispatcher exiting");
                }
            })
        };

        Self {
            config,
            state: RwLock::new(StatsState::default()),
            notifyees,
            down_tx,
            dispatcher,
        }
    }

    /// Registers a receiver of down notifications. Held as weak reference.
    pub fn register(&self, notifyee: Arc<dyn PathDownNotifyee>) {
        self.notifyees.register(notifyee);
    }

    /// Removes a receiver of down notifications.
    pub fn unregister(&self, notifyee: &Arc<dyn PathDownNotifyee>) {
        self.notifyees.unregister(notifyee);
    }

    /// Records a latency measurement for the path to `dst`.
    ///
    /// Only the most recent `latency_samples` are kept.
    pub fn record_latency(
        &self,
        dst: ScionAddr,
        fingerprint: &PathFingerprint,
        latency: Duration,
        now: SystemTime,
    ) {
        let mut state = self.state.write().expect("lock poisoned");
        let samples = state
            .destinations
            .entry(dst)
            .or_default()
            .latency
            .entry(fingerprint.clone())
            .or_default();
        samples.insert(
            0,
            LatencySample {
                time: now,
                value: latency,
            },
        );
        samples.truncate(self.config.latency_samples);
    }

    /// Returns the latency samples of the path to `dst`, most recent first.
    pub fn latency_samples(
        &self,
        dst: ScionAddr,
        fingerprint: &PathFingerprint,
    ) -> Vec<LatencySample> {
        let state = self.state.read().expect("lock poisoned");
        state
            .destinations
            .get(&dst)
            .and_then(|d| d.latency.get(fingerprint))
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the index of the path with the lowest latency to `dst`, `None` if `paths` is empty.
    ///
    /// Latency samples not younger than the newest down notification of a path are ignored. Paths
    /// without a valid sample rank last. Ties are broken by the older down notification, then by
    /// the lower index.
    pub fn lowest_latency(&self, dst: ScionAddr, paths: &[Arc<Path>]) -> Option<usize> {
        let state = self.state.read().expect("lock poisoned");
        let dst_stats = state.destinations.get(&dst);

        let mut best: Option<(usize, Duration, Option<SystemTime>)> = None;
        for (i, p) in paths.iter().enumerate() {
            let down = state.newest_down(p);
            let latency = dst_stats
                .and_then(|d| d.latency.get(&p.fingerprint))
                .and_then(|samples| samples.first())
                .filter(|sample| down.is_none_or(|down| sample.time > down))
                .map(|sample| sample.value)
                .unwrap_or(Duration::MAX);

            let better = match best {
                None => true,
                Some((_, best_latency, best_down)) => {
                    latency < best_latency || (latency == best_latency && down < best_down)
                }
            };
            if better {
                best = Some((i, latency, down));
            }
        }
        best.map(|(i, _, _)| i)
    }

    /// Returns the index of the first path in `paths` that is more alive than `p`.
    pub fn first_more_alive(&self, p: &Path, paths: &[Arc<Path>]) -> Option<usize> {
        let state = self.state.read().expect("lock poisoned");
        paths.iter().position(|candidate| {
            state.is_more_alive(candidate, p, self.config.down_notification_timeout)
        })
    }

    /// Returns true if `a` is strictly more alive than `b`.
    ///
    /// That is the case if all down notifications of `a` are older than any down notification of
    /// `b`, by at least `down_notification_timeout`. A path never notified down is more alive than
    /// any path notified down.
    pub fn is_more_alive(&self, a: &Path, b: &Path) -> bool {
        let state = self.state.read().expect("lock poisoned");
        state.is_more_alive(a, b, self.config.down_notification_timeout)
    }

    /// Returns the time of the newest down notification relevant for `p`.
    pub fn newest_down(&self, p: &Path) -> Option<SystemTime> {
        let state = self.state.read().expect("lock poisoned");
        state.newest_down(p)
    }

    /// Records that the path and the interface are down, and notifies all registered receivers.
    ///
    /// The receivers are notified asynchronously. If too many notifications are pending, the
    /// notification is recorded but not dispatched.
    pub fn notify_path_down(
        &self,
        fingerprint: PathFingerprint,
        interface: PathInterface,
        now: SystemTime,
    ) {
        {
            let mut state = self.state.write().expect("lock poisoned");
            state.paths.entry(fingerprint.clone()).or_default().notified_down = Some(now);
            state.interfaces.entry(interface).or_default().notified_down = Some(now);
        }

        if let Err(e) = self.down_tx.try_send((fingerprint, interface)) {
            tracing::warn!(%interface, error = %e, "Dropped path down notification");
        }
    }

    /// Stops dispatching down notifications.
    pub fn shutdown(&self) {
        self.dispatcher.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::Notify;

    use super::*;
    use crate::path::{ForwardingPath, PathMetadata, test_helpers::*};

    mod helpers {
        use super::*;

        pub fn dst() -> ScionAddr {
            ScionAddr::new(dst_ia(), "192.0.2.1".parse().unwrap())
        }

        pub fn bare_path(fingerprint: &str) -> Arc<Path> {
            Arc::new(Path::without_metadata(
                src_ia(),
                dst_ia(),
                ForwardingPath::default(),
                fingerprint.into(),
                BASE_TIME + Duration::from_secs(3600),
            ))
        }

        pub fn path_over(interfaces: &[PathInterface]) -> Arc<Path> {
            Arc::new(Path::new(
                src_ia(),
                dst_ia(),
                ForwardingPath::default(),
                PathMetadata {
                    interfaces: interfaces.to_vec(),
                    ..Default::default()
                },
                BASE_TIME + Duration::from_secs(3600),
            ))
        }

        pub fn iface(ifid: u64) -> PathInterface {
            PathInterface::new(src_ia(), ifid)
        }

        pub fn secs(s: u64) -> SystemTime {
            BASE_TIME + Duration::from_secs(s)
        }
    }

    mod latency {
        use super::{helpers::*, *};

        #[tokio::test]
        async fn should_keep_most_recent_samples() {
            let stats = PathStatsDb::new(PathSubsystemConfig::default());
            let fp = PathFingerprint::from("x");
            let expected: [&[u64]; 7] = [
                &[1],
                &[2, 1],
                &[3, 2, 1],
                &[4, 3, 2, 1],
                &[5, 4, 3, 2],
                &[6, 5, 4, 3],
                &[7, 6, 5, 4],
            ];

            for (step, v) in (1..=7).enumerate() {
                stats.record_latency(dst(), &fp, Duration::from_millis(v), secs(v));
                let actual: Vec<u64> = stats
                    .latency_samples(dst(), &fp)
                    .iter()
                    .map(|s| s.value.as_millis() as u64)
                    .collect();
                assert_eq!(actual, expected[step]);
            }
        }

        #[tokio::test]
        async fn lowest_latency_cases() {
            let p0 = bare_path("p0");
            let p1 = bare_path("p1");
            let p2 = bare_path("p2");
            let paths = vec![p0.clone(), p1.clone(), p2.clone()];
            let ms = Duration::from_millis;

            let cases: Vec<(&str, Box<dyn Fn(&PathStatsDb) + '_>, Option<usize>)> = vec![
                ("default", Box::new(|_: &PathStatsDb| {}), Some(0)),
                (
                    "only path with latency data",
                    Box::new(|s: &PathStatsDb| {
                        s.record_latency(dst(), &p1.fingerprint, ms(10), secs(1))
                    }),
                    Some(1),
                ),
                (
                    "only path with latency data is down",
                    Box::new(|s: &PathStatsDb| {
                        s.record_latency(dst(), &p1.fingerprint, ms(10), secs(1));
                        s.notify_path_down(p1.fingerprint.clone(), iface(0), secs(2));
                    }),
                    Some(0),
                ),
                (
                    "only path with no down notification",
                    Box::new(|s: &PathStatsDb| {
                        s.record_latency(dst(), &p1.fingerprint, ms(10), secs(1));
                        s.notify_path_down(p1.fingerprint.clone(), iface(0), secs(2));
                        s.notify_path_down(p0.fingerprint.clone(), iface(0), secs(3));
                    }),
                    Some(2),
                ),
                (
                    "path with oldest down notification",
                    Box::new(|s: &PathStatsDb| {
                        s.record_latency(dst(), &p1.fingerprint, ms(10), secs(1));
                        s.notify_path_down(p1.fingerprint.clone(), iface(0), secs(2));
                        s.notify_path_down(p0.fingerprint.clone(), iface(0), secs(3));
                        s.notify_path_down(p2.fingerprint.clone(), iface(0), secs(4));
                    }),
                    Some(1),
                ),
                (
                    "lowest latency",
                    Box::new(|s: &PathStatsDb| {
                        s.record_latency(dst(), &p1.fingerprint, ms(10), secs(1));
                        s.record_latency(dst(), &p2.fingerprint, ms(4), secs(1));
                    }),
                    Some(2),
                ),
                (
                    "lowest latency old down notifications",
                    Box::new(|s: &PathStatsDb| {
                        s.notify_path_down(p1.fingerprint.clone(), iface(0), secs(1));
                        s.notify_path_down(p2.fingerprint.clone(), iface(0), secs(1));
                        s.record_latency(dst(), &p1.fingerprint, ms(10), secs(2));
                        s.record_latency(dst(), &p2.fingerprint, ms(4), secs(2));
                    }),
                    Some(2),
                ),
            ];

            for (name, setup, expected) in cases {
                let stats = PathStatsDb::new(PathSubsystemConfig::default());
                setup(&stats);
                assert_eq!(stats.lowest_latency(dst(), &paths), expected, "{name}");
            }

            let stats = PathStatsDb::new(PathSubsystemConfig::default());
            assert_eq!(stats.lowest_latency(dst(), &[]), None);
        }
    }

    mod liveness {
        use super::{helpers::*, *};

        #[tokio::test]
        async fn path_never_down_should_be_more_alive() {
            let stats = PathStatsDb::new(PathSubsystemConfig::default());
            let a = path_over(&[iface(1), iface(2)]);
            let b = path_over(&[iface(3), iface(4)]);

            assert!(!stats.is_more_alive(&a, &b));
            assert!(!stats.is_more_alive(&b, &a));

            stats.notify_path_down(PathFingerprint::from("zz"), iface(3), secs(100));
            assert!(stats.is_more_alive(&a, &b));
            assert!(!stats.is_more_alive(&b, &a));
        }

        #[tokio::test]
        async fn older_down_should_be_more_alive_only_beyond_timeout() {
            let cfg = PathSubsystemConfig::default();
            let stats = PathStatsDb::new(cfg);
            let a = path_over(&[iface(1), iface(2)]);
            let b = path_over(&[iface(3), iface(4)]);

            stats.notify_path_down(PathFingerprint::from("zz"), iface(1), secs(100));
            stats.notify_path_down(PathFingerprint::from("zz"), iface(3), secs(105));
            // Within the timeout, the notifications are considered the same event.
            assert!(!stats.is_more_alive(&a, &b));

            stats.notify_path_down(PathFingerprint::from("zz"), iface(4), secs(200));
            // The oldest notification of b is still within the timeout.
            assert!(!stats.is_more_alive(&a, &b));

            let c = path_over(&[iface(4), iface(5)]);
            assert!(stats.is_more_alive(&a, &c));
            assert_eq!(stats.first_more_alive(&c, &[b.clone(), a.clone()]), Some(1));
            assert_eq!(stats.first_more_alive(&a, &[b, c]), None);
        }

        #[tokio::test]
        async fn newest_down_should_cover_fingerprint_and_interfaces() {
            let stats = PathStatsDb::new(PathSubsystemConfig::default());
            let a = path_over(&[iface(1), iface(2)]);
            assert_eq!(stats.newest_down(&a), None);

            stats.notify_path_down(a.fingerprint.clone(), iface(9), secs(10));
            stats.notify_path_down(PathFingerprint::from("zz"), iface(2), secs(20));
            assert_eq!(stats.newest_down(&a), Some(secs(20)));
        }
    }

    mod notify {
        use super::{helpers::*, *};

        #[tokio::test]
        #[test_log::test]
        async fn should_dispatch_to_registered_notifyees() {
            let stats = PathStatsDb::new(PathSubsystemConfig::default());
            let notified = Arc::new(Notify::new());
            let mut mock = MockPathDownNotifyee::new();
            {
                let notified = notified.clone();
                mock.expect_path_down()
                    .withf(|fp, iface| fp.as_str() == "x" && iface.ifid == 5)
                    .times(1)
                    .returning(move |_, _| notified.notify_one());
            }
            let notifyee: Arc<dyn PathDownNotifyee> = Arc::new(mock);
            stats.register(notifyee.clone());

            stats.notify_path_down(PathFingerprint::from("x"), iface(5), secs(1));

            tokio::time::timeout(Duration::from_secs(1), notified.notified())
                .await
                .expect("notifyee not called");

            stats.unregister(&notifyee);
            assert!(stats.notifyees.is_empty());
        }

        #[tokio::test]
        #[test_log::test]
        async fn should_drop_notifications_when_queue_is_full() {
            let cfg = PathSubsystemConfig {
                down_notification_channel_capacity: 1,
                ..Default::default()
            };
            let stats = PathStatsDb::new(cfg);
            stats.shutdown();
            tokio::task::yield_now().await;

            // Neither call blocks, even though nobody consumes the queue.
            stats.notify_path_down(PathFingerprint::from("x"), iface(1), secs(1));
            stats.notify_path_down(PathFingerprint::from("y"), iface(2), secs(2));

            // Both are recorded regardless.
            let y = bare_path("y");
            assert_eq!(stats.newest_down(&y), Some(secs(2)));
        }
    }
}
