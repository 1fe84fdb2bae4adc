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

//! Latency based path selection.
//!
//! The [`PingingSelector`] periodically sends SCMP echo requests to the remote over the first
//! few paths and selects the path with the lowest round trip time. Measurements are stored in
//! the [`PathStatsDb`], so they are shared with other connections to the same host.
//!
//! Internal:
//!
//! Probing runs in a background task, started once the selector is initialized with a remote in
//! another AS and at least one path is set active. Every `interval` a round of echo requests
//! with a new sequence number is sent. A round ends when every probed path answered or after
//! `timeout`, when unanswered paths are recorded with an infinite latency. At the end of a round
//! the selection is updated.

use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, SystemTime},
};

use futures::future::BoxFuture;
use tokio::{select, sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;

use super::{Selector, is_affected, position_of};
use crate::{
    address::{ScionAddr, UdpAddr},
    config::PingingSelectorConfig,
    conn::{ConnError, scmp::ScmpMessage},
    path::{IfId, Path, PathFingerprint, PathInterface, stats::PathStatsDb},
    types::TaskGuard,
};

/// Sends SCMP echo requests and receives the replies.
///
/// `recv_reply` must be cancel safe.
pub trait EchoProber: Send + Sync + 'static {
    /// Sends an echo request to `remote` over `path`.
    fn send_echo<'a>(
        &'a self,
        remote: ScionAddr,
        path: &'a Path,
        sequence: u16,
    ) -> BoxFuture<'a, Result<(), ConnError>>;

    /// Receives the next echo reply, or an SCMP error caused by an echo request.
    fn recv_reply(&self) -> BoxFuture<'_, Result<EchoReply, ConnError>>;
}

/// Answer to an echo request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoReply {
    /// The sender of the reply.
    pub source: ScionAddr,
    /// Sequence number of the answered request.
    pub sequence: u16,
    /// Interface IDs of the path the reply arrived on, if it could be decoded.
    pub path_interfaces: Option<Vec<IfId>>,
    /// Time between sending the request and receiving the reply.
    pub rtt: Duration,
    /// Set if an SCMP error was received instead of a reply.
    pub error: Option<ScmpMessage>,
}

impl EchoReply {
    /// The fingerprint of the probed path, i.e. the reverse of the path the reply arrived on.
    fn probed_fingerprint(&self) -> Option<PathFingerprint> {
        self.path_interfaces
            .as_ref()
            .map(|ifids| PathFingerprint::reversed_from_interface_ids(ifids.iter().copied()))
    }
}

#[derive(Default)]
struct PingingState {
    endpoints: Option<(UdpAddr, UdpAddr)>,
    paths: Vec<Arc<Path>>,
    current: usize,
}

struct PingingInner {
    config: PingingSelectorConfig,
    stats: Arc<PathStatsDb>,
    prober: Arc<dyn EchoProber>,
    state: Mutex<PingingState>,
    num_active: AtomicUsize,
    // Bumped whenever a round recorded new measurements.
    measured: watch::Sender<u64>,
}

/// Selects the path with the lowest measured latency.
pub struct PingingSelector {
    inner: Arc<PingingInner>,
    task: Mutex<Option<TaskGuard>>,
    closed: AtomicBool,
}

impl PingingSelector {
    /// Creates a selector probing with the given prober. Probing is off until
    /// [`set_active`](Self::set_active) is called.
    pub fn new(
        config: PingingSelectorConfig,
        stats: Arc<PathStatsDb>,
        prober: Arc<dyn EchoProber>,
    ) -> Result<Self, &'static str> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(PingingInner {
                config,
                stats,
                prober,
                state: Mutex::new(PingingState::default()),
                num_active: AtomicUsize::new(0),
                measured: watch::Sender::new(0),
            }),
            task: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Sets the number of paths probed, starting with the most preferred one.
    ///
    /// Starts probing if the selector is initialized. Must be called within a tokio runtime.
    pub fn set_active(&self, num_active: usize) {
        self.inner.num_active.store(num_active, Ordering::Relaxed);
        self.ensure_running();
    }

    /// Waits until an echo reply was received over `n` paths, or all paths if there are fewer.
    /// Lost probes do not count.
    ///
    /// Returns false if that did not happen within `timeout`.
    pub async fn wait_measured(&self, n: usize, timeout: Duration) -> bool {
        let mut measured = self.inner.measured.subscribe();
        let wait = async {
            while !self.inner.has_measured(n) {
                if measured.changed().await.is_err() {
                    return false;
                }
            }
            true
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    fn ensure_running(&self) {
        let mut task = self.task.lock().expect("lock poisoned");
        if task.is_some()
            || self.closed.load(Ordering::Relaxed)
            || self.inner.num_active.load(Ordering::Relaxed) == 0
        {
            return;
        }
        let Some((local, remote)) = self.inner.state.lock().expect("lock poisoned").endpoints
        else {
            return;
        };
        if local.ia == remote.ia {
            tracing::debug!(%remote, "Not probing paths within the local AS");
            return;
        }

        let inner = self.inner.clone();
        *task = Some(TaskGuard::spawn(|cancel_token| {
            async move {
                let exit_reason = inner.run(cancel_token).await;
                tracing::info!(exit_reason, "Path prober exiting");
            }
        }));
    }
}

impl PingingInner {
    fn remote(&self) -> Option<ScionAddr> {
        let state = self.state.lock().expect("lock poisoned");
        state.endpoints.map(|(_, remote)| remote.scion_addr())
    }

    fn active_paths(&self) -> Option<(ScionAddr, Vec<Arc<Path>>)> {
        let state = self.state.lock().expect("lock poisoned");
        let (_, remote) = state.endpoints?;
        let n = self
            .num_active
            .load(Ordering::Relaxed)
            .min(state.paths.len());
        Some((remote.scion_addr(), state.paths[..n].to_vec()))
    }

    fn has_measured(&self, n: usize) -> bool {
        let state = self.state.lock().expect("lock poisoned");
        let Some((_, remote)) = state.endpoints else {
            return false;
        };
        let measured = state
            .paths
            .iter()
            .filter(|p| {
                self.stats
                    .latency_samples(remote.scion_addr(), &p.fingerprint)
                    .iter()
                    .any(|sample| sample.value < Duration::MAX)
            })
            .count();
        measured >= n.min(state.paths.len())
    }

    fn reselect(&self) {
        let mut state = self.state.lock().expect("lock poisoned");
        reselect_locked(&self.stats, &mut state);
    }

    async fn run(&self, cancel_token: CancellationToken) -> &'static str {
        let interval = self.config.interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let round_timeout = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(round_timeout);
        let mut round_pending = false;

        let mut sequence: u16 = 0;
        let mut pending: HashSet<PathFingerprint> = HashSet::new();

        loop {
            select! {
                biased;
                _ = cancel_token.cancelled() => return "cancelled",
                _ = ticker.tick() => {
                    let Some((remote, paths)) = self.active_paths() else {
                        continue;
                    };
                    if paths.is_empty() {
                        continue;
                    }
                    sequence = sequence.wrapping_add(1);
                    pending.clear();
                    for path in &paths {
                        match self.prober.send_echo(remote, path, sequence).await {
                            Ok(()) => {
                                pending.insert(path.fingerprint.clone());
                            }
                            Err(error) => {
                                tracing::debug!(%error, fingerprint = %path.fingerprint, "Failed to send echo request");
                            }
                        }
                    }
                    round_timeout.as_mut().reset(Instant::now() + self.config.timeout);
                    round_pending = true;
                }
                reply = self.prober.recv_reply() => {
                    let reply = match reply {
                        Ok(reply) => reply,
                        Err(ConnError::Closed) => return "prober closed",
                        Err(error) => {
                            tracing::debug!(%error, "Failed to receive echo reply");
                            continue;
                        }
                    };
                    let recorded =
                        self.handle_reply(reply, sequence, &mut pending, SystemTime::now());
                    if round_pending && pending.is_empty() {
                        round_pending = false;
                        self.reselect();
                    }
                    if recorded {
                        self.measured.send_modify(|n| *n += 1);
                    }
                }
                _ = &mut round_timeout, if round_pending => {
                    round_pending = false;
                    if let Some(remote) = self.remote() {
                        let now = SystemTime::now();
                        for fingerprint in pending.drain() {
                            tracing::debug!(%fingerprint, "Echo request timed out");
                            self.stats.record_latency(remote, &fingerprint, Duration::MAX, now);
                        }
                    }
                    self.reselect();
                    self.measured.send_modify(|n| *n += 1);
                }
            }
        }
    }

    /// Returns true if a latency sample was recorded.
    fn handle_reply(
        &self,
        reply: EchoReply,
        sequence: u16,
        pending: &mut HashSet<PathFingerprint>,
        now: SystemTime,
    ) -> bool {
        let Some(fingerprint) = reply.probed_fingerprint() else {
            return false;
        };
        if let Some(message) = reply.error {
            if let Some(interface) = message.down_interface() {
                self.stats.notify_path_down(fingerprint, interface, now);
            }
            return false;
        }
        if Some(reply.source) != self.remote() || reply.sequence != sequence {
            return false;
        }
        if !pending.remove(&fingerprint) {
            return false;
        }
        self.stats
            .record_latency(reply.source, &fingerprint, reply.rtt, now);
        true
    }
}

/// Selects the lowest latency path. The current path is kept unless another one is strictly
/// better.
fn reselect_locked(stats: &PathStatsDb, state: &mut PingingState) {
    let Some((_, remote)) = state.endpoints else {
        return;
    };
    let remote = remote.scion_addr();
    let mut best = stats.lowest_latency(remote, &state.paths).unwrap_or(0);
    if let (Some(current), Some(candidate)) =
        (state.paths.get(state.current), state.paths.get(best))
    {
        if stats.lowest_latency(remote, &[current.clone(), candidate.clone()]) == Some(0) {
            best = state.current;
        }
    }
    if best != state.current {
        if let Some(path) = state.paths.get(best) {
            tracing::debug!(fingerprint = %path.fingerprint, "Selected lowest latency path");
        }
    }
    state.current = best;
}

impl Selector for PingingSelector {
    fn initialize(&self, local: UdpAddr, remote: UdpAddr, paths: Vec<Arc<Path>>) {
        {
            let mut state = self.inner.state.lock().expect("lock poisoned");
            state.endpoints = Some((local, remote));
            state.paths = paths;
            state.current = 0;
            reselect_locked(&self.inner.stats, &mut state);
        }
        self.ensure_running();
    }

    fn refresh(&self, paths: Vec<Arc<Path>>) {
        let mut state = self.inner.state.lock().expect("lock poisoned");
        state.current = state
            .paths
            .get(state.current)
            .and_then(|current| position_of(&paths, &current.fingerprint))
            .unwrap_or(0);
        state.paths = paths;
        reselect_locked(&self.inner.stats, &mut state);
    }

    fn path(&self) -> Option<Arc<Path>> {
        let state = self.inner.state.lock().expect("lock poisoned");
        state.paths.get(state.current).cloned()
    }

    fn path_down(&self, fingerprint: &PathFingerprint, interface: PathInterface) {
        let mut state = self.inner.state.lock().expect("lock poisoned");
        let affected = state
            .paths
            .get(state.current)
            .is_some_and(|current| is_affected(current, fingerprint, &interface));
        if affected {
            reselect_locked(&self.inner.stats, &mut state);
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        if let Some(task) = self.task.lock().expect("lock poisoned").take() {
            task.cancel();
        }
    }
}
