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

//! Reply path selection of listening connections.
//!
//! A listening connection answers remotes over the reversed paths their packets arrived on. The
//! [`ReplySelector`] remembers these paths and picks the one to reply over.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::SystemTime,
};

#[cfg(test)]
use mockall::automock;

use crate::{
    address::UdpAddr,
    config::PathSubsystemConfig,
    path::{Path, PathFingerprint, PathInterface, stats::PathStatsDb},
    selector::is_affected,
};

/// Chooses the reply paths of a listening connection.
#[cfg_attr(test, automock)]
pub trait ReplySelector: Send + Sync + 'static {
    /// Returns the path for the next packet to `remote`.
    fn reply_path(&self, remote: &UdpAddr) -> Option<Arc<Path>>;
    /// Records the reversed path of a packet received from `remote`.
    fn record(&self, remote: UdpAddr, path: Arc<Path>);
    /// Reports that a path or an interface is down. May concern paths unknown to the selector.
    fn path_down(&self, fingerprint: &PathFingerprint, interface: PathInterface);
    /// Releases the selector's resources.
    fn close(&self);
}

struct RemoteEntry {
    // Most recently used first.
    paths: Vec<Arc<Path>>,
    last_seen: SystemTime,
}

/// Replies over the path most recently used by the remote.
///
/// Up to `max_reply_paths` paths are remembered per remote. If the reply path goes down, the
/// selector falls back to the most recently used path that is more alive. Remotes not heard from
/// for `reply_remote_idle_timeout` are forgotten, and at most `max_reply_remotes` remotes are
/// tracked, forgetting the least recently seen ones first.
pub struct DefaultReplySelector {
    config: PathSubsystemConfig,
    stats: Arc<PathStatsDb>,
    remotes: RwLock<HashMap<UdpAddr, RemoteEntry>>,
}

impl DefaultReplySelector {
    /// Creates an empty selector.
    pub fn new(config: PathSubsystemConfig, stats: Arc<PathStatsDb>) -> Self {
        Self {
            config,
            stats,
            remotes: RwLock::new(HashMap::new()),
        }
    }

    /// Records a path used by `remote` at `now`.
    pub fn record_at(&self, remote: UdpAddr, path: Arc<Path>, now: SystemTime) {
        let mut remotes = self.remotes.write().expect("lock poisoned");
        if !remotes.contains_key(&remote) {
            self.make_room(&mut remotes, now);
        }
        let entry = remotes.entry(remote).or_insert_with(|| {
            RemoteEntry {
                paths: Vec::new(),
                last_seen: now,
            }
        });
        entry.last_seen = now;
        insert_most_recent(&mut entry.paths, path, self.config.max_reply_paths);
    }

    /// Returns the number of tracked remotes.
    pub fn len(&self) -> usize {
        self.remotes.read().expect("lock poisoned").len()
    }

    /// Returns true if no remote is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn make_room(&self, remotes: &mut HashMap<UdpAddr, RemoteEntry>, now: SystemTime) {
        let idle_timeout = self.config.reply_remote_idle_timeout;
        remotes.retain(|_, entry| entry.last_seen + idle_timeout > now);

        while remotes.len() >= self.config.max_reply_remotes {
            let Some(oldest) = remotes
                .iter()
                .min_by_key(|(_, entry)| entry.last_seen)
                .map(|(remote, _)| *remote)
            else {
                break;
            };
            tracing::debug!(remote = %oldest, "Evicting reply paths");
            remotes.remove(&oldest);
        }
    }
}

/// Moves `path` to the front of `paths`, replacing a path with the same fingerprint.
///
/// If the path is new and `paths` is full, the least recently used path is dropped.
fn insert_most_recent(paths: &mut Vec<Arc<Path>>, path: Arc<Path>, capacity: usize) {
    match paths.iter().position(|p| p.fingerprint == path.fingerprint) {
        Some(i) => {
            paths.remove(i);
        }
        None => paths.truncate(capacity.saturating_sub(1)),
    }
    paths.insert(0, path);
}

impl ReplySelector for DefaultReplySelector {
    fn reply_path(&self, remote: &UdpAddr) -> Option<Arc<Path>> {
        let remotes = self.remotes.read().expect("lock poisoned");
        remotes.get(remote).and_then(|entry| entry.paths.first().cloned())
    }

    fn record(&self, remote: UdpAddr, path: Arc<Path>) {
        self.record_at(remote, path, SystemTime::now());
    }

    fn path_down(&self, fingerprint: &PathFingerprint, interface: PathInterface) {
        let mut remotes = self.remotes.write().expect("lock poisoned");
        for (remote, entry) in remotes.iter_mut() {
            let Some(front) = entry.paths.first().cloned() else {
                continue;
            };
            if !is_affected(&front, fingerprint, &interface) {
                continue;
            }
            let better = entry.paths[1..]
                .iter()
                .position(|p| self.stats.is_more_alive(p, &front));
            if let Some(i) = better {
                let path = entry.paths.remove(i + 1);
                tracing::info!(%remote, from = %front.fingerprint, to = %path.fingerprint, "Failing over reply path");
                entry.paths.insert(0, path);
            }
        }
    }

    fn close(&self) {
        self.remotes.write().expect("lock poisoned").clear();
    }
}
