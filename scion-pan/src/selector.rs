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

//! Path selectors of dialed connections.
//!
//! A selector holds the filtered paths to a remote, ordered by preference, and picks the one
//! used for sending. It is kept up to date by the connection's path subscription, which calls
//! [`Selector::refresh`] with new path sets and [`Selector::path_down`] on failures.
//!
//! Implementations:
//! - [`DefaultSelector`]: the first path, failing over to the first more alive one.
//! - [`PingingSelector`](pinging::PingingSelector): the path with the lowest measured latency.
//! - [`BundledSelector`](bundle::BundledSelector): disjoint paths for a group of connections.

use std::sync::{Arc, Mutex};

#[cfg(test)]
use mockall::automock;

use crate::{
    address::UdpAddr,
    path::{Path, PathFingerprint, PathInterface, stats::PathStatsDb},
};

pub mod bundle;
pub mod pinging;

/// Chooses the path of a dialed connection.
#[cfg_attr(test, automock)]
pub trait Selector: Send + Sync + 'static {
    /// Sets the connection's end points and the initial paths, most preferred first.
    fn initialize(&self, local: UdpAddr, remote: UdpAddr, paths: Vec<Arc<Path>>);
    /// Replaces the paths.
    fn refresh(&self, paths: Vec<Arc<Path>>);
    /// Returns the path to use, `None` if there is none.
    fn path(&self) -> Option<Arc<Path>>;
    /// Reports that a path or an interface is down.
    fn path_down(&self, fingerprint: &PathFingerprint, interface: PathInterface);
    /// Releases the selector's resources.
    fn close(&self);
}

/// Returns true if the path is the one reported down, or traverses the interface reported down.
pub(crate) fn is_affected(
    path: &Path,
    fingerprint: &PathFingerprint,
    interface: &PathInterface,
) -> bool {
    path.fingerprint == *fingerprint || path.has_interface(interface)
}

pub(crate) fn position_of(paths: &[Arc<Path>], fingerprint: &PathFingerprint) -> Option<usize> {
    paths.iter().position(|p| p.fingerprint == *fingerprint)
}

#[derive(Default)]
struct SelectorState {
    paths: Vec<Arc<Path>>,
    current: usize,
}

impl SelectorState {
    fn current(&self) -> Option<&Arc<Path>> {
        self.paths.get(self.current)
    }
}

/// Uses the first path and sticks with it across refreshes while it is available.
///
/// When the current path goes down, the selector switches to the first path that is more alive
/// according to the [`PathStatsDb`]. If there is none, it keeps the current path.
pub struct DefaultSelector {
    stats: Arc<PathStatsDb>,
    state: Mutex<SelectorState>,
}

impl DefaultSelector {
    /// Creates a selector consulting the given statistics on failures.
    pub fn new(stats: Arc<PathStatsDb>) -> Self {
        Self {
            stats,
            state: Mutex::new(SelectorState::default()),
        }
    }
}

impl Selector for DefaultSelector {
    fn initialize(&self, _local: UdpAddr, _remote: UdpAddr, paths: Vec<Arc<Path>>) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.paths = paths;
        state.current = 0;
    }

    fn refresh(&self, paths: Vec<Arc<Path>>) {
        let mut state = self.state.lock().expect("lock poisoned");
        let current = state
            .current()
            .and_then(|current| position_of(&paths, &current.fingerprint))
            .unwrap_or(0);
        state.paths = paths;
        state.current = current;
    }

    fn path(&self) -> Option<Arc<Path>> {
        self.state.lock().expect("lock poisoned").current().cloned()
    }

    fn path_down(&self, fingerprint: &PathFingerprint, interface: PathInterface) {
        let mut state = self.state.lock().expect("lock poisoned");
        let Some(current) = state.current().cloned() else {
            return;
        };
        if !is_affected(&current, fingerprint, &interface) {
            return;
        }
        if let Some(better) = self.stats.first_more_alive(&current, &state.paths) {
            tracing::info!(
                from = %current.fingerprint,
                to = %state.paths[better].fingerprint,
                "Failing over to more alive path"
            );
            state.current = better;
        }
    }

    fn close(&self) {}
}
