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

//! Disjoint path selection for groups of connections.
//!
//! Selectors created from the same [`SelectorBundle`] avoid each other's paths. Each selector
//! picks the first path sharing the fewest interfaces with the paths currently used by the
//! other selectors of the bundle.
//!
//! Internal:
//!
//! A selector never holds its own lock while reading the other selectors' paths. Selections are
//! done in two phases: a [`Reselection`] is planned from a snapshot of the state, the usage of the
//! other selectors is computed without the lock, and the result is applied only if the state's
//! generation did not change in the meantime. Otherwise the selection is planned again from the
//! new state. New paths that do not contain the current one leave the selector with a placeholder
//! current path until a selection is applied.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
};

use super::{Selector, is_affected, position_of};
use crate::{
    address::UdpAddr,
    path::{Path, PathFingerprint, PathInterface, stats::PathStatsDb},
};

/// Number of uses of each interface by a set of paths.
#[derive(Debug, Clone, Default)]
pub struct BundlePathUsage {
    interfaces: HashMap<PathInterface, usize>,
}

impl BundlePathUsage {
    /// Counts the interfaces of `path`.
    pub fn add(&mut self, path: &Path) {
        for interface in path.interfaces() {
            *self.interfaces.entry(*interface).or_default() += 1;
        }
    }

    /// Returns the highest use count of any interface of `path`.
    pub fn overlap(&self, path: &Path) -> usize {
        path.interfaces()
            .iter()
            .filter_map(|i| self.interfaces.get(i).copied())
            .max()
            .unwrap_or(0)
    }

    /// Returns the index of the first path with the lowest overlap, 0 if `paths` is empty.
    pub fn first_max_disjoint(&self, paths: &[Arc<Path>]) -> usize {
        let mut best = 0;
        let mut best_overlap = usize::MAX;
        for (i, path) in paths.iter().enumerate() {
            let overlap = self.overlap(path);
            if overlap < best_overlap {
                best = i;
                best_overlap = overlap;
            }
        }
        best
    }
}

#[derive(Default)]
struct BundledState {
    paths: Vec<Arc<Path>>,
    current: usize,
    // Bumped on every change of `paths` or `current`.
    generation: u64,
    // `current` is a placeholder.
    needs_selection: bool,
}

impl BundledState {
    fn current(&self) -> Option<&Arc<Path>> {
        self.paths.get(self.current)
    }
}

struct BundleInner {
    stats: Arc<PathStatsDb>,
    selectors: Mutex<Vec<Weak<Mutex<BundledState>>>>,
}

impl BundleInner {
    fn usage(&self, except: &Arc<Mutex<BundledState>>) -> BundlePathUsage {
        let others: Vec<_> = {
            let selectors = self.selectors.lock().expect("lock poisoned");
            selectors
                .iter()
                .filter_map(Weak::upgrade)
                .filter(|s| !Arc::ptr_eq(s, except))
                .collect()
        };
        let mut usage = BundlePathUsage::default();
        for other in others {
            if let Some(path) = other.lock().expect("lock poisoned").current() {
                usage.add(path);
            }
        }
        usage
    }

    fn remove(&self, state: &Arc<Mutex<BundledState>>) {
        let mut selectors = self.selectors.lock().expect("lock poisoned");
        selectors
            .retain(|s| s.strong_count() > 0 && !std::ptr::eq(s.as_ptr(), Arc::as_ptr(state)));
    }
}

/// A group of selectors using paths as disjoint as possible.
#[derive(Clone)]
pub struct SelectorBundle {
    inner: Arc<BundleInner>,
}

impl SelectorBundle {
    /// Creates an empty bundle.
    pub fn new(stats: Arc<PathStatsDb>) -> Self {
        Self {
            inner: Arc::new(BundleInner {
                stats,
                selectors: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Creates a selector that is part of the bundle until it is closed or dropped.
    pub fn new_selector(&self) -> BundledSelector {
        let state = Arc::new(Mutex::new(BundledState::default()));
        self.inner
            .selectors
            .lock()
            .expect("lock poisoned")
            .push(Arc::downgrade(&state));
        BundledSelector {
            bundle: self.inner.clone(),
            state,
        }
    }

    /// Returns the number of selectors in the bundle.
    pub fn len(&self) -> usize {
        let selectors = self.inner.selectors.lock().expect("lock poisoned");
        selectors.iter().filter(|s| s.strong_count() > 0).count()
    }

    /// Returns true if the bundle has no selectors.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Selector of a [`SelectorBundle`].
pub struct BundledSelector {
    bundle: Arc<BundleInner>,
    state: Arc<Mutex<BundledState>>,
}

/// What triggers a selection.
#[derive(Debug, Clone, Copy)]
enum Trigger<'a> {
    /// New paths without the current one.
    NewPaths,
    /// A path or interface went down.
    Down(&'a PathFingerprint, PathInterface),
}

/// A selection planned from a snapshot of the state.
#[derive(Debug)]
struct Reselection {
    generation: u64,
    paths: Vec<Arc<Path>>,
    // Indices of the paths to choose from, all paths if empty.
    candidates: Vec<usize>,
}

impl BundledSelector {
    /// Replaces the paths, keeping the current one if requested and possible.
    fn set_paths(&self, paths: Vec<Arc<Path>>, keep_current: bool) {
        let mut state = self.state.lock().expect("lock poisoned");
        let kept = state
            .current()
            .filter(|_| keep_current && !state.needs_selection)
            .and_then(|current| position_of(&paths, &current.fingerprint));
        state.paths = paths;
        state.current = kept.unwrap_or(0);
        state.needs_selection = kept.is_none();
        state.generation += 1;
    }

    /// Plans a selection, `None` if the current path needs no change.
    fn plan(&self, trigger: Trigger<'_>) -> Option<Reselection> {
        let state = self.state.lock().expect("lock poisoned");
        let candidates = match trigger {
            Trigger::NewPaths => {
                if !state.needs_selection {
                    return None;
                }
                Vec::new()
            }
            Trigger::Down(fingerprint, interface) => {
                let current = state.current()?;
                if !is_affected(current, fingerprint, &interface) {
                    return None;
                }
                state
                    .paths
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| self.bundle.stats.is_more_alive(p, current))
                    .map(|(i, _)| i)
                    .collect()
            }
        };
        Some(Reselection {
            generation: state.generation,
            paths: state.paths.clone(),
            candidates,
        })
    }

    /// Applies a planned selection. Returns false if the state changed since it was planned.
    fn try_apply(&self, plan: &Reselection) -> bool {
        let usage = self.bundle.usage(&self.state);
        let selected = if plan.candidates.is_empty() {
            usage.first_max_disjoint(&plan.paths)
        } else {
            let subset: Vec<_> = plan.candidates.iter().map(|&i| plan.paths[i].clone()).collect();
            plan.candidates[usage.first_max_disjoint(&subset)]
        };

        let mut state = self.state.lock().expect("lock poisoned");
        if state.generation != plan.generation {
            return false;
        }
        state.current = selected;
        state.needs_selection = false;
        state.generation += 1;
        true
    }

    fn reselect(&self, trigger: Trigger<'_>) {
        while let Some(plan) = self.plan(trigger) {
            if self.try_apply(&plan) {
                return;
            }
            tracing::trace!("Path selection raced with an update, retrying");
        }
    }
}

impl Selector for BundledSelector {
    fn initialize(&self, _local: UdpAddr, _remote: UdpAddr, paths: Vec<Arc<Path>>) {
        self.set_paths(paths, false);
        self.reselect(Trigger::NewPaths);
    }

    fn refresh(&self, paths: Vec<Arc<Path>>) {
        self.set_paths(paths, true);
        self.reselect(Trigger::NewPaths);
    }

    fn path(&self) -> Option<Arc<Path>> {
        self.state.lock().expect("lock poisoned").current().cloned()
    }

    fn path_down(&self, fingerprint: &PathFingerprint, interface: PathInterface) {
        self.reselect(Trigger::Down(fingerprint, interface));
    }

    fn close(&self) {
        self.bundle.remove(&self.state);
    }
}

impl Drop for BundledSelector {
    fn drop(&mut self) {
        self.bundle.remove(&self.state);
    }
}
