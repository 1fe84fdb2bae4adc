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

//! The path pool caches the paths to every destination AS that was asked for.
//!
//! Paths are only queried from the control plane if the cached ones are about to expire, and
//! never more often than once per `refresh_min_interval` for the same destination. The pool is
//! shared by all connections of a [`PathSubsystem`](crate::subsystem::PathSubsystem).

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock},
    time::SystemTime,
};

use crate::{
    address::IsdAsn,
    config::PathSubsystemConfig,
    path::{NoPathError, Path, PathFingerprint, pool::traits::PathQuerier},
};

/// Path querier traits and types.
pub mod traits {
    use std::borrow::Cow;

    use crate::{address::IsdAsn, path::Path};

    /// Looks up paths to a destination in the control plane.
    #[async_trait::async_trait]
    pub trait PathQuerier: Send + Sync + 'static {
        /// Queries all currently available paths from the local AS to `dst`.
        async fn query_paths(&self, dst: IsdAsn) -> Result<Vec<Path>, PathQueryError>;
    }

    /// Path query errors.
    #[derive(Debug, thiserror::Error)]
    pub enum PathQueryError {
        /// The control plane could not be reached or answered with an error.
        #[error("control plane query failed: {0}")]
        ControlPlane(Box<dyn std::error::Error + Send + Sync>),

        /// Non network related internal error.
        #[error("internal error: {0}")]
        InternalError(Cow<'static, str>),
    }
}

/// Errors returned when paths are requested from the pool.
#[derive(Debug, thiserror::Error)]
pub enum PathPoolError {
    /// The query succeeded but returned no path.
    #[error(transparent)]
    NoPath(#[from] NoPathError),
    /// The query failed.
    #[error(transparent)]
    Query(#[from] traits::PathQueryError),
}

/// Cached paths to one destination.
#[derive(Debug, Clone)]
pub struct PoolEntry {
    /// Time of the last query for this destination.
    pub last_query: SystemTime,
    /// Earliest expiry of all paths. `None` if there are no paths.
    pub earliest_expiry: Option<SystemTime>,
    /// The cached paths, most recently queried first.
    pub paths: Vec<Arc<Path>>,
}

impl PoolEntry {
    /// Merges freshly queried paths into the entry.
    ///
    /// The fresh paths come first, in query order. Old paths not contained in the fresh ones are
    /// appended in their previous order, unless they expire within `prune_lead_time`.
    fn update(&mut self, fresh: Vec<Arc<Path>>, now: SystemTime, config: &PathSubsystemConfig) {
        let retain_after = now + config.prune_lead_time;
        let fresh_fingerprints: HashSet<&PathFingerprint> =
            fresh.iter().map(|p| &p.fingerprint).collect();
        let retained: Vec<Arc<Path>> = self
            .paths
            .iter()
            .filter(|old| {
                !fresh_fingerprints.contains(&old.fingerprint) && old.expiry > retain_after
            })
            .cloned()
            .collect();

        let mut paths = fresh;
        paths.extend(retained);

        self.last_query = now;
        self.earliest_expiry = paths.iter().map(|p| p.expiry).min();
        self.paths = paths;
    }

    /// Returns true if the paths of this entry should be queried again.
    ///
    /// Paths are queried if at least `refresh_min_interval` passed since the last query and the
    /// earliest expiry is less than `refresh_lead_time` away. An entry without paths is queried
    /// again as soon as the minimum interval passed.
    pub fn should_query(&self, now: SystemTime, config: &PathSubsystemConfig) -> bool {
        let earliest_allowed = self.last_query + config.refresh_min_interval;
        let time_for_refresh = match self.earliest_expiry {
            Some(expiry) => {
                expiry
                    .checked_sub(config.refresh_lead_time)
                    .is_none_or(|t| now > t)
            }
            None => true,
        };
        now > earliest_allowed && time_for_refresh
    }
}

/// Per destination path cache.
pub struct PathPool {
    config: PathSubsystemConfig,
    querier: Arc<dyn PathQuerier>,
    entries: RwLock<HashMap<IsdAsn, PoolEntry>>,
}

impl PathPool {
    /// Creates a new, empty pool.
    pub fn new(config: PathSubsystemConfig, querier: Arc<dyn PathQuerier>) -> Self {
        Self {
            config,
            querier,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the paths to `dst`.
    ///
    /// Queries the paths unless they were queried recently and are not about to expire.
    pub async fn paths(
        &self,
        dst: IsdAsn,
        now: SystemTime,
    ) -> Result<Vec<Arc<Path>>, traits::PathQueryError> {
        {
            let entries = self.entries.read().expect("lock poisoned");
            if let Some(entry) = entries.get(&dst)
                && !entry.should_query(now, &self.config)
            {
                return Ok(entry.paths.clone());
            }
        }
        self.query_paths(dst, now).await
    }

    /// Queries the paths to `dst` unconditionally and merges them into the cache.
    ///
    /// Returns the freshly queried paths only.
    pub async fn query_paths(
        &self,
        dst: IsdAsn,
        now: SystemTime,
    ) -> Result<Vec<Arc<Path>>, traits::PathQueryError> {
        let fresh: Vec<Arc<Path>> = self
            .querier
            .query_paths(dst)
            .await?
            .into_iter()
            .map(Arc::new)
            .collect();
        tracing::debug!(%dst, n_paths = fresh.len(), "Queried paths");

        let mut entries = self.entries.write().expect("lock poisoned");
        entries
            .entry(dst)
            .or_insert_with(|| {
                PoolEntry {
                    last_query: now,
                    earliest_expiry: None,
                    paths: vec![],
                }
            })
            .update(fresh.clone(), now, &self.config);
        Ok(fresh)
    }

    /// Returns the cached paths to `dst`. Never queries.
    pub fn cached_paths(&self, dst: IsdAsn) -> Vec<Arc<Path>> {
        let entries = self.entries.read().expect("lock poisoned");
        entries
            .get(&dst)
            .map(|entry| entry.paths.clone())
            .unwrap_or_default()
    }

    /// Returns a snapshot of the entry for `dst`.
    pub fn entry(&self, dst: IsdAsn) -> Option<PoolEntry> {
        let entries = self.entries.read().expect("lock poisoned");
        entries.get(&dst).cloned()
    }

    /// Returns the earliest path expiry over all destinations.
    pub fn earliest_expiry(&self) -> Option<SystemTime> {
        let entries = self.entries.read().expect("lock poisoned");
        entries.values().filter_map(|e| e.earliest_expiry).min()
    }

    /// Removes the entries that were not queried for `pool_idle_timeout` and for which
    /// `in_use` returns false.
    pub(crate) fn evict_idle(&self, now: SystemTime, in_use: impl Fn(&IsdAsn) -> bool) {
        let mut entries = self.entries.write().expect("lock poisoned");
        entries.retain(|dst, entry| {
            let keep = in_use(dst) || now <= entry.last_query + self.config.pool_idle_timeout;
            if !keep {
                tracing::debug!(%dst, "Evicting idle path pool entry");
            }
            keep
        });
    }

    pub(crate) fn config(&self) -> &PathSubsystemConfig {
        &self.config
    }
}
