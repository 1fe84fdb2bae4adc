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

//! Path policies filter and order the paths available to a connection.
//!
//! A policy receives the paths of the pool for one destination and returns the subset the
//! connection may use, most preferred first. Policies never query paths themselves and are
//! applied again whenever the paths of a destination are refreshed.
//!
//! ## Examples
//!
//! ```
//! use std::sync::Arc;
//!
//! use scion_pan::policy::{HighestMtu, LeastHops, Policy, PolicyChain, acl::Acl};
//!
//! // Avoid ISD 2, then prefer short paths, then large MTUs.
//! let policy = PolicyChain::new(vec![
//!     Arc::new("- 2 +".parse::<Acl>().unwrap()),
//!     Arc::new(HighestMtu),
//!     Arc::new(LeastHops),
//! ]);
//! assert!(policy.filter(vec![]).is_empty());
//! ```

use std::{borrow::Cow, fmt::Debug, sync::Arc};

use crate::path::{Path, PathFingerprint};

pub mod acl;
pub mod hop_predicate;
pub mod interactive;
pub mod sequence;
pub mod sort;

/// Filters and orders paths.
///
/// Implementations must not reorder paths they have no preference about, so that policies can be
/// chained.
pub trait Policy: Send + Sync {
    /// Returns the allowed subset of `paths`, most preferred first.
    fn filter(&self, paths: Vec<Arc<Path>>) -> Vec<Arc<Path>>;
}

/// Applies a list of policies one after the other.
#[derive(Clone, Default)]
pub struct PolicyChain(Vec<Arc<dyn Policy>>);

impl PolicyChain {
    /// Creates a chain. The first policy is applied first.
    pub fn new(policies: Vec<Arc<dyn Policy>>) -> Self {
        Self(policies)
    }
}

impl Policy for PolicyChain {
    fn filter(&self, paths: Vec<Arc<Path>>) -> Vec<Arc<Path>> {
        self.0
            .iter()
            .fold(paths, |paths, policy| policy.filter(paths))
    }
}

/// A policy defined by a closure.
pub struct PolicyFn<F>(pub F);

impl<F> Policy for PolicyFn<F>
where
    F: Fn(Vec<Arc<Path>>) -> Vec<Arc<Path>> + Send + Sync,
{
    fn filter(&self, paths: Vec<Arc<Path>>) -> Vec<Arc<Path>> {
        (self.0)(paths)
    }
}

/// Only allows the pinned paths, in the order in which they are pinned.
///
/// Pinned fingerprints without a matching path are skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pinned(pub Vec<PathFingerprint>);

impl Policy for Pinned {
    fn filter(&self, paths: Vec<Arc<Path>>) -> Vec<Arc<Path>> {
        self.0
            .iter()
            .filter_map(|fp| paths.iter().find(|p| &p.fingerprint == fp).cloned())
            .collect()
    }
}

/// Puts the paths selected by another policy first, followed by all other paths in their
/// original order.
pub struct Preferred {
    preferred: Arc<dyn Policy>,
}

impl Preferred {
    /// Prefers the output of `preferred`.
    pub fn new(preferred: Arc<dyn Policy>) -> Self {
        Self { preferred }
    }
}

impl Policy for Preferred {
    fn filter(&self, paths: Vec<Arc<Path>>) -> Vec<Arc<Path>> {
        let mut filtered = self.preferred.filter(paths.clone());
        let rest: Vec<_> = paths
            .into_iter()
            .filter(|p| !filtered.iter().any(|f| f.fingerprint == p.fingerprint))
            .collect();
        filtered.extend(rest);
        filtered
    }
}

/// Orders paths by ascending latency.
///
/// Paths whose latency cannot be compared keep their relative order.
#[derive(Debug, Clone, Copy, Default)]
pub struct LowestLatency;

impl Policy for LowestLatency {
    fn filter(&self, mut paths: Vec<Arc<Path>>) -> Vec<Arc<Path>> {
        sort::sort_stable_partial_order(&mut paths, |a, b| {
            a.metadata.as_ref()?.lower_latency(b.metadata.as_ref()?)
        });
        paths
    }
}

/// Orders paths by descending bandwidth.
///
/// Paths whose bandwidth cannot be compared keep their relative order.
#[derive(Debug, Clone, Copy, Default)]
pub struct HighestBandwidth;

impl Policy for HighestBandwidth {
    fn filter(&self, mut paths: Vec<Arc<Path>>) -> Vec<Arc<Path>> {
        sort::sort_stable_partial_order(&mut paths, |a, b| {
            a.metadata.as_ref()?.higher_bandwidth(b.metadata.as_ref()?)
        });
        paths
    }
}

/// Orders paths by ascending number of interfaces.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeastHops;

impl Policy for LeastHops {
    fn filter(&self, mut paths: Vec<Arc<Path>>) -> Vec<Arc<Path>> {
        paths.sort_by_key(|p| p.interfaces().len());
        paths
    }
}

/// Orders paths by descending MTU. Paths without metadata count as MTU 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct HighestMtu;

impl Policy for HighestMtu {
    fn filter(&self, mut paths: Vec<Arc<Path>>) -> Vec<Arc<Path>> {
        paths.sort_by_key(|p| std::cmp::Reverse(p.metadata.as_ref().map_or(0, |m| m.mtu)));
        paths
    }
}

/// Error returned when parsing a textual policy fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} (at {}..{})", span.0, span.1)]
pub struct ParsePolicyError {
    /// Byte range (start, end) of the offending input.
    pub span: (usize, usize),
    /// What went wrong.
    pub message: Cow<'static, str>,
}

impl ParsePolicyError {
    /// Creates a new error.
    pub fn new(span: (usize, usize), message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            span,
            message: message.into(),
        }
    }

    /// Moves the span by `offset` bytes, used when the failing input is a slice of a larger one.
    pub(crate) fn offset(mut self, offset: usize) -> Self {
        self.span = (self.span.0 + offset, self.span.1 + offset);
        self
    }

    /// Renders the error with the offending part of `input` underlined.
    ///
    /// `input` must be the string that was parsed.
    pub fn report(&self, input: &str) -> String {
        const CONTEXT: usize = 20;

        let start = floor_char_boundary(input, self.span.0.min(input.len()));
        let end = floor_char_boundary(input, self.span.1.min(input.len())).max(start);
        let from = floor_char_boundary(input, start.saturating_sub(CONTEXT));
        let to = floor_char_boundary(input, (end + CONTEXT).min(input.len()));

        let snippet = &input[from..to];
        let marker = format!(
            "{}{}",
            " ".repeat(input[from..start].chars().count()),
            "^".repeat(input[start..end].chars().count().max(1))
        );
        format!("{snippet}\n{marker}\n{}", self.message)
    }
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Splits `s` at whitespace, returning each word with its byte offset.
pub(crate) fn words(s: &str) -> Vec<(usize, &str)> {
    let mut words = Vec::new();
    let mut start = None;
    for (i, c) in s.char_indices() {
        match (c.is_whitespace(), start) {
            (true, Some(st)) => {
                words.push((st, &s[st..i]));
                start = None;
            }
            (false, None) => start = Some(i),
            _ => {}
        }
    }
    if let Some(st) = start {
        words.push((st, &s[st..]));
    }
    words
}
