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

//! Supplementary path information announced by the ASes on a path.
//!
//! The metadata is taken from signed path construction beacons, but its correctness is not
//! verified. Values of zero mean that the AS did not announce the value.

use std::{collections::HashSet, fmt::Formatter, time::Duration};

use crate::path::PathInterface;

/// Geographical position of a border router.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GeoCoordinates {
    /// Latitude in degrees.
    pub latitude: f32,
    /// Longitude in degrees.
    pub longitude: f32,
    /// Civic address.
    pub address: String,
}

/// Announced type of an inter-domain link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LinkType {
    /// Not announced.
    #[default]
    Unset,
    /// Direct physical connection.
    Direct,
    /// Connection with local routing or switching.
    MultiHop,
    /// Connection overlayed over the public internet.
    OpenNet,
}

/// Metadata of a path.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PathMetadata {
    /// Interfaces on the path, in order of traversal.
    pub interfaces: Vec<PathInterface>,
    /// Maximum transmission unit of the path, in bytes.
    pub mtu: u16,
    /// Entry i is the latency between interface i and i+1.
    pub latency: Vec<Duration>,
    /// Entry i is the bandwidth between interface i and i+1, in kbit/s.
    pub bandwidth: Vec<u64>,
    /// Entry i is the position of the router of interface i.
    pub geo: Vec<GeoCoordinates>,
    /// Entry i is the type of the link between interface 2i and 2i+1.
    pub link_type: Vec<LinkType>,
    /// Entry i is the number of AS internal hops between interface 2i+1 and 2i+2.
    pub internal_hops: Vec<u32>,
    /// Notes of the ASes on the path, in order.
    pub notes: Vec<String>,
}

/// A pair of consecutive interfaces.
type Hop = (PathInterface, PathInterface);

impl PathMetadata {
    /// Compares the latency of two paths.
    ///
    /// Returns `Some(true)` if `self` has strictly lower latency than `other`, `Some(false)` if it
    /// has equal or higher latency, and `None` if the paths cannot be compared because too many
    /// values are unknown.
    ///
    /// The latency between the end hosts and the first/last interface is never known and thus
    /// ignored.
    pub fn lower_latency(&self, other: &PathMetadata) -> Option<bool> {
        let (tot_a, unknown_a) = self.latency_sum();
        let (tot_b, unknown_b) = other.latency_sum();
        if tot_a < tot_b && unknown_a.is_subset(&unknown_b) {
            Some(true)
        } else if tot_a >= tot_b && unknown_b.is_subset(&unknown_a) {
            Some(false)
        } else {
            None
        }
    }

    /// Compares the bottleneck bandwidth of two paths.
    ///
    /// Returns `Some(true)` if `self` has strictly higher bandwidth than `other`, `Some(false)` if
    /// it has equal or lower bandwidth, and `None` if the paths cannot be compared.
    pub fn higher_bandwidth(&self, other: &PathMetadata) -> Option<bool> {
        let (min_a, unknown_a) = self.bandwidth_min();
        let (min_b, unknown_b) = other.bandwidth_min();
        if min_a > min_b && unknown_a.is_subset(&unknown_b) {
            Some(true)
        } else if min_a <= min_b && unknown_b.is_subset(&unknown_a) {
            Some(false)
        } else {
            None
        }
    }

    fn latency_sum(&self) -> (Duration, HashSet<Hop>) {
        let mut sum = Duration::ZERO;
        let mut unknown = HashSet::new();
        for (i, hop) in self.hops().enumerate() {
            match self.latency.get(i).copied().unwrap_or_default() {
                Duration::ZERO => {
                    unknown.insert(hop);
                }
                latency => sum = sum.saturating_add(latency),
            }
        }
        (sum, unknown)
    }

    fn bandwidth_min(&self) -> (u64, HashSet<Hop>) {
        let mut min = u64::MAX;
        let mut unknown = HashSet::new();
        for (i, hop) in self.hops().enumerate() {
            match self.bandwidth.get(i).copied().unwrap_or_default() {
                0 => {
                    unknown.insert(hop);
                }
                bandwidth => min = min.min(bandwidth),
            }
        }
        (min, unknown)
    }

    fn hops(&self) -> impl Iterator<Item = Hop> + '_ {
        self.interfaces.windows(2).map(|w| (w[0], w[1]))
    }

    /// Formats the interfaces as `"<ia> <if>><if> <ia> <if>>...<if> <ia>"`.
    pub(crate) fn fmt_interfaces(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let (Some(first), Some(last)) = (self.interfaces.first(), self.interfaces.last()) else {
            return Ok(());
        };
        write!(f, "{} {}", first.ia, first.ifid)?;
        let inner = self
            .interfaces
            .get(1..self.interfaces.len() - 1)
            .unwrap_or_default();
        for pair in inner.chunks_exact(2) {
            write!(f, ">{} {} {}", pair[0].ifid, pair[0].ia, pair[1].ifid)?;
        }
        write!(f, ">{} {}", last.ifid, last.ia)
    }
}
