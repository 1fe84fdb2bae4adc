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

//! SCION paths and the machinery keeping them fresh and alive.
//!
//! A [`Path`] is immutable once created and shared as `Arc<Path>`. Paths are identified by their
//! [`PathFingerprint`], derived from the sequence of interface IDs they traverse.

use std::{
    fmt::{Display, Formatter},
    net::SocketAddr,
    sync::Arc,
    time::SystemTime,
};

use bytes::Bytes;

use crate::address::IsdAsn;

/// Path metadata and the partial orders defined on it.
pub mod metadata;
/// Per destination path cache.
pub mod pool;
/// Background refresh of subscribed destinations.
pub mod refresher;
/// Path liveness and latency statistics.
pub mod stats;

pub use metadata::PathMetadata;

/// Identifier of an interface of an AS.
pub type IfId = u64;

/// An interface of an AS on a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathInterface {
    /// The AS owning the interface.
    pub ia: IsdAsn,
    /// The interface ID, local to the AS.
    pub ifid: IfId,
}

impl PathInterface {
    /// Creates a new path interface.
    pub const fn new(ia: IsdAsn, ifid: IfId) -> Self {
        Self { ia, ifid }
    }
}

impl Display for PathInterface {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.ia, self.ifid)
    }
}

/// Opaque identifier of a path, derived from the interface IDs along the path.
///
/// The same fingerprint can identify different paths if they start in different ASes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PathFingerprint(Arc<str>);

impl PathFingerprint {
    /// Builds the fingerprint of a sequence of interface IDs, in order of traversal.
    pub fn from_interface_ids(ifids: impl IntoIterator<Item = IfId>) -> Self {
        let mut fingerprint = String::new();
        for (i, ifid) in ifids.into_iter().enumerate() {
            if i > 0 {
                fingerprint.push(' ');
            }
            fingerprint.push_str(&ifid.to_string());
        }
        Self(fingerprint.into())
    }

    /// Builds the fingerprint of the reverse of a sequence of interface IDs.
    pub fn reversed_from_interface_ids<I>(ifids: I) -> Self
    where
        I: IntoIterator<Item = IfId>,
        I::IntoIter: DoubleEndedIterator,
    {
        Self::from_interface_ids(ifids.into_iter().rev())
    }

    /// Returns the fingerprint as string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for the fingerprint of the empty path.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for PathFingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PathFingerprint {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

/// The data plane part of a path, as attached to packets.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ForwardingPath {
    /// Encoded data plane path. Empty for AS-local communication.
    pub dataplane: Bytes,
    /// The first hop router, if the packet leaves the local AS.
    pub underlay_next_hop: Option<SocketAddr>,
}

impl ForwardingPath {
    /// Creates a new forwarding path.
    pub fn new(dataplane: Bytes, underlay_next_hop: Option<SocketAddr>) -> Self {
        Self {
            dataplane,
            underlay_next_hop,
        }
    }

    /// Returns true for the empty path used within an AS.
    pub fn is_empty(&self) -> bool {
        self.dataplane.is_empty()
    }
}

/// A path between two ASes.
#[derive(Debug, Clone, PartialEq)]
pub struct Path {
    /// The AS the path starts in.
    pub source: IsdAsn,
    /// The AS the path ends in.
    pub destination: IsdAsn,
    /// The data plane path.
    pub forwarding_path: ForwardingPath,
    /// Supplementary information, not available for reverse paths.
    pub metadata: Option<PathMetadata>,
    /// Identifies the path by its interface sequence.
    pub fingerprint: PathFingerprint,
    /// The path is unusable after this instant.
    pub expiry: SystemTime,
}

impl Path {
    /// Creates a path with metadata. The fingerprint is derived from the metadata interfaces.
    pub fn new(
        source: IsdAsn,
        destination: IsdAsn,
        forwarding_path: ForwardingPath,
        metadata: PathMetadata,
        expiry: SystemTime,
    ) -> Self {
        let fingerprint =
            PathFingerprint::from_interface_ids(metadata.interfaces.iter().map(|i| i.ifid));
        Self {
            source,
            destination,
            forwarding_path,
            metadata: Some(metadata),
            fingerprint,
            expiry,
        }
    }

    /// Creates a path from a bare forwarding path, e.g. one extracted from a received packet.
    pub fn without_metadata(
        source: IsdAsn,
        destination: IsdAsn,
        forwarding_path: ForwardingPath,
        fingerprint: PathFingerprint,
        expiry: SystemTime,
    ) -> Self {
        Self {
            source,
            destination,
            forwarding_path,
            metadata: None,
            fingerprint,
            expiry,
        }
    }

    /// Returns the interfaces on the path. Empty if there is no metadata.
    pub fn interfaces(&self) -> &[PathInterface] {
        self.metadata
            .as_ref()
            .map(|m| m.interfaces.as_slice())
            .unwrap_or_default()
    }

    /// Returns true if the path traverses the interface.
    pub fn has_interface(&self, interface: &PathInterface) -> bool {
        self.interfaces().contains(interface)
    }
}

impl Display for Path {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.metadata {
            Some(metadata) => metadata.fmt_interfaces(f),
            None => {
                write!(
                    f,
                    "{} {} {}",
                    self.source, self.destination, self.fingerprint
                )
            }
        }
    }
}

/// Returns the fingerprints of the paths, in order.
pub fn fingerprints(paths: &[Arc<Path>]) -> Vec<PathFingerprint> {
    paths.iter().map(|p| p.fingerprint.clone()).collect()
}

/// There is no path to the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no path to {destination}")]
pub struct NoPathError {
    /// The unreachable destination.
    pub destination: IsdAsn,
}
