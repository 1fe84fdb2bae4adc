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

//! Path aware UDP connections.
//!
//! A [`DialedConn`](dial::DialedConn) talks to a single remote and uses a
//! [`Selector`](crate::selector::Selector) to pick the path for every packet. A
//! [`ListenConn`](listen::ListenConn) answers arbitrary remotes over the paths their packets
//! arrived on, using a [`ReplySelector`](crate::reply_selector::ReplySelector).
//!
//! Both are built on a [`RawConn`], which sends and receives SCION UDP datagrams over a given
//! forwarding path. The packet encoding and the underlay are left to the `RawConn`
//! implementation.

use std::{
    borrow::Cow,
    fmt::{Display, Formatter},
    net::SocketAddr,
};

use futures::future::BoxFuture;

use crate::{
    address::{IsdAsn, UdpAddr},
    path::{ForwardingPath, NoPathError, Path},
};

pub mod dial;
pub mod listen;
pub mod scmp;
pub(crate) mod subscriber;

/// UDP port of the end host underlay, used for packets within the local AS.
pub const ENDHOST_PORT: u16 = 30041;

/// A UDP datagram to be sent.
#[derive(Debug, Clone)]
pub struct OutgoingDatagram<'a> {
    /// Sender address.
    pub source: UdpAddr,
    /// Receiver address.
    pub destination: UdpAddr,
    /// Forwarding path to attach, empty within the local AS.
    pub path: ForwardingPath,
    /// Underlay address the packet is sent to.
    pub next_hop: SocketAddr,
    /// UDP payload.
    pub payload: &'a [u8],
}

/// A received UDP datagram. The payload was copied into the receive buffer.
#[derive(Debug, Clone)]
pub struct ReceivedDatagram {
    /// Length of the payload.
    pub len: usize,
    /// Sender address.
    pub source: UdpAddr,
    /// The path the packet arrived on, not reversed.
    pub path: ForwardingPath,
}

/// Socket sending and receiving SCION UDP datagrams.
///
/// `recv_from` must be cancel safe. SCMP messages are not returned to the caller; they are
/// expected to be handed to the [`ScmpDownHandler`](scmp::ScmpDownHandler).
pub trait RawConn: Send + Sync + 'static {
    /// Sends a datagram.
    fn send_to<'a>(&'a self, datagram: OutgoingDatagram<'a>)
    -> BoxFuture<'a, Result<(), ConnError>>;

    /// Receives the next datagram into `buf`, truncating the payload if `buf` is too small.
    fn recv_from<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> BoxFuture<'a, Result<ReceivedDatagram, ConnError>>;

    /// Builds the path back to `remote` from the path a packet arrived on.
    ///
    /// Returns `None` if no path is needed, i.e. if `remote` is in `local`.
    fn reverse_path(
        &self,
        remote: IsdAsn,
        local: IsdAsn,
        path: &ForwardingPath,
    ) -> Result<Option<Path>, ReversePathError>;

    /// Returns the local address.
    fn local_addr(&self) -> UdpAddr;

    /// Closes the socket. Pending and later calls return [`ConnError::Closed`].
    fn close(&self);
}

/// A path could not be reversed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("cannot reverse path: {0}")]
pub struct ReversePathError(pub Cow<'static, str>);

/// Connection errors.
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    /// No path to the destination is available.
    #[error(transparent)]
    NoPath(#[from] NoPathError),
    /// The destination address cannot be used.
    #[error("bad destination address: {0}")]
    BadDestinationAddress(Cow<'static, str>),
    /// The destination is in another AS, but no usable path was given.
    #[error("missing path to {destination}")]
    MissingPath {
        /// The destination AS.
        destination: IsdAsn,
    },
    /// The path does not connect the source and destination AS.
    #[error("path {path_source} -> {path_destination} does not match {local} -> {destination}")]
    PathEndpointMismatch {
        /// The local AS.
        local: IsdAsn,
        /// The destination AS.
        destination: IsdAsn,
        /// Where the path starts.
        path_source: IsdAsn,
        /// Where the path ends.
        path_destination: IsdAsn,
    },
    /// The connection is closed.
    #[error("connection closed")]
    Closed,
    /// I/O error of the underlying socket.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Destination of a listening connection's write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetAddr {
    /// A SCION UDP address.
    Scion(UdpAddr),
    /// A plain IP socket address, which cannot be reached over SCION.
    Ip(SocketAddr),
}

impl From<UdpAddr> for NetAddr {
    fn from(value: UdpAddr) -> Self {
        NetAddr::Scion(value)
    }
}

impl From<SocketAddr> for NetAddr {
    fn from(value: SocketAddr) -> Self {
        NetAddr::Ip(value)
    }
}

impl Display for NetAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            NetAddr::Scion(addr) => write!(f, "{addr}"),
            NetAddr::Ip(addr) => write!(f, "{addr}"),
        }
    }
}

/// Sends `payload` from `local` to `destination`.
///
/// Within the local AS the packet goes straight to the end host port of the destination and
/// `path` is ignored. Otherwise `path` must lead from the local AS to the destination AS.
pub(crate) async fn write_msg(
    raw: &dyn RawConn,
    local: UdpAddr,
    destination: UdpAddr,
    path: Option<&Path>,
    payload: &[u8],
) -> Result<usize, ConnError> {
    let (path, next_hop) = if local.ia == destination.ia {
        (
            ForwardingPath::default(),
            SocketAddr::new(destination.ip, ENDHOST_PORT),
        )
    } else {
        let missing = || {
            ConnError::MissingPath {
                destination: destination.ia,
            }
        };
        let path = path.ok_or_else(missing)?;
        if path.source != local.ia || path.destination != destination.ia {
            return Err(ConnError::PathEndpointMismatch {
                local: local.ia,
                destination: destination.ia,
                path_source: path.source,
                path_destination: path.destination,
            });
        }
        let next_hop = path.forwarding_path.underlay_next_hop.ok_or_else(missing)?;
        (path.forwarding_path.clone(), next_hop)
    };

    raw.send_to(OutgoingDatagram {
        source: local,
        destination,
        path,
        next_hop,
        payload,
    })
    .await?;
    Ok(payload.len())
}
