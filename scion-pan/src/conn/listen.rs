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

//! Connections answering arbitrary remotes.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use super::{ConnError, NetAddr, RawConn, write_msg};
use crate::{
    address::UdpAddr,
    path::{
        NoPathError, Path, PathFingerprint, PathInterface,
        stats::{PathDownNotifyee, PathStatsDb},
    },
    reply_selector::ReplySelector,
};

/// Forwards down notifications to a reply selector.
struct ReplyPathDownNotifyee(Arc<dyn ReplySelector>);

impl PathDownNotifyee for ReplyPathDownNotifyee {
    fn path_down(&self, fingerprint: &PathFingerprint, interface: PathInterface) {
        self.0.path_down(fingerprint, interface);
    }
}

/// A connection receiving from and replying to any remote.
///
/// Replies go over the paths chosen by the [`ReplySelector`], which learns the paths from
/// received packets.
pub struct ListenConn {
    raw: Arc<dyn RawConn>,
    local: UdpAddr,
    selector: Arc<dyn ReplySelector>,
    stats: Arc<PathStatsDb>,
    notifyee: Arc<dyn PathDownNotifyee>,
    closed: AtomicBool,
}

impl ListenConn {
    pub(crate) fn open(
        stats: Arc<PathStatsDb>,
        raw: Arc<dyn RawConn>,
        selector: Arc<dyn ReplySelector>,
    ) -> Self {
        let notifyee: Arc<dyn PathDownNotifyee> =
            Arc::new(ReplyPathDownNotifyee(selector.clone()));
        stats.register(notifyee.clone());
        Self {
            local: raw.local_addr(),
            raw,
            selector,
            stats,
            notifyee,
            closed: AtomicBool::new(false),
        }
    }

    /// Sends `payload` to `dst` over the path chosen by the reply selector.
    pub async fn write_to(&self, payload: &[u8], dst: &NetAddr) -> Result<usize, ConnError> {
        let dst = match dst {
            NetAddr::Scion(dst) => *dst,
            NetAddr::Ip(addr) => {
                return Err(ConnError::BadDestinationAddress(
                    format!("{addr} is not a SCION address").into(),
                ));
            }
        };
        if self.local.ia == dst.ia {
            return self.write_to_via(payload, dst, None).await;
        }
        let path = self
            .selector
            .reply_path(&dst)
            .ok_or(NoPathError { destination: dst.ia })?;
        self.write_to_via(payload, dst, Some(&*path)).await
    }

    /// Sends `payload` to `dst` over the given path, bypassing the reply selector.
    pub async fn write_to_via(
        &self,
        payload: &[u8],
        dst: UdpAddr,
        path: Option<&Path>,
    ) -> Result<usize, ConnError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnError::Closed);
        }
        write_msg(self.raw.as_ref(), self.local, dst, path, payload).await
    }

    /// Receives the next packet and returns its length and sender.
    pub async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, UdpAddr), ConnError> {
        let (n, source, _) = self.read_from_via(buf).await?;
        Ok((n, source))
    }

    /// Like [`read_from`](Self::read_from), but also returns the path back to the sender. `None`
    /// if the sender is in the local AS.
    ///
    /// The path is recorded with the reply selector. Packets whose path cannot be reversed are
    /// dropped.
    pub async fn read_from_via(
        &self,
        buf: &mut [u8],
    ) -> Result<(usize, UdpAddr, Option<Arc<Path>>), ConnError> {
        loop {
            let datagram = self.raw.recv_from(buf).await?;
            let path = match self
                .raw
                .reverse_path(datagram.source.ia, self.local.ia, &datagram.path)
            {
                Ok(path) => path.map(Arc::new),
                Err(error) => {
                    tracing::debug!(source = %datagram.source, %error, "Dropping packet with invalid path");
                    continue;
                }
            };
            if let Some(path) = &path {
                self.selector.record(datagram.source, path.clone());
            }
            return Ok((datagram.len, datagram.source, path));
        }
    }

    /// Returns the local address.
    pub fn local_addr(&self) -> UdpAddr {
        self.local
    }

    /// Stops down notifications, closes the reply selector and the underlying socket.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stats.unregister(&self.notifyee);
        self.selector.close();
        self.raw.close();
    }
}

impl Drop for ListenConn {
    fn drop(&mut self) {
        self.close();
    }
}
