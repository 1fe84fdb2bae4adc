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

//! In-memory control plane and sockets for the integration tests.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

use bytes::Bytes;
use futures::future::BoxFuture;
use scion_pan::{
    address::{IsdAsn, UdpAddr},
    conn::{ConnError, OutgoingDatagram, RawConn, ReceivedDatagram, ReversePathError},
    path::{
        ForwardingPath, IfId, Path, PathInterface,
        metadata::PathMetadata,
        pool::traits::{PathQuerier, PathQueryError},
    },
};
use tokio::sync::mpsc;

pub fn ia(s: &str) -> IsdAsn {
    s.parse().unwrap()
}

pub fn local_ia() -> IsdAsn {
    ia("1-ff00:0:110")
}

pub fn remote_ia() -> IsdAsn {
    ia("1-ff00:0:112")
}

pub fn addr(ia: IsdAsn, host: &str, port: u16) -> UdpAddr {
    UdpAddr::new(ia, host.parse().unwrap(), port)
}

/// A path from [`local_ia`] to [`remote_ia`] over one transit AS per interface pair.
pub fn path(ifids: &[IfId]) -> Path {
    let n = ifids.len();
    let interfaces = ifids
        .iter()
        .enumerate()
        .map(|(i, ifid)| {
            let ia = match i {
                0 => local_ia(),
                i if i == n - 1 => remote_ia(),
                i => ia(&format!("1-ff00:1:{:x}", (i + 1) / 2)),
            };
            PathInterface::new(ia, *ifid)
        })
        .collect();
    Path::new(
        local_ia(),
        remote_ia(),
        ForwardingPath::new(
            Bytes::from(format!("{ifids:?}")),
            Some("10.0.0.1:31000".parse().unwrap()),
        ),
        PathMetadata {
            interfaces,
            ..Default::default()
        },
        SystemTime::now() + Duration::from_secs(3600),
    )
}

/// Control plane answering with fixed paths and counting the queries.
#[derive(Default)]
pub struct StaticQuerier {
    paths: Mutex<HashMap<IsdAsn, Vec<Path>>>,
    queries: Mutex<Vec<IsdAsn>>,
}

impl StaticQuerier {
    pub fn new(dst: IsdAsn, paths: Vec<Path>) -> Arc<Self> {
        let querier = Self::default();
        querier.paths.lock().unwrap().insert(dst, paths);
        Arc::new(querier)
    }

    pub fn queries(&self) -> Vec<IsdAsn> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl PathQuerier for StaticQuerier {
    async fn query_paths(&self, dst: IsdAsn) -> Result<Vec<Path>, PathQueryError> {
        self.queries.lock().unwrap().push(dst);
        Ok(self
            .paths
            .lock()
            .unwrap()
            .get(&dst)
            .cloned()
            .unwrap_or_default())
    }
}

/// A sent datagram.
#[derive(Debug, Clone)]
pub struct Sent {
    pub destination: UdpAddr,
    pub path: ForwardingPath,
    pub payload: Vec<u8>,
}

/// Socket recording sent datagrams. Received datagrams are injected through a channel.
pub struct TestRawConn {
    local: UdpAddr,
    sent: Mutex<Vec<Sent>>,
    incoming_tx: mpsc::UnboundedSender<(UdpAddr, Vec<u8>)>,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(UdpAddr, Vec<u8>)>>,
}

impl TestRawConn {
    pub fn new(local: UdpAddr) -> Arc<Self> {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            local,
            sent: Mutex::new(Vec::new()),
            incoming_tx,
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
        })
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn inject(&self, source: UdpAddr, payload: &[u8]) {
        self.incoming_tx.send((source, payload.to_vec())).unwrap();
    }
}

impl RawConn for TestRawConn {
    fn send_to<'a>(
        &'a self,
        datagram: OutgoingDatagram<'a>,
    ) -> BoxFuture<'a, Result<(), ConnError>> {
        Box::pin(async move {
            self.sent.lock().unwrap().push(Sent {
                destination: datagram.destination,
                path: datagram.path,
                payload: datagram.payload.to_vec(),
            });
            Ok(())
        })
    }

    fn recv_from<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> BoxFuture<'a, Result<ReceivedDatagram, ConnError>> {
        Box::pin(async move {
            let (source, payload) = self
                .incoming_rx
                .lock()
                .await
                .recv()
                .await
                .ok_or(ConnError::Closed)?;
            let len = payload.len().min(buf.len());
            buf[..len].copy_from_slice(&payload[..len]);
            Ok(ReceivedDatagram {
                len,
                source,
                path: ForwardingPath::default(),
            })
        })
    }

    fn reverse_path(
        &self,
        _remote: IsdAsn,
        _local: IsdAsn,
        _path: &ForwardingPath,
    ) -> Result<Option<Path>, ReversePathError> {
        Ok(None)
    }

    fn local_addr(&self) -> UdpAddr {
        self.local
    }

    fn close(&self) {}
}
