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

//! # Path aware networking for SCION
//!
//! In SCION every packet carries the path it travels along. This crate provides UDP
//! connections that choose these paths, keep them fresh and switch away from paths that fail.
//!
//! - [`subsystem::PathSubsystem`] owns the state shared by all connections of a host: the
//!   [`path::pool::PathPool`] caching paths per destination AS, the
//!   [`path::refresher::PathRefresher`] keeping subscribed paths fresh and the
//!   [`path::stats::PathStatsDb`] tracking path failures and latencies.
//! - [`policy::Policy`] filters and orders the paths of a connection, e.g. by latency, through an
//!   [`policy::acl::Acl`] or a hop [`policy::sequence::Sequence`].
//! - [`selector::Selector`] picks the path of a dialed connection among the policy's result,
//!   [`reply_selector::ReplySelector`] picks reply paths of listening connections.
//! - [`conn::dial::DialedConn`] and [`conn::listen::ListenConn`] are the connections. They are
//!   built on a [`conn::RawConn`], which sends and receives the actual packets.
//!
//! Path lookup in the control plane is provided by a [`path::pool::traits::PathQuerier`].

pub mod address;
pub mod config;
pub mod conn;
pub mod path;
pub mod policy;
pub mod reply_selector;
pub mod selector;
pub mod subsystem;
pub mod types;
