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

//! SCMP error handling.
//!
//! Interface down messages are turned into path down notifications of the
//! [`PathStatsDb`]. All other SCMP errors are reported back to the receiving connection as
//! [`ScmpError`].

use std::{
    fmt::{Display, Formatter},
    sync::Arc,
    time::SystemTime,
};

use crate::{
    address::{IsdAsn, ScionAddr},
    path::{IfId, PathFingerprint, PathInterface, stats::PathStatsDb},
};

/// SCMP error messages relevant to path aware connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScmpMessage {
    /// The destination could not be reached.
    DestinationUnreachable {
        /// Reason code.
        code: u8,
    },
    /// The packet exceeded the MTU of a link.
    PacketTooBig {
        /// MTU of the link.
        mtu: u16,
    },
    /// The packet could not be processed.
    ParameterProblem {
        /// Reason code.
        code: u8,
        /// Offset of the offending byte.
        pointer: u16,
    },
    /// An inter-AS link is down.
    ExternalInterfaceDown {
        /// The AS reporting the failure.
        ia: IsdAsn,
        /// The interface that is down.
        interface: IfId,
    },
    /// The connection between two interfaces of an AS is down.
    InternalConnectivityDown {
        /// The AS reporting the failure.
        ia: IsdAsn,
        /// Interface the packet entered the AS through.
        ingress: IfId,
        /// Interface the packet could not be forwarded to.
        egress: IfId,
    },
}

impl ScmpMessage {
    /// Returns the interface reported down, if the message reports one.
    pub fn down_interface(&self) -> Option<PathInterface> {
        match *self {
            ScmpMessage::ExternalInterfaceDown { ia, interface } => {
                Some(PathInterface::new(ia, interface))
            }
            ScmpMessage::InternalConnectivityDown { ia, egress, .. } => {
                Some(PathInterface::new(ia, egress))
            }
            _ => None,
        }
    }

    /// Returns true if the condition may resolve on its own, e.g. by switching paths.
    pub fn is_temporary(&self) -> bool {
        match self {
            ScmpMessage::DestinationUnreachable { .. }
            | ScmpMessage::PacketTooBig { .. }
            | ScmpMessage::ParameterProblem { .. } => false,
            ScmpMessage::ExternalInterfaceDown { .. }
            | ScmpMessage::InternalConnectivityDown { .. } => true,
        }
    }
}

impl Display for ScmpMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ScmpMessage::DestinationUnreachable { code } => {
                write!(f, "DestinationUnreachable(code={code})")
            }
            ScmpMessage::PacketTooBig { mtu } => write!(f, "PacketTooBig(mtu={mtu})"),
            ScmpMessage::ParameterProblem { code, pointer } => {
                write!(f, "ParameterProblem(code={code},pointer={pointer})")
            }
            ScmpMessage::ExternalInterfaceDown { ia, interface } => {
                write!(f, "ExternalInterfaceDown({ia}#{interface})")
            }
            ScmpMessage::InternalConnectivityDown {
                ia,
                ingress,
                egress,
            } => write!(f, "InternalConnectivityDown({ia}#{ingress},{egress})"),
        }
    }
}

/// A received SCMP error message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScmpNotification {
    /// The message.
    pub message: ScmpMessage,
    /// The sender of the message.
    pub source: ScionAddr,
    /// Interface IDs of the path the message arrived on, if it could be decoded.
    pub path_interfaces: Option<Vec<IfId>>,
}

/// An SCMP error reported to the caller of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("SCMP {message} from {sender}")]
pub struct ScmpError {
    /// The message.
    pub message: ScmpMessage,
    /// The sender of the message.
    pub sender: ScionAddr,
}

impl ScmpError {
    /// See [`ScmpMessage::is_temporary`].
    pub fn is_temporary(&self) -> bool {
        self.message.is_temporary()
    }
}

/// Turns interface down messages into path down notifications.
#[derive(Clone)]
pub struct ScmpDownHandler {
    stats: Arc<PathStatsDb>,
}

impl ScmpDownHandler {
    /// Creates a handler notifying the given database.
    pub fn new(stats: Arc<PathStatsDb>) -> Self {
        Self { stats }
    }

    /// Handles a received SCMP error.
    ///
    /// Interface down messages are recorded for the path they reference, which is the reverse
    /// of the path they arrived on. They are dropped if that path is unknown. All other messages
    /// are returned as error.
    pub fn handle(
        &self,
        notification: &ScmpNotification,
        now: SystemTime,
    ) -> Result<(), ScmpError> {
        let Some(interface) = notification.message.down_interface() else {
            return Err(ScmpError {
                message: notification.message,
                sender: notification.source,
            });
        };
        let Some(ifids) = &notification.path_interfaces else {
            tracing::debug!(message = %notification.message, "Dropping SCMP message without path");
            return Ok(());
        };

        let fingerprint = PathFingerprint::reversed_from_interface_ids(ifids.iter().copied());
        tracing::debug!(%fingerprint, %interface, "Received interface down message");
        self.stats.notify_path_down(fingerprint, interface, now);
        Ok(())
    }
}
