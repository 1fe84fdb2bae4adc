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

//! Configuration of the path subsystem.

use std::{net::SocketAddr, time::Duration};

use serde::{Deserialize, Serialize};

/// Configuration for the [`PathSubsystem`](crate::subsystem::PathSubsystem).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PathSubsystemConfig {
    /// Minimum duration between two queries for the same destination.
    pub refresh_min_interval: Duration,
    /// Regular interval between two refresh rounds.
    pub refresh_interval: Duration,
    /// Paths are refreshed this long before they expire.
    pub refresh_lead_time: Duration,
    /// Old paths are kept on refresh only if they are valid for at least this long.
    pub prune_lead_time: Duration,
    /// Upper bound (exclusive, whole seconds) of the random jitter added to expiry based wakeups.
    pub refresh_jitter: Duration,
    /// Down notifications closer than this are considered to be the same event.
    pub down_notification_timeout: Duration,
    /// Capacity of the down notification queue.
    pub down_notification_channel_capacity: usize,
    /// Number of latency samples kept per path and destination.
    pub latency_samples: usize,
    /// Number of reply paths remembered per remote.
    pub max_reply_paths: usize,
    /// Pool entries without subscribers are evicted after this idle period.
    pub pool_idle_timeout: Duration,
    /// Reply paths of remotes not heard from for this long are evicted.
    pub reply_remote_idle_timeout: Duration,
    /// Maximum number of remotes tracked by a reply selector.
    pub max_reply_remotes: usize,
}

impl Default for PathSubsystemConfig {
    fn default() -> Self {
        PathSubsystemConfig {
            refresh_min_interval: Duration::from_secs(10),
            refresh_interval: Duration::from_secs(60 * 5), // 5 minutes
            refresh_lead_time: Duration::from_secs(60 * 2), // 2 minutes
            prune_lead_time: Duration::from_secs(10),
            refresh_jitter: Duration::from_secs(10),
            down_notification_timeout: Duration::from_secs(10),
            down_notification_channel_capacity: 8,
            latency_samples: 4,
            max_reply_paths: 4,
            pool_idle_timeout: Duration::from_secs(60 * 30), // 30 minutes
            reply_remote_idle_timeout: Duration::from_secs(60 * 10), // 10 minutes
            max_reply_remotes: 1024,
        }
    }
}

impl PathSubsystemConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.refresh_min_interval > self.refresh_interval {
            return Err("refresh_min_interval must be smaller than refresh_interval");
        }

        if self.refresh_min_interval > self.refresh_lead_time {
            // Paths could expire before they can be refreshed.
            return Err("refresh_min_interval must be smaller than refresh_lead_time");
        }

        if self.down_notification_channel_capacity == 0 {
            return Err("down_notification_channel_capacity must be positive");
        }

        if self.latency_samples == 0 {
            return Err("latency_samples must be positive");
        }

        if self.max_reply_paths == 0 || self.max_reply_remotes == 0 {
            return Err("reply selector capacities must be positive");
        }

        Ok(())
    }
}

/// Configuration of the [`PingingSelector`](crate::selector::pinging::PingingSelector).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PingingSelectorConfig {
    /// Interval between two probing rounds.
    pub interval: Duration,
    /// Probes not answered within this duration are considered lost.
    pub timeout: Duration,
}

impl Default for PingingSelectorConfig {
    fn default() -> Self {
        PingingSelectorConfig {
            interval: Duration::from_secs(1),
            timeout: Duration::from_millis(500),
        }
    }
}

impl PingingSelectorConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.timeout.is_zero() {
            return Err("timeout must be positive");
        }

        if self.timeout >= self.interval {
            return Err("timeout must be smaller than interval");
        }

        Ok(())
    }
}

/// Location of the control plane service answering path queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    /// Address of the SCION daemon.
    pub daemon_address: SocketAddr,
}

impl ControlPlaneConfig {
    /// Environment variable overriding the daemon address.
    pub const DAEMON_ADDRESS_ENV: &'static str = "SCION_DAEMON_ADDRESS";
    /// Daemon address used if the environment does not specify one.
    pub const DEFAULT_DAEMON_ADDRESS: SocketAddr = SocketAddr::V4(std::net::SocketAddrV4::new(
        std::net::Ipv4Addr::LOCALHOST,
        30255,
    ));

    /// Reads the configuration from the environment.
    ///
    /// Falls back to the default daemon address if the variable is unset. A malformed value is an
    /// error.
    pub fn from_env() -> Result<Self, &'static str> {
        Self::from_env_value(std::env::var(Self::DAEMON_ADDRESS_ENV).ok().as_deref())
    }

    fn from_env_value(value: Option<&str>) -> Result<Self, &'static str> {
        let daemon_address = match value {
            Some(addr) if !addr.trim().is_empty() => {
                addr.trim()
                    .parse()
                    .or(Err("SCION_DAEMON_ADDRESS is not a valid socket address"))?
            }
            _ => Self::DEFAULT_DAEMON_ADDRESS,
        };
        Ok(Self { daemon_address })
    }
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            daemon_address: Self::DEFAULT_DAEMON_ADDRESS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_should_be_valid() {
        PathSubsystemConfig::default().validate().unwrap();
        PingingSelectorConfig::default().validate().unwrap();
    }

    #[test]
    fn should_reject_min_interval_above_lead_time() {
        let cfg = PathSubsystemConfig {
            refresh_min_interval: Duration::from_secs(200),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn should_reject_zero_capacity() {
        let cfg = PathSubsystemConfig {
            down_notification_channel_capacity: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn should_reject_timeout_not_below_interval() {
        let cfg = PingingSelectorConfig {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(1),
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn should_read_daemon_address_override() {
        assert_eq!(
            ControlPlaneConfig::from_env_value(None).unwrap(),
            ControlPlaneConfig::default()
        );
        assert_eq!(
            ControlPlaneConfig::from_env_value(Some("10.1.1.1:30255"))
                .unwrap()
                .daemon_address,
            "10.1.1.1:30255".parse().unwrap()
        );
        assert!(ControlPlaneConfig::from_env_value(Some("nonsense")).is_err());
    }
}
