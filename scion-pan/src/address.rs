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

//! SCION addresses used by the path-aware sockets.
//!
//! - An [`IsdAsn`] globally identifies an AS and consists of an [`Isd`] and an [`Asn`].
//! - A [`ScionAddr`] is a host in an AS, used as key for per-destination statistics.
//! - A [`UdpAddr`] is a [`ScionAddr`] with a port, the address of a SCION/UDP end point.

use std::{
    fmt::{Display, Formatter},
    net::{IpAddr, SocketAddr},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

/// Errors returned when parsing addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AddressParseError {
    /// Invalid ISD identifier.
    #[error("invalid ISD identifier")]
    Isd,
    /// Invalid AS number.
    #[error("invalid AS number")]
    Asn,
    /// Invalid ISD-AS.
    #[error("invalid ISD-AS")]
    IsdAsn,
    /// Invalid UDP address.
    #[error("invalid SCION UDP address")]
    UdpAddr,
}

/// A 16-bit identifier of a SCION Isolation Domain. 0 is the wildcard.
#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Isd(pub u16);

impl Isd {
    /// The wildcard ISD.
    pub const WILDCARD: Self = Self(0);

    /// Returns true for the wildcard ISD.
    pub const fn is_wildcard(&self) -> bool {
        self.0 == Self::WILDCARD.0
    }

    /// Returns true if this ISD matches `other`, taking wildcards into account.
    pub const fn matches(&self, other: Isd) -> bool {
        self.is_wildcard() || other.is_wildcard() || self.0 == other.0
    }
}

impl Display for Isd {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Isd {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u16::from_str(s).map(Isd).or(Err(AddressParseError::Isd))
    }
}

/// A 48-bit SCION AS number. 0 is the wildcard.
///
/// AS numbers below 2^32 are formatted in decimal (BGP style), larger ones as three
/// colon-separated groups of hex digits, e.g. `ff00:0:110`.
#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Asn(pub u64);

impl Asn {
    /// The wildcard AS number.
    pub const WILDCARD: Self = Self(0);
    /// Maximum valid AS number.
    pub const MAX: Self = Self((1 << 48) - 1);

    const BGP_MAX: u64 = u32::MAX as u64;
    const GROUP_BITS: u32 = 16;

    /// Returns true for the wildcard AS number.
    pub const fn is_wildcard(&self) -> bool {
        self.0 == Self::WILDCARD.0
    }

    /// Returns true if this AS number matches `other`, taking wildcards into account.
    pub const fn matches(&self, other: Asn) -> bool {
        self.is_wildcard() || other.is_wildcard() || self.0 == other.0
    }
}

impl Display for Asn {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.0 <= Self::BGP_MAX {
            return write!(f, "{}", self.0);
        }
        let mask = (1u64 << Self::GROUP_BITS) - 1;
        write!(
            f,
            "{:x}:{:x}:{:x}",
            (self.0 >> (2 * Self::GROUP_BITS)) & mask,
            (self.0 >> Self::GROUP_BITS) & mask,
            self.0 & mask
        )
    }
}

impl FromStr for Asn {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !s.contains(':') {
            return match u64::from_str(s) {
                Ok(asn) if asn <= Self::BGP_MAX => Ok(Asn(asn)),
                _ => Err(AddressParseError::Asn),
            };
        }

        let mut asn = 0u64;
        let mut groups = 0;
        for group in s.split(':') {
            if group.is_empty() || group.len() > 4 {
                return Err(AddressParseError::Asn);
            }
            let value = u16::from_str_radix(group, 16).or(Err(AddressParseError::Asn))?;
            asn = (asn << Self::GROUP_BITS) | u64::from(value);
            groups += 1;
        }
        if groups != 3 {
            return Err(AddressParseError::Asn);
        }
        Ok(Asn(asn))
    }
}

/// The combined ISD and AS identifier of a SCION AS.
#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IsdAsn {
    isd: Isd,
    asn: Asn,
}

impl IsdAsn {
    /// The wildcard ISD-AS.
    pub const WILDCARD: Self = Self::new(Isd::WILDCARD, Asn::WILDCARD);

    /// Creates a new ISD-AS.
    pub const fn new(isd: Isd, asn: Asn) -> Self {
        Self { isd, asn }
    }

    /// Returns the ISD.
    pub const fn isd(&self) -> Isd {
        self.isd
    }

    /// Returns the AS number.
    pub const fn asn(&self) -> Asn {
        self.asn
    }
}

impl Display for IsdAsn {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.isd, self.asn)
    }
}

impl FromStr for IsdAsn {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (isd, asn) = s.split_once('-').ok_or(AddressParseError::IsdAsn)?;
        let asn = Asn::from_str(asn)?;
        if asn > Asn::MAX {
            return Err(AddressParseError::Asn);
        }
        Ok(Self::new(Isd::from_str(isd)?, asn))
    }
}

/// A SCION host address, i.e. an IP address within an AS.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ScionAddr {
    /// The AS of the host.
    pub ia: IsdAsn,
    /// The IP address of the host within the AS.
    pub ip: IpAddr,
}

impl ScionAddr {
    /// Creates a new SCION host address.
    pub const fn new(ia: IsdAsn, ip: IpAddr) -> Self {
        Self { ia, ip }
    }
}

impl Display for ScionAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{}", self.ia, self.ip)
    }
}

/// Address of a SCION/UDP end point.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct UdpAddr {
    /// The AS of the end point.
    pub ia: IsdAsn,
    /// The IP address within the AS.
    pub ip: IpAddr,
    /// The UDP port.
    pub port: u16,
}

impl UdpAddr {
    /// Creates a new SCION/UDP address.
    pub const fn new(ia: IsdAsn, ip: IpAddr, port: u16) -> Self {
        Self { ia, ip, port }
    }

    /// Returns the host part of this address.
    pub const fn scion_addr(&self) -> ScionAddr {
        ScionAddr::new(self.ia, self.ip)
    }

    /// Returns the AS-local socket address.
    pub const fn local_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl Display for UdpAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{}", self.ia, self.local_socket_addr())
    }
}

impl FromStr for UdpAddr {
    type Err = AddressParseError;

    /// Parses `"<isd>-<asn>,<ip>:<port>"`, IPv6 addresses in brackets.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ia, host) = s.split_once(',').ok_or(AddressParseError::UdpAddr)?;
        let ia = IsdAsn::from_str(ia)?;
        let host = SocketAddr::from_str(host).or(Err(AddressParseError::UdpAddr))?;
        Ok(Self::new(ia, host.ip(), host.port()))
    }
}
