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

//! Hop predicates, the building block of ACL and sequence policies.

use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use super::ParsePolicyError;
use crate::{
    address::{Asn, Isd, IsdAsn},
    path::{IfId, Path, PathInterface},
};

/// Predicate on a hop of a path.
///
/// String format, where 0 is the wildcard for every field:
/// - "1"          - ISD 1
/// - "1-ff00:0:1" - AS 1-ff00:0:1
/// - "1-ff00:0:1#3"   - either interface of the hop is 3
/// - "1-ff00:0:1#3,4" - ingress interface 3 and egress interface 4
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HopPredicate {
    /// ISD to match.
    pub isd: Isd,
    /// AS number to match.
    pub asn: Asn,
    /// Interfaces to match.
    pub interfaces: InterfacesPredicate,
}

impl HopPredicate {
    /// The predicate matching every hop.
    pub const WILDCARD: Self = Self::new(Isd::WILDCARD, Asn::WILDCARD, InterfacesPredicate::Any);

    /// Creates a new hop predicate.
    pub const fn new(isd: Isd, asn: Asn, interfaces: InterfacesPredicate) -> Self {
        Self {
            isd,
            asn,
            interfaces,
        }
    }

    /// Returns true if the predicate matches every hop.
    pub fn is_wildcard(&self) -> bool {
        self.isd.is_wildcard() && self.asn.is_wildcard() && self.interfaces.is_wildcard()
    }

    fn matches_ia(&self, ia: IsdAsn) -> bool {
        (self.isd.is_wildcard() || self.isd == ia.isd())
            && (self.asn.is_wildcard() || self.asn == ia.asn())
    }

    /// Matches a hop with its ingress and egress interface.
    pub fn matches_hop(&self, hop: &PolicyHop) -> bool {
        self.matches_ia(hop.ia) && self.interfaces.matches(hop.ingress, hop.egress)
    }

    /// Matches a single interface of a path.
    ///
    /// A predicate with two interfaces checks `interface` against its ingress interface if
    /// `ingress` is set and against its egress interface otherwise.
    pub fn matches_interface(&self, interface: &PathInterface, ingress: bool) -> bool {
        if !self.matches_ia(interface.ia) {
            return false;
        }
        let expected = match self.interfaces {
            InterfacesPredicate::Any => return true,
            InterfacesPredicate::Either(ifid) => ifid,
            InterfacesPredicate::Both {
                ingress: ingress_ifid,
                egress: egress_ifid,
            } => {
                if ingress {
                    ingress_ifid
                } else {
                    egress_ifid
                }
            }
        };
        ifid_matches(expected, interface.ifid)
    }

    /// Parses a predicate, reporting errors relative to the start of `s`.
    pub fn parse(s: &str) -> Result<Self, ParsePolicyError> {
        let invalid = |msg: &str| {
            ParsePolicyError::new((0, s.len()), format!("{msg} in hop predicate '{s}'"))
        };

        let (isd, rest) = match s.split_once('-') {
            Some((isd, rest)) => (isd, Some(rest)),
            None => (s, None),
        };
        let isd = Isd::from_str(isd).map_err(|_| invalid("invalid ISD"))?;
        let Some(rest) = rest else {
            return Ok(Self::new(isd, Asn::WILDCARD, InterfacesPredicate::Any));
        };

        let (asn, interfaces) = match rest.split_once('#') {
            Some((asn, interfaces)) => (asn, Some(interfaces)),
            None => (rest, None),
        };
        let asn = Asn::from_str(asn).map_err(|_| invalid("invalid AS number"))?;
        let interfaces = match interfaces {
            None => InterfacesPredicate::Any,
            Some(interfaces) => {
                let parse_ifid =
                    |i: &str| IfId::from_str(i).map_err(|_| invalid("invalid interface ID"));
                match interfaces.split_once(',') {
                    None => InterfacesPredicate::Either(parse_ifid(interfaces)?),
                    Some((ingress, egress)) => InterfacesPredicate::Both {
                        ingress: parse_ifid(ingress)?,
                        egress: parse_ifid(egress)?,
                    },
                }
            }
        };

        if asn.is_wildcard() && !interfaces.is_wildcard() {
            return Err(invalid("interface ID without AS number"));
        }
        Ok(Self::new(isd, asn, interfaces))
    }
}

impl FromStr for HopPredicate {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Display for HopPredicate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.isd)?;
        if self.asn.is_wildcard() && self.interfaces.is_wildcard() {
            return Ok(());
        }
        write!(f, "-{}", self.asn)?;
        match self.interfaces {
            InterfacesPredicate::Any => Ok(()),
            InterfacesPredicate::Either(ifid) => write!(f, "#{ifid}"),
            InterfacesPredicate::Both { ingress, egress } => write!(f, "#{ingress},{egress}"),
        }
    }
}

/// Predicate on the interfaces of a hop. Interface ID 0 is the wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfacesPredicate {
    /// Any interfaces.
    Any,
    /// The ingress or the egress interface matches.
    Either(IfId),
    /// Both interfaces match.
    Both {
        /// Ingress interface ID.
        ingress: IfId,
        /// Egress interface ID.
        egress: IfId,
    },
}

impl InterfacesPredicate {
    /// Returns true if the predicate matches the given interfaces of a hop.
    pub fn matches(&self, ingress: IfId, egress: IfId) -> bool {
        match *self {
            InterfacesPredicate::Any => true,
            InterfacesPredicate::Either(ifid) => {
                ifid_matches(ifid, ingress) || ifid_matches(ifid, egress)
            }
            InterfacesPredicate::Both {
                ingress: expected_ingress,
                egress: expected_egress,
            } => ifid_matches(expected_ingress, ingress) && ifid_matches(expected_egress, egress),
        }
    }

    /// Returns true if the predicate matches any interfaces.
    pub fn is_wildcard(&self) -> bool {
        match *self {
            InterfacesPredicate::Any => true,
            InterfacesPredicate::Either(ifid) => ifid == 0,
            InterfacesPredicate::Both { ingress, egress } => ingress == 0 && egress == 0,
        }
    }
}

fn ifid_matches(expected: IfId, actual: IfId) -> bool {
    expected == 0 || expected == actual
}

/// A hop of a path: the AS it traverses with the interfaces it enters and leaves through.
///
/// The first hop has no ingress and the last hop no egress interface, both are set to 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyHop {
    /// The traversed AS.
    pub ia: IsdAsn,
    /// Interface the path enters the AS through.
    pub ingress: IfId,
    /// Interface the path leaves the AS through.
    pub egress: IfId,
}

impl PolicyHop {
    /// Derives the hops of a path from its interfaces.
    ///
    /// Returns `None` if the path has no metadata or the interfaces do not come in pairs.
    pub fn hops_from_path(path: &Path) -> Option<Vec<PolicyHop>> {
        let interfaces = &path.metadata.as_ref()?.interfaces;
        if interfaces.is_empty() {
            return Some(vec![]);
        }
        if interfaces.len() % 2 != 0 {
            return None;
        }

        let (first, last) = (interfaces.first()?, interfaces.last()?);
        let mut hops = Vec::with_capacity(interfaces.len() / 2 + 1);
        hops.push(PolicyHop {
            ia: first.ia,
            ingress: 0,
            egress: first.ifid,
        });
        for pair in interfaces[1..interfaces.len() - 1].chunks_exact(2) {
            hops.push(PolicyHop {
                ia: pair[0].ia,
                ingress: pair[0].ifid,
                egress: pair[1].ifid,
            });
        }
        hops.push(PolicyHop {
            ia: last.ia,
            ingress: last.ifid,
            egress: 0,
        });
        Some(hops)
    }
}
