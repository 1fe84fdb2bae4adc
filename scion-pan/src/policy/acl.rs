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

use std::{
    fmt::{Display, Formatter},
    str::FromStr,
    sync::Arc,
};

use super::{ParsePolicyError, Policy, hop_predicate::HopPredicate, words};
use crate::path::{Path, PathInterface};

/// Access control list policy.
///
/// Every interface of a path is checked against the entries in order. The first entry whose
/// predicate matches the interface decides, the default action applies if none does. A path is
/// allowed if all of its interfaces are allowed.
///
/// String format: `{action} {hop-predicate} ... {default-action}`, where the default may also be
/// written with a wildcard predicate.
///
/// ## Examples
///
/// ```
/// use scion_pan::policy::acl::Acl;
///
/// // Deny ISD 2, allow everything else.
/// let acl: Acl = "- 2 +".parse().unwrap();
/// // Deny interface 1 of 1-ff00:0:133, allow everything else.
/// let acl: Acl = "- 1-ff00:0:133#1 + 0".parse().unwrap();
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acl {
    entries: Vec<AclEntry>,
    default: AclAction,
}

impl Acl {
    /// Creates a list with the given entries, evaluated in order, and a default action.
    pub fn new(entries: Vec<AclEntry>, default: AclAction) -> Self {
        Self { entries, default }
    }

    /// Parses an ACL.
    pub fn parse(s: &str) -> Result<Self, ParsePolicyError> {
        let words = words(s);
        let Some(&(last_offset, last)) = words.last() else {
            return Err(ParsePolicyError::new((0, s.len()), "empty ACL"));
        };

        let mut entries = Vec::new();
        let mut default = None;
        let mut iter = words.iter().copied().peekable();
        while let Some((offset, word)) = iter.next() {
            let action = AclAction::parse(word).map_err(|e| e.offset(offset))?;
            let predicate = match iter.next() {
                Some((offset, word)) => {
                    HopPredicate::parse(word).map_err(|e| e.offset(offset))?
                }
                // A bare action is the default.
                None => HopPredicate::WILDCARD,
            };
            if predicate.is_wildcard() {
                if let Some(&(offset, word)) = iter.peek() {
                    return Err(ParsePolicyError::new(
                        (offset, offset + word.len()),
                        "the default entry must be the last one",
                    ));
                }
                default = Some(action);
            } else {
                entries.push(AclEntry::new(action, predicate));
            }
        }

        let default = default.ok_or_else(|| {
            ParsePolicyError::new(
                (last_offset, last_offset + last.len()),
                "missing default entry",
            )
        })?;
        Ok(Self { entries, default })
    }

    /// Returns true if the ACL allows every interface of the path.
    pub fn allows(&self, interfaces: &[PathInterface]) -> bool {
        interfaces
            .iter()
            .enumerate()
            .all(|(i, interface)| self.action(interface, i % 2 == 1) == AclAction::Allow)
    }

    fn action(&self, interface: &PathInterface, ingress: bool) -> AclAction {
        self.entries
            .iter()
            .find(|entry| entry.predicate.matches_interface(interface, ingress))
            .map_or(self.default, |entry| entry.action)
    }
}

impl FromStr for Acl {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Display for Acl {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for entry in &self.entries {
            write!(f, "{entry} ")?;
        }
        write!(f, "{}", self.default)
    }
}

impl Policy for Acl {
    fn filter(&self, paths: Vec<Arc<Path>>) -> Vec<Arc<Path>> {
        paths
            .into_iter()
            .filter(|p| self.allows(p.interfaces()))
            .collect()
    }
}

/// An entry of an [`Acl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AclEntry {
    /// Applied to interfaces matching the predicate.
    pub action: AclAction,
    /// Selects the interfaces the entry applies to.
    pub predicate: HopPredicate,
}

impl AclEntry {
    /// Creates a new entry.
    pub fn new(action: AclAction, predicate: HopPredicate) -> Self {
        Self { action, predicate }
    }
}

impl Display for AclEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.action, self.predicate)
    }
}

/// Allow or deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclAction {
    /// `+`
    Allow,
    /// `-`
    Deny,
}

impl AclAction {
    fn parse(s: &str) -> Result<Self, ParsePolicyError> {
        match s {
            "+" => Ok(AclAction::Allow),
            "-" => Ok(AclAction::Deny),
            _ => Err(ParsePolicyError::new(
                (0, s.len()),
                format!("expected '+' or '-', got '{s}'"),
            )),
        }
    }
}

impl Display for AclAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AclAction::Allow => f.write_str("+"),
            AclAction::Deny => f.write_str("-"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::test_helpers::*;

    mod parse {
        use super::*;

        #[test]
        fn should_parse_valid_acls() {
            for s in [
                "+",
                "- 1 +",
                "- 1 + 0",
                "- 1 + 0-0",
                "- 1 + 0-0#0,0",
                "- 2 - 3-ff00:0:1#1,2 +",
                "+ 1-ff00:0:110#1 -",
            ] {
                Acl::parse(s).unwrap_or_else(|e| panic!("should parse {s:?}: {e}"));
            }
        }

        #[test]
        fn should_reject_invalid_acls() {
            for s in ["", "  ", "- 1", "1", "+ +", "- 1 + -", "- 0 + 2 +", "* 1 +"] {
                assert!(Acl::parse(s).is_err(), "should not parse {s:?}");
            }
        }

        #[test]
        fn should_report_offending_word() {
            let err = Acl::parse("- 1 + 2-xyz +").unwrap_err();

            assert_eq!(err.span, (6, 11));
        }

        #[test]
        fn should_display_in_canonical_form() {
            let acl: Acl = "- 2  - 1-ff00:0:110#3  + 0".parse().unwrap();

            assert_eq!(acl.to_string(), "- 2 - 1-ff00:0:110#3 +");
        }
    }

    mod evaluate {
        use super::*;

        #[test]
        fn should_deny_paths_through_denied_as() {
            let acl: Acl = "- 1-ff00:1:1 +".parse().unwrap();
            let direct = simple_path(1);
            let via_transit = std::sync::Arc::new(path_with_ifids(&[1, 2, 3, 4], BASE_TIME));

            let filtered = acl.filter(vec![direct.clone(), via_transit]);

            assert_eq!(filtered, vec![direct]);
        }

        #[test]
        fn should_apply_first_matching_entry_per_interface() {
            // Interface 2 of the transit AS is allowed explicitly, the rest of it is denied.
            let acl: Acl = "+ 1-ff00:1:1#2 - 1-ff00:1:1 +".parse().unwrap();

            assert!(!acl.allows(path_with_ifids(&[1, 2, 3, 4], BASE_TIME).interfaces()));
            assert!(acl.allows(path_with_ifids(&[1, 2], BASE_TIME).interfaces()));
        }

        #[test]
        fn should_check_ingress_on_odd_interfaces() {
            // Interfaces 2 (ingress) and 3 (egress) are in the transit AS.
            let acl: Acl = "- 1-ff00:1:1#2,3 +".parse().unwrap();
            let path = path_with_ifids(&[1, 2, 3, 4], BASE_TIME);
            assert!(!acl.allows(path.interfaces()));

            let acl: Acl = "- 1-ff00:1:1#3,2 +".parse().unwrap();
            assert!(acl.allows(path.interfaces()));
        }

        #[test]
        fn should_allow_paths_without_interfaces() {
            let acl: Acl = "-".parse().unwrap();

            assert!(acl.allows(&[]));
            assert!(!acl.allows(simple_path(1).interfaces()));
        }
    }
}
