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

//! Sequence policy: a regular expression over the hops of a path.
//!
//! A sequence is made of hop predicates, combined with:
//! - concatenation (whitespace): the hops must follow each other,
//! - `|`: either side matches, binds weaker than concatenation,
//! - `?`, `+`, `*`: zero or one, one or more, zero or more repetitions of the preceding
//!   expression,
//! - parentheses for grouping.
//!
//! The whole hop sequence of a path must match. The hops of a path are derived from its
//! interfaces: the first hop leaves the source AS, every transit AS is one hop with ingress and
//! egress interface, and the last hop enters the destination AS.
//!
//! ```
//! use scion_pan::policy::sequence::Sequence;
//!
//! // Leave the source AS through interface 1, then any number of hops, ending in ISD 2.
//! let seq: Sequence = "1-ff00:0:110#1 0* 2".parse().unwrap();
//! // Traverse 1-ff00:0:111 or 1-ff00:0:112, but not both.
//! let seq: Sequence = "0 (1-ff00:0:111 | 1-ff00:0:112) 0".parse().unwrap();
//! ```

// Internal:
//
// Parsing is done in two steps. The lexer splits the input into operator tokens and hop
// predicate words, keeping the byte span of every token for error reporting. The recursive
// descent parser then builds the expression tree, with the grammar:
//
//   alternation   := concatenation ('|' concatenation)*
//   concatenation := repetition+
//   repetition    := atom ('?' | '+' | '*')*
//   atom          := hop-predicate | '(' alternation ')'
//
// Matching tracks the set of hop positions reachable after each sub-expression, so no
// backtracking is needed.

use std::{
    collections::BTreeSet,
    fmt::{Display, Formatter},
    str::FromStr,
    sync::Arc,
};

use super::{
    ParsePolicyError, Policy,
    hop_predicate::{HopPredicate, PolicyHop},
};
use crate::path::Path;

/// Policy allowing only paths whose hops match a sequence.
///
/// The empty sequence allows every path. Any other sequence drops paths without metadata.
#[derive(Debug, Clone)]
pub struct Sequence {
    source: String,
    expr: Option<SequenceExpr>,
}

impl Sequence {
    /// Parses a sequence.
    pub fn parse(s: &str) -> Result<Self, ParsePolicyError> {
        let tokens = tokenize(s);
        let mut parser = Parser { tokens, pos: 0 };
        if parser.peek().kind == TokenKind::End {
            return Ok(Self {
                source: String::new(),
                expr: None,
            });
        }

        let expr = parser.alternation()?;
        let trailing = parser.peek();
        if trailing.kind != TokenKind::End {
            return Err(ParsePolicyError::new(
                trailing.span,
                format!("unexpected {}", trailing.kind),
            ));
        }
        Ok(Self {
            source: s.trim().to_string(),
            expr: Some(expr),
        })
    }

    /// Returns true if the whole hop sequence matches.
    pub fn matches(&self, hops: &[PolicyHop]) -> bool {
        match &self.expr {
            None => true,
            Some(expr) => expr.advance(hops, &BTreeSet::from([0])).contains(&hops.len()),
        }
    }
}

impl FromStr for Sequence {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Display for Sequence {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

impl Policy for Sequence {
    fn filter(&self, paths: Vec<Arc<Path>>) -> Vec<Arc<Path>> {
        if self.expr.is_none() {
            return paths;
        }
        paths
            .into_iter()
            .filter(|path| {
                PolicyHop::hops_from_path(path).is_some_and(|hops| self.matches(&hops))
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
enum SequenceExpr {
    Hop(HopPredicate),
    Concat(Vec<SequenceExpr>),
    Alt(Box<SequenceExpr>, Box<SequenceExpr>),
    Optional(Box<SequenceExpr>),
    OneOrMore(Box<SequenceExpr>),
    ZeroOrMore(Box<SequenceExpr>),
}

impl SequenceExpr {
    /// Returns the positions in `hops` reachable by matching this expression from any of the
    /// positions in `from`.
    fn advance(&self, hops: &[PolicyHop], from: &BTreeSet<usize>) -> BTreeSet<usize> {
        match self {
            SequenceExpr::Hop(predicate) => from
                .iter()
                .filter(|&&pos| hops.get(pos).is_some_and(|hop| predicate.matches_hop(hop)))
                .map(|pos| pos + 1)
                .collect(),
            SequenceExpr::Concat(exprs) => exprs
                .iter()
                .fold(from.clone(), |positions, expr| expr.advance(hops, &positions)),
            SequenceExpr::Alt(left, right) => {
                let mut positions = left.advance(hops, from);
                positions.extend(right.advance(hops, from));
                positions
            }
            SequenceExpr::Optional(inner) => {
                let mut positions = inner.advance(hops, from);
                positions.extend(from.iter().copied());
                positions
            }
            SequenceExpr::OneOrMore(inner) => {
                let once = inner.advance(hops, from);
                Self::repeat(inner, hops, once)
            }
            SequenceExpr::ZeroOrMore(inner) => Self::repeat(inner, hops, from.clone()),
        }
    }

    /// Applies `inner` until no new positions are reached. The start positions are included.
    fn repeat(
        inner: &SequenceExpr,
        hops: &[PolicyHop],
        start: BTreeSet<usize>,
    ) -> BTreeSet<usize> {
        let mut reached = start.clone();
        let mut frontier = start;
        while !frontier.is_empty() {
            frontier = inner
                .advance(hops, &frontier)
                .into_iter()
                .filter(|pos| !reached.contains(pos))
                .collect();
            reached.extend(frontier.iter().copied());
        }
        reached
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind<'a> {
    Predicate(&'a str),
    Alt,
    LParen,
    RParen,
    Optional,
    OneOrMore,
    ZeroOrMore,
    End,
}

impl Display for TokenKind<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenKind::Predicate(s) => write!(f, "hop predicate '{s}'"),
            TokenKind::Alt => f.write_str("'|'"),
            TokenKind::LParen => f.write_str("'('"),
            TokenKind::RParen => f.write_str("')'"),
            TokenKind::Optional => f.write_str("'?'"),
            TokenKind::OneOrMore => f.write_str("'+'"),
            TokenKind::ZeroOrMore => f.write_str("'*'"),
            TokenKind::End => f.write_str("end of input"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Token<'a> {
    kind: TokenKind<'a>,
    span: (usize, usize),
}

const OPERATORS: &str = "|()?+*";

/// Splits the input into tokens. The last token is always [`TokenKind::End`].
fn tokenize(s: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut chars = s.char_indices().peekable();
    while let Some((start, c)) = chars.next() {
        let kind = match c {
            c if c.is_whitespace() => continue,
            '|' => TokenKind::Alt,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '?' => TokenKind::Optional,
            '+' => TokenKind::OneOrMore,
            '*' => TokenKind::ZeroOrMore,
            _ => {
                let mut end = start + c.len_utf8();
                while let Some(&(i, next)) = chars.peek() {
                    if next.is_whitespace() || OPERATORS.contains(next) {
                        break;
                    }
                    end = i + next.len_utf8();
                    chars.next();
                }
                tokens.push(Token {
                    kind: TokenKind::Predicate(&s[start..end]),
                    span: (start, end),
                });
                continue;
            }
        };
        tokens.push(Token {
            kind,
            span: (start, start + 1),
        });
    }
    tokens.push(Token {
        kind: TokenKind::End,
        span: (s.len(), s.len()),
    });
    tokens
}

struct Parser<'a> {
    tokens: Vec<Token<'a>>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Token<'a> {
        // The tokens end with `End`, which is never consumed.
        self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn bump(&mut self) -> Token<'a> {
        let token = self.peek();
        if token.kind != TokenKind::End {
            self.pos += 1;
        }
        token
    }

    fn alternation(&mut self) -> Result<SequenceExpr, ParsePolicyError> {
        let mut expr = self.concatenation()?;
        while self.peek().kind == TokenKind::Alt {
            self.bump();
            let rhs = self.concatenation()?;
            expr = SequenceExpr::Alt(Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn concatenation(&mut self) -> Result<SequenceExpr, ParsePolicyError> {
        let mut exprs = Vec::new();
        while matches!(
            self.peek().kind,
            TokenKind::Predicate(_) | TokenKind::LParen
        ) {
            exprs.push(self.repetition()?);
        }
        match exprs.len() {
            0 => {
                let token = self.peek();
                Err(ParsePolicyError::new(
                    token.span,
                    format!("expected a hop predicate or '(', got {}", token.kind),
                ))
            }
            1 => Ok(exprs.remove(0)),
            _ => Ok(SequenceExpr::Concat(exprs)),
        }
    }

    fn repetition(&mut self) -> Result<SequenceExpr, ParsePolicyError> {
        let mut expr = self.atom()?;
        loop {
            expr = match self.peek().kind {
                TokenKind::Optional => SequenceExpr::Optional(Box::new(expr)),
                TokenKind::OneOrMore => SequenceExpr::OneOrMore(Box::new(expr)),
                TokenKind::ZeroOrMore => SequenceExpr::ZeroOrMore(Box::new(expr)),
                _ => return Ok(expr),
            };
            self.bump();
        }
    }

    fn atom(&mut self) -> Result<SequenceExpr, ParsePolicyError> {
        let token = self.bump();
        match token.kind {
            TokenKind::Predicate(s) => HopPredicate::parse(s)
                .map(SequenceExpr::Hop)
                .map_err(|e| e.offset(token.span.0)),
            TokenKind::LParen => {
                let inner = self.alternation()?;
                let closing = self.bump();
                if closing.kind != TokenKind::RParen {
                    return Err(ParsePolicyError::new(
                        closing.span,
                        format!("expected ')', got {}", closing.kind),
                    ));
                }
                Ok(inner)
            }
            kind => Err(ParsePolicyError::new(
                token.span,
                format!("expected a hop predicate or '(', got {kind}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::test_helpers::*;

    mod helpers {
        use super::*;

        /// Hops in the given ASes, without interfaces.
        pub fn hops(ias: &[&str]) -> Vec<PolicyHop> {
            ias.iter()
                .map(|s| PolicyHop {
                    ia: ia(s),
                    ingress: 0,
                    egress: 0,
                })
                .collect()
        }

        pub fn seq(s: &str) -> Sequence {
            Sequence::parse(s).unwrap_or_else(|e| panic!("should parse {s:?}: {}", e.report(s)))
        }
    }

    mod parse {
        use super::{helpers::*, *};

        #[test]
        fn should_tokenize_with_spans() {
            let tokens = tokenize(" (1-ff00:0:1#2|3)+ ");
            let kinds: Vec<_> = tokens.iter().map(|t| t.kind).collect();

            assert_eq!(
                kinds,
                vec![
                    TokenKind::LParen,
                    TokenKind::Predicate("1-ff00:0:1#2"),
                    TokenKind::Alt,
                    TokenKind::Predicate("3"),
                    TokenKind::RParen,
                    TokenKind::OneOrMore,
                    TokenKind::End,
                ]
            );
            assert_eq!(tokens[1].span, (2, 14));
            assert_eq!(tokens[6].span, (19, 19));
        }

        #[test]
        fn should_parse_valid_sequences() {
            for s in [
                "1",
                "1 2 3",
                "1 | 2",
                "(1 2)+",
                "1?+*",
                "0* 1-ff00:0:110#1,2 0*",
                "((1))",
            ] {
                seq(s);
            }
        }

        #[test]
        fn should_reject_invalid_sequences() {
            let cases = [
                ("(1 2", (4, 4)),
                ("1 |", (3, 3)),
                (")", (0, 1)),
                ("+ 1", (0, 1)),
                ("1 x", (2, 3)),
                ("1 2)", (3, 4)),
                ("1 ()", (3, 4)),
            ];
            for (s, span) in cases {
                let err = Sequence::parse(s).expect_err(s);
                assert_eq!(err.span, span, "parsing {s:?}: {err}");
            }
        }
    }

    mod matching {
        use super::helpers::*;

        #[test]
        fn should_match_concatenation() {
            let s = seq("1 2 3");

            assert!(s.matches(&hops(&["1-1", "2-1", "3-1"])));
            assert!(!s.matches(&hops(&["1-1", "2-1"])));
            assert!(!s.matches(&hops(&["1-1", "2-1", "3-1", "3-1"])));
            assert!(!s.matches(&hops(&["2-1", "1-1", "3-1"])));
        }

        #[test]
        fn should_bind_alternation_weaker_than_concatenation() {
            let s = seq("1 | 2 3");

            assert!(s.matches(&hops(&["1-1"])));
            assert!(s.matches(&hops(&["2-1", "3-1"])));
            assert!(!s.matches(&hops(&["1-1", "3-1"])));
        }

        #[test]
        fn should_match_repetitions() {
            assert!(seq("1? 2").matches(&hops(&["2-1"])));
            assert!(seq("1? 2").matches(&hops(&["1-1", "2-1"])));
            assert!(!seq("1? 2").matches(&hops(&["1-1", "1-1", "2-1"])));

            assert!(!seq("1+ 2").matches(&hops(&["2-1"])));
            assert!(seq("1+ 2").matches(&hops(&["1-1", "1-1", "2-1"])));

            assert!(seq("1* 2").matches(&hops(&["2-1"])));
            assert!(seq("1* 2").matches(&hops(&["1-1", "1-1", "1-1", "2-1"])));
            assert!(!seq("1* 2 3").matches(&hops(&["1-1", "1-1", "2-1"])));
        }

        #[test]
        fn should_repeat_groups() {
            let s = seq("(1 2)+");

            assert!(s.matches(&hops(&["1-1", "2-1", "1-1", "2-1"])));
            assert!(!s.matches(&hops(&["1-1", "2-1", "1-1"])));
            assert!(!s.matches(&[]));
        }

        #[test]
        fn should_match_nested_quantifiers() {
            let s = seq("1 (2+ | 3) 4");

            assert!(s.matches(&hops(&["1-1", "2-1", "2-1", "4-1"])));
            assert!(s.matches(&hops(&["1-1", "3-1", "4-1"])));
            assert!(!s.matches(&hops(&["1-1", "2-1", "3-1", "4-1"])));
            assert!(!s.matches(&hops(&["1-1", "4-1"])));
        }

        #[test]
        fn should_match_empty_hops_only_with_nullable_sequence() {
            assert!(seq("0*").matches(&[]));
            assert!(seq("1?").matches(&[]));
            assert!(!seq("1").matches(&[]));
        }
    }

    mod filter {
        use super::{helpers::*, *};

        #[test]
        fn should_match_hops_of_paths() {
            let via_transit = Arc::new(path_with_ifids(&[1, 2, 3, 4], BASE_TIME));
            let direct = simple_path(5);
            let paths = vec![via_transit.clone(), direct.clone()];

            assert_eq!(
                seq("1-ff00:0:110#1 1-ff00:1:1#2,3 1-ff00:0:112#4").filter(paths.clone()),
                vec![via_transit.clone()]
            );
            assert_eq!(
                seq("1-ff00:0:110 1-ff00:0:112").filter(paths.clone()),
                vec![direct.clone()]
            );
            assert_eq!(seq("0+").filter(paths.clone()), paths);
        }

        #[test]
        fn should_drop_paths_without_metadata() {
            let bare = Arc::new(Path::without_metadata(
                src_ia(),
                dst_ia(),
                Default::default(),
                "1 2".into(),
                BASE_TIME,
            ));

            assert!(seq("0*").filter(vec![bare.clone()]).is_empty());
            assert_eq!(seq("").filter(vec![bare.clone()]), vec![bare]);
        }
    }
}
