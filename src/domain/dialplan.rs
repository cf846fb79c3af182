//! Dialplan router
//!
//! An ordered list of rules matched against the dialed string; the first
//! rule whose pattern matches decides the destination.
//!
//! Pattern syntax follows the common PBX convention: a plain string matches
//! exactly, a string starting with `_` is a pattern where `X` is any digit,
//! `Z` is 1-9, `N` is 2-9, `[1-5]` is a class, and a trailing `.` / `!`
//! matches one-or-more / zero-or-more further characters.

use crate::domain::sip_trunk::SipTrunk;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("No dialplan rule matches {0}")]
    NoMatch(String),

    #[error("Extension {0} is not registered")]
    NotRegistered(String),

    #[error("Feature {0} has no handler")]
    FeatureUnavailable(FeatureKind),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DialplanError {
    #[error("Invalid pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Rule {rule} references unknown trunk {trunk}")]
    UnknownTrunk { rule: String, trunk: String },
}

/// Features reachable through feature codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    VoicemailAccess,
    Park,
    Unpark,
    Queue,
}

impl fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FeatureKind::VoicemailAccess => "voicemail_access",
            FeatureKind::Park => "park",
            FeatureKind::Unpark => "unpark",
            FeatureKind::Queue => "queue",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(char),
    Class(Vec<(char, char)>),
    OneOrMore,
    ZeroOrMore,
}

impl Token {
    fn accepts(&self, c: char) -> bool {
        match self {
            Token::Literal(l) => *l == c,
            Token::Class(ranges) => ranges.iter().any(|(lo, hi)| (*lo..=*hi).contains(&c)),
            Token::OneOrMore | Token::ZeroOrMore => true,
        }
    }
}

/// A compiled dial pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialPattern {
    source: String,
    tokens: Vec<Token>,
}

impl DialPattern {
    pub fn parse(source: &str) -> Result<Self, DialplanError> {
        let invalid = |reason: &str| DialplanError::InvalidPattern {
            pattern: source.to_string(),
            reason: reason.to_string(),
        };

        if source.is_empty() {
            return Err(invalid("empty pattern"));
        }

        let Some(body) = source.strip_prefix('_') else {
            return Ok(Self {
                source: source.to_string(),
                tokens: source.chars().map(Token::Literal).collect(),
            });
        };

        let mut tokens = Vec::new();
        let mut chars = body.chars().peekable();
        while let Some(c) = chars.next() {
            let token = match c.to_ascii_uppercase() {
                'X' => Token::Class(vec![('0', '9')]),
                'Z' => Token::Class(vec![('1', '9')]),
                'N' => Token::Class(vec![('2', '9')]),
                '.' | '!' => {
                    if chars.peek().is_some() {
                        return Err(invalid("wildcard must be the last character"));
                    }
                    if c == '.' {
                        Token::OneOrMore
                    } else {
                        Token::ZeroOrMore
                    }
                }
                '[' => {
                    let mut ranges = Vec::new();
                    let mut closed = false;
                    while let Some(c) = chars.next() {
                        if c == ']' {
                            closed = true;
                            break;
                        }
                        if chars.peek() == Some(&'-') {
                            chars.next();
                            let hi = chars.next().ok_or_else(|| invalid("unterminated range"))?;
                            ranges.push((c, hi));
                        } else {
                            ranges.push((c, c));
                        }
                    }
                    if !closed || ranges.is_empty() {
                        return Err(invalid("bad character class"));
                    }
                    Token::Class(ranges)
                }
                c if c.is_ascii_digit() || matches!(c, '*' | '#' | '+') => Token::Literal(c),
                _ => return Err(invalid("unsupported character")),
            };
            tokens.push(token);
        }

        if tokens.is_empty() {
            return Err(invalid("empty pattern"));
        }

        Ok(Self {
            source: source.to_string(),
            tokens,
        })
    }

    pub fn matches(&self, dialed: &str) -> bool {
        let digits: Vec<char> = dialed.chars().collect();
        let mut i = 0;
        for token in &self.tokens {
            match token {
                Token::OneOrMore => return digits.len() > i,
                Token::ZeroOrMore => return true,
                _ => {
                    match digits.get(i) {
                        Some(c) if token.accepts(*c) => i += 1,
                        _ => return false,
                    }
                }
            }
        }
        i == digits.len()
    }

    /// Number of leading literal characters, i.e. the feature code itself
    pub fn literal_prefix_len(&self) -> usize {
        self.tokens
            .iter()
            .take_while(|t| matches!(t, Token::Literal(_)))
            .count()
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

/// What a rule routes to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RouteTarget {
    /// The dialed string is a local extension number
    Extension,
    Feature { feature: FeatureKind },
    Trunk { trunk: String },
}

/// Configured form of a rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialplanRuleConfig {
    pub name: String,
    pub pattern: String,
    pub target: RouteTarget,
}

#[derive(Debug, Clone)]
pub struct DialplanRule {
    pub name: String,
    pub pattern: DialPattern,
    pub target: RouteTarget,
}

/// Routing decision for one dialed string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Extension(String),
    Feature {
        feature: FeatureKind,
        /// Digits following the feature code (park slot, queue number)
        argument: String,
    },
    Trunk {
        trunk: SipTrunk,
        dialed: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct Dialplan {
    rules: Vec<DialplanRule>,
    trunks: HashMap<String, SipTrunk>,
}

impl Dialplan {
    pub fn new(rules: &[DialplanRuleConfig], trunks: &[SipTrunk]) -> Result<Self, DialplanError> {
        let trunks: HashMap<String, SipTrunk> =
            trunks.iter().map(|t| (t.name.clone(), t.clone())).collect();

        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            if let RouteTarget::Trunk { trunk } = &rule.target {
                if !trunks.contains_key(trunk) {
                    return Err(DialplanError::UnknownTrunk {
                        rule: rule.name.clone(),
                        trunk: trunk.clone(),
                    });
                }
            }
            compiled.push(DialplanRule {
                name: rule.name.clone(),
                pattern: DialPattern::parse(&rule.pattern)?,
                target: rule.target.clone(),
            });
        }

        Ok(Self {
            rules: compiled,
            trunks,
        })
    }

    /// First matching rule wins
    pub fn route(&self, dialed: &str) -> Result<Route, RoutingError> {
        let rule = self
            .rules
            .iter()
            .find(|rule| rule.pattern.matches(dialed))
            .ok_or_else(|| RoutingError::NoMatch(dialed.to_string()))?;

        debug!("Dialed {} matched rule {} ({})", dialed, rule.name, rule.pattern.as_str());

        match &rule.target {
            RouteTarget::Extension => Ok(Route::Extension(dialed.to_string())),
            RouteTarget::Feature { feature } => {
                let argument: String = dialed.chars().skip(rule.pattern.literal_prefix_len()).collect();
                Ok(Route::Feature {
                    feature: *feature,
                    argument,
                })
            }
            RouteTarget::Trunk { trunk } => {
                // Checked at construction
                let trunk = self
                    .trunks
                    .get(trunk)
                    .cloned()
                    .ok_or_else(|| RoutingError::NoMatch(dialed.to_string()))?;
                Ok(Route::Trunk {
                    trunk,
                    dialed: dialed.to_string(),
                })
            }
        }
    }

    /// Trunk an inbound request came from, if any
    pub fn trunk_for_source(&self, ip: &std::net::IpAddr) -> Option<&SipTrunk> {
        self.trunks.values().find(|t| t.accepts_source(ip))
    }

    pub fn rules(&self) -> &[DialplanRule] {
        &self.rules
    }
}

/// Rules used when configuration provides none
pub fn default_rules() -> Vec<DialplanRuleConfig> {
    let rule = |name: &str, pattern: &str, target: RouteTarget| DialplanRuleConfig {
        name: name.to_string(),
        pattern: pattern.to_string(),
        target,
    };

    vec![
        rule("internal", "_1XXX", RouteTarget::Extension),
        rule(
            "voicemail",
            "*97",
            RouteTarget::Feature {
                feature: FeatureKind::VoicemailAccess,
            },
        ),
        rule(
            "park",
            "*70",
            RouteTarget::Feature {
                feature: FeatureKind::Park,
            },
        ),
        rule(
            "unpark",
            "_*71X",
            RouteTarget::Feature {
                feature: FeatureKind::Unpark,
            },
        ),
        rule(
            "queue",
            "_*8XX",
            RouteTarget::Feature {
                feature: FeatureKind::Queue,
            },
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dialplan() -> Dialplan {
        let mut rules = default_rules();
        rules.push(DialplanRuleConfig {
            name: "outside".to_string(),
            pattern: "_9NXXXXXX.".to_string(),
            target: RouteTarget::Trunk {
                trunk: "carrier".to_string(),
            },
        });
        let mut trunk = SipTrunk::new("carrier", "203.0.113.5:5060".parse().unwrap());
        trunk.strip_digits = 1;
        Dialplan::new(&rules, &[trunk]).unwrap()
    }

    #[test]
    fn test_pattern_matching() {
        let p = DialPattern::parse("_1XXX").unwrap();
        assert!(p.matches("1001"));
        assert!(!p.matches("100"));
        assert!(!p.matches("10011"));
        assert!(!p.matches("2001"));

        let p = DialPattern::parse("_[2-4]0!").unwrap();
        assert!(p.matches("30"));
        assert!(p.matches("3055"));
        assert!(!p.matches("50"));

        let p = DialPattern::parse("_0.").unwrap();
        assert!(p.matches("01"));
        assert!(!p.matches("0"));

        let exact = DialPattern::parse("*97").unwrap();
        assert!(exact.matches("*97"));
        assert!(!exact.matches("*970"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(DialPattern::parse("").is_err());
        assert!(DialPattern::parse("_1.2").is_err());
        assert!(DialPattern::parse("_[12").is_err());
        assert!(DialPattern::parse("_1Q").is_err());
    }

    #[test]
    fn test_fixed_length_extension() {
        assert_eq!(dialplan().route("1002").unwrap(), Route::Extension("1002".to_string()));
    }

    #[test]
    fn test_feature_codes_carry_argument() {
        let plan = dialplan();
        assert_eq!(
            plan.route("*97").unwrap(),
            Route::Feature {
                feature: FeatureKind::VoicemailAccess,
                argument: String::new()
            }
        );
        assert_eq!(
            plan.route("*713").unwrap(),
            Route::Feature {
                feature: FeatureKind::Unpark,
                argument: "3".to_string()
            }
        );
        assert_eq!(
            plan.route("*842").unwrap(),
            Route::Feature {
                feature: FeatureKind::Queue,
                argument: "42".to_string()
            }
        );
    }

    #[test]
    fn test_external_via_trunk() {
        match dialplan().route("95551234").unwrap() {
            Route::Trunk { trunk, dialed } => {
                assert_eq!(trunk.name, "carrier");
                assert_eq!(trunk.transform(&dialed), "5551234");
            }
            other => panic!("unexpected route {:?}", other),
        }
    }

    #[test]
    fn test_first_match_wins() {
        let rules = vec![
            DialplanRuleConfig {
                name: "vip".to_string(),
                pattern: "1000".to_string(),
                target: RouteTarget::Feature {
                    feature: FeatureKind::Queue,
                },
            },
            DialplanRuleConfig {
                name: "internal".to_string(),
                pattern: "_1XXX".to_string(),
                target: RouteTarget::Extension,
            },
        ];
        let plan = Dialplan::new(&rules, &[]).unwrap();
        assert!(matches!(plan.route("1000").unwrap(), Route::Feature { .. }));
        assert!(matches!(plan.route("1001").unwrap(), Route::Extension(_)));
    }

    #[test]
    fn test_no_match() {
        assert_eq!(
            dialplan().route("12"),
            Err(RoutingError::NoMatch("12".to_string()))
        );
    }

    #[test]
    fn test_unknown_trunk_rejected() {
        let rules = vec![DialplanRuleConfig {
            name: "outside".to_string(),
            pattern: "_9.".to_string(),
            target: RouteTarget::Trunk {
                trunk: "missing".to_string(),
            },
        }];
        assert!(matches!(
            Dialplan::new(&rules, &[]),
            Err(DialplanError::UnknownTrunk { .. })
        ));
    }
}
