//! Version constraint matching against package indexes
//!
//! Constraints use the range syntax found in chart indexes and `Chart.yaml`
//! dependency blocks:
//!
//! - comparisons: `=`, `!=`, `>`, `>=`, `<`, `<=`
//! - ranges: `~1.2.3` (patch-level), `^1.2` (minor-level), `1.0 - 1.4.2`
//! - wildcards: `1.2.x`, `1.*`, `*`
//! - conjunctions separated by spaces or commas: `>=1.2.0 <2.0.0`
//! - alternatives separated by `||`
//!
//! A bare version (`1.2.3`) is an exact match, and a leading `v` is ignored.

use semver::{Comparator, Op, Prerelease, Version, VersionReq};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::{CoreError, Result};

/// Version returned when no candidate satisfies a constraint.
///
/// This is never a valid lookup key; callers must treat it as "not found".
pub const UNRESOLVED: Version = Version::new(0, 0, 0);

/// Whether a resolved version is the [`UNRESOLVED`] sentinel
pub fn is_unresolved(version: &Version) -> bool {
    compare_precedence(version, &UNRESOLVED) == Ordering::Equal
}

/// Parse a version string, tolerating a `v` prefix and missing minor/patch parts
pub fn parse_version(input: &str) -> Result<Version> {
    let trimmed = input.trim();
    let text = trimmed.strip_prefix(['v', 'V']).unwrap_or(trimmed);

    let split = text.find(['-', '+']).unwrap_or(text.len());
    let (core, rest) = text.split_at(split);
    let padding = match core.split('.').count() {
        1 => ".0.0",
        2 => ".0",
        _ => "",
    };

    Version::parse(&format!("{core}{padding}{rest}")).map_err(|e| CoreError::InvalidVersion {
        version: input.to_string(),
        message: e.to_string(),
    })
}

/// Semantic-version precedence: build metadata is ignored
pub fn compare_precedence(a: &Version, b: &Version) -> Ordering {
    (a.major, a.minor, a.patch, &a.pre).cmp(&(b.major, b.minor, b.patch, &b.pre))
}

/// A parsed version constraint
#[derive(Debug, Clone)]
pub struct VersionConstraint {
    raw: String,
    alternatives: Vec<Conjunction>,
}

/// One `||` branch: every required comparator matches, no excluded one does
#[derive(Debug, Clone, Default)]
struct Conjunction {
    required: VersionReq,
    excluded: Vec<Comparator>,
}

impl Conjunction {
    fn matches(&self, version: &Version) -> bool {
        self.required.matches(version) && !self.excluded.iter().any(|c| c.matches(version))
    }
}

impl VersionConstraint {
    /// Parse a constraint expression. An empty expression matches any release version.
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |message: String| CoreError::InvalidConstraint {
            constraint: input.to_string(),
            message,
        };

        let branches: Vec<&str> = input.split("||").collect();
        let mut alternatives = Vec::with_capacity(branches.len());
        for branch in &branches {
            if branches.len() > 1 && branch.trim().is_empty() {
                return Err(invalid("empty alternative".to_string()));
            }
            alternatives.push(parse_conjunction(branch).map_err(invalid)?);
        }

        Ok(Self {
            raw: input.trim().to_string(),
            alternatives,
        })
    }

    /// Check a version against the constraint
    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives.iter().any(|c| c.matches(version))
    }

    /// The constraint as written
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for VersionConstraint {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Picks the greatest indexed version satisfying a constraint
#[derive(Debug, Clone, Copy, Default)]
pub struct VersionResolver;

impl VersionResolver {
    /// Resolve a constraint string against candidate version strings.
    ///
    /// Returns [`UNRESOLVED`] when nothing matches. A candidate that is not a
    /// valid version fails the whole resolution.
    pub fn resolve<I, S>(constraint: &str, candidates: I) -> Result<Version>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let constraint = VersionConstraint::parse(constraint)?;
        Self::resolve_with(&constraint, candidates)
    }

    /// Resolve an already parsed constraint.
    ///
    /// Only strictly greater versions replace the current best, so among
    /// versions of equal precedence the first one seen wins.
    pub fn resolve_with<I, S>(constraint: &VersionConstraint, candidates: I) -> Result<Version>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut best = UNRESOLVED;
        for candidate in candidates {
            let version = parse_version(candidate.as_ref())?;
            if constraint.matches(&version)
                && compare_precedence(&version, &best) == Ordering::Greater
            {
                best = version;
            }
        }

        tracing::trace!(constraint = %constraint, resolved = %best, "resolved version constraint");
        Ok(best)
    }
}

// ========== Parsing ==========

const OPERATOR_CHARS: &[char] = &['<', '>', '=', '!', '~', '^'];

fn parse_conjunction(branch: &str) -> std::result::Result<Conjunction, String> {
    let mut conjunction = Conjunction::default();

    for term in tokenize(branch)? {
        let op_len = term
            .find(|c: char| !OPERATOR_CHARS.contains(&c))
            .unwrap_or(term.len());
        let (op, version) = term.split_at(op_len);

        let negated = op == "!=";
        let op = match op {
            "" | "=" | "==" | "!=" => Op::Exact,
            ">" => Op::Greater,
            ">=" | "=>" => Op::GreaterEq,
            "<" => Op::Less,
            "<=" | "=<" => Op::LessEq,
            "~" | "~>" => Op::Tilde,
            "^" => Op::Caret,
            other => return Err(format!("unknown operator '{other}'")),
        };

        match parse_partial(version)? {
            Some(partial) => {
                let comparator = Comparator {
                    op,
                    major: partial.major,
                    minor: partial.minor,
                    patch: partial.patch,
                    pre: partial.pre,
                };
                if negated {
                    conjunction.excluded.push(comparator);
                } else {
                    conjunction.required.comparators.push(comparator);
                }
            }
            None if negated => return Err("'!=' cannot be used with a bare wildcard".to_string()),
            // `*` alone places no bound
            None => {}
        }
    }

    Ok(conjunction)
}

/// Split a branch into terms, gluing detached operators to their operand and
/// expanding hyphen ranges.
fn tokenize(branch: &str) -> std::result::Result<Vec<String>, String> {
    let normalized = branch.replace(',', " ");
    let mut words = normalized.split_whitespace();
    let mut terms: Vec<String> = Vec::new();

    while let Some(word) = words.next() {
        if word == "-" {
            let lower = terms
                .pop()
                .filter(|t| !t.starts_with(OPERATOR_CHARS))
                .ok_or("hyphen range without a lower bound")?;
            let upper = words.next().ok_or("hyphen range without an upper bound")?;
            terms.push(format!(">={lower}"));
            terms.push(format!("<={upper}"));
        } else if word.chars().all(|c| OPERATOR_CHARS.contains(&c)) {
            let operand = words
                .next()
                .ok_or_else(|| format!("operator '{word}' without a version"))?;
            terms.push(format!("{word}{operand}"));
        } else {
            terms.push(word.to_string());
        }
    }

    Ok(terms)
}

struct Partial {
    major: u64,
    minor: Option<u64>,
    patch: Option<u64>,
    pre: Prerelease,
}

/// Parse a possibly partial version; `None` means a full wildcard.
fn parse_partial(text: &str) -> std::result::Result<Option<Partial>, String> {
    let text = text.strip_prefix(['v', 'V']).unwrap_or(text);
    if text.is_empty() {
        return Err("missing version".to_string());
    }

    let text = text.split_once('+').map_or(text, |(version, _build)| version);
    let (core, pre) = text.split_once('-').unwrap_or((text, ""));

    let mut numbers = Vec::with_capacity(3);
    let mut wildcard = false;
    for part in core.split('.') {
        if matches!(part, "x" | "X" | "*") {
            wildcard = true;
            continue;
        }
        if wildcard {
            return Err(format!("'{part}' after a wildcard in '{text}'"));
        }
        let number = part
            .parse::<u64>()
            .map_err(|_| format!("'{part}' is not a version number in '{text}'"))?;
        numbers.push(number);
    }
    if core.split('.').count() > 3 {
        return Err(format!("too many components in '{text}'"));
    }

    let pre = if pre.is_empty() {
        Prerelease::EMPTY
    } else if numbers.len() == 3 {
        Prerelease::new(pre).map_err(|e| e.to_string())?
    } else {
        return Err(format!("pre-release on a partial version in '{text}'"));
    };

    Ok(numbers.first().map(|&major| Partial {
        major,
        minor: numbers.get(1).copied(),
        patch: numbers.get(2).copied(),
        pre,
    }))
}
