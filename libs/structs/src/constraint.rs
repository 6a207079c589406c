//! Constraint, affinity and spread expressions, and how they are evaluated
//! against a node.

use std::cmp::Ordering;
use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::Node;

/// Comparison operator of a constraint or affinity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    #[serde(alias = "=", alias = "==", alias = "is")]
    Eq,
    #[serde(alias = "!=", alias = "not")]
    NotEq,
    #[serde(alias = "<")]
    Lt,
    #[serde(alias = "<=")]
    Le,
    #[serde(alias = ">")]
    Gt,
    #[serde(alias = ">=")]
    Ge,
    Regexp,
    Version,
    #[serde(alias = "set_contains_all")]
    SetContains,
    SetContainsAny,
    IsSet,
    IsNotSet,
    DistinctHosts,
    DistinctProperty,
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Operand::Eq => "=",
            Operand::NotEq => "!=",
            Operand::Lt => "<",
            Operand::Le => "<=",
            Operand::Gt => ">",
            Operand::Ge => ">=",
            Operand::Regexp => "regexp",
            Operand::Version => "version",
            Operand::SetContains => "set_contains",
            Operand::SetContainsAny => "set_contains_any",
            Operand::IsSet => "is_set",
            Operand::IsNotSet => "is_not_set",
            Operand::DistinctHosts => "distinct_hosts",
            Operand::DistinctProperty => "distinct_property",
        };
        f.write_str(s)
    }
}

/// A hard placement requirement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Constraint {
    #[serde(default)]
    pub l_target: String,
    #[serde(default)]
    pub r_target: String,
    pub operand: Operand,
}

impl Constraint {
    pub fn new(l_target: impl Into<String>, operand: Operand, r_target: impl Into<String>) -> Self {
        Self {
            l_target: l_target.into(),
            r_target: r_target.into(),
            operand,
        }
    }

    pub fn distinct_hosts() -> Self {
        Self::new("", Operand::DistinctHosts, "")
    }

    /// `r_target` is the per-value limit; defaults to 1 when unset.
    pub fn distinct_property(attribute: impl Into<String>, limit: u32) -> Self {
        Self::new(attribute, Operand::DistinctProperty, limit.to_string())
    }

    /// Whether evaluation depends on per-node unique data, which defeats
    /// computed-class caching.
    pub fn escapes_computed_class(&self) -> bool {
        target_escapes_class(&self.l_target) || target_escapes_class(&self.r_target)
    }
}

impl std::fmt::Display for Constraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.l_target, self.operand, self.r_target)
    }
}

/// A soft preference; `weight` ranges over -100..=100.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Affinity {
    pub l_target: String,
    #[serde(default)]
    pub r_target: String,
    pub operand: Operand,
    pub weight: i8,
}

impl Affinity {
    pub fn as_constraint(&self) -> Constraint {
        Constraint::new(self.l_target.clone(), self.operand, self.r_target.clone())
    }
}

/// Desired share of placements for one attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpreadTarget {
    pub value: String,
    pub percent: u8,
}

/// Distribute placements across the values of `attribute`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Spread {
    pub attribute: String,
    #[serde(default = "default_spread_weight")]
    pub weight: u8,
    #[serde(default)]
    pub targets: Vec<SpreadTarget>,
}

fn default_spread_weight() -> u8 {
    50
}

/// Resolves `${...}` interpolations against a node. Literals resolve to
/// themselves; unknown keys resolve to `None`.
pub fn resolve_target<'a>(target: &'a str, node: &'a Node) -> Option<std::borrow::Cow<'a, str>> {
    use std::borrow::Cow;

    let Some(inner) = target
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
    else {
        return Some(Cow::Borrowed(target));
    };

    match inner {
        "node.unique.id" => Some(Cow::Owned(node.id.to_string())),
        "node.unique.name" => Some(Cow::Borrowed(node.name.as_str())),
        "node.datacenter" => Some(Cow::Borrowed(node.datacenter.as_str())),
        "node.class" => Some(Cow::Borrowed(node.node_class.as_str())),
        "node.pool" => Some(Cow::Borrowed(node.node_pool.as_str())),
        _ => {
            if let Some(key) = inner.strip_prefix("attr.") {
                node.attributes.get(key).map(|v| Cow::Borrowed(v.as_str()))
            } else if let Some(key) = inner.strip_prefix("meta.") {
                node.meta.get(key).map(|v| Cow::Borrowed(v.as_str()))
            } else {
                None
            }
        }
    }
}

/// Targets that read per-node unique values.
pub fn target_escapes_class(target: &str) -> bool {
    target.starts_with("${node.unique.")
        || target.starts_with("${attr.unique.")
        || target.starts_with("${meta.unique.")
}

/// Compiled regex and version matchers reused across nodes in one evaluation.
#[derive(Debug, Default)]
pub struct ConstraintCache {
    regexes: HashMap<String, Option<Regex>>,
    versions: HashMap<String, Option<VersionConstraint>>,
}

impl ConstraintCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn regex(&mut self, pattern: &str) -> Option<&Regex> {
        self.regexes
            .entry(pattern.to_string())
            .or_insert_with(|| Regex::new(pattern).ok())
            .as_ref()
    }

    fn version(&mut self, spec: &str) -> Option<&VersionConstraint> {
        self.versions
            .entry(spec.to_string())
            .or_insert_with(|| VersionConstraint::parse(spec))
            .as_ref()
    }
}

/// Evaluates a constraint against a node.
pub fn node_meets(constraint: &Constraint, node: &Node, cache: &mut ConstraintCache) -> bool {
    let l = resolve_target(&constraint.l_target, node);
    let r = resolve_target(&constraint.r_target, node);
    check_operand(constraint.operand, l.as_deref(), r.as_deref(), cache)
}

/// Applies an operand to resolved values.
pub fn check_operand(
    operand: Operand,
    l: Option<&str>,
    r: Option<&str>,
    cache: &mut ConstraintCache,
) -> bool {
    match operand {
        // Evaluated over the proposed placement set by the scheduler.
        Operand::DistinctHosts | Operand::DistinctProperty => true,
        Operand::IsSet => l.is_some(),
        Operand::IsNotSet => l.is_none(),
        Operand::Eq => matches!((l, r), (Some(l), Some(r)) if l == r),
        Operand::NotEq => l != r,
        Operand::Lt | Operand::Le | Operand::Gt | Operand::Ge => {
            let (Some(l), Some(r)) = (l, r) else {
                return false;
            };
            let ord = compare_values(l, r);
            match operand {
                Operand::Lt => ord == Ordering::Less,
                Operand::Le => ord != Ordering::Greater,
                Operand::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            }
        }
        Operand::Regexp => {
            let (Some(l), Some(r)) = (l, r) else {
                return false;
            };
            cache.regex(r).is_some_and(|re| re.is_match(l))
        }
        Operand::Version => {
            let (Some(l), Some(r)) = (l, r) else {
                return false;
            };
            let Some(version) = Version::parse(l) else {
                return false;
            };
            cache.version(r).is_some_and(|c| c.matches(&version))
        }
        Operand::SetContains | Operand::SetContainsAny => {
            let (Some(l), Some(r)) = (l, r) else {
                return false;
            };
            let have: Vec<&str> = split_set(l).collect();
            let mut want = split_set(r);
            if operand == Operand::SetContains {
                want.all(|w| have.contains(&w))
            } else {
                want.any(|w| have.contains(&w))
            }
        }
    }
}

fn split_set(s: &str) -> impl Iterator<Item = &str> {
    s.split(',').map(str::trim).filter(|v| !v.is_empty())
}

/// Numeric comparison when both sides parse, lexical otherwise.
fn compare_values(l: &str, r: &str) -> Ordering {
    match (l.parse::<f64>(), r.parse::<f64>()) {
        (Ok(a), Ok(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        _ => l.cmp(r),
    }
}

/// Dotted numeric version; pre-release and build suffixes are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version(Vec<u64>);

impl Version {
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().trim_start_matches('v');
        let core = s.split(['-', '+']).next()?;
        let parts: Option<Vec<u64>> = core.split('.').map(|p| p.parse().ok()).collect();
        let parts = parts?;
        if parts.is_empty() {
            return None;
        }
        Some(Self(parts))
    }

    fn segment(&self, i: usize) -> u64 {
        self.0.get(i).copied().unwrap_or(0)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        (0..len)
            .map(|i| self.segment(i).cmp(&other.segment(i)))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VersionOp {
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Pessimistic,
}

/// Comma-separated list of comparators, e.g. `>= 1.2, < 2`.
#[derive(Debug, Clone)]
pub struct VersionConstraint(Vec<(VersionOp, Version)>);

impl VersionConstraint {
    pub fn parse(spec: &str) -> Option<Self> {
        let mut out = Vec::new();
        for clause in spec.split(',') {
            let clause = clause.trim();
            let (op, rest) = [
                (">=", VersionOp::Ge),
                ("<=", VersionOp::Le),
                ("!=", VersionOp::NotEq),
                ("~>", VersionOp::Pessimistic),
                ("=", VersionOp::Eq),
                (">", VersionOp::Gt),
                ("<", VersionOp::Lt),
            ]
            .iter()
            .find_map(|(prefix, op)| clause.strip_prefix(prefix).map(|rest| (*op, rest)))
            .unwrap_or((VersionOp::Eq, clause));
            out.push((op, Version::parse(rest)?));
        }
        if out.is_empty() {
            return None;
        }
        Some(Self(out))
    }

    pub fn matches(&self, v: &Version) -> bool {
        self.0.iter().all(|(op, want)| match op {
            VersionOp::Eq => v == want,
            VersionOp::NotEq => v != want,
            VersionOp::Lt => v < want,
            VersionOp::Le => v <= want,
            VersionOp::Gt => v > want,
            VersionOp::Ge => v >= want,
            VersionOp::Pessimistic => {
                if v < want {
                    return false;
                }
                // ~> 1.2 allows 1.x; ~> 1.2.3 allows 1.2.x
                let fixed = want.0.len().saturating_sub(1).max(1);
                (0..fixed).all(|i| v.segment(i) == want.segment(i))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock;
    use rstest::rstest;

    #[test]
    fn test_resolve_targets() {
        let mut node = mock::node();
        node.attributes.insert("kernel.name".into(), "linux".into());
        node.meta.insert("rack".into(), "r1".into());

        assert_eq!(resolve_target("${attr.kernel.name}", &node).as_deref(), Some("linux"));
        assert_eq!(resolve_target("${meta.rack}", &node).as_deref(), Some("r1"));
        assert_eq!(resolve_target("${node.datacenter}", &node).as_deref(), Some("dc1"));
        assert_eq!(resolve_target("${attr.missing}", &node), None);
        assert_eq!(resolve_target("literal", &node).as_deref(), Some("literal"));
        assert_eq!(
            resolve_target("${node.unique.id}", &node).as_deref(),
            Some(node.id.to_string().as_str())
        );
    }

    #[rstest]
    #[case(Operand::Eq, Some("a"), Some("a"), true)]
    #[case(Operand::Eq, None, Some("a"), false)]
    #[case(Operand::NotEq, None, Some("a"), true)]
    #[case(Operand::NotEq, Some("a"), Some("a"), false)]
    #[case(Operand::Lt, Some("9"), Some("10"), true)]
    #[case(Operand::Lt, Some("b"), Some("a"), false)]
    #[case(Operand::Ge, Some("10"), Some("10"), true)]
    #[case(Operand::Regexp, Some("linux-amd64"), Some("^linux"), true)]
    #[case(Operand::Regexp, Some("darwin"), Some("^linux"), false)]
    #[case(Operand::Regexp, Some("x"), Some("("), false)]
    #[case(Operand::Version, Some("1.4.2"), Some(">= 1.2, < 2.0"), true)]
    #[case(Operand::Version, Some("2.0.0"), Some(">= 1.2, < 2.0"), false)]
    #[case(Operand::Version, Some("v1.2.9-beta"), Some("~> 1.2.3"), true)]
    #[case(Operand::Version, Some("1.3.0"), Some("~> 1.2.3"), false)]
    #[case(Operand::Version, Some("1.9"), Some("~> 1.2"), true)]
    #[case(Operand::SetContains, Some("a, b, c"), Some("a,c"), true)]
    #[case(Operand::SetContains, Some("a,b"), Some("a,d"), false)]
    #[case(Operand::SetContainsAny, Some("a,b"), Some("d,b"), true)]
    #[case(Operand::IsSet, Some("x"), None, true)]
    #[case(Operand::IsNotSet, Some("x"), None, false)]
    fn test_check_operand(
        #[case] operand: Operand,
        #[case] l: Option<&str>,
        #[case] r: Option<&str>,
        #[case] expected: bool,
    ) {
        let mut cache = ConstraintCache::new();
        assert_eq!(check_operand(operand, l, r, &mut cache), expected);
    }

    #[test]
    fn test_escaped_targets() {
        assert!(Constraint::new("${node.unique.id}", Operand::Eq, "x").escapes_computed_class());
        assert!(
            Constraint::new("${attr.unique.hostname}", Operand::Eq, "x").escapes_computed_class()
        );
        assert!(
            !Constraint::new("${attr.kernel.name}", Operand::Eq, "linux").escapes_computed_class()
        );
    }

    #[test]
    fn test_operand_accepts_symbols() {
        let c: Constraint =
            serde_json::from_str(
                r#"{"l_target":"${attr.cpu.numcores}","r_target":"4","operand":">="}"#,
            )
                .unwrap();
        assert_eq!(c.operand, Operand::Ge);
    }
}
