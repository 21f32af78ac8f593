//! Caching rules: which queries get cached, and for how long.
//!
//! A [`RuleSet`] is evaluated in order and every matching rule overwrites the
//! resulting TTL, so the *last* match wins. A [`Predicate::Passthrough`] rule
//! placed at the end therefore overrides everything before it.

mod rule_set;

pub use rule_set::{RuleChange, RuleSet, SubscriptionId};

use std::collections::BTreeSet;
use std::fmt;
use std::num::NonZeroU64;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{CacheError, CacheResult, ErrorKind};
use crate::registry::{Query, QueryId};

/// How long a result stays cached. The unit is seconds everywhere, including
/// the serialized form, where `0` means [`Ttl::NoCache`] and `-1` means
/// [`Ttl::Forever`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum Ttl {
    /// Do not cache.
    #[default]
    NoCache,
    /// Cache without expiry.
    Forever,
    /// Cache for this many seconds.
    Expire(NonZeroU64),
}

impl Ttl {
    /// Builds a TTL from its signed-seconds form.
    pub fn from_secs(secs: i64) -> CacheResult<Ttl> {
        match secs {
            0 => Ok(Ttl::NoCache),
            -1 => Ok(Ttl::Forever),
            n if n > 0 => Ok(Ttl::Expire(
                NonZeroU64::new(n as u64).unwrap_or(NonZeroU64::MIN),
            )),
            n => Err(CacheError::from((
                ErrorKind::InvalidRules,
                "TTL must be -1, 0 or positive",
                n.to_string(),
            ))),
        }
    }

    /// Shorthand for a positive expiry; zero yields [`Ttl::NoCache`].
    pub fn secs(secs: u64) -> Ttl {
        NonZeroU64::new(secs).map_or(Ttl::NoCache, Ttl::Expire)
    }

    /// The signed-seconds form.
    pub fn as_secs(self) -> i64 {
        match self {
            Ttl::NoCache => 0,
            Ttl::Forever => -1,
            Ttl::Expire(n) => i64::try_from(n.get()).unwrap_or(i64::MAX),
        }
    }

    /// Returns true unless this is [`Ttl::NoCache`].
    pub fn should_cache(self) -> bool {
        self != Ttl::NoCache
    }
}

impl TryFrom<i64> for Ttl {
    type Error = CacheError;

    fn try_from(secs: i64) -> CacheResult<Ttl> {
        Ttl::from_secs(secs)
    }
}

impl From<Ttl> for i64 {
    fn from(ttl: Ttl) -> i64 {
        ttl.as_secs()
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ttl::NoCache => f.write_str("no-cache"),
            Ttl::Forever => f.write_str("forever"),
            Ttl::Expire(n) => write!(f, "{n}s"),
        }
    }
}

/// The outcome of evaluating a query against a rule set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Action {
    pub ttl: Ttl,
}

impl Action {
    pub fn should_cache(&self) -> bool {
        self.ttl.should_cache()
    }
}

/// A regex that must match the whole SQL text.
#[derive(Clone, Debug)]
pub struct SqlPattern {
    source: String,
    regex: Regex,
}

impl SqlPattern {
    pub fn new(source: impl Into<String>) -> CacheResult<Self> {
        let source = source.into();
        let regex = Regex::new(&format!("^(?:{source})$"))
            .map_err(|err| invalid_rule_error!("Invalid SQL pattern", err))?;
        Ok(SqlPattern { source, regex })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, sql: &str) -> bool {
        self.regex.is_match(sql)
    }
}

impl PartialEq for SqlPattern {
    fn eq(&self, other: &SqlPattern) -> bool {
        self.source == other.source
    }
}

impl Eq for SqlPattern {}

/// What a rule matches on.
///
/// Table names are compared lower-cased. A table predicate never matches a
/// query without tables, and a table predicate with no tables never matches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Predicate {
    /// The query's table set equals this set.
    Tables(BTreeSet<String>),
    /// The query touches at least one of these tables.
    TablesAny(BTreeSet<String>),
    /// The query touches all of these tables, and maybe others.
    TablesAll(BTreeSet<String>),
    /// The whole SQL text matches.
    Regex(SqlPattern),
    /// The query id is listed.
    Ids(BTreeSet<QueryId>),
    /// Always matches.
    Passthrough,
}

impl Predicate {
    pub fn matches(&self, query: &Query) -> bool {
        let tables = query.tables();
        match self {
            Predicate::Tables(set) => !set.is_empty() && set == tables,
            Predicate::TablesAny(set) => !set.is_disjoint(tables),
            Predicate::TablesAll(set) => {
                !set.is_empty() && !tables.is_empty() && set.is_subset(tables)
            }
            Predicate::Regex(pattern) => pattern.is_match(query.sql()),
            Predicate::Ids(ids) => ids.contains(&query.id()),
            Predicate::Passthrough => true,
        }
    }
}

/// A predicate and the TTL it assigns.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RuleDef", into = "RuleDef")]
pub struct Rule {
    predicate: Predicate,
    ttl: Ttl,
}

pub(crate) fn normalize_tables<I, S>(tables: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tables
        .into_iter()
        .map(|t| t.as_ref().trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

impl Rule {
    pub fn new(predicate: Predicate, ttl: Ttl) -> Self {
        Rule { predicate, ttl }
    }

    /// Matches queries touching exactly these tables.
    pub fn tables<I, S>(tables: I, ttl: Ttl) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Rule::new(Predicate::Tables(normalize_tables(tables)), ttl)
    }

    /// Matches queries touching any of these tables.
    pub fn tables_any<I, S>(tables: I, ttl: Ttl) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Rule::new(Predicate::TablesAny(normalize_tables(tables)), ttl)
    }

    /// Matches queries touching all of these tables.
    pub fn tables_all<I, S>(tables: I, ttl: Ttl) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Rule::new(Predicate::TablesAll(normalize_tables(tables)), ttl)
    }

    /// Matches queries whose full SQL text matches `pattern`.
    pub fn regex(pattern: &str, ttl: Ttl) -> CacheResult<Self> {
        Ok(Rule::new(Predicate::Regex(SqlPattern::new(pattern)?), ttl))
    }

    /// Matches queries with one of these ids.
    pub fn ids<I>(ids: I, ttl: Ttl) -> Self
    where
        I: IntoIterator<Item = QueryId>,
    {
        Rule::new(Predicate::Ids(ids.into_iter().collect()), ttl)
    }

    /// Matches every query.
    pub fn passthrough(ttl: Ttl) -> Self {
        Rule::new(Predicate::Passthrough, ttl)
    }

    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    pub fn ttl(&self) -> Ttl {
        self.ttl
    }

    pub fn matches(&self, query: &Query) -> bool {
        self.predicate.matches(query)
    }
}

/// Serialized form of a [`Rule`].
#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RuleDef {
    Tables { tables: Vec<String>, ttl: Ttl },
    TablesAny { tables: Vec<String>, ttl: Ttl },
    TablesAll { tables: Vec<String>, ttl: Ttl },
    Regex { pattern: String, ttl: Ttl },
    Ids { ids: Vec<QueryId>, ttl: Ttl },
    Passthrough { ttl: Ttl },
}

impl TryFrom<RuleDef> for Rule {
    type Error = CacheError;

    fn try_from(def: RuleDef) -> CacheResult<Rule> {
        let rule = match def {
            RuleDef::Tables { tables, ttl } => Rule::tables(tables, ttl),
            RuleDef::TablesAny { tables, ttl } => Rule::tables_any(tables, ttl),
            RuleDef::TablesAll { tables, ttl } => Rule::tables_all(tables, ttl),
            RuleDef::Regex { pattern, ttl } => Rule::regex(&pattern, ttl)?,
            RuleDef::Ids { ids, ttl } => Rule::ids(ids, ttl),
            RuleDef::Passthrough { ttl } => Rule::passthrough(ttl),
        };
        Ok(rule)
    }
}

impl From<Rule> for RuleDef {
    fn from(rule: Rule) -> RuleDef {
        let ttl = rule.ttl;
        match rule.predicate {
            Predicate::Tables(t) => RuleDef::Tables {
                tables: t.into_iter().collect(),
                ttl,
            },
            Predicate::TablesAny(t) => RuleDef::TablesAny {
                tables: t.into_iter().collect(),
                ttl,
            },
            Predicate::TablesAll(t) => RuleDef::TablesAll {
                tables: t.into_iter().collect(),
                ttl,
            },
            Predicate::Regex(p) => RuleDef::Regex {
                pattern: p.source,
                ttl,
            },
            Predicate::Ids(ids) => RuleDef::Ids {
                ids: ids.into_iter().collect(),
                ttl,
            },
            Predicate::Passthrough => RuleDef::Passthrough { ttl },
        }
    }
}

/// Parses a JSON array of rules.
pub fn rules_from_json(json: &str) -> CacheResult<Vec<Rule>> {
    serde_json::from_str(json).map_err(|err| invalid_rule_error!("Malformed rule set", err))
}

/// Serializes rules to a JSON array.
pub fn rules_to_json(rules: &[Rule]) -> CacheResult<String> {
    Ok(serde_json::to_string(rules)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn query(sql: &str, tables: &[&str]) -> Query {
        Query::new(sql, normalize_tables(tables))
    }

    #[test]
    fn ttl_sentinels() {
        assert_eq!(Ttl::from_secs(0).unwrap(), Ttl::NoCache);
        assert_eq!(Ttl::from_secs(-1).unwrap(), Ttl::Forever);
        assert_eq!(Ttl::from_secs(60).unwrap(), Ttl::secs(60));
        assert_eq!(
            Ttl::from_secs(-5).unwrap_err().kind(),
            ErrorKind::InvalidRules
        );
        assert_eq!(Ttl::secs(60).as_secs(), 60);
        assert!(!Ttl::NoCache.should_cache());
        assert!(Ttl::Forever.should_cache());
    }

    #[rstest]
    #[case::equal(&["a", "b"], true)]
    #[case::reordered_and_cased(&["B", "a"], true)]
    #[case::superset(&["a", "b", "c"], false)]
    #[case::subset(&["a"], false)]
    #[case::disjoint(&["x"], false)]
    #[case::no_tables(&[], false)]
    fn exact_tables(#[case] tables: &[&str], #[case] expected: bool) {
        let rule = Rule::tables(["a", "b"], Ttl::secs(1));
        assert_eq!(rule.matches(&query("select 1", tables)), expected);
    }

    #[rstest]
    #[case::equal(&["a", "b"], true)]
    #[case::overlap(&["b", "z"], true)]
    #[case::superset(&["a", "b", "c"], true)]
    #[case::disjoint(&["x", "y"], false)]
    #[case::no_tables(&[], false)]
    fn any_tables(#[case] tables: &[&str], #[case] expected: bool) {
        let rule = Rule::tables_any(["a", "b"], Ttl::secs(1));
        assert_eq!(rule.matches(&query("select 1", tables)), expected);
    }

    #[rstest]
    #[case::equal(&["a", "b"], true)]
    #[case::superset(&["a", "b", "c"], true)]
    #[case::partial(&["a", "c"], false)]
    #[case::disjoint(&["x"], false)]
    #[case::no_tables(&[], false)]
    fn all_tables(#[case] tables: &[&str], #[case] expected: bool) {
        let rule = Rule::tables_all(["a", "b"], Ttl::secs(1));
        assert_eq!(rule.matches(&query("select 1", tables)), expected);
    }

    #[test]
    fn empty_table_predicates_never_match() {
        let q = query("select * from a", &["a"]);
        let none: [&str; 0] = [];
        assert!(!Rule::tables(none, Ttl::secs(1)).matches(&q));
        assert!(!Rule::tables_any(none, Ttl::secs(1)).matches(&q));
        assert!(!Rule::tables_all(none, Ttl::secs(1)).matches(&q));
    }

    #[test]
    fn regex_must_match_whole_text() {
        let rule = Rule::regex("(?i)select .* from orders", Ttl::secs(1)).unwrap();
        assert!(rule.matches(&query("SELECT id FROM orders", &[])));
        assert!(!rule.matches(&query("SELECT id FROM orders WHERE id = 1", &[])));
        assert!(Rule::regex("select (", Ttl::secs(1)).is_err());
    }

    #[test]
    fn id_and_passthrough_match_without_tables() {
        let q = query("not really sql", &[]);
        assert!(Rule::ids([q.id()], Ttl::secs(1)).matches(&q));
        assert!(!Rule::ids([QueryId(q.id().0.wrapping_add(1))], Ttl::secs(1)).matches(&q));
        assert!(Rule::passthrough(Ttl::secs(1)).matches(&q));
    }

    #[test]
    fn rules_json_round_trip() {
        let rules = vec![
            Rule::tables(["orders"], Ttl::secs(60)),
            Rule::tables_any(["a", "b"], Ttl::secs(10)),
            Rule::tables_all(["a", "b"], Ttl::Forever),
            Rule::regex("select 1", Ttl::secs(5)).unwrap(),
            Rule::ids([QueryId(7)], Ttl::NoCache),
            Rule::passthrough(Ttl::secs(30)),
        ];
        let json = rules_to_json(&rules).unwrap();
        assert_eq!(rules_from_json(&json).unwrap(), rules);
    }

    #[test]
    fn rules_json_layout() {
        let json = concat!(
            r#"[{"kind":"tables_any","tables":["Orders"],"ttl":10},"#,
            r#"{"kind":"passthrough","ttl":-1}]"#,
        );
        let rules = rules_from_json(json).unwrap();
        assert_eq!(
            rules,
            vec![
                Rule::tables_any(["orders"], Ttl::secs(10)),
                Rule::passthrough(Ttl::Forever)
            ]
        );
    }

    #[rstest]
    #[case::not_json("nope")]
    #[case::bad_kind(r#"[{"kind":"sometimes","ttl":1}]"#)]
    #[case::bad_ttl(r#"[{"kind":"passthrough","ttl":-9}]"#)]
    #[case::bad_regex(r#"[{"kind":"regex","pattern":"(","ttl":1}]"#)]
    fn malformed_rules_are_rejected(#[case] json: &str) {
        let err = rules_from_json(json).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRules);
    }
}
