//! Aggregation key derivation.
//!
//! A [`KeyMapper`] turns a [`VersionedRequest`] into the [`AggregationKey`]
//! under which equivalent downstream requests share one cache entry and one
//! upstream subscription. Rules are plain data ([`AggregationRules`]) that are
//! compiled once; key computation is a pure function of the request.

use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::versioned::VersionedRequest;

/// Separator between the fragments of a rule-generated key.
const FRAGMENT_SEPARATOR: &str = "_";

/// Identifier shared by all requests that aggregate into one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AggregationKey(Arc<str>);

impl AggregationKey {
    /// Create a key from its string form.
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    /// The string form of this key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AggregationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AggregationKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// Matching rules for aggregation keys.
///
/// Rules are evaluated in order and the first matching rule builds the key.
/// When no rule matches, the key falls back to the request's type URL and its
/// sorted resource names unless `require_match` is set.
///
/// # Example
///
/// ```
/// use xds_relay::mapper::{AggregationRules, KeyMapper};
///
/// let rules: AggregationRules = serde_json::from_str(r#"{
///     "rules": [{
///         "match": { "node_cluster": { "exact": "production" } },
///         "key": [ "type_url", { "node_cluster": {} } ]
///     }]
/// }"#).unwrap();
///
/// let mapper = KeyMapper::new(&rules).unwrap();
/// # let _ = mapper;
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregationRules {
    /// Ordered rules; first match wins.
    #[serde(default)]
    pub rules: Vec<MatchRule>,
    /// Reject requests that no rule matches instead of using the default key.
    #[serde(default)]
    pub require_match: bool,
}

/// A predicate and the key template used when it matches.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatchRule {
    /// When this rule applies.
    #[serde(rename = "match")]
    pub predicate: Predicate,
    /// Fragments joined with `_` to form the key.
    pub key: Vec<KeyFragment>,
}

/// A condition over a request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    /// Always matches.
    Any,
    /// The request's type URL is one of the listed ones.
    RequestType(Vec<String>),
    /// Node id matches.
    NodeId(StringMatch),
    /// Node cluster matches.
    NodeCluster(StringMatch),
    /// Node locality region matches.
    NodeRegion(StringMatch),
    /// Node locality zone matches.
    NodeZone(StringMatch),
    /// Node locality sub-zone matches.
    NodeSubZone(StringMatch),
    /// At least one requested resource name matches.
    ResourceName(StringMatch),
    /// Every inner predicate matches.
    And(Vec<Predicate>),
    /// At least one inner predicate matches.
    Or(Vec<Predicate>),
    /// The inner predicate does not match.
    Not(Box<Predicate>),
}

/// How a string field is compared.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StringMatch {
    /// Byte-for-byte equality.
    Exact(String),
    /// Unanchored regular expression.
    Regex(String),
}

/// One part of a generated key.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyFragment {
    /// A fixed string.
    Literal(String),
    /// The request's type URL.
    TypeUrl,
    /// The node id.
    NodeId(FieldFragment),
    /// The node cluster.
    NodeCluster(FieldFragment),
    /// The node locality region.
    NodeRegion(FieldFragment),
    /// The node locality zone.
    NodeZone(FieldFragment),
    /// The node locality sub-zone.
    NodeSubZone(FieldFragment),
    /// The requested resource names, sorted and comma-joined.
    ResourceNames(FieldFragment),
}

/// Options for a fragment copied from a request field.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldFragment {
    /// Rewrite applied to the field value before it enters the key.
    #[serde(default)]
    pub rewrite: Option<Rewrite>,
}

/// A regex replacement; `replace` may reference capture groups (`$1`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rewrite {
    /// Pattern to search for.
    pub pattern: String,
    /// Replacement for every match.
    pub replace: String,
}

/// Request fields that predicates and fragments can read.
#[derive(Debug, Clone, Copy)]
enum Field {
    NodeId,
    NodeCluster,
    NodeRegion,
    NodeZone,
    NodeSubZone,
}

impl Field {
    fn read<'a>(&self, request: &'a VersionedRequest) -> &'a str {
        match self {
            Self::NodeId => request.node_id(),
            Self::NodeCluster => request.node_cluster(),
            Self::NodeRegion => request.node_locality().region,
            Self::NodeZone => request.node_locality().zone,
            Self::NodeSubZone => request.node_locality().sub_zone,
        }
    }
}

#[derive(Debug)]
enum Matcher {
    Exact(String),
    Regex(Regex),
}

impl Matcher {
    fn compile(m: &StringMatch) -> Result<Self> {
        match m {
            StringMatch::Exact(s) => Ok(Self::Exact(s.clone())),
            StringMatch::Regex(pattern) => compile_regex(pattern).map(Self::Regex),
        }
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            Self::Exact(s) => s == value,
            Self::Regex(re) => re.is_match(value),
        }
    }
}

#[derive(Debug)]
enum CompiledPredicate {
    Any,
    RequestType(Vec<String>),
    Field(Field, Matcher),
    ResourceName(Matcher),
    And(Vec<CompiledPredicate>),
    Or(Vec<CompiledPredicate>),
    Not(Box<CompiledPredicate>),
}

impl CompiledPredicate {
    fn compile(predicate: &Predicate) -> Result<Self> {
        let compiled = match predicate {
            Predicate::Any => Self::Any,
            Predicate::RequestType(type_urls) => {
                if type_urls.is_empty() {
                    return Err(Error::InvalidRules(
                        "request_type must list at least one type URL".into(),
                    ));
                }
                Self::RequestType(type_urls.clone())
            }
            Predicate::NodeId(m) => Self::Field(Field::NodeId, Matcher::compile(m)?),
            Predicate::NodeCluster(m) => Self::Field(Field::NodeCluster, Matcher::compile(m)?),
            Predicate::NodeRegion(m) => Self::Field(Field::NodeRegion, Matcher::compile(m)?),
            Predicate::NodeZone(m) => Self::Field(Field::NodeZone, Matcher::compile(m)?),
            Predicate::NodeSubZone(m) => Self::Field(Field::NodeSubZone, Matcher::compile(m)?),
            Predicate::ResourceName(m) => Self::ResourceName(Matcher::compile(m)?),
            Predicate::And(inner) => Self::And(Self::compile_all(inner, "and")?),
            Predicate::Or(inner) => Self::Or(Self::compile_all(inner, "or")?),
            Predicate::Not(inner) => Self::Not(Box::new(Self::compile(inner)?)),
        };
        Ok(compiled)
    }

    fn compile_all(predicates: &[Predicate], combinator: &str) -> Result<Vec<Self>> {
        if predicates.is_empty() {
            return Err(Error::InvalidRules(format!(
                "`{combinator}` needs at least one predicate"
            )));
        }
        predicates.iter().map(Self::compile).collect()
    }

    fn matches(&self, request: &VersionedRequest) -> bool {
        match self {
            Self::Any => true,
            Self::RequestType(type_urls) => type_urls.iter().any(|t| t == request.type_url()),
            Self::Field(field, m) => m.matches(field.read(request)),
            Self::ResourceName(m) => request.resource_names().iter().any(|n| m.matches(n)),
            Self::And(inner) => inner.iter().all(|p| p.matches(request)),
            Self::Or(inner) => inner.iter().any(|p| p.matches(request)),
            Self::Not(inner) => !inner.matches(request),
        }
    }
}

#[derive(Debug)]
enum CompiledFragment {
    Literal(String),
    TypeUrl,
    Field(Field, Option<(Regex, String)>),
    ResourceNames(Option<(Regex, String)>),
}

impl CompiledFragment {
    fn compile(fragment: &KeyFragment) -> Result<Self> {
        let from_field = |field: Field, options: &FieldFragment| -> Result<Self> {
            Ok(Self::Field(field, compile_rewrite(options)?))
        };
        match fragment {
            KeyFragment::Literal(s) => Ok(Self::Literal(s.clone())),
            KeyFragment::TypeUrl => Ok(Self::TypeUrl),
            KeyFragment::NodeId(o) => from_field(Field::NodeId, o),
            KeyFragment::NodeCluster(o) => from_field(Field::NodeCluster, o),
            KeyFragment::NodeRegion(o) => from_field(Field::NodeRegion, o),
            KeyFragment::NodeZone(o) => from_field(Field::NodeZone, o),
            KeyFragment::NodeSubZone(o) => from_field(Field::NodeSubZone, o),
            KeyFragment::ResourceNames(o) => Ok(Self::ResourceNames(compile_rewrite(o)?)),
        }
    }

    fn render(&self, request: &VersionedRequest) -> String {
        match self {
            Self::Literal(s) => s.clone(),
            Self::TypeUrl => request.type_url().to_owned(),
            Self::Field(field, rewrite) => apply_rewrite(field.read(request), rewrite.as_ref()),
            Self::ResourceNames(rewrite) => {
                let mut names: Vec<String> = request
                    .resource_names()
                    .iter()
                    .map(|n| apply_rewrite(n, rewrite.as_ref()))
                    .collect();
                names.sort_unstable();
                names.dedup();
                names.join(",")
            }
        }
    }
}

#[derive(Debug)]
struct CompiledRule {
    predicate: CompiledPredicate,
    key: Vec<CompiledFragment>,
}

/// Compiled aggregation rules.
#[derive(Debug)]
pub struct KeyMapper {
    rules: Vec<CompiledRule>,
    require_match: bool,
}

impl KeyMapper {
    /// Compile `rules`, validating every pattern.
    pub fn new(rules: &AggregationRules) -> Result<Self> {
        let compiled = rules
            .rules
            .iter()
            .enumerate()
            .map(|(i, rule)| {
                if rule.key.is_empty() {
                    return Err(Error::InvalidRules(format!("rule {i} has an empty key")));
                }
                Ok(CompiledRule {
                    predicate: CompiledPredicate::compile(&rule.predicate)?,
                    key: rule
                        .key
                        .iter()
                        .map(CompiledFragment::compile)
                        .collect::<Result<_>>()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            rules: compiled,
            require_match: rules.require_match,
        })
    }

    /// A mapper with no rules; every request gets the default key.
    pub fn default_only() -> Self {
        Self {
            rules: Vec::new(),
            require_match: false,
        }
    }

    /// Compute the aggregation key for `request`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoMatchingRule`] when no rule matches and a match is required.
    pub fn compute_key(&self, request: &VersionedRequest) -> Result<AggregationKey> {
        if let Some(rule) = self.rules.iter().find(|r| r.predicate.matches(request)) {
            let parts: Vec<String> = rule.key.iter().map(|f| f.render(request)).collect();
            return Ok(AggregationKey::new(parts.join(FRAGMENT_SEPARATOR)));
        }

        if self.require_match {
            return Err(Error::NoMatchingRule {
                type_url: request.type_url().to_owned(),
            });
        }

        Ok(default_key(request))
    }
}

fn default_key(request: &VersionedRequest) -> AggregationKey {
    let mut names: Vec<&str> = request.resource_names().iter().map(String::as_str).collect();
    names.sort_unstable();
    names.dedup();
    AggregationKey::new(format!("{}|{}", request.type_url(), names.join(",")))
}

fn compile_regex(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|source| Error::Regex {
        pattern: pattern.to_owned(),
        source,
    })
}

fn compile_rewrite(options: &FieldFragment) -> Result<Option<(Regex, String)>> {
    options
        .rewrite
        .as_ref()
        .map(|r| Ok((compile_regex(&r.pattern)?, r.replace.clone())))
        .transpose()
}

fn apply_rewrite(value: &str, rewrite: Option<&(Regex, String)>) -> String {
    match rewrite {
        Some((re, replace)) => re.replace_all(value, replace.as_str()).into_owned(),
        None => value.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envoy_types::pb::envoy::config::core::v3 as core;
    use envoy_types::pb::envoy::service::discovery::v3::DiscoveryRequest;

    const CLUSTER: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
    const LISTENER: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";

    fn request(type_url: &str, cluster: &str, names: &[&str]) -> VersionedRequest {
        VersionedRequest::from_v3(DiscoveryRequest {
            type_url: type_url.to_string(),
            resource_names: names.iter().map(|n| n.to_string()).collect(),
            node: Some(core::Node {
                id: "envoy-1".to_string(),
                cluster: cluster.to_string(),
                locality: Some(core::Locality {
                    region: "us-east-1".to_string(),
                    zone: "us-east-1a".to_string(),
                    sub_zone: String::new(),
                }),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn mapper(json: &str) -> KeyMapper {
        let rules: AggregationRules = serde_json::from_str(json).unwrap();
        KeyMapper::new(&rules).unwrap()
    }

    #[test]
    fn test_default_key_sorts_and_dedups_names() {
        let mapper = KeyMapper::default_only();
        let a = mapper
            .compute_key(&request(CLUSTER, "c", &["b", "a"]))
            .unwrap();
        let b = mapper
            .compute_key(&request(CLUSTER, "other", &["a", "b", "a"]))
            .unwrap();

        assert_eq!(a, b);
        assert_eq!(a.as_str(), format!("{CLUSTER}|a,b"));
    }

    #[test]
    fn test_default_key_separates_different_names() {
        let mapper = KeyMapper::default_only();
        let a = mapper.compute_key(&request(CLUSTER, "c", &["a"])).unwrap();
        let b = mapper.compute_key(&request(CLUSTER, "c", &["b"])).unwrap();
        let c = mapper.compute_key(&request(LISTENER, "c", &["a"])).unwrap();

        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let mapper = mapper(
            r#"{
                "rules": [
                    {
                        "match": { "and": [
                            { "request_type": ["type.googleapis.com/envoy.config.cluster.v3.Cluster"] },
                            { "node_cluster": { "regex": "^production" } }
                        ]},
                        "key": [ { "literal": "cds" }, { "node_cluster": {} } ]
                    },
                    {
                        "match": "any",
                        "key": [ "type_url", { "node_region": {} } ]
                    }
                ]
            }"#,
        );

        let prod = mapper
            .compute_key(&request(CLUSTER, "production-web", &["x"]))
            .unwrap();
        assert_eq!(prod.as_str(), "cds_production-web");

        let other = mapper
            .compute_key(&request(LISTENER, "production-web", &["x"]))
            .unwrap();
        assert_eq!(other.as_str(), format!("{LISTENER}_us-east-1"));
    }

    #[test]
    fn test_compute_key_is_deterministic() {
        let mapper = mapper(
            r#"{
                "rules": [{
                    "match": { "resource_name": { "regex": "_production_" } },
                    "key": [ "type_url", { "resource_names": {} } ]
                }]
            }"#,
        );
        let req = request(CLUSTER, "c", &["foo_production_*", "bar_production_*"]);

        let first = mapper.compute_key(&req).unwrap();
        for _ in 0..10 {
            assert_eq!(mapper.compute_key(&req).unwrap(), first);
        }
        assert_eq!(
            first.as_str(),
            format!("{CLUSTER}_bar_production_*,foo_production_*")
        );
    }

    #[test]
    fn test_rewrite_collapses_node_ids() {
        let mapper = mapper(
            r#"{
                "rules": [{
                    "match": { "not": { "node_id": { "exact": "" } } },
                    "key": [
                        { "node_id": { "rewrite": { "pattern": "-\\d+$", "replace": "" } } },
                        "type_url"
                    ]
                }]
            }"#,
        );

        let key = mapper.compute_key(&request(CLUSTER, "c", &[])).unwrap();
        assert_eq!(key.as_str(), format!("envoy_{CLUSTER}"));
    }

    #[test]
    fn test_require_match_rejects_unmatched_request() {
        let mapper = mapper(
            r#"{
                "require_match": true,
                "rules": [{
                    "match": { "or": [ { "node_zone": { "exact": "eu-west-1a" } } ] },
                    "key": [ "type_url" ]
                }]
            }"#,
        );

        let err = mapper
            .compute_key(&request(CLUSTER, "c", &["a"]))
            .unwrap_err();
        assert!(matches!(err, Error::NoMatchingRule { type_url } if type_url == CLUSTER));
    }

    #[test]
    fn test_invalid_regex_is_rejected() {
        let rules: AggregationRules = serde_json::from_str(
            r#"{ "rules": [{ "match": { "node_id": { "regex": "(" } }, "key": ["type_url"] }] }"#,
        )
        .unwrap();

        assert!(matches!(KeyMapper::new(&rules), Err(Error::Regex { .. })));
    }

    #[test]
    fn test_empty_key_is_rejected() {
        let rules: AggregationRules =
            serde_json::from_str(r#"{ "rules": [{ "match": "any", "key": [] }] }"#).unwrap();

        assert!(matches!(KeyMapper::new(&rules), Err(Error::InvalidRules(_))));
    }
}
