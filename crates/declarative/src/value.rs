//! Attribute values and references between resources
//!
//! Input attributes are plain JSON-like data, except that a string of the
//! exact form `${resource.<name>.<attr>}` is a [`Reference`] to another
//! resource's output. References are the only dependency edges the graph
//! builder infers on its own.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::fmt;

const VAR_PREFIX: &str = "${var.";
const RESOURCE_MARKER: &str = "${resource.";

/// Resolved attributes: what providers receive and return
pub type Attributes = BTreeMap<String, Json>;

/// A pointer to another resource's output attribute
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference {
    /// Logical name of the referenced resource
    pub resource: String,
    /// Output attribute; dots descend into maps and lists
    pub attribute: String,
}

impl Reference {
    pub fn new(resource: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            attribute: attribute.into(),
        }
    }

    /// Parse `resource.<name>.<attr>` (without the `${}` wrapper)
    pub fn parse(expr: &str) -> Option<Self> {
        let rest = expr.strip_prefix("resource.")?;
        let (resource, attribute) = rest.split_once('.')?;
        if resource.is_empty() || attribute.is_empty() {
            return None;
        }
        Some(Self::new(resource, attribute))
    }

    /// Parse a whole `${resource.<name>.<attr>}` string
    fn parse_wrapped(s: &str) -> Option<Self> {
        let inner = s.strip_prefix("${")?.strip_suffix('}')?;
        if inner.contains('{') || inner.contains('}') {
            return None;
        }
        Self::parse(inner)
    }

    /// Find the referenced attribute in a set of outputs
    pub fn lookup<'a>(&self, outputs: &'a Attributes) -> Option<&'a Json> {
        let mut parts = self.attribute.split('.');
        let mut current = outputs.get(parts.next()?)?;
        for part in parts {
            current = match current {
                Json::Object(map) => map.get(part)?,
                Json::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "resource.{}.{}", self.resource, self.attribute)
    }
}

/// An input attribute value, possibly containing references
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Json", into = "Json")]
pub enum Value {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Ref(Reference),
}

impl Value {
    /// Build a reference value
    pub fn reference(resource: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self::Ref(Reference::new(resource, attribute))
    }

    /// All references contained in this value
    pub fn references(&self) -> Vec<&Reference> {
        let mut found = Vec::new();
        self.collect_references(&mut found);
        found
    }

    fn collect_references<'a>(&'a self, found: &mut Vec<&'a Reference>) {
        match self {
            Self::Ref(r) => found.push(r),
            Self::List(items) => items.iter().for_each(|v| v.collect_references(found)),
            Self::Map(map) => map.values().for_each(|v| v.collect_references(found)),
            _ => {}
        }
    }

    /// Resolve references through `lookup`.
    ///
    /// Returns `None` when any reference is unknown (not yet applied).
    pub fn resolve<F>(&self, lookup: &mut F) -> Option<Json>
    where
        F: FnMut(&Reference) -> Option<Json>,
    {
        Some(match self {
            Self::Null => Json::Null,
            Self::Bool(b) => Json::Bool(*b),
            Self::Number(n) => Json::Number(n.clone()),
            Self::String(s) => Json::String(s.clone()),
            Self::Ref(r) => lookup(r)?,
            Self::List(items) => Json::Array(
                items
                    .iter()
                    .map(|v| v.resolve(&mut *lookup))
                    .collect::<Option<Vec<_>>>()?,
            ),
            Self::Map(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), v.resolve(&mut *lookup)?);
                }
                Json::Object(out)
            }
        })
    }

    /// Replace `${var.<name>}` occurrences with parameter values.
    ///
    /// A string that is exactly one substitution takes the parameter's type;
    /// embedded substitutions are interpolated as text. Returns the name of
    /// the first undefined parameter on failure.
    pub(crate) fn substitute_parameters(&self, params: &Attributes) -> Result<Self, String> {
        Ok(match self {
            Self::String(s) => {
                if let Some(name) = whole_parameter(s) {
                    let value = params.get(name).ok_or_else(|| name.to_string())?;
                    Self::from(value.clone())
                } else if s.contains(VAR_PREFIX) {
                    Self::String(interpolate(s, params)?)
                } else {
                    self.clone()
                }
            }
            Self::List(items) => Self::List(
                items
                    .iter()
                    .map(|v| v.substitute_parameters(params))
                    .collect::<Result<_, _>>()?,
            ),
            Self::Map(map) => Self::Map(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), v.substitute_parameters(params)?)))
                    .collect::<Result<_, String>>()?,
            ),
            _ => self.clone(),
        })
    }

    /// A string that mentions a resource reference without being one.
    ///
    /// Such strings would hide a dependency edge, so they are rejected.
    pub(crate) fn embedded_reference(&self) -> Option<&str> {
        match self {
            Self::String(s) if s.contains(RESOURCE_MARKER) => Some(s),
            Self::List(items) => items.iter().find_map(Self::embedded_reference),
            Self::Map(map) => map.values().find_map(Self::embedded_reference),
            _ => None,
        }
    }
}

fn whole_parameter(s: &str) -> Option<&str> {
    let name = s.strip_prefix(VAR_PREFIX)?.strip_suffix('}')?;
    if name.is_empty() || name.contains('{') || name.contains('}') {
        return None;
    }
    Some(name)
}

fn interpolate(s: &str, params: &Attributes) -> Result<String, String> {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find(VAR_PREFIX) {
        out.push_str(&rest[..start]);
        let after = &rest[start + VAR_PREFIX.len()..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let name = &after[..end];
        match params.get(name).ok_or_else(|| name.to_string())? {
            Json::String(text) => out.push_str(text),
            other => out.push_str(&other.to_string()),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

impl From<Json> for Value {
    fn from(json: Json) -> Self {
        match json {
            Json::Null => Self::Null,
            Json::Bool(b) => Self::Bool(b),
            Json::Number(n) => Self::Number(n),
            Json::String(s) => match Reference::parse_wrapped(&s) {
                Some(r) => Self::Ref(r),
                None => Self::String(s),
            },
            Json::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            Json::Object(map) => Self::Map(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect()),
        }
    }
}

impl From<Value> for Json {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::Number(n),
            Value::String(s) => Self::String(s),
            Value::Ref(r) => Self::String(format!("${{{r}}}")),
            Value::List(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            Value::Map(map) => Self::Object(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::from(Json::String(s.to_string()))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::from(Json::String(s))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_reference_string() {
        let value = Value::from("${resource.network.id}");
        assert_eq!(value, Value::reference("network", "id"));

        // Embedded references are plain strings
        let value = Value::from("arn:${resource.network.id}");
        assert!(matches!(value, Value::String(_)));
        assert!(value.embedded_reference().is_some());
    }

    #[test]
    fn test_reference_round_trips_through_json() {
        let json = Json::from(Value::reference("cluster", "endpoint"));
        assert_eq!(json, json!("${resource.cluster.endpoint}"));
    }

    #[test]
    fn test_references_walks_nested_values() {
        let value = Value::from(json!({
            "subnets": ["${resource.a.id}", "${resource.b.id}"],
            "tags": {"owner": "${resource.c.arn}", "team": "ml"}
        }));
        let targets: Vec<_> = value.references().iter().map(|r| r.resource.as_str()).collect();
        assert_eq!(targets, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_lookup_nested_attribute() {
        let mut outputs = Attributes::new();
        outputs.insert("oidc".into(), json!({"issuer": "https://oidc.example"}));
        outputs.insert("subnet_ids".into(), json!(["s-1", "s-2"]));

        assert_eq!(
            Reference::new("cluster", "oidc.issuer").lookup(&outputs),
            Some(&json!("https://oidc.example"))
        );
        assert_eq!(
            Reference::new("vpc", "subnet_ids.1").lookup(&outputs),
            Some(&json!("s-2"))
        );
        assert_eq!(Reference::new("vpc", "missing").lookup(&outputs), None);
    }

    #[test]
    fn test_resolve_unknown_reference() {
        let value = Value::from(json!(["${resource.a.id}", "literal"]));
        let known = value.resolve(&mut |_| Some(json!("vpc-1")));
        assert_eq!(known, Some(json!(["vpc-1", "literal"])));

        let unknown = value.resolve(&mut |_| None);
        assert_eq!(unknown, None);
    }

    #[test]
    fn test_substitute_parameters() {
        let mut params = Attributes::new();
        params.insert("node_count".into(), json!(3));
        params.insert("region".into(), json!("us-east-1"));

        let whole = Value::from("${var.node_count}");
        assert_eq!(whole.substitute_parameters(&params), Ok(Value::from(3_i64)));

        let embedded = Value::from("nim-${var.region}-${var.node_count}");
        assert_eq!(
            embedded.substitute_parameters(&params),
            Ok(Value::from("nim-us-east-1-3"))
        );

        let missing = Value::from(json!({"x": "${var.nope}"}));
        assert_eq!(missing.substitute_parameters(&params), Err("nope".to_string()));
    }
}
