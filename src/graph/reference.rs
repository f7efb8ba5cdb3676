//! `${name.attr}` references inside property values.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

use crate::config::Properties;

#[allow(clippy::expect_used)]
static REFERENCE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z0-9][A-Za-z0-9_-]*)\.([A-Za-z_][A-Za-z0-9_]*)\}").expect("reference pattern is valid")
});

/// A reference to an exported attribute of another resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference {
    /// Logical name of the referenced resource.
    pub target: String,
    /// Exported attribute (`id` for the physical id).
    pub attribute: String,
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "${{{}.{}}}", self.target, self.attribute)
    }
}

/// Returns true if the value, or anything nested in it, holds a reference.
#[must_use]
pub fn contains_reference(value: &Value) -> bool {
    match value {
        Value::String(s) => REFERENCE_PATTERN.is_match(s),
        Value::Array(items) => items.iter().any(contains_reference),
        Value::Object(map) => map.values().any(contains_reference),
        _ => false,
    }
}

/// Collects every reference in a value, depth first.
#[must_use]
pub fn extract_references(value: &Value) -> Vec<Reference> {
    let mut found = Vec::new();
    walk_strings(value, &mut |s| {
        for caps in REFERENCE_PATTERN.captures_iter(s) {
            found.push(Reference {
                target: caps[1].to_string(),
                attribute: caps[2].to_string(),
            });
        }
    });
    found
}

/// Returns `(top-level field, reference)` pairs for a property bag.
#[must_use]
pub fn field_references(properties: &Properties) -> Vec<(String, Reference)> {
    properties
        .iter()
        .flat_map(|(field, value)| {
            extract_references(value)
                .into_iter()
                .map(move |r| (field.clone(), r))
        })
        .collect()
}

/// Returns strings containing `${` that are not well-formed references.
#[must_use]
pub fn malformed_references(value: &Value) -> Vec<String> {
    let mut found = Vec::new();
    walk_strings(value, &mut |s| {
        if REFERENCE_PATTERN.replace_all(s, "").contains("${") {
            found.push(s.to_string());
        }
    });
    found
}

/// Substitutes references using `lookup`.
///
/// A string that is exactly one reference takes the referenced value as is,
/// so numbers and lists survive. References embedded in longer strings are
/// interpolated.
///
/// # Errors
///
/// Returns the first reference `lookup` could not answer.
pub fn resolve_value<F>(value: &Value, lookup: &F) -> Result<Value, Reference>
where
    F: Fn(&Reference) -> Option<Value>,
{
    match value {
        Value::String(s) => resolve_string(s, lookup),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(item, lookup))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| resolve_value(v, lookup).map(|resolved| (k.clone(), resolved)))
            .collect::<Result<serde_json::Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

/// Resolves every property of a bag.
///
/// # Errors
///
/// Returns the first reference `lookup` could not answer.
pub fn resolve_properties<F>(properties: &Properties, lookup: &F) -> Result<Properties, Reference>
where
    F: Fn(&Reference) -> Option<Value>,
{
    properties
        .iter()
        .map(|(k, v)| resolve_value(v, lookup).map(|resolved| (k.clone(), resolved)))
        .collect()
}

fn resolve_string<F>(s: &str, lookup: &F) -> Result<Value, Reference>
where
    F: Fn(&Reference) -> Option<Value>,
{
    let mut out = String::with_capacity(s.len());
    let mut last = 0;

    for caps in REFERENCE_PATTERN.captures_iter(s) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let reference = Reference {
            target: caps[1].to_string(),
            attribute: caps[2].to_string(),
        };
        let Some(value) = lookup(&reference) else {
            return Err(reference);
        };

        if whole.start() == 0 && whole.end() == s.len() {
            return Ok(value);
        }

        out.push_str(&s[last..whole.start()]);
        match value {
            Value::String(text) => out.push_str(&text),
            other => out.push_str(&other.to_string()),
        }
        last = whole.end();
    }

    out.push_str(&s[last..]);
    Ok(Value::String(out))
}

fn walk_strings(value: &Value, visit: &mut impl FnMut(&str)) {
    match value {
        Value::String(s) => visit(s),
        Value::Array(items) => {
            for item in items {
                walk_strings(item, visit);
            }
        }
        Value::Object(map) => {
            for v in map.values() {
                walk_strings(v, visit);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs(reference: &Reference) -> Option<Value> {
        match (reference.target.as_str(), reference.attribute.as_str()) {
            ("cluster", "name") => Some(json!("eks-sandbox")),
            ("cluster", "oidc_issuer") => Some(json!("oidc.example/abc")),
            ("pool", "max") => Some(json!(3)),
            _ => None,
        }
    }

    #[test]
    fn test_extract_nested_references() {
        let value = json!({
            "conditions": {"StringEquals": {"${cluster.oidc_issuer}:aud": "sts", "sub": "${cluster.oidc_issuer}:sub"}},
            "cluster_name": ["${cluster.name}"]
        });
        let refs = extract_references(&value);
        assert_eq!(refs.len(), 2);
        assert!(refs.iter().all(|r| r.target == "cluster"));
    }

    #[test]
    fn test_whole_string_reference_keeps_type() {
        let resolved = resolve_value(&json!("${pool.max}"), &outputs).expect("resolve");
        assert_eq!(resolved, json!(3));
    }

    #[test]
    fn test_interpolation() {
        let resolved = resolve_value(&json!("${cluster.oidc_issuer}:sub"), &outputs).expect("resolve");
        assert_eq!(resolved, json!("oidc.example/abc:sub"));
    }

    #[test]
    fn test_unresolved_reference_is_reported() {
        let err = resolve_value(&json!(["${cluster.name}", "${role.arn}"]), &outputs).expect_err("should fail");
        assert_eq!(err.to_string(), "${role.arn}");
    }

    #[test]
    fn test_malformed_references() {
        assert_eq!(malformed_references(&json!("${cluster}")), vec!["${cluster}"]);
        assert!(malformed_references(&json!("${cluster.name}")).is_empty());
        assert!(!contains_reference(&json!("plain text")));
    }
}
