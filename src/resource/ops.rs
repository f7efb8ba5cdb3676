//! Per-type operation tables.
//!
//! Each [`ResourceType`] maps to one static [`TypeOps`] describing which
//! properties are required, which force a replacement when changed, which
//! attributes the provider exports, and how properties are validated and
//! compared.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;

use crate::config::Properties;
use crate::graph::contains_reference;

use super::kind::ResourceType;

/// How an action on a resource is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    /// Sent to the provider control plane.
    Remote,
    /// Materialised by the executor without a provider call.
    Local,
}

/// A single property-level difference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    /// Property (or sub-document) that differs.
    pub field: String,
    /// Last-applied value.
    pub old_value: Option<Value>,
    /// Desired value.
    pub new_value: Option<Value>,
    /// Whether the change cannot be applied in place.
    pub forces_replacement: bool,
}

/// Validation function: returns human-readable problems.
pub type ValidateFn = fn(&Properties) -> Vec<String>;

/// Diff function: compares last-applied against desired properties.
pub type DiffFn = fn(&TypeOps, &Properties, &Properties) -> Vec<FieldChange>;

/// Operation table for one resource type.
#[derive(Debug)]
pub struct TypeOps {
    /// The type this table describes.
    pub resource_type: ResourceType,
    /// Properties that must be present.
    pub required: &'static [&'static str],
    /// Properties whose change forces delete-then-create.
    pub immutable: &'static [&'static str],
    /// List properties compared without regard to order.
    pub unordered: &'static [&'static str],
    /// Attributes other resources may reference (`id` is always available).
    pub exports: &'static [&'static str],
    /// Where actions are executed.
    pub handler: Handler,
    /// Type-specific validation.
    pub validate: ValidateFn,
    /// Type-specific property comparison.
    pub diff: DiffFn,
}

impl TypeOps {
    /// Returns true if changing `field` forces a replacement.
    #[must_use]
    pub fn is_immutable(&self, field: &str) -> bool {
        self.immutable.contains(&field)
    }

    /// Returns true if `attribute` can be referenced on this type.
    #[must_use]
    pub fn exports_attribute(&self, attribute: &str) -> bool {
        attribute == "id" || self.exports.contains(&attribute)
    }

    /// Returns the names of required properties missing from `properties`.
    #[must_use]
    pub fn missing_required(&self, properties: &Properties) -> Vec<&'static str> {
        self.required
            .iter()
            .copied()
            .filter(|field| properties.get(*field).is_none_or(Value::is_null))
            .collect()
    }

    /// Runs the type-specific validation.
    #[must_use]
    pub fn validate(&self, properties: &Properties) -> Vec<String> {
        (self.validate)(properties)
    }

    /// Runs the type-specific diff.
    #[must_use]
    pub fn diff(&self, old: &Properties, new: &Properties) -> Vec<FieldChange> {
        (self.diff)(self, old, new)
    }
}

static CLUSTER: TypeOps = TypeOps {
    resource_type: ResourceType::Cluster,
    required: &["name", "version"],
    immutable: &["name", "vpc"],
    unordered: &["logging"],
    exports: &[
        "name",
        "arn",
        "endpoint",
        "oidc_issuer",
        "oidc_provider_arn",
        "role_arn",
        "admin_role_arn",
        "security_group_id",
        "vpc_id",
    ],
    handler: Handler::Remote,
    validate: validate_cluster,
    diff: diff_fields,
};

static NODE_GROUP: TypeOps = TypeOps {
    resource_type: ResourceType::NodeGroup,
    required: &[
        "cluster_name",
        "nodegroup_name",
        "instance_types",
        "min_size",
        "max_size",
        "desired_size",
    ],
    immutable: &["cluster_name", "nodegroup_name", "instance_types", "capacity_type", "subnets"],
    unordered: &["instance_types", "subnets"],
    exports: &["name", "arn"],
    handler: Handler::Remote,
    validate: validate_node_group,
    diff: diff_fields,
};

static IAM_ROLE: TypeOps = TypeOps {
    resource_type: ResourceType::IamRole,
    required: &["assumed_by"],
    immutable: &["role_name", "path"],
    unordered: &["managed_policies"],
    exports: &["name", "arn"],
    handler: Handler::Remote,
    validate: validate_iam_role,
    diff: diff_fields,
};

static ADDON: TypeOps = TypeOps {
    resource_type: ResourceType::Addon,
    required: &["cluster_name", "addon_name"],
    immutable: &["cluster_name", "addon_name"],
    unordered: &[],
    exports: &["name", "arn"],
    handler: Handler::Remote,
    validate: validate_addon,
    diff: diff_fields,
};

static KUBERNETES_MANIFEST: TypeOps = TypeOps {
    resource_type: ResourceType::KubernetesManifest,
    required: &["cluster_name", "manifest"],
    immutable: &["cluster_name"],
    unordered: &[],
    exports: &["uid"],
    handler: Handler::Remote,
    validate: validate_manifest,
    diff: diff_manifest,
};

static ACCESS_ENTRY: TypeOps = TypeOps {
    resource_type: ResourceType::AccessEntry,
    required: &["cluster_name", "principal_arn", "policies"],
    immutable: &["cluster_name", "principal_arn"],
    unordered: &[],
    exports: &["arn"],
    handler: Handler::Remote,
    validate: validate_access_entry,
    diff: diff_fields,
};

static ROLE_MAPPING: TypeOps = TypeOps {
    resource_type: ResourceType::RoleMapping,
    required: &["cluster_name", "role_arn", "groups"],
    immutable: &["cluster_name", "role_arn"],
    unordered: &["groups"],
    exports: &[],
    handler: Handler::Remote,
    validate: validate_role_mapping,
    diff: diff_fields,
};

static OUTPUT: TypeOps = TypeOps {
    resource_type: ResourceType::Output,
    required: &["value"],
    immutable: &[],
    unordered: &[],
    exports: &["value"],
    handler: Handler::Local,
    validate: validate_nothing,
    diff: diff_fields,
};

/// Returns the operation table for a type.
#[must_use]
pub fn lookup(resource_type: ResourceType) -> &'static TypeOps {
    match resource_type {
        ResourceType::Cluster => &CLUSTER,
        ResourceType::NodeGroup => &NODE_GROUP,
        ResourceType::IamRole => &IAM_ROLE,
        ResourceType::Addon => &ADDON,
        ResourceType::KubernetesManifest => &KUBERNETES_MANIFEST,
        ResourceType::AccessEntry => &ACCESS_ENTRY,
        ResourceType::RoleMapping => &ROLE_MAPPING,
        ResourceType::Output => &OUTPUT,
    }
}

// ============================================================================
// Diff functions
// ============================================================================

/// Field-by-field comparison honouring the table's unordered lists.
#[must_use]
pub fn diff_fields(ops: &TypeOps, old: &Properties, new: &Properties) -> Vec<FieldChange> {
    let fields: BTreeSet<&String> = old.keys().chain(new.keys()).collect();

    fields
        .into_iter()
        .filter_map(|field| {
            let before = old.get(field);
            let after = new.get(field);
            let unordered = ops.unordered.contains(&field.as_str());
            let same = match (before, after) {
                (Some(a), Some(b)) if unordered => normalize_list(a) == normalize_list(b),
                (a, b) => a == b,
            };
            if same {
                return None;
            }
            Some(FieldChange {
                field: field.clone(),
                old_value: before.cloned(),
                new_value: after.cloned(),
                forces_replacement: ops.is_immutable(field),
            })
        })
        .collect()
}

/// Compares manifests document by document, keyed by kind and name.
fn diff_manifest(ops: &TypeOps, old: &Properties, new: &Properties) -> Vec<FieldChange> {
    let (Some(Value::Array(before)), Some(Value::Array(after))) = (old.get("manifest"), new.get("manifest")) else {
        return diff_fields(ops, old, new);
    };

    let strip = |props: &Properties| -> Properties {
        props
            .iter()
            .filter(|(k, _)| k.as_str() != "manifest")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    };
    let mut changes = diff_fields(ops, &strip(old), &strip(new));

    let keyed = |docs: &[Value]| -> std::collections::BTreeMap<String, Value> {
        docs.iter()
            .enumerate()
            .map(|(i, doc)| (document_key(doc).unwrap_or_else(|| format!("#{i}")), doc.clone()))
            .collect()
    };
    let old_docs = keyed(before.as_slice());
    let new_docs = keyed(after.as_slice());

    let keys: BTreeSet<&String> = old_docs.keys().chain(new_docs.keys()).collect();
    for key in keys {
        let a = old_docs.get(key);
        let b = new_docs.get(key);
        if a != b {
            changes.push(FieldChange {
                field: format!("manifest[{key}]"),
                old_value: a.cloned(),
                new_value: b.cloned(),
                forces_replacement: false,
            });
        }
    }

    changes
}

fn document_key(doc: &Value) -> Option<String> {
    let kind = doc.get("kind")?.as_str()?;
    let name = doc.get("metadata")?.get("name")?.as_str()?;
    Some(format!("{kind}/{name}"))
}

fn normalize_list(value: &Value) -> Value {
    match value {
        Value::Array(items) => {
            let mut sorted = items.clone();
            sorted.sort_by_key(ToString::to_string);
            Value::Array(sorted)
        }
        other => other.clone(),
    }
}

// ============================================================================
// Validation functions
// ============================================================================

const AUTHENTICATION_MODES: &[&str] = &["API", "CONFIG_MAP", "API_AND_CONFIG_MAP"];
const LOG_TYPES: &[&str] = &["api", "audit", "authenticator", "controllerManager", "scheduler"];
const CAPACITY_TYPES: &[&str] = &["ON_DEMAND", "SPOT"];
const ACCESS_SCOPES: &[&str] = &["cluster", "namespace"];

fn validate_nothing(_properties: &Properties) -> Vec<String> {
    Vec::new()
}

fn validate_cluster(properties: &Properties) -> Vec<String> {
    let mut errors = Vec::new();

    if let Some(version) = literal(properties, "version") {
        let valid = version.as_str().is_some_and(|v| {
            let mut parts = v.split('.');
            matches!(
                (parts.next(), parts.next(), parts.next()),
                (Some(major), Some(minor), None)
                    if !major.is_empty() && !minor.is_empty()
                        && major.chars().all(|c| c.is_ascii_digit())
                        && minor.chars().all(|c| c.is_ascii_digit())
            )
        });
        if !valid {
            errors.push(format!("version must look like \"1.30\", got {version}"));
        }
    }

    if let Some(mode) = literal(properties, "authentication_mode") {
        check_one_of(mode, "authentication_mode", AUTHENTICATION_MODES, &mut errors);
    }

    if let Some(logging) = literal(properties, "logging") {
        match logging.as_array() {
            Some(items) => {
                for item in items {
                    check_one_of(item, "logging", LOG_TYPES, &mut errors);
                }
            }
            None => errors.push(String::from("logging must be a list")),
        }
    }

    if let Some(capacity) = literal(properties, "default_capacity") {
        if capacity.as_u64().is_none() {
            errors.push(String::from("default_capacity must be a non-negative integer"));
        }
    }

    errors
}

fn validate_node_group(properties: &Properties) -> Vec<String> {
    let mut errors = Vec::new();

    check_string_list(properties, "instance_types", &mut errors);
    if let Some(capacity) = literal(properties, "capacity_type") {
        check_one_of(capacity, "capacity_type", CAPACITY_TYPES, &mut errors);
    }

    let mut sizes = [None; 3];
    for (slot, field) in sizes.iter_mut().zip(["min_size", "desired_size", "max_size"]) {
        if let Some(value) = literal(properties, field) {
            match value.as_u64() {
                Some(n) => *slot = Some(n),
                None => errors.push(format!("{field} must be a non-negative integer")),
            }
        }
    }
    if let [Some(min), Some(desired), Some(max)] = sizes {
        if !(min <= desired && desired <= max) {
            errors.push(format!(
                "node group sizes must satisfy min_size <= desired_size <= max_size (got {min} <= {desired} <= {max})"
            ));
        }
    }

    errors
}

fn validate_iam_role(properties: &Properties) -> Vec<String> {
    let mut errors = Vec::new();
    if properties.contains_key("managed_policies") {
        check_string_list(properties, "managed_policies", &mut errors);
    }
    if let Some(conditions) = literal(properties, "conditions") {
        if !conditions.is_object() {
            errors.push(String::from("conditions must be a mapping"));
        }
    }
    errors
}

fn validate_addon(properties: &Properties) -> Vec<String> {
    let mut errors = Vec::new();
    if let Some(name) = literal(properties, "addon_name") {
        if name.as_str().is_none_or(str::is_empty) {
            errors.push(String::from("addon_name must be a non-empty string"));
        }
    }
    errors
}

fn validate_manifest(properties: &Properties) -> Vec<String> {
    let mut errors = Vec::new();
    let Some(manifest) = literal(properties, "manifest") else {
        return errors;
    };
    let Some(documents) = manifest.as_array() else {
        errors.push(String::from("manifest must be a list of Kubernetes objects"));
        return errors;
    };
    if documents.is_empty() {
        errors.push(String::from("manifest must contain at least one object"));
    }
    for (i, doc) in documents.iter().enumerate() {
        for field in ["apiVersion", "kind"] {
            if doc.get(field).and_then(Value::as_str).is_none() {
                errors.push(format!("manifest[{i}] is missing {field}"));
            }
        }
        if doc.get("metadata").and_then(|m| m.get("name")).and_then(Value::as_str).is_none() {
            errors.push(format!("manifest[{i}] is missing metadata.name"));
        }
    }
    errors
}

fn validate_access_entry(properties: &Properties) -> Vec<String> {
    let mut errors = Vec::new();
    let Some(policies) = literal(properties, "policies") else {
        return errors;
    };
    match policies.as_array() {
        Some(items) if !items.is_empty() => {
            for (i, policy) in items.iter().enumerate() {
                if policy.get("policy").and_then(Value::as_str).is_none() {
                    errors.push(format!("policies[{i}] is missing policy"));
                }
                if let Some(scope) = policy.get("access_scope") {
                    check_one_of(scope, "access_scope", ACCESS_SCOPES, &mut errors);
                }
            }
        }
        _ => errors.push(String::from("policies must be a non-empty list")),
    }
    errors
}

fn validate_role_mapping(properties: &Properties) -> Vec<String> {
    let mut errors = Vec::new();
    check_string_list(properties, "groups", &mut errors);
    errors
}

/// Returns the property unless it is absent or still waiting on a reference.
fn literal<'a>(properties: &'a Properties, field: &str) -> Option<&'a Value> {
    properties.get(field).filter(|v| !contains_reference(v))
}

fn check_one_of(value: &Value, field: &str, allowed: &[&str], errors: &mut Vec<String>) {
    if contains_reference(value) {
        return;
    }
    if !value.as_str().is_some_and(|v| allowed.contains(&v)) {
        errors.push(format!("{field} must be one of {}, got {value}", allowed.join(", ")));
    }
}

fn check_string_list(properties: &Properties, field: &str, errors: &mut Vec<String>) {
    let Some(value) = literal(properties, field) else {
        return;
    };
    match value.as_array() {
        Some(items) if !items.is_empty() && items.iter().all(Value::is_string) => {}
        _ => errors.push(format!("{field} must be a non-empty list of strings")),
    }
}
