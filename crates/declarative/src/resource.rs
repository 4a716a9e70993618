//! Resource declarations and configuration documents
//!
//! A [`ResourceSpec`] describes one infrastructure object: its type, its
//! input attributes (which may reference other resources), explicit ordering
//! hints, an optional condition, and a lifecycle policy. A [`Configuration`]
//! is the full set of declarations plus top-level parameters.

use crate::value::{Attributes, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Per-resource lifecycle hints
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecyclePolicy {
    /// Attributes whose changes are ignored once the resource exists.
    ///
    /// Only the differ consults this set; values are still used at create time.
    #[serde(default)]
    pub ignore_changes: BTreeSet<String>,

    /// Create the replacement before deleting the original
    #[serde(default)]
    pub create_before_destroy: bool,
}

/// A declared resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Logical name, unique within a configuration
    pub name: String,

    /// Resource type (selects the provider)
    #[serde(rename = "type")]
    pub resource_type: String,

    /// Input attributes; may contain references
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,

    /// Ordering edges that cannot be inferred from references
    #[serde(default)]
    pub depends_on: BTreeSet<String>,

    /// Condition over top-level parameters; the resource exists only if true
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    #[serde(default)]
    pub lifecycle: LifecyclePolicy,
}

impl ResourceSpec {
    pub fn new(name: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource_type: resource_type.into(),
            inputs: BTreeMap::new(),
            depends_on: BTreeSet::new(),
            condition: None,
            lifecycle: LifecyclePolicy::default(),
        }
    }

    /// Set an input attribute
    pub fn input(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(key.into(), value.into());
        self
    }

    /// Add an explicit ordering dependency
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.depends_on.insert(name.into());
        self
    }

    /// Gate the resource on a condition expression
    pub fn condition(mut self, expr: impl Into<String>) -> Self {
        self.condition = Some(expr.into());
        self
    }

    /// Ignore later changes to an attribute
    pub fn ignore_changes(mut self, attribute: impl Into<String>) -> Self {
        self.lifecycle.ignore_changes.insert(attribute.into());
        self
    }

    /// Replace by creating the new instance first
    pub fn create_before_destroy(mut self) -> Self {
        self.lifecycle.create_before_destroy = true;
        self
    }

    /// Names of resources this one references through its inputs
    pub fn referenced_resources(&self) -> BTreeSet<&str> {
        self.inputs
            .values()
            .flat_map(Value::references)
            .map(|r| r.resource.as_str())
            .collect()
    }

    /// All dependency names: references plus explicit depends_on
    pub fn dependency_names(&self) -> BTreeSet<&str> {
        let mut names = self.referenced_resources();
        names.extend(self.depends_on.iter().map(String::as_str));
        names
    }
}

/// Resource declarations plus top-level parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    /// Top-level parameters (feature flags, counts, names)
    #[serde(default)]
    pub parameters: Attributes,

    /// Declared resources
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a parameter
    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Add a resource declaration
    pub fn resource(mut self, spec: ResourceSpec) -> Self {
        self.resources.push(spec);
        self
    }

    /// Layer parameter overrides on top of the declared parameters
    pub fn override_parameters(&mut self, overrides: Attributes) {
        self.parameters.extend(overrides);
    }

    /// Find a declaration by name
    pub fn find(&self, name: &str) -> Option<&ResourceSpec> {
        self.resources.iter().find(|r| r.name == name)
    }
}
