//! Input hashing and attribute-level diffs

use crate::types::{Action, ActionKind, AttributeChange};
use crate::value::Attributes;
use serde_json::Value as Json;
use std::collections::{BTreeMap, BTreeSet};

/// Desired inputs after reference resolution; `None` marks a value that is
/// unknown until a dependency is applied
pub type DesiredAttributes = BTreeMap<String, Option<Json>>;

/// Hash one attribute value.
///
/// Objects serialize with sorted keys, so equal values hash equally.
pub fn hash_value(value: &Json) -> String {
    blake3::hash(value.to_string().as_bytes()).to_hex().to_string()
}

/// Hash a full set of resolved inputs
pub fn input_hash(inputs: &Attributes) -> String {
    let mut hasher = blake3::Hasher::new();
    for (name, value) in inputs {
        hasher.update(name.as_bytes());
        hasher.update(b"\0");
        hasher.update(hash_value(value).as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize().to_hex().to_string()
}

/// Hash desired inputs; `None` if any value is unknown
pub fn desired_hash(desired: &DesiredAttributes) -> Option<String> {
    known_inputs(desired).map(|inputs| input_hash(&inputs))
}

/// Desired inputs as concrete attributes, if all are known
pub fn known_inputs(desired: &DesiredAttributes) -> Option<Attributes> {
    desired
        .iter()
        .map(|(k, v)| v.clone().map(|v| (k.clone(), v)))
        .collect()
}

/// Attributes that differ between the last applied inputs and the desired ones.
///
/// Unknown desired values and removed attributes always count as changed.
pub fn attribute_changes(prior: &Attributes, desired: &DesiredAttributes) -> Vec<AttributeChange> {
    let names: BTreeSet<&String> = prior.keys().chain(desired.keys()).collect();

    names
        .into_iter()
        .filter_map(|name| {
            let before = prior.get(name);
            let after = desired.get(name);
            let changed = match (before, after) {
                (Some(b), Some(Some(a))) => hash_value(b) != hash_value(a),
                (None, None) => false,
                _ => true,
            };
            changed.then(|| AttributeChange {
                name: name.clone(),
                before: before.cloned(),
                after: after.cloned().flatten(),
                forces_replacement: false,
            })
        })
        .collect()
}

/// Changes for a resource that does not exist yet
pub fn creation_changes(desired: &DesiredAttributes) -> Vec<AttributeChange> {
    desired
        .iter()
        .map(|(name, value)| AttributeChange {
            name: name.clone(),
            before: None,
            after: value.clone(),
            forces_replacement: false,
        })
        .collect()
}

/// Diff summary statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffSummary {
    /// Number of resources to add
    pub additions: usize,
    /// Number of resources to remove
    pub removals: usize,
    /// Number of resources to modify in place
    pub modifications: usize,
    /// Number of resources to replace
    pub replacements: usize,
    /// Number of resources left alone
    pub unchanged: usize,
}

impl DiffSummary {
    /// Create a summary from planned actions.
    ///
    /// A replacement counts once, not as an add plus a destroy.
    pub fn from_actions(actions: &[Action]) -> Self {
        let mut summary = Self::default();
        for action in actions {
            match action.kind {
                ActionKind::Create if action.replacement => summary.replacements += 1,
                ActionKind::Create => summary.additions += 1,
                ActionKind::Update => summary.modifications += 1,
                ActionKind::Delete if action.replacement => {}
                ActionKind::Delete => summary.removals += 1,
                ActionKind::NoOp => summary.unchanged += 1,
            }
        }
        summary
    }

    /// Total number of changes
    pub fn total(&self) -> usize {
        self.additions + self.removals + self.modifications + self.replacements
    }

    /// Check if there are any changes
    pub fn has_changes(&self) -> bool {
        self.total() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(value: Json) -> Attributes {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_hash_ignores_key_order() {
        let a = json!({"b": 1, "a": [1, 2]});
        let b: Json = serde_json::from_str(r#"{"a": [1, 2], "b": 1}"#).unwrap();
        assert_eq!(hash_value(&a), hash_value(&b));
        assert_ne!(hash_value(&json!([1, 2])), hash_value(&json!([2, 1])));
    }

    #[test]
    fn test_input_hash_detects_changes() {
        let a = attrs(json!({"cidr_block": "10.0.0.0/16"}));
        let b = attrs(json!({"cidr_block": "10.1.0.0/16"}));
        assert_eq!(input_hash(&a), input_hash(&a.clone()));
        assert_ne!(input_hash(&a), input_hash(&b));
    }

    #[test]
    fn test_attribute_changes() {
        let prior = attrs(json!({"name": "nim", "version": "1.29", "tags": {"a": 1}}));
        let mut desired = DesiredAttributes::new();
        desired.insert("name".into(), Some(json!("nim")));
        desired.insert("version".into(), Some(json!("1.30")));
        desired.insert("vpc_id".into(), None);

        let changes = attribute_changes(&prior, &desired);
        let names: Vec<_> = changes.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["tags", "version", "vpc_id"]);

        let version = &changes[1];
        assert_eq!(version.before, Some(json!("1.29")));
        assert_eq!(version.after, Some(json!("1.30")));
        assert_eq!(changes[2].after, None);
    }

    #[test]
    fn test_desired_hash_requires_known_values() {
        let mut desired = DesiredAttributes::new();
        desired.insert("name".into(), Some(json!("nim")));
        assert_eq!(desired_hash(&desired), Some(input_hash(&attrs(json!({"name": "nim"})))));

        desired.insert("vpc_id".into(), None);
        assert_eq!(desired_hash(&desired), None);
    }

    #[test]
    fn test_summary_counts_replacement_once() {
        let mut create = Action::new("cluster", "aws_eks_cluster", ActionKind::Create, "replace");
        create.replacement = true;
        let mut delete = Action::new("cluster", "aws_eks_cluster", ActionKind::Delete, "replace");
        delete.replacement = true;

        let summary = DiffSummary::from_actions(&[
            create,
            delete,
            Action::new("addon", "aws_eks_addon", ActionKind::Create, "new"),
            Action::new("old", "aws_eks_addon", ActionKind::Delete, "removed"),
        ]);
        assert_eq!(summary.replacements, 1);
        assert_eq!(summary.additions, 1);
        assert_eq!(summary.removals, 1);
        assert_eq!(summary.total(), 3);
    }
}
