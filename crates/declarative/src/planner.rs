//! Differ/planner - turns configuration plus state into an ordered action plan
//!
//! Every action of a run lives in one merged DAG:
//!
//! - the apply (create/update/no-op) of a dependency precedes the apply of
//!   its dependents;
//! - the delete of a dependent precedes the delete of its dependencies, with
//!   dependencies taken from configuration and from what state recorded;
//! - a configured resource that no longer depends on a deleted one is
//!   applied before that delete;
//! - a replacement either creates first and deletes the deposed instance
//!   after every dependent has moved over, or deletes first.
//!
//! The action list is one topological sort of that DAG, ties broken by
//! deletes first and then by name.

use crate::condition::{ResolvedConfig, resolve};
use crate::context::{ApplyContext, CancelToken};
use crate::diff::{self, DesiredAttributes, DiffSummary};
use crate::error::{ConfigError, Error, ProviderError, Result};
use crate::graph::{DependencyGraph, stable_toposort};
use crate::provider::{Provider, ProviderRegistry};
use crate::resource::{Configuration, ResourceSpec};
use crate::state::{StateEntry, StateMap};
use crate::types::{Action, ActionKind, AttributeChange};
use crate::value::{Attributes, Reference};
use petgraph::Direction;
use petgraph::graph::DiGraph;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Options for planning
#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// Read every state entry from its provider before diffing
    pub refresh: bool,
    /// Restrict the plan to these names and what they need
    pub targets: BTreeSet<String>,
}

/// An ordered set of actions with their ordering constraints
#[derive(Debug, Clone)]
pub struct Plan {
    pub(crate) actions: Vec<Action>,
    pub(crate) predecessors: Vec<Vec<usize>>,
    pub(crate) resources: BTreeMap<String, ResourceSpec>,
    pub(crate) dependencies: BTreeMap<String, BTreeSet<String>>,
}

impl Plan {
    /// Actions in execution order
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// Indices of the actions that must succeed before action `index` runs
    pub fn predecessors(&self, index: usize) -> &[usize] {
        self.predecessors.get(index).map_or(&[], Vec::as_slice)
    }

    /// Resolved declaration for a configured resource
    pub fn resource(&self, name: &str) -> Option<&ResourceSpec> {
        self.resources.get(name)
    }

    /// Dependencies recorded in state when a configured resource is applied
    pub fn dependencies(&self, name: &str) -> BTreeSet<String> {
        self.dependencies.get(name).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn summary(&self) -> DiffSummary {
        DiffSummary::from_actions(&self.actions)
    }

    /// Whether applying would call any provider
    pub fn has_changes(&self) -> bool {
        self.actions.iter().any(|a| a.kind.is_change())
    }

    /// Actions that call a provider
    pub fn changes(&self) -> impl Iterator<Item = &Action> {
        self.actions.iter().filter(|a| a.kind.is_change())
    }

    /// Index of an action by key
    pub fn position(&self, key: &str) -> Option<usize> {
        self.actions.iter().position(|a| a.key() == key)
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.has_changes() {
            return writeln!(f, "No changes. Infrastructure matches the configuration.");
        }
        for action in self.changes() {
            writeln!(f, "{action}")?;
        }
        let summary = self.summary();
        writeln!(
            f,
            "\nPlan: {} to add, {} to change, {} to destroy.",
            summary.additions + summary.replacements,
            summary.modifications,
            summary.removals + summary.replacements
        )
    }
}

// ============================================================================
// Scope
// ============================================================================

/// Names a targeted plan may touch; `None` means everything
struct Scope(Option<BTreeSet<String>>);

impl Scope {
    fn includes(&self, name: &str) -> bool {
        self.0.as_ref().is_none_or(|names| names.contains(name))
    }

    /// Targets plus everything they depend on
    fn for_apply(targets: &BTreeSet<String>, graph: &DependencyGraph, state: &StateMap) -> Result<Self> {
        if targets.is_empty() {
            return Ok(Self(None));
        }
        let mut names = BTreeSet::new();
        for target in targets {
            if graph.contains(target) {
                names.extend(graph.transitive_dependencies(target));
            } else if !state.contains_key(target) {
                return Err(ConfigError::UnknownTarget {
                    target: target.clone(),
                }
                .into());
            }
            names.insert(target.clone());
        }
        Ok(Self(Some(names)))
    }

    /// Targets plus everything that depends on them
    fn for_destroy(targets: &BTreeSet<String>, graph: &DependencyGraph, state: &StateMap) -> Result<Self> {
        if targets.is_empty() {
            return Ok(Self(None));
        }

        let mut dependents: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for entry in state.values() {
            for dep in &entry.dependencies {
                dependents.entry(dep.as_str()).or_default().insert(entry.name.as_str());
            }
        }

        let mut names = BTreeSet::new();
        for target in targets {
            if !graph.contains(target) && !state.contains_key(target) {
                return Err(ConfigError::UnknownTarget {
                    target: target.clone(),
                }
                .into());
            }
            let mut stack = vec![target.clone()];
            while let Some(name) = stack.pop() {
                if !names.insert(name.clone()) {
                    continue;
                }
                stack.extend(graph.dependents(&name));
                if let Some(recorded) = dependents.get(name.as_str()) {
                    stack.extend(recorded.iter().map(|s| (*s).to_string()));
                }
            }
        }
        Ok(Self(Some(names)))
    }
}

// ============================================================================
// Action DAG
// ============================================================================

/// Actions under construction plus their ordering edges
#[derive(Default)]
struct ActionSet {
    actions: Vec<Action>,
    apply: BTreeMap<String, usize>,
    delete: BTreeMap<String, usize>,
    deposed: BTreeMap<String, Vec<usize>>,
    edges: BTreeSet<(usize, usize)>,
}

impl ActionSet {
    fn push(&mut self, action: Action) -> usize {
        let index = self.actions.len();
        let name = action.name.clone();
        if action.kind == ActionKind::Delete {
            if action.deposed.is_some() {
                self.deposed.entry(name).or_default().push(index);
            } else {
                self.delete.insert(name, index);
            }
        } else {
            self.apply.insert(name, index);
        }
        self.actions.push(action);
        index
    }

    fn push_deposed(&mut self, entry: &StateEntry) {
        for id in &entry.deposed {
            let mut action = Action::new(
                &entry.name,
                &entry.resource_type,
                ActionKind::Delete,
                "deposed instance from an earlier replacement",
            );
            action.deposed = Some(id.clone());
            self.push(action);
        }
    }

    /// `before` must succeed before `after` starts
    fn order(&mut self, before: Option<usize>, after: Option<usize>) {
        if let (Some(before), Some(after)) = (before, after)
            && before != after
        {
            self.edges.insert((before, after));
        }
    }

    fn apply_of(&self, name: &str) -> Option<usize> {
        self.apply.get(name).copied()
    }

    fn delete_of(&self, name: &str) -> Option<usize> {
        self.delete.get(name).copied()
    }

    fn deposed_of(&self, name: &str) -> Vec<usize> {
        self.deposed.get(name).cloned().unwrap_or_default()
    }

    /// Sort into one topological order
    fn finish(
        self,
        resources: BTreeMap<String, ResourceSpec>,
        dependencies: BTreeMap<String, BTreeSet<String>>,
    ) -> Result<Plan> {
        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let nodes: Vec<_> = (0..self.actions.len()).map(|i| graph.add_node(i)).collect();
        for &(before, after) in &self.edges {
            graph.add_edge(nodes[before], nodes[after], ());
        }

        let actions = self.actions;
        let order = stable_toposort(&graph, Direction::Incoming, |&i| sort_key(&actions[i])).map_err(
            |stuck| ConfigError::PlanCycle {
                actions: stuck.iter().map(|&n| actions[graph[n]].key()).collect(),
            },
        )?;

        let mut position = vec![0; actions.len()];
        for (pos, node) in order.iter().enumerate() {
            position[graph[*node]] = pos;
        }

        let mut predecessors = vec![Vec::new(); actions.len()];
        for &(before, after) in &self.edges {
            predecessors[position[after]].push(position[before]);
        }
        for list in &mut predecessors {
            list.sort_unstable();
        }

        let mut placed: Vec<(usize, Action)> = actions
            .into_iter()
            .enumerate()
            .map(|(i, action)| (position[i], action))
            .collect();
        placed.sort_by_key(|(pos, _)| *pos);

        Ok(Plan {
            actions: placed.into_iter().map(|(_, action)| action).collect(),
            predecessors,
            resources,
            dependencies,
        })
    }
}

/// Deletes first, then by name
fn sort_key(action: &Action) -> (u8, String, Option<String>) {
    let rank = match action.kind {
        ActionKind::Delete => 0,
        ActionKind::Create => 1,
        ActionKind::Update => 2,
        ActionKind::NoOp => 3,
    };
    (rank, action.name.clone(), action.deposed.clone())
}

// ============================================================================
// Planning
// ============================================================================

/// Plan the changes needed to converge `state` on `config`.
///
/// Configuration errors are reported before any provider call, including
/// the reads made by refresh.
pub fn plan(
    config: &Configuration,
    state: &StateMap,
    providers: &ProviderRegistry,
    options: &PlanOptions,
) -> Result<Plan> {
    let resolved = resolve(config)?;
    check_types(&resolved, providers)?;
    let graph = DependencyGraph::build(&resolved)?;
    let scope = Scope::for_apply(&options.targets, &graph, state)?;

    let mut prior = state.clone();
    if options.refresh {
        refresh(&mut prior, providers, &scope)?;
    }

    let mut set = ActionSet::default();
    let mut unknown: BTreeSet<String> = BTreeSet::new();
    let mut updated: BTreeMap<String, Attributes> = BTreeMap::new();
    let mut fresh_deposed: BTreeMap<String, usize> = BTreeMap::new();

    for name in graph.order() {
        if !scope.includes(name) {
            continue;
        }
        let spec = &resolved.resources[name];
        let desired = desired_inputs(spec, &prior, &unknown, &updated);

        let decision = decide(spec, &desired, prior.get(name), providers)?;
        log::debug!("{name}: {}", decision.reason());

        match decision {
            Decision::Create { changes } => {
                let mut action = Action::new(name, &spec.resource_type, ActionKind::Create, "not in state");
                action.changes = changes;
                set.push(action);
                unknown.insert(name.clone());
            }
            Decision::Update { changes, reason } => {
                let mut action = Action::new(name, &spec.resource_type, ActionKind::Update, reason);
                if let Some(entry) = prior.get(name) {
                    action.pinned = pinned_inputs(spec, entry);
                    match providers.get(&spec.resource_type) {
                        Some(provider) => {
                            let outputs = predicted_outputs(entry, &desired, &changes, provider.as_ref());
                            updated.insert(name.clone(), outputs);
                        }
                        None => {
                            unknown.insert(name.clone());
                        }
                    }
                }
                action.changes = changes;
                set.push(action);
            }
            Decision::NoOp { reason } => {
                set.push(Action::new(name, &spec.resource_type, ActionKind::NoOp, reason));
            }
            Decision::Replace { changes, reason, prior_type, prior_id } => {
                let mut create = Action::new(name, &spec.resource_type, ActionKind::Create, &reason);
                create.replacement = true;
                create.changes = changes;

                let mut delete = Action::new(name, prior_type, ActionKind::Delete, &reason);
                delete.replacement = true;

                if spec.lifecycle.create_before_destroy {
                    delete.deposed = Some(prior_id);
                    let create = set.push(create);
                    let delete = set.push(delete);
                    set.order(Some(create), Some(delete));
                    fresh_deposed.insert(name.clone(), delete);
                } else {
                    let delete = set.push(delete);
                    let create = set.push(create);
                    set.order(Some(delete), Some(create));
                }
                unknown.insert(name.clone());
            }
        }

        if let Some(entry) = prior.get(name) {
            set.push_deposed(entry);
        }
    }

    for (name, entry) in &prior {
        if resolved.contains(name) || !scope.includes(name) {
            continue;
        }
        let reason = if resolved.absent.contains(name) {
            "condition is false"
        } else {
            "removed from configuration"
        };
        log::debug!("{name}: {reason}");
        set.push(Action::new(name, &entry.resource_type, ActionKind::Delete, reason));
        set.push_deposed(entry);
    }

    let dependencies: BTreeMap<String, BTreeSet<String>> = resolved
        .resources
        .keys()
        .map(|name| (name.clone(), graph.dependencies(name)))
        .collect();

    connect(&mut set, &graph, &prior, &dependencies, &fresh_deposed);

    let plan = set.finish(resolved.resources, dependencies)?;
    log::info!("{}", plan.summary_line());
    Ok(plan)
}

/// Plan deleting everything recorded in state, dependents first
pub fn plan_destroy(config: &Configuration, state: &StateMap, options: &PlanOptions) -> Result<Plan> {
    let resolved = resolve(config)?;
    let graph = DependencyGraph::build(&resolved)?;
    let scope = Scope::for_destroy(&options.targets, &graph, state)?;

    let mut set = ActionSet::default();
    for (name, entry) in state {
        if !scope.includes(name) {
            continue;
        }
        set.push(Action::new(name, &entry.resource_type, ActionKind::Delete, "destroy"));
        set.push_deposed(entry);
    }

    for (name, entry) in state {
        let mut deps = entry.dependencies.clone();
        deps.extend(graph.dependencies(name));
        for dep in &deps {
            let target = set.delete_of(dep);
            set.order(set.delete_of(name), target);
            for deposed in set.deposed_of(name) {
                set.order(Some(deposed), target);
            }
        }
    }

    let plan = set.finish(BTreeMap::new(), BTreeMap::new())?;
    log::info!("{}", plan.summary_line());
    Ok(plan)
}

impl Plan {
    fn summary_line(&self) -> String {
        let summary = self.summary();
        format!(
            "Planned {} actions: {} to add, {} to change, {} to replace, {} to destroy",
            self.len(),
            summary.additions,
            summary.modifications,
            summary.replacements,
            summary.removals
        )
    }
}

pub(crate) fn check_types(resolved: &ResolvedConfig, providers: &ProviderRegistry) -> Result<()> {
    for spec in resolved.resources.values() {
        if !providers.contains(&spec.resource_type) {
            return Err(ConfigError::UnknownResourceType {
                resource: spec.name.clone(),
                resource_type: spec.resource_type.clone(),
            }
            .into());
        }
    }
    Ok(())
}

/// Read every in-scope state entry from its provider
fn refresh(prior: &mut StateMap, providers: &ProviderRegistry, scope: &Scope) -> Result<()> {
    let cancel = CancelToken::new();
    let entries: Vec<&StateEntry> = prior.values().filter(|e| scope.includes(&e.name)).collect();

    let results: Vec<(String, std::result::Result<Option<Attributes>, ProviderError>)> = entries
        .par_iter()
        .filter_map(|entry| {
            let provider = providers.get(&entry.resource_type)?;
            let ctx = ApplyContext::new(&entry.name, &cancel);
            let outputs = match provider.read(&entry.id, &ctx) {
                Ok(outputs) => Ok(Some(outputs)),
                Err(ProviderError::NotFound { .. }) => Ok(None),
                Err(e) => Err(e),
            };
            Some((entry.name.clone(), outputs))
        })
        .collect();

    for (name, result) in results {
        match result {
            Ok(Some(mut outputs)) => {
                if let Some(entry) = prior.get_mut(&name) {
                    outputs.insert("id".to_string(), entry.id.clone().into());
                    entry.outputs = outputs;
                }
            }
            Ok(None) => {
                log::info!("{name} no longer exists at its provider, planning to recreate");
                prior.remove(&name);
            }
            Err(source) => return Err(Error::Provider { resource: name, source }),
        }
    }
    Ok(())
}

/// Resolve inputs against prior outputs.
///
/// References to resources created or replaced in this run are unknown;
/// references to resources updated in place see their predicted outputs.
fn desired_inputs(
    spec: &ResourceSpec,
    prior: &StateMap,
    unknown: &BTreeSet<String>,
    updated: &BTreeMap<String, Attributes>,
) -> DesiredAttributes {
    let mut lookup = |r: &Reference| {
        if unknown.contains(&r.resource) {
            return None;
        }
        if let Some(outputs) = updated.get(&r.resource) {
            return r.lookup(outputs).cloned();
        }
        prior.get(&r.resource).and_then(|e| r.lookup(&e.outputs)).cloned()
    };
    spec.inputs
        .iter()
        .map(|(name, value)| (name.clone(), value.resolve(&mut lookup)))
        .collect()
}

/// Outputs an in-place update is expected to leave behind.
///
/// A changed input the provider echoed as an output takes its new value.
/// Other changed inputs, and computed outputs the provider may recompute,
/// are left out and so read as unknown.
fn predicted_outputs(
    entry: &StateEntry,
    desired: &DesiredAttributes,
    changes: &[AttributeChange],
    provider: &dyn Provider,
) -> Attributes {
    let changed: BTreeSet<&str> = changes.iter().map(|c| c.name.as_str()).collect();
    let mut outputs = Attributes::new();
    for (name, value) in &entry.outputs {
        let applied = entry.inputs.get(name);
        let predicted = if name == "id" {
            Some(value)
        } else if changed.contains(name.as_str()) {
            match desired.get(name) {
                Some(Some(next)) if applied == Some(value) => Some(next),
                _ => None,
            }
        } else if applied.is_some() || !provider.recomputed_on_update(name) {
            Some(value)
        } else {
            None
        };
        if let Some(predicted) = predicted {
            outputs.insert(name.clone(), predicted.clone());
        }
    }
    outputs
}

/// Ignored attributes, held at the value last applied
fn pinned_inputs(spec: &ResourceSpec, entry: &StateEntry) -> Attributes {
    spec.lifecycle
        .ignore_changes
        .iter()
        .filter_map(|name| entry.inputs.get(name).map(|v| (name.clone(), v.clone())))
        .collect()
}

enum Decision {
    Create {
        changes: Vec<AttributeChange>,
    },
    Update {
        changes: Vec<AttributeChange>,
        reason: String,
    },
    NoOp {
        reason: &'static str,
    },
    Replace {
        changes: Vec<AttributeChange>,
        reason: String,
        prior_type: String,
        prior_id: String,
    },
}

impl Decision {
    fn reason(&self) -> &str {
        match self {
            Self::Create { .. } => "not in state",
            Self::Update { reason, .. } | Self::Replace { reason, .. } => reason,
            Self::NoOp { reason } => reason,
        }
    }
}

fn decide(
    spec: &ResourceSpec,
    desired: &DesiredAttributes,
    prior: Option<&StateEntry>,
    providers: &ProviderRegistry,
) -> Result<Decision> {
    let Some(entry) = prior else {
        return Ok(Decision::Create {
            changes: diff::creation_changes(desired),
        });
    };

    if entry.resource_type != spec.resource_type {
        return Ok(Decision::Replace {
            changes: diff::creation_changes(desired),
            reason: format!("type changed from {}", entry.resource_type),
            prior_type: entry.resource_type.clone(),
            prior_id: entry.id.clone(),
        });
    }

    if diff::desired_hash(desired).as_deref() == Some(entry.input_hash.as_str()) {
        return Ok(Decision::NoOp { reason: "unchanged" });
    }

    let provider = providers
        .get(&spec.resource_type)
        .ok_or_else(|| ConfigError::UnknownResourceType {
            resource: spec.name.clone(),
            resource_type: spec.resource_type.clone(),
        })?;

    let mut changes: Vec<AttributeChange> = diff::attribute_changes(&entry.inputs, desired)
        .into_iter()
        .filter(|c| !spec.lifecycle.ignore_changes.contains(&c.name))
        .collect();

    if changes.is_empty() {
        return Ok(Decision::NoOp {
            reason: "only ignored attributes changed",
        });
    }

    for change in &mut changes {
        change.forces_replacement = provider.force_new(&change.name);
    }
    let forcing: Vec<&str> = changes
        .iter()
        .filter(|c| c.forces_replacement)
        .map(|c| c.name.as_str())
        .collect();

    if forcing.is_empty() {
        let names: Vec<&str> = changes.iter().map(|c| c.name.as_str()).collect();
        let reason = format!("{} changed", names.join(", "));
        Ok(Decision::Update { changes, reason })
    } else {
        let reason = format!("{} forces replacement", forcing.join(", "));
        Ok(Decision::Replace {
            changes,
            reason,
            prior_type: entry.resource_type.clone(),
            prior_id: entry.id.clone(),
        })
    }
}

/// Add the ordering edges between planned actions
fn connect(
    set: &mut ActionSet,
    graph: &DependencyGraph,
    prior: &StateMap,
    dependencies: &BTreeMap<String, BTreeSet<String>>,
    fresh_deposed: &BTreeMap<String, usize>,
) {
    let empty = BTreeSet::new();

    // Dependencies apply before their dependents
    for (name, deps) in dependencies {
        for dep in deps {
            let before = set.apply_of(dep);
            set.order(before, set.apply_of(name));
        }
    }

    // Dependents delete before their dependencies
    let names: BTreeSet<String> = set.delete.keys().chain(set.deposed.keys()).cloned().collect();
    for name in &names {
        let recorded = prior.get(name).map_or(&empty, |e| &e.dependencies);
        let configured = dependencies.get(name).unwrap_or(&empty);
        for dep in recorded.union(configured) {
            let Some(target) = set.delete_of(dep) else {
                continue;
            };
            set.order(set.delete_of(name), Some(target));
            for deposed in set.deposed_of(name) {
                set.order(Some(deposed), Some(target));
            }
        }
    }

    for (name, entry) in prior {
        let configured = dependencies.get(name);

        // A resource that dropped a dependency moves off it before it goes
        if let Some(configured) = configured {
            for dep in entry.dependencies.difference(configured) {
                let before = set.apply_of(name);
                set.order(before, set.delete_of(dep));
            }
        }

        // Earlier deposed instances go before the current instance is
        // deleted, or else after its dependents have been applied
        for deposed in set.deposed_of(name) {
            if fresh_deposed.values().any(|&d| d == deposed) {
                continue;
            }
            if let Some(delete) = set.delete_of(name) {
                set.order(Some(deposed), Some(delete));
                continue;
            }
            for dependent in graph.dependents(name) {
                let before = set.apply_of(&dependent);
                set.order(before, Some(deposed));
            }
        }
    }

    // Create-before-destroy: every dependent moves to the new instance
    // before the deposed one is deleted
    for (name, &deposed) in fresh_deposed {
        let before = set.apply_of(name);
        set.order(before, Some(deposed));
        for dependent in graph.dependents(name) {
            let before = set.apply_of(&dependent);
            set.order(before, Some(deposed));
        }
    }
}
