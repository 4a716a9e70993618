//! Execution engine - applies a plan with bounded parallelism
//!
//! The calling thread runs the scheduler: it tracks how many predecessors
//! of each action are still outstanding, hands ready actions to a rayon pool
//! and waits for completions on a channel. Workers commit to the state store
//! before reporting success, so a dependent never starts ahead of the state
//! write it relies on.

use crate::context::{ApplyContext, ProgressCallback};
use crate::diff::input_hash;
use crate::error::{Error, ProviderError, Result};
use crate::planner::Plan;
use crate::provider::{Provider, ProviderRegistry};
use crate::resource::ResourceSpec;
use crate::retry::{RetryOutcome, with_retry};
use crate::state::{StateEntry, StateStore};
use crate::types::{Action, ActionKind, ActionReport, ActionStatus, ApplyReport, ExecuteOptions, Outcome};
use crate::value::{Attributes, Reference};
use chrono::Utc;
use serde_json::Value as Json;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// Apply a plan.
///
/// Consumes the plan: a plan is computed against one snapshot of state and
/// is only valid for a single run. Provider failures do not make this return
/// an error; they are reported per action in the [`ApplyReport`].
pub fn apply(
    plan: Plan,
    store: &dyn StateStore,
    providers: &ProviderRegistry,
    options: &ExecuteOptions,
    progress: &dyn ProgressCallback,
) -> Result<ApplyReport> {
    let Plan {
        actions,
        predecessors,
        resources,
        dependencies,
    } = plan;

    let parallelism = options.parallelism.max(1);
    log::info!("Applying {} actions (parallelism {parallelism})", actions.len());
    progress.on_plan_start(actions.len());

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(parallelism)
        .thread_name(|i| format!("converge-worker-{i}"))
        .build()
        .map_err(|e| Error::Executor(format!("failed to create thread pool: {e}")))?;

    let worker = Worker {
        store,
        providers,
        options,
        progress,
        resources: &resources,
        dependencies: &dependencies,
    };

    let mut scheduler = Scheduler::new(&actions, &predecessors);
    let (tx, rx) = mpsc::channel::<(usize, Outcome, u32)>();

    pool.in_place_scope(|scope| {
        loop {
            while scheduler.in_flight < parallelism && !options.cancel.is_cancelled() {
                let Some(index) = scheduler.next_ready() else {
                    break;
                };
                let action = &actions[index];
                log::debug!("Starting {}", action.key());
                progress.on_action_start(action);

                let tx = tx.clone();
                let worker = &worker;
                scope.spawn(move |_| {
                    let (outcome, attempts) = catch_unwind(AssertUnwindSafe(|| worker.run(action)))
                        .unwrap_or_else(|_| {
                            (
                                Outcome::Failed {
                                    reason: "provider panicked".to_string(),
                                },
                                1,
                            )
                        });
                    let _ = tx.send((index, outcome, attempts));
                });
            }

            if scheduler.in_flight == 0 {
                break;
            }
            let Ok((index, outcome, attempts)) = rx.recv() else {
                break;
            };
            scheduler.complete(index, outcome, attempts, progress);
        }
    });

    let report = scheduler.finish(progress);
    let summary = report.summary();
    log::info!(
        "Apply finished: {} created, {} updated, {} deleted, {} unchanged, {} failed, {} skipped",
        summary.created,
        summary.modified,
        summary.removed,
        summary.no_change,
        summary.failed,
        summary.skipped
    );
    Ok(report)
}

// ============================================================================
// Scheduler
// ============================================================================

/// Per-action bookkeeping, owned by the scheduling thread
struct Scheduler<'a> {
    actions: &'a [Action],
    dependents: Vec<Vec<usize>>,
    remaining: Vec<usize>,
    status: Vec<ActionStatus>,
    reports: Vec<Option<ActionReport>>,
    ready: BTreeSet<usize>,
    in_flight: usize,
}

impl<'a> Scheduler<'a> {
    fn new(actions: &'a [Action], predecessors: &[Vec<usize>]) -> Self {
        let mut dependents = vec![Vec::new(); actions.len()];
        let mut remaining = vec![0; actions.len()];
        for (index, preds) in predecessors.iter().enumerate().take(actions.len()) {
            remaining[index] = preds.len();
            for &pred in preds {
                dependents[pred].push(index);
            }
        }
        let ready = (0..actions.len()).filter(|&i| remaining[i] == 0).collect();

        Self {
            actions,
            dependents,
            remaining,
            status: vec![ActionStatus::Pending; actions.len()],
            reports: vec![None; actions.len()],
            ready,
            in_flight: 0,
        }
    }

    /// Lowest-index ready action, marked in progress
    fn next_ready(&mut self) -> Option<usize> {
        let index = self.ready.pop_first()?;
        self.status[index] = ActionStatus::InProgress;
        self.in_flight += 1;
        Some(index)
    }

    fn complete(&mut self, index: usize, outcome: Outcome, attempts: u32, progress: &dyn ProgressCallback) {
        self.in_flight -= 1;
        let failed = outcome.is_failure();
        let status = if failed {
            ActionStatus::Failed
        } else {
            ActionStatus::Succeeded
        };

        let action = &self.actions[index];
        if failed {
            log::warn!("{} failed: {outcome}", action.key());
        } else {
            log::info!("{}: {outcome}", action.address());
        }
        self.record(index, status, outcome, attempts, progress);

        if failed {
            self.cascade(index, progress);
            return;
        }

        for &dependent in &self.dependents[index] {
            self.remaining[dependent] -= 1;
            if self.remaining[dependent] == 0 && self.status[dependent] == ActionStatus::Pending {
                self.ready.insert(dependent);
            }
        }
    }

    /// Mark everything downstream of a failed action as skipped
    fn cascade(&mut self, failed: usize, progress: &dyn ProgressCallback) {
        let blocked_by = self.actions[failed].name.clone();
        let mut stack = self.dependents[failed].clone();
        while let Some(index) = stack.pop() {
            if self.status[index] != ActionStatus::Pending {
                continue;
            }
            log::debug!("Skipping {} (blocked by {blocked_by})", self.actions[index].key());
            let outcome = Outcome::Skipped {
                blocked_by: blocked_by.clone(),
            };
            self.record(index, ActionStatus::Skipped, outcome, 0, progress);
            stack.extend(self.dependents[index].iter().copied());
        }
    }

    fn record(
        &mut self,
        index: usize,
        status: ActionStatus,
        outcome: Outcome,
        attempts: u32,
        progress: &dyn ProgressCallback,
    ) {
        self.ready.remove(&index);
        self.status[index] = status;
        let report = ActionReport {
            action: self.actions[index].clone(),
            status,
            outcome,
            attempts,
        };
        progress.on_action_complete(&report);
        self.reports[index] = Some(report);
    }

    /// Report every action; anything never started was cancelled
    fn finish(mut self, progress: &dyn ProgressCallback) -> ApplyReport {
        let mut cancelled = false;
        for index in 0..self.actions.len() {
            if self.reports[index].is_none() {
                cancelled = true;
                self.record(index, ActionStatus::Skipped, Outcome::Cancelled, 0, progress);
            }
        }
        if cancelled {
            log::warn!("Apply cancelled; unstarted actions were skipped");
        }

        ApplyReport {
            actions: self.reports.into_iter().flatten().collect(),
            cancelled,
        }
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Everything a worker thread needs to run one action
struct Worker<'a> {
    store: &'a dyn StateStore,
    providers: &'a ProviderRegistry,
    options: &'a ExecuteOptions,
    progress: &'a dyn ProgressCallback,
    resources: &'a BTreeMap<String, ResourceSpec>,
    dependencies: &'a BTreeMap<String, BTreeSet<String>>,
}

/// Failure text for an action, before it becomes an [`Outcome`]
type Failure = String;

impl Worker<'_> {
    fn run(&self, action: &Action) -> (Outcome, u32) {
        let Some(provider) = self.providers.get(&action.resource_type) else {
            return (
                Outcome::Failed {
                    reason: format!("no provider for resource type {}", action.resource_type),
                },
                0,
            );
        };
        let provider = provider.as_ref();

        let result = match action.kind {
            ActionKind::Create => self.create(action, provider),
            ActionKind::Update => self.update(action, provider),
            ActionKind::Delete => self.delete(action, provider),
            ActionKind::NoOp => self.noop(action).map(|()| (Outcome::Unchanged, 0)),
        };

        match result {
            Ok(done) => done,
            Err((reason, attempts)) => (Outcome::Failed { reason }, attempts),
        }
    }

    fn spec(&self, action: &Action) -> std::result::Result<&ResourceSpec, Failure> {
        self.resources
            .get(&action.name)
            .ok_or_else(|| format!("{} is not declared in this plan", action.name))
    }

    fn dependencies(&self, name: &str) -> BTreeSet<String> {
        self.dependencies.get(name).cloned().unwrap_or_default()
    }

    fn lookup(&self, reference: &Reference) -> Option<Json> {
        let entry = self.store.get(&reference.resource).ok().flatten()?;
        reference.lookup(&entry.outputs).cloned()
    }

    /// Resolve references against outputs committed so far
    fn resolve_inputs(&self, spec: &ResourceSpec) -> std::result::Result<Attributes, Failure> {
        let mut inputs = Attributes::new();
        for (name, value) in &spec.inputs {
            let Some(resolved) = value.resolve(&mut |r| self.lookup(r)) else {
                let missing = value
                    .references()
                    .into_iter()
                    .find(|r| self.lookup(r).is_none())
                    .map_or_else(String::new, ToString::to_string);
                return Err(format!("{name}: unresolved reference {missing}"));
            };
            inputs.insert(name.clone(), resolved);
        }
        Ok(inputs)
    }

    /// Call the provider with retry and a per-attempt deadline
    fn call<T>(
        &self,
        action: &Action,
        mut op: impl FnMut(&ApplyContext) -> std::result::Result<T, ProviderError>,
    ) -> RetryOutcome<T> {
        let mut on_retry = |attempt: u32, error: &ProviderError, delay: Duration| {
            log::warn!(
                "{} attempt {attempt} failed: {error}; retrying in {:.1}s",
                action.key(),
                delay.as_secs_f64()
            );
            self.progress.on_retry(action, attempt, error, delay);
        };

        with_retry(&self.options.retry, &self.options.cancel, &mut on_retry, |attempt| {
            let ctx = ApplyContext {
                resource: &action.name,
                attempt,
                deadline: self.options.action_timeout.map(|t| Instant::now() + t),
                cancel: &self.options.cancel,
            };
            match op(&ctx) {
                // An unclassified error past the deadline is a timeout; classified ones stand
                Err(ProviderError::Other(e)) if ctx.is_expired() => Err(ProviderError::Timeout {
                    message: format!("deadline exceeded ({e})"),
                }),
                other => other,
            }
        })
    }

    fn commit(&self, name: &str, f: &mut dyn FnMut(Option<StateEntry>) -> Option<StateEntry>) -> std::result::Result<(), Failure> {
        self.store
            .modify(name, f)
            .map_err(|e| format!("provider call succeeded but state commit failed: {e}"))
    }

    fn create(&self, action: &Action, provider: &dyn Provider) -> std::result::Result<(Outcome, u32), (Failure, u32)> {
        let spec = self.spec(action).map_err(before_call)?;
        let inputs = self.resolve_inputs(spec).map_err(before_call)?;

        let RetryOutcome { result, attempts } = self.call(action, |ctx| provider.create(&inputs, ctx));
        let object = result.map_err(|e| (failure(&e, attempts), attempts))?;

        let mut outputs = object.outputs;
        outputs.insert("id".to_string(), Json::String(object.id.clone()));
        let fresh = StateEntry {
            name: action.name.clone(),
            resource_type: action.resource_type.clone(),
            id: object.id,
            outputs,
            input_hash: input_hash(&inputs),
            inputs,
            dependencies: self.dependencies(&action.name),
            deposed: Vec::new(),
            updated_at: Utc::now(),
        };

        self.commit(&action.name, &mut |current| {
            let mut entry = fresh.clone();
            if let Some(current) = current {
                entry.deposed = current.deposed;
                // The instance being replaced stays tracked until deleted
                if action.replacement && current.id != entry.id && !entry.deposed.contains(&current.id) {
                    entry.deposed.push(current.id);
                }
            }
            Some(entry)
        })
        .map_err(|e| (e, attempts))?;

        Ok((Outcome::Created, attempts))
    }

    fn update(&self, action: &Action, provider: &dyn Provider) -> std::result::Result<(Outcome, u32), (Failure, u32)> {
        let spec = self.spec(action).map_err(before_call)?;
        let current = self
            .store
            .get(&action.name)
            .map_err(|e| before_call(e.to_string()))?
            .ok_or_else(|| before_call(format!("{} has no state entry to update", action.name)))?;

        let mut inputs = self.resolve_inputs(spec).map_err(before_call)?;
        inputs.extend(action.pinned.iter().map(|(k, v)| (k.clone(), v.clone())));

        let RetryOutcome { result, attempts } =
            self.call(action, |ctx| provider.update(&current.id, &inputs, ctx));
        let mut outputs = result.map_err(|e| (failure(&e, attempts), attempts))?;
        outputs.insert("id".to_string(), Json::String(current.id.clone()));

        let hash = input_hash(&inputs);
        let dependencies = self.dependencies(&action.name);
        self.commit(&action.name, &mut |entry| {
            let mut entry = entry.unwrap_or_else(|| current.clone());
            entry.outputs = outputs.clone();
            entry.inputs = inputs.clone();
            entry.input_hash = hash.clone();
            entry.dependencies = dependencies.clone();
            entry.updated_at = Utc::now();
            Some(entry)
        })
        .map_err(|e| (e, attempts))?;

        Ok((Outcome::Updated, attempts))
    }

    fn delete(&self, action: &Action, provider: &dyn Provider) -> std::result::Result<(Outcome, u32), (Failure, u32)> {
        let id = match &action.deposed {
            Some(id) => id.clone(),
            None => match self.store.get(&action.name).map_err(|e| before_call(e.to_string()))? {
                Some(entry) => entry.id,
                None => return Ok((Outcome::Deleted, 0)),
            },
        };

        let RetryOutcome { result, attempts } = self.call(action, |ctx| provider.delete(&id, ctx));
        match result {
            Ok(()) => {}
            Err(ProviderError::NotFound { .. }) => {
                log::debug!("{} was already gone", action.key());
            }
            Err(e) => return Err((failure(&e, attempts), attempts)),
        }

        let deposed = action.deposed.is_some();
        self.commit(&action.name, &mut |current| match current {
            Some(mut entry) if deposed => {
                entry.deposed.retain(|d| d != &id);
                Some(entry)
            }
            Some(entry) if entry.id == id => None,
            other => other,
        })
        .map_err(|e| (e, attempts))?;

        Ok((Outcome::Deleted, attempts))
    }

    /// No provider call; only refresh recorded dependencies if they moved
    fn noop(&self, action: &Action) -> std::result::Result<(), (Failure, u32)> {
        let dependencies = self.dependencies(&action.name);
        let current = self.store.get(&action.name).map_err(|e| before_call(e.to_string()))?;
        if current.is_some_and(|entry| entry.dependencies != dependencies) {
            self.commit(&action.name, &mut |entry| {
                entry.map(|mut entry| {
                    entry.dependencies = dependencies.clone();
                    entry
                })
            })
            .map_err(before_call)?;
        }
        Ok(())
    }
}

/// A failure before any provider call was made
fn before_call(reason: Failure) -> (Failure, u32) {
    (reason, 0)
}

fn failure(error: &ProviderError, attempts: u32) -> Failure {
    if attempts > 1 {
        format!("{error} (after {attempts} attempts)")
    } else {
        error.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{CancelToken, NoProgress};
    use crate::planner::{PlanOptions, plan};
    use crate::provider::ProviderObject;
    use crate::resource::Configuration;
    use crate::retry::RetryPolicy;
    use crate::state::MemoryStateStore;
    use crate::value::Value;
    use std::sync::Mutex;

    /// Provider that fails creates for names listed in `fail`
    #[derive(Default)]
    struct Scripted {
        fail: Vec<&'static str>,
        /// Error for failing creates; permission denied when unset
        error: Option<ProviderError>,
        slow: Option<Duration>,
        calls: Mutex<Vec<String>>,
    }

    impl Provider for Scripted {
        fn resource_type(&self) -> &str {
            "test"
        }

        fn create(&self, inputs: &Attributes, ctx: &ApplyContext) -> std::result::Result<ProviderObject, ProviderError> {
            self.calls.lock().unwrap().push(format!("create {}", ctx.resource));
            if let Some(delay) = self.slow {
                std::thread::sleep(delay);
            }
            if self.fail.iter().any(|f| *f == ctx.resource) {
                return Err(self.error.clone().unwrap_or_else(|| ProviderError::PermissionDenied {
                    message: "denied".into(),
                }));
            }
            Ok(ProviderObject {
                id: format!("{}-id", ctx.resource),
                outputs: inputs.clone(),
            })
        }

        fn read(&self, id: &str, _ctx: &ApplyContext) -> std::result::Result<Attributes, ProviderError> {
            Err(ProviderError::NotFound { id: id.to_string() })
        }

        fn update(&self, _id: &str, inputs: &Attributes, _ctx: &ApplyContext) -> std::result::Result<Attributes, ProviderError> {
            Ok(inputs.clone())
        }

        fn delete(&self, _id: &str, _ctx: &ApplyContext) -> std::result::Result<(), ProviderError> {
            Ok(())
        }
    }

    fn registry(provider: Scripted) -> (ProviderRegistry, std::sync::Arc<Scripted>) {
        let provider = std::sync::Arc::new(provider);
        let mut registry = ProviderRegistry::new();
        registry.register_arc(provider.clone());
        (registry, provider)
    }

    fn chain() -> Configuration {
        Configuration::new()
            .resource(ResourceSpec::new("a", "test").input("size", 1_i64))
            .resource(ResourceSpec::new("b", "test").input("a_id", Value::reference("a", "id")))
            .resource(ResourceSpec::new("c", "test").input("b_id", Value::reference("b", "id")))
            .resource(ResourceSpec::new("solo", "test"))
    }

    fn options() -> ExecuteOptions {
        ExecuteOptions {
            retry: RetryPolicy::no_retry(),
            ..ExecuteOptions::default()
        }
    }

    #[test]
    fn test_apply_resolves_references_from_state() {
        let (providers, _) = registry(Scripted::default());
        let store = MemoryStateStore::new();
        let plan = plan(&chain(), &store.load().unwrap(), &providers, &PlanOptions::default()).unwrap();

        let report = apply(plan, &store, &providers, &options(), &NoProgress).unwrap();
        assert!(report.is_success());

        let c = store.get("c").unwrap().unwrap();
        assert_eq!(c.inputs["b_id"], Json::from("b-id"));
        assert_eq!(c.dependencies, BTreeSet::from(["b".to_string()]));
        assert_eq!(c.outputs["id"], Json::from("c-id"));
    }

    #[test]
    fn test_failure_skips_dependents_only() {
        let (providers, _) = registry(Scripted {
            fail: vec!["b"],
            ..Scripted::default()
        });
        let store = MemoryStateStore::new();
        let plan = plan(&chain(), &store.load().unwrap(), &providers, &PlanOptions::default()).unwrap();

        let report = apply(plan, &store, &providers, &options(), &NoProgress).unwrap();
        let outcomes = report.resource_outcomes();
        assert_eq!(outcomes["a"], "created");
        assert_eq!(outcomes["b"], "failed: permission denied: denied");
        assert_eq!(outcomes["c"], "skipped: blocked by b");
        assert_eq!(outcomes["solo"], "created");
        assert!(store.get("b").unwrap().is_none());
    }

    #[test]
    fn test_cancel_before_start_runs_nothing() {
        let (providers, provider) = registry(Scripted::default());
        let store = MemoryStateStore::new();
        let plan = plan(&chain(), &store.load().unwrap(), &providers, &PlanOptions::default()).unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        let options = ExecuteOptions { cancel, ..options() };

        let report = apply(plan, &store, &providers, &options, &NoProgress).unwrap();
        assert!(report.cancelled);
        assert!(report.actions.iter().all(|r| r.outcome == Outcome::Cancelled));
        assert!(provider.calls.lock().unwrap().is_empty());
    }

    fn run_past_deadline(error: Option<ProviderError>) -> (ActionReport, usize) {
        let (providers, provider) = registry(Scripted {
            fail: vec!["solo"],
            error,
            slow: Some(Duration::from_millis(20)),
            ..Scripted::default()
        });
        let store = MemoryStateStore::new();
        let config = Configuration::new().resource(ResourceSpec::new("solo", "test"));
        let plan = plan(&config, &store.load().unwrap(), &providers, &PlanOptions::default()).unwrap();

        let options = ExecuteOptions {
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                backoff_factor: 1.0,
                max_delay: Duration::from_millis(1),
            },
            action_timeout: Some(Duration::from_millis(5)),
            ..ExecuteOptions::default()
        };

        let mut report = apply(plan, &store, &providers, &options, &NoProgress).unwrap();
        let calls = provider.calls.lock().unwrap().len();
        (report.actions.remove(0), calls)
    }

    #[test]
    fn test_unclassified_error_after_deadline_is_transient() {
        let (solo, calls) = run_past_deadline(Some(ProviderError::Other("connection reset".into())));
        assert_eq!(solo.attempts, 2);
        assert!(matches!(&solo.outcome, Outcome::Failed { reason } if reason.contains("deadline exceeded")));
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_fatal_error_after_deadline_is_not_retried() {
        let (solo, calls) = run_past_deadline(None);
        assert_eq!(solo.attempts, 1);
        assert_eq!(solo.status, ActionStatus::Failed);
        assert!(matches!(&solo.outcome, Outcome::Failed { reason } if reason == "permission denied: denied"));
        assert_eq!(calls, 1);
    }
}
