//! End-to-end convergence tests against a recording provider

use declarative::{
    ActionKind, ActionStatus, ApplyContext, ApplyReport, Attributes, CancelToken, ConfigError,
    Configuration, ExecuteOptions, FileStateStore, MemoryStateStore, NoProgress, Outcome, Plan,
    PlanOptions, ProgressCallback, Provider, ProviderError, ProviderObject, ProviderRegistry,
    ResourceSpec, RetryPolicy, RunStatus, StateStore, Value,
};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

// ============================================================================
// Recording provider
// ============================================================================

/// Shared record of every provider call, plus scripted failures
#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, VecDeque<ProviderError>>>,
    objects: Mutex<BTreeMap<String, Attributes>>,
    next_id: AtomicUsize,
}

impl Recorder {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    /// Make the next matching calls (`"create b"`) fail with these errors, in order
    fn fail(&self, call: &str, errors: Vec<ProviderError>) {
        self.failures
            .lock()
            .unwrap()
            .insert(call.to_string(), errors.into());
    }

    fn scripted(&self, call: &str) -> Result<(), ProviderError> {
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(call).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }
}

struct RecordingProvider {
    resource_type: &'static str,
    force_new: &'static [&'static str],
    recorder: Arc<Recorder>,
}

impl Provider for RecordingProvider {
    fn resource_type(&self) -> &str {
        self.resource_type
    }

    fn create(&self, inputs: &Attributes, ctx: &ApplyContext) -> Result<ProviderObject, ProviderError> {
        let call = format!("create {}", ctx.resource);
        self.recorder.record(call.clone());
        self.recorder.scripted(&call)?;

        let n = self.recorder.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("{}-{n}", ctx.resource);
        let mut outputs = inputs.clone();
        outputs.insert("arn".into(), json!(format!("arn:sim:{id}")));
        self.recorder
            .objects
            .lock()
            .unwrap()
            .insert(id.clone(), outputs.clone());
        Ok(ProviderObject { id, outputs })
    }

    fn read(&self, id: &str, ctx: &ApplyContext) -> Result<Attributes, ProviderError> {
        self.recorder.record(format!("read {}", ctx.resource));
        self.recorder
            .objects
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound { id: id.to_string() })
    }

    fn update(&self, id: &str, inputs: &Attributes, ctx: &ApplyContext) -> Result<Attributes, ProviderError> {
        let call = format!("update {}", ctx.resource);
        self.recorder.record(call.clone());
        self.recorder.scripted(&call)?;

        let mut outputs = inputs.clone();
        outputs.insert("arn".into(), json!(format!("arn:sim:{id}")));
        self.recorder
            .objects
            .lock()
            .unwrap()
            .insert(id.to_string(), outputs.clone());
        Ok(outputs)
    }

    fn delete(&self, id: &str, ctx: &ApplyContext) -> Result<(), ProviderError> {
        let call = format!("delete {}", ctx.resource);
        self.recorder.record(call.clone());
        self.recorder.scripted(&call)?;

        match self.recorder.objects.lock().unwrap().remove(id) {
            Some(_) => Ok(()),
            None => Err(ProviderError::NotFound { id: id.to_string() }),
        }
    }

    fn force_new(&self, attribute: &str) -> bool {
        self.force_new.contains(&attribute)
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness<S: StateStore> {
    recorder: Arc<Recorder>,
    providers: ProviderRegistry,
    store: S,
}

impl Harness<MemoryStateStore> {
    fn new() -> Self {
        Self::with_store(MemoryStateStore::new())
    }
}

impl<S: StateStore> Harness<S> {
    fn with_store(store: S) -> Self {
        let recorder = Arc::new(Recorder::default());
        let mut providers = ProviderRegistry::new();
        let kinds: [(&'static str, &'static [&'static str]); 6] = [
            ("aws_vpc", &["cidr_block"]),
            ("aws_subnet", &["cidr_block", "vpc_id"]),
            ("aws_eks_cluster", &["vpc_id"]),
            ("aws_eks_node_group", &[]),
            ("aws_eks_addon", &[]),
            ("test", &["size"]),
        ];
        for (resource_type, force_new) in kinds {
            providers.register(RecordingProvider {
                resource_type,
                force_new,
                recorder: Arc::clone(&recorder),
            });
        }
        Self {
            recorder,
            providers,
            store,
        }
    }

    fn plan_with(&self, config: &Configuration, options: &PlanOptions) -> declarative::Result<Plan> {
        declarative::plan(config, &self.store.load()?, &self.providers, options)
    }

    fn plan(&self, config: &Configuration) -> Plan {
        self.plan_with(config, &PlanOptions::default()).unwrap()
    }

    fn apply_with(&self, plan: Plan, options: &ExecuteOptions, progress: &dyn ProgressCallback) -> ApplyReport {
        declarative::apply(plan, &self.store, &self.providers, options, progress).unwrap()
    }

    fn converge(&self, config: &Configuration) -> ApplyReport {
        let plan = self.plan(config);
        self.apply_with(plan, &fast_options(), &NoProgress)
    }
}

fn fast_options() -> ExecuteOptions {
    ExecuteOptions {
        parallelism: 4,
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_millis(5),
        },
        ..ExecuteOptions::default()
    }
}

fn keys(plan: &Plan) -> Vec<String> {
    plan.actions().iter().map(|a| a.key()).collect()
}

fn position(calls: &[String], call: &str) -> usize {
    calls
        .iter()
        .position(|c| c == call)
        .unwrap_or_else(|| panic!("{call} not in {calls:?}"))
}

/// VPC, two subnets, a cluster, a node group and an optional addon
fn eks_stack(enable_addon: bool) -> Configuration {
    Configuration::new()
        .parameter("enable_addon", enable_addon)
        .parameter("cluster_name", "nim")
        .resource(ResourceSpec::new("network", "aws_vpc").input("cidr_block", "10.0.0.0/16"))
        .resource(
            ResourceSpec::new("subnet_a", "aws_subnet")
                .input("vpc_id", Value::reference("network", "id"))
                .input("cidr_block", "10.0.1.0/24"),
        )
        .resource(
            ResourceSpec::new("subnet_b", "aws_subnet")
                .input("vpc_id", Value::reference("network", "id"))
                .input("cidr_block", "10.0.2.0/24"),
        )
        .resource(
            ResourceSpec::new("cluster", "aws_eks_cluster")
                .input("name", "${var.cluster_name}")
                .input("vpc_id", Value::reference("network", "id"))
                .input(
                    "subnet_ids",
                    Value::List(vec![
                        Value::reference("subnet_a", "id"),
                        Value::reference("subnet_b", "id"),
                    ]),
                ),
        )
        .resource(
            ResourceSpec::new("nodes", "aws_eks_node_group")
                .input("cluster_name", Value::reference("cluster", "name"))
                .input("desired_size", 2_i64),
        )
        .resource(
            ResourceSpec::new("addon", "aws_eks_addon")
                .condition("enable_addon")
                .input("cluster_name", Value::reference("cluster", "name"))
                .input("addon_name", "aws-efs-csi-driver")
                .depends_on("nodes"),
        )
}

/// C depends on B depends on A
fn chain() -> Configuration {
    Configuration::new()
        .resource(ResourceSpec::new("a", "test").input("size", 1_i64))
        .resource(ResourceSpec::new("b", "test").input("a_arn", Value::reference("a", "arn")))
        .resource(ResourceSpec::new("c", "test").input("b_arn", Value::reference("b", "arn")))
}

// ============================================================================
// Ordering
// ============================================================================

#[test]
fn test_topological_order_respects_every_edge() {
    let harness = Harness::new();
    let config = eks_stack(true);
    let plan = harness.plan(&config);

    let order = keys(&plan);
    for spec in &config.resources {
        let me = order.iter().position(|k| k == &format!("create {}", spec.name)).unwrap();
        for dep in spec.dependency_names() {
            let theirs = order.iter().position(|k| k == &format!("create {dep}")).unwrap();
            assert!(theirs < me, "{dep} must precede {} in {order:?}", spec.name);
        }
    }

    // Execution order under parallelism respects the same edges
    let report = harness.apply_with(plan, &fast_options(), &NoProgress);
    assert!(report.is_success());
    let calls = harness.recorder.calls();
    assert!(position(&calls, "create network") < position(&calls, "create subnet_a"));
    assert!(position(&calls, "create subnet_b") < position(&calls, "create cluster"));
    assert!(position(&calls, "create cluster") < position(&calls, "create nodes"));
    assert!(position(&calls, "create nodes") < position(&calls, "create addon"));
}

#[test]
fn test_cycle_is_rejected_before_any_provider_call() {
    let harness = Harness::new();
    harness.converge(&chain());
    harness.recorder.clear();

    let config = Configuration::new()
        .resource(ResourceSpec::new("a", "test").input("x", Value::reference("c", "arn")))
        .resource(ResourceSpec::new("b", "test").input("x", Value::reference("a", "arn")))
        .resource(ResourceSpec::new("c", "test").input("x", Value::reference("b", "arn")));

    let options = PlanOptions {
        refresh: true,
        ..PlanOptions::default()
    };
    let err = harness.plan_with(&config, &options).unwrap_err();
    match err.as_config() {
        Some(ConfigError::Cycle { cycle }) => {
            assert_eq!(cycle, &["a", "c", "b", "a"]);
        }
        other => panic!("expected a cycle, got {other:?}"),
    }
    assert!(harness.recorder.calls().is_empty());
}

#[test]
fn test_dangling_reference_is_rejected_before_any_provider_call() {
    let harness = Harness::new();
    let config = Configuration::new()
        .resource(ResourceSpec::new("cluster", "aws_eks_cluster").input("vpc_id", Value::reference("vpc", "id")));

    let err = harness.plan_with(&config, &PlanOptions::default()).unwrap_err();
    assert!(matches!(err.as_config(), Some(ConfigError::DanglingReference { target, .. }) if target == "vpc"));
    assert!(harness.recorder.calls().is_empty());
}

// ============================================================================
// Convergence
// ============================================================================

#[test]
fn test_second_plan_after_apply_is_all_noop() {
    let harness = Harness::new();
    let config = eks_stack(true);

    let report = harness.converge(&config);
    assert_eq!(report.run_status(), RunStatus::Changed);
    assert_eq!(report.summary().created, 6);

    let plan = harness.plan(&config);
    assert!(!plan.has_changes(), "{plan}");
    assert!(plan.actions().iter().all(|a| a.kind == ActionKind::NoOp));

    harness.recorder.clear();
    let report = harness.apply_with(plan, &fast_options(), &NoProgress);
    assert_eq!(report.run_status(), RunStatus::NoChanges);
    assert!(harness.recorder.calls().is_empty());
}

#[test]
fn test_in_place_update_converges_in_one_run() {
    let harness = Harness::new();
    let config = |size: i64| {
        Configuration::new()
            .resource(ResourceSpec::new("nodes", "aws_eks_node_group").input("desired_size", size))
            .resource(
                ResourceSpec::new("addon", "aws_eks_addon")
                    .input("replicas", Value::reference("nodes", "desired_size"))
                    .input("nodes_arn", Value::reference("nodes", "arn")),
            )
    };
    harness.converge(&config(2));

    let plan = harness.plan(&config(3));
    assert_eq!(keys(&plan), vec!["update nodes", "update addon"]);
    let replicas = plan.actions()[1].changes.iter().find(|c| c.name == "replicas").unwrap();
    assert_eq!(replicas.after, Some(json!(3)));

    let report = harness.apply_with(plan, &fast_options(), &NoProgress);
    assert_eq!(report.run_status(), RunStatus::Changed);
    let addon = harness.store.get("addon").unwrap().unwrap();
    assert_eq!(addon.inputs["replicas"], json!(3));

    let plan = harness.plan(&config(3));
    assert!(!plan.has_changes(), "{plan}");
}

#[test]
fn test_partial_failure_converges_on_rerun() {
    let harness = Harness::new();
    harness.recorder.fail(
        "create b",
        vec![ProviderError::PermissionDenied {
            message: "iam:PassRole".into(),
        }],
    );

    let first = harness.converge(&chain());
    let a = first.find("a", ActionKind::Create).unwrap();
    let b = first.find("b", ActionKind::Create).unwrap();
    let c = first.find("c", ActionKind::Create).unwrap();
    assert_eq!(a.status, ActionStatus::Succeeded);
    assert_eq!(b.status, ActionStatus::Failed);
    assert_eq!(c.status, ActionStatus::Skipped);
    assert_eq!(c.outcome, Outcome::Skipped { blocked_by: "b".into() });
    assert_eq!(first.run_status(), RunStatus::PartialFailure);
    assert_eq!(first.run_status().exit_code(), 1);

    // State holds exactly what succeeded
    let state = harness.store.load().unwrap();
    assert_eq!(state.keys().collect::<Vec<_>>(), vec!["a"]);

    let plan = harness.plan(&chain());
    assert_eq!(keys(&plan), vec!["no-op a", "create b", "create c"]);

    let second = harness.apply_with(plan, &fast_options(), &NoProgress);
    assert!(second.is_success());
    assert_eq!(second.find("a", ActionKind::NoOp).unwrap().status, ActionStatus::Succeeded);
    assert_eq!(second.find("b", ActionKind::Create).unwrap().status, ActionStatus::Succeeded);
    assert_eq!(second.find("c", ActionKind::Create).unwrap().status, ActionStatus::Succeeded);

    assert_eq!(harness.recorder.count("create a"), 1);
    assert_eq!(harness.recorder.count("create b"), 2);
    assert_eq!(harness.recorder.count("create c"), 1);
}

#[test]
fn test_transient_errors_are_retried() {
    let harness = Harness::new();
    harness.recorder.fail(
        "create a",
        vec![
            ProviderError::Throttled {
                message: "rate exceeded".into(),
            },
            ProviderError::NotFoundYet {
                message: "role not visible".into(),
            },
        ],
    );

    let report = harness.converge(&chain());
    assert!(report.is_success());
    assert_eq!(report.find("a", ActionKind::Create).unwrap().attempts, 3);
    assert_eq!(harness.recorder.count("create a"), 3);
}

#[test]
fn test_transient_errors_escalate_after_max_attempts() {
    let harness = Harness::new();
    let throttled = ProviderError::Throttled {
        message: "rate exceeded".into(),
    };
    harness.recorder.fail("create a", vec![throttled.clone(), throttled.clone(), throttled]);

    let report = harness.converge(&chain());
    let a = report.find("a", ActionKind::Create).unwrap();
    assert_eq!(a.status, ActionStatus::Failed);
    assert_eq!(a.attempts, 3);
    assert_eq!(report.summary().skipped, 2);
}

// ============================================================================
// Parallelism
// ============================================================================

/// Counts provider calls in flight and remembers the peak
#[derive(Default)]
struct Gauge {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl Provider for Gauge {
    fn resource_type(&self) -> &str {
        "test"
    }

    fn create(&self, inputs: &Attributes, ctx: &ApplyContext) -> Result<ProviderObject, ProviderError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(ProviderObject {
            id: format!("{}-id", ctx.resource),
            outputs: inputs.clone(),
        })
    }

    fn read(&self, id: &str, _ctx: &ApplyContext) -> Result<Attributes, ProviderError> {
        Err(ProviderError::NotFound { id: id.to_string() })
    }

    fn update(&self, _id: &str, inputs: &Attributes, _ctx: &ApplyContext) -> Result<Attributes, ProviderError> {
        Ok(inputs.clone())
    }

    fn delete(&self, _id: &str, _ctx: &ApplyContext) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Peak concurrent creates for eight independent resources
fn peak_concurrency(parallelism: usize) -> usize {
    let gauge = Arc::new(Gauge::default());
    let mut providers = ProviderRegistry::new();
    providers.register_arc(gauge.clone());

    let config = (0..8).fold(Configuration::new(), |config, i| {
        config.resource(ResourceSpec::new(format!("w{i}"), "test").input("index", i64::from(i)))
    });
    let store = MemoryStateStore::new();
    let plan = declarative::plan(&config, &store.load().unwrap(), &providers, &PlanOptions::default()).unwrap();
    let options = ExecuteOptions {
        parallelism,
        ..fast_options()
    };
    let report = declarative::apply(plan, &store, &providers, &options, &NoProgress).unwrap();
    assert_eq!(report.summary().created, 8);
    gauge.peak.load(Ordering::SeqCst)
}

#[test]
fn test_parallelism_bounds_concurrent_provider_calls() {
    let peak = peak_concurrency(3);
    assert!(peak <= 3, "peak {peak}");
    assert!(peak > 1, "independent creates never overlapped");
}

#[test]
fn test_parallelism_of_one_is_sequential() {
    assert_eq!(peak_concurrency(1), 1);
}

// ============================================================================
// Conditions
// ============================================================================

#[test]
fn test_false_condition_removes_node() {
    let harness = Harness::new();
    let graph = declarative::validate(&eks_stack(false), &harness.providers).unwrap();
    assert!(!graph.contains("addon"));
    assert!(graph.contains("nodes"));

    let config = eks_stack(false).resource(
        ResourceSpec::new("dashboard", "helm_release").input("addon", Value::reference("addon", "arn")),
    );
    let err = harness.plan_with(&config, &PlanOptions::default()).unwrap_err();
    assert!(matches!(
        err.as_config(),
        Some(ConfigError::ConditionallyAbsent { resource, target }) if resource == "dashboard" && target == "addon"
    ));
}

#[test]
fn test_network_cluster_addon_scenario() {
    let harness = Harness::new();

    let report = harness.converge(&eks_stack(false));
    assert!(report.is_success());
    assert!(harness.store.get("addon").unwrap().is_none());
    assert_eq!(harness.recorder.count("create addon"), 0);

    // Flipping the flag on adds only the addon
    let plan = harness.plan(&eks_stack(true));
    let changes: Vec<_> = plan.changes().map(|a| a.key()).collect();
    assert_eq!(changes, vec!["create addon"]);
    harness.apply_with(plan, &fast_options(), &NoProgress);

    let addon = harness.store.get("addon").unwrap().unwrap();
    assert_eq!(addon.inputs["cluster_name"], json!("nim"));
    assert!(addon.dependencies.contains("nodes"));

    // And back off deletes it
    let plan = harness.plan(&eks_stack(false));
    let delete = plan.changes().next().unwrap();
    assert_eq!(delete.key(), "delete addon");
    assert_eq!(delete.reason, "condition is false");
    let report = harness.apply_with(plan, &fast_options(), &NoProgress);
    assert_eq!(report.resource_outcomes()["addon"], "deleted");
    assert!(harness.store.get("addon").unwrap().is_none());
}

// ============================================================================
// Replacement
// ============================================================================

#[test]
fn test_create_before_destroy_creates_first() {
    let harness = Harness::new();
    let config = |cidr: &str| {
        Configuration::new()
            .resource(
                ResourceSpec::new("network", "aws_vpc")
                    .input("cidr_block", cidr)
                    .create_before_destroy(),
            )
            .resource(
                ResourceSpec::new("cluster", "aws_eks_cluster")
                    .input("name", "nim")
                    .input("vpc_id", Value::reference("network", "id")),
            )
    };

    harness.converge(&config("10.0.0.0/16"));
    let old_id = harness.store.get("network").unwrap().unwrap().id;
    harness.recorder.clear();

    // vpc_id forces a new cluster once the network is replaced
    let report = harness.converge(&config("10.1.0.0/16"));
    assert!(report.is_success());
    assert_eq!(report.resource_outcomes()["network"], "replaced");

    let calls = harness.recorder.calls();
    assert!(position(&calls, "create network") < position(&calls, "delete network"));
    assert!(position(&calls, "create cluster") < position(&calls, "delete network"));

    let network = harness.store.get("network").unwrap().unwrap();
    assert_ne!(network.id, old_id);
    assert!(network.deposed.is_empty());
}

#[test]
fn test_failed_deposed_delete_is_retried_next_run() {
    let harness = Harness::new();
    let config = |cidr: &str| {
        Configuration::new().resource(
            ResourceSpec::new("network", "aws_vpc")
                .input("cidr_block", cidr)
                .create_before_destroy(),
        )
    };

    harness.converge(&config("10.0.0.0/16"));
    let old_id = harness.store.get("network").unwrap().unwrap().id;
    harness.recorder.fail(
        "delete network",
        vec![ProviderError::PermissionDenied {
            message: "ec2:DeleteVpc".into(),
        }],
    );

    let report = harness.converge(&config("10.1.0.0/16"));
    assert_eq!(report.run_status(), RunStatus::PartialFailure);
    let network = harness.store.get("network").unwrap().unwrap();
    assert_eq!(network.deposed, vec![old_id.clone()]);

    let plan = harness.plan(&config("10.1.0.0/16"));
    let changes: Vec<_> = plan.changes().map(|a| a.key()).collect();
    assert_eq!(changes, vec![format!("delete network (deposed {old_id})")]);

    harness.apply_with(plan, &fast_options(), &NoProgress);
    assert!(harness.store.get("network").unwrap().unwrap().deposed.is_empty());
}

#[test]
fn test_replacement_without_create_before_destroy_deletes_first() {
    let harness = Harness::new();
    let config = |size: i64| Configuration::new().resource(ResourceSpec::new("a", "test").input("size", size));

    harness.converge(&config(1));
    harness.recorder.clear();

    let report = harness.converge(&config(2));
    assert!(report.is_success());
    assert_eq!(harness.recorder.calls(), vec!["delete a", "create a"]);
}

#[test]
fn test_removed_resources_delete_dependents_first() {
    let harness = Harness::new();
    harness.converge(&chain());
    harness.recorder.clear();

    let report = harness.converge(&Configuration::new());
    assert!(report.is_success());
    assert_eq!(harness.recorder.calls(), vec!["delete c", "delete b", "delete a"]);
    assert!(harness.store.load().unwrap().is_empty());
}

// ============================================================================
// Destroy, refresh and cancellation
// ============================================================================

#[test]
fn test_destroy_reverses_creation_order() {
    let harness = Harness::new();
    harness.converge(&eks_stack(true));
    harness.recorder.clear();

    let report = declarative::destroy(
        &eks_stack(true),
        &harness.store,
        &harness.providers,
        &PlanOptions::default(),
        &fast_options(),
        &NoProgress,
    )
    .unwrap();
    assert!(report.is_success());
    assert_eq!(report.summary().removed, 6);

    let calls = harness.recorder.calls();
    assert!(position(&calls, "delete addon") < position(&calls, "delete nodes"));
    assert!(position(&calls, "delete nodes") < position(&calls, "delete cluster"));
    assert!(position(&calls, "delete cluster") < position(&calls, "delete subnet_a"));
    assert!(position(&calls, "delete subnet_a") < position(&calls, "delete network"));
    assert!(harness.store.load().unwrap().is_empty());
}

#[test]
fn test_refresh_recreates_drifted_resources() {
    let harness = Harness::new();
    harness.converge(&chain());

    // Someone deleted b behind our back
    let b = harness.store.get("b").unwrap().unwrap();
    harness.recorder.objects.lock().unwrap().remove(&b.id);

    let without = harness.plan(&chain());
    assert!(!without.has_changes());

    let options = PlanOptions {
        refresh: true,
        ..PlanOptions::default()
    };
    let plan = harness.plan_with(&chain(), &options).unwrap();
    let changes: Vec<_> = plan.changes().map(|a| a.key()).collect();
    assert_eq!(changes, vec!["create b", "update c"]);

    let report = harness.apply_with(plan, &fast_options(), &NoProgress);
    assert!(report.is_success());
    assert_ne!(harness.store.get("b").unwrap().unwrap().id, b.id);
}

/// Cancels the run as soon as the first action completes
struct CancelAfterFirst(CancelToken);

impl ProgressCallback for CancelAfterFirst {
    fn on_action_complete(&self, _report: &declarative::ActionReport) {
        self.0.cancel();
    }
}

#[test]
fn test_cancellation_stops_new_work_and_rerun_converges() {
    let harness = Harness::new();
    let cancel = CancelToken::new();
    let options = ExecuteOptions {
        parallelism: 1,
        cancel: cancel.clone(),
        ..fast_options()
    };

    let plan = harness.plan(&chain());
    let report = harness.apply_with(plan, &options, &CancelAfterFirst(cancel));
    assert!(report.cancelled);
    assert_eq!(report.find("a", ActionKind::Create).unwrap().outcome, Outcome::Created);
    assert_eq!(report.find("b", ActionKind::Create).unwrap().outcome, Outcome::Cancelled);
    assert_eq!(report.run_status(), RunStatus::PartialFailure);

    let report = harness.converge(&chain());
    assert!(report.is_success());
    assert_eq!(harness.recorder.count("create a"), 1);
}

// ============================================================================
// File-backed state
// ============================================================================

#[test]
fn test_file_store_survives_between_runs() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state").join("converge.json");

    let harness = Harness::with_store(FileStateStore::open(&path).unwrap());
    let report = harness.converge(&eks_stack(true));
    assert!(report.is_success());

    let reopened = FileStateStore::open(&path).unwrap();
    assert_eq!(reopened.load().unwrap().len(), 6);
    let plan = declarative::plan(
        &eks_stack(true),
        &reopened.load().unwrap(),
        &harness.providers,
        &PlanOptions::default(),
    )
    .unwrap();
    assert!(!plan.has_changes());
}

#[test]
fn test_corrupt_state_refuses_to_plan() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("converge.json");
    std::fs::write(&path, r#"{"format_version": 7, "serial": 1, "resources": {}}"#).unwrap();

    let err = FileStateStore::open(&path).unwrap_err();
    assert!(err.is_state_corruption());
}
