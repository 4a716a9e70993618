//! # Declarative
//!
//! A convergence engine for declarative infrastructure.
//!
//! Given a set of resource declarations and the last-known state of what
//! exists, the engine works out what to create, update, replace and delete,
//! orders those actions by dependency, and applies them through providers
//! with bounded parallelism. A run that fails part-way leaves state
//! reflecting everything that did succeed, so re-running converges.
//!
//! ## Core Concepts
//!
//! - **ResourceSpec**: one declared object, its inputs (which may reference
//!   other resources' outputs), `depends_on` hints, an optional condition
//!   and a lifecycle policy
//! - **DependencyGraph**: the DAG of surviving resources
//! - **StateStore**: last-known instances, keyed by logical name
//! - **Plan**: ordered Create/Update/Delete/NoOp actions plus their DAG
//! - **Executor**: applies a plan, retrying transient provider errors and
//!   skipping everything downstream of a fatal one
//!
//! ## Example
//!
//! ```ignore
//! use declarative::{
//!     Configuration, ExecuteOptions, MemoryStateStore, NoProgress, PlanOptions,
//!     ProviderRegistry, ResourceSpec, StateStore, Value,
//! };
//!
//! let config = Configuration::new()
//!     .parameter("enable_addon", true)
//!     .resource(ResourceSpec::new("network", "aws_vpc").input("cidr_block", "10.0.0.0/16"))
//!     .resource(
//!         ResourceSpec::new("cluster", "aws_eks_cluster")
//!             .input("vpc_id", Value::reference("network", "id")),
//!     )
//!     .resource(
//!         ResourceSpec::new("addon", "aws_eks_addon")
//!             .condition("enable_addon")
//!             .input("cluster_name", Value::reference("cluster", "name")),
//!     );
//!
//! let mut providers = ProviderRegistry::new();
//! // providers.register(...);
//!
//! let store = MemoryStateStore::new();
//! let plan = declarative::plan(&config, &store.load()?, &providers, &PlanOptions::default())?;
//! println!("{plan}");
//!
//! let report = declarative::apply(plan, &store, &providers, &ExecuteOptions::default(), &NoProgress)?;
//! std::process::exit(report.run_status().exit_code());
//! ```
//!
//! ## Extension Points
//!
//! - [`Provider`]: CRUD for one resource type
//! - [`StateStore`]: where state lives
//! - [`ProgressCallback`]: observes execution
//!
//! The crate has no UI and no process-global state; the CLI supplies both.

pub mod condition;
pub mod context;
pub mod diff;
pub mod error;
pub mod executor;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod resource;
pub mod retry;
pub mod state;
pub mod types;
pub mod value;

// Re-export main types at crate root
pub use condition::{Condition, ResolvedConfig, resolve};
pub use context::{ApplyContext, CancelToken, NoProgress, ProgressCallback};
pub use diff::{DiffSummary, hash_value, input_hash};
pub use error::{ConfigError, Error, ErrorCategory, ProviderError, Result};
pub use executor::apply;
pub use graph::{DependencyGraph, EdgeKind};
pub use planner::{Plan, PlanOptions, plan, plan_destroy};
pub use provider::{Provider, ProviderObject, ProviderRegistry};
pub use resource::{Configuration, LifecyclePolicy, ResourceSpec};
pub use retry::RetryPolicy;
pub use state::{FileStateStore, MemoryStateStore, STATE_FORMAT_VERSION, StateDocument, StateEntry, StateMap, StateStore};
pub use types::{
    Action, ActionKind, ActionReport, ActionStatus, ApplyReport, AttributeChange, ExecuteOptions,
    ExecuteSummary, Outcome, RunStatus,
};
pub use value::{Attributes, Reference, Value};

/// Validate a configuration without touching state or providers.
///
/// Runs condition resolution and graph construction, and checks every
/// surviving resource type is registered.
pub fn validate(config: &Configuration, providers: &ProviderRegistry) -> Result<DependencyGraph> {
    let resolved = resolve(config)?;
    planner::check_types(&resolved, providers)?;
    Ok(DependencyGraph::build(&resolved)?)
}

/// Delete everything recorded in the store, dependents first
pub fn destroy(
    config: &Configuration,
    store: &dyn StateStore,
    providers: &ProviderRegistry,
    plan_options: &PlanOptions,
    options: &ExecuteOptions,
    progress: &dyn ProgressCallback,
) -> Result<ApplyReport> {
    let plan = plan_destroy(config, &store.load()?, plan_options)?;
    apply(plan, store, providers, options, progress)
}
