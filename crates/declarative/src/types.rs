//! Core types for plans and execution results

use crate::context::CancelToken;
use crate::retry::RetryPolicy;
use crate::value::Attributes;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// What an action does to a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Create,
    Update,
    Delete,
    NoOp,
}

impl ActionKind {
    /// Diff symbol used when rendering plans
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Delete => "-",
            Self::NoOp => " ",
        }
    }

    /// Whether the action calls the provider
    pub fn is_change(&self) -> bool {
        !matches!(self, Self::NoOp)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoOp => "no-op",
        })
    }
}

/// One attribute that differs between state and configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeChange {
    pub name: String,
    /// Last applied value; `None` when the attribute is new
    pub before: Option<Json>,
    /// Desired value; `None` when unknown until apply or removed
    pub after: Option<Json>,
    /// The provider cannot change this attribute in place
    #[serde(default)]
    pub forces_replacement: bool,
}

/// A planned operation on one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Logical name
    pub name: String,
    /// Resource type
    pub resource_type: String,
    pub kind: ActionKind,
    /// Why the planner chose this action
    pub reason: String,
    /// For deletes of replaced instances: the provider id to delete
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deposed: Option<String>,
    /// Part of a replacement pair
    #[serde(default)]
    pub replacement: bool,
    /// Attribute-level changes (creates, updates and replacements)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<AttributeChange>,
    /// Inputs an update sends at their last applied value instead of the configured one
    #[serde(default, skip_serializing_if = "Attributes::is_empty")]
    pub pinned: Attributes,
}

impl Action {
    pub fn new(
        name: impl Into<String>,
        resource_type: impl Into<String>,
        kind: ActionKind,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            resource_type: resource_type.into(),
            kind,
            reason: reason.into(),
            deposed: None,
            replacement: false,
            changes: Vec::new(),
            pinned: Attributes::new(),
        }
    }

    /// Unique key within a plan
    pub fn key(&self) -> String {
        match &self.deposed {
            Some(id) => format!("{} {} (deposed {id})", self.kind, self.name),
            None => format!("{} {}", self.kind, self.name),
        }
    }

    /// `type.name` address
    pub fn address(&self) -> String {
        format!("{}.{}", self.resource_type, self.name)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.symbol(), self.address())?;
        if let Some(id) = &self.deposed {
            write!(f, " (deposed {id})")?;
        } else if self.replacement {
            f.write_str(" (replace)")?;
        }
        Ok(())
    }
}

/// Executor state of an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    Skipped,
}

/// Final result of an action, as reported to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Created,
    Updated,
    Deleted,
    Unchanged,
    Failed { reason: String },
    Skipped { blocked_by: String },
    Cancelled,
}

impl Outcome {
    /// Check if the outcome represents a change
    pub fn is_change(&self) -> bool {
        matches!(self, Self::Created | Self::Updated | Self::Deleted)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Updated => f.write_str("updated"),
            Self::Deleted => f.write_str("deleted"),
            Self::Unchanged => f.write_str("unchanged"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
            Self::Skipped { blocked_by } => write!(f, "skipped: blocked by {blocked_by}"),
            Self::Cancelled => f.write_str("skipped: cancelled"),
        }
    }
}

/// Final report for one action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionReport {
    pub action: Action,
    pub status: ActionStatus,
    pub outcome: Outcome,
    /// Provider calls made, including retries
    pub attempts: u32,
}

/// Summary of execution results
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteSummary {
    pub created: usize,
    pub modified: usize,
    pub removed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub no_change: usize,
}

impl ExecuteSummary {
    /// Total number of actual changes made
    pub fn total_changes(&self) -> usize {
        self.created + self.modified + self.removed
    }

    /// Check if execution was fully successful (nothing failed or skipped)
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.skipped == 0
    }

    /// Total number of actions processed
    pub fn total(&self) -> usize {
        self.created + self.modified + self.removed + self.skipped + self.failed + self.no_change
    }

    /// Add an outcome to the summary
    pub fn add_outcome(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Unchanged => self.no_change += 1,
            Outcome::Created => self.created += 1,
            Outcome::Updated => self.modified += 1,
            Outcome::Deleted => self.removed += 1,
            Outcome::Failed { .. } => self.failed += 1,
            Outcome::Skipped { .. } | Outcome::Cancelled => self.skipped += 1,
        }
    }
}

/// How a run ended, mapped to the process exit status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Converged, nothing changed
    NoChanges,
    /// Converged with changes
    Changed,
    /// At least one action failed, was skipped or cancelled
    PartialFailure,
}

impl RunStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::NoChanges => 0,
            Self::PartialFailure => 1,
            Self::Changed => 2,
        }
    }
}

/// Result of applying a plan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplyReport {
    /// One report per planned action, in plan order
    pub actions: Vec<ActionReport>,
    /// Cancellation was requested during the run
    pub cancelled: bool,
}

impl ApplyReport {
    pub fn summary(&self) -> ExecuteSummary {
        let mut summary = ExecuteSummary::default();
        for report in &self.actions {
            summary.add_outcome(&report.outcome);
        }
        summary
    }

    /// Every action succeeded
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.actions.iter().all(|r| r.status == ActionStatus::Succeeded)
    }

    pub fn has_changes(&self) -> bool {
        self.actions.iter().any(|r| r.outcome.is_change())
    }

    pub fn run_status(&self) -> RunStatus {
        if !self.is_success() {
            RunStatus::PartialFailure
        } else if self.has_changes() {
            RunStatus::Changed
        } else {
            RunStatus::NoChanges
        }
    }

    /// Report for the main (non-deposed) action of a kind on a resource
    pub fn find(&self, name: &str, kind: ActionKind) -> Option<&ActionReport> {
        self.actions
            .iter()
            .find(|r| r.action.name == name && r.action.kind == kind && r.action.deposed.is_none())
    }

    /// Per-resource outcome text.
    ///
    /// A create and a delete on the same name are reported as `replaced`.
    pub fn resource_outcomes(&self) -> BTreeMap<String, String> {
        let mut grouped: BTreeMap<&str, Vec<&ActionReport>> = BTreeMap::new();
        for report in &self.actions {
            grouped.entry(report.action.name.as_str()).or_default().push(report);
        }

        grouped
            .into_iter()
            .map(|(name, reports)| {
                let unfinished = reports
                    .iter()
                    .find(|r| r.status != ActionStatus::Succeeded);
                let replaced = reports
                    .iter()
                    .any(|r| r.action.replacement && r.outcome == Outcome::Created);

                let text = if let Some(bad) = unfinished {
                    bad.outcome.to_string()
                } else if replaced {
                    "replaced".to_string()
                } else if let Some(main) = reports.iter().find(|r| r.action.deposed.is_none()) {
                    main.outcome.to_string()
                } else {
                    Outcome::Deleted.to_string()
                };
                (name.to_string(), text)
            })
            .collect()
    }
}

/// Options for execution
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Maximum number of provider calls in flight
    pub parallelism: usize,
    /// Retry policy for transient provider errors
    pub retry: RetryPolicy,
    /// Deadline for each provider attempt
    pub action_timeout: Option<Duration>,
    /// Cancellation flag
    pub cancel: CancelToken,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            parallelism: 4,
            retry: RetryPolicy::default(),
            action_timeout: None,
            cancel: CancelToken::new(),
        }
    }
}
