//! Apply context, cancellation and progress callbacks
//!
//! These types let callers observe and interrupt execution without the
//! engine depending on any particular UI.

use crate::error::ProviderError;
use crate::types::{Action, ActionReport};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Cooperative cancellation flag shared between the caller and workers
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; in-flight actions finish, nothing new starts
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Context passed to every provider call
#[derive(Debug, Clone, Copy)]
pub struct ApplyContext<'a> {
    /// Logical name of the resource being acted on
    pub resource: &'a str,
    /// Attempt number, starting at 1
    pub attempt: u32,
    /// Deadline for this attempt, if the caller set a timeout
    pub deadline: Option<Instant>,
    /// Cancellation flag; long-running providers may poll it
    pub cancel: &'a CancelToken,
}

impl<'a> ApplyContext<'a> {
    /// Context for a call with no deadline
    pub fn new(resource: &'a str, cancel: &'a CancelToken) -> Self {
        Self {
            resource,
            attempt: 1,
            deadline: None,
            cancel,
        }
    }

    /// Time left before the deadline, if one is set
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Whether the deadline has passed
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Progress callback for execution
///
/// Methods are called from worker threads, so implementations must be
/// thread-safe. All methods default to doing nothing.
pub trait ProgressCallback: Send + Sync {
    /// Called once before any action starts
    fn on_plan_start(&self, _total: usize) {}

    /// Called when an action is dispatched to a worker
    fn on_action_start(&self, _action: &Action) {}

    /// Called before sleeping ahead of a retry
    fn on_retry(&self, _action: &Action, _attempt: u32, _error: &ProviderError, _delay: Duration) {}

    /// Called when an action reaches a terminal status
    fn on_action_complete(&self, _report: &ActionReport) {}
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {}
