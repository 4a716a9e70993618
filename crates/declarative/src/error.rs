//! Error types for the convergence engine.
//!
//! Errors fall into four groups, each with its own propagation policy:
//! - [`ConfigError`]: problems with the declared configuration. Always raised
//!   before any provider call and never retried.
//! - [`ProviderError`]: failures reported by a provider. Categorized so the
//!   executor can tell transient failures (retried) from fatal ones.
//! - State corruption: the persisted state document failed its version or
//!   shape check. Planning refuses to continue.
//! - Everything else (I/O, executor setup) surfaces as [`Error`].

use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors detected before planning.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Two resources share a logical name
    #[error("duplicate resource name: {name}")]
    DuplicateName {
        /// The repeated logical name
        name: String,
    },

    /// No provider is registered for a resource type
    #[error("resource {resource} has unknown type {resource_type}")]
    UnknownResourceType {
        /// Logical name of the resource
        resource: String,
        /// The unregistered type
        resource_type: String,
    },

    /// A reference or depends_on entry names a resource that was never declared
    #[error("resource {resource} references undeclared resource {target}")]
    DanglingReference {
        /// The referencing resource
        resource: String,
        /// The missing target
        target: String,
    },

    /// A reference or depends_on entry names a resource pruned by its condition
    #[error("resource {resource} references {target}, which is absent because its condition is false")]
    ConditionallyAbsent {
        /// The referencing resource
        resource: String,
        /// The pruned target
        target: String,
    },

    /// A resource references or depends on itself
    #[error("resource {resource} depends on itself")]
    SelfReference {
        /// The offending resource
        resource: String,
    },

    /// The dependency graph contains a cycle
    #[error("dependency cycle: {}", .cycle.join(" -> "))]
    Cycle {
        /// The cycle path; the first name is repeated at the end
        cycle: Vec<String>,
    },

    /// A condition or `${var.*}` substitution names an undefined parameter
    #[error("resource {resource} uses undefined parameter {parameter}")]
    UndefinedParameter {
        /// The resource whose condition or inputs use the parameter
        resource: String,
        /// The undefined parameter
        parameter: String,
    },

    /// A condition expression could not be parsed or evaluated
    #[error("malformed condition on {resource}: {message}")]
    MalformedCondition {
        /// The resource carrying the condition
        resource: String,
        /// What went wrong
        message: String,
    },

    /// An input string embeds a reference in a form the engine cannot track
    #[error("invalid reference in {resource}.{attribute}: {message}")]
    InvalidReference {
        /// The resource carrying the input
        resource: String,
        /// The input attribute
        attribute: String,
        /// What went wrong
        message: String,
    },

    /// A `--target` names nothing in configuration or state
    #[error("target {target} matches no resource in configuration or state")]
    UnknownTarget {
        /// The unmatched target
        target: String,
    },

    /// Replacement and deletion ordering produced a cycle between actions
    #[error("conflicting action ordering between: {}", .actions.join(", "))]
    PlanCycle {
        /// The actions that could not be ordered
        actions: Vec<String>,
    },
}

/// Categories of provider errors for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The call did not finish in time
    Timeout,
    /// Rate limited by the provider
    Throttled,
    /// A just-created dependency is not visible yet (eventual consistency)
    NotFoundYet,
    /// The object does not exist
    NotFound,
    /// The caller lacks permission
    PermissionDenied,
    /// The provider rejected the inputs
    InvalidInput,
    /// An object with the same identity already exists
    AlreadyExists,
    /// Anything else
    Other,
}

impl ErrorCategory {
    /// Whether this category is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Throttled | Self::NotFoundYet)
    }

    /// Get a user-friendly description of this category.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Timeout => "Operation timed out",
            Self::Throttled => "Rate limited",
            Self::NotFoundYet => "Dependency not visible yet",
            Self::NotFound => "Object not found",
            Self::PermissionDenied => "Permission denied",
            Self::InvalidInput => "Invalid input",
            Self::AlreadyExists => "Already exists",
            Self::Other => "Unexpected error",
        }
    }
}

/// Errors reported by a provider call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The call timed out
    #[error("timed out: {message}")]
    Timeout {
        /// Details from the provider
        message: String,
    },

    /// The provider throttled the call
    #[error("throttled: {message}")]
    Throttled {
        /// Details from the provider
        message: String,
    },

    /// A referenced object is not visible yet
    #[error("not visible yet: {message}")]
    NotFoundYet {
        /// Details from the provider
        message: String,
    },

    /// The object does not exist
    #[error("not found: {id}")]
    NotFound {
        /// Provider identifier that was looked up
        id: String,
    },

    /// The caller lacks permission
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Details from the provider
        message: String,
    },

    /// The provider rejected the inputs
    #[error("invalid input: {message}")]
    InvalidInput {
        /// Details from the provider
        message: String,
    },

    /// An object with the same identity already exists
    #[error("already exists: {message}")]
    AlreadyExists {
        /// Details from the provider
        message: String,
    },

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Get the error category for retry logic.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Throttled { .. } => ErrorCategory::Throttled,
            Self::NotFoundYet { .. } => ErrorCategory::NotFoundYet,
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::PermissionDenied { .. } => ErrorCategory::PermissionDenied,
            Self::InvalidInput { .. } => ErrorCategory::InvalidInput,
            Self::AlreadyExists { .. } => ErrorCategory::AlreadyExists,
            Self::Other(_) => ErrorCategory::Other,
        }
    }

    /// Whether this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    /// Shorthand for an invalid-input rejection.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }
}

/// Top-level engine error.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration, raised before any provider call
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The state document failed its version or shape check
    #[error("state corruption in {location}: {message}")]
    StateCorruption {
        /// Where the document was loaded from
        location: String,
        /// What failed
        message: String,
    },

    /// Reading or writing the state document failed
    #[error("state I/O error on {}: {source}", .path.display())]
    StateIo {
        /// The state file
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Serializing the state document failed
    #[error("failed to encode state: {0}")]
    StateEncode(#[from] serde_json::Error),

    /// A provider call made during planning (refresh) failed
    #[error("provider error for {resource}: {source}")]
    Provider {
        /// Logical name of the resource being refreshed
        resource: String,
        /// Underlying provider error
        #[source]
        source: ProviderError,
    },

    /// The executor could not start
    #[error("executor error: {0}")]
    Executor(String),
}

impl Error {
    /// Whether this error is a configuration error.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Whether this error is a state corruption error.
    pub fn is_state_corruption(&self) -> bool {
        matches!(self, Self::StateCorruption { .. })
    }

    /// The configuration error, if this is one.
    pub fn as_config(&self) -> Option<&ConfigError> {
        match self {
            Self::Config(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
