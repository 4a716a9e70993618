//! Provider interface
//!
//! A [`Provider`] performs CRUD for one resource type against some backing
//! system. The engine never talks to a cloud directly; it only sees
//! provider ids, output attributes and classified [`ProviderError`]s.

use crate::context::ApplyContext;
use crate::error::ProviderError;
use crate::value::Attributes;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A freshly created object
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderObject {
    /// Provider-assigned identifier
    pub id: String,
    /// Computed output attributes
    pub outputs: Attributes,
}

/// CRUD operations for one resource type
///
/// Implementations are called from worker threads and must be thread-safe.
pub trait Provider: Send + Sync {
    /// Resource type this provider handles (e.g., "aws_vpc")
    fn resource_type(&self) -> &str;

    /// Create an object from resolved inputs
    fn create(&self, inputs: &Attributes, ctx: &ApplyContext) -> Result<ProviderObject, ProviderError>;

    /// Read current outputs; `NotFound` if the object no longer exists
    fn read(&self, id: &str, ctx: &ApplyContext) -> Result<Attributes, ProviderError>;

    /// Update an object in place, returning new outputs
    fn update(&self, id: &str, inputs: &Attributes, ctx: &ApplyContext) -> Result<Attributes, ProviderError>;

    /// Delete an object
    fn delete(&self, id: &str, ctx: &ApplyContext) -> Result<(), ProviderError>;

    /// Whether a change to `attribute` requires replacing the object
    fn force_new(&self, _attribute: &str) -> bool {
        false
    }

    /// Whether an in-place update can change the computed output `attribute`
    fn recomputed_on_update(&self, _attribute: &str) -> bool {
        true
    }
}

/// Providers by resource type
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its resource type, replacing any previous one
    pub fn register<P: Provider + 'static>(&mut self, provider: P) {
        self.register_arc(Arc::new(provider));
    }

    pub fn register_arc(&mut self, provider: Arc<dyn Provider>) {
        self.providers
            .insert(provider.resource_type().to_string(), provider);
    }

    pub fn get(&self, resource_type: &str) -> Option<&Arc<dyn Provider>> {
        self.providers.get(resource_type)
    }

    pub fn contains(&self, resource_type: &str) -> bool {
        self.providers.contains_key(resource_type)
    }

    /// Registered resource types, sorted
    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("types", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}
