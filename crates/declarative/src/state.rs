//! State store: the last-known set of resource instances
//!
//! The store is the only mutable structure shared between executor workers.
//! Writes are serialized per logical name, so independent branches of the
//! graph can commit concurrently without a single global lock around the
//! read-modify-write of an entry.

use crate::error::{Error, Result};
use crate::value::Attributes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// Current persisted state format
pub const STATE_FORMAT_VERSION: u32 = 1;

// ============================================================================
// State Structures
// ============================================================================

/// Last-known facts about one resource instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    /// Logical name
    pub name: String,

    /// Resource type
    pub resource_type: String,

    /// Provider-assigned identifier
    pub id: String,

    /// Output attributes returned by the provider (always includes `id`)
    #[serde(default)]
    pub outputs: Attributes,

    /// Resolved inputs as last applied
    #[serde(default)]
    pub inputs: Attributes,

    /// Hash of `inputs`
    pub input_hash: String,

    /// Dependencies at apply time, used to order deletes once the
    /// resource has left the configuration
    #[serde(default)]
    pub dependencies: BTreeSet<String>,

    /// Provider ids of replaced instances that still need deleting
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deposed: Vec<String>,

    /// When this entry was last written
    pub updated_at: DateTime<Utc>,
}

/// State entries by logical name
pub type StateMap = BTreeMap<String, StateEntry>;

/// The persisted state document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDocument {
    pub format_version: u32,

    /// Incremented on every write
    pub serial: u64,

    #[serde(default)]
    pub resources: StateMap,
}

impl Default for StateDocument {
    fn default() -> Self {
        Self {
            format_version: STATE_FORMAT_VERSION,
            serial: 0,
            resources: StateMap::new(),
        }
    }
}

impl StateDocument {
    /// Parse a document, checking its version before its shape
    pub fn parse(content: &str, location: &str) -> Result<Self> {
        let corrupt = |message: String| Error::StateCorruption {
            location: location.to_string(),
            message,
        };

        let raw: serde_json::Value =
            serde_json::from_str(content).map_err(|e| corrupt(format!("not valid JSON: {e}")))?;

        let version = raw
            .get("format_version")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| corrupt("missing format_version".to_string()))?;
        if version != u64::from(STATE_FORMAT_VERSION) {
            return Err(corrupt(format!(
                "format_version {version} is not supported (expected {STATE_FORMAT_VERSION})"
            )));
        }

        let document: Self =
            serde_json::from_value(raw).map_err(|e| corrupt(format!("invalid document: {e}")))?;

        for (key, entry) in &document.resources {
            if key != &entry.name {
                return Err(corrupt(format!(
                    "entry stored under {key} is named {}",
                    entry.name
                )));
            }
        }

        Ok(document)
    }
}

// ============================================================================
// Store Trait
// ============================================================================

/// Durable storage for state entries
pub trait StateStore: Send + Sync {
    /// All entries
    fn load(&self) -> Result<StateMap>;

    /// One entry
    fn get(&self, name: &str) -> Result<Option<StateEntry>>;

    /// Atomically replace the entry for `name` with `f(current)`.
    ///
    /// Calls for the same name are serialized; the change is durable when
    /// this returns. Returning `None` removes the entry.
    fn modify(
        &self,
        name: &str,
        f: &mut dyn FnMut(Option<StateEntry>) -> Option<StateEntry>,
    ) -> Result<()>;

    /// Upsert a single entry
    fn commit(&self, entry: StateEntry) -> Result<()> {
        let name = entry.name.clone();
        let mut entry = Some(entry);
        self.modify(&name, &mut |_| entry.take())
    }

    /// Remove an entry after a successful delete
    fn remove(&self, name: &str) -> Result<()> {
        self.modify(name, &mut |_| None)
    }
}

/// Lock a mutex, recovering the data if a worker panicked while holding it
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// One lock per logical name
#[derive(Debug, Default)]
struct EntryLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl EntryLocks {
    fn for_name(&self, name: &str) -> Arc<Mutex<()>> {
        Arc::clone(lock(&self.locks).entry(name.to_string()).or_default())
    }
}

// ============================================================================
// In-memory Store
// ============================================================================

/// Non-durable store for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: RwLock<StateMap>,
    locks: EntryLocks,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: StateMap) -> Self {
        Self {
            entries: RwLock::new(entries),
            locks: EntryLocks::default(),
        }
    }

    /// Copy of the current entries
    pub fn snapshot(&self) -> StateMap {
        match self.entries.read() {
            Ok(entries) => entries.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<StateMap> {
        Ok(self.snapshot())
    }

    fn get(&self, name: &str) -> Result<Option<StateEntry>> {
        let entries = match self.entries.read() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(entries.get(name).cloned())
    }

    fn modify(
        &self,
        name: &str,
        f: &mut dyn FnMut(Option<StateEntry>) -> Option<StateEntry>,
    ) -> Result<()> {
        let entry_lock = self.locks.for_name(name);
        let _guard = lock(&entry_lock);

        let current = self.get(name)?;
        let next = f(current);

        let mut entries = match self.entries.write() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        match next {
            Some(entry) => {
                entries.insert(name.to_string(), entry);
            }
            None => {
                entries.remove(name);
            }
        }
        Ok(())
    }
}

// ============================================================================
// File Store
// ============================================================================

/// State persisted as a single versioned JSON document.
///
/// Every modification rewrites the document through a temp file and a
/// rename. Snapshots carry the document serial; a writer whose snapshot is
/// older than one already on disk skips the write, since the newer snapshot
/// already contains its change.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    document: Mutex<StateDocument>,
    persisted_serial: Mutex<u64>,
    locks: EntryLocks,
}

impl FileStateStore {
    /// Open a state file, starting empty if it does not exist yet
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let document = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|source| Error::StateIo {
                path: path.clone(),
                source,
            })?;
            let document = StateDocument::parse(&content, &path.display().to_string())?;
            log::debug!(
                "Loaded state from {} (serial {}, {} resources)",
                path.display(),
                document.serial,
                document.resources.len()
            );
            document
        } else {
            log::debug!("State file {} does not exist, starting empty", path.display());
            StateDocument::default()
        };

        Ok(Self {
            path,
            persisted_serial: Mutex::new(document.serial),
            document: Mutex::new(document),
            locks: EntryLocks::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current serial
    pub fn serial(&self) -> u64 {
        lock(&self.document).serial
    }

    fn persist(&self, snapshot: &StateDocument) -> Result<()> {
        let mut persisted = lock(&self.persisted_serial);
        if snapshot.serial <= *persisted {
            return Ok(());
        }

        let io_err = |source| Error::StateIo {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let content = serde_json::to_string_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp).map_err(io_err)?;
            file.write_all(content.as_bytes()).map_err(io_err)?;
            file.sync_all().map_err(io_err)?;
        }
        fs::rename(&tmp, &self.path).map_err(io_err)?;

        *persisted = snapshot.serial;
        log::trace!("Persisted state serial {}", snapshot.serial);
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<StateMap> {
        Ok(lock(&self.document).resources.clone())
    }

    fn get(&self, name: &str) -> Result<Option<StateEntry>> {
        Ok(lock(&self.document).resources.get(name).cloned())
    }

    fn modify(
        &self,
        name: &str,
        f: &mut dyn FnMut(Option<StateEntry>) -> Option<StateEntry>,
    ) -> Result<()> {
        let entry_lock = self.locks.for_name(name);
        let _guard = lock(&entry_lock);

        let current = self.get(name)?;
        let next = f(current);

        let snapshot = {
            let mut document = lock(&self.document);
            match next {
                Some(entry) => {
                    document.resources.insert(name.to_string(), entry);
                }
                None => {
                    document.resources.remove(name);
                }
            }
            document.serial += 1;
            document.clone()
        };

        self.persist(&snapshot)
    }
}
