//! Simulated AWS provider family.
//!
//! Objects live in a JSON document next to the state file, so plans and
//! applies behave across invocations as they would against a real account.
//! Set `CONVERGE_SIM_FAIL=cluster:2,addon` to make the next N calls for a
//! logical resource fail with a throttling error, and
//! `CONVERGE_SIM_LATENCY_MS` to slow every call down.

pub mod kinds;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use declarative::{ApplyContext, Attributes, Provider, ProviderError, ProviderObject, ProviderRegistry};
use kinds::Kind;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub const ENV_SIM_FAIL: &str = "CONVERGE_SIM_FAIL";
pub const ENV_SIM_LATENCY: &str = "CONVERGE_SIM_LATENCY_MS";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudObject {
    pub resource_type: String,
    pub attributes: Attributes,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CloudDocument {
    #[serde(default)]
    next_serial: u64,
    #[serde(default)]
    objects: BTreeMap<String, CloudObject>,
}

/// The simulated account
#[derive(Debug)]
pub struct SimCloud {
    path: PathBuf,
    document: Mutex<CloudDocument>,
    faults: Mutex<HashMap<String, u32>>,
    latency: Duration,
}

impl SimCloud {
    /// Open the cloud document, starting empty if it does not exist
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let document = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Could not read {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Invalid simulated cloud document: {}", path.display()))?
        } else {
            CloudDocument::default()
        };

        Ok(Self {
            path,
            document: Mutex::new(document),
            faults: Mutex::new(HashMap::new()),
            latency: Duration::ZERO,
        })
    }

    /// Apply `CONVERGE_SIM_FAIL` and `CONVERGE_SIM_LATENCY_MS`
    pub fn with_env(self) -> Result<Self> {
        let mut cloud = self;
        if let Ok(spec) = std::env::var(ENV_SIM_FAIL) {
            cloud = cloud.with_faults(parse_faults(&spec)?);
        }
        if let Ok(ms) = std::env::var(ENV_SIM_LATENCY) {
            let ms: u64 = ms
                .trim()
                .parse()
                .with_context(|| format!("Invalid {ENV_SIM_LATENCY}: {ms}"))?;
            cloud.latency = Duration::from_millis(ms);
        }
        Ok(cloud)
    }

    pub fn with_faults(self, faults: HashMap<String, u32>) -> Self {
        if !faults.is_empty() {
            log::info!("Simulated faults armed for {} resources", faults.len());
        }
        Self {
            faults: Mutex::new(faults),
            ..self
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Live objects by id
    pub fn objects(&self) -> BTreeMap<String, CloudObject> {
        self.lock().objects.clone()
    }

    fn lock(&self) -> MutexGuard<'_, CloudDocument> {
        self.document
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn persist(&self, document: &CloudDocument) -> Result<(), ProviderError> {
        let io = |e: std::io::Error| ProviderError::Other(format!("simulated cloud {}: {e}", self.path.display()));

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(io)?;
        }
        let content =
            serde_json::to_string_pretty(document).map_err(|e| ProviderError::Other(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp).map_err(io)?;
            file.write_all(content.as_bytes()).map_err(io)?;
        }
        fs::rename(&tmp, &self.path).map_err(io)
    }

    /// Wait out the configured latency, then consume an armed fault
    fn call(&self, ctx: &ApplyContext) -> Result<(), ProviderError> {
        let started = Instant::now();
        while started.elapsed() < self.latency {
            if ctx.is_expired() {
                return Err(ProviderError::Timeout {
                    message: format!("{} still pending", ctx.resource),
                });
            }
            std::thread::sleep(Duration::from_millis(10).min(self.latency));
        }

        let mut faults = self.faults.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(remaining) = faults.get_mut(ctx.resource)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(ProviderError::Throttled {
                message: format!("Rate exceeded (simulated, {remaining} left)"),
            });
        }
        Ok(())
    }
}

/// Parse `name[:count],...`; a bare name fails once
pub fn parse_faults(spec: &str) -> Result<HashMap<String, u32>> {
    spec.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((name, count)) => {
                let count = count
                    .parse()
                    .with_context(|| format!("Invalid fault count in {ENV_SIM_FAIL}: {entry}"))?;
                Ok((name.to_string(), count))
            }
            None => Ok((entry.to_string(), 1)),
        })
        .collect()
}

/// Provider for one simulated kind
pub struct SimProvider {
    kind: &'static Kind,
    cloud: Arc<SimCloud>,
}

impl SimProvider {
    fn check_required(&self, inputs: &Attributes) -> Result<(), ProviderError> {
        let missing: Vec<_> = self
            .kind
            .required
            .iter()
            .filter(|name| inputs.get(**name).is_none_or(Json::is_null))
            .copied()
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ProviderError::InvalidInput {
                message: format!("{} requires {}", self.kind.resource_type, missing.join(", ")),
            })
        }
    }

    fn check_unique(&self, document: &CloudDocument, inputs: &Attributes, except: Option<&str>) -> Result<(), ProviderError> {
        let Some(key) = self.kind.unique else {
            return Ok(());
        };
        let Some(value) = inputs.get(key) else {
            return Ok(());
        };

        let taken = document.objects.iter().any(|(id, object)| {
            Some(id.as_str()) != except
                && object.resource_type == self.kind.resource_type
                && object.attributes.get(key) == Some(value)
        });
        if taken {
            return Err(ProviderError::AlreadyExists {
                message: format!("{} with {key} {value} already exists", self.kind.resource_type),
            });
        }
        Ok(())
    }

    fn outputs(&self, id: &str, inputs: &Attributes, previous: Option<&Attributes>) -> Attributes {
        let mut outputs = inputs.clone();
        let name = inputs.get("name").and_then(Json::as_str);
        for attribute in self.kind.computed {
            if inputs.contains_key(*attribute) {
                continue;
            }
            let prior = previous.and_then(|p| p.get(*attribute));
            let value = match prior {
                Some(value) if !self.recomputed_on_update(attribute) => value.clone(),
                _ => kinds::computed_value(self.kind, attribute, id, name, prior),
            };
            outputs.insert((*attribute).to_string(), value);
        }
        outputs.insert("id".into(), Json::String(id.to_string()));
        outputs
    }
}

impl Provider for SimProvider {
    fn resource_type(&self) -> &str {
        self.kind.resource_type
    }

    fn create(&self, inputs: &Attributes, ctx: &ApplyContext) -> Result<ProviderObject, ProviderError> {
        self.cloud.call(ctx)?;
        self.check_required(inputs)?;

        let mut document = self.cloud.lock();
        self.check_unique(&document, inputs, None)?;

        document.next_serial += 1;
        let seed = format!("{}/{}/{}", self.kind.resource_type, ctx.resource, document.next_serial);
        let id = format!("{}-{}", self.kind.id_prefix, &blake3::hash(seed.as_bytes()).to_hex()[..17]);

        let outputs = self.outputs(&id, inputs, None);
        document.objects.insert(
            id.clone(),
            CloudObject {
                resource_type: self.kind.resource_type.to_string(),
                attributes: outputs.clone(),
                created_at: Utc::now(),
            },
        );
        self.cloud.persist(&document)?;

        log::debug!("sim: created {} {id}", self.kind.resource_type);
        Ok(ProviderObject { id, outputs })
    }

    fn read(&self, id: &str, ctx: &ApplyContext) -> Result<Attributes, ProviderError> {
        self.cloud.call(ctx)?;
        self.cloud
            .lock()
            .objects
            .get(id)
            .filter(|o| o.resource_type == self.kind.resource_type)
            .map(|o| o.attributes.clone())
            .ok_or_else(|| ProviderError::NotFound { id: id.to_string() })
    }

    fn update(&self, id: &str, inputs: &Attributes, ctx: &ApplyContext) -> Result<Attributes, ProviderError> {
        self.cloud.call(ctx)?;
        self.check_required(inputs)?;

        let mut document = self.cloud.lock();
        self.check_unique(&document, inputs, Some(id))?;

        let Some(object) = document.objects.get(id) else {
            return Err(ProviderError::NotFound { id: id.to_string() });
        };
        for attribute in self.kind.force_new {
            if object.attributes.get(*attribute) != inputs.get(*attribute) {
                return Err(ProviderError::InvalidInput {
                    message: format!("{attribute} cannot be changed in place"),
                });
            }
        }

        let outputs = self.outputs(id, inputs, Some(&object.attributes));
        if let Some(object) = document.objects.get_mut(id) {
            object.attributes = outputs.clone();
        }
        self.cloud.persist(&document)?;

        log::debug!("sim: updated {} {id}", self.kind.resource_type);
        Ok(outputs)
    }

    fn delete(&self, id: &str, ctx: &ApplyContext) -> Result<(), ProviderError> {
        self.cloud.call(ctx)?;

        let mut document = self.cloud.lock();
        if document.objects.remove(id).is_none() {
            return Err(ProviderError::NotFound { id: id.to_string() });
        }
        self.cloud.persist(&document)?;

        log::debug!("sim: deleted {} {id}", self.kind.resource_type);
        Ok(())
    }

    fn force_new(&self, attribute: &str) -> bool {
        self.kind.force_new.contains(&attribute)
    }

    fn recomputed_on_update(&self, attribute: &str) -> bool {
        attribute == "revision"
    }
}

/// Register every simulated kind against one cloud
pub fn registry(cloud: &Arc<SimCloud>) -> ProviderRegistry {
    let mut providers = ProviderRegistry::new();
    for kind in kinds::KINDS {
        providers.register(SimProvider {
            kind,
            cloud: Arc::clone(cloud),
        });
    }
    providers
}
