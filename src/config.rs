//! Configuration documents and parameter overrides

use anyhow::{Context, Result, bail};
use declarative::{Attributes, Configuration};
use serde::de::DeserializeOwned;
use serde_json::Value as Json;
use std::fs;
use std::path::Path;

/// Document formats, chosen by file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Toml,
    Json,
    Yaml,
}

impl DocumentFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Ok(Self::Toml),
            Some("json") => Ok(Self::Json),
            Some("yaml" | "yml") => Ok(Self::Yaml),
            _ => bail!(
                "Unsupported document format: {} (expected .toml, .json, .yaml or .yml)",
                path.display()
            ),
        }
    }

    pub fn parse<T: DeserializeOwned>(self, content: &str) -> Result<T> {
        match self {
            Self::Toml => toml::from_str(content).context("Invalid TOML"),
            Self::Json => serde_json::from_str(content).context("Invalid JSON"),
            Self::Yaml => serde_yaml::from_str(content).context("Invalid YAML"),
        }
    }
}

fn read_document<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let format = DocumentFormat::from_path(path)?;
    let content =
        fs::read_to_string(path).with_context(|| format!("Could not read {}", path.display()))?;
    format
        .parse(&content)
        .with_context(|| format!("Could not parse {}", path.display()))
}

/// Load a configuration and layer parameter overrides on top.
///
/// Var files apply in order, then `--var` flags.
pub fn load(path: &Path, var_files: &[impl AsRef<Path>], vars: &[String]) -> Result<Configuration> {
    let mut config: Configuration = read_document(path)?;
    log::info!(
        "Loaded {} resources and {} parameters from {}",
        config.resources.len(),
        config.parameters.len(),
        path.display()
    );

    for file in var_files {
        let overrides = load_var_file(file.as_ref())?;
        log::debug!("Applying {} overrides from {}", overrides.len(), file.as_ref().display());
        config.override_parameters(overrides);
    }

    let mut overrides = Attributes::new();
    for var in vars {
        let (key, value) = parse_var(var)?;
        overrides.insert(key, value);
    }
    config.override_parameters(overrides);

    Ok(config)
}

/// A var file is either a bare table of parameters or a document with a
/// `parameters` table
fn load_var_file(path: &Path) -> Result<Attributes> {
    let mut doc: Attributes = read_document(path)?;
    match doc.remove("parameters") {
        Some(Json::Object(params)) if doc.is_empty() => Ok(params.into_iter().collect()),
        Some(_) if doc.is_empty() => bail!("{}: `parameters` must be a table", path.display()),
        Some(params) => {
            doc.insert("parameters".into(), params);
            Ok(doc)
        }
        None => Ok(doc),
    }
}

/// Parse `key=value`.
///
/// The value is read as JSON when it parses (`true`, `3`, `["a"]`), and as
/// a plain string otherwise.
pub fn parse_var(raw: &str) -> Result<(String, Json)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("Invalid --var '{raw}' (expected key=value)"))?;
    let key = key.trim();
    if key.is_empty() {
        bail!("Invalid --var '{raw}' (empty key)");
    }

    let value = serde_json::from_str(value).unwrap_or_else(|_| Json::String(value.to_string()));
    Ok((key.to_string(), value))
}
