//! Command implementations

pub mod apply;
pub mod graph;
pub mod plan;
pub mod state;
pub mod validate;

use anyhow::{Context as AnyhowContext, Result};
use declarative::{Configuration, FileStateStore, ProviderRegistry};
use std::path::PathBuf;
use std::sync::Arc;

use crate::Context;
use crate::config;
use crate::paths;
use crate::provider::{self, SimCloud};

/// Load the configuration named on the command line
pub fn load_config(ctx: &Context) -> Result<(PathBuf, Configuration)> {
    let cwd = std::env::current_dir().context("Could not determine working directory")?;
    let path = paths::config_file(ctx.config.as_deref(), &cwd)?;
    let config = config::load(&path, &ctx.var_files, &ctx.vars)?;
    Ok((path, config))
}

/// Everything a state-touching command needs
pub struct Session {
    pub config_path: PathBuf,
    pub config: Configuration,
    pub store: FileStateStore,
    pub providers: ProviderRegistry,
}

impl Session {
    pub fn open(ctx: &Context) -> Result<Self> {
        let (config_path, config) = load_config(ctx)?;

        let state_path = paths::state_file(ctx.state.as_deref())?;
        let store = FileStateStore::open(&state_path)
            .with_context(|| format!("Could not open state {}", state_path.display()))?;

        let cloud = SimCloud::open(paths::cloud_file(&state_path))?.with_env()?;
        let cloud = Arc::new(cloud);
        let providers = provider::registry(&cloud);

        log::debug!(
            "Session: config {}, state {} (serial {}), cloud {}",
            config_path.display(),
            state_path.display(),
            store.serial(),
            cloud.path().display()
        );

        Ok(Self {
            config_path,
            config,
            store,
            providers,
        })
    }
}

/// Providers for commands that never call them
pub fn offline_providers(ctx: &Context) -> Result<ProviderRegistry> {
    let state_path = paths::state_file(ctx.state.as_deref())?;
    let cloud = Arc::new(SimCloud::open(paths::cloud_file(&state_path))?);
    Ok(provider::registry(&cloud))
}
