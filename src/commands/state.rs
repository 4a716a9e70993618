use anyhow::{Result, bail};
use chrono::Local;
use colored::Colorize;
use declarative::{FileStateStore, RunStatus, StateEntry, StateStore};

use crate::Context;
use crate::cli::StateCommand;
use crate::paths;
use crate::provider::SimCloud;
use crate::ui;

pub fn run(ctx: &Context, cmd: &StateCommand) -> Result<RunStatus> {
    let path = paths::state_file(ctx.state.as_deref())?;
    let store = FileStateStore::open(&path)?;

    match cmd {
        StateCommand::List => list(ctx, &store, &SimCloud::open(paths::cloud_file(&path))?),
        StateCommand::Show { name } => show(&store, name),
    }
}

/// Recorded resources; ids the cloud no longer has are flagged
fn list(ctx: &Context, store: &FileStateStore, cloud: &SimCloud) -> Result<RunStatus> {
    let state = store.load()?;
    if state.is_empty() {
        if !ctx.quiet {
            ui::info(&format!("No resources recorded in {}", store.path().display()));
        }
        return Ok(RunStatus::NoChanges);
    }

    let live = cloud.objects();
    let width = state.values().map(|e| address(e).len()).max().unwrap_or(0);
    for entry in state.values() {
        let deposed = if entry.deposed.is_empty() {
            String::new()
        } else {
            format!(" (+{} deposed)", entry.deposed.len()).yellow().to_string()
        };
        let missing = if live.contains_key(&entry.id) {
            String::new()
        } else {
            " (missing, run plan --refresh)".red().to_string()
        };
        println!("{:<width$}  {}{deposed}{missing}", address(entry), entry.id.dimmed());
    }
    Ok(RunStatus::NoChanges)
}

fn show(store: &FileStateStore, name: &str) -> Result<RunStatus> {
    let Some(entry) = store.get(name)? else {
        bail!("No resource named '{name}' in {}", store.path().display());
    };

    ui::header(&address(&entry));
    ui::kv("id", &entry.id);
    ui::kv(
        "updated",
        &entry.updated_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string(),
    );
    ui::kv("input hash", &entry.input_hash[..entry.input_hash.len().min(16)]);
    if !entry.dependencies.is_empty() {
        let deps: Vec<&str> = entry.dependencies.iter().map(String::as_str).collect();
        ui::kv("depends on", &deps.join(", "));
    }
    for id in &entry.deposed {
        ui::kv("deposed", id);
    }

    ui::section("Outputs");
    for (key, value) in &entry.outputs {
        let marker = if entry.inputs.contains_key(key) { " " } else { "*" };
        println!("  {marker} {} = {value}", key.dimmed());
    }
    ui::dim("* computed by the provider");

    Ok(RunStatus::NoChanges)
}

fn address(entry: &StateEntry) -> String {
    format!("{}.{}", entry.resource_type, entry.name)
}
