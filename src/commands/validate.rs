use anyhow::Result;
use colored::Colorize;
use declarative::RunStatus;

use crate::Context;
use crate::ui;

/// Resolve conditions, build the graph and check every resource type
pub fn run(ctx: &Context) -> Result<RunStatus> {
    let (path, config) = super::load_config(ctx)?;
    let providers = super::offline_providers(ctx)?;
    let graph = declarative::validate(&config, &providers)?;

    let pruned = config.resources.len() - graph.len();
    ui::success(&format!(
        "{} is valid: {} resources, {} pruned by conditions",
        path.display(),
        graph.len(),
        pruned
    ));

    if ctx.verbose > 0 {
        ui::section("Apply order");
        for (i, name) in graph.order().iter().enumerate() {
            let deps: Vec<String> = graph.dependencies(name).into_iter().collect();
            if deps.is_empty() {
                println!("  {:>3}. {}", i + 1, name.bold());
            } else {
                println!("  {:>3}. {} {}", i + 1, name.bold(), format!("after {}", deps.join(", ")).dimmed());
            }
        }
    }

    Ok(RunStatus::NoChanges)
}
