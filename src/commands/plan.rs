use anyhow::Result;
use declarative::{RunStatus, StateStore};

use super::Session;
use crate::Context;
use crate::cli::PlanArgs;
use crate::ui;

/// Show what apply would change; exits 2 when changes are pending
pub fn run(ctx: &Context, args: &PlanArgs) -> Result<RunStatus> {
    let session = Session::open(ctx)?;
    if !ctx.quiet {
        ui::header(&format!("Plan: {}", session.config_path.display()));
    }

    let state = session.store.load()?;
    let plan = declarative::plan(&session.config, &state, &session.providers, &args.options())?;
    ui::print_plan(&plan, ctx.verbose > 0);

    Ok(if plan.has_changes() {
        RunStatus::Changed
    } else {
        RunStatus::NoChanges
    })
}
