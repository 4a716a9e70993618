use anyhow::{Context as AnyhowContext, Result};
use declarative::{CancelToken, ExecuteOptions, Plan, RetryPolicy, RunStatus, StateStore};
use dialoguer::Confirm;
use std::time::Duration;

use super::Session;
use crate::Context;
use crate::cli::ApplyArgs;
use crate::progress::ApplyProgress;
use crate::ui;

/// Plan, confirm, then converge
pub fn apply(ctx: &Context, args: &ApplyArgs) -> Result<RunStatus> {
    let session = Session::open(ctx)?;
    if !ctx.quiet {
        ui::header(&format!("Apply: {}", session.config_path.display()));
    }

    let state = session.store.load()?;
    let plan = declarative::plan(&session.config, &state, &session.providers, &args.plan.options())?;
    execute(ctx, args, &session, plan, "Apply these changes?")
}

/// Delete everything recorded in state, dependents first
pub fn destroy(ctx: &Context, args: &ApplyArgs) -> Result<RunStatus> {
    let session = Session::open(ctx)?;
    if !ctx.quiet {
        ui::header(&format!("Destroy: {}", session.store.path().display()));
    }

    let state = session.store.load()?;
    let plan = declarative::plan_destroy(&session.config, &state, &args.plan.options())?;
    execute(ctx, args, &session, plan, "Destroy all of these resources?")
}

fn execute(ctx: &Context, args: &ApplyArgs, session: &Session, plan: Plan, prompt: &str) -> Result<RunStatus> {
    ui::print_plan(&plan, ctx.verbose > 0);
    let changes = plan.has_changes();

    if changes && !args.yes {
        println!();
        let confirmed = Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .context("Failed to read confirmation (use --yes to skip)")?;
        if !confirmed {
            ui::info("Nothing was changed.");
            return Ok(RunStatus::NoChanges);
        }
    }

    let options = execute_options(args);
    let cancel = options.cancel.clone();
    ctrlc::set_handler(move || {
        if cancel.is_cancelled() {
            std::process::exit(130);
        }
        eprintln!("\nInterrupt received: finishing in-flight actions (press again to abort)");
        cancel.cancel();
    })
    .context("Failed to install interrupt handler")?;

    // Unchanged plans still run so recorded dependencies stay current
    let progress = ApplyProgress::new(ctx.quiet || !changes, ctx.verbose > 0);
    let report = declarative::apply(plan, &session.store, &session.providers, &options, &progress)?;
    progress.finish();

    if changes || !report.is_success() {
        ui::print_report(&report);
    }
    log::info!("State serial is now {}", session.store.serial());

    Ok(report.run_status())
}

fn execute_options(args: &ApplyArgs) -> ExecuteOptions {
    ExecuteOptions {
        parallelism: usize::from(args.jobs.max(1)),
        retry: RetryPolicy {
            max_attempts: args.retries.max(1),
            ..RetryPolicy::default()
        },
        action_timeout: args.timeout.map(Duration::from_secs),
        cancel: CancelToken::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::PlanArgs;

    #[test]
    fn test_execute_options_from_flags() {
        let args = ApplyArgs {
            plan: PlanArgs::default(),
            jobs: 0,
            retries: 0,
            timeout: Some(90),
            yes: true,
        };
        let options = execute_options(&args);
        assert_eq!(options.parallelism, 1);
        assert_eq!(options.retry.max_attempts, 1);
        assert_eq!(options.action_timeout, Some(Duration::from_secs(90)));
        assert!(!options.cancel.is_cancelled());
    }
}
