//! Progress display for apply and destroy

use colored::Colorize;
use declarative::{Action, ActionReport, ActionStatus, ProgressCallback, ProviderError};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Duration;

/// Progress bar over the plan's actions, with one line per completed change
pub struct ApplyProgress {
    bar: ProgressBar,
    running: Mutex<BTreeSet<String>>,
    verbose: bool,
}

impl ApplyProgress {
    pub fn new(quiet: bool, verbose: bool) -> Self {
        let bar = ProgressBar::with_draw_target(Some(0), if quiet {
            ProgressDrawTarget::hidden()
        } else {
            ProgressDrawTarget::stderr()
        });
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        bar.enable_steady_tick(Duration::from_millis(120));

        Self {
            bar,
            running: Mutex::new(BTreeSet::new()),
            verbose,
        }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }

    fn update_message(&self, running: &BTreeSet<String>) {
        let names: Vec<&str> = running.iter().map(String::as_str).collect();
        self.bar.set_message(crate::ui::truncate(&names.join(", "), 50));
    }

    fn running(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.running.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl ProgressCallback for ApplyProgress {
    fn on_plan_start(&self, total: usize) {
        self.bar.set_length(total as u64);
    }

    fn on_action_start(&self, action: &Action) {
        if !action.kind.is_change() {
            return;
        }
        let mut running = self.running();
        running.insert(action.name.clone());
        self.update_message(&running);
    }

    fn on_retry(&self, action: &Action, attempt: u32, error: &ProviderError, delay: Duration) {
        self.bar.println(format!(
            "  {} {} attempt {attempt} failed ({error}), retrying in {:.1}s",
            "↻".yellow(),
            action.address(),
            delay.as_secs_f64()
        ));
    }

    fn on_action_complete(&self, report: &ActionReport) {
        self.bar.inc(1);
        {
            let mut running = self.running();
            running.remove(&report.action.name);
            self.update_message(&running);
        }

        let action = &report.action;
        if !action.kind.is_change() && report.status == ActionStatus::Succeeded && !self.verbose {
            return;
        }

        let icon = match report.status {
            ActionStatus::Succeeded => "✓".green(),
            ActionStatus::Failed => "✗".red(),
            _ => "○".dimmed(),
        };
        let attempts = if report.attempts > 1 {
            format!(" ({} attempts)", report.attempts).dimmed().to_string()
        } else {
            String::new()
        };
        self.bar.println(format!(
            "  {icon} {}: {}{attempts}",
            crate::ui::action_label(action),
            report.outcome
        ));
    }
}
