use colored::{ColoredString, Colorize};
use declarative::{Action, ActionKind, ApplyReport, AttributeChange, Plan};
use serde_json::Value as Json;
use similar::{ChangeTag, TextDiff};

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a section header
pub fn section(title: &str) {
    println!();
    println!("{}", title.cyan().bold());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

/// Truncate for display, keeping the start
pub fn truncate(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        text.to_string()
    } else if max_len <= 3 {
        "...".to_string()
    } else {
        let kept: String = text.chars().take(max_len - 3).collect();
        format!("{kept}...")
    }
}

// ============================================================================
// Plans
// ============================================================================

fn symbol(action: &Action) -> ColoredString {
    match action.kind {
        ActionKind::Create if action.replacement => "+/-".green(),
        ActionKind::Create => "+".green(),
        ActionKind::Update => "~".yellow(),
        ActionKind::Delete if action.replacement => "-/+".red(),
        ActionKind::Delete => "-".red(),
        ActionKind::NoOp => " ".normal(),
    }
}

/// `aws_vpc.network`, plus a note for replacements and deposed objects
pub fn action_label(action: &Action) -> String {
    let mut label = action.address().bold().to_string();
    if let Some(id) = &action.deposed {
        label.push_str(&format!(" (deposed {id})").dimmed().to_string());
    } else if action.replacement {
        label.push_str(&" (replace)".dimmed().to_string());
    }
    label
}

fn render_value(value: Option<&Json>) -> String {
    match value {
        Some(Json::String(s)) => format!("{s:?}"),
        Some(value) => value.to_string(),
        None => "(known after apply)".to_string(),
    }
}

fn is_multiline(value: Option<&Json>) -> bool {
    match value {
        Some(Json::String(s)) => s.contains('\n'),
        Some(Json::Object(map)) => !map.is_empty(),
        _ => false,
    }
}

fn pretty(value: Option<&Json>) -> String {
    match value {
        Some(Json::String(s)) => s.clone(),
        Some(value) => serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()),
        None => String::new(),
    }
}

fn print_change(change: &AttributeChange) {
    let forces = if change.forces_replacement {
        format!(" {}", "# forces replacement".red())
    } else {
        String::new()
    };

    match (&change.before, &change.after) {
        (None, after) => println!("      {} = {}{forces}", change.name, render_value(after.as_ref())),
        (Some(before), None) if !change.forces_replacement => {
            println!("      {} = {} → {}{forces}", change.name, render_value(Some(before)), render_value(None));
        }
        (before, after) if is_multiline(before.as_ref()) || is_multiline(after.as_ref()) => {
            println!("      {}:{forces}", change.name);
            let old = pretty(before.as_ref());
            let new = pretty(after.as_ref());
            for line in TextDiff::from_lines(&old, &new).iter_all_changes() {
                let text = line.to_string_lossy();
                let text = text.trim_end();
                match line.tag() {
                    ChangeTag::Delete => println!("        {}", format!("- {text}").red()),
                    ChangeTag::Insert => println!("        {}", format!("+ {text}").green()),
                    ChangeTag::Equal => println!("        {}", format!("  {text}").dimmed()),
                }
            }
        }
        (before, after) => println!(
            "      {} = {} → {}{forces}",
            change.name,
            render_value(before.as_ref()),
            render_value(after.as_ref())
        ),
    }
}

/// Print the changes a plan would make, attribute by attribute
pub fn print_plan(plan: &Plan, verbose: bool) {
    if !plan.has_changes() {
        success("No changes. Infrastructure matches the configuration.");
        return;
    }

    section("Planned changes");
    for action in plan.actions() {
        if !action.kind.is_change() && !verbose {
            continue;
        }
        println!("  {} {}", symbol(action), action_label(action));
        if action.kind.is_change() || verbose {
            dim(&format!("    {}", action.reason));
        }
        if action.kind != ActionKind::Delete {
            for change in &action.changes {
                print_change(change);
            }
        }
    }

    let summary = plan.summary();
    println!();
    println!(
        "{} {} to add, {} to change, {} to destroy.",
        "Plan:".bold(),
        (summary.additions + summary.replacements).to_string().green(),
        summary.modifications.to_string().yellow(),
        (summary.removals + summary.replacements).to_string().red()
    );
}

// ============================================================================
// Reports
// ============================================================================

/// Per-resource results, then totals
pub fn print_report(report: &ApplyReport) {
    section("Results");
    for (name, outcome) in report.resource_outcomes() {
        let icon = if outcome.starts_with("failed") {
            "✗".red()
        } else if outcome.starts_with("skipped") {
            "○".dimmed()
        } else if outcome == "unchanged" {
            "·".dimmed()
        } else {
            "✓".green()
        };
        println!("  {icon} {name}: {outcome}");
    }

    let summary = report.summary();
    println!();
    let line = format!(
        "{} created, {} updated, {} deleted, {} unchanged, {} failed, {} skipped",
        summary.created, summary.modified, summary.removed, summary.no_change, summary.failed, summary.skipped
    );
    if report.cancelled {
        warn(&format!("Cancelled: {line}"));
    } else if summary.is_success() {
        success(&line);
    } else {
        error(&line);
    }
}
