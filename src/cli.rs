use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use declarative::PlanOptions;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "converge")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Converge declared cloud infrastructure", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Configuration document (TOML, JSON or YAML)
    #[arg(short = 'c', long, global = true, env = "CONVERGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// State file (default: <state dir>/state.json)
    #[arg(long, global = true, env = "CONVERGE_STATE")]
    pub state: Option<PathBuf>,

    /// Override a parameter (key=value, repeatable)
    #[arg(long = "var", value_name = "KEY=VALUE", global = true)]
    pub vars: Vec<String>,

    /// Read parameter overrides from a document (repeatable)
    #[arg(long = "var-file", value_name = "PATH", global = true)]
    pub var_files: Vec<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Check the configuration without touching state or the cloud
    Validate,

    /// Show what apply would change
    Plan(PlanArgs),

    /// Make the cloud match the configuration
    Apply(ApplyArgs),

    /// Delete everything recorded in state
    Destroy(ApplyArgs),

    /// Inspect recorded state
    #[command(subcommand)]
    State(StateCommand),

    /// Print the dependency graph in DOT format
    Graph,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Clone, Default)]
pub struct PlanArgs {
    /// Limit the run to these resources (and what they need)
    #[arg(short, long = "target", value_name = "NAME")]
    pub targets: Vec<String>,

    /// Read every recorded resource from the cloud before planning
    #[arg(long)]
    pub refresh: bool,
}

impl PlanArgs {
    pub fn options(&self) -> PlanOptions {
        PlanOptions {
            refresh: self.refresh,
            targets: self.targets.iter().cloned().collect(),
        }
    }
}

#[derive(Args, Clone)]
pub struct ApplyArgs {
    #[command(flatten)]
    pub plan: PlanArgs,

    /// Number of actions to run concurrently
    #[arg(short, long, default_value = "4")]
    pub jobs: u16,

    /// Attempts per action for transient errors
    #[arg(long, default_value = "5")]
    pub retries: u32,

    /// Per-attempt timeout in seconds
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Subcommand)]
pub enum StateCommand {
    /// List recorded resources
    List,

    /// Show one recorded resource
    Show {
        /// Logical resource name
        name: String,
    },
}
