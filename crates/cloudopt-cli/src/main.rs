mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    action::ActionSubcommand, config::ConfigSubcommand, recommend::RecommendSubcommand,
    workflow::WorkflowSubcommand,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "cloudopt",
    about = "Cloud cost automation: recommendations, approval-gated actions and workflows",
    version,
    propagate_version = true
)]
struct Cli {
    /// Workspace root (default: nearest directory holding .cloudopt/)
    #[arg(long, global = true, env = "CLOUDOPT_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .cloudopt/ with a default config and an empty database
    Init {
        /// Register a dry-run provider for this account (repeatable)
        #[arg(long = "dry-run-account")]
        dry_run_accounts: Vec<String>,
    },

    /// Inspect and validate the config
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Generate and manage recommendations
    Recommend {
        #[command(subcommand)]
        subcommand: RecommendSubcommand,
    },

    /// Create, approve and execute actions
    Action {
        #[command(subcommand)]
        subcommand: ActionSubcommand,
    },

    /// Define and run workflows
    Workflow {
        #[command(subcommand)]
        subcommand: WorkflowSubcommand,
    },

    /// Run one scheduler pass and exit
    Tick {
        /// Evaluate as of this RFC 3339 time instead of now
        #[arg(long)]
        at: Option<String>,

        /// Recover work stuck in progress before ticking
        #[arg(long)]
        recover: bool,
    },

    /// Run the scheduler loop until interrupted
    Daemon,
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Daemon => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init { dry_run_accounts } => cmd::init::run(&root, &dry_run_accounts),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
        Commands::Recommend { subcommand } => cmd::recommend::run(&root, subcommand, cli.json),
        Commands::Action { subcommand } => cmd::action::run(&root, subcommand, cli.json),
        Commands::Workflow { subcommand } => cmd::workflow::run(&root, subcommand, cli.json),
        Commands::Tick { at, recover } => cmd::tick::run(&root, at.as_deref(), recover, cli.json),
        Commands::Daemon => cmd::daemon::run(&root),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
