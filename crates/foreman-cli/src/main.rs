mod cmd;
mod executor;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    event::EventSubcommand, mission::MissionSubcommand, policy::PolicySubcommand,
    proposal::ProposalSubcommand, step::StepSubcommand, trigger::TriggerSubcommand,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "foreman",
    about = "Closed-loop work orchestration — proposals, missions, workers, heartbeat",
    version,
    propagate_version = true
)]
struct Cli {
    /// Instance root (default: auto-detect from .foreman/)
    #[arg(long, global = true, env = "FOREMAN_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a foreman instance in the current directory
    Init,

    /// Manage proposals
    Proposal {
        #[command(subcommand)]
        subcommand: ProposalSubcommand,
    },

    /// Inspect missions
    Mission {
        #[command(subcommand)]
        subcommand: MissionSubcommand,
    },

    /// Inspect steps
    Step {
        #[command(subcommand)]
        subcommand: StepSubcommand,
    },

    /// Inspect the event log
    Event {
        #[command(subcommand)]
        subcommand: EventSubcommand,
    },

    /// Manage policy entries
    Policy {
        #[command(subcommand)]
        subcommand: PolicySubcommand,
    },

    /// Manage triggers
    Trigger {
        #[command(subcommand)]
        subcommand: TriggerSubcommand,
    },

    /// Run one heartbeat tick and print the action runs
    Heartbeat {
        /// Keep ticking at the configured interval instead of once
        #[arg(long)]
        watch: bool,
    },

    /// Run a worker pool for one step kind
    Worker {
        /// Step kind to service
        #[arg(long)]
        kind: String,

        /// Number of worker threads
        #[arg(long, default_value = "1")]
        count: usize,

        /// Drain the queue and exit instead of polling forever
        #[arg(long)]
        once: bool,
    },

    /// List recent heartbeat action runs
    ActionRuns {
        #[arg(long, default_value = "50")]
        limit: usize,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Worker { .. } | Commands::Heartbeat { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root_path = cli.root.as_deref();
    let root = root::resolve_root(root_path);

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root, cli.json),
        Commands::Proposal { subcommand } => cmd::proposal::run(&root, subcommand, cli.json),
        Commands::Mission { subcommand } => cmd::mission::run(&root, subcommand, cli.json),
        Commands::Step { subcommand } => cmd::step::run(&root, subcommand, cli.json),
        Commands::Event { subcommand } => cmd::event::run(&root, subcommand, cli.json),
        Commands::Policy { subcommand } => cmd::policy::run(&root, subcommand, cli.json),
        Commands::Trigger { subcommand } => cmd::trigger::run(&root, subcommand, cli.json),
        Commands::Heartbeat { watch } => cmd::heartbeat::run(&root, watch, cli.json),
        Commands::Worker { kind, count, once } => cmd::worker::run(&root, &kind, count, once),
        Commands::ActionRuns { limit } => cmd::action_runs::run(&root, limit, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
