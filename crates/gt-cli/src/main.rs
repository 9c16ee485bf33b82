mod commands;

use clap::{Parser, Subcommand};

/// gt -- stage, launch, and sling beads across the town's rigs.
#[derive(Parser)]
#[command(name = "gt", version, about)]
struct Cli {
    /// Town root directory (defaults to the current directory).
    #[arg(long, global = true)]
    town_root: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stage an epic, task list, or existing convoy into a launch-ready convoy.
    Stage {
        /// Epic id, convoy id, or one or more task ids.
        #[arg(required = true)]
        ids: Vec<String>,
        /// Convoy title override.
        #[arg(long)]
        title: Option<String>,
        /// Launch Wave 1 immediately after staging.
        #[arg(long)]
        launch: bool,
        /// Emit a single JSON envelope.
        #[arg(long)]
        json: bool,
    },

    /// Launch a staged convoy (staging epics/tasks on the fly if needed).
    Launch {
        /// Convoy id, epic id, or task ids.
        #[arg(required = true)]
        ids: Vec<String>,
        /// Launch through warnings and blocked rigs.
        #[arg(long)]
        force: bool,
        /// Emit a single JSON envelope.
        #[arg(long)]
        json: bool,
    },

    /// Dispatch beads onto freshly provisioned polecats.
    Sling {
        /// Bead ids, optionally followed by the target rig.
        #[arg(required = true)]
        args: Vec<String>,
        #[arg(long)]
        force: bool,
        /// Skip the per-task auto-convoy.
        #[arg(long)]
        no_convoy: bool,
        /// Caller wakes rig supervisors itself.
        #[arg(long)]
        no_boot: bool,
        /// Hook the bare bead without cooking a formula.
        #[arg(long)]
        naked: bool,
        /// Agent address override.
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        account: Option<String>,
        /// Formula to cook and bond onto the bead.
        #[arg(long)]
        formula: Option<String>,
        /// Hook the raw bead even when a formula is bonded.
        #[arg(long = "hook-raw-bead")]
        hook_raw_bead: bool,
        /// Formula variable binding, repeatable (k=v).
        #[arg(long = "var")]
        vars: Vec<String>,
        /// Free-form args handed to the polecat.
        #[arg(long = "args")]
        args_str: Option<String>,
        /// Merge strategy: direct, mr, or local.
        #[arg(long)]
        merge: Option<String>,
        #[arg(long = "base-branch")]
        base_branch: Option<String>,
        /// Keep the polecat looping on the bead.
        #[arg(long)]
        ralph: bool,
        /// Don't merge the result back.
        #[arg(long = "no-merge")]
        no_merge: bool,
        /// Admission throttle for batch slings.
        #[arg(long = "max-concurrent", default_value_t = 4)]
        max_concurrent: usize,
        #[arg(long)]
        json: bool,
    },

    /// Queue beads for capacity-aware deferred dispatch.
    Schedule {
        /// Bead ids followed by the target rig.
        #[arg(required = true)]
        args: Vec<String>,
        #[arg(long)]
        force: bool,
        /// Validate and report without writing anything.
        #[arg(long = "dry-run")]
        dry_run: bool,
        #[arg(long)]
        formula: Option<String>,
        #[arg(long = "var")]
        vars: Vec<String>,
        #[arg(long = "args")]
        args_str: Option<String>,
        #[arg(long)]
        merge: Option<String>,
        #[arg(long = "base-branch")]
        base_branch: Option<String>,
        #[arg(long)]
        account: Option<String>,
        #[arg(long)]
        agent: Option<String>,
        #[arg(long = "no-merge")]
        no_merge: bool,
        #[arg(long = "hook-raw-bead")]
        hook_raw_bead: bool,
        #[arg(long)]
        ralph: bool,
        #[arg(long)]
        owned: bool,
        #[arg(long)]
        json: bool,
    },

    /// Drain the deferred queue once.
    Dispatch {
        #[arg(long)]
        json: bool,
    },

    /// Advance an open convoy's waves as earlier waves complete.
    Reconcile {
        /// Convoy id.
        convoy: String,
        #[arg(long)]
        json: bool,
    },

    /// Rig availability controls.
    Rig {
        #[command(subcommand)]
        command: RigCommands,
    },
}

#[derive(Subcommand)]
enum RigCommands {
    /// Park a rig (ephemeral + persistent).
    Park { name: String },
    /// Clear parked state from both stores.
    Unpark { name: String },
    /// Dock a rig (persistent only).
    Dock { name: String },
    /// Remove the docked label.
    Undock { name: String },
    /// Show availability of every registered rig.
    Status {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("GT_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let town = commands::town_root(cli.town_root);

    match cli.command {
        Commands::Stage {
            ids,
            title,
            launch,
            json,
        } => commands::stage::run(&town, ids, title, launch, json).await,
        Commands::Launch { ids, force, json } => {
            commands::launch::run(&town, ids, force, json).await
        }
        Commands::Sling {
            args,
            force,
            no_convoy,
            no_boot,
            naked,
            agent,
            account,
            formula,
            hook_raw_bead,
            vars,
            args_str,
            merge,
            base_branch,
            ralph,
            no_merge,
            max_concurrent,
            json,
        } => {
            let opts = commands::sling::SlingCliOpts {
                force,
                no_convoy,
                no_boot,
                naked,
                agent,
                account,
                formula,
                hook_raw_bead,
                vars,
                args_str,
                merge,
                base_branch,
                ralph,
                no_merge,
                max_concurrent,
                json,
            };
            commands::sling::run(&town, args, opts).await
        }
        Commands::Schedule {
            args,
            force,
            dry_run,
            formula,
            vars,
            args_str,
            merge,
            base_branch,
            account,
            agent,
            no_merge,
            hook_raw_bead,
            ralph,
            owned,
            json,
        } => {
            let opts = commands::schedule::ScheduleCliOpts {
                force,
                dry_run,
                formula,
                vars,
                args_str,
                merge,
                base_branch,
                account,
                agent,
                no_merge,
                hook_raw_bead,
                ralph,
                owned,
                json,
            };
            commands::schedule::run(&town, args, opts).await
        }
        Commands::Dispatch { json } => commands::dispatch::run(&town, json).await,
        Commands::Reconcile { convoy, json } => {
            commands::dispatch::reconcile(&town, convoy, json).await
        }
        Commands::Rig { command } => match command {
            RigCommands::Park { name } => commands::rig::park(&town, name).await,
            RigCommands::Unpark { name } => commands::rig::unpark(&town, name).await,
            RigCommands::Dock { name } => commands::rig::dock(&town, name).await,
            RigCommands::Undock { name } => commands::rig::undock(&town, name).await,
            RigCommands::Status { json } => commands::rig::status(&town, json).await,
        },
    }
}
