//! pgbranch - Git-like branching for PostgreSQL on ZFS and Docker

use anyhow::Result;
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use pgbranch_cli::{cmd, ctx::Ctx};
use pgbranch_state::UserError;

/// pgbranch - branch PostgreSQL databases like code
#[derive(Parser)]
#[command(name = "pgbranch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage projects (PostgreSQL instance groups)
    #[command(subcommand)]
    Project(ProjectCommands),
    /// Manage branches of a project
    #[command(subcommand)]
    Branch(BranchCommands),
    /// Manage snapshots of branches
    #[command(subcommand)]
    Snapshot(SnapshotCommands),
    /// Inspect and clean WAL archives
    #[command(subcommand)]
    Wal(WalCommands),
    /// Show pool, project and branch status
    Status,
    /// Check the host, daemons and persisted state
    Doctor,
    /// One-time host setup (zfs delegation, sudoers, docker access)
    Setup {
        /// Pool to delegate permissions on (default: the only pool)
        #[arg(long)]
        pool: Option<String>,
        /// Only verify the setup, change nothing
        #[arg(long)]
        check: bool,
    },
    /// Remove datasets and containers not tracked in state
    Cleanup {
        /// List orphans without removing anything
        #[arg(long)]
        dry_run: bool,
        /// Skip the confirmation prompt
        #[arg(long)]
        force: bool,
    },
    /// State file maintenance
    #[command(subcommand)]
    State(StateCommands),
}

#[derive(Subcommand)]
enum ProjectCommands {
    /// Create a project with its primary branch
    Create {
        /// Project name
        name: String,
        /// ZFS pool to use (default: the only pool)
        #[arg(long)]
        pool: Option<String>,
        /// PostgreSQL major version, expands to postgres:<v>-alpine
        #[arg(long)]
        pg_version: Option<String>,
        /// Full container image reference
        #[arg(long)]
        image: Option<String>,
    },
    /// List projects
    List,
    /// Show a project and its branch tree
    Get {
        /// Project name
        name: String,
    },
    /// Delete a project and every branch
    Delete {
        /// Project name
        name: String,
        /// Also delete non-primary branches
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum BranchCommands {
    /// Create a branch from a parent's current state or a point in time
    Create {
        /// Target branch as <project>/<branch>
        name: String,
        /// Parent branch (default: <project>/main)
        #[arg(long)]
        parent: Option<String>,
        /// Recover to a point in time (ISO-8601 or '<N> <unit> ago')
        #[arg(long)]
        pitr: Option<String>,
    },
    /// List branches
    List {
        /// Restrict to one project
        project: Option<String>,
    },
    /// Show one branch
    Get {
        /// Branch as <project>/<branch>
        name: String,
    },
    /// Delete a branch (and, with --force, its descendants)
    Delete {
        /// Branch as <project>/<branch>
        name: String,
        /// Also delete dependent branches
        #[arg(long)]
        force: bool,
    },
    /// Reset a branch to its parent's current state
    Reset {
        /// Branch as <project>/<branch>
        name: String,
        /// Also discard dependent branches
        #[arg(long)]
        force: bool,
    },
    /// Start a stopped branch
    Start {
        /// Branch as <project>/<branch>
        name: String,
    },
    /// Stop a running branch
    Stop {
        /// Branch as <project>/<branch>
        name: String,
    },
    /// Restart a branch
    Restart {
        /// Branch as <project>/<branch>
        name: String,
    },
    /// Print connection credentials
    Password {
        /// Branch as <project>/<branch>
        name: String,
    },
}

#[derive(Subcommand)]
enum SnapshotCommands {
    /// Take an application-consistent snapshot
    Create {
        /// Branch as <project>/<branch>
        name: String,
        /// Label appended to the snapshot name
        #[arg(long)]
        label: Option<String>,
    },
    /// List snapshots
    List {
        /// Restrict to one branch
        branch: Option<String>,
    },
    /// Delete a snapshot by id
    Delete {
        /// Snapshot id
        id: String,
    },
    /// Delete old snapshots
    Cleanup {
        /// Restrict to one branch
        branch: Option<String>,
        /// Age threshold in days (default: 30)
        #[arg(long)]
        days: Option<i64>,
        /// List without deleting
        #[arg(long)]
        dry_run: bool,
        /// Delete regardless of age
        #[arg(long)]
        all: bool,
    },
}

#[derive(Subcommand)]
enum WalCommands {
    /// Show archive contents and integrity
    Info {
        /// Restrict to one branch
        branch: Option<String>,
    },
    /// Delete old archived WAL segments
    Cleanup {
        /// Branch as <project>/<branch>
        branch: String,
        /// Age threshold in days (default: 7)
        #[arg(long)]
        days: Option<i64>,
        /// List without deleting
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum StateCommands {
    /// Restore the state file from its backup
    Restore {
        /// Skip the confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    if let Err(e) = run().await {
        if let Some(user) = e.downcast_ref::<UserError>() {
            eprintln!("{} {}", "error:".red().bold(), user.message);
            if let Some(hint) = &user.hint {
                eprintln!("  {} {}", "hint:".yellow(), hint);
            }
        } else {
            eprintln!("{} {:#}", "error:".red().bold(), e);
        }
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let ctx = Ctx::load()?;

    match cli.command {
        Commands::Project(command) => match command {
            ProjectCommands::Create {
                name,
                pool,
                pg_version,
                image,
            } => cmd::project::create(&ctx, &name, pool, pg_version, image).await,
            ProjectCommands::List => cmd::project::list(&ctx).await,
            ProjectCommands::Get { name } => cmd::project::get(&ctx, &name).await,
            ProjectCommands::Delete { name, force } => {
                cmd::project::delete(&ctx, &name, force).await
            }
        },
        Commands::Branch(command) => match command {
            BranchCommands::Create { name, parent, pitr } => {
                cmd::branch::create(&ctx, &name, parent, pitr).await
            }
            BranchCommands::List { project } => cmd::branch::list(&ctx, project).await,
            BranchCommands::Get { name } => cmd::branch::get(&ctx, &name).await,
            BranchCommands::Delete { name, force } => {
                cmd::branch::delete(&ctx, &name, force).await
            }
            BranchCommands::Reset { name, force } => {
                cmd::branch::reset(&ctx, &name, force).await
            }
            BranchCommands::Start { name } => cmd::branch::start(&ctx, &name).await,
            BranchCommands::Stop { name } => cmd::branch::stop(&ctx, &name).await,
            BranchCommands::Restart { name } => cmd::branch::restart(&ctx, &name).await,
            BranchCommands::Password { name } => cmd::branch::password(&ctx, &name).await,
        },
        Commands::Snapshot(command) => match command {
            SnapshotCommands::Create { name, label } => {
                cmd::snapshot::create(&ctx, &name, label).await
            }
            SnapshotCommands::List { branch } => cmd::snapshot::list(&ctx, branch).await,
            SnapshotCommands::Delete { id } => cmd::snapshot::delete(&ctx, &id).await,
            SnapshotCommands::Cleanup {
                branch,
                days,
                dry_run,
                all,
            } => cmd::snapshot::cleanup(&ctx, branch, days, dry_run, all).await,
        },
        Commands::Wal(command) => match command {
            WalCommands::Info { branch } => cmd::wal::info(&ctx, branch).await,
            WalCommands::Cleanup {
                branch,
                days,
                dry_run,
            } => cmd::wal::cleanup(&ctx, &branch, days, dry_run).await,
        },
        Commands::Status => cmd::status::run(&ctx).await,
        Commands::Doctor => cmd::doctor::run(&ctx).await,
        Commands::Setup { pool, check } => cmd::setup::run(&ctx, pool, check).await,
        Commands::Cleanup { dry_run, force } => cmd::cleanup::run(&ctx, dry_run, force).await,
        Commands::State(command) => match command {
            StateCommands::Restore { yes } => cmd::state::restore(&ctx, yes).await,
        },
    }
}
