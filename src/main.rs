use std::path::{Path, PathBuf};

/// Reset SIGPIPE to default behavior so piping (e.g. `dump-source-db | less`)
/// exits cleanly instead of panicking on broken pipe.
#[cfg(unix)]
fn reset_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }
}

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;

use juju_upgrader::commands;
use juju_upgrader::config::logging::{build_filter, LOGGING_CONFIG_ENV};
use juju_upgrader::config::Settings;
use juju_upgrader::container::migrate::{migrate_lxc, MigrateOptions};
use juju_upgrader::container::revert::revert_lxd;
use juju_upgrader::container::ContainerContext;
use juju_upgrader::dispatch::remote::{connect_controller, open_dump_state};
use juju_upgrader::dispatch::{self, ClientContext, CommandSpec, RemoteContext};
use juju_upgrader::error::passthrough_code;
use juju_upgrader::executor::FlatMachine;
use juju_upgrader::export;
use juju_upgrader::output::formatter;
use juju_upgrader::state::SourceState;
use juju_upgrader::tools::{rollback_agents, upgrade_agents, ToolsWrangler};

/// juju-upgrader - move a Juju 1.25 environment into a Juju 2 controller
#[derive(Parser)]
#[command(name = "juju-upgrader", version, about, long_about = None)]
struct Cli {
    /// Settings file (YAML) layered over the built-in defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging, here and on the API server
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the environment can be migrated, printing the exported model
    VerifySource { environment: String },

    /// Dump the 1.25 database as YAML
    DumpSourceDb { environment: String },

    /// Show the status and version of every agent
    AgentStatus { environment: String },

    /// Start every agent in the environment
    StartAgents { environment: String },

    /// Stop every agent in the environment
    StopAgents { environment: String },

    /// Archive LXC containers into a local directory
    BackupLxc {
        environment: String,
        /// Directory that receives one .tar.xz per container
        backup_dir: PathBuf,
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Restore LXC containers from a local backup directory
    RestoreLxc {
        environment: String,
        /// Directory holding the .tar.xz archives
        backup_dir: PathBuf,
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Convert LXC containers to LXD
    MigrateLxc {
        environment: String,
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Convert migrated LXD containers back to LXC
    RevertLxd {
        environment: String,
        /// Regular expression for matching container ids to revert
        #[arg(long = "match")]
        pattern: Option<String>,
    },

    /// Install the controller's agent binaries on every machine
    UpgradeAgents { environment: String, controller: String },

    /// Undo upgrade-agents on every machine
    RollbackAgents { environment: String },

    /// Import the environment as a model in the target controller
    Import {
        environment: String,
        controller: String,
        /// Keep a failed import
        #[arg(long)]
        keep_broken: bool,
    },

    /// Activate the imported model
    Activate { environment: String, controller: String },

    /// Remove the imported model and roll back the agents
    Abort { environment: String, controller: String },

    /// Switch MAAS nodes to the environment UUID as agent name
    UpdateMaasAgentname { environment: String },

    // ─── API server halves ──────────────────────────────────────────────
    #[command(hide = true)]
    VerifySourceImpl {
        /// Read the source database from a dump-source-db file
        #[arg(long)]
        from_dump: Option<PathBuf>,
    },
    #[command(hide = true)]
    DumpSourceDbImpl,
    #[command(hide = true)]
    AgentStatusImpl,
    #[command(hide = true)]
    StartAgentsImpl,
    #[command(hide = true)]
    StopAgentsImpl,
    #[command(hide = true)]
    BackupLxcImpl { container: Option<String> },
    #[command(hide = true)]
    RestoreLxcImpl { container: Option<String> },
    #[command(hide = true)]
    MigrateLxcImpl {
        #[command(flatten)]
        filter: FilterArgs,
    },
    #[command(hide = true)]
    RevertLxdImpl {
        #[arg(long = "match")]
        pattern: Option<String>,
    },
    #[command(hide = true)]
    UpgradeAgentsImpl { controller_info: Option<String> },
    #[command(hide = true)]
    RollbackAgentsImpl,
    #[command(hide = true)]
    ImportImpl {
        controller_info: Option<String>,
        #[arg(long)]
        keep_broken: bool,
    },
    #[command(hide = true)]
    ActivateImpl { controller_info: Option<String> },
    #[command(hide = true)]
    AbortImpl { controller_info: Option<String> },
    #[command(hide = true)]
    UpdateMaasAgentnameImpl,
}

#[derive(clap::Args, Clone, Default)]
struct FilterArgs {
    /// Perform a dry run, without making any changes
    #[arg(long)]
    dry_run: bool,

    /// Regular expression for matching container ids
    #[arg(long = "match")]
    pattern: Option<String>,
}

impl FilterArgs {
    /// The same flags, for the impl half's command line.
    fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.dry_run {
            args.push("--dry-run".to_string());
        }
        if let Some(pattern) = &self.pattern {
            args.push("--match".to_string());
            args.push(pattern.clone());
        }
        args
    }
}

#[tokio::main]
async fn main() {
    #[cfg(unix)]
    reset_sigpipe();

    let cli = Cli::parse();

    let logging_config = std::env::var(LOGGING_CONFIG_ENV).ok();
    tracing_subscriber::fmt()
        .with_env_filter(build_filter(cli.debug, logging_config.as_deref()))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    if let Err(err) = run(cli).await {
        // The remote half has already reported its own failure.
        if let Some(code) = passthrough_code(&err) {
            std::process::exit(code);
        }
        eprintln!("{} {:#}", "error:".red().bold(), err);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::load(cli.config.as_deref())?;
    let debug = cli.debug;

    match cli.command {
        Commands::VerifySource { ref environment } => {
            cmd_client(&settings, &dispatch::VERIFY_SOURCE, environment, None, vec![], debug).await
        }
        Commands::DumpSourceDb { ref environment } => {
            cmd_client(&settings, &dispatch::DUMP_SOURCE_DB, environment, None, vec![], debug).await
        }
        Commands::AgentStatus { ref environment } => {
            cmd_client(&settings, &dispatch::AGENT_STATUS, environment, None, vec![], debug).await
        }
        Commands::StartAgents { ref environment } => {
            cmd_client(&settings, &dispatch::START_AGENTS, environment, None, vec![], debug).await
        }
        Commands::StopAgents { ref environment } => {
            cmd_client(&settings, &dispatch::STOP_AGENTS, environment, None, vec![], debug).await
        }
        Commands::BackupLxc {
            ref environment,
            ref backup_dir,
            ref filter,
        } => cmd_backup_lxc(&settings, environment, backup_dir, filter, debug).await,
        Commands::RestoreLxc {
            ref environment,
            ref backup_dir,
            ref filter,
        } => cmd_restore_lxc(&settings, environment, backup_dir, filter, debug).await,
        Commands::MigrateLxc {
            ref environment,
            ref filter,
        } => {
            cmd_client(&settings, &dispatch::MIGRATE_LXC, environment, None, filter.to_args(), debug).await
        }
        Commands::RevertLxd {
            ref environment,
            ref pattern,
        } => {
            let filter = FilterArgs {
                dry_run: false,
                pattern: pattern.clone(),
            };
            cmd_client(&settings, &dispatch::REVERT_LXD, environment, None, filter.to_args(), debug).await
        }
        Commands::UpgradeAgents {
            ref environment,
            ref controller,
        } => {
            cmd_client(&settings, &dispatch::UPGRADE_AGENTS, environment, Some(controller), vec![], debug).await
        }
        Commands::RollbackAgents { ref environment } => {
            cmd_client(&settings, &dispatch::ROLLBACK_AGENTS, environment, None, vec![], debug).await
        }
        Commands::Import {
            ref environment,
            ref controller,
            keep_broken,
        } => {
            let extra = if keep_broken {
                vec!["--keep-broken".to_string()]
            } else {
                vec![]
            };
            cmd_client(&settings, &dispatch::IMPORT, environment, Some(controller), extra, debug).await
        }
        Commands::Activate {
            ref environment,
            ref controller,
        } => cmd_client(&settings, &dispatch::ACTIVATE, environment, Some(controller), vec![], debug).await,
        Commands::Abort {
            ref environment,
            ref controller,
        } => cmd_client(&settings, &dispatch::ABORT, environment, Some(controller), vec![], debug).await,
        Commands::UpdateMaasAgentname { ref environment } => {
            cmd_client(&settings, &dispatch::UPDATE_MAAS_AGENTNAME, environment, None, vec![], debug).await
        }

        Commands::VerifySourceImpl { ref from_dump } => cmd_verify_source_impl(&settings, from_dump.as_deref()).await,
        Commands::DumpSourceDbImpl => cmd_dump_source_db_impl(&settings).await,
        Commands::AgentStatusImpl => cmd_agent_status_impl(&settings).await,
        Commands::StartAgentsImpl => cmd_control_agents_impl(&settings, "start").await,
        Commands::StopAgentsImpl => cmd_control_agents_impl(&settings, "stop").await,
        Commands::BackupLxcImpl { ref container } => {
            let (_, st) = open_remote_state(&settings).await?;
            commands::backup_lxc_impl(&ContainerContext::new(&settings), &st, container.as_deref()).await
        }
        Commands::RestoreLxcImpl { ref container } => {
            let (_, st) = open_remote_state(&settings).await?;
            commands::restore_lxc_impl(&ContainerContext::new(&settings), &st, container.as_deref()).await
        }
        Commands::MigrateLxcImpl { ref filter } => {
            let (_, st) = open_remote_state(&settings).await?;
            let opts = MigrateOptions {
                dry_run: filter.dry_run,
                pattern: filter.pattern.clone(),
            };
            migrate_lxc(&ContainerContext::new(&settings), &st, &opts).await
        }
        Commands::RevertLxdImpl { ref pattern } => {
            let (_, st) = open_remote_state(&settings).await?;
            revert_lxd(&ContainerContext::new(&settings), &st, pattern.as_deref()).await
        }
        Commands::UpgradeAgentsImpl { ref controller_info } => {
            cmd_upgrade_agents_impl(&settings, controller_info.as_deref().unwrap_or_default()).await
        }
        Commands::RollbackAgentsImpl => rollback_agents(&settings).await,
        Commands::ImportImpl {
            ref controller_info,
            keep_broken,
        } => cmd_import_impl(&settings, controller_info.as_deref().unwrap_or_default(), keep_broken).await,
        Commands::ActivateImpl { ref controller_info } => {
            cmd_activate_impl(&settings, controller_info.as_deref().unwrap_or_default()).await
        }
        Commands::AbortImpl { ref controller_info } => {
            cmd_abort_impl(&settings, controller_info.as_deref().unwrap_or_default()).await
        }
        Commands::UpdateMaasAgentnameImpl => cmd_update_maas_agentname_impl(&settings).await,
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

async fn open_remote_state(settings: &Settings) -> Result<(RemoteContext, SourceState)> {
    let remote = RemoteContext::discover(settings).context("getting state")?;
    let st = remote.open_state().await.context("getting state")?;
    Ok((remote, st))
}

async fn remote_machines(settings: &Settings) -> Result<(SourceState, Vec<FlatMachine>)> {
    let (_, st) = open_remote_state(settings).await?;
    let machines = st
        .flat_machines()
        .await
        .context("unable to get addresses for machines")?;
    Ok((st, machines))
}

// ─── Client halves ───────────────────────────────────────────────────────────

async fn cmd_client(
    settings: &Settings,
    spec: &CommandSpec,
    environment: &str,
    controller: Option<&str>,
    extra: Vec<String>,
    debug: bool,
) -> Result<()> {
    let client = ClientContext::init(settings, spec, Some(environment), controller, debug)?;
    client.dispatch(spec.impl_name, &extra).await
}

async fn cmd_backup_lxc(
    settings: &Settings,
    environment: &str,
    backup_dir: &Path,
    filter: &FilterArgs,
    debug: bool,
) -> Result<()> {
    let client = ClientContext::init(settings, &dispatch::BACKUP_LXC, Some(environment), None, debug)?;
    let opts = commands::ArchiveOptions {
        dir: backup_dir.to_path_buf(),
        pattern: filter.pattern.clone(),
        dry_run: filter.dry_run,
    };
    commands::backup_lxc(&client, &opts).await
}

async fn cmd_restore_lxc(
    settings: &Settings,
    environment: &str,
    backup_dir: &Path,
    filter: &FilterArgs,
    debug: bool,
) -> Result<()> {
    let client = ClientContext::init(settings, &dispatch::RESTORE_LXC, Some(environment), None, debug)?;
    let opts = commands::ArchiveOptions {
        dir: backup_dir.to_path_buf(),
        pattern: filter.pattern.clone(),
        dry_run: filter.dry_run,
    };
    commands::restore_lxc(&client, &opts).await
}

// ─── API server halves ───────────────────────────────────────────────────────

async fn cmd_verify_source_impl(settings: &Settings, from_dump: Option<&Path>) -> Result<()> {
    let yaml = match from_dump {
        Some(path) => {
            let st = open_dump_state(path).await?;
            commands::verify_source(&st, None).await?
        }
        None => {
            let (_, st) = open_remote_state(settings).await?;
            commands::verify_source(&st, Some(&ContainerContext::new(settings))).await?
        }
    };
    print!("{}", yaml);
    Ok(())
}

async fn cmd_dump_source_db_impl(settings: &Settings) -> Result<()> {
    let (_, st) = open_remote_state(settings).await?;
    let yaml = commands::dump_source_db(&st).await?;
    print!("{}", yaml);
    Ok(())
}

async fn cmd_agent_status_impl(settings: &Settings) -> Result<()> {
    let (_, machines) = remote_machines(settings).await?;
    let statuses = commands::agent_status(settings, &machines).await?;
    formatter::print_agent_status(&statuses);
    Ok(())
}

async fn cmd_control_agents_impl(settings: &Settings, action: &str) -> Result<()> {
    let (_, machines) = remote_machines(settings).await?;
    let statuses = commands::control_agents(settings, &machines, action).await?;
    formatter::print_agent_status(&statuses);
    Ok(())
}

async fn cmd_upgrade_agents_impl(settings: &Settings, controller_info: &str) -> Result<()> {
    let (_, machines) = remote_machines(settings).await?;
    let conn = connect_controller(controller_info).await?;
    let details = conn.details();
    let wrangler = ToolsWrangler::new(conn.addr(), &details.version, &settings.tools_dir)?;
    let result = upgrade_agents(settings, &details, &wrangler, &machines).await;
    conn.close().await;
    result
}

async fn cmd_import_impl(settings: &Settings, controller_info: &str, keep_broken: bool) -> Result<()> {
    let (_, st) = open_remote_state(settings).await?;
    let conn = connect_controller(controller_info).await?;
    let details = conn.details();
    let wrangler = ToolsWrangler::new(conn.addr(), &details.version, &settings.tools_dir)?;
    let result = commands::import_model(&st, &conn, &wrangler, keep_broken).await;
    conn.close().await;
    result
}

async fn cmd_activate_impl(settings: &Settings, controller_info: &str) -> Result<()> {
    let remote = RemoteContext::discover(settings)?;
    let model_uuid = remote.model_uuid().context("getting model UUID")?;
    let conn = connect_controller(controller_info).await?;
    let result = commands::activate_upgrade(settings, &conn, &model_uuid).await;
    conn.close().await;
    result
}

async fn cmd_abort_impl(settings: &Settings, controller_info: &str) -> Result<()> {
    let abort_import = async {
        let remote = RemoteContext::discover(settings)?;
        let model_uuid = remote.model_uuid().context("getting model UUID")?;
        let conn = connect_controller(controller_info).await?;
        let result = commands::abort_model(&conn, &model_uuid).await;
        conn.close().await;
        result
    };
    commands::abort_upgrade(settings, abort_import).await
}

async fn cmd_update_maas_agentname_impl(settings: &Settings) -> Result<()> {
    let (_, st) = open_remote_state(settings).await?;
    let environ_config = st.environ_config().await.context("getting environ config")?;
    let client = export::maas::client_from_config(&environ_config)?;
    commands::update_maas_agentname(&st, &client, &settings.timing).await
}
