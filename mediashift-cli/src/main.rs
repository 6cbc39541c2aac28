//! Mediashift - command line entry point.
//!
//! Wires the shipped adapters into the core engine and exposes one
//! subcommand per operation. Progress streams to stderr as log lines; the
//! machine-readable run report goes to stdout.

mod logger;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use mediashift_core::adapters::{JsonPreferencesStore, SqliteLibraryAdapter, SystemArchiver};
use mediashift_core::{
    BackupEngine, BackupMode, BackupOptions, BackupStatus, CommandServiceController,
    ConfigPathResolver, DiscoveryService, FixedPathResolver, MigrationConfig,
    MigrationCoordinator, MigrationMode, MigrationState, PathResolver, PeerRole, ToolkitConfig,
    ToolkitContext,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
#[command(author, version, about = "Backup, restore and migration toolkit for media-server data directories", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Data directory, overriding the configured layout
    #[arg(long, value_name = "DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the bytes a backup would copy, exclusions applied
    Estimate,

    /// Back up the data directory
    Backup {
        /// Destination directory
        #[arg(short, long, value_name = "DIR")]
        dest: PathBuf,

        /// Backup mode: hot, cold, smart, incremental, database_only
        #[arg(short, long, default_value = "smart")]
        mode: BackupMode,

        /// Pack the finished backup into a tar.gz archive
        #[arg(long)]
        compress: bool,

        /// Skip post-copy verification
        #[arg(long)]
        no_verify: bool,
    },

    /// Install a backup (directory or archive) into the data directory
    Restore {
        /// Backup directory or archive to restore from
        #[arg(short, long, value_name = "PATH")]
        source: PathBuf,

        /// Media path rewrite, OLD=NEW; may be given multiple times
        #[arg(long = "map", value_name = "OLD=NEW", value_parser = parse_mapping)]
        mappings: Vec<(String, String)>,

        /// Keep the backed-up machine identity instead of regenerating it
        #[arg(long)]
        preserve_identity: bool,

        /// Leave the service running (skips the stop/start phases)
        #[arg(long)]
        no_stop: bool,
    },

    /// Back up locally, then stream the backup to a remote instance
    Push {
        /// Remote host running `mediashift pull`
        #[arg(short, long)]
        target: String,

        /// Remote toolkit port
        #[arg(short, long, default_value_t = 52400)]
        port: u16,

        /// Backup mode staged before the transfer
        #[arg(short, long, default_value = "smart")]
        mode: BackupMode,

        /// Never stop the service (smart demotes to hot)
        #[arg(long)]
        no_stop: bool,
    },

    /// Wait for a remote instance to stream its backup to us
    Pull {
        /// Directory the received backup lands in
        #[arg(short, long, value_name = "DIR")]
        dest: PathBuf,

        /// Expected sender; skips discovery when given
        #[arg(short, long)]
        source: Option<String>,
    },

    /// Push plus a restore on the receiving side
    Migrate {
        /// Remote host running `mediashift pull`
        #[arg(short, long)]
        target: String,

        /// Remote toolkit port
        #[arg(short, long, default_value_t = 52400)]
        port: u16,

        /// Backup mode staged before the transfer
        #[arg(short, long, default_value = "smart")]
        mode: BackupMode,

        /// Media path rewrite applied on the remote side, OLD=NEW
        #[arg(long = "map", value_name = "OLD=NEW", value_parser = parse_mapping)]
        mappings: Vec<(String, String)>,

        /// Carry the machine identity over to the target
        #[arg(long)]
        preserve_identity: bool,

        /// Never stop the service (smart demotes to hot)
        #[arg(long)]
        no_stop: bool,
    },

    /// Discover toolkit and media-server peers on the LAN
    Peers {
        /// Seconds to listen before printing the table
        #[arg(short, long, default_value_t = 15)]
        wait: u64,
    },
}

fn parse_mapping(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((old, new)) if !old.is_empty() && !new.is_empty() => {
            Ok((old.to_string(), new.to_string()))
        }
        _ => Err(format!("expected OLD=NEW, got '{s}'")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = if let Some(path) = &args.config {
        ToolkitConfig::from_file(path)?
    } else {
        ToolkitConfig::default()
    };

    let log_level = args.log_level.as_deref().unwrap_or("info");
    logger::init(log_level)?;

    let ctx = Arc::new(ToolkitContext::new(config));
    let resolver: Arc<dyn PathResolver> = match &args.data_dir {
        Some(dir) => Arc::new(FixedPathResolver::new(dir)),
        None => Arc::new(ConfigPathResolver::new(ctx.config.layout.clone())),
    };
    let service = Arc::new(CommandServiceController::new(ctx.config.service.clone()));

    tracing::info!(
        "mediashift v{} (instance {})",
        env!("CARGO_PKG_VERSION"),
        ctx.instance_id
    );

    match args.command {
        Command::Estimate => {
            let engine = build_engine(&ctx, resolver, service);
            let bytes = engine.estimate_size()?;
            println!("{bytes}");
        }
        Command::Backup {
            dest,
            mode,
            compress,
            no_verify,
        } => {
            let engine = Arc::new(build_engine(&ctx, resolver, service));
            let mut options = BackupOptions::new(&dest);
            options.mode = mode;
            options.compress = compress;
            options.verify = !no_verify;
            run_backup(engine, options).await?;
        }
        Command::Restore {
            source,
            mappings,
            preserve_identity,
            no_stop,
        } => {
            let mut migration = MigrationConfig::new(MigrationMode::LocalRestore);
            migration.source_path = Some(source);
            migration.preserve_identity = preserve_identity;
            migration.stop_service = !no_stop;
            migration.path_mappings = mappings.into_iter().collect();
            let coordinator = Arc::new(build_coordinator(&ctx, resolver, service));
            run_migration(coordinator, migration).await?;
        }
        Command::Push {
            target,
            port,
            mode,
            no_stop,
        } => {
            let mut migration = MigrationConfig::new(MigrationMode::NetworkPush);
            migration.target_host = Some(target);
            migration.target_port = port;
            migration.backup_mode = mode;
            migration.stop_service = !no_stop;
            let coordinator = Arc::new(build_coordinator(&ctx, resolver, service));
            run_migration(coordinator, migration).await?;
        }
        Command::Pull { dest, source } => {
            let mut migration = MigrationConfig::new(MigrationMode::NetworkPull);
            migration.dest_path = Some(dest);
            migration.source_host = source.clone();

            let mut coordinator = build_coordinator(&ctx, resolver, service);
            let discovery = if source.is_none() {
                let discovery = DiscoveryService::new(ctx.clone(), PeerRole::Target);
                tokio::spawn(discovery.clone().run());
                coordinator = coordinator.with_discovery(discovery.clone());
                Some(discovery)
            } else {
                None
            };

            let outcome = run_migration(Arc::new(coordinator), migration).await;
            if let Some(discovery) = discovery {
                discovery.stop();
            }
            outcome?;
        }
        Command::Migrate {
            target,
            port,
            mode,
            mappings,
            preserve_identity,
            no_stop,
        } => {
            let mut migration = MigrationConfig::new(MigrationMode::FullMigration);
            migration.target_host = Some(target);
            migration.target_port = port;
            migration.backup_mode = mode;
            migration.preserve_identity = preserve_identity;
            migration.stop_service = !no_stop;
            migration.path_mappings = mappings.into_iter().collect();
            let coordinator = Arc::new(build_coordinator(&ctx, resolver, service));
            run_migration(coordinator, migration).await?;
        }
        Command::Peers { wait } => {
            run_peers(ctx, wait).await;
        }
    }
    Ok(())
}

fn build_engine(
    ctx: &Arc<ToolkitContext>,
    resolver: Arc<dyn PathResolver>,
    service: Arc<CommandServiceController>,
) -> BackupEngine {
    BackupEngine::new(
        ctx.clone(),
        resolver,
        service,
        Arc::new(SqliteLibraryAdapter),
        Arc::new(JsonPreferencesStore),
        Arc::new(SystemArchiver),
    )
}

fn build_coordinator(
    ctx: &Arc<ToolkitContext>,
    resolver: Arc<dyn PathResolver>,
    service: Arc<CommandServiceController>,
) -> MigrationCoordinator {
    MigrationCoordinator::new(
        ctx.clone(),
        resolver,
        service,
        Arc::new(SqliteLibraryAdapter),
        Arc::new(JsonPreferencesStore),
        Arc::new(SystemArchiver),
    )
}

async fn run_backup(engine: Arc<BackupEngine>, options: BackupOptions) -> Result<()> {
    let mut rx = engine.subscribe();
    if !engine.start(options) {
        bail!("backup did not start");
    }

    let canceller = engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling");
            canceller.cancel();
        }
    });

    let mut last_status = None;
    let mut last_step = 0u64;
    let terminal = loop {
        let snapshot = match rx.recv().await {
            Ok(snapshot) => snapshot,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => engine.progress(),
        };
        let step = snapshot.percent() as u64 / 5;
        if last_status != Some(snapshot.status) || step > last_step {
            tracing::info!(
                "[{:?}] {:5.1}% {}",
                snapshot.status,
                snapshot.percent(),
                snapshot.message
            );
            last_status = Some(snapshot.status);
            last_step = step;
        }
        if snapshot.status.is_terminal() {
            break snapshot;
        }
    };

    for warning in &terminal.warnings {
        tracing::warn!("{warning}");
    }
    match terminal.status {
        BackupStatus::Completed => {
            tracing::info!(
                files = terminal.files_done,
                bytes = terminal.bytes_done,
                "backup complete"
            );
            Ok(())
        }
        BackupStatus::Cancelled => bail!("backup cancelled"),
        _ => bail!("backup failed: {}", terminal.errors.join("; ")),
    }
}

async fn run_migration(
    coordinator: Arc<MigrationCoordinator>,
    config: MigrationConfig,
) -> Result<()> {
    let problems = coordinator.validate(&config);
    if !problems.is_empty() {
        bail!("invalid configuration: {}", problems.join("; "));
    }
    let mut rx = coordinator.subscribe();
    if !coordinator.start(config) {
        bail!("migration did not start");
    }

    let canceller = coordinator.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling");
            canceller.cancel();
        }
    });

    let mut last_phase = None;
    let mut last_step = 0u64;
    loop {
        let snapshot = match rx.recv().await {
            Ok(snapshot) => snapshot,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => coordinator.progress(),
        };
        let step = snapshot.overall_percent as u64 / 5;
        if snapshot.phase != last_phase || step > last_step {
            let phase = snapshot
                .phase
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string());
            tracing::info!(
                "[{phase}] {:5.1}% {}",
                snapshot.overall_percent,
                snapshot.message
            );
            last_phase = snapshot.phase;
            last_step = step;
        }
        if snapshot.state.is_terminal() {
            break;
        }
    }

    // Closed channel without a stored result would be a worker abort.
    let result = match coordinator.last_result() {
        Some(result) => result,
        None => bail!("migration ended without a result"),
    };
    for warning in &result.warnings {
        tracing::warn!("{warning}");
    }
    println!("{}", result.report()?);
    match result.state {
        MigrationState::Completed => Ok(()),
        MigrationState::Cancelled => bail!("{} cancelled", result.mode),
        _ => bail!("{} failed: {}", result.mode, result.errors.join("; ")),
    }
}

async fn run_peers(ctx: Arc<ToolkitContext>, wait: u64) {
    let discovery = DiscoveryService::new(ctx, PeerRole::Standalone);
    let mut events = discovery.subscribe();
    tokio::spawn(discovery.clone().run());

    let deadline = tokio::time::sleep(Duration::from_secs(wait));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(mediashift_core::net::DiscoveryEvent::Discovered(peer)) => {
                    tracing::info!(ip = %peer.ip, port = peer.port, "peer discovered");
                }
                Ok(mediashift_core::net::DiscoveryEvent::Lost(peer)) => {
                    tracing::info!(ip = %peer.ip, port = peer.port, "peer lost");
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    discovery.stop();

    let peers = discovery.peers();
    if peers.is_empty() {
        println!("no peers found");
        return;
    }
    println!(
        "{:<16} {:>6} {:<20} {:<10} {:<8} {:<8}",
        "ADDRESS", "PORT", "HOSTNAME", "ROLE", "TOOLKIT", "APP"
    );
    for peer in peers {
        println!(
            "{:<16} {:>6} {:<20} {:<10} {:<8} {:<8}",
            peer.ip,
            peer.port,
            peer.hostname.as_deref().unwrap_or("-"),
            peer.role.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string()),
            if peer.has_toolkit { "yes" } else { "-" },
            if peer.has_app { "yes" } else { "-" },
        );
    }
}
