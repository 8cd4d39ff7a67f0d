use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use bytesize::ByteSize;
use clap::Parser;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use cluster_migrate::cluster::PgTools;
use cluster_migrate::command::SystemRunner;
use cluster_migrate::config::{EngineConfig, ForkSpec, HealthConfig, HostLayout};
use cluster_migrate::relocate::Owner;
use cluster_migrate::service::ServerAdminController;
use cluster_migrate::space::StatvfsVolumes;
use cluster_migrate::{Config, EngineVersion, MigrationOrchestrator, MigrationRequest};

/// Database cluster migration tool
#[derive(Debug, Parser)]
#[command(name = "cluster-migrate")]
#[command(about = "Upgrades and forks database clusters", long_about = None)]
struct Cli {
    /// Where previous releases kept the data directory.
    #[clap(long, env = "CLUSTER_MIGRATE_SOURCE_ROOT")]
    source_root: PathBuf,
    /// Root of the new layout, holding both clusters and the scratch directory.
    #[clap(long, env = "CLUSTER_MIGRATE_TARGET_ROOT")]
    target_root: PathBuf,
    /// Delete the legacy data directory once the new one is in place.
    #[clap(long, env = "CLUSTER_MIGRATE_PURGE_LEGACY")]
    purge_legacy: bool,
    /// Refuse to run unless the legacy data is at this version.
    #[clap(long, env = "CLUSTER_MIGRATE_SOURCE_VERSION")]
    source_version: Option<EngineVersion>,

    /// Version of the installed engine.
    #[clap(long, env = "CLUSTER_MIGRATE_ENGINE_VERSION")]
    engine_version: EngineVersion,
    /// Binaries of the installed engine.
    #[clap(long, env = "CLUSTER_MIGRATE_BIN_DIR")]
    bin_dir: PathBuf,
    /// Binaries of a prior release, as `VERSION=PATH`. Repeatable.
    #[clap(long = "legacy-bin-dir", value_parser = parse_legacy_bin_dir)]
    legacy_bin_dirs: Vec<(EngineVersion, PathBuf)>,

    /// Account owning the data directories.
    #[clap(long, env = "CLUSTER_MIGRATE_DATA_OWNER")]
    data_owner: Option<String>,
    /// Superuser the engine tools connect as.
    #[clap(long, default_value = "postgres", env = "CLUSTER_MIGRATE_SUPERUSER")]
    superuser: String,
    #[clap(long, default_value = "UTF8", env = "CLUSTER_MIGRATE_ENCODING")]
    encoding: String,
    #[clap(long, env = "CLUSTER_MIGRATE_LOCALE")]
    locale: Option<String>,
    /// Customer `listen_addresses` when none was configured before the run.
    #[clap(
        long,
        default_value = "127.0.0.1,::1",
        env = "CLUSTER_MIGRATE_LISTEN_ADDRESSES"
    )]
    listen_addresses: String,

    /// Service-admin tool used to control both services.
    #[clap(
        long,
        default_value = "/usr/sbin/serveradmin",
        env = "CLUSTER_MIGRATE_SERVICE_TOOL"
    )]
    service_tool: PathBuf,
    #[clap(long, default_value = "postgres", env = "CLUSTER_MIGRATE_CUSTOMER_SERVICE")]
    customer_service: String,
    #[clap(
        long,
        default_value = "postgres_server",
        env = "CLUSTER_MIGRATE_SERVER_SERVICE"
    )]
    server_service: String,

    /// JSON file naming the databases and roles to fork.
    #[clap(long, env = "CLUSTER_MIGRATE_FORK_SPEC")]
    fork_spec: Option<PathBuf>,
    #[clap(long, default_value = "30", env = "CLUSTER_MIGRATE_HEALTH_ATTEMPTS")]
    health_attempts: u32,
    #[clap(long, default_value = "1000", env = "CLUSTER_MIGRATE_HEALTH_INTERVAL_MS")]
    health_interval_ms: u64,
    /// Free space to keep on top of what a copy needs.
    #[clap(long, default_value = "1GiB", env = "CLUSTER_MIGRATE_SAFETY_MARGIN")]
    safety_margin: ByteSize,

    /// Also write logs to this file.
    #[clap(long, env = "CLUSTER_MIGRATE_LOG_FILE")]
    log_file: Option<PathBuf>,
}

fn parse_legacy_bin_dir(s: &str) -> Result<(EngineVersion, PathBuf)> {
    let (version, path) = s
        .split_once('=')
        .context("expected `VERSION=PATH`")?;
    Ok((version.parse()?, PathBuf::from(path)))
}

impl Cli {
    fn config(self) -> Result<Config> {
        let request = MigrationRequest {
            source_root: self.source_root,
            target_root: self.target_root,
            purge_allowed: self.purge_legacy,
            declared_source_version: self.source_version,
        };
        let engine = EngineConfig {
            current_version: self.engine_version,
            bin_dir: self.bin_dir,
            legacy_bin_dirs: self.legacy_bin_dirs.into_iter().collect::<BTreeMap<_, _>>(),
        };

        let mut config = Config::new(request, engine);
        config.layout = HostLayout::new(
            &config.request.target_root,
            self.customer_service,
            self.server_service,
        );
        if let Some(path) = self.fork_spec {
            config.fork_spec = ForkSpec::from_file(&path)
                .with_context(|| format!("failed to load fork spec `{}`", path.display()))?;
        }
        config.data_owner = self.data_owner;
        config.encoding = self.encoding;
        config.locale = self.locale;
        config.default_listen_addresses = self.listen_addresses;
        config.health = HealthConfig {
            max_attempts: self.health_attempts,
            interval: Duration::from_millis(self.health_interval_ms),
        };
        config.safety_margin = self.safety_margin;

        Ok(config)
    }
}

fn init_tracing(log_file: Option<&PathBuf>) -> Result<()> {
    let writer = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file `{}`", path.display()))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    tracing_subscriber::fmt()
        .with_ansi(false)
        .with_writer(writer)
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    Ok(())
}

async fn run(cli: Cli) -> Result<bool> {
    init_tracing(cli.log_file.as_ref())?;
    let superuser = cli.superuser.clone();
    let service_tool = cli.service_tool.clone();
    let config = cli.config()?;

    let owner = config
        .data_owner
        .as_deref()
        .map(Owner::lookup)
        .transpose()?;
    let runner = Arc::new(SystemRunner);
    let services = Arc::new(ServerAdminController::new(service_tool, runner.clone()));
    let tools = Arc::new(PgTools::new(
        config.engine.bin_dir.clone(),
        superuser,
        owner,
        runner.clone(),
    ));

    let orchestrator =
        MigrationOrchestrator::new(config, services, tools, runner, Arc::new(StatvfsVolumes));
    let outcome = orchestrator.run().await;
    print!("{outcome}");

    Ok(outcome.is_success())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}
