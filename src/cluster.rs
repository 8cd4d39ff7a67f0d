//! Engine primitives: cluster initialization, SQL execution, dump and restore.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::command::{bin, CommandRunner, ToolCommand};
use crate::config::{ClusterLayout, ClusterRole, HostLayout};
use crate::probe::ClusterCatalog;
use crate::relocate::Owner;
use crate::service::ServiceController;

type Result<T> = crate::Result<T>;

/// Maintenance database every cluster has.
pub const MAINTENANCE_DB: &str = "postgres";

#[async_trait]
pub trait ClusterTools: Send + Sync {
    /// Initializes an empty cluster in `data_dir`.
    async fn initdb(&self, data_dir: &Path, encoding: &str, locale: Option<&str>) -> Result<()>;
    async fn execute(&self, cluster: &ClusterLayout, database: &str, sql: &str) -> Result<()>;
    async fn list_databases(&self, cluster: &ClusterLayout) -> Result<BTreeSet<String>>;
    /// Dumps `database` into the file at `dest`.
    async fn dump(&self, cluster: &ClusterLayout, database: &str, dest: &Path) -> Result<()>;
    /// Restores a dump produced by [`ClusterTools::dump`] into an existing `database`.
    async fn restore(&self, cluster: &ClusterLayout, database: &str, dump: &Path) -> Result<()>;
}

/// Quotes an SQL identifier.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// The engine's own command line tools, talking to clusters over their socket directories.
pub struct PgTools {
    bin_dir: PathBuf,
    superuser: String,
    owner: Option<Owner>,
    runner: Arc<dyn CommandRunner>,
}

impl PgTools {
    pub fn new(
        bin_dir: PathBuf,
        superuser: String,
        owner: Option<Owner>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            bin_dir,
            superuser,
            owner,
            runner,
        }
    }

    fn client(&self, tool: &str, cluster: &ClusterLayout) -> ToolCommand {
        ToolCommand::new(bin(&self.bin_dir, tool))
            .arg("-h")
            .arg(&cluster.socket_dir)
            .arg("-U")
            .arg(&self.superuser)
            .env("PGCONNECT_TIMEOUT", "10")
            .run_as(self.owner)
    }

    fn psql(&self, cluster: &ClusterLayout, database: &str) -> ToolCommand {
        self.client("psql", cluster)
            .args(["-X", "-q", "-v", "ON_ERROR_STOP=1", "-d", database])
    }
}

#[async_trait]
impl ClusterTools for PgTools {
    async fn initdb(&self, data_dir: &Path, encoding: &str, locale: Option<&str>) -> Result<()> {
        let mut cmd = ToolCommand::new(bin(&self.bin_dir, "initdb"))
            .arg("-E")
            .arg(encoding)
            .arg("-U")
            .arg(&self.superuser);
        if let Some(locale) = locale {
            cmd = cmd.arg(format!("--locale={locale}"));
        }
        let cmd = cmd.arg("-D").arg(data_dir).run_as(self.owner);

        tracing::info!("initializing cluster in `{}`", data_dir.display());
        self.runner.run(&cmd).await?.check().map(drop)
    }

    async fn execute(&self, cluster: &ClusterLayout, database: &str, sql: &str) -> Result<()> {
        let cmd = self.psql(cluster, database).arg("-c").arg(sql);
        self.runner.run(&cmd).await?.check().map(drop)
    }

    async fn list_databases(&self, cluster: &ClusterLayout) -> Result<BTreeSet<String>> {
        let cmd = self.psql(cluster, MAINTENANCE_DB).args([
            "-A",
            "-t",
            "-c",
            "SELECT datname FROM pg_database WHERE NOT datistemplate",
        ]);
        let output = self.runner.run(&cmd).await?.check()?;

        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn dump(&self, cluster: &ClusterLayout, database: &str, dest: &Path) -> Result<()> {
        let cmd = self
            .client("pg_dump", cluster)
            .args(["-F", "c", "-d", database])
            .stdout_to(dest);
        self.runner.run(&cmd).await?.check().map(drop)
    }

    async fn restore(&self, cluster: &ClusterLayout, database: &str, dump: &Path) -> Result<()> {
        let cmd = self
            .client("pg_restore", cluster)
            .args(["-d", database])
            .arg(dump);
        self.runner.run(&cmd).await?.check().map(drop)
    }
}

/// Asks running clusters for their databases, without starting anything.
pub struct LiveCatalog<'a> {
    pub services: &'a dyn ServiceController,
    pub tools: &'a dyn ClusterTools,
    pub layout: &'a HostLayout,
}

#[async_trait]
impl<'a> ClusterCatalog for LiveCatalog<'a> {
    async fn databases(&self, role: ClusterRole) -> Option<BTreeSet<String>> {
        let cluster = self.layout.cluster(role);
        match self.services.status(&cluster.service).await {
            Ok(status) if status.responding => (),
            _ => return None,
        }

        match self.tools.list_databases(cluster).await {
            Ok(dbs) => Some(dbs),
            Err(e) => {
                tracing::warn!("could not list {role} databases: {e}");
                None
            }
        }
    }
}
