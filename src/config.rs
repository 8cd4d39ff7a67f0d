use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::error::Error;
use crate::version::EngineVersion;

pub const VERSION_MARKER: &str = "PG_VERSION";
pub const CONFIG_MARKER: &str = "postgresql.conf";
pub const FORK_STAMP: &str = "fork.json";
pub const LISTEN_ADDRESSES: &str = "listen_addresses";
pub const DATA_DIR_SETTING: &str = "dataDir";
pub const SOCKET_DIR_SETTING: &str = "unix_socket_directories";
pub const LOG_DIR_SETTING: &str = "log_directory";

/// What the caller asks for. Built once per invocation and never mutated.
#[derive(Debug, Clone)]
pub struct MigrationRequest {
    /// Legacy data directory, as laid out by previous releases.
    pub source_root: PathBuf,
    /// Root under which both role clusters and the scratch directory live.
    pub target_root: PathBuf,
    /// Allow deleting the legacy data directory once the new one is verified.
    pub purge_allowed: bool,
    pub declared_source_version: Option<EngineVersion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterRole {
    Customer,
    ServerServices,
}

impl ClusterRole {
    fn dir_name(self) -> &'static str {
        match self {
            ClusterRole::Customer => "customer",
            ClusterRole::ServerServices => "server_services",
        }
    }
}

impl fmt::Display for ClusterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterRole::Customer => f.write_str("customer"),
            ClusterRole::ServerServices => f.write_str("server services"),
        }
    }
}

/// Where one role's cluster lives on disk and which service runs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterLayout {
    pub role: ClusterRole,
    pub service: String,
    pub root: PathBuf,
    pub data_dir: PathBuf,
    pub socket_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl ClusterLayout {
    fn new(role: ClusterRole, service: String, target_root: &Path) -> Self {
        let root = target_root.join(role.dir_name());
        Self {
            role,
            service,
            data_dir: root.join("data"),
            socket_dir: root.join("socket"),
            log_dir: root.join("logs"),
            root,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HostLayout {
    pub customer: ClusterLayout,
    pub server_services: ClusterLayout,
    /// Working directory of the upgrade helper; holds staging directories and dumps.
    pub scratch_dir: PathBuf,
}

impl HostLayout {
    pub fn new(target_root: &Path, customer_service: String, server_service: String) -> Self {
        Self {
            customer: ClusterLayout::new(ClusterRole::Customer, customer_service, target_root),
            server_services: ClusterLayout::new(
                ClusterRole::ServerServices,
                server_service,
                target_root,
            ),
            scratch_dir: target_root.join("migration"),
        }
    }

    pub fn cluster(&self, role: ClusterRole) -> &ClusterLayout {
        match role {
            ClusterRole::Customer => &self.customer,
            ClusterRole::ServerServices => &self.server_services,
        }
    }

    pub fn fork_stamp(&self) -> PathBuf {
        self.server_services.root.join(FORK_STAMP)
    }

    /// Where a role's data directory is built before it is promoted.
    pub fn staging_dir(&self, role: ClusterRole) -> PathBuf {
        self.scratch_dir.join(format!("{}-staging", role.dir_name()))
    }

    pub fn working_copy_dir(&self) -> PathBuf {
        self.scratch_dir.join("legacy-copy")
    }

    pub fn dumps_dir(&self) -> PathBuf {
        self.scratch_dir.join("dumps")
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub current_version: EngineVersion,
    pub bin_dir: PathBuf,
    /// Binaries of every prior release we know how to upgrade from.
    pub legacy_bin_dirs: BTreeMap<EngineVersion, PathBuf>,
}

impl EngineConfig {
    pub fn bin_dir_for(&self, version: EngineVersion) -> Option<&Path> {
        if version == self.current_version {
            Some(&self.bin_dir)
        } else {
            self.legacy_bin_dirs.get(&version).map(PathBuf::as_path)
        }
    }
}

/// Databases and roles that belong to the server-services cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkSpec {
    /// Database name to owning role.
    pub databases: BTreeMap<String, String>,
    pub roles: BTreeSet<String>,
    pub role_provisioning_statements: Vec<String>,
}

impl Default for ForkSpec {
    fn default() -> Self {
        let databases = [
            ("caldav", "caldav"),
            ("collab", "collab"),
            ("device_management", "_devicemgr"),
        ]
        .into_iter()
        .map(|(db, owner)| (db.to_string(), owner.to_string()))
        .collect();
        let roles = ["caldav", "collab", "_devicemgr"]
            .into_iter()
            .map(String::from)
            .collect();
        let role_provisioning_statements = vec![
            "CREATE ROLE caldav WITH LOGIN".to_string(),
            "CREATE ROLE collab WITH LOGIN".to_string(),
            "CREATE ROLE _devicemgr WITH LOGIN CREATEDB".to_string(),
        ];

        Self {
            databases,
            roles,
            role_provisioning_statements,
        }
    }
}

impl ForkSpec {
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let data = std::fs::read(path).map_err(Error::io(path))?;
        let spec: Self = serde_json::from_slice(&data)?;
        spec.validate(path)?;
        Ok(spec)
    }

    fn validate(&self, path: &Path) -> crate::Result<()> {
        for (db, owner) in &self.databases {
            if db.is_empty() {
                return Err(Error::validation(path, "empty database name"));
            }
            if !self.roles.contains(owner) {
                return Err(Error::validation(
                    path,
                    format!("owner `{owner}` of database `{db}` is not a forked role"),
                ));
            }
        }

        Ok(())
    }

    pub fn database_names(&self) -> impl Iterator<Item = &str> {
        self.databases.keys().map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HealthConfig {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub request: MigrationRequest,
    pub engine: EngineConfig,
    pub layout: HostLayout,
    pub fork_spec: ForkSpec,
    /// Account owning the data directories; `None` keeps the invoking user.
    pub data_owner: Option<String>,
    pub encoding: String,
    pub locale: Option<String>,
    pub default_listen_addresses: String,
    pub health: HealthConfig,
    pub safety_margin: ByteSize,
}

impl Config {
    pub fn new(request: MigrationRequest, engine: EngineConfig) -> Self {
        let layout = HostLayout::new(
            &request.target_root,
            "postgres".to_string(),
            "postgres_server".to_string(),
        );
        Self {
            request,
            engine,
            layout,
            fork_spec: ForkSpec::default(),
            data_owner: None,
            encoding: "UTF8".to_string(),
            locale: None,
            default_listen_addresses: "127.0.0.1,::1".to_string(),
            health: HealthConfig::default(),
            safety_margin: ByteSize::gib(1),
        }
    }
}
