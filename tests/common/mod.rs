#![allow(dead_code)]

//! In-memory stand-ins for the service supervisor and the engine tools.
//!
//! A fake cluster is a directory holding the usual markers plus a `fake_catalog` file listing
//! its databases, one per line.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::time::Duration;

use cluster_migrate::cluster::ClusterTools;
use cluster_migrate::command::{CommandRunner, ToolCommand, ToolOutput};
use cluster_migrate::config::{
    ClusterLayout, EngineConfig, HealthConfig, CONFIG_MARKER, LISTEN_ADDRESSES, VERSION_MARKER,
};
use cluster_migrate::error::ToolStatus;
use cluster_migrate::service::{ServiceController, ServiceState, ServiceStatus};
use cluster_migrate::space::VolumeStats;
use cluster_migrate::{Config, EngineVersion, Error, MigrationOrchestrator, MigrationRequest};

pub const CATALOG: &str = "fake_catalog";

pub fn init_tracing() {
    static INIT_TRACING: Once = Once::new();
    INIT_TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

pub fn make_data_dir(path: &Path, version: &str, databases: &[&str]) {
    fs::create_dir_all(path.join("base/1")).unwrap();
    fs::write(path.join(VERSION_MARKER), format!("{version}\n")).unwrap();
    fs::write(path.join(CONFIG_MARKER), "port = 5432\n").unwrap();
    fs::write(path.join("base/1/1259"), vec![1u8; 4096]).unwrap();
    write_catalog(path, &databases.iter().map(|s| s.to_string()).collect());
}

pub fn read_catalog(data_dir: &Path) -> BTreeSet<String> {
    fs::read_to_string(data_dir.join(CATALOG))
        .unwrap_or_default()
        .lines()
        .map(String::from)
        .collect()
}

fn write_catalog(data_dir: &Path, dbs: &BTreeSet<String>) {
    let contents: String = dbs.iter().map(|db| format!("{db}\n")).collect();
    fs::write(data_dir.join(CATALOG), contents).unwrap();
}

/// Every file and directory under `root`, with file contents.
pub fn snapshot(root: &Path) -> BTreeMap<PathBuf, Option<Vec<u8>>> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .map(|entry| {
            let entry = entry.unwrap();
            let contents = entry
                .file_type()
                .is_file()
                .then(|| fs::read(entry.path()).unwrap());
            (entry.path().to_path_buf(), contents)
        })
        .collect()
}

#[derive(Default)]
pub struct FakeServices {
    running: Mutex<BTreeSet<String>>,
    settings: Mutex<HashMap<(String, String), String>>,
    /// Running but never answering.
    pub unresponsive: Mutex<BTreeSet<String>>,
    pub calls: Mutex<Vec<String>>,
    /// `listen_addresses` each start of a service came up with.
    started_with: Mutex<Vec<(String, Option<String>)>>,
}

impl FakeServices {
    pub fn set(&self, service: &str, key: &str, value: &str) {
        self.settings
            .lock()
            .unwrap()
            .insert((service.to_string(), key.to_string()), value.to_string());
    }

    pub fn get(&self, service: &str, key: &str) -> Option<String> {
        self.settings
            .lock()
            .unwrap()
            .get(&(service.to_string(), key.to_string()))
            .cloned()
    }

    pub fn mark_running(&self, service: &str) {
        self.running.lock().unwrap().insert(service.to_string());
    }

    pub fn is_running(&self, service: &str) -> bool {
        self.running.lock().unwrap().contains(service)
    }

    pub fn called(&self, call: &str) -> bool {
        self.calls.lock().unwrap().iter().any(|c| c == call)
    }

    /// What the running process of `service` listens on, as of its last start.
    pub fn live_listen(&self, service: &str) -> Option<String> {
        self.started_with
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(s, _)| s == service)
            .and_then(|(_, listen)| listen.clone())
    }
}

#[async_trait]
impl ServiceController for FakeServices {
    async fn start(&self, service: &str) -> cluster_migrate::Result<()> {
        self.calls.lock().unwrap().push(format!("start {service}"));
        let listen = self.get(service, LISTEN_ADDRESSES);
        self.started_with
            .lock()
            .unwrap()
            .push((service.to_string(), listen));
        self.mark_running(service);
        Ok(())
    }

    async fn stop(&self, service: &str) -> cluster_migrate::Result<()> {
        self.calls.lock().unwrap().push(format!("stop {service}"));
        self.running.lock().unwrap().remove(service);
        Ok(())
    }

    async fn status(&self, service: &str) -> cluster_migrate::Result<ServiceStatus> {
        let running = self.is_running(service);
        Ok(ServiceStatus {
            state: if running {
                ServiceState::Running
            } else {
                ServiceState::Stopped
            },
            responding: running && !self.unresponsive.lock().unwrap().contains(service),
        })
    }

    async fn read_setting(&self, service: &str, key: &str) -> cluster_migrate::Result<String> {
        self.get(service, key).ok_or_else(|| Error::Service {
            service: service.to_string(),
            reason: format!("no setting `{key}`"),
        })
    }

    async fn write_setting(
        &self,
        service: &str,
        key: &str,
        value: &str,
    ) -> cluster_migrate::Result<()> {
        self.set(service, key, value);
        Ok(())
    }
}

fn tool_error(tool: &str, stderr: &str) -> Error {
    Error::ExternalTool {
        tool: tool.to_string(),
        status: ToolStatus::Exited(1),
        stderr: stderr.to_string(),
    }
}

pub struct FakeTools {
    version: String,
    pub failing_dumps: Mutex<BTreeSet<String>>,
}

impl FakeTools {
    fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
            failing_dumps: Mutex::default(),
        }
    }
}

#[async_trait]
impl ClusterTools for FakeTools {
    async fn initdb(
        &self,
        data_dir: &Path,
        _encoding: &str,
        _locale: Option<&str>,
    ) -> cluster_migrate::Result<()> {
        make_data_dir(data_dir, &self.version, &["postgres"]);
        Ok(())
    }

    async fn execute(
        &self,
        cluster: &ClusterLayout,
        _database: &str,
        sql: &str,
    ) -> cluster_migrate::Result<()> {
        if !cluster.data_dir.join(CATALOG).exists() {
            return Err(tool_error("psql", "could not connect"));
        }
        let mut dbs = read_catalog(&cluster.data_dir);
        let words: Vec<_> = sql.split_whitespace().collect();
        match words.as_slice() {
            ["CREATE", "DATABASE", name, ..] => {
                if !dbs.insert(name.trim_matches('"').to_string()) {
                    return Err(tool_error("psql", "database already exists"));
                }
            }
            ["DROP", "DATABASE", name] => {
                if !dbs.remove(name.trim_matches('"')) {
                    return Err(tool_error("psql", "database does not exist"));
                }
            }
            _ => (),
        }
        write_catalog(&cluster.data_dir, &dbs);
        Ok(())
    }

    async fn list_databases(
        &self,
        cluster: &ClusterLayout,
    ) -> cluster_migrate::Result<BTreeSet<String>> {
        if !cluster.data_dir.join(CATALOG).exists() {
            return Err(tool_error("psql", "could not connect"));
        }
        Ok(read_catalog(&cluster.data_dir))
    }

    async fn dump(
        &self,
        cluster: &ClusterLayout,
        database: &str,
        dest: &Path,
    ) -> cluster_migrate::Result<()> {
        if self.failing_dumps.lock().unwrap().contains(database)
            || !read_catalog(&cluster.data_dir).contains(database)
        {
            return Err(tool_error("pg_dump", "permission denied"));
        }
        fs::write(dest, database).unwrap();
        Ok(())
    }

    async fn restore(
        &self,
        _cluster: &ClusterLayout,
        database: &str,
        dump: &Path,
    ) -> cluster_migrate::Result<()> {
        assert_eq!(fs::read_to_string(dump).unwrap(), database);
        Ok(())
    }
}

/// Answers `pg_upgrade` by carrying the catalog over from `-d` to `-D`.
#[derive(Default)]
pub struct FakeRunner {
    pub fail_upgrade: AtomicBool,
    pub seen: Mutex<Vec<ToolCommand>>,
}

impl FakeRunner {
    pub fn upgrades(&self) -> Vec<ToolCommand> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.tool_name() == "pg_upgrade")
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, cmd: &ToolCommand) -> cluster_migrate::Result<ToolOutput> {
        self.seen.lock().unwrap().push(cmd.clone());
        let mut output = ToolOutput {
            tool: cmd.tool_name(),
            status: ToolStatus::Exited(0),
            stdout: String::new(),
            stderr: String::new(),
        };

        if cmd.tool_name() == "pg_upgrade" {
            if self.fail_upgrade.load(Ordering::SeqCst) {
                output.status = ToolStatus::Exited(1);
                output.stderr = "old cluster is not shut down cleanly".to_string();
                return Ok(output);
            }
            let old = Path::new(cmd.flag_value("-d").unwrap());
            let new = Path::new(cmd.flag_value("-D").unwrap());
            assert_eq!(fs::read_to_string(new.join(VERSION_MARKER)).unwrap(), "9.2\n");
            fs::copy(old.join(CATALOG), new.join(CATALOG)).unwrap();
        }

        Ok(output)
    }
}

/// Every path is on one volume, except those under `other_volume`.
pub struct FakeVolumes {
    pub free: AtomicU64,
    pub other_volume: Mutex<Option<PathBuf>>,
}

impl VolumeStats for FakeVolumes {
    fn free_bytes(&self, _path: &Path) -> cluster_migrate::Result<u64> {
        Ok(self.free.load(Ordering::SeqCst))
    }

    fn device(&self, path: &Path) -> cluster_migrate::Result<u64> {
        let other = self.other_volume.lock().unwrap();
        Ok(match *other {
            Some(ref mount) if path.starts_with(mount) => 2,
            _ => 1,
        })
    }
}

/// A temporary host with a legacy location, a target root and fake collaborators.
pub struct Host {
    pub dir: TempDir,
    pub services: Arc<FakeServices>,
    pub tools: Arc<FakeTools>,
    pub runner: Arc<FakeRunner>,
    pub volumes: Arc<FakeVolumes>,
    pub purge_allowed: bool,
}

impl Host {
    pub fn new() -> Self {
        init_tracing();
        Self {
            dir: tempfile::tempdir().unwrap(),
            services: Arc::default(),
            tools: Arc::new(FakeTools::new("9.2")),
            runner: Arc::default(),
            volumes: Arc::new(FakeVolumes {
                free: AtomicU64::new(100 << 30),
                other_volume: Mutex::default(),
            }),
            purge_allowed: false,
        }
    }

    pub fn legacy_root(&self) -> PathBuf {
        self.dir.path().join("legacy")
    }

    pub fn target_root(&self) -> PathBuf {
        self.dir.path().join("target")
    }

    pub fn config(&self) -> Config {
        let request = MigrationRequest {
            source_root: self.legacy_root(),
            target_root: self.target_root(),
            purge_allowed: self.purge_allowed,
            declared_source_version: None,
        };
        let engine = EngineConfig {
            current_version: EngineVersion::new(9, 2),
            bin_dir: "/opt/pg/9.2/bin".into(),
            legacy_bin_dirs: BTreeMap::from([(
                EngineVersion::new(9, 1),
                PathBuf::from("/opt/pg/9.1/bin"),
            )]),
        };
        let mut config = Config::new(request, engine);
        config.health = HealthConfig {
            max_attempts: 3,
            interval: Duration::from_millis(5),
        };
        config
    }

    pub fn orchestrator(&self) -> MigrationOrchestrator {
        MigrationOrchestrator::new(
            self.config(),
            self.services.clone(),
            self.tools.clone(),
            self.runner.clone(),
            self.volumes.clone(),
        )
    }
}
