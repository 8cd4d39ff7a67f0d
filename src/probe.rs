//! Read-only classification of the data directories found on the host.

use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::config::{ClusterRole, Config, CONFIG_MARKER, VERSION_MARKER};
use crate::error::Error;
use crate::space::VolumeStats;
use crate::version::EngineVersion;

type Result<T> = crate::Result<T>;

/// One physical data set. Discovered on disk, never assumed.
#[derive(Debug, Clone)]
pub struct DataDirectory {
    pub path: PathBuf,
    pub version: Option<EngineVersion>,
    pub role: Option<ClusterRole>,
    size: OnceCell<u64>,
}

impl DataDirectory {
    pub fn new(path: PathBuf, version: Option<EngineVersion>, role: Option<ClusterRole>) -> Self {
        Self {
            path,
            version,
            role,
            size: OnceCell::new(),
        }
    }

    /// Total size of the files under the directory, computed on first use.
    pub async fn size_bytes(&self) -> Result<u64> {
        self.size
            .get_or_try_init(|| crate::space::tree_size(self.path.clone()))
            .await
            .copied()
    }

    pub(crate) fn with_role(mut self, role: ClusterRole) -> Self {
        self.role = Some(role);
        self
    }
}

/// What we found at a location that is supposed to hold a data directory.
#[derive(Debug, Clone)]
pub enum DirState {
    Missing,
    Empty,
    /// Non-empty, but without a version marker.
    Unmarked(PathBuf),
    Marked(DataDirectory),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// The legacy directory lives on the same volume as the target root.
    SameVolume,
    AlternateVolume,
}

#[derive(Debug, Clone)]
pub enum MigrationState {
    Absent,
    LegacyPresent {
        legacy: DataDirectory,
        placement: Placement,
    },
    BothNewPresent {
        customer: DataDirectory,
        server_services: DataDirectory,
    },
    ServerServicesOnlyPartial {
        customer: DataDirectory,
        server_services: DirState,
    },
}

/// Read-only view of which databases a running cluster holds.
#[async_trait]
pub trait ClusterCatalog: Send + Sync {
    /// `None` when the cluster is not answering.
    async fn databases(&self, role: ClusterRole) -> Option<BTreeSet<String>>;
}

/// Catalog for when no cluster can be queried.
pub struct NoCatalog;

#[async_trait]
impl ClusterCatalog for NoCatalog {
    async fn databases(&self, _role: ClusterRole) -> Option<BTreeSet<String>> {
        None
    }
}

/// Reads the version marker in `dir`. `Ok(None)` when there is no marker; an unreadable or
/// malformed marker is an error, never a guess.
pub fn read_marker(dir: &Path) -> Result<Option<EngineVersion>> {
    let marker = dir.join(VERSION_MARKER);
    let contents = match fs::read_to_string(&marker) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(Error::validation(
                marker,
                format!("unreadable version marker: {e}"),
            ))
        }
    };

    contents
        .parse::<EngineVersion>()
        .map(Some)
        .map_err(|e| Error::validation(marker, e.to_string()))
}

pub fn inspect(dir: &Path, role: Option<ClusterRole>) -> Result<DirState> {
    let mut entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(DirState::Missing),
        Err(e) => {
            return Err(Error::validation(
                dir,
                format!("unreadable data directory: {e}"),
            ))
        }
    };
    if entries.next().is_none() {
        return Ok(DirState::Empty);
    }

    match read_marker(dir)? {
        Some(version) => {
            if !dir.join(CONFIG_MARKER).is_file() {
                return Err(Error::validation(
                    dir,
                    format!("version marker present but `{CONFIG_MARKER}` is missing"),
                ));
            }
            Ok(DirState::Marked(DataDirectory::new(
                dir.to_path_buf(),
                Some(version),
                role,
            )))
        }
        None => Ok(DirState::Unmarked(dir.to_path_buf())),
    }
}

pub struct PathProbe<'a> {
    config: &'a Config,
    volumes: &'a dyn VolumeStats,
}

impl<'a> PathProbe<'a> {
    pub fn new(config: &'a Config, volumes: &'a dyn VolumeStats) -> Self {
        Self { config, volumes }
    }

    pub async fn classify(&self, catalog: &dyn ClusterCatalog) -> Result<MigrationState> {
        let layout = &self.config.layout;
        let current = self.config.engine.current_version;

        let in_place_legacy = match inspect(&layout.customer.data_dir, Some(ClusterRole::Customer))? {
            DirState::Marked(customer) if customer.version == Some(current) => {
                return self.classify_new(customer, catalog).await;
            }
            DirState::Marked(customer) => Some(customer),
            DirState::Unmarked(path) => {
                return Err(Error::validation(
                    path,
                    "customer data directory is not empty but has no version marker",
                ))
            }
            DirState::Missing | DirState::Empty => None,
        };

        let source = &self.config.request.source_root;
        let legacy = match (inspect(source, None)?, in_place_legacy) {
            (DirState::Marked(legacy), None) => legacy,
            (DirState::Marked(legacy), Some(in_place)) if legacy.path == in_place.path => legacy,
            (DirState::Marked(legacy), Some(in_place)) => {
                return Err(Error::validation(
                    &legacy.path,
                    format!(
                        "found legacy data both here and at `{}`",
                        in_place.path.display()
                    ),
                ))
            }
            (DirState::Unmarked(path), None) => {
                return Err(Error::validation(
                    path,
                    "legacy location is not empty but has no version marker",
                ))
            }
            (_, Some(in_place)) => in_place,
            (DirState::Missing | DirState::Empty, None) => match self.set_aside_customer()? {
                Some(aside) => {
                    tracing::warn!(
                        "customer data path is vacant, picking up `{}` moved aside by an earlier run",
                        aside.path.display()
                    );
                    aside
                }
                None => return Ok(MigrationState::Absent),
            },
        };

        self.validate_legacy(&legacy)?;
        let placement = self.placement(&legacy.path)?;

        Ok(MigrationState::LegacyPresent { legacy, placement })
    }

    async fn classify_new(
        &self,
        customer: DataDirectory,
        catalog: &dyn ClusterCatalog,
    ) -> Result<MigrationState> {
        let layout = &self.config.layout;
        let current = self.config.engine.current_version;
        let server = inspect(
            &layout.server_services.data_dir,
            Some(ClusterRole::ServerServices),
        )?;

        if let DirState::Marked(ref server_services) = server {
            if server_services.version != Some(current) {
                return Err(Error::validation(
                    &server_services.path,
                    format!(
                        "server services cluster is at version {}, expected {current}",
                        display_version(server_services.version)
                    ),
                ));
            }

            let stamped = layout.fork_stamp().is_file();
            if stamped && !self.fork_interrupted(catalog).await {
                return Ok(MigrationState::BothNewPresent {
                    customer,
                    server_services: server_services.clone(),
                });
            }
        }

        Ok(MigrationState::ServerServicesOnlyPartial {
            customer,
            server_services: server,
        })
    }

    /// A forked database still in the customer cluster but missing from server services means
    /// the last fork did not run to completion.
    async fn fork_interrupted(&self, catalog: &dyn ClusterCatalog) -> bool {
        let customer = catalog.databases(ClusterRole::Customer).await;
        let server = catalog.databases(ClusterRole::ServerServices).await;
        let (Some(customer), Some(server)) = (customer, server) else {
            return false;
        };

        self.config
            .fork_spec
            .database_names()
            .any(|db| customer.contains(db) && !server.contains(db))
    }

    fn validate_legacy(&self, legacy: &DataDirectory) -> Result<()> {
        let engine = &self.config.engine;
        let Some(version) = legacy.version else {
            return Err(Error::validation(&legacy.path, "missing version marker"));
        };

        if let Some(declared) = self.config.request.declared_source_version {
            if declared != version {
                return Err(Error::validation(
                    &legacy.path,
                    format!("declared source version {declared} but found {version}"),
                ));
            }
        }

        if version > engine.current_version {
            return Err(Error::validation(
                &legacy.path,
                format!(
                    "data is at version {version}, newer than {}",
                    engine.current_version
                ),
            ));
        }

        if engine.bin_dir_for(version).is_none() {
            return Err(Error::validation(
                &legacy.path,
                format!("no binaries configured for version {version}"),
            ));
        }

        Ok(())
    }

    /// The newest marked `data.<timestamp>` sibling of the customer data path. An upgrade that
    /// stopped between moving the old cluster aside and promoting the new one leaves only this.
    fn set_aside_customer(&self) -> Result<Option<DataDirectory>> {
        let data_dir = &self.config.layout.customer.data_dir;
        let (Some(parent), Some(name)) = (data_dir.parent(), data_dir.file_name()) else {
            return Ok(None);
        };
        let prefix = format!("{}.", name.to_string_lossy());
        let entries = match fs::read_dir(parent) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(parent)(e)),
        };

        let mut candidates = Vec::new();
        for entry in entries {
            let path = entry.map_err(Error::io(parent))?.path();
            let moved = path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with(&prefix));
            if moved && path.is_dir() {
                candidates.push(path);
            }
        }
        // timestamps sort lexically, and so do the `-<n>` suffixes after them
        candidates.sort_unstable_by(|a, b| b.cmp(a));

        for path in candidates {
            if let DirState::Marked(dir) = inspect(&path, None)? {
                return Ok(Some(dir));
            }
        }

        Ok(None)
    }

    fn placement(&self, legacy: &Path) -> Result<Placement> {
        let legacy_dev = self.volumes.device(legacy)?;
        let target_dev = self.volumes.device(&self.config.request.target_root)?;

        Ok(if legacy_dev == target_dev {
            Placement::SameVolume
        } else {
            Placement::AlternateVolume
        })
    }
}

/// Closest ancestor of `path` (itself included) that exists.
pub(crate) fn existing_ancestor(path: &Path) -> &Path {
    path.ancestors()
        .find(|p| p.exists())
        .unwrap_or_else(|| Path::new("/"))
}

fn display_version(version: Option<EngineVersion>) -> String {
    version.map_or_else(|| "unknown".to_string(), |v| v.to_string())
}
