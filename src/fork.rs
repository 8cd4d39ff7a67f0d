//! Splitting the server-owned databases out of the customer cluster.

use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cluster::{quote_ident, ClusterTools, MAINTENANCE_DB};
use crate::config::{ClusterLayout, ClusterRole, Config, LISTEN_ADDRESSES};
use crate::error::Error;
use crate::health::HealthPoller;
use crate::outcome::Diagnostic;
use crate::probe::{self, DataDirectory, DirState};
use crate::relocate::{Owner, Relocator};
use crate::service::{self, ServiceController};

type Result<T> = crate::Result<T>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkMode {
    /// Initialize a new server services cluster.
    Fresh,
    /// Reuse the server services cluster left by an interrupted fork.
    Resume,
}

/// Written next to the server services data directory once a fork ran to completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkStamp {
    pub completed_at: DateTime<Utc>,
    /// Databases copied out of the customer cluster.
    pub moved: BTreeSet<String>,
    /// Databases that did not exist in the customer cluster and were created empty.
    pub created: BTreeSet<String>,
    pub warnings: usize,
}

impl ForkStamp {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(Error::io(path))?;
        Ok(serde_json::from_slice(&data)?)
    }
}

#[derive(Debug)]
pub struct ForkReport {
    pub server_services: DataDirectory,
    pub stamp: ForkStamp,
    pub diagnostics: Vec<Diagnostic>,
}

pub struct DatasetForker<'a> {
    config: &'a Config,
    services: &'a dyn ServiceController,
    tools: &'a dyn ClusterTools,
    owner: Option<Owner>,
    relocator: Relocator,
    health: HealthPoller,
}

impl<'a> DatasetForker<'a> {
    pub fn new(
        config: &'a Config,
        services: &'a dyn ServiceController,
        tools: &'a dyn ClusterTools,
        owner: Option<Owner>,
    ) -> Self {
        Self {
            config,
            services,
            tools,
            owner,
            relocator: Relocator,
            health: HealthPoller::new(config.health),
        }
    }

    /// Moves every database named by the fork spec from the customer cluster into the server
    /// services cluster.
    ///
    /// Only isolating the customer cluster and bringing up the server services cluster can fail
    /// the fork. Everything after that is per database and ends up in the report's diagnostics;
    /// a database that could not be copied is never dropped from the customer cluster.
    #[tracing::instrument(skip(self))]
    pub async fn fork(&self, mode: ForkMode) -> Result<ForkReport> {
        let layout = &self.config.layout;
        let customer = &layout.customer;
        let server = &layout.server_services;
        let spec = &self.config.fork_spec;
        let mut diagnostics = Vec::new();

        tracing::info!("step 1/6: isolating the customer cluster");
        service::ensure_setting(self.services, &customer.service, LISTEN_ADDRESSES, "").await?;
        service::restart(self.services, &customer.service).await?;
        self.health.wait_for_cluster(self.services, customer).await?;

        tracing::info!("step 2/6: bringing up the server services cluster ({mode:?})");
        let server_services = self.prepare_server_cluster(mode).await?;
        service::point_at(self.services, server).await?;
        if !self.services.status(&server.service).await?.is_running() {
            self.services.start(&server.service).await?;
        }
        self.health.wait_for_cluster(self.services, server).await?;

        tracing::info!("step 3/6: provisioning roles");
        for statement in &spec.role_provisioning_statements {
            if let Err(e) = self.tools.execute(server, MAINTENANCE_DB, statement).await {
                diagnostics.push(Diagnostic::warning(format!(
                    "role provisioning `{statement}` failed: {e}"
                )));
            }
        }

        let customer_dbs = self.tools.list_databases(customer).await?;
        let server_dbs = self.tools.list_databases(server).await?;

        tracing::info!("step 4/6 and 5/6: creating and copying databases");
        let dumps_dir = layout.dumps_dir();
        self.relocator
            .ensure_owned_directory(&dumps_dir, self.owner, 0o700)
            .await?;
        let mut moved = BTreeSet::new();
        let mut created = BTreeSet::new();
        for (db, owner) in &spec.databases {
            let in_customer = customer_dbs.contains(db);
            if server_dbs.contains(db) {
                if !in_customer {
                    tracing::info!("`{db}` already lives in the server services cluster");
                    continue;
                }
                // left by an interrupted fork; the customer copy is authoritative until dropped
                let sql = format!("DROP DATABASE {}", quote_ident(db));
                if let Err(e) = self.tools.execute(server, MAINTENANCE_DB, &sql).await {
                    diagnostics.push(Diagnostic::warning(format!(
                        "could not drop stale copy of `{db}` from server services: {e}"
                    )));
                    continue;
                }
            }

            let create = format!(
                "CREATE DATABASE {} OWNER {}",
                quote_ident(db),
                quote_ident(owner)
            );
            if let Err(e) = self.tools.execute(server, MAINTENANCE_DB, &create).await {
                diagnostics.push(Diagnostic::warning(format!(
                    "could not create `{db}` in server services: {e}"
                )));
                continue;
            }

            if !in_customer {
                created.insert(db.clone());
                continue;
            }

            match self.copy_database(db, &dumps_dir).await {
                Ok(()) => {
                    moved.insert(db.clone());
                }
                Err(e) => diagnostics.push(Diagnostic::warning(format!(
                    "could not copy `{db}`, it stays in the customer cluster: {e}"
                ))),
            }
        }

        tracing::info!("step 6/6: removing forked databases and roles from the customer cluster");
        for db in &moved {
            let sql = format!("DROP DATABASE {}", quote_ident(db));
            if let Err(e) = self.tools.execute(customer, MAINTENANCE_DB, &sql).await {
                diagnostics.push(Diagnostic::warning(format!(
                    "could not drop `{db}` from the customer cluster: {e}"
                )));
            }
        }
        for role in &spec.roles {
            let sql = format!("DROP ROLE IF EXISTS {}", quote_ident(role));
            if let Err(e) = self.tools.execute(customer, MAINTENANCE_DB, &sql).await {
                diagnostics.push(Diagnostic::warning(format!(
                    "could not drop role `{role}` from the customer cluster: {e}"
                )));
            }
        }

        self.recount(&mut diagnostics).await;

        let stamp = ForkStamp {
            completed_at: Utc::now(),
            moved,
            created,
            warnings: diagnostics.len(),
        };
        write_stamp(&layout.fork_stamp(), &stamp).await?;
        tracing::info!(
            "fork complete: {} moved, {} created, {} warning(s)",
            stamp.moved.len(),
            stamp.created.len(),
            stamp.warnings
        );

        Ok(ForkReport {
            server_services,
            stamp,
            diagnostics,
        })
    }

    async fn prepare_server_cluster(&self, mode: ForkMode) -> Result<DataDirectory> {
        let layout = &self.config.layout;
        let server = &layout.server_services;
        self.relocator
            .ensure_cluster_directories(server, self.owner)
            .await?;

        let state = probe::inspect(&server.data_dir, Some(ClusterRole::ServerServices))?;
        match (mode, state) {
            (ForkMode::Resume, DirState::Marked(existing)) => return Ok(existing),
            (ForkMode::Resume, _) => {
                return Err(Error::validation(
                    &server.data_dir,
                    "no server services cluster to resume",
                ))
            }
            (ForkMode::Fresh, DirState::Missing) => (),
            (ForkMode::Fresh, DirState::Empty) => {
                tokio::fs::remove_dir(&server.data_dir)
                    .await
                    .map_err(Error::io(&server.data_dir))?;
            }
            (ForkMode::Fresh, DirState::Unmarked(path)) => {
                self.relocator.move_aside(&path).await?;
            }
            (ForkMode::Fresh, DirState::Marked(existing)) => {
                self.relocator.move_aside(&existing.path).await?;
            }
        }

        let staging = layout.staging_dir(ClusterRole::ServerServices);
        self.initialize_staging(&staging).await?;
        self.relocator.promote(&staging, &server.data_dir).await?;

        match probe::inspect(&server.data_dir, Some(ClusterRole::ServerServices))? {
            DirState::Marked(dir) => Ok(dir),
            _ => Err(Error::validation(
                &server.data_dir,
                "initialized cluster has no version marker",
            )),
        }
    }

    /// Runs `initdb` into a fresh staging directory, moving aside whatever an earlier run left
    /// there.
    pub(crate) async fn initialize_staging(&self, staging: &Path) -> Result<()> {
        let scratch = &self.config.layout.scratch_dir;
        self.relocator
            .ensure_owned_directory(scratch, self.owner, 0o700)
            .await?;
        self.relocator.make_room(staging).await?;
        self.relocator
            .ensure_owned_directory(staging, self.owner, 0o700)
            .await?;

        self.tools
            .initdb(
                staging,
                &self.config.encoding,
                self.config.locale.as_deref(),
            )
            .await
    }

    async fn copy_database(&self, db: &str, dumps_dir: &Path) -> Result<()> {
        let layout = &self.config.layout;
        let dump = dumps_dir.join(format!("{db}.dump"));
        self.relocator.make_room(&dump).await?;

        self.tools.dump(&layout.customer, db, &dump).await?;
        self.tools
            .restore(&layout.server_services, db, &dump)
            .await?;
        tracing::info!("copied `{db}` to the server services cluster");

        // scratch artifact; kept on failure for inspection
        if let Err(e) = tokio::fs::remove_file(&dump).await {
            tracing::debug!("could not remove `{}`: {e}", dump.display());
        }

        Ok(())
    }

    async fn list_or_warn(
        &self,
        cluster: &ClusterLayout,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Option<BTreeSet<String>> {
        match self.tools.list_databases(cluster).await {
            Ok(dbs) => Some(dbs),
            Err(e) => {
                diagnostics.push(Diagnostic::warning(format!(
                    "could not recount {} databases: {e}",
                    cluster.role
                )));
                None
            }
        }
    }

    async fn recount(&self, diagnostics: &mut Vec<Diagnostic>) {
        let layout = &self.config.layout;
        let spec = &self.config.fork_spec;

        if let Some(dbs) = self.list_or_warn(&layout.server_services, diagnostics).await {
            for db in spec.database_names().filter(|db| !dbs.contains(*db)) {
                diagnostics.push(Diagnostic::warning(format!(
                    "`{db}` is missing from the server services cluster"
                )));
            }
        }
        if let Some(dbs) = self.list_or_warn(&layout.customer, diagnostics).await {
            for db in spec.database_names().filter(|db| dbs.contains(*db)) {
                diagnostics.push(Diagnostic::warning(format!(
                    "`{db}` is still present in the customer cluster"
                )));
            }
        }
    }
}

async fn write_stamp(path: &Path, stamp: &ForkStamp) -> Result<()> {
    let data = serde_json::to_vec_pretty(stamp)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, data).await.map_err(Error::io(&tmp))?;
    tokio::fs::rename(&tmp, path).await.map_err(Error::io(path))?;

    Ok(())
}
