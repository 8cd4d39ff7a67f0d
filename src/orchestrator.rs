//! Drives one migration run from classification to the final service configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cluster::{ClusterTools, LiveCatalog};
use crate::command::CommandRunner;
use crate::config::{ClusterLayout, ClusterRole, Config, LISTEN_ADDRESSES};
use crate::error::Error;
use crate::fork::{DatasetForker, ForkMode};
use crate::health::HealthPoller;
use crate::outcome::{Branch, Diagnostic, FinalState, MigrationOutcome, Phase};
use crate::probe::{self, DataDirectory, DirState, MigrationState, PathProbe, Placement};
use crate::relocate::{Owner, Relocator};
use crate::service::{self, ServiceController};
use crate::space::{SpaceBudgeter, VolumeStats};
use crate::upgrade::UpgradeInvoker;

type Result<T> = crate::Result<T>;

/// Bookkeeping for a single run, turned into a [`MigrationOutcome`] at the end.
#[derive(Debug)]
struct RunState {
    phase: Phase,
    branch: Option<Branch>,
    owner: Option<Owner>,
    /// Customer `listen_addresses` as found before anything was touched.
    remembered_listen: Option<String>,
    server_touched: bool,
    data_directories: BTreeMap<ClusterRole, DataDirectory>,
    legacy_directory: Option<PathBuf>,
    diagnostics: Vec<Diagnostic>,
}

impl RunState {
    fn new() -> Self {
        Self {
            phase: Phase::Start,
            branch: None,
            owner: None,
            remembered_listen: None,
            server_touched: false,
            data_directories: BTreeMap::new(),
            legacy_directory: None,
            diagnostics: Vec::new(),
        }
    }

    fn reach(&mut self, phase: Phase) {
        tracing::info!("reached {phase:?}");
        self.phase = phase;
    }
}

pub struct MigrationOrchestrator {
    config: Config,
    services: Arc<dyn ServiceController>,
    tools: Arc<dyn ClusterTools>,
    runner: Arc<dyn CommandRunner>,
    volumes: Arc<dyn VolumeStats>,
    relocator: Relocator,
}

impl MigrationOrchestrator {
    pub fn new(
        config: Config,
        services: Arc<dyn ServiceController>,
        tools: Arc<dyn ClusterTools>,
        runner: Arc<dyn CommandRunner>,
        volumes: Arc<dyn VolumeStats>,
    ) -> Self {
        Self {
            config,
            services,
            tools,
            runner,
            volumes,
            relocator: Relocator,
        }
    }

    /// Runs the migration. Never returns early: the customer service is brought back to a
    /// reachable state whatever happened before.
    pub async fn run(&self) -> MigrationOutcome {
        let mut state = RunState::new();
        let result = self.drive(&mut state).await;
        let finalized = self.finalize(&mut state).await;

        let (final_state, error) = match (result, finalized) {
            (Err(Error::AlreadyMigrated), Ok(())) => (FinalState::AlreadyDone, None),
            (Ok(()), Ok(())) => (FinalState::Success, None),
            (Ok(()) | Err(Error::AlreadyMigrated), Err(e)) => (FinalState::Failed, Some(e)),
            (Err(e), _) => {
                tracing::error!("migration aborted after {:?}: {e}", state.phase);
                (FinalState::Failed, Some(e))
            }
        };
        if final_state != FinalState::Failed {
            state.reach(Phase::Finalized);
        }

        MigrationOutcome {
            final_state,
            branch: state.branch,
            phase_reached: state.phase,
            data_directories: state.data_directories,
            legacy_directory: state.legacy_directory,
            diagnostics: state.diagnostics,
            error,
        }
    }

    async fn drive(&self, state: &mut RunState) -> Result<()> {
        let config = &self.config;
        let customer = &config.layout.customer;
        state.remembered_listen = match self
            .services
            .read_setting(&customer.service, LISTEN_ADDRESSES)
            .await
        {
            Ok(value) if !value.is_empty() => Some(value),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!("could not read customer listen addresses: {e}");
                None
            }
        };
        state.owner = config
            .data_owner
            .as_deref()
            .map(Owner::lookup)
            .transpose()?;

        let catalog = LiveCatalog {
            services: &*self.services,
            tools: &*self.tools,
            layout: &config.layout,
        };
        let classified = PathProbe::new(config, &*self.volumes).classify(&catalog).await?;
        state.reach(Phase::Classified);

        match classified {
            MigrationState::Absent => self.clean_install(state).await,
            MigrationState::LegacyPresent { legacy, placement } => {
                state.legacy_directory = Some(legacy.path.clone());
                if legacy.version == Some(config.engine.current_version) {
                    self.relocate_current(state, legacy).await
                } else {
                    match placement {
                        Placement::SameVolume => self.in_place_upgrade(state, legacy).await,
                        Placement::AlternateVolume => {
                            self.alternate_volume_upgrade(state, legacy).await
                        }
                    }
                }
            }
            MigrationState::BothNewPresent {
                customer,
                server_services,
            } => {
                state.branch = Some(Branch::AlreadyDone);
                tracing::info!("both clusters are current, nothing to migrate");
                state
                    .data_directories
                    .insert(ClusterRole::Customer, customer);
                state
                    .data_directories
                    .insert(ClusterRole::ServerServices, server_services);
                Err(Error::AlreadyMigrated)
            }
            MigrationState::ServerServicesOnlyPartial {
                customer,
                server_services,
            } => self.repair(state, customer, server_services).await,
        }
    }

    #[tracing::instrument(skip_all)]
    async fn clean_install(&self, state: &mut RunState) -> Result<()> {
        state.branch = Some(Branch::CleanInstall);
        tracing::info!("no data found, initializing a new customer cluster");
        state.reach(Phase::Preflighted);

        let customer = &self.config.layout.customer;
        self.relocator
            .ensure_cluster_directories(customer, state.owner)
            .await?;
        let staging = self.config.layout.staging_dir(ClusterRole::Customer);
        self.forker(state)
            .initialize_staging(&staging)
            .await?;
        let promoted = self.promote_customer(state, &staging).await?;
        state
            .data_directories
            .insert(ClusterRole::Customer, promoted);

        service::point_at(&*self.services, customer).await?;
        if !self.services.status(&customer.service).await?.is_running() {
            self.services.start(&customer.service).await?;
        }

        self.fork(state, ForkMode::Fresh).await
    }

    #[tracing::instrument(skip_all, fields(legacy = %legacy.path.display()))]
    async fn in_place_upgrade(&self, state: &mut RunState, legacy: DataDirectory) -> Result<()> {
        state.branch = Some(Branch::InPlaceUpgrade);
        let layout = &self.config.layout;

        // the working copy and the upgraded cluster both land on the legacy volume
        self.budgeter()
            .require(&legacy, &layout.scratch_dir, 2)
            .await?;
        state.reach(Phase::Preflighted);

        self.stop_customer().await?;
        self.prepare_scratch(state).await?;
        let working_copy = layout.working_copy_dir();
        self.relocator.make_room(&working_copy).await?;
        self.relocator
            .copy_preserving_metadata(&legacy.path, &working_copy)
            .await?;
        state.reach(Phase::Relocated);

        let upgraded = self.upgrade_into_customer(state, &working_copy, &legacy).await?;

        if let Err(e) = self.relocator.purge(&working_copy, &upgraded, true).await {
            state.diagnostics.push(Diagnostic::warning(format!(
                "could not discard working copy `{}`: {e}",
                working_copy.display()
            )));
        }

        self.point_and_fork(state).await?;
        self.purge_legacy(state, &upgraded).await
    }

    #[tracing::instrument(skip_all, fields(legacy = %legacy.path.display()))]
    async fn alternate_volume_upgrade(
        &self,
        state: &mut RunState,
        legacy: DataDirectory,
    ) -> Result<()> {
        state.branch = Some(Branch::AlternateVolumeUpgrade);
        self.budgeter()
            .require(&legacy, &self.config.layout.scratch_dir, 1)
            .await?;
        state.reach(Phase::Preflighted);

        self.stop_customer().await?;
        self.prepare_scratch(state).await?;
        state.reach(Phase::Relocated);

        let upgraded = self
            .upgrade_into_customer(state, &legacy.path, &legacy)
            .await?;

        self.point_and_fork(state).await?;
        self.purge_legacy(state, &upgraded).await
    }

    /// Legacy data already at the current version only needs to move.
    #[tracing::instrument(skip_all, fields(legacy = %legacy.path.display()))]
    async fn relocate_current(&self, state: &mut RunState, legacy: DataDirectory) -> Result<()> {
        state.branch = Some(Branch::Relocation);
        let layout = &self.config.layout;
        self.budgeter()
            .require(&legacy, &layout.scratch_dir, 1)
            .await?;
        state.reach(Phase::Preflighted);

        self.stop_customer().await?;
        self.prepare_scratch(state).await?;
        let staging = layout.staging_dir(ClusterRole::Customer);
        self.relocator.make_room(&staging).await?;
        self.relocator
            .copy_preserving_metadata(&legacy.path, &staging)
            .await?;
        self.verify_staging(&staging)?;
        let relocated = self.promote_customer(state, &staging).await?;
        state
            .data_directories
            .insert(ClusterRole::Customer, relocated.clone());
        state.reach(Phase::Relocated);

        self.point_and_fork(state).await?;
        self.purge_legacy(state, &relocated).await
    }

    #[tracing::instrument(skip_all)]
    async fn repair(
        &self,
        state: &mut RunState,
        customer: DataDirectory,
        server_services: DirState,
    ) -> Result<()> {
        state.branch = Some(Branch::RepairPriorFailure);
        state
            .data_directories
            .insert(ClusterRole::Customer, customer);
        state.reach(Phase::Preflighted);

        let mode = match server_services {
            DirState::Marked(_) => {
                tracing::info!("resuming the interrupted fork");
                ForkMode::Resume
            }
            DirState::Unmarked(ref path) => {
                tracing::warn!(
                    "server services directory `{}` holds no cluster, starting over",
                    path.display()
                );
                ForkMode::Fresh
            }
            DirState::Missing | DirState::Empty => ForkMode::Fresh,
        };

        service::point_at(&*self.services, &self.config.layout.customer).await?;
        self.fork(state, mode).await
    }

    /// Runs the upgrade helper from `old_dir` into a fresh staging directory and promotes the
    /// result into the customer path.
    async fn upgrade_into_customer(
        &self,
        state: &mut RunState,
        old_dir: &Path,
        legacy: &DataDirectory,
    ) -> Result<DataDirectory> {
        let config = &self.config;
        let layout = &config.layout;
        let old_version = legacy
            .version
            .ok_or_else(|| Error::validation(&legacy.path, "missing version marker"))?;
        let old_bin = config.engine.bin_dir_for(old_version).ok_or_else(|| {
            Error::validation(
                &legacy.path,
                format!("no binaries configured for version {old_version}"),
            )
        })?;

        let staging = layout.staging_dir(ClusterRole::Customer);
        self.forker(state).initialize_staging(&staging).await?;
        UpgradeInvoker::new(&*self.runner, &layout.scratch_dir)
            .upgrade(old_dir, &staging, old_bin, &config.engine.bin_dir)
            .await?;
        self.verify_staging(&staging)?;

        let upgraded = self.promote_customer(state, &staging).await?;
        state
            .data_directories
            .insert(ClusterRole::Customer, upgraded.clone());
        state.reach(Phase::Upgraded);

        Ok(upgraded)
    }

    fn verify_staging(&self, staging: &Path) -> Result<()> {
        let current = self.config.engine.current_version;
        match probe::inspect(staging, None)? {
            DirState::Marked(dir) if dir.version == Some(current) => Ok(()),
            DirState::Marked(dir) => Err(Error::validation(
                staging,
                format!(
                    "expected version {current}, found {}",
                    dir.version.map_or_else(|| "none".to_string(), |v| v.to_string())
                ),
            )),
            _ => Err(Error::validation(staging, "no cluster was produced")),
        }
    }

    /// Moves whatever occupies the customer data path aside and renames `staging` into it.
    async fn promote_customer(&self, state: &mut RunState, staging: &Path) -> Result<DataDirectory> {
        let customer = &self.config.layout.customer;
        let data_dir = &customer.data_dir;
        self.relocator
            .ensure_cluster_directories(customer, state.owner)
            .await?;

        match probe::inspect(data_dir, Some(ClusterRole::Customer)) {
            Ok(DirState::Missing) => (),
            Ok(DirState::Empty) => {
                tokio::fs::remove_dir(data_dir)
                    .await
                    .map_err(Error::io(data_dir))?;
            }
            // an unreadable directory is still moved, never deleted
            Ok(DirState::Unmarked(_) | DirState::Marked(_)) | Err(_) => {
                let aside = self.relocator.move_aside(data_dir).await?;
                if state.legacy_directory.as_deref() == Some(data_dir.as_path()) {
                    state.legacy_directory = Some(aside);
                }
            }
        }

        self.relocator.promote(staging, data_dir).await?;
        self.relocator
            .ensure_owned_directory(data_dir, state.owner, 0o700)
            .await?;

        Ok(DataDirectory::new(
            data_dir.clone(),
            Some(self.config.engine.current_version),
            Some(ClusterRole::Customer),
        ))
    }

    async fn point_and_fork(&self, state: &mut RunState) -> Result<()> {
        service::point_at(&*self.services, &self.config.layout.customer).await?;
        self.fork(state, ForkMode::Fresh).await
    }

    async fn fork(&self, state: &mut RunState, mode: ForkMode) -> Result<()> {
        state.server_touched = true;
        let report = self.forker(state).fork(mode).await?;
        state.diagnostics.extend(report.diagnostics);
        state.data_directories.insert(
            ClusterRole::ServerServices,
            report.server_services.with_role(ClusterRole::ServerServices),
        );
        state.reach(Phase::Forked);

        Ok(())
    }

    async fn purge_legacy(&self, state: &mut RunState, verified: &DataDirectory) -> Result<()> {
        let Some(legacy) = state.legacy_directory.clone() else {
            return Ok(());
        };
        match self
            .relocator
            .purge(&legacy, verified, self.config.request.purge_allowed)
            .await
        {
            Ok(true) => state.legacy_directory = None,
            Ok(false) => tracing::info!("legacy data kept at `{}`", legacy.display()),
            Err(e) => state.diagnostics.push(Diagnostic::warning(format!(
                "could not remove legacy data `{}`: {e}",
                legacy.display()
            ))),
        }

        Ok(())
    }

    async fn stop_customer(&self) -> Result<()> {
        let service = &self.config.layout.customer.service;
        if self.services.status(service).await?.is_running() {
            self.services.stop(service).await?;
        }

        Ok(())
    }

    async fn prepare_scratch(&self, state: &RunState) -> Result<()> {
        self.relocator
            .ensure_owned_directory(&self.config.layout.scratch_dir, state.owner, 0o700)
            .await
    }

    fn budgeter(&self) -> SpaceBudgeter<'_> {
        SpaceBudgeter::new(&*self.volumes, self.config.safety_margin)
    }

    fn forker(&self, state: &RunState) -> DatasetForker<'_> {
        DatasetForker::new(&self.config, &*self.services, &*self.tools, state.owner)
    }

    /// Leaves the customer cluster reachable and running, and the server services cluster running
    /// if this run touched it. Every step is attempted; the first failure is returned.
    async fn finalize(&self, state: &mut RunState) -> Result<()> {
        let layout = &self.config.layout;
        let listen = state
            .remembered_listen
            .clone()
            .unwrap_or_else(|| self.config.default_listen_addresses.clone());
        let mut first_error = None;

        let customer_steps = async {
            let changed = service::ensure_setting(
                &*self.services,
                &layout.customer.service,
                LISTEN_ADDRESSES,
                &listen,
            )
            .await?;
            self.ensure_running(&layout.customer, changed).await
        };
        if let Err(e) = customer_steps.await {
            state
                .diagnostics
                .push(Diagnostic::error(format!("customer cluster: {e}")));
            first_error.get_or_insert(e);
        }

        if state.server_touched {
            if let Err(e) = self.ensure_running(&layout.server_services, false).await {
                state
                    .diagnostics
                    .push(Diagnostic::error(format!("server services cluster: {e}")));
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Starts the cluster's service, or restarts it when `reload` says its settings changed
    /// under the running process, then waits for it to answer.
    async fn ensure_running(&self, cluster: &ClusterLayout, reload: bool) -> Result<()> {
        let running = match self.services.status(&cluster.service).await {
            Ok(status) => status.is_running(),
            Err(e) => {
                tracing::debug!("status of `{}` unavailable: {e}", cluster.service);
                false
            }
        };
        if !running {
            self.services.start(&cluster.service).await?;
        } else if reload {
            tracing::info!("restarting `{}` to apply its settings", cluster.service);
            service::restart(&*self.services, &cluster.service).await?;
        }

        HealthPoller::new(self.config.health)
            .wait_for_cluster(&*self.services, cluster)
            .await
    }
}
