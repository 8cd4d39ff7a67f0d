use std::net::{Ipv4Addr, TcpListener};
use std::path::Path;

use crate::command::{bin, CommandRunner, ToolCommand};
use crate::error::Error;
use crate::relocate::Owner;

type Result<T> = crate::Result<T>;

/// Two distinct loopback ports that were free a moment ago.
///
/// The listeners are closed before the lease is handed out, so that the upgrade helper can bind
/// the ports itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortLease {
    pub old_port: u16,
    pub new_port: u16,
}

impl PortLease {
    pub fn reserve() -> Result<Self> {
        let bind = || {
            TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
                .and_then(|l| l.local_addr().map(|addr| (l, addr.port())))
                .map_err(|e| Error::Internal(format!("failed to reserve a port: {e}")))
        };
        // both listeners are held at once so the two ports differ
        let (old_listener, old_port) = bind()?;
        let (new_listener, new_port) = bind()?;
        drop(old_listener);
        drop(new_listener);

        Ok(Self { old_port, new_port })
    }
}

/// Runs the engine's upgrade helper against a pair of data directories.
///
/// The helper is not idempotent against a half-upgraded target, so a failed run is reported and
/// never retried from here.
pub struct UpgradeInvoker<'a> {
    runner: &'a dyn CommandRunner,
    scratch_dir: &'a Path,
}

impl<'a> UpgradeInvoker<'a> {
    pub fn new(runner: &'a dyn CommandRunner, scratch_dir: &'a Path) -> Self {
        Self {
            runner,
            scratch_dir,
        }
    }

    pub fn command(
        &self,
        old_dir: &Path,
        new_dir: &Path,
        old_bin: &Path,
        new_bin: &Path,
        lease: PortLease,
        owner: Option<Owner>,
    ) -> ToolCommand {
        ToolCommand::new(bin(new_bin, "pg_upgrade"))
            .arg("-b")
            .arg(old_bin)
            .arg("-B")
            .arg(new_bin)
            .arg("-d")
            .arg(old_dir)
            .arg("-D")
            .arg(new_dir)
            .arg("-p")
            .arg(lease.old_port.to_string())
            .arg("-P")
            .arg(lease.new_port.to_string())
            .current_dir(self.scratch_dir)
            .run_as(owner)
    }

    #[tracing::instrument(skip_all, fields(old = %old_dir.display(), new = %new_dir.display()))]
    pub async fn upgrade(
        &self,
        old_dir: &Path,
        new_dir: &Path,
        old_bin: &Path,
        new_bin: &Path,
    ) -> Result<()> {
        let owner = Owner::of(old_dir)?;
        let lease = PortLease::reserve()?;
        let cmd = self.command(old_dir, new_dir, old_bin, new_bin, lease, Some(owner));

        tracing::info!(
            "running upgrade helper on ports {} and {}",
            lease.old_port,
            lease.new_port
        );
        match self.runner.run(&cmd).await?.check() {
            Ok(_) => {
                tracing::info!("upgrade helper succeeded");
                Ok(())
            }
            Err(e) => {
                tracing::error!("upgrade helper failed, `{}` left as is: {e}", old_dir.display());
                Err(e)
            }
        }
    }
}
