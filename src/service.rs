//! Control of the services running each cluster.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::command::{CommandRunner, ToolCommand};
use crate::config::{ClusterLayout, DATA_DIR_SETTING, LOG_DIR_SETTING, SOCKET_DIR_SETTING};
use crate::error::Error;

type Result<T> = crate::Result<T>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Running,
    Starting,
    Stopping,
    Stopped,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceStatus {
    pub state: ServiceState,
    /// The cluster accepts connections.
    pub responding: bool,
}

impl ServiceStatus {
    pub fn is_running(&self) -> bool {
        matches!(self.state, ServiceState::Running | ServiceState::Starting)
    }
}

/// Process-control layer the orchestrator drives. Implementations may fail at any call; the
/// orchestrator only retries through the health poller.
#[async_trait]
pub trait ServiceController: Send + Sync {
    async fn start(&self, service: &str) -> Result<()>;
    async fn stop(&self, service: &str) -> Result<()>;
    async fn status(&self, service: &str) -> Result<ServiceStatus>;
    async fn read_setting(&self, service: &str, key: &str) -> Result<String>;
    async fn write_setting(&self, service: &str, key: &str, value: &str) -> Result<()>;
}

pub async fn restart(services: &dyn ServiceController, service: &str) -> Result<()> {
    services.stop(service).await?;
    services.start(service).await
}

/// Writes `key = value` unless it already holds that value. Returns whether a write happened.
pub async fn ensure_setting(
    services: &dyn ServiceController,
    service: &str,
    key: &str,
    value: &str,
) -> Result<bool> {
    match services.read_setting(service, key).await {
        Ok(current) if current == value => return Ok(false),
        Ok(_) => (),
        Err(e) => tracing::debug!("could not read `{service}:{key}`, overwriting: {e}"),
    }
    services.write_setting(service, key, value).await?;
    tracing::info!("set `{service}:{key}` to `{value}`");

    Ok(true)
}

/// Points the cluster's service at its data, socket and log directories.
pub async fn point_at(services: &dyn ServiceController, cluster: &ClusterLayout) -> Result<()> {
    for (key, path) in [
        (DATA_DIR_SETTING, &cluster.data_dir),
        (SOCKET_DIR_SETTING, &cluster.socket_dir),
        (LOG_DIR_SETTING, &cluster.log_dir),
    ] {
        let value = path
            .to_str()
            .ok_or_else(|| Error::validation(path, "path is not valid UTF-8"))?;
        ensure_setting(services, &cluster.service, key, value).await?;
    }

    Ok(())
}

/// Drives a `serveradmin`-style control tool:
///
/// ```text
/// serveradmin start <service>
/// serveradmin stop <service>
/// serveradmin fullstatus <service>          -> <service>:state = "RUNNING" ...
/// serveradmin settings <service>:<key>      -> <service>:<key> = "value"
/// serveradmin settings <service>:<key> = <value>
/// ```
pub struct ServerAdminController {
    tool: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl ServerAdminController {
    pub fn new(tool: PathBuf, runner: Arc<dyn CommandRunner>) -> Self {
        Self { tool, runner }
    }

    async fn invoke<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let cmd = ToolCommand::new(&self.tool).args(args);
        let output = self.runner.run(&cmd).await?.check()?;
        Ok(output.stdout)
    }
}

#[async_trait]
impl ServiceController for ServerAdminController {
    async fn start(&self, service: &str) -> Result<()> {
        tracing::info!("starting `{service}`");
        self.invoke(["start", service]).await.map(drop)
    }

    async fn stop(&self, service: &str) -> Result<()> {
        tracing::info!("stopping `{service}`");
        self.invoke(["stop", service]).await.map(drop)
    }

    async fn status(&self, service: &str) -> Result<ServiceStatus> {
        let output = self.invoke(["fullstatus", service]).await?;
        let settings = parse_settings(service, &output);
        let state = match settings.get("state").map(String::as_str) {
            Some("RUNNING") => ServiceState::Running,
            Some("STARTING") => ServiceState::Starting,
            Some("STOPPING") => ServiceState::Stopping,
            Some("STOPPED") => ServiceState::Stopped,
            _ => ServiceState::Unknown,
        };
        let responding = matches!(
            settings.get("postgresIsResponding").map(String::as_str),
            Some("yes" | "true" | "1")
        );

        Ok(ServiceStatus { state, responding })
    }

    async fn read_setting(&self, service: &str, key: &str) -> Result<String> {
        let output = self
            .invoke(["settings".to_string(), format!("{service}:{key}")])
            .await?;
        parse_settings(service, &output)
            .remove(key)
            .ok_or_else(|| Error::Service {
                service: service.to_string(),
                reason: format!("setting `{key}` not reported"),
            })
    }

    async fn write_setting(&self, service: &str, key: &str, value: &str) -> Result<()> {
        self.invoke([
            "settings".to_string(),
            format!("{service}:{key}"),
            "=".to_string(),
            value.to_string(),
        ])
        .await
        .map(drop)
    }
}

/// Parses `<service>:<key> = <value>` lines, unquoting values.
fn parse_settings(service: &str, output: &str) -> BTreeMap<String, String> {
    let prefix = format!("{service}:");
    output
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            let key = key.trim().strip_prefix(&prefix)?;
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}
