//! Waiting for a cluster to accept connections.

use std::future::Future;

use tokio::time::Duration;

use crate::config::{ClusterLayout, HealthConfig};
use crate::error::Error;
use crate::service::ServiceController;

/// Bounded, fixed-interval readiness polling.
#[derive(Debug, Clone, Copy)]
pub struct HealthPoller {
    max_attempts: u32,
    interval: Duration,
}

impl HealthPoller {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            interval: config.interval,
        }
    }

    /// Calls `probe` up to `max_attempts` times, sleeping `interval` in between. Returns on the
    /// first positive answer.
    pub async fn wait_until_ready<F, Fut>(&self, mut probe: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for attempt in 1..=self.max_attempts {
            if probe().await {
                tracing::debug!("ready after {attempt} attempt(s)");
                return true;
            }
            if attempt < self.max_attempts {
                tokio::time::sleep(self.interval).await;
            }
        }

        false
    }

    /// Waits for the cluster's service to report that it is responding.
    pub async fn wait_for_cluster(
        &self,
        services: &dyn ServiceController,
        cluster: &ClusterLayout,
    ) -> crate::Result<()> {
        let ready = self
            .wait_until_ready(move || async move {
                match services.status(&cluster.service).await {
                    Ok(status) => status.responding,
                    Err(e) => {
                        tracing::debug!("status of `{}` unavailable: {e}", cluster.service);
                        false
                    }
                }
            })
            .await;

        if ready {
            tracing::info!("{} cluster is ready", cluster.role);
            Ok(())
        } else {
            tracing::error!(
                "{} cluster did not answer after {} attempts",
                cluster.role,
                self.max_attempts
            );
            Err(Error::HealthCheckTimeout {
                role: cluster.role,
                attempts: self.max_attempts,
            })
        }
    }
}
