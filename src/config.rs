use std::time::Duration;

use clap::Args;

use crate::reconcile::RetryPolicy;

/// Settings for the `run` subcommand.
#[derive(Args, Clone, Debug)]
pub struct RunConfig {
    /// Only watch DeploymentSyncs in this namespace (defaults to all namespaces)
    #[arg(long, env = "DEPLOYMENT_SYNC_NAMESPACE")]
    pub namespace: Option<String>,

    /// Seconds between periodic resyncs of every DeploymentSync
    #[arg(long, env = "DEPLOYMENT_SYNC_RESYNC_SECS", default_value_t = 300)]
    pub resync_interval: u64,

    /// Seconds a single reconcile may spend talking to the API server
    #[arg(long, env = "DEPLOYMENT_SYNC_TIMEOUT_SECS", default_value_t = 30)]
    pub reconcile_timeout: u64,

    /// Maximum number of DeploymentSyncs reconciled in parallel (0 = unbounded)
    #[arg(long, env = "DEPLOYMENT_SYNC_CONCURRENCY", default_value_t = 4)]
    pub concurrency: u16,

    /// Retries of a destination write that hit a version conflict
    #[arg(long, env = "DEPLOYMENT_SYNC_CONFLICT_RETRIES", default_value_t = 5)]
    pub conflict_retries: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            resync_interval: 300,
            reconcile_timeout: 30,
            concurrency: 4,
            conflict_retries: 5,
        }
    }
}

impl RunConfig {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval)
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            conflict_retries: self.conflict_retries,
            ..RetryPolicy::default()
        }
    }
}
