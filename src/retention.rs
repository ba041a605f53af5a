use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Result};
use tokio::{task::JoinHandle, time};
use tracing::{info, warn};

use crate::{artifact_store::delete_file_if_exists, job_store::JobStore};

pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60 * 60);

/// How completed jobs are evicted. Exactly one policy is active per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Evict a fixed delay after completion.
    Timed(Duration),
    /// Evict as soon as the artifact has been downloaded once.
    DeliverOnce,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::Timed(DEFAULT_RETENTION)
    }
}

impl RetentionPolicy {
    pub fn parse(value: &str, retention: Duration) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "timed" | "timer" => Ok(Self::Timed(retention)),
            "deliver_once" | "deliver-once" => Ok(Self::DeliverOnce),
            other => bail!(
                "Unsupported FLUX_API_RETENTION_POLICY `{other}`. Supported: timed, deliver_once."
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetentionScheduler {
    policy: RetentionPolicy,
    jobs: JobStore,
}

impl RetentionScheduler {
    pub fn new(policy: RetentionPolicy, jobs: JobStore) -> Self {
        Self { policy, jobs }
    }

    /// Arms the eviction timer for a freshly completed job. Returns `None` when
    /// the deliver-once policy is active.
    pub fn on_completed(&self, job_id: &str, artifact: PathBuf) -> Option<JoinHandle<()>> {
        let RetentionPolicy::Timed(delay) = self.policy else {
            return None;
        };
        let jobs = self.jobs.clone();
        let job_id = job_id.to_string();
        Some(tokio::spawn(async move {
            time::sleep(delay).await;
            info!(job_id = %job_id, "Retention window elapsed");
            evict(&jobs, &job_id, &artifact).await;
        }))
    }

    /// Called after an artifact has been streamed to a client. Evicts the job
    /// under the deliver-once policy and reports whether it did.
    pub async fn on_delivered(&self, job_id: &str, artifact: &Path) -> bool {
        if self.policy != RetentionPolicy::DeliverOnce {
            return false;
        }
        info!(job_id = %job_id, "Artifact delivered, evicting job");
        evict(&self.jobs, job_id, artifact).await;
        true
    }
}

async fn evict(jobs: &JobStore, job_id: &str, artifact: &Path) {
    if let Err(err) = delete_file_if_exists(artifact).await {
        warn!(job_id = %job_id, "Failed to delete artifact: {err:#}");
    }
    if jobs.delete(job_id).await.is_some() {
        info!(job_id = %job_id, "Job evicted");
    }
}
