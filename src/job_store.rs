use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use tokio::sync::RwLock;

use crate::models::{GenerationRequest, Job, JobStatus};

/// In-memory job table shared by handlers, dispatcher tasks and the retention
/// scheduler. Every operation takes the single lock, so readers see either the
/// whole of an update or none of it.
#[derive(Debug, Clone, Default)]
pub struct JobStore {
    jobs: Arc<RwLock<HashMap<String, Job>>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record, replacing any existing one with the same id.
    pub async fn create(&self, id: &str, status: JobStatus, request: Arc<GenerationRequest>) {
        let now = Utc::now();
        let job = Job {
            id: id.to_string(),
            status,
            request,
            created_at: now,
            updated_at: now,
        };
        self.jobs.write().await.insert(id.to_string(), job);
    }

    /// Replaces the status of an existing job. Returns `false` without
    /// recreating anything when the id is absent, so an evicted job stays gone.
    pub async fn update(&self, id: &str, status: JobStatus) -> bool {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(id) else {
            return false;
        };
        job.status = status;
        job.updated_at = Utc::now();
        true
    }

    pub async fn get(&self, id: &str) -> Option<Job> {
        self.jobs.read().await.get(id).cloned()
    }

    pub async fn delete(&self, id: &str) -> Option<Job> {
        self.jobs.write().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }
}
