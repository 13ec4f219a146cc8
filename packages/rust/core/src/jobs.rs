//! Background build jobs keyed by [`JobId`].

use std::collections::HashMap;
use std::sync::Arc;

use refkb_shared::{BuildRequest, BuildResult, JobId};
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::builder::KnowledgeBuilder;

/// Lifecycle of a submitted build.
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Pending,
    Running,
    Completed(BuildResult),
    /// The build task itself died (panicked or was aborted).
    Failed(String),
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Failed(_))
    }
}

struct JobEntry {
    status: watch::Receiver<JobStatus>,
    token: CancellationToken,
}

/// Registry of builds running on the current runtime.
#[derive(Clone, Default)]
pub struct BuildJobs {
    jobs: Arc<Mutex<HashMap<JobId, JobEntry>>>,
}

impl BuildJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `request` in the background and return its id immediately.
    pub async fn submit(&self, builder: Arc<KnowledgeBuilder>, request: BuildRequest) -> JobId {
        let id = JobId::new();
        let token = CancellationToken::new();
        let (tx, rx) = watch::channel(JobStatus::Pending);

        self.jobs.lock().await.insert(
            id,
            JobEntry {
                status: rx,
                token: token.clone(),
            },
        );

        tokio::spawn(async move {
            tx.send_replace(JobStatus::Running);
            let run = tokio::spawn(async move { builder.build(&request, &token).await });
            let status = match run.await {
                Ok(result) => JobStatus::Completed(result),
                Err(e) => {
                    warn!(job_id = %id, error = %e, "build task failed");
                    JobStatus::Failed(e.to_string())
                }
            };
            tx.send_replace(status);
        });

        info!(job_id = %id, "build submitted");
        id
    }

    pub async fn status(&self, id: &JobId) -> Option<JobStatus> {
        let jobs = self.jobs.lock().await;
        jobs.get(id).map(|entry| entry.status.borrow().clone())
    }

    /// Request cancellation. Returns `false` for unknown or finished jobs.
    pub async fn cancel(&self, id: &JobId) -> bool {
        let jobs = self.jobs.lock().await;
        match jobs.get(id) {
            Some(entry) if !entry.status.borrow().is_terminal() => {
                entry.token.cancel();
                info!(job_id = %id, "build cancellation requested");
                true
            }
            _ => false,
        }
    }

    /// Wait until the job reaches a terminal status.
    pub async fn wait(&self, id: &JobId) -> Option<JobStatus> {
        let mut rx = {
            let jobs = self.jobs.lock().await;
            jobs.get(id)?.status.clone()
        };
        if let Ok(status) = rx.wait_for(JobStatus::is_terminal).await {
            return Some(status.clone());
        }
        // Sender gone without a terminal status; report the last one seen.
        let last = rx.borrow().clone();
        Some(last)
    }

    /// All known jobs with their current status.
    pub async fn list(&self) -> Vec<(JobId, JobStatus)> {
        let jobs = self.jobs.lock().await;
        jobs.iter()
            .map(|(id, entry)| (*id, entry.status.borrow().clone()))
            .collect()
    }
}
