//! Concurrent job scheduler.
//!
//! Each discovery runs in its own tokio task. Job state lives in a shared
//! map; callers observe it through snapshots with progress computed from
//! the phase timeline at read time. Cancellation is cooperative: the
//! runner checks its token between phases and unwinds with a `Cancelled`
//! error, keeping whatever partial results it stored along the way.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{DiscoveryError, Result};
use crate::phases::{self, PhaseId};
use crate::types::{DiscoveryJob, DiscoveryOutput, DiscoveryRequest, JobStatus};

/// Executes one discovery from start to finish.
///
/// Implemented by the pipeline; tests plug in scripted runners.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run(
        &self,
        request: DiscoveryRequest,
        handle: JobHandle,
        cancel: CancellationToken,
    ) -> Result<DiscoveryOutput>;
}

struct JobEntry {
    job: DiscoveryJob,
    cancel: CancellationToken,
}

type JobMap = Arc<Mutex<HashMap<Uuid, JobEntry>>>;

fn lock(jobs: &JobMap) -> MutexGuard<'_, HashMap<Uuid, JobEntry>> {
    jobs.lock().unwrap_or_else(|e| e.into_inner())
}

/// Writable view of one job, handed to the runner.
#[derive(Clone)]
pub struct JobHandle {
    id: Uuid,
    jobs: JobMap,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Append a log line to the job.
    pub fn log(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::info!(job_id = %self.id, "{message}");
        if let Some(entry) = lock(&self.jobs).get_mut(&self.id) {
            entry.job.push_log(message);
        }
    }

    /// Advance to a phase, resetting the phase clock for progress.
    pub fn set_phase(&self, phase: PhaseId) {
        if let Some(entry) = lock(&self.jobs).get_mut(&self.id) {
            entry.job.enter_phase(phase);
        }
    }

    /// Store an intermediate result so a failed or cancelled job still
    /// exposes what was found before the abort.
    pub fn store_partial(&self, output: DiscoveryOutput) {
        if let Some(entry) = lock(&self.jobs).get_mut(&self.id) {
            entry.job.result = Some(output);
        }
    }

    /// Cancellation check used between pipeline phases.
    pub fn ensure_active(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(DiscoveryError::Cancelled);
        }
        Ok(())
    }
}

/// Read-only job snapshot with derived progress fields.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub id: Uuid,
    pub request: DiscoveryRequest,
    pub status: JobStatus,
    pub phase: PhaseId,
    pub phase_label: &'static str,
    pub progress: u8,
    pub remaining_secs: u64,
    pub logs: Vec<String>,
    pub started_at: chrono::DateTime<Utc>,
    pub ended_at: Option<chrono::DateTime<Utc>>,
    pub result: Option<DiscoveryOutput>,
    pub error: Option<String>,
}

impl JobView {
    fn from_job(job: &DiscoveryJob) -> Self {
        let elapsed_in_phase = (Utc::now() - job.phase_started_at)
            .to_std()
            .unwrap_or_default();
        Self {
            id: job.id,
            request: job.request.clone(),
            status: job.status,
            phase: job.current_phase,
            phase_label: phases::phase(job.current_phase).label,
            progress: phases::progress(job.status, job.current_phase, elapsed_in_phase),
            remaining_secs: phases::remaining_secs(
                job.status,
                job.current_phase,
                elapsed_in_phase,
            ),
            logs: job.logs.iter().cloned().collect(),
            started_at: job.started_at,
            ended_at: job.ended_at,
            result: job.result.clone(),
            error: job.error.clone(),
        }
    }
}

/// Spawns and tracks discovery jobs.
pub struct JobScheduler<R: JobRunner> {
    jobs: JobMap,
    runner: Arc<R>,
}

impl<R: JobRunner> Clone for JobScheduler<R> {
    fn clone(&self) -> Self {
        Self {
            jobs: Arc::clone(&self.jobs),
            runner: Arc::clone(&self.runner),
        }
    }
}

impl<R: JobRunner> JobScheduler<R> {
    pub fn new(runner: R) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            runner: Arc::new(runner),
        }
    }

    /// Start a discovery in the background and return its job id.
    pub fn start(&self, request: DiscoveryRequest) -> Uuid {
        let job = DiscoveryJob::new(request.clone());
        let id = job.id;
        let cancel = CancellationToken::new();
        lock(&self.jobs).insert(
            id,
            JobEntry {
                job,
                cancel: cancel.clone(),
            },
        );

        let jobs = Arc::clone(&self.jobs);
        let runner = Arc::clone(&self.runner);
        let handle = JobHandle {
            id,
            jobs: Arc::clone(&self.jobs),
        };
        tokio::spawn(async move {
            if let Some(entry) = lock(&jobs).get_mut(&id) {
                entry.job.status = JobStatus::Running;
            }
            tracing::info!(job_id = %id, fair = %request.fair_name, "discovery job started");

            let outcome = runner.run(request, handle, cancel).await;

            if let Some(entry) = lock(&jobs).get_mut(&id) {
                match outcome {
                    Ok(output) => {
                        entry.job.status = JobStatus::Completed;
                        entry.job.current_phase = PhaseId::Results;
                        entry.job.result = Some(output);
                        entry.job.push_log("Discovery completed");
                    }
                    Err(DiscoveryError::Cancelled) => {
                        entry.job.status = JobStatus::Cancelled;
                        entry.job.push_log("Discovery cancelled");
                    }
                    Err(e) => {
                        entry.job.status = JobStatus::Failed;
                        entry.job.error = Some(e.to_string());
                        entry.job.push_log(format!("Discovery failed: {e}"));
                    }
                }
                entry.job.ended_at = Some(Utc::now());
            }
        });
        id
    }

    pub fn get(&self, id: Uuid) -> Option<JobView> {
        lock(&self.jobs).get(&id).map(|entry| JobView::from_job(&entry.job))
    }

    /// Jobs still pending or running, newest first.
    pub fn list_active(&self) -> Vec<JobView> {
        self.list_filtered(|status| !status.is_terminal())
    }

    /// Terminal jobs, newest first.
    pub fn list_completed(&self) -> Vec<JobView> {
        self.list_filtered(|status| status.is_terminal())
    }

    fn list_filtered(&self, keep: impl Fn(JobStatus) -> bool) -> Vec<JobView> {
        let mut views: Vec<JobView> = lock(&self.jobs)
            .values()
            .filter(|entry| keep(entry.job.status))
            .map(|entry| JobView::from_job(&entry.job))
            .collect();
        views.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        views
    }

    /// Request cooperative cancellation of a running job.
    pub fn cancel(&self, id: Uuid) -> Result<()> {
        let guard = lock(&self.jobs);
        let entry = guard.get(&id).ok_or(DiscoveryError::JobNotFound(id))?;
        if !entry.job.status.is_terminal() {
            entry.cancel.cancel();
        }
        Ok(())
    }

    /// Evict terminal jobs that ended more than `max_age` ago.
    pub fn cleanup(&self, max_age: Duration) {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        lock(&self.jobs).retain(|_, entry| {
            if !entry.job.status.is_terminal() {
                return true;
            }
            match entry.job.ended_at {
                Some(ended_at) => now - ended_at <= max_age,
                None => true,
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn request(fair_name: &str) -> DiscoveryRequest {
        DiscoveryRequest {
            fair_name: fair_name.into(),
            fair_year: 2026,
            fair_city: String::new(),
            fair_country: String::new(),
            client_name: String::new(),
            known_url: None,
        }
    }

    async fn wait_terminal<R: JobRunner>(scheduler: &JobScheduler<R>, id: Uuid) -> JobView {
        for _ in 0..200 {
            if let Some(view) = scheduler.get(id) {
                if view.status.is_terminal() {
                    return view;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {id} never reached a terminal state");
    }

    struct OkRunner;

    #[async_trait]
    impl JobRunner for OkRunner {
        async fn run(
            &self,
            request: DiscoveryRequest,
            handle: JobHandle,
            _cancel: CancellationToken,
        ) -> Result<DiscoveryOutput> {
            handle.set_phase(PhaseId::Prescan);
            handle.log("scanning");
            Ok(DiscoveryOutput::new(&request))
        }
    }

    struct BlockUntilCancelled;

    #[async_trait]
    impl JobRunner for BlockUntilCancelled {
        async fn run(
            &self,
            request: DiscoveryRequest,
            handle: JobHandle,
            cancel: CancellationToken,
        ) -> Result<DiscoveryOutput> {
            handle.store_partial(DiscoveryOutput::new(&request));
            cancel.cancelled().await;
            handle.ensure_active(&cancel)?;
            unreachable!("ensure_active returns Cancelled");
        }
    }

    struct FailAfterPartial;

    #[async_trait]
    impl JobRunner for FailAfterPartial {
        async fn run(
            &self,
            request: DiscoveryRequest,
            handle: JobHandle,
            _cancel: CancellationToken,
        ) -> Result<DiscoveryOutput> {
            let mut partial = DiscoveryOutput::new(&request);
            partial.official_url = Some(Url::parse("https://www.bauma.de/").unwrap());
            handle.store_partial(partial);
            Err(DiscoveryError::Browser("browser crashed".into()))
        }
    }

    #[tokio::test]
    async fn job_runs_to_completion_with_logs_and_result() {
        let scheduler = JobScheduler::new(OkRunner);
        let id = scheduler.start(request("bauma"));

        let view = wait_terminal(&scheduler, id).await;
        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.progress, 100);
        assert!(view.result.is_some());
        assert!(view.logs.iter().any(|l| l.contains("scanning")));
        assert!(view.ended_at.is_some());
        assert!(scheduler.list_active().is_empty());
        assert_eq!(scheduler.list_completed().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_job_keeps_partial_result() {
        let scheduler = JobScheduler::new(BlockUntilCancelled);
        let id = scheduler.start(request("bauma"));

        // The job parks on its token until we cancel it.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(scheduler.get(id).unwrap().status, JobStatus::Running);

        scheduler.cancel(id).unwrap();
        let view = wait_terminal(&scheduler, id).await;
        assert_eq!(view.status, JobStatus::Cancelled);
        assert_eq!(view.progress, 0);
        assert!(view.result.is_some(), "partial result survives cancellation");
    }

    #[tokio::test]
    async fn failed_job_reports_error_and_keeps_partial_result() {
        let scheduler = JobScheduler::new(FailAfterPartial);
        let id = scheduler.start(request("bauma"));

        let view = wait_terminal(&scheduler, id).await;
        assert_eq!(view.status, JobStatus::Failed);
        assert!(view.error.as_deref().unwrap().contains("browser crashed"));
        let partial = view.result.unwrap();
        assert_eq!(
            partial.official_url.map(|u| u.to_string()),
            Some("https://www.bauma.de/".to_string())
        );
    }

    #[tokio::test]
    async fn cancel_of_unknown_job_is_an_error() {
        let scheduler = JobScheduler::new(OkRunner);
        let err = scheduler.cancel(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, DiscoveryError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn cleanup_evicts_only_old_terminal_jobs() {
        let scheduler = JobScheduler::new(BlockUntilCancelled);
        let done = JobScheduler::new(OkRunner);

        let finished = done.start(request("bauma"));
        wait_terminal(&done, finished).await;
        done.cleanup(Duration::from_secs(0));
        assert!(done.get(finished).is_none(), "terminal job evicted");

        let active = scheduler.start(request("ism"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.cleanup(Duration::from_secs(0));
        assert!(
            scheduler.get(active).is_some(),
            "running job survives cleanup"
        );
        scheduler.cancel(active).unwrap();
        wait_terminal(&scheduler, active).await;
    }

    #[tokio::test]
    async fn progress_reflects_phase_band() {
        let scheduler = JobScheduler::new(BlockUntilCancelled);
        let id = scheduler.start(request("bauma"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Still in the first phase band.
        let view = scheduler.get(id).unwrap();
        assert!(view.progress <= 10);
        assert!(view.remaining_secs > 0);

        scheduler.cancel(id).unwrap();
        wait_terminal(&scheduler, id).await;
    }
}
