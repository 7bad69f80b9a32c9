//! Compaction worker: polls the metastore for jobs and runs them.
//!
//! A worker tracks three sets: jobs assigned but not started, jobs running,
//! and finished jobs whose status the metastore has not acknowledged yet.
//! Every tick sends one poll carrying the staged statuses plus an in-progress
//! report for every running job (which renews their leases), asks for as many
//! jobs as there is spare capacity, and then starts whatever was assigned.
//! The worker never retries a job; an unreported job is reassigned by the
//! metastore once its lease expires.

mod client;
mod compactor;
mod config;
/// Worker counters.
pub mod metrics;

use std::{collections::BTreeMap, sync::Arc, time::Instant};

use parking_lot::Mutex;
use tokio::{task::JoinSet, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub use client::{MetastoreClient, PollError};
pub use compactor::{BlockCompactor, CompactError, CompactionOptions};
pub use config::WorkerConfig;
pub use metrics::{JobOutcome, WorkerMetrics, WorkerMetricsSnapshot};

use crate::{
    block::{total_size, BlockMeta},
    compaction::{CompactionJob, CompactionJobStatus, CompactionStatus, CompletedJob},
    metastore::PollCompactionJobsRequest,
    observability::{log_debug, log_error, log_info, log_warn, KILN_TARGET},
};

#[derive(Debug, Default)]
struct WorkerState {
    pending_jobs: BTreeMap<String, CompactionJob>,
    active_jobs: BTreeMap<String, CompactionJob>,
    pending_status_updates: BTreeMap<String, CompactionJobStatus>,
}

/// Sizes of the worker's job sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerLoad {
    /// Assigned, not started.
    pub pending_jobs: usize,
    /// Running.
    pub active_jobs: usize,
    /// Finished, status not yet acknowledged.
    pub pending_status_updates: usize,
}

/// Rough memory needed to merge `blocks`; sections that cannot be resolved
/// are left out.
fn estimated_merge_memory(blocks: &[BlockMeta]) -> u64 {
    blocks
        .iter()
        .flat_map(|block| {
            block
                .tenant_services
                .iter()
                .filter_map(move |service| service.estimated_merge_memory(block.format_version).ok())
        })
        .fold(0u64, u64::saturating_add)
}

/// Pull-based compaction worker.
#[derive(Clone)]
pub struct Worker {
    config: Arc<WorkerConfig>,
    client: Arc<dyn MetastoreClient>,
    compactor: Arc<dyn BlockCompactor>,
    state: Arc<Mutex<WorkerState>>,
    metrics: Arc<WorkerMetrics>,
}

impl Worker {
    /// Create a worker polling `client` and running jobs on `compactor`.
    pub fn new(
        config: WorkerConfig,
        client: Arc<dyn MetastoreClient>,
        compactor: Arc<dyn BlockCompactor>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            client,
            compactor,
            state: Arc::new(Mutex::new(WorkerState::default())),
            metrics: Arc::new(WorkerMetrics::new()),
        }
    }

    /// Worker configuration.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Worker counters.
    pub fn metrics(&self) -> &WorkerMetrics {
        &self.metrics
    }

    /// Current sizes of the job sets.
    pub fn load(&self) -> WorkerLoad {
        let state = self.state.lock();
        WorkerLoad {
            pending_jobs: state.pending_jobs.len(),
            active_jobs: state.active_jobs.len(),
            pending_status_updates: state.pending_status_updates.len(),
        }
    }

    /// Poll on every tick until `cancel` fires, then wait for running jobs.
    ///
    /// Running jobs observe the same cancellation; they report nothing and
    /// their leases expire on the metastore.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tasks = JoinSet::new();
        log_info!(
            component = "worker",
            event = "worker_started",
            job_capacity = self.config.job_capacity,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.poll().await;
                    self.start_pending_jobs(&mut tasks, &cancel);
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(error) = joined {
                        log_error!(
                            component = "worker",
                            event = "job_task_failed",
                            error = %error
                        );
                    }
                }
            }
        }

        let in_flight = tasks.len();
        while let Some(joined) = tasks.join_next().await {
            if let Err(error) = joined {
                log_error!(
                    component = "worker",
                    event = "job_task_failed",
                    error = %error
                );
            }
        }
        log_info!(
            component = "worker",
            event = "worker_stopped",
            joined_jobs = in_flight
        );
    }

    /// Run one poll round trip.
    ///
    /// On failure nothing changes and the same statuses go out on the next
    /// poll.
    pub async fn poll(&self) {
        let (updates, acknowledged, capacity) = {
            let state = self.state.lock();
            log_debug!(
                component = "worker",
                event = "poll",
                active_jobs = state.active_jobs.len(),
                pending_jobs = state.pending_jobs.len(),
                pending_updates = state.pending_status_updates.len()
            );
            let acknowledged: Vec<String> = state.pending_status_updates.keys().cloned().collect();
            let mut updates: Vec<CompactionJobStatus> =
                state.pending_status_updates.values().cloned().collect();
            updates.extend(
                state
                    .active_jobs
                    .values()
                    .map(|job| job.status_update(CompactionStatus::InProgress)),
            );
            let capacity = self
                .config
                .job_capacity
                .saturating_sub(state.active_jobs.len())
                .saturating_sub(state.pending_jobs.len());
            (updates, acknowledged, capacity)
        };
        if updates.is_empty() && capacity == 0 {
            return;
        }

        let status_updates = updates.len();
        let request = PollCompactionJobsRequest {
            job_status_updates: updates,
            job_capacity: u32::try_from(capacity).unwrap_or(u32::MAX),
        };
        let response = match self.client.poll_compaction_jobs(request).await {
            Ok(response) => response,
            Err(error) => {
                self.metrics.record_poll_failure();
                log_error!(
                    component = "worker",
                    event = "poll_failed",
                    error = %error
                );
                return;
            }
        };

        let assigned = response.compaction_jobs.len();
        self.metrics.record_poll(status_updates, assigned);
        log_debug!(
            component = "worker",
            event = "poll_response",
            compaction_jobs = assigned
        );
        let mut state = self.state.lock();
        for name in &acknowledged {
            state.pending_status_updates.remove(name);
        }
        for job in response.compaction_jobs {
            state.pending_jobs.insert(job.name.clone(), job);
        }
    }

    /// Start pending jobs while running fewer than `job_capacity`.
    ///
    /// Returns the number of jobs started.
    pub fn start_pending_jobs(&self, tasks: &mut JoinSet<()>, cancel: &CancellationToken) -> usize {
        let jobs: Vec<CompactionJob> = {
            let mut state = self.state.lock();
            // A running job handed out again under a newer token keeps running;
            // its reports carry the newer token from here on.
            let reassigned: Vec<String> = state
                .pending_jobs
                .keys()
                .filter(|name| state.active_jobs.contains_key(*name))
                .cloned()
                .collect();
            for name in reassigned {
                if let Some(job) = state.pending_jobs.remove(&name) {
                    log_debug!(
                        component = "worker",
                        event = "job_reassigned_while_running",
                        job = %name,
                        token = job.commit_index
                    );
                    state.active_jobs.insert(name, job);
                }
            }
            let room = self
                .config
                .job_capacity
                .saturating_sub(state.active_jobs.len());
            let names: Vec<String> = state.pending_jobs.keys().take(room).cloned().collect();
            let mut jobs = Vec::with_capacity(names.len());
            for name in names {
                if let Some(job) = state.pending_jobs.remove(&name) {
                    state.active_jobs.insert(name, job.clone());
                    jobs.push(job);
                }
            }
            jobs
        };
        if jobs.is_empty() {
            return 0;
        }

        log_info!(
            component = "worker",
            event = "starting_pending_jobs",
            jobs = jobs.len()
        );
        let started = jobs.len();
        for job in jobs {
            let span = tracing::info_span!(
                target: KILN_TARGET,
                "compaction_job",
                job = %job.name,
                tenant = %job.tenant_id,
                shard = job.shard,
                level = job.compaction_level,
                blocks = job.blocks.len()
            );
            let worker = self.clone();
            let cancel = cancel.child_token();
            tasks.spawn(async move { worker.run_job(job, cancel).await }.instrument(span));
        }
        started
    }

    async fn run_job(&self, job: CompactionJob, cancel: CancellationToken) {
        let started = Instant::now();
        self.metrics.record_job_started();
        log_info!(
            component = "worker",
            event = "job_started",
            job = %job.name,
            blocks = job.blocks.len(),
            blocks_bytes = total_size(&job.blocks),
            estimated_memory = estimated_merge_memory(&job.blocks)
        );

        let temp_dir = self.config.temp_dir.join(&job.name);
        let options = CompactionOptions {
            source_dir: temp_dir.join("source"),
            temp_dir,
            max_size_load_in_memory: self.config.small_object_size,
        };
        let result = self
            .compactor
            .compact(job.blocks.clone(), options, cancel)
            .await;

        let (outcome, status) = match result {
            Ok(compacted) => {
                log_info!(
                    component = "worker",
                    event = "job_succeeded",
                    job = %job.name,
                    input_blocks = job.blocks.len(),
                    output_blocks = compacted.len()
                );
                for block in &compacted {
                    log_debug!(
                        component = "worker",
                        event = "block_compacted",
                        job = %job.name,
                        block = %block.id,
                        tenant = %block.tenant_id,
                        shard = block.shard,
                        level = block.compaction_level,
                        size = block.size,
                        min_time = block.min_time,
                        max_time = block.max_time,
                        tenant_services = block.tenant_services.len()
                    );
                }
                let status = CompactionJobStatus {
                    completed_job: Some(CompletedJob { blocks: compacted }),
                    ..job.status_update(CompactionStatus::Success)
                };
                (JobOutcome::Success, Some(status))
            }
            Err(error) if error.is_cancelled() => {
                log_warn!(
                    component = "worker",
                    event = "job_cancelled",
                    job = %job.name
                );
                (JobOutcome::Cancelled, None)
            }
            Err(error) => {
                log_error!(
                    component = "worker",
                    event = "job_failed",
                    job = %job.name,
                    tenant = %job.tenant_id,
                    shard = job.shard,
                    level = job.compaction_level,
                    error = %error
                );
                (
                    JobOutcome::Failure,
                    Some(job.status_update(CompactionStatus::Failure)),
                )
            }
        };
        let elapsed = started.elapsed();
        self.metrics.record_job_finished(outcome, elapsed);
        log_debug!(
            component = "worker",
            event = "job_finished",
            job = %job.name,
            outcome = outcome.as_str(),
            elapsed_ms = elapsed.as_millis() as u64
        );

        let mut state = self.state.lock();
        let current = state.active_jobs.remove(&job.name);
        if let Some(mut status) = status {
            if let Some(current) = current {
                status.commit_index = current.commit_index;
            }
            state.pending_status_updates.insert(job.name.clone(), status);
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("config", &self.config)
            .field("load", &self.load())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use futures_util::future::BoxFuture;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::{
        block::TenantService,
        compaction::JobNaming,
        metastore::PollCompactionJobsResponse,
    };

    /// Hands out a fixed number of jobs per poll and records requests.
    #[derive(Default)]
    struct ScriptedClient {
        requests: Mutex<Vec<PollCompactionJobsRequest>>,
        fail: AtomicBool,
    }

    impl ScriptedClient {
        fn requests(&self) -> Vec<PollCompactionJobsRequest> {
            self.requests.lock().clone()
        }

        fn last(&self) -> PollCompactionJobsRequest {
            self.requests().pop().expect("polled")
        }
    }

    impl MetastoreClient for ScriptedClient {
        fn poll_compaction_jobs<'a>(
            &'a self,
            request: PollCompactionJobsRequest,
        ) -> BoxFuture<'a, Result<PollCompactionJobsResponse, PollError>> {
            Box::pin(async move {
                self.requests.lock().push(request.clone());
                if self.fail.load(Ordering::SeqCst) {
                    return Err(PollError::Transport("connection refused".into()));
                }
                let compaction_jobs = (0..request.job_capacity).map(|_| job()).collect();
                Ok(PollCompactionJobsResponse { compaction_jobs })
            })
        }
    }

    /// Holds every job until a permit is released.
    struct GatedCompactor {
        gate: Semaphore,
        fail: bool,
    }

    impl GatedCompactor {
        fn new(fail: bool) -> Self {
            Self {
                gate: Semaphore::new(0),
                fail,
            }
        }
    }

    impl BlockCompactor for GatedCompactor {
        fn compact(
            &self,
            blocks: Vec<BlockMeta>,
            _options: CompactionOptions,
            cancel: CancellationToken,
        ) -> BoxFuture<'_, Result<Vec<BlockMeta>, CompactError>> {
            Box::pin(async move {
                tokio::select! {
                    _ = cancel.cancelled() => Err(CompactError::Cancelled),
                    permit = self.gate.acquire() => {
                        permit.map_err(|e| CompactError::Failed(e.to_string()))?.forget();
                        if self.fail {
                            return Err(CompactError::Failed("corrupt block".into()));
                        }
                        let level = blocks[0].compaction_level + 1;
                        Ok(vec![BlockMeta::new(blocks[0].shard, level, total_size(&blocks))])
                    }
                }
            })
        }
    }

    fn job() -> CompactionJob {
        let mut job = CompactionJob::new(
            1,
            "tenant",
            0,
            vec![BlockMeta::new(1, 0, 10), BlockMeta::new(1, 0, 20)],
            JobNaming::default(),
        );
        job.commit_index = 5;
        job
    }

    fn worker(
        capacity: usize,
        client: Arc<ScriptedClient>,
        compactor: Arc<GatedCompactor>,
    ) -> Worker {
        Worker::new(
            WorkerConfig::default().with_job_capacity(capacity),
            client,
            compactor,
        )
    }

    #[tokio::test]
    async fn capacity_accounts_for_active_and_pending_jobs() {
        let client = Arc::new(ScriptedClient::default());
        let compactor = Arc::new(GatedCompactor::new(false));
        let worker = worker(3, Arc::clone(&client), Arc::clone(&compactor));
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        // Fill two slots with running jobs.
        worker.poll().await;
        assert_eq!(client.last().job_capacity, 3);
        {
            let mut state = worker.state.lock();
            let extra: Vec<String> = state.pending_jobs.keys().skip(2).cloned().collect();
            for name in extra {
                state.pending_jobs.remove(&name);
            }
        }
        assert_eq!(worker.start_pending_jobs(&mut tasks, &cancel), 2);

        // One more assignment stays pending.
        worker.poll().await;
        assert_eq!(client.last().job_capacity, 1);
        assert_eq!(client.last().job_status_updates.len(), 2);
        assert_eq!(
            worker.load(),
            WorkerLoad {
                pending_jobs: 1,
                active_jobs: 2,
                pending_status_updates: 0,
            }
        );

        worker.poll().await;
        let full = client.last();
        assert_eq!(full.job_capacity, 0);
        assert!(full
            .job_status_updates
            .iter()
            .all(|update| update.status == CompactionStatus::InProgress && update.commit_index == 5));

        // One job finishes; its slot frees up and its status goes out.
        compactor.gate.add_permits(1);
        tasks.join_next().await.expect("task").expect("joined");
        assert_eq!(worker.load().pending_status_updates, 1);
        worker.poll().await;
        let after = client.last();
        assert_eq!(after.job_capacity, 1);
        let statuses: Vec<CompactionStatus> =
            after.job_status_updates.iter().map(|u| u.status).collect();
        assert_eq!(statuses.len(), 2);
        assert!(statuses.contains(&CompactionStatus::Success));
        assert_eq!(worker.load().pending_status_updates, 0);

        cancel.cancel();
        while tasks.join_next().await.is_some() {}
    }

    #[tokio::test]
    async fn failed_poll_keeps_state() {
        let client = Arc::new(ScriptedClient::default());
        let compactor = Arc::new(GatedCompactor::new(true));
        let worker = worker(1, Arc::clone(&client), Arc::clone(&compactor));
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        worker.poll().await;
        worker.start_pending_jobs(&mut tasks, &cancel);
        compactor.gate.add_permits(1);
        tasks.join_next().await.expect("task").expect("joined");
        assert_eq!(worker.load().pending_status_updates, 1);

        client.fail.store(true, Ordering::SeqCst);
        worker.poll().await;
        assert_eq!(worker.metrics().snapshot().poll_failures, 1);
        assert_eq!(
            worker.load(),
            WorkerLoad {
                pending_jobs: 0,
                active_jobs: 0,
                pending_status_updates: 1,
            }
        );

        client.fail.store(false, Ordering::SeqCst);
        worker.poll().await;
        let retried = client.last();
        assert_eq!(retried.job_status_updates.len(), 1);
        assert_eq!(retried.job_status_updates[0].status, CompactionStatus::Failure);
        assert!(retried.job_status_updates[0].completed_job.is_none());
        assert_eq!(worker.load().pending_status_updates, 0);
        assert_eq!(worker.metrics().snapshot().jobs_failed, 1);
    }

    #[tokio::test]
    async fn cancelled_jobs_report_nothing() {
        let client = Arc::new(ScriptedClient::default());
        let compactor = Arc::new(GatedCompactor::new(false));
        let worker = worker(2, Arc::clone(&client), compactor);
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        worker.poll().await;
        assert_eq!(worker.start_pending_jobs(&mut tasks, &cancel), 2);
        cancel.cancel();
        while let Some(joined) = tasks.join_next().await {
            joined.expect("joined");
        }
        assert_eq!(worker.load(), WorkerLoad::default());
        assert_eq!(worker.metrics().snapshot().jobs_cancelled, 2);
    }

    #[tokio::test]
    async fn idle_full_worker_skips_poll() {
        let client = Arc::new(ScriptedClient::default());
        let compactor = Arc::new(GatedCompactor::new(false));
        let worker = worker(1, Arc::clone(&client), compactor);
        worker.poll().await;
        assert_eq!(worker.load().pending_jobs, 1);
        // Full and nothing to report.
        worker.poll().await;
        assert_eq!(client.requests().len(), 1);
    }

    #[tokio::test]
    async fn run_stops_on_cancel_and_joins_jobs() {
        let client = Arc::new(ScriptedClient::default());
        let compactor = Arc::new(GatedCompactor::new(false));
        let config = WorkerConfig::default()
            .with_job_capacity(2)
            .with_poll_interval(std::time::Duration::from_millis(10));
        let worker = Worker::new(config, client.clone(), compactor);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let worker = worker.clone();
            let cancel = cancel.clone();
            async move { worker.run(cancel).await }
        });
        while worker.load().active_jobs < 2 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        cancel.cancel();
        handle.await.expect("run");
        assert_eq!(worker.load().active_jobs, 0);
        assert_eq!(worker.metrics().snapshot().jobs_cancelled, 2);
    }

    #[tokio::test]
    async fn reassigned_running_job_is_not_started_twice() {
        let client = Arc::new(ScriptedClient::default());
        let compactor = Arc::new(GatedCompactor::new(false));
        let worker = worker(1, Arc::clone(&client), Arc::clone(&compactor));
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        worker.poll().await;
        assert_eq!(worker.start_pending_jobs(&mut tasks, &cancel), 1);
        let running = worker.state.lock().active_jobs.values().next().cloned().expect("active");
        let mut renewed = running.clone();
        renewed.commit_index = 9;
        worker
            .state
            .lock()
            .pending_jobs
            .insert(renewed.name.clone(), renewed);

        assert_eq!(worker.start_pending_jobs(&mut tasks, &cancel), 0);
        assert_eq!(tasks.len(), 1);
        assert_eq!(
            worker.load(),
            WorkerLoad {
                pending_jobs: 0,
                active_jobs: 1,
                pending_status_updates: 0,
            }
        );
        worker.poll().await;
        let renewal = client.last();
        assert_eq!(renewal.job_status_updates.len(), 1);
        assert_eq!(renewal.job_status_updates[0].status, CompactionStatus::InProgress);
        assert_eq!(renewal.job_status_updates[0].commit_index, 9);

        compactor.gate.add_permits(1);
        tasks.join_next().await.expect("task").expect("joined");
        worker.poll().await;
        let report = client.last();
        assert_eq!(report.job_status_updates.len(), 1);
        assert_eq!(report.job_status_updates[0].job_name, running.name);
        assert_eq!(report.job_status_updates[0].status, CompactionStatus::Success);
        assert_eq!(report.job_status_updates[0].commit_index, 9);
        assert_eq!(worker.metrics().snapshot().jobs_succeeded, 1);
    }

    #[test]
    fn merge_memory_skips_unresolvable_services() {
        let service = TenantService {
            size: 100,
            table_of_contents: vec![0, 60, 90],
            ..TenantService::default()
        };
        let broken = TenantService {
            table_of_contents: vec![0],
            ..TenantService::default()
        };
        let block = BlockMeta::new(1, 0, 100)
            .with_tenant_service(service)
            .with_tenant_service(broken);
        assert_eq!(estimated_merge_memory(&[block]), 10 * 4 + 30 * 4 + 60);
    }
}
