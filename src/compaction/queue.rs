//! A priority queue for compaction jobs.
//!
//! Jobs that were never assigned come first, then jobs ordered by lease
//! deadline, compaction level and name. The queue is consulted by the metastore
//! when workers poll for work.
//!
//! Workers own jobs while they are in progress. Ownership is implemented with
//! lease deadlines and fencing tokens: every assignment stamps the job with the
//! token of the command that assigned it, and any later update carrying a lower
//! token comes from a superseded owner and is rejected.

use std::{collections::HashMap, time::Duration};

use parking_lot::Mutex;

use crate::{
    compaction::{
        heap::{Handle, HeapItem, IndexedHeap},
        job::{CompactionJob, CompactionStatus},
    },
    observability::{log_debug, log_warn},
};

/// Scheduling status of a queued job. Variant order is priority order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum EntryStatus {
    Initial,
    InProgress,
}

/// Scheduling projection of a job.
///
/// `job` is the durable record; every change to status, deadline or token is
/// mirrored into it so the persisted and in-memory views never diverge.
#[derive(Debug)]
pub(crate) struct JobQueueEntry {
    name: String,
    shard: u32,
    tenant: String,
    level: u32,
    deadline: i64,
    token: u64,
    status: EntryStatus,
    index: usize,
    job: CompactionJob,
}

impl JobQueueEntry {
    fn load(job: CompactionJob) -> Self {
        let status = if job.status == CompactionStatus::InProgress {
            EntryStatus::InProgress
        } else {
            EntryStatus::Initial
        };
        Self {
            name: job.name.clone(),
            shard: job.shard,
            tenant: job.tenant_id.clone(),
            level: job.compaction_level,
            deadline: job.lease_expires_at,
            token: job.commit_index,
            status,
            index: 0,
            job,
        }
    }

    fn lease(&mut self, deadline: i64, token: u64) {
        self.deadline = deadline;
        self.status = EntryStatus::InProgress;
        self.token = token;
        self.job.status = CompactionStatus::InProgress;
        self.job.lease_expires_at = deadline;
        self.job.commit_index = token;
    }
}

impl HeapItem for JobQueueEntry {
    fn less(&self, other: &Self) -> bool {
        if self.status != other.status {
            // Jobs nobody holds go first.
            return self.status < other.status;
        }
        if self.deadline != other.deadline {
            // Expired leases surface before live ones.
            return self.deadline < other.deadline;
        }
        if self.level != other.level {
            // Keep the level-0 backlog small.
            return self.level < other.level;
        }
        self.name < other.name
    }

    fn set_index(&mut self, index: usize) {
        self.index = index;
    }

    fn index(&self) -> usize {
        self.index
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    jobs: HashMap<String, Handle>,
    pq: IndexedHeap<JobQueueEntry>,
}

impl QueueInner {
    fn entry(&self, name: &str) -> Option<(Handle, &JobQueueEntry)> {
        let handle = *self.jobs.get(name)?;
        self.pq.get(handle).map(|entry| (handle, entry))
    }
}

/// Lease-based priority queue of live compaction jobs.
#[derive(Debug)]
pub struct JobQueue {
    inner: Mutex<QueueInner>,
    lease: i64,
}

impl JobQueue {
    /// Create a queue that grants leases of `lease`.
    ///
    /// Holders should renew at an interval not exceeding half the lease.
    pub fn new(lease: Duration) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            lease: i64::try_from(lease.as_millis()).unwrap_or(i64::MAX),
        }
    }

    /// Lease duration in milliseconds.
    pub fn lease_ms(&self) -> i64 {
        self.lease
    }

    /// Add a job. Returns `false` if a job with the same name is already queued.
    pub fn enqueue(&self, job: CompactionJob) -> bool {
        let mut inner = self.inner.lock();
        if inner.jobs.contains_key(&job.name) {
            return false;
        }
        let name = job.name.clone();
        let handle = inner.pq.push(JobQueueEntry::load(job));
        inner.jobs.insert(name, handle);
        true
    }

    /// Assign the highest priority job, leasing it until `now + lease` under
    /// fencing `token`.
    ///
    /// Returns `None` if the queue is empty or every job holds a live lease. A
    /// job whose lease expired is taken away from its previous owner.
    pub fn dequeue(&self, now: i64, token: u64) -> Option<CompactionJob> {
        let mut inner = self.inner.lock();
        let handle = inner.pq.peek_handle()?;
        let deadline = now.saturating_add(self.lease);
        let entry = inner.pq.get_mut(handle)?;
        if entry.status == EntryStatus::InProgress && now <= entry.deadline {
            return None;
        }
        if entry.status == EntryStatus::InProgress {
            log_debug!(
                component = "queue",
                event = "lease_revoked",
                job = %entry.name,
                shard = entry.shard,
                tenant = %entry.tenant,
                level = entry.level,
                expired_at = entry.deadline,
                previous_token = entry.token,
                token
            );
        }
        entry.lease(deadline, token);
        let job = entry.job.clone();
        inner.pq.fix(handle);
        Some(job)
    }

    /// Renew the lease of `name` held under `token`.
    ///
    /// Returns `false` if the job is unknown or `token` is behind the
    /// recorded one.
    pub fn update(&self, name: &str, now: i64, token: u64) -> bool {
        let mut inner = self.inner.lock();
        let Some(handle) = inner.jobs.get(name).copied() else {
            return false;
        };
        let deadline = now.saturating_add(self.lease);
        let Some(entry) = inner.pq.get_mut(handle) else {
            return false;
        };
        if entry.token > token {
            log_warn!(
                component = "queue",
                event = "stale_lease_renewal",
                job = %name,
                token,
                current_token = entry.token
            );
            return false;
        }
        entry.lease(deadline, token);
        // The deadline moved forward, so the job sinks below fresher ones.
        inner.pq.fix(handle);
        true
    }

    /// Check whether `token` may evict `name` without evicting it.
    pub fn peek_evict(&self, name: &str, token: u64) -> bool {
        let inner = self.inner.lock();
        match inner.entry(name) {
            Some((_, entry)) => entry.token <= token,
            None => true,
        }
    }

    /// Remove `name` from the queue.
    ///
    /// Returns `false` if `token` is behind the recorded one. Evicting an
    /// unknown job succeeds.
    pub fn evict(&self, name: &str, token: u64) -> bool {
        let mut inner = self.inner.lock();
        let Some((handle, entry)) = inner.entry(name) else {
            return true;
        };
        if entry.token > token {
            log_warn!(
                component = "queue",
                event = "stale_eviction",
                job = %name,
                token,
                current_token = entry.token
            );
            return false;
        }
        inner.pq.remove(handle);
        inner.jobs.remove(name);
        true
    }

    /// Insert a job without maintaining heap order; see [`JobQueue::rebuild`].
    pub fn put_job(&self, job: CompactionJob) {
        let mut inner = self.inner.lock();
        if let Some(handle) = inner.jobs.remove(&job.name) {
            inner.pq.remove(handle);
        }
        let name = job.name.clone();
        let handle = inner.pq.push_unordered(JobQueueEntry::load(job));
        inner.jobs.insert(name, handle);
    }

    /// Restore heap order after bulk loading with [`JobQueue::put_job`].
    pub fn rebuild(&self) {
        self.inner.lock().pq.rebuild();
    }

    /// Record of the job [`JobQueue::dequeue`] would consider next.
    pub fn peek(&self) -> Option<CompactionJob> {
        self.inner.lock().pq.peek().map(|entry| entry.job.clone())
    }

    /// Put back records captured before a mutation that could not be made
    /// durable.
    pub fn restore(&self, jobs: Vec<CompactionJob>) {
        if jobs.is_empty() {
            return;
        }
        for job in jobs {
            self.put_job(job);
        }
        self.rebuild();
    }

    /// Current record of a queued job.
    pub fn job(&self, name: &str) -> Option<CompactionJob> {
        let inner = self.inner.lock();
        inner.entry(name).map(|(_, entry)| entry.job.clone())
    }

    /// Records of all queued jobs, in heap array order.
    pub fn jobs(&self) -> Vec<CompactionJob> {
        let inner = self.inner.lock();
        inner.pq.iter().map(|entry| entry.job.clone()).collect()
    }

    /// Returns `true` if `name` is queued.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.lock().jobs.contains_key(name)
    }

    /// Number of queued jobs.
    pub fn len(&self) -> usize {
        self.inner.lock().pq.len()
    }

    /// Returns `true` if no jobs are queued.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().pq.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;
    use crate::{block::BlockMeta, compaction::strategy::JobNaming};

    const LEASE: Duration = Duration::from_millis(100);

    fn job(name: &str, level: u32) -> CompactionJob {
        let mut job = CompactionJob::new(
            1,
            "tenant",
            level,
            vec![BlockMeta::new(1, level, 1)],
            JobNaming::default(),
        );
        job.name = name.to_string();
        job
    }

    fn leased(name: &str, level: u32, deadline: i64, token: u64) -> CompactionJob {
        let mut job = job(name, level);
        job.status = CompactionStatus::InProgress;
        job.lease_expires_at = deadline;
        job.commit_index = token;
        job
    }

    #[test]
    fn enqueue_rejects_duplicates() {
        let queue = JobQueue::new(LEASE);
        assert!(queue.enqueue(job("a", 0)));
        assert!(!queue.enqueue(job("a", 3)));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.job("a").map(|j| j.compaction_level), Some(0));
    }

    #[test]
    fn dequeue_empty_queue() {
        let queue = JobQueue::new(LEASE);
        assert!(queue.dequeue(0, 1).is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn dequeue_order_prefers_unassigned_then_lower_level() {
        let queue = JobQueue::new(LEASE);
        queue.enqueue(leased("in-progress", 2, 50, 1));
        queue.enqueue(job("level-5", 5));
        queue.enqueue(job("level-1", 1));

        let first = queue.dequeue(0, 10).expect("first");
        assert_eq!(first.name, "level-1");
        let second = queue.dequeue(0, 11).expect("second");
        assert_eq!(second.name, "level-5");
        assert!(queue.dequeue(0, 12).is_none());
        assert!(queue.dequeue(50, 12).is_none());

        let reclaimed = queue.dequeue(51, 13).expect("expired lease");
        assert_eq!(reclaimed.name, "in-progress");
        assert_eq!(reclaimed.commit_index, 13);
    }

    #[test]
    fn dequeue_stamps_lease_into_record() {
        let queue = JobQueue::new(LEASE);
        queue.enqueue(job("a", 0));
        let assigned = queue.dequeue(1_000, 7).expect("assigned");
        assert_eq!(assigned.status, CompactionStatus::InProgress);
        assert_eq!(assigned.commit_index, 7);
        assert_eq!(assigned.lease_expires_at, 1_100);
        assert_eq!(queue.job("a"), Some(assigned));
    }

    #[test]
    fn lease_is_exclusive_until_deadline() {
        let queue = JobQueue::new(LEASE);
        queue.enqueue(job("a", 0));
        assert!(queue.dequeue(0, 1).is_some());
        assert!(queue.dequeue(50, 2).is_none());
        assert!(queue.dequeue(100, 3).is_none());
        let stolen = queue.dequeue(101, 4).expect("reclaimed");
        assert_eq!(stolen.commit_index, 4);
    }

    #[test]
    fn concurrent_dequeue_hands_job_out_once() {
        let queue = Arc::new(JobQueue::new(Duration::from_secs(60)));
        queue.enqueue(job("only", 0));
        let threads: Vec<_> = (0..8u64)
            .map(|token| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || queue.dequeue(0, token + 1).map(|job| job.name))
            })
            .collect();
        let assigned: Vec<String> = threads
            .into_iter()
            .filter_map(|t| t.join().expect("thread"))
            .collect();
        assert_eq!(assigned, vec!["only".to_string()]);
    }

    #[test]
    fn update_extends_lease_and_reorders() {
        let queue = JobQueue::new(LEASE);
        queue.enqueue(job("a", 0));
        queue.enqueue(job("b", 0));
        assert_eq!(queue.dequeue(0, 1).map(|j| j.name), Some("a".into()));
        assert_eq!(queue.dequeue(10, 2).map(|j| j.name), Some("b".into()));
        // "a" expires first, but renewing it pushes it behind "b".
        assert!(queue.update("a", 50, 1));
        assert_eq!(queue.job("a").map(|j| j.lease_expires_at), Some(150));
        assert_eq!(queue.dequeue(111, 3).map(|j| j.name), Some("b".into()));
    }

    #[test]
    fn update_rejects_stale_token_and_unknown_job() {
        let queue = JobQueue::new(LEASE);
        queue.enqueue(job("a", 0));
        queue.dequeue(0, 5);
        assert!(!queue.update("a", 10, 4));
        assert_eq!(queue.job("a").map(|j| j.lease_expires_at), Some(100));
        assert!(!queue.update("missing", 10, 5));
    }

    #[test]
    fn evict_respects_fencing() {
        let queue = JobQueue::new(LEASE);
        queue.enqueue(job("a", 0));
        queue.dequeue(0, 5);
        queue.dequeue(200, 9);
        assert!(!queue.peek_evict("a", 5));
        assert!(!queue.evict("a", 5));
        assert!(queue.contains("a"));
        assert!(queue.peek_evict("a", 9));
        assert!(queue.contains("a"));
        assert!(queue.evict("a", 9));
        assert!(!queue.contains("a"));
        assert!(queue.evict("a", 0));
        assert!(queue.peek_evict("a", 0));
    }

    #[test]
    fn bulk_load_then_rebuild() {
        let queue = JobQueue::new(LEASE);
        queue.put_job(leased("c", 0, 500, 3));
        queue.put_job(job("b", 2));
        queue.put_job(job("a", 1));
        queue.rebuild();
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dequeue(0, 10).map(|j| j.name), Some("a".into()));
        assert_eq!(queue.dequeue(0, 11).map(|j| j.name), Some("b".into()));
        assert!(queue.dequeue(0, 12).is_none());
        // The restored lease keeps its token.
        assert!(!queue.update("c", 0, 2));
        assert!(queue.update("c", 0, 3));
    }

    #[test]
    fn restore_undoes_assignment() {
        let queue = JobQueue::new(LEASE);
        queue.enqueue(job("a", 0));
        queue.enqueue(job("b", 1));
        let before = queue.peek().expect("root");
        assert_eq!(before.name, "a");
        let leased = queue.dequeue(0, 3).expect("leased");
        assert_eq!(queue.peek().map(|j| j.name), Some("b".into()));
        queue.restore(vec![before.clone()]);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.peek(), Some(before));
        assert_ne!(queue.job("a"), Some(leased));
    }

    #[derive(Clone, Debug)]
    enum Op {
        Dequeue(i64),
        Update(u8, i64, u64),
        Evict(u8, u64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0i64..1_000).prop_map(Op::Dequeue),
            (0u8..4, 0i64..1_000, 0u64..64).prop_map(|(j, now, t)| Op::Update(j, now, t)),
            (0u8..4, 0u64..64).prop_map(|(j, t)| Op::Evict(j, t)),
        ]
    }

    proptest! {
        #[test]
        fn stale_tokens_never_mutate(ops in proptest::collection::vec(op(), 1..64)) {
            let queue = JobQueue::new(LEASE);
            for i in 0..4u8 {
                queue.enqueue(job(&format!("job-{i}"), u32::from(i)));
            }
            let mut next_token = 100u64;
            for op in ops {
                match op {
                    Op::Dequeue(now) => {
                        next_token += 1;
                        queue.dequeue(now, next_token);
                    }
                    Op::Update(j, now, token) => {
                        let name = format!("job-{j}");
                        let before = queue.job(&name);
                        let observed = before.as_ref().map(|job| job.commit_index);
                        let accepted = queue.update(&name, now, token);
                        if let Some(current) = observed {
                            if token < current {
                                prop_assert!(!accepted);
                                prop_assert_eq!(queue.job(&name), before);
                            } else {
                                prop_assert!(accepted);
                                prop_assert_eq!(queue.job(&name).map(|j| j.commit_index), Some(token));
                            }
                        }
                    }
                    Op::Evict(j, token) => {
                        let name = format!("job-{j}");
                        let before = queue.job(&name);
                        let accepted = queue.evict(&name, token);
                        match before {
                            Some(job) if token < job.commit_index => {
                                prop_assert!(!accepted);
                                prop_assert_eq!(queue.job(&name), Some(job));
                            }
                            _ => {
                                prop_assert!(accepted);
                                prop_assert!(!queue.contains(&name));
                            }
                        }
                    }
                }
            }
        }
    }
}
