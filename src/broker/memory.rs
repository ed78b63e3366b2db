//! Embedded partitioned broker.
//!
//! Each partition owns its pending and leased jobs behind its own mutex. An
//! activation request is served in rounds: every round spawns one task per
//! partition, the tasks share a remaining-quota counter, and a round that
//! leases nothing parks the request until a job of the requested type is
//! published, the long-poll deadline passes or the session is cancelled.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::activation::criteria::{ActivationCriteria, DEFAULT_TENANT_ID};
use crate::broker::{
    partition_of, ActivatedJob, BrokerFault, CancelRegistrar, JobBatch, JobKey, JobSink,
    WorkQueueClient, PARTITION_KEY_SHIFT,
};

const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker needs at least one partition")]
    NoPartitions,
    #[error("job {key} belongs to unknown partition {partition}")]
    UnknownPartition { key: JobKey, partition: u32 },
    #[error("job {key} is not currently leased")]
    NotLeased { key: JobKey },
}

/// A job as handed to the broker by the process engine.
#[derive(Clone, Debug, PartialEq)]
pub struct NewJob {
    pub job_type: String,
    pub process_definition_id: String,
    pub process_definition_version: i32,
    pub element_id: String,
    pub retries: i32,
    pub variables: Map<String, Value>,
    pub custom_headers: Map<String, Value>,
    pub tenant_id: String,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            process_definition_id: "process".to_owned(),
            process_definition_version: 1,
            element_id: "task".to_owned(),
            retries: 3,
            variables: Map::new(),
            custom_headers: Map::new(),
            tenant_id: DEFAULT_TENANT_ID.to_owned(),
        }
    }

    #[cfg(test)]
    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    #[cfg(test)]
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }
}

#[derive(Clone, Debug)]
struct StoredJob {
    key: JobKey,
    process_instance_key: JobKey,
    process_definition_key: JobKey,
    element_instance_key: JobKey,
    job: NewJob,
}

impl StoredJob {
    fn matches(&self, criteria: &ActivationCriteria) -> bool {
        self.job.job_type == criteria.job_type()
            && criteria.tenant_ids().contains(&self.job.tenant_id)
    }

    fn activate(&self, criteria: &ActivationCriteria, deadline: DateTime<Utc>) -> ActivatedJob {
        let variables = match criteria.fetch_variables() {
            Some(names) if !names.is_empty() => select_variables(&self.job.variables, names),
            _ => self.job.variables.clone(),
        };
        ActivatedJob {
            key: self.key,
            job_type: self.job.job_type.clone(),
            process_instance_key: self.process_instance_key,
            process_definition_key: self.process_definition_key,
            element_instance_key: self.element_instance_key,
            process_definition_id: self.job.process_definition_id.clone(),
            process_definition_version: self.job.process_definition_version,
            element_id: self.job.element_id.clone(),
            worker: criteria.worker().to_owned(),
            retries: self.job.retries,
            deadline,
            variables,
            custom_headers: self.job.custom_headers.clone(),
            tenant_id: self.job.tenant_id.clone(),
        }
    }
}

fn select_variables(variables: &Map<String, Value>, names: &BTreeSet<String>) -> Map<String, Value> {
    variables
        .iter()
        .filter(|(name, _)| names.contains(*name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

#[derive(Debug)]
struct Lease {
    job: StoredJob,
    worker: String,
    deadline: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct PartitionState {
    next_sequence: i64,
    pending: BTreeMap<JobKey, StoredJob>,
    leased: BTreeMap<JobKey, Lease>,
}

struct Partition {
    id: u32,
    state: Mutex<PartitionState>,
}

impl Partition {
    fn new(id: u32) -> Self {
        Self {
            id,
            state: Mutex::new(PartitionState::default()),
        }
    }

    fn next_key(&self, state: &mut PartitionState) -> JobKey {
        state.next_sequence += 1;
        (i64::from(self.id) << PARTITION_KEY_SHIFT) | state.next_sequence
    }

    fn allocate_key(&self) -> JobKey {
        let mut state = self.lock_state();
        self.next_key(&mut state)
    }

    fn insert(&self, job: NewJob, process_definition_key: JobKey) -> JobKey {
        let mut state = self.lock_state();
        let process_instance_key = self.next_key(&mut state);
        let element_instance_key = self.next_key(&mut state);
        let key = self.next_key(&mut state);
        state.pending.insert(
            key,
            StoredJob {
                key,
                process_instance_key,
                process_definition_key,
                element_instance_key,
                job,
            },
        );
        key
    }

    /// Leases matching pending jobs in key order while the shared quota lasts.
    fn activate(
        &self,
        criteria: &ActivationCriteria,
        quota: &AtomicU32,
        now: DateTime<Utc>,
    ) -> Vec<ActivatedJob> {
        let deadline = lease_deadline(now, criteria.timeout());
        let mut state = self.lock_state();
        let candidates = state
            .pending
            .values()
            .filter(|job| job.matches(criteria))
            .map(|job| job.key)
            .collect::<Vec<_>>();

        let mut activated = Vec::new();
        for key in candidates {
            if !reserve_one(quota) {
                break;
            }
            if let Some(job) = state.pending.remove(&key) {
                activated.push(job.activate(criteria, deadline));
                state.leased.insert(
                    key,
                    Lease {
                        job,
                        worker: criteria.worker().to_owned(),
                        deadline,
                    },
                );
            }
        }
        activated
    }

    /// Moves leased jobs back to pending. Returns the job types that became
    /// available again.
    fn release(&self, keys: &[JobKey]) -> Vec<String> {
        let mut state = self.lock_state();
        let mut released = Vec::new();
        for key in keys {
            if let Some(lease) = state.leased.remove(key) {
                released.push(lease.job.job.job_type.clone());
                state.pending.insert(*key, lease.job);
            }
        }
        released
    }

    fn complete(&self, key: JobKey) -> Result<(), BrokerError> {
        self.lock_state()
            .leased
            .remove(&key)
            .map(|_| ())
            .ok_or(BrokerError::NotLeased { key })
    }

    fn reclaim_expired(&self, now: DateTime<Utc>) -> Vec<String> {
        let expired = self
            .lock_state()
            .leased
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(key, _)| *key)
            .collect::<Vec<_>>();
        if expired.is_empty() {
            return Vec::new();
        }
        let workers = {
            let state = self.lock_state();
            expired
                .iter()
                .filter_map(|key| state.leased.get(key).map(|lease| lease.worker.clone()))
                .collect::<BTreeSet<_>>()
        };
        tracing::debug!(
            target: "jobgate::broker",
            partition_id = self.id,
            expired = expired.len(),
            ?workers,
            "job leases expired"
        );
        self.release(&expired)
    }

    #[cfg(test)]
    fn counts(&self) -> (usize, usize) {
        let state = self.lock_state();
        (state.pending.len(), state.leased.len())
    }

    fn lock_state(&self) -> MutexGuard<'_, PartitionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn reserve_one(quota: &AtomicU32) -> bool {
    quota
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok()
}

fn lease_deadline(now: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|timeout| now.checked_add_signed(timeout))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Wakes parked activation requests when work of their type shows up.
#[derive(Default)]
struct JobAvailability {
    signals: Mutex<HashMap<String, Arc<Notify>>>,
}

impl JobAvailability {
    fn watch(&self, job_type: &str) -> AvailabilityWatch<'_> {
        let mut signals = self.signals.lock().unwrap_or_else(PoisonError::into_inner);
        let signal = Arc::clone(
            signals
                .entry(job_type.to_owned())
                .or_insert_with(|| Arc::new(Notify::new())),
        );
        AvailabilityWatch {
            registry: self,
            job_type: job_type.to_owned(),
            signal,
        }
    }

    fn signal(&self, job_type: &str) {
        let signals = self.signals.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(signal) = signals.get(job_type) {
            signal.notify_waiters();
        }
    }

    #[cfg(test)]
    fn watched_types(&self) -> usize {
        self.signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// A parked request's interest in one job type. Dropping the last watch of
/// a type removes its entry; the map and this watch hold the only two
/// references at that point.
struct AvailabilityWatch<'a> {
    registry: &'a JobAvailability,
    job_type: String,
    signal: Arc<Notify>,
}

impl AvailabilityWatch<'_> {
    fn notified(&self) -> Notified<'_> {
        self.signal.notified()
    }
}

impl Drop for AvailabilityWatch<'_> {
    fn drop(&mut self) {
        let mut signals = self
            .registry
            .signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let unwatched = signals
            .get(&self.job_type)
            .is_some_and(|signal| Arc::strong_count(signal) == 2);
        if unwatched {
            signals.remove(&self.job_type);
        }
    }
}

struct BrokerInner {
    partitions: Vec<Partition>,
    next_partition: AtomicUsize,
    definitions: Mutex<HashMap<(String, i32), JobKey>>,
    availability: JobAvailability,
}

enum RoundOutcome {
    Activated(usize),
    Failed(BrokerFault),
    Empty,
}

impl BrokerInner {
    fn partition_for(&self, key: JobKey) -> Result<&Partition, BrokerError> {
        let partition = partition_of(key);
        partition
            .checked_sub(1)
            .and_then(|index| self.partitions.get(index as usize))
            .ok_or(BrokerError::UnknownPartition { key, partition })
    }

    fn definition_key(&self, job: &NewJob) -> JobKey {
        let mut definitions = self
            .definitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *definitions
            .entry((job.process_definition_id.clone(), job.process_definition_version))
            .or_insert_with(|| self.partitions[0].allocate_key())
    }

    fn release(&self, keys: &[JobKey]) -> usize {
        let mut released = 0;
        for key in keys {
            match self.partition_for(*key) {
                Ok(partition) => {
                    for job_type in partition.release(std::slice::from_ref(key)) {
                        released += 1;
                        self.availability.signal(&job_type);
                    }
                }
                Err(error) => tracing::warn!(target: "jobgate::broker", %error, "cannot release job"),
            }
        }
        released
    }

    fn reclaim_expired(&self, now: DateTime<Utc>) -> usize {
        let mut reclaimed = 0;
        for partition in &self.partitions {
            let job_types = partition.reclaim_expired(now);
            reclaimed += job_types.len();
            for job_type in job_types.iter().collect::<BTreeSet<_>>() {
                self.availability.signal(job_type);
            }
        }
        reclaimed
    }

    /// Work done by one partition task in one round.
    fn deliver_from(
        &self,
        index: usize,
        criteria: &ActivationCriteria,
        sink: &dyn JobSink,
        quota: &AtomicU32,
    ) -> usize {
        if sink.is_cancelled() {
            return 0;
        }
        let partition = &self.partitions[index];
        let jobs = partition.activate(criteria, quota, Utc::now());
        if jobs.is_empty() {
            return 0;
        }

        let batch = JobBatch::new(partition.id, jobs);
        let keys = batch.keys();
        let count = batch.jobs.len();
        if !sink.is_cancelled() && sink.on_next(batch) {
            return count;
        }

        partition.release(&keys);
        self.availability.signal(criteria.job_type());
        tracing::debug!(
            target: "jobgate::broker",
            partition_id = partition.id,
            released = count,
            "session no longer accepts jobs; leases released"
        );
        0
    }

    async fn run_round(
        self: &Arc<Self>,
        criteria: &Arc<ActivationCriteria>,
        sink: &Arc<dyn JobSink>,
        quota: &Arc<AtomicU32>,
    ) -> RoundOutcome {
        let mut round = JoinSet::new();
        for index in 0..self.partitions.len() {
            let inner = Arc::clone(self);
            let criteria = Arc::clone(criteria);
            let sink = Arc::clone(sink);
            let quota = Arc::clone(quota);
            round.spawn(async move { inner.deliver_from(index, &criteria, sink.as_ref(), &quota) });
        }

        let mut activated = 0;
        let mut fault = None;
        while let Some(joined) = round.join_next().await {
            match joined {
                Ok(count) => activated += count,
                Err(error) => {
                    tracing::error!(target: "jobgate::broker", %error, "partition dispatch task failed");
                    fault.get_or_insert_with(|| {
                        BrokerFault::internal(format!("partition dispatch task failed: {error}"))
                    });
                }
            }
        }

        match (activated, fault) {
            (0, Some(fault)) => RoundOutcome::Failed(fault),
            (0, None) => RoundOutcome::Empty,
            (activated, _) => RoundOutcome::Activated(activated),
        }
    }

    async fn dispatch(
        self: Arc<Self>,
        criteria: Arc<ActivationCriteria>,
        sink: Arc<dyn JobSink>,
        cancellation: Arc<dyn CancelRegistrar>,
    ) {
        let stop = Arc::new(Notify::new());
        let stopped = Arc::new(AtomicBool::new(false));
        {
            let stop = Arc::clone(&stop);
            let stopped = Arc::clone(&stopped);
            cancellation.register(Box::new(move || {
                stopped.store(true, Ordering::SeqCst);
                stop.notify_one();
            }));
        }

        let deadline = criteria.request_timeout().map(|timeout| {
            let now = Instant::now();
            now.checked_add(timeout).unwrap_or(now + FAR_FUTURE)
        });
        let quota = Arc::new(AtomicU32::new(criteria.max_jobs_to_activate()));
        let available = self.availability.watch(criteria.job_type());

        loop {
            let notified = available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.reclaim_expired(Utc::now());
            match self.run_round(&criteria, &sink, &quota).await {
                RoundOutcome::Activated(count) => {
                    tracing::debug!(
                        target: "jobgate::broker",
                        job_type = criteria.job_type(),
                        activated = count,
                        "activation round delivered jobs"
                    );
                    sink.on_completed();
                    return;
                }
                RoundOutcome::Failed(fault) => {
                    sink.on_error(fault);
                    return;
                }
                RoundOutcome::Empty => {}
            }

            if stopped.load(Ordering::SeqCst) || sink.is_cancelled() {
                return;
            }
            let Some(deadline) = deadline else {
                sink.on_completed();
                return;
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    sink.on_completed();
                    return;
                }
                _ = stop.notified() => return,
            }
        }
    }
}

/// In-process stand-in for the partitioned broker cluster.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new(partitions: u32) -> Result<Self, BrokerError> {
        if partitions == 0 {
            return Err(BrokerError::NoPartitions);
        }
        Ok(Self {
            inner: Arc::new(BrokerInner {
                partitions: (1..=partitions).map(Partition::new).collect(),
                next_partition: AtomicUsize::new(0),
                definitions: Mutex::new(HashMap::new()),
                availability: JobAvailability::default(),
            }),
        })
    }

    pub fn partition_count(&self) -> usize {
        self.inner.partitions.len()
    }

    /// Creates a pending job on the next partition in round-robin order.
    pub fn publish(&self, job: NewJob) -> JobKey {
        let index = self.inner.next_partition.fetch_add(1, Ordering::Relaxed)
            % self.inner.partitions.len();
        let job_type = job.job_type.clone();
        let definition_key = self.inner.definition_key(&job);
        let key = self.inner.partitions[index].insert(job, definition_key);
        self.inner.availability.signal(&job_type);
        key
    }

    pub fn complete(&self, key: JobKey) -> Result<(), BrokerError> {
        self.inner.partition_for(key)?.complete(key)
    }

    #[cfg(test)]
    pub fn reclaim_expired(&self, now: DateTime<Utc>) -> usize {
        self.inner.reclaim_expired(now)
    }

    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.inner.partitions.iter().map(|partition| partition.counts().0).sum()
    }

    #[cfg(test)]
    pub fn leased_count(&self) -> usize {
        self.inner.partitions.iter().map(|partition| partition.counts().1).sum()
    }
}

impl WorkQueueClient for InMemoryBroker {
    fn activate(
        &self,
        criteria: Arc<ActivationCriteria>,
        sink: Arc<dyn JobSink>,
        cancellation: Arc<dyn CancelRegistrar>,
    ) {
        tokio::spawn(Arc::clone(&self.inner).dispatch(criteria, sink, cancellation));
    }

    fn defer(&self, keys: Vec<JobKey>) {
        let released = self.inner.release(&keys);
        tracing::debug!(target: "jobgate::broker", requested = keys.len(), released, "deferred jobs returned to pending");
    }
}
