//! The aggregation cache: a live index of billable work (job → task →
//! pod) built incrementally from two independent watch streams, with
//! atomically swapped snapshots for readers.
//!
//! Consistency model: one mutex guards the three maps; every event is
//! applied in full under it, so readers of a snapshot never observe a
//! half-applied event. Snapshot consumers share an immutable `Arc`
//! and never touch the lock.

#![forbid(unsafe_code)]

use std::collections::hash_map::Entry;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use tally_core::{
    ClusterSnapshot, JobRecord, JobView, PodRecord, TaskRecord, LABEL_PLATFORM_USER,
};
use tally_kubehub::{BillingEvent, TrainingJob};

#[derive(Default)]
struct Maps {
    pods: FxHashMap<String, PodRecord>,
    tasks: FxHashMap<String, TaskRecord>,
    jobs: FxHashMap<String, JobRecord>,
}

/// The in-memory hierarchical index. All mutation goes through
/// [`AggregationCache::apply_event`] (or the typed `apply_*` methods)
/// and the explicit [`AggregationCache::cleanup`] hook.
#[derive(Default)]
pub struct AggregationCache {
    inner: Mutex<Maps>,
    published: ArcSwapOption<ClusterSnapshot>,
}

impl AggregationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one watch notification. Pod and job deletions re-enter
    /// the same upsert path with last-known state; records only leave
    /// the cache through [`cleanup`](Self::cleanup).
    pub fn apply_event(&self, event: &BillingEvent) {
        match event {
            BillingEvent::PodApplied(pod) | BillingEvent::PodDeleted(pod) => {
                self.apply_pod(pod);
            }
            BillingEvent::JobApplied(job) | BillingEvent::JobDeleted(job) => {
                self.apply_job(job);
            }
        }
        counter!("tally_events_total").increment(1);
    }

    /// Upsert one pod. Returns `false` when the pod resolves to no
    /// billing owner (missing association annotations) — a normal
    /// outcome, the cache is left untouched.
    pub fn apply_pod(&self, pod: &Pod) -> bool {
        let Some(mut rec) = PodRecord::project(pod) else {
            trace!(
                pod = pod.metadata.name.as_deref().unwrap_or(""),
                "pod has no billing association; skipped"
            );
            return false;
        };

        let mut maps = self.lock();
        if let Some(prev) = maps.pods.get(&rec.name) {
            rec.merge_prior(prev);
        }
        // Task level: seed or replace the pod, then propagate the
        // exact delta up to the job via the refreshed task aggregate.
        let task = {
            let task = maps
                .tasks
                .entry(rec.task_key.clone())
                .or_insert_with(|| TaskRecord::new(&rec));
            task.upsert_pod(rec.clone());
            task.clone()
        };
        match maps.jobs.entry(rec.job_key.clone()) {
            Entry::Occupied(mut entry) => entry.get_mut().upsert_task(&task),
            Entry::Vacant(entry) => {
                let job = entry.insert(JobRecord::implicit(&task));
                job.upsert_task(&task);
            }
        }
        debug!(pod = %rec.name, task = %rec.task_key, "pod applied");
        maps.pods.insert(rec.name.clone(), rec);
        true
    }

    /// Upsert one job resource. An existing record (possibly created
    /// implicitly by pods) absorbs identity and status only; the
    /// tasks/resource built from pods are preserved.
    pub fn apply_job(&self, job: &TrainingJob) -> bool {
        let Some(name) = job.metadata.name.clone() else {
            return false;
        };
        let namespace = job.metadata.namespace.clone().unwrap_or_default();
        let user = job
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(LABEL_PLATFORM_USER))
            .cloned();
        let incoming = JobRecord::explicit(
            job.metadata.uid.clone().unwrap_or_default(),
            name,
            namespace,
            user,
            job.status.clone(),
        );

        let mut maps = self.lock();
        match maps.jobs.entry(incoming.job_key.clone()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().absorb(incoming);
            }
            Entry::Vacant(entry) => {
                debug!(job = %incoming.job_key, "job added");
                entry.insert(incoming);
            }
        }
        true
    }

    /// Remove a job and everything beneath it. This is the only
    /// removal path in the system. Returns `false` when the key is
    /// unknown.
    pub fn cleanup(&self, job_key: &str) -> bool {
        let mut maps = self.lock();
        let Some(job) = maps.jobs.remove(job_key) else {
            debug!(job = %job_key, "cleanup: job not found");
            return false;
        };
        for task in job.tasks.values() {
            for pod_name in task.pods.keys() {
                maps.pods.remove(pod_name);
            }
            maps.tasks.remove(&task.task_key);
        }
        info!(job = %job_key, "job cleaned up");
        true
    }

    /// Latest published snapshot; produces one synchronously for the
    /// first caller after startup.
    pub fn snapshot(&self) -> Arc<ClusterSnapshot> {
        if let Some(snap) = self.published.load_full() {
            return snap;
        }
        self.update_snapshot();
        self.published
            .load_full()
            .unwrap_or_else(|| Arc::new(ClusterSnapshot::default()))
    }

    /// Flatten the whole hierarchy under the lock and atomically
    /// replace the published snapshot.
    pub fn update_snapshot(&self) {
        let snapshot = {
            let maps = self.lock();
            let mut jobs = BTreeMap::new();
            let mut running = 0usize;
            for (key, job) in &maps.jobs {
                if job.running() {
                    running += 1;
                }
                jobs.insert(key.clone(), JobView::flatten(job));
            }
            gauge!("tally_jobs").set(maps.jobs.len() as f64);
            gauge!("tally_pods").set(maps.pods.len() as f64);
            gauge!("tally_running_jobs").set(running as f64);
            ClusterSnapshot { taken_at: Some(Utc::now()), running_jobs: running, jobs }
        };
        self.published.store(Some(Arc::new(snapshot)));
    }

    pub fn get_job(&self, job_key: &str) -> Option<JobRecord> {
        self.lock().jobs.get(job_key).cloned()
    }

    /// Jobs considered running by the latest published snapshot.
    pub fn running_job_count(&self) -> usize {
        self.snapshot().running_jobs
    }

    /// Clones of all job records, keyed by job key.
    pub fn jobs(&self) -> BTreeMap<String, JobRecord> {
        self.lock().jobs.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Clones of all current pod records, keyed by pod name.
    pub fn pods(&self) -> BTreeMap<String, PodRecord> {
        self.lock().pods.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub fn job_count(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn pod_count(&self) -> usize {
        self.lock().pods.len()
    }

    pub fn task_count(&self) -> usize {
        self.lock().tasks.len()
    }

    // Lock poisoning only happens if a panic escaped a critical
    // section; the maps are still structurally sound, so recover.
    fn lock(&self) -> MutexGuard<'_, Maps> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Spawn the ingest loop: drain watch events into the cache and
/// publish a fresh snapshot on a fixed cadence. Closing all senders
/// flushes a final snapshot and stops the loop.
pub fn spawn_ingest(
    cache: Arc<AggregationCache>,
    snapshot_every: Duration,
    capacity: usize,
) -> mpsc::Sender<BillingEvent> {
    let (tx, mut rx) = mpsc::channel::<BillingEvent>(capacity);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(snapshot_every);
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(event) => cache.apply_event(&event),
                        None => {
                            debug!("event channel closed; publishing final snapshot");
                            cache.update_snapshot();
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    cache.update_snapshot();
                }
            }
        }
        info!("ingest loop stopped");
    });
    tx
}
