//! Task-level aggregation: the live pods backing one task role plus
//! the full history of attempts.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::pod::PodRecord;
use crate::resource::Resource;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub name: String,
    pub job_key: String,
    pub task_key: String,
    /// Current pod per pod name; a superseded attempt is overwritten.
    pub pods: FxHashMap<String, PodRecord>,
    /// One entry per distinct attempt (`ns/job/task/pod/retry`),
    /// never pruned except through job cleanup.
    pub all_pods: FxHashMap<String, PodRecord>,
    /// Sum of `resource` over `pods`. Attempts retained only in
    /// `all_pods` do not contribute.
    pub resource: Resource,
}

impl TaskRecord {
    /// Empty task seeded with the identity of the pod that caused it.
    pub fn new(pod: &PodRecord) -> TaskRecord {
        TaskRecord {
            name: pod.task_name.clone(),
            job_key: pod.job_key.clone(),
            task_key: pod.task_key.clone(),
            ..TaskRecord::default()
        }
    }

    /// Insert or replace one pod, keeping `resource` equal to the sum
    /// of the live pods: subtract the superseded footprint, add the
    /// new one.
    pub fn upsert_pod(&mut self, pod: PodRecord) {
        match self.pods.get(&pod.name) {
            Some(prev) => {
                if prev.resource != pod.resource {
                    self.resource.sub(&prev.resource);
                    self.resource.add(&pod.resource);
                }
            }
            None => self.resource.add(&pod.resource),
        }
        self.all_pods.insert(pod.attempt_key(), pod.clone());
        self.pods.insert(pod.name.clone(), pod);
    }

    /// The invariant `resource == sum(pods)` — checked by tests after
    /// every event.
    pub fn summed_pod_resource(&self) -> Resource {
        let mut sum = Resource::default();
        for pod in self.pods.values() {
            sum.add(&pod.resource);
        }
        sum
    }
}
