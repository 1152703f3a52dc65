//! Point-in-time flattened views handed to external readers. Built
//! under the cache lock, then immutable: readers share the `Arc`, and
//! later cache activity only ever swaps in a whole new snapshot.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobRecord;
use crate::pod::{PodRecord, PodState};
use crate::resource::Resource;
use crate::status::JobState;
use crate::task::TaskRecord;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub taken_at: Option<DateTime<Utc>>,
    /// Jobs whose status carries the running marker.
    pub running_jobs: usize,
    pub jobs: BTreeMap<String, JobView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub user: Option<String>,
    pub state: Option<JobState>,
    pub resource: Resource,
    pub tasks: Vec<TaskView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskView {
    pub name: String,
    pub resource: Resource,
    /// Every recorded attempt, not just the live pods.
    pub pods: Vec<PodView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodView {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub running_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub run_secs: i64,
    pub state: PodState,
    pub retry_count: i32,
    pub gpu_type: Option<String>,
    pub resource: Resource,
}

impl JobView {
    pub fn flatten(job: &JobRecord) -> JobView {
        let mut tasks: Vec<TaskView> = job.tasks.values().map(TaskView::flatten).collect();
        tasks.sort_by(|a, b| a.name.cmp(&b.name));
        JobView {
            uid: job.uid.clone(),
            name: job.name.clone(),
            namespace: job.namespace.clone(),
            user: job.user.clone(),
            state: job.status.as_ref().map(|s| s.state),
            resource: job.resource.clone(),
            tasks,
        }
    }
}

impl TaskView {
    pub fn flatten(task: &TaskRecord) -> TaskView {
        let mut pods: Vec<PodView> = task.all_pods.values().map(PodView::flatten).collect();
        pods.sort_by(|a, b| a.name.cmp(&b.name).then(a.retry_count.cmp(&b.retry_count)));
        TaskView { name: task.name.clone(), resource: task.resource.clone(), pods }
    }
}

impl PodView {
    pub fn flatten(pod: &PodRecord) -> PodView {
        PodView {
            uid: pod.uid.clone(),
            name: pod.name.clone(),
            namespace: pod.namespace.clone(),
            running_at: pod.running_at,
            completed_at: pod.completed_at,
            run_secs: pod.run_secs,
            state: pod.state.clone(),
            retry_count: pod.retry_count,
            gpu_type: pod.gpu_type.clone(),
            resource: pod.resource.clone(),
        }
    }
}
