//! Tally core types: the billing hierarchy (job → task → pod), its
//! resource arithmetic, and the immutable snapshot views handed to
//! readers.

#![forbid(unsafe_code)]

pub mod job;
pub mod pod;
pub mod resource;
pub mod snapshot;
pub mod status;
pub mod task;

pub use job::JobRecord;
pub use pod::{PodRecord, PodState};
pub use resource::Resource;
pub use snapshot::{ClusterSnapshot, JobView, PodView, TaskView};
pub use status::{JobState, JobStatus};
pub use task::TaskRecord;

/// Annotation carrying the owning job name. A pod without it has no
/// billing owner and is ignored.
pub const ANNOTATION_JOB_NAME: &str = "tally.io/job-name";
/// Annotation carrying the task role name within the job.
pub const ANNOTATION_TASK_NAME: &str = "tally.io/task-name";
/// Node-selector key identifying the accelerator type a pod asks for.
pub const SELECTOR_GPU_TYPE: &str = "resourceType";
/// Job label identifying the platform user billed for the job.
pub const LABEL_PLATFORM_USER: &str = "platform-user";

/// `namespace/job` — one key per billable job.
pub fn job_key(namespace: &str, job: &str) -> String {
    format!("{namespace}/{job}")
}

/// `namespace/job/task` — one key per task role.
pub fn task_key(namespace: &str, job: &str, task: &str) -> String {
    format!("{namespace}/{job}/{task}")
}

/// `namespace/job/task/pod/retry` — one key per pod attempt. The pod
/// name keeps concurrent replicas of one task role distinct, the retry
/// count keeps a replica's successive attempts distinct; together they
/// keep every attempt in a task's `all_pods` map.
pub fn attempt_key(namespace: &str, job: &str, task: &str, pod: &str, retry: i32) -> String {
    format!("{namespace}/{job}/{task}/{pod}/{retry}")
}
