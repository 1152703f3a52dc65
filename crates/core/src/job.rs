//! Job-level aggregation: the tasks of one billable job plus its
//! latest known status.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::job_key;
use crate::resource::Resource;
use crate::status::JobStatus;
use crate::task::TaskRecord;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    /// Platform user billed for this job, from the job's labels.
    pub user: Option<String>,
    pub job_key: String,
    pub tasks: FxHashMap<String, TaskRecord>,
    /// Latest job status; `None` until the job's own event arrives.
    pub status: Option<JobStatus>,
    /// Sum of `resource` over `tasks`.
    pub resource: Resource,
}

impl JobRecord {
    /// Implicit creation: the first pod of a not-yet-seen job arrived
    /// before the job's own event. Identity beyond the key is filled
    /// in when the explicit event shows up.
    pub fn implicit(task: &TaskRecord) -> JobRecord {
        let (namespace, name) = task
            .job_key
            .split_once('/')
            .map(|(ns, job)| (ns.to_string(), job.to_string()))
            .unwrap_or_default();
        JobRecord {
            name,
            namespace,
            job_key: task.job_key.clone(),
            ..JobRecord::default()
        }
    }

    /// Explicit creation from the job resource itself.
    pub fn explicit(
        uid: String,
        name: String,
        namespace: String,
        user: Option<String>,
        status: Option<JobStatus>,
    ) -> JobRecord {
        JobRecord {
            uid,
            job_key: job_key(&namespace, &name),
            name,
            namespace,
            user,
            status,
            ..JobRecord::default()
        }
    }

    /// Merge an explicit job event into an existing record: identity
    /// and status are overwritten, the tasks/resource built from pods
    /// are preserved.
    pub fn absorb(&mut self, incoming: JobRecord) {
        self.uid = incoming.uid;
        self.name = incoming.name;
        self.namespace = incoming.namespace;
        self.user = incoming.user;
        if incoming.status.is_some() {
            self.status = incoming.status;
        }
    }

    /// Insert or replace one task, keeping `resource` equal to the
    /// sum over tasks — the same delta discipline as task→pod.
    pub fn upsert_task(&mut self, task: &TaskRecord) {
        match self.tasks.get(&task.name) {
            Some(prev) => {
                if prev.resource != task.resource {
                    self.resource.sub(&prev.resource);
                    self.resource.add(&task.resource);
                }
            }
            None => self.resource.add(&task.resource),
        }
        self.tasks.insert(task.name.clone(), task.clone());
    }

    pub fn running(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.running())
    }

    pub fn summed_task_resource(&self) -> Resource {
        let mut sum = Resource::default();
        for task in self.tasks.values() {
            sum.add(&task.resource);
        }
        sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pod::PodRecord;
    use crate::status::{JobState, JobStatus};

    fn task(name: &str, milli_cpu: i64) -> TaskRecord {
        let pod = PodRecord {
            name: format!("{name}-0"),
            namespace: "ml".into(),
            job_name: "train-1".into(),
            task_name: name.to_string(),
            job_key: "ml/train-1".into(),
            task_key: format!("ml/train-1/{name}"),
            resource: Resource::new(milli_cpu, 0),
            ..PodRecord::default()
        };
        let mut t = TaskRecord::new(&pod);
        t.upsert_pod(pod);
        t
    }

    #[test]
    fn upsert_task_tracks_sum() {
        let mut job = JobRecord::implicit(&task("worker", 1000));
        job.upsert_task(&task("worker", 1000));
        job.upsert_task(&task("ps", 500));
        assert_eq!(job.resource, Resource::new(1500, 0));
        job.upsert_task(&task("worker", 3000));
        assert_eq!(job.resource, Resource::new(3500, 0));
        assert_eq!(job.resource, job.summed_task_resource());
    }

    #[test]
    fn absorb_keeps_pod_built_state() {
        let mut job = JobRecord::implicit(&task("worker", 1000));
        job.upsert_task(&task("worker", 1000));

        let incoming = JobRecord::explicit(
            "uid-1".into(),
            "train-1".into(),
            "ml".into(),
            Some("alice".into()),
            Some(JobStatus { state: JobState::Running, ..JobStatus::default() }),
        );
        job.absorb(incoming);

        assert_eq!(job.uid, "uid-1");
        assert_eq!(job.user.as_deref(), Some("alice"));
        assert!(job.running());
        assert_eq!(job.tasks.len(), 1);
        assert_eq!(job.resource, Resource::new(1000, 0));
    }

    #[test]
    fn absorb_without_status_preserves_existing() {
        let mut job = JobRecord::explicit(
            "uid-1".into(),
            "train-1".into(),
            "ml".into(),
            None,
            Some(JobStatus { state: JobState::Running, ..JobStatus::default() }),
        );
        let incoming =
            JobRecord::explicit("uid-1".into(), "train-1".into(), "ml".into(), None, None);
        job.absorb(incoming);
        assert!(job.running());
    }

    #[test]
    fn implicit_derives_identity_from_key() {
        let job = JobRecord::implicit(&task("worker", 100));
        assert_eq!(job.namespace, "ml");
        assert_eq!(job.name, "train-1");
        assert_eq!(job.job_key, "ml/train-1");
        assert!(job.status.is_none());
    }
}
