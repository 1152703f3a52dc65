//! Per-pod derived facts, projected from the raw pod object.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};

use crate::resource::Resource;
use crate::{attempt_key, job_key, task_key, ANNOTATION_JOB_NAME, ANNOTATION_TASK_NAME, SELECTOR_GPU_TYPE};

/// Pod phase plus the reason the API server reported for it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodState {
    pub phase: String,
    pub reason: String,
}

/// One pod's billing-relevant facts. Keyed globally by pod name; the
/// job/task keys tie it into the hierarchy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodRecord {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub job_name: String,
    pub task_name: String,
    pub job_key: String,
    pub task_key: String,

    /// When the pod's Ready condition last transitioned.
    pub running_at: Option<DateTime<Utc>>,
    /// Deletion timestamp, recorded only once the pod is terminal.
    pub completed_at: Option<DateTime<Utc>>,
    /// Billable run duration in seconds, once both times are known.
    pub run_secs: i64,

    pub state: PodState,
    /// Max container restart count observed across the pod.
    pub retry_count: i32,
    pub gpu_type: Option<String>,
    pub resource: Resource,
}

impl PodRecord {
    /// Project a raw pod into a record. Returns `None` when the pod
    /// carries no job/task association annotations — such pods have no
    /// billing owner and are skipped, which is a normal outcome.
    pub fn project(pod: &Pod) -> Option<PodRecord> {
        let meta = &pod.metadata;
        let name = meta.name.clone()?;
        let namespace = meta.namespace.clone().unwrap_or_default();
        let annotations = meta.annotations.as_ref()?;
        let job_name = annotations.get(ANNOTATION_JOB_NAME)?.clone();
        let task_name = annotations.get(ANNOTATION_TASK_NAME)?.clone();
        if job_name.is_empty() || task_name.is_empty() {
            return None;
        }

        let mut rec = PodRecord {
            uid: meta.uid.clone().unwrap_or_default(),
            name,
            job_key: job_key(&namespace, &job_name),
            task_key: task_key(&namespace, &job_name, &task_name),
            namespace,
            job_name,
            task_name,
            ..PodRecord::default()
        };
        rec.refresh(pod);
        Some(rec)
    }

    /// Recompute the derived fields from the pod's current state.
    pub fn refresh(&mut self, pod: &Pod) {
        self.set_state(pod);
        self.set_timing(pod);
        self.set_retry_count(pod);
        self.set_resource(pod);
    }

    /// Carry sticky fields over from the superseded record: timing
    /// observed on an earlier event must survive a later event that no
    /// longer carries it.
    pub fn merge_prior(&mut self, prev: &PodRecord) {
        if self.running_at.is_none() {
            self.running_at = prev.running_at;
        }
        if self.completed_at.is_none() {
            self.completed_at = prev.completed_at;
        }
        self.recompute_duration();
    }

    /// Key identifying this attempt in a task's history.
    pub fn attempt_key(&self) -> String {
        attempt_key(&self.namespace, &self.job_name, &self.task_name, &self.name, self.retry_count)
    }

    fn set_state(&mut self, pod: &Pod) {
        let status = pod.status.as_ref();
        self.state = PodState {
            phase: status.and_then(|s| s.phase.clone()).unwrap_or_default(),
            reason: status.and_then(|s| s.reason.clone()).unwrap_or_default(),
        };
    }

    fn set_timing(&mut self, pod: &Pod) {
        match self.state.phase.as_str() {
            "Running" => {
                self.running_at = ready_transition_time(pod);
            }
            "Succeeded" | "Failed" => {
                if let Some(ts) = &pod.metadata.deletion_timestamp {
                    self.completed_at = Some(ts.0);
                }
                if self.running_at.is_none() {
                    self.running_at = ready_transition_time(pod);
                }
            }
            _ => {}
        }
        self.recompute_duration();
    }

    fn recompute_duration(&mut self) {
        if let (Some(started), Some(completed)) = (self.running_at, self.completed_at) {
            self.run_secs = (completed - started).num_seconds();
        }
    }

    fn set_retry_count(&mut self, pod: &Pod) {
        self.retry_count = pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref())
            .map(|cs| cs.iter().map(|c| c.restart_count).max().unwrap_or(0))
            .unwrap_or(0);
    }

    fn set_resource(&mut self, pod: &Pod) {
        let mut resource = Resource::default();
        if let Some(spec) = pod.spec.as_ref() {
            if let Some(gpu) = spec.node_selector.as_ref().and_then(|ns| ns.get(SELECTOR_GPU_TYPE)) {
                self.gpu_type = Some(gpu.clone());
            }
            for container in &spec.containers {
                if let Some(requests) =
                    container.resources.as_ref().and_then(|r| r.requests.as_ref())
                {
                    resource.add(&Resource::from_requests(requests));
                }
            }
        }
        self.resource = resource;
    }
}

fn ready_transition_time(pod: &Pod) -> Option<DateTime<Utc>> {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conds| conds.iter().find(|c| c.type_ == "Ready"))
        .and_then(|c| c.last_transition_time.as_ref())
        .map(|t| t.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod_json(overrides: serde_json::Value) -> Pod {
        let mut base = json!({
            "metadata": {
                "name": "train-1-worker-0",
                "namespace": "ml",
                "uid": "11111111-2222-3333-4444-555555555555",
                "annotations": {
                    ANNOTATION_JOB_NAME: "train-1",
                    ANNOTATION_TASK_NAME: "worker",
                },
            },
            "spec": {
                "nodeSelector": { SELECTOR_GPU_TYPE: "a100" },
                "containers": [{
                    "name": "main",
                    "resources": { "requests": { "cpu": "2", "memory": "1Gi" } },
                }],
            },
            "status": { "phase": "Pending" },
        });
        merge(&mut base, overrides);
        serde_json::from_value(base).expect("valid pod json")
    }

    fn merge(base: &mut serde_json::Value, patch: serde_json::Value) {
        if let (Some(b), serde_json::Value::Object(p)) = (base.as_object_mut(), patch) {
            for (k, v) in p {
                match b.get_mut(&k) {
                    Some(slot) if slot.is_object() && v.is_object() => merge(slot, v),
                    _ => {
                        b.insert(k, v);
                    }
                }
            }
        }
    }

    #[test]
    fn projects_association_and_resource() {
        let rec = PodRecord::project(&pod_json(json!({}))).expect("associated pod");
        assert_eq!(rec.job_key, "ml/train-1");
        assert_eq!(rec.task_key, "ml/train-1/worker");
        assert_eq!(rec.resource, Resource::new(2000, 1 << 30));
        assert_eq!(rec.gpu_type.as_deref(), Some("a100"));
        assert_eq!(rec.state.phase, "Pending");
    }

    #[test]
    fn pod_without_annotations_is_skipped() {
        let mut partial = pod_json(json!({}));
        if let Some(annotations) = partial.metadata.annotations.as_mut() {
            annotations.remove(ANNOTATION_TASK_NAME);
        }
        assert!(PodRecord::project(&partial).is_none());

        let mut bare = pod_json(json!({}));
        bare.metadata.annotations = None;
        assert!(PodRecord::project(&bare).is_none());
    }

    #[test]
    fn running_time_comes_from_ready_condition() {
        let pod = pod_json(json!({
            "status": {
                "phase": "Running",
                "conditions": [
                    { "type": "PodScheduled", "status": "True", "lastTransitionTime": "2024-05-01T10:00:00Z" },
                    { "type": "Ready", "status": "True", "lastTransitionTime": "2024-05-01T10:00:05Z" },
                ],
            },
        }));
        let rec = PodRecord::project(&pod).unwrap();
        assert_eq!(rec.running_at.unwrap().to_rfc3339(), "2024-05-01T10:00:05+00:00");
        assert!(rec.completed_at.is_none());
    }

    #[test]
    fn terminal_pod_records_completion_and_duration() {
        let pod = pod_json(json!({
            "metadata": { "deletionTimestamp": "2024-05-01T11:00:05Z" },
            "status": {
                "phase": "Succeeded",
                "reason": "Completed",
                "conditions": [
                    { "type": "Ready", "status": "False", "lastTransitionTime": "2024-05-01T10:00:05Z" },
                ],
            },
        }));
        let rec = PodRecord::project(&pod).unwrap();
        assert!(rec.completed_at.is_some());
        assert_eq!(rec.run_secs, 3600);
        assert_eq!(rec.state.reason, "Completed");
    }

    #[test]
    fn merge_prior_keeps_observed_running_time() {
        let running = PodRecord::project(&pod_json(json!({
            "status": {
                "phase": "Running",
                "conditions": [
                    { "type": "Ready", "status": "True", "lastTransitionTime": "2024-05-01T10:00:00Z" },
                ],
            },
        })))
        .unwrap();

        // Later event no longer carries conditions.
        let mut updated = PodRecord::project(&pod_json(json!({
            "metadata": { "deletionTimestamp": "2024-05-01T10:30:00Z" },
            "status": { "phase": "Failed" },
        })))
        .unwrap();
        assert!(updated.running_at.is_none());
        updated.merge_prior(&running);
        assert_eq!(updated.running_at, running.running_at);
        assert_eq!(updated.run_secs, 1800);
    }

    #[test]
    fn retry_count_is_max_across_containers() {
        let pod = pod_json(json!({
            "status": {
                "phase": "Running",
                "containerStatuses": [
                    { "name": "main", "restartCount": 1, "image": "x", "imageID": "x", "ready": true },
                    { "name": "sidecar", "restartCount": 3, "image": "x", "imageID": "x", "ready": true },
                ],
            },
        }));
        let rec = PodRecord::project(&pod).unwrap();
        assert_eq!(rec.retry_count, 3);
        assert_eq!(rec.attempt_key(), "ml/train-1/worker/train-1-worker-0/3");
    }
}
