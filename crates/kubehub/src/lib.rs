//! Tally kube integration: the `TrainingJob` CRD and the watcher
//! loops that feed pod/job lifecycle events into the cache.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::Api,
    runtime::watcher::{self, Event},
    Client, CustomResource,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tally_core::JobStatus;

/// One billable unit of work. Tasks decompose it into roles; the
/// pods backing those roles carry the association annotations.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "tally.io",
    version = "v1",
    kind = "TrainingJob",
    namespaced,
    status = "JobStatus",
    shortname = "tjob"
)]
#[serde(rename_all = "camelCase")]
pub struct TrainingJobSpec {
    /// Task roles this job decomposes into (e.g. worker, ps).
    #[serde(default)]
    pub task_roles: Vec<TaskRoleSpec>,
    /// Submission queue, opaque to billing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TaskRoleSpec {
    pub name: String,
    #[serde(default = "default_replicas")]
    pub replicas: i32,
}

fn default_replicas() -> i32 {
    1
}

/// One lifecycle notification from either watch stream. Deletions
/// still carry the last-known object: the cache treats them as
/// updates and only forgets records on explicit cleanup.
#[derive(Debug, Clone)]
pub enum BillingEvent {
    PodApplied(Box<Pod>),
    PodDeleted(Box<Pod>),
    JobApplied(Box<TrainingJob>),
    JobDeleted(Box<TrainingJob>),
}

/// Connect using the ambient kubeconfig / in-cluster environment.
pub async fn client() -> Result<Client> {
    Client::try_default().await.context("building kube client")
}

/// Watch pods (optionally namespace-scoped) and forward lifecycle
/// events. A watch `Restarted` replays the full list through the same
/// applied path, which is how the cache rebuilds after a resync.
pub async fn watch_pods(
    client: Client,
    namespace: Option<&str>,
    tx: mpsc::Sender<BillingEvent>,
) -> Result<()> {
    let api: Api<Pod> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!(ns = ?namespace, "pod watcher started");
    while let Some(ev) = stream.try_next().await.context("pod watch stream")? {
        match ev {
            Event::Applied(pod) => forward(&tx, BillingEvent::PodApplied(Box::new(pod))).await,
            Event::Deleted(pod) => forward(&tx, BillingEvent::PodDeleted(Box::new(pod))).await,
            Event::Restarted(pods) => {
                debug!(count = pods.len(), "pod watch restarted");
                for pod in pods {
                    forward(&tx, BillingEvent::PodApplied(Box::new(pod))).await;
                }
            }
        }
    }
    warn!("pod watcher stream ended");
    Ok(())
}

/// Watch TrainingJobs and forward lifecycle events, same contract as
/// [`watch_pods`].
pub async fn watch_jobs(
    client: Client,
    namespace: Option<&str>,
    tx: mpsc::Sender<BillingEvent>,
) -> Result<()> {
    let api: Api<TrainingJob> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!(ns = ?namespace, "job watcher started");
    while let Some(ev) = stream.try_next().await.context("job watch stream")? {
        match ev {
            Event::Applied(job) => forward(&tx, BillingEvent::JobApplied(Box::new(job))).await,
            Event::Deleted(job) => forward(&tx, BillingEvent::JobDeleted(Box::new(job))).await,
            Event::Restarted(jobs) => {
                debug!(count = jobs.len(), "job watch restarted");
                for job in jobs {
                    forward(&tx, BillingEvent::JobApplied(Box::new(job))).await;
                }
            }
        }
    }
    warn!("job watcher stream ended");
    Ok(())
}

async fn forward(tx: &mpsc::Sender<BillingEvent>, event: BillingEvent) {
    if tx.send(event).await.is_err() {
        debug!("event channel closed; dropping event");
    }
}
