use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use common::JobSubmission;

use crate::remote::{decode, RemoteError};

/// Identificador del job en el backend. Se guarda en el estado del nodo al
/// enviarlo; `for_run` reconstruye el nombre por defecto a partir del run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(pub String);

impl JobHandle {
    pub fn for_run(run_id: &str) -> Self {
        JobHandle(format!("parallels-{run_id}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    #[serde(other)]
    Unknown,
}

#[async_trait]
pub trait JobBackend: Send + Sync {
    async fn submit_job(&self, submission: &JobSubmission) -> Result<JobHandle, RemoteError>;
    async fn get_job_pod_status(&self, handle: &JobHandle) -> Result<PodPhase, RemoteError>;
}

pub struct HttpJobBackend {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct Submitted {
    job: JobHandle,
}

#[derive(Deserialize)]
struct PodStatus {
    phase: PodPhase,
}

impl HttpJobBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl JobBackend for HttpJobBackend {
    async fn submit_job(&self, submission: &JobSubmission) -> Result<JobHandle, RemoteError> {
        let resp = self
            .client
            .post(format!("{}/api/v1/jobs", self.base_url))
            .json(submission)
            .send()
            .await?;
        let submitted: Submitted = decode(resp).await?;
        Ok(submitted.job)
    }

    async fn get_job_pod_status(&self, handle: &JobHandle) -> Result<PodPhase, RemoteError> {
        let resp = self
            .client
            .get(format!("{}/api/v1/jobs/{}/pod-status", self.base_url, handle.0))
            .send()
            .await?;
        let status: PodStatus = decode(resp).await?;
        Ok(status.phase)
    }
}
