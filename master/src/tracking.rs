use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use common::NodeState;

use crate::remote::{check, decode, RemoteError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Scheduled,
    Finished,
    Failed,
    Killed,
}

impl RunStatus {
    /// Estado de nodo equivalente; `None` mientras el run sigue vivo.
    pub fn terminal_node_state(&self) -> Option<NodeState> {
        match self {
            RunStatus::Finished => Some(NodeState::Finished),
            RunStatus::Failed | RunStatus::Killed => Some(NodeState::Failed),
            RunStatus::Running | RunStatus::Scheduled => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub artifact_uri: Option<String>,
    #[serde(default)]
    pub lifecycle_stage: Option<String>,
}

/// Tracking store de experimentos (runs padre e hijos).
#[async_trait]
pub trait TrackingStore: Send + Sync {
    /// Devuelve el experimento con ese nombre, creándolo si no existe.
    async fn create_experiment(&self, name: &str) -> Result<String, RemoteError>;

    async fn create_run(
        &self,
        experiment_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<RunInfo, RemoteError>;

    async fn get_run(&self, run_id: &str) -> Result<RunInfo, RemoteError>;

    async fn update_run_status(&self, run_id: &str, status: RunStatus) -> Result<(), RemoteError>;

    /// Marca el run en un estado terminal.
    async fn set_terminated(&self, run_id: &str, status: RunStatus) -> Result<(), RemoteError> {
        self.update_run_status(run_id, status).await
    }

    async fn log_artifact(
        &self,
        run_id: &str,
        artifact_path: &str,
        contents: Vec<u8>,
    ) -> Result<(), RemoteError>;
}

/* =========================
   Cliente REST (MLflow 2.0)
   ========================= */

pub struct HttpTrackingStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct RunEnvelope {
    run: RunBody,
}

#[derive(Deserialize)]
struct RunBody {
    info: RunInfo,
}

#[derive(Deserialize)]
struct ExperimentCreated {
    experiment_id: String,
}

#[derive(Deserialize)]
struct ExperimentEnvelope {
    experiment: ExperimentCreated,
}

impl HttpTrackingStore {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn api(&self, path: &str) -> String {
        format!("{}/api/2.0/mlflow/{}", self.base_url, path)
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }

    async fn update(&self, run_id: &str, status: RunStatus, terminal: bool) -> Result<(), RemoteError> {
        let mut body = json!({ "run_id": run_id, "status": status });
        if terminal {
            body["end_time"] = json!(Utc::now().timestamp_millis());
        }
        let resp = self
            .authed(self.client.post(self.api("runs/update")))
            .json(&body)
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }
}

/// `mlflow-artifacts:/<exp>/<run>/artifacts` -> ruta relativa al proxy de artefactos.
fn artifact_proxy_path(artifact_uri: &str) -> Option<&str> {
    artifact_uri
        .strip_prefix("mlflow-artifacts:")
        .map(|rest| rest.trim_start_matches('/'))
}

#[async_trait]
impl TrackingStore for HttpTrackingStore {
    async fn create_experiment(&self, name: &str) -> Result<String, RemoteError> {
        let resp = self
            .authed(self.client.post(self.api("experiments/create")))
            .json(&json!({ "name": name }))
            .send()
            .await?;

        match decode::<ExperimentCreated>(resp).await {
            Ok(created) => Ok(created.experiment_id),
            // ya existe: se busca por nombre
            Err(RemoteError::Status { status: 400, body, .. })
                if body.contains("RESOURCE_ALREADY_EXISTS") =>
            {
                debug!(name, "el experimento ya existía");
                let resp = self
                    .authed(self.client.get(self.api("experiments/get-by-name")))
                    .query(&[("experiment_name", name)])
                    .send()
                    .await?;
                let found: ExperimentEnvelope = decode(resp).await?;
                Ok(found.experiment.experiment_id)
            }
            Err(e) => Err(e),
        }
    }

    async fn create_run(
        &self,
        experiment_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<RunInfo, RemoteError> {
        let tags: Vec<_> = tags
            .iter()
            .map(|(k, v)| json!({ "key": k, "value": v }))
            .collect();
        let resp = self
            .authed(self.client.post(self.api("runs/create")))
            .json(&json!({
                "experiment_id": experiment_id,
                "start_time": Utc::now().timestamp_millis(),
                "tags": tags,
            }))
            .send()
            .await?;
        let env: RunEnvelope = decode(resp).await?;
        Ok(env.run.info)
    }

    async fn get_run(&self, run_id: &str) -> Result<RunInfo, RemoteError> {
        let resp = self
            .authed(self.client.get(self.api("runs/get")))
            .query(&[("run_id", run_id)])
            .send()
            .await?;
        let env: RunEnvelope = decode(resp).await?;
        Ok(env.run.info)
    }

    async fn update_run_status(&self, run_id: &str, status: RunStatus) -> Result<(), RemoteError> {
        self.update(run_id, status, false).await
    }

    async fn set_terminated(&self, run_id: &str, status: RunStatus) -> Result<(), RemoteError> {
        self.update(run_id, status, true).await
    }

    async fn log_artifact(
        &self,
        run_id: &str,
        artifact_path: &str,
        contents: Vec<u8>,
    ) -> Result<(), RemoteError> {
        let run = self.get_run(run_id).await?;
        let uri = run.artifact_uri.unwrap_or_default();
        let Some(root) = artifact_proxy_path(&uri) else {
            return Err(RemoteError::Unsupported(format!(
                "artifact_uri no servido por el proxy: {uri:?}"
            )));
        };

        let url = format!(
            "{}/api/2.0/mlflow-artifacts/artifacts/{}/{}",
            self.base_url,
            root.trim_end_matches('/'),
            artifact_path
        );
        let resp = self.authed(self.client.put(url)).body(contents).send().await?;
        check(resp).await?;
        Ok(())
    }
}
