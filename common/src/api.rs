use serde::{Deserialize, Serialize};

use crate::dag::{DagRuntimeParams, NodeId, PartitionSlice};

/// Cuerpo JSON de `POST /api/v1/execute-dag`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteDagRequest {
    pub dagid: String,
    #[serde(default, rename = "dagExecutionId", skip_serializing_if = "Option::is_none")]
    pub dag_execution_id: Option<String>,
    #[serde(default, rename = "dagParams", skip_serializing_if = "Option::is_none")]
    pub dag_params: Option<DagRuntimeParams>,
    #[serde(default)]
    pub recovery: bool,
    #[serde(default, rename = "MLFLOW_TRACKING_URI", skip_serializing_if = "Option::is_none")]
    pub tracking_uri: Option<String>,
}

/// Variante urlencoded: `dagParamsJson` llega como texto JSON.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecuteDagForm {
    pub dagid: String,
    #[serde(default, rename = "dagExecutionId")]
    pub dag_execution_id: Option<String>,
    #[serde(default, rename = "dagParamsJson")]
    pub dag_params_json: Option<String>,
    #[serde(default)]
    pub recovery: Option<String>,
    #[serde(default, rename = "MLFLOW_TRACKING_URI")]
    pub tracking_uri: Option<String>,
}

impl ExecuteDagForm {
    pub fn into_request(self) -> Result<ExecuteDagRequest, serde_json::Error> {
        let dag_params = match self.dag_params_json.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => Some(serde_json::from_str(raw)?),
            _ => None,
        };
        let recovery = matches!(
            self.recovery.as_deref().map(str::to_ascii_lowercase).as_deref(),
            Some("true") | Some("1") | Some("yes")
        );

        Ok(ExecuteDagRequest {
            dagid: self.dagid,
            dag_execution_id: self.dag_execution_id.filter(|s| !s.is_empty()),
            dag_params,
            recovery,
            tracking_uri: self.tracking_uri,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteDagResponse {
    pub status: String,
    #[serde(rename = "dagExecutionId")]
    pub dag_execution_id: String,
    #[serde(rename = "parentRunId")]
    pub parent_run_id: String,
}

/// Cuerpo de `POST /api/v1/update-dag-execution`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateDagExecutionRequest {
    pub run_id: String,
    pub dagid: String,
    pub dag_execution_id: String,
    pub partitions: Vec<PartitionSlice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateDagExecutionResponse {
    pub status: String,
    pub dag_execution_id: String,
    /// Nodos de la ejecución tras el particionado.
    pub nodes: Vec<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PeriodRunResponse {
    Skipped {
        message: String,
    },
    Started {
        #[serde(rename = "dagExecutionId")]
        dag_execution_id: String,
        #[serde(rename = "parentRunId")]
        parent_run_id: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub status: String,
    pub error: String,
}
