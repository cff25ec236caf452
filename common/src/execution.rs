use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::dag::{DagDefinition, NodeId};
use crate::periodic::TimeWindow;

pub type StatusMap = BTreeMap<NodeId, NodeStatus>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Pending,
    Running,
    Finished,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub status: NodeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle_stage: Option<String>,
    /// Handle que devolvió el backend al enviar el job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub previous_attempts: Vec<String>,
}

impl NodeStatus {
    pub fn pending() -> Self {
        Self {
            status: NodeState::Pending,
            run_id: None,
            artifact_uri: None,
            lifecycle_stage: None,
            job_handle: None,
            previous_attempts: Vec::new(),
        }
    }

    pub fn is(&self, state: NodeState) -> bool {
        self.status == state
    }

    /// FAILED -> PENDING, guardando el run fallido en `previous_attempts`.
    /// Devuelve false si el nodo no estaba fallido.
    pub fn reset_for_retry(&mut self) -> bool {
        if self.status != NodeState::Failed {
            return false;
        }
        if let Some(run_id) = self.run_id.take() {
            self.previous_attempts.push(run_id);
        }
        self.status = NodeState::Pending;
        self.artifact_uri = None;
        self.lifecycle_stage = None;
        self.job_handle = None;
        true
    }
}

/// Estado del lock guardado junto al registro de ejecución.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockState {
    Yes,
    No,
}

impl LockState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockState::Yes => "yes",
            LockState::No => "no",
        }
    }
}

/// Registro durable de una ejecución de DAG, clave `(username, dag_execution_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagExecutionRecord {
    pub dag_id: String,
    pub dag_execution_id: String,
    pub username: String,
    pub parent_run_id: String,
    #[serde(default)]
    pub experiment_id: String,
    /// Credenciales del llamador; se reenvían tal cual a cada job.
    #[serde(default)]
    pub auth_info: Value,
    /// DAG actual, posiblemente reescrito por el particionado.
    pub dag_json: DagDefinition,
    #[serde(default)]
    pub node_statuses: StatusMap,
    pub locked: LockState,
    pub update_time: DateTime<Utc>,
    pub start_time: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub periodic_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window: Option<TimeWindow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drop_dead_time: Option<DateTime<Utc>>,
}

impl DagExecutionRecord {
    pub fn status_of(&self, node_id: &str) -> NodeState {
        self.node_statuses
            .get(node_id)
            .map(|s| s.status)
            .unwrap_or(NodeState::Pending)
    }
}

/// Vista pública de una ejecución (sin credenciales).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagExecutionView {
    pub dag_id: String,
    pub dag_execution_id: String,
    pub parent_run_id: String,
    pub locked: LockState,
    pub start_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    pub node_statuses: StatusMap,
    pub dag_json: DagDefinition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub periodic_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window: Option<TimeWindow>,
}

impl From<&DagExecutionRecord> for DagExecutionView {
    fn from(rec: &DagExecutionRecord) -> Self {
        Self {
            dag_id: rec.dag_id.clone(),
            dag_execution_id: rec.dag_execution_id.clone(),
            parent_run_id: rec.parent_run_id.clone(),
            locked: rec.locked,
            start_time: rec.start_time,
            update_time: rec.update_time,
            node_statuses: rec.node_statuses.clone(),
            dag_json: rec.dag_json.clone(),
            periodic_run_id: rec.periodic_run_id.clone(),
            time_window: rec.time_window,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reset_for_retry_guarda_intento_previo() {
        let mut st = NodeStatus {
            status: NodeState::Failed,
            run_id: Some("run-1".into()),
            artifact_uri: Some("s3://x".into()),
            lifecycle_stage: Some("active".into()),
            job_handle: Some("job-1".into()),
            previous_attempts: vec!["run-0".into()],
        };

        assert!(st.reset_for_retry());
        assert_eq!(st.status, NodeState::Pending);
        assert_eq!(st.run_id, None);
        assert_eq!(st.job_handle, None);
        assert_eq!(st.previous_attempts, vec!["run-0", "run-1"]);
    }

    #[test]
    fn reset_for_retry_ignora_nodos_no_fallidos() {
        let mut st = NodeStatus::pending();
        st.status = NodeState::Finished;
        assert!(!st.reset_for_retry());
        assert_eq!(st.status, NodeState::Finished);
    }

    #[test]
    fn node_status_conserva_nombres_de_campos() {
        let raw = json!({"status": "RUNNING", "run_id": "r", "lifecycle_stage": "active"});
        let st: NodeStatus = serde_json::from_value(raw).unwrap();
        assert_eq!(st.status, NodeState::Running);
        assert!(st.previous_attempts.is_empty());

        let back = serde_json::to_value(&st).unwrap();
        assert_eq!(back["status"], json!("RUNNING"));
        assert!(back.get("previous_attempts").is_none());
    }

    #[test]
    fn lock_state_se_serializa_yes_no() {
        assert_eq!(serde_json::to_value(LockState::Yes).unwrap(), json!("yes"));
        assert_eq!(serde_json::to_value(LockState::No).unwrap(), json!("no"));
    }
}
