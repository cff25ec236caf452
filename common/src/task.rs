use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::dag::{InputSpec, NodeId};

/// Lo que se envía al backend de jobs para ejecutar un nodo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub dag_execution_id: String,
    pub node_id: NodeId,
    pub original_node_id: NodeId,
    /// Run hijo creado en el tracking store para este nodo.
    pub run_id: String,
    pub parent_run_id: String,
    pub experiment_id: String,

    pub transform_name: String,
    pub transform_path: String,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default)]
    pub positional_args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k8s_params: Option<Map<String, Value>>,

    /// Entradas ya resueltas: los `existing_xform` apuntan al run de origen.
    pub inputs: Vec<InputSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub periodic_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drop_dead_time: Option<DateTime<Utc>>,
}

/// Cuerpo completo de una petición de submit al backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmission {
    pub spec: JobSpec,
    pub env: BTreeMap<String, String>,
    /// Credenciales que el backend monta como secretos del pod.
    pub credentials: Value,
}
