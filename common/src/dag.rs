use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::GraphError;

pub type NodeId = String;

/// Definición estática de un DAG ("parallel") tal como la guarda el usuario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "node")]
    pub nodes: Vec<Node>,
    #[serde(default, alias = "edge")]
    pub edges: Vec<Edge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    #[serde(default)]
    pub transform_name: String,
    #[serde(default)]
    pub transform_path: String,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default)]
    pub positional_args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
    #[serde(default)]
    pub input: Vec<InputSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelization: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k8s_params: Option<Map<String, Value>>,

    /// Sólo presente en nodos producidos por particionado.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_node_id: Option<NodeId>,
}

impl Node {
    /// Id del nodo lógico al que pertenece (él mismo si nunca se particionó).
    pub fn logical_id(&self) -> &str {
        self.original_node_id.as_deref().unwrap_or(&self.id)
    }

    pub fn parallelization_factor(&self) -> u32 {
        self.parallelization.unwrap_or(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub source_node_id: NodeId,
    pub target_node_id: NodeId,
}

impl Edge {
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            source_node_id: source.into(),
            target_node_id: target.into(),
        }
    }

    pub fn key(&self) -> (NodeId, NodeId) {
        (self.source_node_id.clone(), self.target_node_id.clone())
    }
}

/* --------- Entradas de un nodo --------- */

/// Entrada de un nodo: el origen de datos (`type`) más los metadatos
/// de particionado que el engine va inyectando.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    #[serde(flatten)]
    pub source: InputSource,

    /// Nombre lógico; varias entradas con el mismo nombre se fusionan río abajo.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsplitted_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelization_schedule: Option<ParallelizationSchedule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_keygen: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_params: Option<PartitionParams>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InputSource {
    #[serde(rename = "no-input-data")]
    NoInputData,

    #[serde(rename = "existing_xform")]
    ExistingXform {
        source_node_id: NodeId,
        // asignados por el particionado por aristas
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bucketname: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time_spec: Option<String>,
    },

    #[serde(rename = "mlflow-run-artifacts")]
    RunArtifacts {
        #[serde(alias = "input_run_id")]
        run_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
    },

    #[serde(rename = "infinsnap")]
    Infinsnap {
        bucketname: String,
        prefix: String,
        time_spec: String,
    },

    #[serde(rename = "infinslice")]
    Infinslice {
        bucketname: String,
        prefix: String,
        time_spec: String,
    },

    #[serde(rename = "other-storage")]
    OtherStorage { bucketname: String, prefix: String },
}

impl InputSpec {
    pub fn new(source: InputSource) -> Self {
        Self {
            source,
            name: None,
            unsplitted_prefix: None,
            parallelization_schedule: None,
            partition_keygen: None,
            partition_params: None,
        }
    }

    pub fn existing_xform(source_node_id: impl Into<NodeId>) -> Self {
        Self::new(InputSource::ExistingXform {
            source_node_id: source_node_id.into(),
            bucketname: None,
            prefix: None,
            time_spec: None,
        })
    }

    /// Nodo del que proviene esta entrada, si es `existing_xform`.
    pub fn source_node(&self) -> Option<&str> {
        match &self.source {
            InputSource::ExistingXform { source_node_id, .. } => Some(source_node_id),
            _ => None,
        }
    }

    /// Copia de la entrada apuntando a otro nodo de origen.
    pub fn with_source_node(&self, node_id: &str) -> Self {
        let mut out = self.clone();
        if let InputSource::ExistingXform { source_node_id, .. } = &mut out.source {
            *source_node_id = node_id.to_string();
        }
        out
    }

    pub fn partitioner(&self) -> Option<Partitioner> {
        self.partition_params.as_ref().map(|p| p.partitioner)
    }

    pub fn time_spec(&self) -> Option<&str> {
        match &self.source {
            InputSource::Infinsnap { time_spec, .. } | InputSource::Infinslice { time_spec, .. } => {
                Some(time_spec)
            }
            InputSource::ExistingXform { time_spec, .. } => time_spec.as_deref(),
            _ => None,
        }
    }

    /// Asigna a esta entrada una porción concreta de la salida del nodo de origen.
    /// El prefijo anterior queda en `unsplitted_prefix`.
    pub fn assign_slice(&mut self, slice: &PartitionSlice) {
        if let InputSource::ExistingXform {
            bucketname,
            prefix,
            time_spec,
            ..
        } = &mut self.source
        {
            if self.unsplitted_prefix.is_none() {
                self.unsplitted_prefix = prefix.clone();
            }
            if slice.bucketname.is_some() {
                *bucketname = slice.bucketname.clone();
            }
            if slice.prefix.is_some() {
                *prefix = slice.prefix.clone();
            }
            if slice.time_spec.is_some() {
                *time_spec = slice.time_spec.clone();
            }
        }
    }
}

/// `[partitioner, num_bins, bin_index]`, serializado como arreglo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelizationSchedule(pub String, pub u32, pub u32);

impl ParallelizationSchedule {
    pub fn num_bins(&self) -> u32 {
        self.1
    }

    pub fn bin_index(&self) -> u32 {
        self.2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Partitioner {
    Default,
    Custom,
    Object,
    Directory,
    Broadcast,
    Edge,
    Sliding,
}

impl Partitioner {
    pub fn as_str(&self) -> &'static str {
        match self {
            Partitioner::Default => "default",
            Partitioner::Custom => "custom",
            Partitioner::Object => "object",
            Partitioner::Directory => "directory",
            Partitioner::Broadcast => "broadcast",
            Partitioner::Edge => "edge",
            Partitioner::Sliding => "sliding",
        }
    }

    /// Particionadores que agrupan entradas hermanas (fan-in) en vez de
    /// repartir datos.
    pub fn is_fan_in(&self) -> bool {
        matches!(self, Partitioner::Edge | Partitioner::Sliding)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionParams {
    pub partitioner: Partitioner,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lambda: Option<String>,
}

/// Una partición de salida observada en un nodo ya terminado.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionSlice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucketname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_spec: Option<String>,
}

/* --------- Parámetros de ejecución --------- */

/// Overrides por nodo lógico que el llamador puede mandar al iniciar
/// o al recuperar una ejecución.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DagRuntimeParams {
    #[serde(default, alias = "node")]
    pub nodes: BTreeMap<NodeId, NodeOverride>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kwargs: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k8s_params: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelization: Option<u32>,
}

impl NodeOverride {
    fn apply_to(&self, node: &mut Node) {
        if let Some(it) = &self.instance_type {
            node.instance_type = Some(it.clone());
        }
        if let Some(kwargs) = &self.kwargs {
            for (k, v) in kwargs {
                node.kwargs.insert(k.clone(), v.clone());
            }
        }
        if let Some(params) = &self.k8s_params {
            let target = node.k8s_params.get_or_insert_with(Map::new);
            for (k, v) in params {
                target.insert(k.clone(), v.clone());
            }
        }
        // el paralelismo sólo tiene sentido antes de particionar
        if node.original_node_id.is_none() {
            if let Some(p) = self.parallelization {
                node.parallelization = Some(p);
            }
        }
    }
}

/// Aplica los overrides a cada nodo según su id lógico, de modo que todas
/// las particiones de un mismo nodo reciben el mismo override.
///
/// Nodos sin override quedan como están. Un override cuyo id no
/// corresponde a ningún nodo lógico es un error.
pub fn apply_runtime_params(
    dag: &DagDefinition,
    params: &DagRuntimeParams,
) -> Result<DagDefinition, GraphError> {
    for key in params.nodes.keys() {
        if !dag.nodes.iter().any(|n| n.logical_id() == key) {
            return Err(GraphError::UnknownNode(key.clone()));
        }
    }

    let mut out = dag.clone();
    for node in out.nodes.iter_mut() {
        if let Some(ov) = params.nodes.get(node.logical_id()) {
            ov.apply_to(node);
        }
    }
    Ok(out)
}
