use std::collections::{BTreeMap, HashMap, HashSet};

use crate::dag::{DagDefinition, Edge, Node, NodeId};
use crate::error::GraphError;
use crate::execution::{NodeState, StatusMap};

/// Vista en memoria de una ejecución de DAG.
///
/// `order`, `nodes` y `edges` son la fuente de verdad; `incoming` y
/// `outgoing` se derivan de `edges` en [`Graph::reindex`].
#[derive(Debug, Clone, PartialEq)]
pub struct Graph {
    /// Orden de los nodos tal como aparecen en el DAG.
    pub order: Vec<NodeId>,
    pub nodes: HashMap<NodeId, Node>,
    pub edges: BTreeMap<(NodeId, NodeId), Edge>,
    pub incoming: HashMap<NodeId, Vec<NodeId>>,
    pub outgoing: HashMap<NodeId, Vec<NodeId>>,
}

impl Graph {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn predecessors(&self, id: &str) -> &[NodeId] {
        self.incoming.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn successors(&self, id: &str) -> &[NodeId] {
        self.outgoing.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Recalcula las listas de adyacencia y valida que el orden, el
    /// diccionario de nodos y las aristas sean coherentes.
    pub fn reindex(&mut self) -> Result<(), GraphError> {
        let mut seen: HashSet<&str> = HashSet::with_capacity(self.order.len());
        for id in &self.order {
            if !seen.insert(id.as_str()) {
                return Err(GraphError::DuplicateNode(id.clone()));
            }
            if !self.nodes.contains_key(id) {
                return Err(GraphError::UnknownNode(id.clone()));
            }
        }
        if self.nodes.len() != self.order.len() {
            if let Some(stray) = self.nodes.keys().find(|k| !seen.contains(k.as_str())) {
                return Err(GraphError::UnknownNode(stray.clone()));
            }
        }

        let mut incoming: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        let mut outgoing: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for id in &self.order {
            incoming.insert(id.clone(), Vec::new());
            outgoing.insert(id.clone(), Vec::new());
        }

        for (src, dst) in self.edges.keys() {
            if !self.nodes.contains_key(src) || !self.nodes.contains_key(dst) {
                return Err(GraphError::UnknownEdgeEndpoint {
                    source_node_id: src.clone(),
                    target_node_id: dst.clone(),
                });
            }
            outgoing.entry(src.clone()).or_default().push(dst.clone());
            incoming.entry(dst.clone()).or_default().push(src.clone());
        }

        self.incoming = incoming;
        self.outgoing = outgoing;
        Ok(())
    }

    /// Reemplaza `old` en el orden por `replacements`, en la misma posición.
    pub(crate) fn splice_node(&mut self, old: &str, replacements: Vec<Node>) {
        let pos = self.order.iter().position(|id| id == old);
        self.nodes.remove(old);

        let new_ids: Vec<NodeId> = replacements.iter().map(|n| n.id.clone()).collect();
        for n in replacements {
            self.nodes.insert(n.id.clone(), n);
        }

        match pos {
            Some(p) => {
                self.order.splice(p..=p, new_ids);
            }
            None => self.order.extend(new_ids),
        }
    }
}

/// Construye el grafo a partir del JSON del DAG. O(V+E).
pub fn build_graph(dag: &DagDefinition) -> Result<Graph, GraphError> {
    let mut nodes = HashMap::with_capacity(dag.nodes.len());
    let mut order = Vec::with_capacity(dag.nodes.len());

    for node in &dag.nodes {
        if nodes.insert(node.id.clone(), node.clone()).is_some() {
            return Err(GraphError::DuplicateNode(node.id.clone()));
        }
        order.push(node.id.clone());
    }

    let edges = dag.edges.iter().map(|e| (e.key(), e.clone())).collect();

    let mut graph = Graph {
        order,
        nodes,
        edges,
        incoming: HashMap::new(),
        outgoing: HashMap::new(),
    };
    graph.reindex()?;
    Ok(graph)
}

/// Reconstruye el JSON del DAG a partir del diccionario de nodos y aristas.
/// Las aristas salen ordenadas por `(source_node_id, target_node_id)`, así
/// que el resultado es estable entre procesos.
pub fn create_new_dag_json(old: &DagDefinition, graph: &Graph) -> DagDefinition {
    let nodes = graph
        .order
        .iter()
        .filter_map(|id| graph.nodes.get(id).cloned())
        .collect();

    DagDefinition {
        id: old.id.clone(),
        name: old.name.clone(),
        nodes,
        edges: graph.edges.values().cloned().collect(),
        experiment_id: old.experiment_id.clone(),
    }
}

/* =========================
   Readiness
   ========================= */

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedNode {
    pub node_id: NodeId,
    pub run_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadyNodes {
    pub all_done: bool,
    pub ready: Vec<NodeId>,
    /// Presente si algún nodo falló; en ese caso `ready` está vacío.
    pub failed: Option<FailedNode>,
}

fn state_of(statuses: &StatusMap, id: &str) -> NodeState {
    statuses.get(id).map(|s| s.status).unwrap_or(NodeState::Pending)
}

/// Calcula qué nodos pueden lanzarse ya.
///
/// Un nodo está listo si está PENDING y todos sus predecesores están
/// FINISHED. Un nodo FAILED corta la evaluación: no hay nodos listos y el
/// DAG se considera fallido.
pub fn get_ready_nodes(graph: &Graph, statuses: &StatusMap) -> ReadyNodes {
    let mut ready = Vec::new();
    let mut every_finished = true;

    for id in &graph.order {
        let state = state_of(statuses, id);

        if state == NodeState::Failed {
            return ReadyNodes {
                all_done: false,
                ready: Vec::new(),
                failed: Some(FailedNode {
                    node_id: id.clone(),
                    run_id: statuses.get(id).and_then(|s| s.run_id.clone()),
                }),
            };
        }

        if state != NodeState::Finished {
            every_finished = false;
        }
        if state != NodeState::Pending {
            continue;
        }

        let deps_done = graph
            .predecessors(id)
            .iter()
            .all(|p| state_of(statuses, p) == NodeState::Finished);
        if deps_done {
            ready.push(id.clone());
        }
    }

    ReadyNodes {
        all_done: ready.is_empty() && every_finished,
        ready,
        failed: None,
    }
}

/// Agrupa nodos listos por `original_node_id` (o su propio id), para
/// lanzar juntas todas las particiones de un mismo nodo lógico.
pub fn group_by_original(ready: &[NodeId], graph: &Graph) -> Vec<(NodeId, Vec<NodeId>)> {
    let mut groups: Vec<(NodeId, Vec<NodeId>)> = Vec::new();

    for id in ready {
        let key = graph
            .node(id)
            .map(|n| n.logical_id().to_string())
            .unwrap_or_else(|| id.clone());

        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(id.clone()),
            None => groups.push((key, vec![id.clone()])),
        }
    }

    groups
}
