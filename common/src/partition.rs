use std::collections::{BTreeMap, HashSet};

use tracing::debug;

use crate::dag::{Edge, InputSpec, Node, NodeId, ParallelizationSchedule, PartitionSlice, Partitioner};
use crate::error::GraphError;
use crate::execution::{NodeState, NodeStatus, StatusMap};
use crate::graph::Graph;

/// Resultado de una pasada de particionado. `graph` y `statuses` son
/// copias nuevas; el grafo de entrada nunca se modifica.
#[derive(Debug, Clone)]
pub struct PartitionOutcome {
    pub graph: Graph,
    pub statuses: StatusMap,
    pub modified: bool,
}

fn part_id(base: &str, i: usize) -> NodeId {
    format!("{base}-part-{i}")
}

/* =========================
   Particionado estático (parallelization = k)
   ========================= */

/// Expande cada nodo listo con `parallelization = k > 1` en `k` nodos
/// `<id>-part-<i>` (i = 1..k).
///
/// Los consumidores que quedan con varias entradas `edge` / `sliding` se
/// dividen a su vez. Si `modified` es true, quien llama debe regenerar el
/// JSON del DAG y volver a calcular los nodos listos.
pub fn partition_ready_nodes(
    ready: &[NodeId],
    graph: &Graph,
    statuses: &StatusMap,
) -> Result<PartitionOutcome, GraphError> {
    let mut next = graph.clone();
    let mut next_statuses = statuses.clone();
    let mut modified = false;

    for id in ready {
        let Some(node) = next.nodes.get(id).cloned() else {
            return Err(GraphError::UnknownNode(id.clone()));
        };
        let k = node.parallelization_factor();
        if k <= 1 {
            continue;
        }

        let new_ids: Vec<NodeId> = (1..=k as usize).map(|i| part_id(id, i)).collect();
        let copies: Vec<Node> = new_ids
            .iter()
            .enumerate()
            .map(|(idx, new_id)| {
                let mut copy = node.clone();
                copy.id = new_id.clone();
                copy.original_node_id = Some(node.logical_id().to_string());
                copy.parallelization = None;
                copy.input = schedule_inputs(&node.input, k, idx as u32);
                copy
            })
            .collect();

        debug!("particionando nodo {} en {} copias", id, k);

        next.splice_node(id, copies);
        split_edges(&mut next, id, &new_ids);

        next_statuses.remove(id);
        for new_id in &new_ids {
            next_statuses.insert(new_id.clone(), NodeStatus::pending());
        }
        modified = true;
    }

    if modified {
        next.reindex()?;
    }

    let (graph, statuses, cascaded) = resolve_fan_in(next, next_statuses)?;

    Ok(PartitionOutcome {
        graph,
        statuses,
        modified: modified || cascaded,
    })
}

/// Cambia `partition_params` por `parallelization_schedule` en cada entrada
/// de una copia. Las entradas broadcast ven todos los datos; las de fan-in
/// (edge / sliding) se conservan para el particionado en tiempo de ejecución.
fn schedule_inputs(inputs: &[InputSpec], k: u32, bin_index: u32) -> Vec<InputSpec> {
    inputs
        .iter()
        .map(|input| {
            let mut out = input.clone();
            if matches!(out.source, crate::dag::InputSource::NoInputData) {
                return out;
            }

            let partitioner = out.partitioner().unwrap_or(Partitioner::Default);
            if partitioner.is_fan_in() {
                return out;
            }

            let params = out.partition_params.take();
            match partitioner {
                Partitioner::Broadcast => {}
                Partitioner::Custom => {
                    out.partition_keygen = params.and_then(|p| p.lambda);
                    out.parallelization_schedule =
                        Some(ParallelizationSchedule(partitioner.as_str().into(), k, bin_index));
                }
                other => {
                    out.parallelization_schedule =
                        Some(ParallelizationSchedule(other.as_str().into(), k, bin_index));
                }
            }
            out
        })
        .collect()
}

/// Reescribe las aristas de `old` hacia `new_ids`:
/// - cada predecesor pasa a apuntar a todos los nodos nuevos
/// - todos los nodos nuevos apuntan a cada sucesor, y las entradas
///   `existing_xform` del sucesor que leían de `old` se clonan una vez por
///   nodo nuevo.
///
/// No recalcula las adyacencias; quien llama debe hacer `reindex`.
pub fn split_edges(graph: &mut Graph, old: &str, new_ids: &[NodeId]) {
    let preds: Vec<NodeId> = graph
        .edges
        .keys()
        .filter(|(_, dst)| dst == old)
        .map(|(src, _)| src.clone())
        .collect();

    for p in preds {
        graph.edges.remove(&(p.clone(), old.to_string()));
        for n in new_ids {
            let e = Edge::new(p.clone(), n.clone());
            graph.edges.insert(e.key(), e);
        }
    }

    fan_out_successors(graph, old, new_ids);
}

fn fan_out_successors(graph: &mut Graph, old: &str, new_ids: &[NodeId]) {
    let succs: Vec<NodeId> = graph
        .edges
        .keys()
        .filter(|(src, _)| src == old)
        .map(|(_, dst)| dst.clone())
        .collect();

    for s in succs {
        graph.edges.remove(&(old.to_string(), s.clone()));
        for n in new_ids {
            let e = Edge::new(n.clone(), s.clone());
            graph.edges.insert(e.key(), e);
        }

        if let Some(succ) = graph.nodes.get_mut(&s) {
            succ.input = succ
                .input
                .iter()
                .flat_map(|input| {
                    if input.source_node() == Some(old) {
                        new_ids.iter().map(|n| input.with_source_node(n)).collect()
                    } else {
                        vec![input.clone()]
                    }
                })
                .collect();
        }
    }
}

/* =========================
   Particionado por aristas / ventana deslizante
   ========================= */

/// Divide los consumidores directos del nodo que ejecutó `run_id` en una
/// copia por cada partición observada, y luego resuelve en cascada los
/// fan-in `edge` / `sliding` que eso genere.
pub fn apply_partition_list(
    graph: &Graph,
    statuses: &StatusMap,
    run_id: &str,
    partitions: &[PartitionSlice],
) -> Result<PartitionOutcome, GraphError> {
    if partitions.is_empty() {
        return Err(GraphError::EmptyPartitionList);
    }

    let upstream = graph
        .order
        .iter()
        .find(|id| {
            statuses
                .get(id.as_str())
                .and_then(|s| s.run_id.as_deref())
                == Some(run_id)
        })
        .cloned()
        .ok_or_else(|| GraphError::RunNotFound(run_id.to_string()))?;

    let consumers: Vec<NodeId> = graph
        .successors(&upstream)
        .iter()
        .filter(|id| is_pending(statuses, id))
        .filter(|id| {
            graph
                .node(id)
                .map(|n| n.input.iter().any(|i| i.source_node() == Some(upstream.as_str())))
                .unwrap_or(false)
        })
        .cloned()
        .collect();

    let mut next = graph.clone();
    let mut next_statuses = statuses.clone();
    let mut modified = false;

    for consumer in &consumers {
        let Some(node) = next.nodes.get(consumer).cloned() else {
            continue;
        };

        let new_ids: Vec<NodeId> = (1..=partitions.len()).map(|i| part_id(consumer, i)).collect();
        let copies: Vec<Node> = new_ids
            .iter()
            .zip(partitions)
            .map(|(new_id, slice)| {
                let mut copy = node.clone();
                copy.id = new_id.clone();
                copy.original_node_id = Some(node.logical_id().to_string());
                for input in copy.input.iter_mut() {
                    if input.source_node() == Some(upstream.as_str()) {
                        input.assign_slice(slice);
                    }
                }
                copy
            })
            .collect();

        debug!(
            "nodo {} dividido en {} particiones de la salida de {}",
            consumer,
            partitions.len(),
            upstream
        );

        next.splice_node(consumer, copies);
        split_edges(&mut next, consumer, &new_ids);
        next_statuses.remove(consumer);
        for id in &new_ids {
            next_statuses.insert(id.clone(), NodeStatus::pending());
        }
        modified = true;
    }

    if modified {
        next.reindex()?;
    }

    let (graph, statuses, cascaded) = resolve_fan_in(next, next_statuses)?;

    Ok(PartitionOutcome {
        graph,
        statuses,
        modified: modified || cascaded,
    })
}

#[derive(Debug, Clone, PartialEq)]
enum FanInKind {
    Edge,
    Sliding(usize),
}

/// Un nodo a dividir: las posiciones en `input` del grupo con nombre
/// que dispara la división.
#[derive(Debug, Clone, PartialEq)]
struct FanInSplit {
    node_id: NodeId,
    group: Vec<usize>,
    kind: FanInKind,
}

/// Itera hasta punto fijo: cada pasada busca un nodo divisible sobre una
/// foto del grafo y produce un grafo nuevo.
fn resolve_fan_in(
    mut graph: Graph,
    mut statuses: StatusMap,
) -> Result<(Graph, StatusMap, bool), GraphError> {
    let mut modified = false;

    while let Some(plan) = find_fan_in_split(&graph, &statuses) {
        let (g, s) = apply_fan_in_split(&graph, &statuses, &plan)?;
        graph = g;
        statuses = s;
        modified = true;
    }

    Ok((graph, statuses, modified))
}

fn find_fan_in_split(graph: &Graph, statuses: &StatusMap) -> Option<FanInSplit> {
    for id in &graph.order {
        if !is_pending(statuses, id) {
            continue;
        }
        let node = graph.node(id)?;

        let mut groups: BTreeMap<Option<&str>, Vec<usize>> = BTreeMap::new();
        for (pos, input) in node.input.iter().enumerate() {
            if input.partitioner().map(|p| p.is_fan_in()).unwrap_or(false) {
                groups.entry(input.name.as_deref()).or_default().push(pos);
            }
        }

        for positions in groups.into_values() {
            let Some(params) = node.input[positions[0]].partition_params.as_ref() else {
                continue;
            };
            let kind = match params.partitioner {
                Partitioner::Sliding => FanInKind::Sliding(params.window.unwrap_or(1).max(1)),
                _ => FanInKind::Edge,
            };
            let splittable = match kind {
                FanInKind::Edge => positions.len() > 1,
                FanInKind::Sliding(w) => positions.len() > w,
            };
            if splittable {
                return Some(FanInSplit {
                    node_id: id.clone(),
                    group: positions,
                    kind,
                });
            }
        }
    }
    None
}

fn apply_fan_in_split(
    graph: &Graph,
    statuses: &StatusMap,
    plan: &FanInSplit,
) -> Result<(Graph, StatusMap), GraphError> {
    let node = graph
        .node(&plan.node_id)
        .cloned()
        .ok_or_else(|| GraphError::UnknownNode(plan.node_id.clone()))?;

    let windows: Vec<Vec<usize>> = match plan.kind {
        FanInKind::Edge => plan.group.iter().map(|p| vec![*p]).collect(),
        FanInKind::Sliding(w) => plan.group.windows(w).map(|win| win.to_vec()).collect(),
    };

    let group_sources: HashSet<&str> = plan
        .group
        .iter()
        .filter_map(|p| node.input[*p].source_node())
        .collect();

    let new_ids: Vec<NodeId> = (1..=windows.len()).map(|i| part_id(&node.id, i)).collect();
    let mut next = graph.clone();

    let copies: Vec<Node> = new_ids
        .iter()
        .zip(&windows)
        .map(|(new_id, window)| {
            let mut copy = node.clone();
            copy.id = new_id.clone();
            copy.original_node_id = Some(node.logical_id().to_string());
            copy.input = node
                .input
                .iter()
                .enumerate()
                .filter(|(pos, _)| !plan.group.contains(pos) || window.contains(pos))
                .map(|(_, input)| input.clone())
                .collect();
            copy
        })
        .collect();

    // aristas entrantes: las del grupo sólo van a la copia que consume esa
    // entrada; el resto se replica en todas
    let preds: Vec<NodeId> = graph.predecessors(&node.id).to_vec();
    for p in &preds {
        next.edges.remove(&(p.clone(), node.id.clone()));
    }
    for (new_id, window) in new_ids.iter().zip(&windows) {
        let window_sources: HashSet<&str> = window
            .iter()
            .filter_map(|p| node.input[*p].source_node())
            .collect();
        for p in &preds {
            if !group_sources.contains(p.as_str()) || window_sources.contains(p.as_str()) {
                let e = Edge::new(p.clone(), new_id.clone());
                next.edges.insert(e.key(), e);
            }
        }
    }

    debug!(
        "fan-in: nodo {} dividido en {} ({:?})",
        node.id,
        new_ids.len(),
        plan.kind
    );

    next.splice_node(&node.id, copies);
    fan_out_successors(&mut next, &node.id, &new_ids);
    next.reindex()?;

    let mut next_statuses = statuses.clone();
    next_statuses.remove(&node.id);
    for id in &new_ids {
        next_statuses.insert(id.clone(), NodeStatus::pending());
    }

    Ok((next, next_statuses))
}

fn is_pending(statuses: &StatusMap, id: &str) -> bool {
    statuses
        .get(id)
        .map(|s| s.status == NodeState::Pending)
        .unwrap_or(true)
}
