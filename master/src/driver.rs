use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::Value;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, error, info, warn};

use common::{
    apply_partition_list, apply_runtime_params, build_graph, create_new_dag_json,
    get_ready_nodes, group_by_original, partition_ready_nodes, with_time_window,
    DagExecutionRecord, DagExecutionView, DagRuntimeParams, Graph, GraphError, LockState, NodeId,
    NodeState, NodeStatus, StatusMap, TimeWindow, UpdateDagExecutionRequest,
    UpdateDagExecutionResponse,
};

use crate::backend::{JobHandle, PodPhase};
use crate::error::EngineError;
use crate::launcher::{launch_node, LaunchCollector, LaunchContext};
use crate::lock::{acquire_idle_lock, LockLease};
use crate::state::AppState;
use crate::tracking::RunStatus;

/// Una invocación de execute-dag.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub username: String,
    pub dag_id: String,
    /// `None` = ejecución nueva.
    pub dag_execution_id: Option<String>,
    pub dag_params: Option<DagRuntimeParams>,
    pub recovery: bool,
    pub auth_info: Value,
    pub periodic: Option<PeriodicLaunch>,
}

/// Datos extra de una ejecución disparada por una ejecución periódica.
#[derive(Debug, Clone)]
pub struct PeriodicLaunch {
    pub periodic_run_id: String,
    pub window: TimeWindow,
    pub drop_dead_time: DateTime<Utc>,
    pub experiment_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Started {
    pub dag_execution_id: String,
    pub parent_run_id: String,
}

/// Resultado de una pasada de avance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// Todos los nodos terminaron; el run padre quedó FINISHED.
    Finished,
    /// Se lanzaron estos nodos.
    Launched(Vec<NodeId>),
    /// Nada listo: hay nodos corriendo.
    Waiting,
}

/* =========================
   Entrada HTTP / periódica
   ========================= */

/// Prepara la ejecución, suelta el lock y sigue el avance en segundo plano.
pub async fn start(state: &AppState, req: StartRequest) -> Result<Started, EngineError> {
    let username = req.username.clone();
    let (started, lease) = prepare(state, req).await?;
    lease.release();

    let bg = state.clone();
    let execution_id = started.dag_execution_id.clone();
    tokio::spawn(async move {
        match advance(&bg, &username, &execution_id).await {
            Ok(outcome) => debug!(execution_id = %execution_id, "avance: {:?}", outcome),
            Err(e) => error!(
                execution_id = %execution_id,
                retryable = e.is_retryable(),
                "avance en segundo plano fallido: {}",
                e
            ),
        }
    });

    Ok(started)
}

/// Resuelve la identidad de la ejecución y devuelve el lock tomado.
pub async fn prepare(
    state: &AppState,
    req: StartRequest,
) -> Result<(Started, LockLease), EngineError> {
    match req.dag_execution_id.clone() {
        None => new_execution(state, req).await,
        Some(id) => continue_execution(state, req, &id).await,
    }
}

async fn new_execution(
    state: &AppState,
    req: StartRequest,
) -> Result<(Started, LockLease), EngineError> {
    let dag = state
        .store
        .get_dag(&req.dag_id)?
        .ok_or_else(|| EngineError::DagNotFound(req.dag_id.clone()))?;

    let mut dag = match &req.dag_params {
        Some(params) => apply_runtime_params(&dag, params)?,
        None => dag,
    };

    if let Some(p) = &req.periodic {
        let (windowed, touched) = with_time_window(&dag, &p.window);
        debug!(dag_id = %dag.id, touched, "ventana temporal inyectada");
        dag = windowed;
    }

    build_graph(&dag)?;

    let experiment_id = match req
        .periodic
        .as_ref()
        .and_then(|p| p.experiment_id.clone())
        .or_else(|| dag.experiment_id.clone())
    {
        Some(id) => id,
        None => {
            state
                .tracking
                .create_experiment(&format!("parallels-{}", dag.id))
                .await?
        }
    };

    let execution_id = format!("{}-{}", dag.id, uuid::Uuid::new_v4());

    let mut tags = BTreeMap::from([
        ("parallels.dag_id".to_string(), dag.id.clone()),
        ("parallels.dag_execution_id".to_string(), execution_id.clone()),
        ("mlflow.user".to_string(), req.username.clone()),
    ]);
    if let Some(p) = &req.periodic {
        tags.insert("parallels.periodic_run_id".to_string(), p.periodic_run_id.clone());
    }
    let parent = state.tracking.create_run(&experiment_id, &tags).await?;

    let now = Utc::now();
    let record = DagExecutionRecord {
        dag_id: dag.id.clone(),
        dag_execution_id: execution_id.clone(),
        username: req.username.clone(),
        parent_run_id: parent.run_id.clone(),
        experiment_id,
        auth_info: req.auth_info,
        node_statuses: dag
            .nodes
            .iter()
            .map(|n| (n.id.clone(), NodeStatus::pending()))
            .collect(),
        dag_json: dag,
        locked: LockState::Yes,
        update_time: now,
        start_time: now,
        periodic_run_id: req.periodic.as_ref().map(|p| p.periodic_run_id.clone()),
        time_window: req.periodic.as_ref().map(|p| p.window),
        drop_dead_time: req.periodic.as_ref().map(|p| p.drop_dead_time),
    };
    state.store.create_execution(&record)?;
    let lease = LockLease::held(
        state.store.clone(),
        &req.username,
        &execution_id,
        state.config.lock,
    );

    match serde_json::to_vec_pretty(&record.dag_json) {
        Ok(bytes) => {
            if let Err(e) = state
                .tracking
                .log_artifact(&parent.run_id, "dag.json", bytes)
                .await
            {
                warn!(execution_id = %execution_id, "no se pudo guardar dag.json: {}", e);
            }
        }
        Err(e) => warn!(execution_id = %execution_id, "no se pudo serializar dag.json: {}", e),
    }

    info!(
        execution_id = %execution_id,
        parent_run_id = %parent.run_id,
        user = %req.username,
        "nueva ejecución de DAG"
    );

    Ok((
        Started {
            dag_execution_id: execution_id,
            parent_run_id: parent.run_id,
        },
        lease,
    ))
}

async fn continue_execution(
    state: &AppState,
    req: StartRequest,
    execution_id: &str,
) -> Result<(Started, LockLease), EngineError> {
    let lease = acquire_idle_lock(
        state.store.clone(),
        &req.username,
        execution_id,
        state.config.lock,
    )
    .await?;

    let mut rec = state
        .store
        .get_execution(&req.username, execution_id)?
        .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?;

    if rec.dag_id != req.dag_id {
        return Err(EngineError::InvalidRequest(format!(
            "la ejecución {execution_id} pertenece al DAG {}, no a {}",
            rec.dag_id, req.dag_id
        )));
    }

    if req.recovery {
        let reset = rec
            .node_statuses
            .values_mut()
            .map(|st| st.reset_for_retry())
            .filter(|r| *r)
            .count();
        if let Some(params) = &req.dag_params {
            rec.dag_json = apply_runtime_params(&rec.dag_json, params)?;
        }
        state
            .store
            .put_state(&req.username, execution_id, &rec.dag_json, &rec.node_statuses)?;

        if reset > 0 {
            if let Err(e) = state
                .tracking
                .update_run_status(&rec.parent_run_id, RunStatus::Running)
                .await
            {
                warn!(execution_id, "no se pudo reabrir el run padre: {}", e);
            }
        }
        info!(execution_id, reset, "recuperación: nodos fallidos vuelven a PENDING");
    } else if req.dag_params.is_some() {
        warn!(execution_id, "dagParams ignorados: sólo se aplican con recovery");
    }

    Ok((
        Started {
            dag_execution_id: rec.dag_execution_id,
            parent_run_id: rec.parent_run_id,
        },
        lease,
    ))
}

/* =========================
   Avance
   ========================= */

/// Una pasada completa con el lock tomado: refresca nodos RUNNING, calcula
/// los listos, particiona, lanza y persiste. El lock se suelta siempre.
pub async fn advance(
    state: &AppState,
    username: &str,
    execution_id: &str,
) -> Result<Advance, EngineError> {
    let mut lease =
        acquire_idle_lock(state.store.clone(), username, execution_id, state.config.lock).await?;
    let result = advance_locked(state, &mut lease, username, execution_id).await;
    lease.release();
    result
}

async fn advance_locked(
    state: &AppState,
    lease: &mut LockLease,
    username: &str,
    execution_id: &str,
) -> Result<Advance, EngineError> {
    let store = state.store.as_ref();
    let mut rec = store
        .get_execution(username, execution_id)?
        .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?;

    if refresh_running(state, &mut rec.node_statuses).await > 0 {
        store.put_state(username, execution_id, &rec.dag_json, &rec.node_statuses)?;
    }

    let mut graph = build_graph(&rec.dag_json)?;
    let mut statuses = rec.node_statuses.clone();

    // particionar puede desbloquear o bloquear nodos: se recalcula hasta que no cambie
    let ready = loop {
        let ready = get_ready_nodes(&graph, &statuses);

        if let Some(failed) = ready.failed {
            error!(
                execution_id,
                node_id = %failed.node_id,
                "nodo fallido, la ejecución se marca FAILED"
            );
            if let Err(e) = state
                .tracking
                .set_terminated(&rec.parent_run_id, RunStatus::Failed)
                .await
            {
                warn!(execution_id, "no se pudo marcar el run padre: {}", e);
            }
            return Err(EngineError::UpstreamNodeFailed {
                node_id: failed.node_id,
                run_id: failed.run_id,
            });
        }

        if ready.all_done {
            state
                .tracking
                .set_terminated(&rec.parent_run_id, RunStatus::Finished)
                .await?;
            info!(execution_id, "ejecución terminada");
            return Ok(Advance::Finished);
        }

        let outcome = partition_ready_nodes(&ready.ready, &graph, &statuses)?;
        if !outcome.modified {
            break ready.ready;
        }
        graph = outcome.graph;
        statuses = outcome.statuses;
        rec.dag_json = create_new_dag_json(&rec.dag_json, &graph);
        store.put_state(username, execution_id, &rec.dag_json, &statuses)?;
        debug!(execution_id, "DAG reparticionado, recalculando nodos listos");
    };

    if ready.is_empty() {
        debug!(execution_id, "sin nodos listos");
        return Ok(Advance::Waiting);
    }

    let groups = group_by_original(&ready, &graph);
    let ctx = launch_context(state, &rec);
    let collector = LaunchCollector::default();

    info!(
        execution_id,
        nodes = ready.len(),
        groups = groups.len(),
        "lanzando nodos listos"
    );

    let results = {
        let batch = timeout(
            state.config.launch_timeout,
            join_all(groups.iter().map(|(logical_id, members)| {
                launch_group(state, &ctx, logical_id, members, &graph, &statuses, &collector)
            })),
        );
        tokio::pin!(batch);

        let every = state.config.lock.renew_every.max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + every, every);
        loop {
            tokio::select! {
                res = &mut batch => break res,
                _ = ticker.tick() => lease.renew(),
            }
        }
    };

    // lo lanzado queda RUNNING aunque el lote falle
    let launched = std::mem::take(&mut *collector.lock().map_err(|_| {
        EngineError::NodeLaunchFailure {
            node_id: ready.join(","),
            message: "colector envenenado".to_string(),
        }
    })?);
    statuses.extend(launched);
    store.put_state(username, execution_id, &rec.dag_json, &statuses)?;

    match results {
        Err(_) => {
            error!(
                execution_id,
                "el lote de lanzamientos no terminó en {:?}", state.config.launch_timeout
            );
            Err(EngineError::NodeLaunchFailure {
                node_id: ready.join(","),
                message: format!("timeout tras {:?}", state.config.launch_timeout),
            })
        }
        Ok(group_results) => {
            if let Some(e) = group_results.into_iter().find_map(Result::err) {
                return Err(e);
            }
            Ok(Advance::Launched(ready))
        }
    }
}

async fn launch_group(
    state: &AppState,
    ctx: &LaunchContext,
    logical_id: &str,
    members: &[NodeId],
    graph: &Graph,
    statuses: &StatusMap,
    collector: &LaunchCollector,
) -> Result<(), EngineError> {
    debug!(logical_id, partitions = members.len(), "lanzando grupo");
    let launches = members.iter().map(|id| async move {
        let node = graph
            .node(id)
            .ok_or_else(|| EngineError::Graph(GraphError::UnknownNode(id.clone())))?;
        launch_node(
            ctx,
            node,
            statuses,
            state.tracking.as_ref(),
            state.backend.as_ref(),
            collector,
        )
        .await
    });
    join_all(launches).await.into_iter().collect()
}

fn launch_context(state: &AppState, rec: &DagExecutionRecord) -> LaunchContext {
    LaunchContext {
        dag_id: rec.dag_id.clone(),
        dag_execution_id: rec.dag_execution_id.clone(),
        parent_run_id: rec.parent_run_id.clone(),
        experiment_id: rec.experiment_id.clone(),
        username: rec.username.clone(),
        auth_info: rec.auth_info.clone(),
        periodic_run_id: rec.periodic_run_id.clone(),
        drop_dead_time: rec.drop_dead_time,
        tracking_uri: state.config.tracking_uri.clone(),
        callback_base_url: state.config.callback_base_url.clone(),
    }
}

/// Consulta el tracking store por cada nodo RUNNING y aplica los estados
/// terminales. Si el run sigue vivo pero el pod murió, el nodo pasa a FAILED.
/// Devuelve cuántos nodos cambiaron.
async fn refresh_running(state: &AppState, statuses: &mut StatusMap) -> usize {
    let mut changed = 0;

    for (node_id, st) in statuses.iter_mut() {
        if st.status != NodeState::Running {
            continue;
        }
        let Some(run_id) = st.run_id.clone() else {
            continue;
        };

        let run = match state.tracking.get_run(&run_id).await {
            Ok(run) => run,
            Err(e) => {
                warn!(node_id = %node_id, "no se pudo consultar el run {}: {}", run_id, e);
                continue;
            }
        };

        if let Some(new_state) = run.status.terminal_node_state() {
            debug!(node_id = %node_id, "run {} terminó: {:?}", run_id, new_state);
            st.status = new_state;
            st.artifact_uri = run.artifact_uri;
            st.lifecycle_stage = run.lifecycle_stage;
            changed += 1;
            continue;
        }

        // ejecuciones guardadas antes de persistir el handle lo reconstruyen
        let handle = st
            .job_handle
            .clone()
            .map(JobHandle)
            .unwrap_or_else(|| JobHandle::for_run(&run_id));
        match state.backend.get_job_pod_status(&handle).await {
            Ok(PodPhase::Failed) => {
                warn!(node_id = %node_id, "el pod del run {} falló sin reportar", run_id);
                st.status = NodeState::Failed;
                changed += 1;
                if let Err(e) = state
                    .tracking
                    .set_terminated(&run_id, RunStatus::Failed)
                    .await
                {
                    warn!(run_id = %run_id, "no se pudo marcar el run como FAILED: {}", e);
                }
            }
            Ok(_) => {}
            Err(e) => debug!(node_id = %node_id, "estado del pod no disponible: {}", e),
        }
    }

    changed
}

/* =========================
   update-dag-execution / consulta
   ========================= */

/// Divide los consumidores del nodo que ejecutó `run_id` según las
/// particiones que ese nodo produjo.
pub async fn update_dag_execution(
    state: &AppState,
    username: &str,
    req: &UpdateDagExecutionRequest,
) -> Result<UpdateDagExecutionResponse, EngineError> {
    let lease = acquire_idle_lock(
        state.store.clone(),
        username,
        &req.dag_execution_id,
        state.config.lock,
    )
    .await?;

    let mut rec = state
        .store
        .get_execution(username, &req.dag_execution_id)?
        .ok_or_else(|| EngineError::ExecutionNotFound(req.dag_execution_id.clone()))?;
    if rec.dag_id != req.dagid {
        return Err(EngineError::InvalidRequest(format!(
            "la ejecución {} pertenece al DAG {}",
            req.dag_execution_id, rec.dag_id
        )));
    }

    let graph = build_graph(&rec.dag_json)?;
    let outcome = apply_partition_list(&graph, &rec.node_statuses, &req.run_id, &req.partitions)?;

    if outcome.modified {
        rec.dag_json = create_new_dag_json(&rec.dag_json, &outcome.graph);
        state.store.put_state(
            username,
            &req.dag_execution_id,
            &rec.dag_json,
            &outcome.statuses,
        )?;
        info!(
            execution_id = %req.dag_execution_id,
            run_id = %req.run_id,
            partitions = req.partitions.len(),
            "DAG reparticionado por aristas"
        );
    } else {
        debug!(execution_id = %req.dag_execution_id, "sin consumidores que dividir");
    }

    lease.release();

    Ok(UpdateDagExecutionResponse {
        status: "ok".to_string(),
        dag_execution_id: req.dag_execution_id.clone(),
        nodes: outcome.graph.order,
    })
}

pub fn get_dag_execution(
    state: &AppState,
    username: &str,
    execution_id: &str,
) -> Result<DagExecutionView, EngineError> {
    state
        .store
        .get_execution(username, execution_id)?
        .map(|rec| DagExecutionView::from(&rec))
        .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ExecutionStore;
    use crate::lock::LockSettings;
    use crate::testutil::{sample_dag, test_env, FakeBackend, TestEnv};
    use common::{InputSpec, PartitionSlice};
    use serde_json::json;
    use std::sync::Arc;

    fn request(dag_execution_id: Option<&str>) -> StartRequest {
        StartRequest {
            username: "alice".into(),
            dag_id: "dag-1".into(),
            dag_execution_id: dag_execution_id.map(str::to_string),
            dag_params: None,
            recovery: false,
            auth_info: json!({"token": "t"}),
            periodic: None,
        }
    }

    async fn fresh_execution(env: &TestEnv) -> Started {
        env.store.put_dag(&sample_dag()).unwrap();
        let (started, lease) = prepare(&env.state, request(None)).await.unwrap();
        lease.release();
        started
    }

    fn record(env: &TestEnv, id: &str) -> DagExecutionRecord {
        env.store.get_execution("alice", id).unwrap().unwrap()
    }

    fn run_of(env: &TestEnv, exec: &str, node: &str) -> String {
        record(env, exec).node_statuses[node].run_id.clone().unwrap()
    }

    #[tokio::test]
    async fn ejecucion_nueva_crea_registro_y_run_padre() {
        let env = test_env();
        let started = fresh_execution(&env).await;

        assert!(started.dag_execution_id.starts_with("dag-1-"));
        let rec = record(&env, &started.dag_execution_id);
        assert_eq!(rec.locked, LockState::No);
        assert_eq!(rec.parent_run_id, started.parent_run_id);
        assert_eq!(rec.experiment_id, "7");
        assert!(rec.node_statuses.values().all(|s| s.is(NodeState::Pending)));

        let artifacts = env.tracking.artifacts();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].0, started.parent_run_id);
        assert_eq!(artifacts[0].1, "dag.json");
    }

    #[tokio::test]
    async fn dag_inexistente() {
        let env = test_env();
        let err = prepare(&env.state, request(None)).await.err().unwrap();
        assert!(matches!(err, EngineError::DagNotFound(_)));
    }

    #[tokio::test]
    async fn override_de_nodo_desconocido_se_rechaza() {
        let env = test_env();
        env.store.put_dag(&sample_dag()).unwrap();
        let mut req = request(None);
        req.dag_params = Some(serde_json::from_value(json!({"nodes": {"zzz": {}}})).unwrap());

        let err = prepare(&env.state, req).await.err().unwrap();
        assert!(matches!(err, EngineError::Graph(GraphError::UnknownNode(_))));
        assert_eq!(env.tracking.run_count(), 0);
    }

    #[tokio::test]
    async fn cadena_avanza_hasta_terminar() {
        let env = test_env();
        let id = fresh_execution(&env).await.dag_execution_id;

        let out = advance(&env.state, "alice", &id).await.unwrap();
        assert_eq!(out, Advance::Launched(vec!["a".into()]));
        assert_eq!(record(&env, &id).status_of("a"), NodeState::Running);

        // a sigue corriendo: nada nuevo
        assert_eq!(advance(&env.state, "alice", &id).await.unwrap(), Advance::Waiting);

        env.tracking.finish(&run_of(&env, &id, "a"), RunStatus::Finished);
        assert_eq!(
            advance(&env.state, "alice", &id).await.unwrap(),
            Advance::Launched(vec!["b".into()])
        );

        // b recibe los artefactos del run de a
        let subs = env.backend.submissions();
        let b = subs.iter().find(|s| s.spec.node_id == "b").unwrap();
        assert_eq!(
            b.spec.inputs[0].source,
            common::InputSource::RunArtifacts {
                run_id: run_of(&env, &id, "a"),
                prefix: None
            }
        );

        env.tracking.finish(&run_of(&env, &id, "b"), RunStatus::Finished);
        advance(&env.state, "alice", &id).await.unwrap();
        env.tracking.finish(&run_of(&env, &id, "c"), RunStatus::Finished);
        assert_eq!(advance(&env.state, "alice", &id).await.unwrap(), Advance::Finished);

        let rec = record(&env, &id);
        assert_eq!(rec.locked, LockState::No);
        assert_eq!(env.tracking.status_of(&rec.parent_run_id), Some(RunStatus::Finished));
    }

    #[tokio::test]
    async fn nodo_fallido_marca_el_padre_failed() {
        let env = test_env();
        let id = fresh_execution(&env).await.dag_execution_id;
        advance(&env.state, "alice", &id).await.unwrap();
        env.tracking.finish(&run_of(&env, &id, "a"), RunStatus::Failed);

        let err = advance(&env.state, "alice", &id).await.unwrap_err();
        assert!(matches!(err, EngineError::UpstreamNodeFailed { ref node_id, .. } if node_id == "a"));

        let rec = record(&env, &id);
        assert_eq!(rec.status_of("a"), NodeState::Failed);
        assert_eq!(rec.locked, LockState::No);
        assert_eq!(env.tracking.status_of(&rec.parent_run_id), Some(RunStatus::Failed));
    }

    #[tokio::test]
    async fn pod_muerto_cuenta_como_fallo() {
        let env = test_env();
        let id = fresh_execution(&env).await.dag_execution_id;
        advance(&env.state, "alice", &id).await.unwrap();
        let run_a = run_of(&env, &id, "a");
        assert_eq!(
            record(&env, &id).node_statuses["a"].job_handle,
            Some(FakeBackend::handle_for(&run_a).0)
        );
        env.backend.set_phase(&run_a, PodPhase::Failed);

        let err = advance(&env.state, "alice", &id).await.unwrap_err();
        assert!(matches!(err, EngineError::UpstreamNodeFailed { .. }));
        assert_eq!(env.tracking.status_of(&run_a), Some(RunStatus::Failed));
    }

    #[tokio::test]
    async fn recovery_reintenta_solo_los_fallidos() {
        let env = test_env();
        let id = fresh_execution(&env).await.dag_execution_id;
        advance(&env.state, "alice", &id).await.unwrap();
        let first_run = run_of(&env, &id, "a");
        env.tracking.finish(&first_run, RunStatus::Failed);
        let _ = advance(&env.state, "alice", &id).await;

        let mut req = request(Some(&id));
        req.recovery = true;
        req.dag_params =
            Some(serde_json::from_value(json!({"nodes": {"a": {"instance_type": "m5.xlarge"}}})).unwrap());
        let (started, lease) = prepare(&env.state, req).await.unwrap();
        lease.release();
        assert_eq!(started.dag_execution_id, id);

        let rec = record(&env, &id);
        assert_eq!(rec.status_of("a"), NodeState::Pending);
        assert_eq!(rec.node_statuses["a"].previous_attempts, vec![first_run.clone()]);
        assert_eq!(env.tracking.status_of(&rec.parent_run_id), Some(RunStatus::Running));

        assert_eq!(
            advance(&env.state, "alice", &id).await.unwrap(),
            Advance::Launched(vec!["a".into()])
        );
        let rec = record(&env, &id);
        assert_ne!(rec.node_statuses["a"].run_id.as_deref(), Some(first_run.as_str()));
        assert_eq!(rec.node_statuses["a"].previous_attempts, vec![first_run]);
        let last = env.backend.submissions().pop().unwrap();
        assert_eq!(last.spec.instance_type.as_deref(), Some("m5.xlarge"));
    }

    #[tokio::test]
    async fn continuar_con_otro_dag_es_invalido() {
        let env = test_env();
        let id = fresh_execution(&env).await.dag_execution_id;
        let mut req = request(Some(&id));
        req.dag_id = "otro".into();
        let err = prepare(&env.state, req).await.err().unwrap();
        assert!(matches!(err, EngineError::InvalidRequest(_)));
        // el lock se soltó al descartar el lease
        assert_eq!(record(&env, &id).locked, LockState::No);
    }

    #[tokio::test]
    async fn paralelizacion_lanza_todas_las_particiones() {
        let env = test_env();
        let mut dag = sample_dag();
        dag.nodes[0].parallelization = Some(3);
        env.store.put_dag(&dag).unwrap();
        let (started, lease) = prepare(&env.state, request(None)).await.unwrap();
        lease.release();
        let id = started.dag_execution_id;

        let out = advance(&env.state, "alice", &id).await.unwrap();
        assert_eq!(
            out,
            Advance::Launched(vec!["a-part-1".into(), "a-part-2".into(), "a-part-3".into()])
        );

        let rec = record(&env, &id);
        assert!(rec.node_statuses.get("a").is_none());
        let b = rec.dag_json.nodes.iter().find(|n| n.id == "b").unwrap();
        let sources: Vec<_> = b.input.iter().filter_map(InputSpec::source_node).collect();
        assert_eq!(sources, vec!["a-part-1", "a-part-2", "a-part-3"]);

        let subs = env.backend.submissions();
        assert_eq!(subs.len(), 3);
        assert!(subs.iter().all(|s| s.spec.original_node_id == "a"));
    }

    #[tokio::test]
    async fn fallo_de_lanzamiento_deja_el_nodo_running() {
        let env = test_env();
        let id = fresh_execution(&env).await.dag_execution_id;
        env.backend.fail_node("a");

        let err = advance(&env.state, "alice", &id).await.unwrap_err();
        assert!(matches!(err, EngineError::NodeLaunchFailure { .. }));

        let rec = record(&env, &id);
        assert_eq!(rec.status_of("a"), NodeState::Running);
        assert!(rec.node_statuses["a"].run_id.is_some());
        assert_eq!(rec.locked, LockState::No);
    }

    #[tokio::test]
    async fn lote_que_no_termina_es_fallo() {
        let mut env = test_env();
        env.state.config = Arc::new(crate::config::Config {
            launch_timeout: Duration::from_millis(30),
            ..(*env.state.config).clone()
        });
        env.backend.set_delay(Duration::from_millis(500));
        let id = fresh_execution(&env).await.dag_execution_id;

        let err = advance(&env.state, "alice", &id).await.unwrap_err();
        assert!(matches!(err, EngineError::NodeLaunchFailure { .. }));
        let rec = record(&env, &id);
        assert_eq!(rec.status_of("a"), NodeState::Running);
        assert_eq!(rec.locked, LockState::No);
    }

    #[tokio::test]
    async fn lock_ajeno_impide_avanzar() {
        let env = test_env();
        let id = fresh_execution(&env).await.dag_execution_id;
        env.store
            .set_lock("alice", &id, None, LockState::Yes, Utc::now())
            .unwrap();

        let err = advance(&env.state, "alice", &id).await.unwrap_err();
        assert!(matches!(err, EngineError::LockUnavailable(_)));
        assert!(env.backend.submissions().is_empty());
    }

    #[tokio::test]
    async fn update_dag_execution_divide_consumidores() {
        let env = test_env();
        let id = fresh_execution(&env).await.dag_execution_id;
        advance(&env.state, "alice", &id).await.unwrap();
        let run_a = run_of(&env, &id, "a");
        env.tracking.finish(&run_a, RunStatus::Finished);

        let req = UpdateDagExecutionRequest {
            run_id: run_a.clone(),
            dagid: "dag-1".into(),
            dag_execution_id: id.clone(),
            partitions: vec![
                PartitionSlice {
                    prefix: Some("out/0".into()),
                    ..Default::default()
                },
                PartitionSlice {
                    prefix: Some("out/1".into()),
                    ..Default::default()
                },
            ],
        };
        let resp = update_dag_execution(&env.state, "alice", &req).await.unwrap();
        assert!(resp.nodes.contains(&"b-part-1".to_string()));
        assert!(resp.nodes.contains(&"b-part-2".to_string()));
        assert!(!resp.nodes.contains(&"b".to_string()));

        let rec = record(&env, &id);
        assert_eq!(rec.status_of("b-part-2"), NodeState::Pending);
        assert_eq!(rec.locked, LockState::No);
    }

    #[tokio::test]
    async fn update_dag_execution_con_lista_vacia() {
        let env = test_env();
        let id = fresh_execution(&env).await.dag_execution_id;
        let req = UpdateDagExecutionRequest {
            run_id: "nope".into(),
            dagid: "dag-1".into(),
            dag_execution_id: id.clone(),
            partitions: vec![],
        };
        let err = update_dag_execution(&env.state, "alice", &req).await.unwrap_err();
        assert!(matches!(err, EngineError::Graph(GraphError::EmptyPartitionList)));
        assert_eq!(record(&env, &id).locked, LockState::No);
    }

    #[tokio::test]
    async fn vista_no_expone_credenciales() {
        let env = test_env();
        let id = fresh_execution(&env).await.dag_execution_id;
        let view = get_dag_execution(&env.state, "alice", &id).unwrap();
        let raw = serde_json::to_value(&view).unwrap();
        assert!(raw.get("auth_info").is_none());
        assert!(matches!(
            get_dag_execution(&env.state, "bob", &id),
            Err(EngineError::ExecutionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn lote_lento_renueva_el_lock_y_bloquea_a_otros() {
        let mut env = test_env();
        let mut cfg = (*env.state.config).clone();
        cfg.lock = LockSettings {
            idle: Duration::from_millis(40),
            max_wait: Duration::from_millis(100),
            poll: Duration::from_millis(10),
            renew_every: Duration::from_millis(10),
        };
        env.state.config = Arc::new(cfg.clone());
        let id = fresh_execution(&env).await.dag_execution_id;
        env.backend.set_delay(Duration::from_millis(400));

        let bg = env.state.clone();
        let bg_id = id.clone();
        let task = tokio::spawn(async move { advance(&bg, "alice", &bg_id).await });

        tokio::time::sleep(Duration::from_millis(60)).await;
        let first = record(&env, &id);
        assert_eq!(first.locked, LockState::Yes);
        tokio::time::sleep(Duration::from_millis(60)).await;
        let second = record(&env, &id);
        assert_eq!(second.locked, LockState::Yes);
        assert!(second.update_time > first.update_time);

        // el lock lleva más de `idle` tomado, pero sigue renovado
        let err = acquire_idle_lock(env.state.store.clone(), "alice", &id, cfg.lock)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::LockUnavailable(_)));

        task.await.unwrap().unwrap();
        let rec = record(&env, &id);
        assert_eq!(rec.locked, LockState::No);
        assert_eq!(rec.status_of("a"), NodeState::Running);
    }

    #[tokio::test]
    async fn start_lanza_la_raiz_en_segundo_plano() {
        let env = test_env();
        env.store.put_dag(&sample_dag()).unwrap();
        let started = start(&env.state, request(None)).await.unwrap();
        let id = started.dag_execution_id;

        let mut launched = false;
        for _ in 0..100 {
            let rec = record(&env, &id);
            if rec.status_of("a") == NodeState::Running && rec.locked == LockState::No {
                launched = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(launched, "el avance en segundo plano no lanzó la raíz");

        let subs = env.backend.submissions();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].spec.node_id, "a");
        let rec = record(&env, &id);
        assert_eq!(rec.status_of("b"), NodeState::Pending);
        assert_eq!(subs[0].spec.run_id, rec.node_statuses["a"].run_id.clone().unwrap());
    }
}
