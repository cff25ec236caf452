use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap},
    routing::{get, post, put},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use common::{
    build_graph, DagDefinition, DagExecutionView, ExecuteDagForm, ExecuteDagRequest,
    ExecuteDagResponse, PeriodRunResponse, PeriodicRunConfig, UpdateDagExecutionRequest,
    UpdateDagExecutionResponse,
};

use crate::driver::{self, StartRequest};
use crate::error::EngineError;
use crate::periodic;
use crate::state::AppState;

/// Cabecera con la identidad del llamador, puesta por la capa de auth.
pub const USER_HEADER: &str = "x-parallels-user";
pub const ANONYMOUS: &str = "anonymous";

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/execute-dag", post(execute_dag))
        .route("/api/v1/update-dag-execution", post(update_dag_execution))
        .route("/api/v1/dag-executions/:id", get(get_dag_execution))
        .route("/api/v1/dags", put(save_dag))
        .route("/api/v1/dags/:id", get(get_dag))
        .route("/api/v1/periodic-runs", put(save_periodic_run))
        .route("/api/v1/periodic-runs/:id/run", post(run_periodic))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn caller(headers: &HeaderMap) -> String {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(ANONYMOUS)
        .to_string()
}

/// Credenciales que se reenvían a los jobs de esta ejecución.
fn auth_info(headers: &HeaderMap, username: &str) -> Value {
    let mut info = json!({ "username": username });
    if let Some(auth) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        info["authorization"] = json!(auth);
    }
    info
}

/// El cuerpo de execute-dag puede llegar como JSON o como formulario.
fn parse_execute_body(headers: &HeaderMap, body: &Bytes) -> Result<ExecuteDagRequest, EngineError> {
    let is_form = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false);

    if is_form {
        let form: ExecuteDagForm = serde_urlencoded::from_bytes(body)
            .map_err(|e| EngineError::InvalidRequest(format!("formulario inválido: {e}")))?;
        form.into_request()
            .map_err(|e| EngineError::InvalidRequest(format!("dagParamsJson inválido: {e}")))
    } else {
        serde_json::from_slice(body)
            .map_err(|e| EngineError::InvalidRequest(format!("JSON inválido: {e}")))
    }
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Arranca o continúa una ejecución; el avance sigue en segundo plano
async fn execute_dag(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ExecuteDagResponse>, EngineError> {
    let req = parse_execute_body(&headers, &body)?;
    let username = caller(&headers);

    if let Some(uri) = &req.tracking_uri {
        if uri != &state.config.tracking_uri {
            debug!("MLFLOW_TRACKING_URI del llamador ({}) ignorado", uri);
        }
    }

    let started = driver::start(
        &state,
        StartRequest {
            auth_info: auth_info(&headers, &username),
            username,
            dag_id: req.dagid,
            dag_execution_id: req.dag_execution_id,
            dag_params: req.dag_params,
            recovery: req.recovery,
            periodic: None,
        },
    )
    .await?;

    Ok(Json(ExecuteDagResponse {
        status: "running".to_string(),
        dag_execution_id: started.dag_execution_id,
        parent_run_id: started.parent_run_id,
    }))
}

async fn update_dag_execution(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<UpdateDagExecutionRequest>,
) -> Result<Json<UpdateDagExecutionResponse>, EngineError> {
    let username = caller(&headers);
    Ok(Json(
        driver::update_dag_execution(&state, &username, &req).await?,
    ))
}

async fn get_dag_execution(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<DagExecutionView>, EngineError> {
    Ok(Json(driver::get_dag_execution(&state, &caller(&headers), &id)?))
}

// Guarda (o reemplaza) la definición de un DAG
async fn save_dag(
    State(state): State<AppState>,
    Json(dag): Json<DagDefinition>,
) -> Result<Json<Value>, EngineError> {
    if dag.id.trim().is_empty() {
        return Err(EngineError::InvalidRequest("el DAG necesita un id".into()));
    }
    build_graph(&dag)?;
    state.store.put_dag(&dag)?;
    info!("DAG {} guardado ({} nodos)", dag.id, dag.nodes.len());
    Ok(Json(json!({ "status": "ok", "id": dag.id })))
}

async fn get_dag(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DagDefinition>, EngineError> {
    state
        .store
        .get_dag(&id)?
        .map(Json)
        .ok_or(EngineError::DagNotFound(id))
}

async fn save_periodic_run(
    State(state): State<AppState>,
    Json(config): Json<PeriodicRunConfig>,
) -> Result<Json<Value>, EngineError> {
    if state.store.get_dag(&config.dagid)?.is_none() {
        return Err(EngineError::DagNotFound(config.dagid));
    }
    state.store.put_periodic_run(&config)?;
    info!(
        "ejecución periódica {} guardada ({:?} sobre {})",
        config.id, config.frequency, config.dagid
    );
    Ok(Json(json!({ "status": "ok", "id": config.id })))
}

async fn run_periodic(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PeriodRunResponse>, EngineError> {
    Ok(Json(periodic::period_run(&state, &id).await?))
}
