use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use common::{ErrorBody, GraphError};

use crate::remote::RemoteError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no se pudo obtener el lock de la ejecución {0}")]
    LockUnavailable(String),

    #[error("DAG no encontrado: {0}")]
    DagNotFound(String),

    #[error("ejecución no encontrada: {0}")]
    ExecutionNotFound(String),

    #[error("grafo inválido: {0}")]
    Graph(#[from] GraphError),

    #[error("fallo al lanzar {node_id}: {message}")]
    NodeLaunchFailure { node_id: String, message: String },

    #[error("el nodo {node_id} falló (run {run_id:?})")]
    UpstreamNodeFailed {
        node_id: String,
        run_id: Option<String>,
    },

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("petición inválida: {0}")]
    InvalidRequest(String),

    #[error("ejecución periódica no encontrada: {0}")]
    PeriodicRunNotFound(String),
}

impl EngineError {
    /// Errores tras los cuales una nueva invocación puede tener éxito sin
    /// cambiar la petición.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::LockUnavailable(_)
                | EngineError::NodeLaunchFailure { .. }
                | EngineError::Remote(_)
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            EngineError::DagNotFound(_)
            | EngineError::ExecutionNotFound(_)
            | EngineError::PeriodicRunNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Graph(_)
            | EngineError::InvalidRequest(_)
            | EngineError::UpstreamNodeFailed { .. } => StatusCode::BAD_REQUEST,
            EngineError::LockUnavailable(_) => StatusCode::CONFLICT,
            EngineError::Remote(_) | EngineError::NodeLaunchFailure { .. } => StatusCode::BAD_GATEWAY,
            EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            status: "error".to_string(),
            error: self.to_string(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}
