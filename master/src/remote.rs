use serde::de::DeserializeOwned;
use thiserror::Error;

/// Errores al hablar con colaboradores remotos (tracking store, backend de
/// jobs). Todos se consideran transitorios: quien llama decide si reintenta.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("error de transporte: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{url} respondió {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("respuesta inesperada de {url}: {message}")]
    Decode { url: String, message: String },

    #[error("operación no soportada: {0}")]
    Unsupported(String),
}

/// Convierte una respuesta no-2xx en `RemoteError::Status`.
pub async fn check(resp: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let url = resp.url().to_string();
    let body = resp.text().await.unwrap_or_default();
    Err(RemoteError::Status {
        url,
        status: status.as_u16(),
        body,
    })
}

pub async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, RemoteError> {
    let resp = check(resp).await?;
    let url = resp.url().to_string();
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| RemoteError::Decode {
        url,
        message: e.to_string(),
    })
}
