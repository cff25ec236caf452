use std::env;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::{
    DagDefinition, DagExecutionView, DagRuntimeParams, ErrorBody, ExecuteDagRequest,
    ExecuteDagResponse, NodeState, PartitionSlice, PeriodRunResponse, PeriodicRunConfig,
    UpdateDagExecutionRequest, UpdateDagExecutionResponse,
};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Cabecera con la que el master identifica al usuario.
const USER_HEADER: &str = "x-parallels-user";

/// - En Docker: MASTER_URL=http://master:8080
/// - Local: default http://localhost:8080
fn master_base_url() -> String {
    env::var("MASTER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

fn current_user() -> Option<String> {
    env::var("PARALLELS_USER").ok().filter(|u| !u.trim().is_empty())
}

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI simple para hablar con el master")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Guarda (o reemplaza) un DAG desde un archivo JSON
    SaveDag {
        #[arg(value_name = "DAG_JSON")]
        path: PathBuf,
    },
    /// Arranca una ejecución nueva o continúa una existente
    Execute {
        #[arg(value_name = "DAG_ID")]
        dagid: String,

        /// Continúa esta ejecución en vez de crear una nueva
        #[arg(long)]
        execution_id: Option<String>,

        /// Reintenta los nodos fallidos de la ejecución
        #[arg(long, requires = "execution_id")]
        recovery: bool,

        /// Overrides por nodo (JSON con la forma {"nodes": {...}})
        #[arg(long, value_name = "PARAMS_JSON")]
        params: Option<PathBuf>,
    },
    /// Consulta el estado de una ejecución
    Status {
        #[arg(value_name = "EXECUTION_ID")]
        id: String,
    },
    /// Reporta las particiones de salida de un nodo terminado
    UpdatePartitions {
        #[arg(value_name = "DAG_ID")]
        dagid: String,

        #[arg(value_name = "EXECUTION_ID")]
        execution_id: String,

        /// Run del nodo que produjo las particiones
        #[arg(long)]
        run_id: String,

        /// Lista JSON de particiones ({bucketname, prefix, time_spec})
        #[arg(value_name = "PARTITIONS_JSON")]
        partitions: PathBuf,
    },
    /// Guarda la configuración de una ejecución periódica
    SavePeriodic {
        #[arg(value_name = "PERIODIC_JSON")]
        path: PathBuf,
    },
    /// Dispara a mano una ejecución periódica
    PeriodRun {
        #[arg(value_name = "PERIODIC_RUN_ID")]
        id: String,
    },
}

/// Respuesta de los endpoints de guardado.
#[derive(Deserialize)]
struct Saved {
    status: String,
    id: String,
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("no se pudo leer {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("JSON inválido en {}", path.display()))
}

fn with_user(req: RequestBuilder) -> RequestBuilder {
    match current_user() {
        Some(user) => req.header(USER_HEADER, user),
        None => req,
    }
}

/// Decodifica la respuesta o convierte el cuerpo de error del master.
async fn expect_ok<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }
    let text = resp.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => bail!("el master respondió {}: {}", status, body.error),
        Err(_) => bail!("el master respondió {}: {}", status, text),
    }
}

fn print_view(view: &DagExecutionView) {
    println!("Ejecución:");
    println!("  id: {}", view.dag_execution_id);
    println!("  dag: {}", view.dag_id);
    println!("  parent_run_id: {}", view.parent_run_id);
    println!("  lock: {:?}", view.locked);
    println!("  iniciada: {}", view.start_time);
    println!("  actualizada: {}", view.update_time);
    if let Some(ref periodic) = view.periodic_run_id {
        println!("  periódica: {}", periodic);
    }
    if let Some(ref w) = view.time_window {
        println!("  ventana: {} .. {}", w.start, w.end);
    }

    let total = view.node_statuses.len();
    let count = |s: NodeState| view.node_statuses.values().filter(|n| n.status == s).count();
    println!(
        "  nodos: total={}, terminados={}, corriendo={}, fallidos={}",
        total,
        count(NodeState::Finished),
        count(NodeState::Running),
        count(NodeState::Failed)
    );
    for (node_id, st) in &view.node_statuses {
        let run = st.run_id.as_deref().unwrap_or("-");
        println!("    {:<24} {:?} run={}", node_id, st.status, run);
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = master_base_url();

    match cli.command {
        Commands::SaveDag { path } => {
            let dag: DagDefinition = read_json(&path)?;
            let url = format!("{}/api/v1/dags", base_url);
            let resp = with_user(client.put(&url)).json(&dag).send().await?;
            let saved: Saved = expect_ok(resp).await?;
            println!("DAG guardado ({}):", saved.status);
            println!("  id: {}", saved.id);
            println!("  nodos: {}", dag.nodes.len());
            println!("  aristas: {}", dag.edges.len());
        }

        Commands::Execute {
            dagid,
            execution_id,
            recovery,
            params,
        } => {
            let dag_params: Option<DagRuntimeParams> =
                params.as_deref().map(read_json).transpose()?;
            let req = ExecuteDagRequest {
                dagid,
                dag_execution_id: execution_id,
                dag_params,
                recovery,
                tracking_uri: None,
            };
            let url = format!("{}/api/v1/execute-dag", base_url);
            let resp = with_user(client.post(&url)).json(&req).send().await?;
            let started: ExecuteDagResponse = expect_ok(resp).await?;
            println!("Ejecución en curso:");
            println!("  id: {}", started.dag_execution_id);
            println!("  parent_run_id: {}", started.parent_run_id);
            println!("  estado: {}", started.status);
        }

        Commands::Status { id } => {
            let url = format!("{}/api/v1/dag-executions/{id}", base_url);
            let resp = with_user(client.get(&url)).send().await?;
            let view: DagExecutionView = expect_ok(resp).await?;
            print_view(&view);
        }

        Commands::UpdatePartitions {
            dagid,
            execution_id,
            run_id,
            partitions,
        } => {
            let partitions: Vec<PartitionSlice> = read_json(&partitions)?;
            let req = UpdateDagExecutionRequest {
                run_id,
                dagid,
                dag_execution_id: execution_id,
                partitions,
            };
            let url = format!("{}/api/v1/update-dag-execution", base_url);
            let resp = with_user(client.post(&url)).json(&req).send().await?;
            let updated: UpdateDagExecutionResponse = expect_ok(resp).await?;
            println!("Particiones aplicadas a {}:", updated.dag_execution_id);
            for node in &updated.nodes {
                println!("  {}", node);
            }
        }

        Commands::SavePeriodic { path } => {
            let config: PeriodicRunConfig = read_json(&path)?;
            let url = format!("{}/api/v1/periodic-runs", base_url);
            let resp = with_user(client.put(&url)).json(&config).send().await?;
            let saved: Saved = expect_ok(resp).await?;
            println!("Ejecución periódica guardada ({}):", saved.status);
            println!("  id: {}", saved.id);
            println!("  dag: {}", config.dagid);
            println!("  frecuencia: {:?}", config.frequency);
        }

        Commands::PeriodRun { id } => {
            let url = format!("{}/api/v1/periodic-runs/{id}/run", base_url);
            let resp = with_user(client.post(&url)).send().await?;
            match expect_ok::<PeriodRunResponse>(resp).await? {
                PeriodRunResponse::Skipped { message } => println!("Saltada: {}", message),
                PeriodRunResponse::Started {
                    dag_execution_id,
                    parent_run_id,
                } => {
                    println!("Ejecución periódica lanzada:");
                    println!("  id: {}", dag_execution_id);
                    println!("  parent_run_id: {}", parent_run_id);
                }
            }
        }
    }

    Ok(())
}
