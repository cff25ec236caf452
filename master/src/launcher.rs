use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};

use common::{
    InputSource, InputSpec, JobSpec, JobSubmission, Node, NodeState, NodeStatus, StatusMap,
};

use crate::backend::JobBackend;
use crate::error::EngineError;
use crate::tracking::{RunStatus, TrackingStore};

/// Estados de los nodos lanzados en un lote; se vuelcan al registro aunque
/// el lote falle, para que una invocación posterior pueda reconciliarlos.
pub type LaunchCollector = Arc<Mutex<StatusMap>>;

/// Datos de la ejecución que acompañan a cada lanzamiento.
#[derive(Debug, Clone)]
pub struct LaunchContext {
    pub dag_id: String,
    pub dag_execution_id: String,
    pub parent_run_id: String,
    pub experiment_id: String,
    pub username: String,
    pub auth_info: Value,
    pub periodic_run_id: Option<String>,
    pub drop_dead_time: Option<DateTime<Utc>>,
    pub tracking_uri: String,
    pub callback_base_url: Option<String>,
}

impl LaunchContext {
    fn run_tags(&self, node: &Node) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::from([
            ("mlflow.parentRunId".to_string(), self.parent_run_id.clone()),
            ("parallels.dag_id".to_string(), self.dag_id.clone()),
            ("parallels.dag_execution_id".to_string(), self.dag_execution_id.clone()),
            ("parallels.node_id".to_string(), node.id.clone()),
            ("parallels.original_node_id".to_string(), node.logical_id().to_string()),
            ("parallels.transform".to_string(), node.transform_name.clone()),
            ("mlflow.user".to_string(), self.username.clone()),
        ]);
        if let Some(p) = &self.periodic_run_id {
            tags.insert("parallels.periodic_run_id".to_string(), p.clone());
        }
        tags
    }

    fn job_env(&self, run_id: &str) -> BTreeMap<String, String> {
        let mut env = BTreeMap::from([
            ("MLFLOW_TRACKING_URI".to_string(), self.tracking_uri.clone()),
            ("MLFLOW_RUN_ID".to_string(), run_id.to_string()),
            ("PARALLELS_PARENT_RUN_ID".to_string(), self.parent_run_id.clone()),
            ("PARALLELS_DAG_ID".to_string(), self.dag_id.clone()),
            ("PARALLELS_DAG_EXECUTION_ID".to_string(), self.dag_execution_id.clone()),
            // el callback se identifica con este usuario (cabecera x-parallels-user)
            ("PARALLELS_USER".to_string(), self.username.clone()),
        ]);
        if let Some(base) = &self.callback_base_url {
            env.insert(
                "PARALLELS_CALLBACK_URL".to_string(),
                format!("{}/api/v1/execute-dag", base.trim_end_matches('/')),
            );
        }
        if let Some(t) = self.drop_dead_time {
            env.insert("PARALLELS_DROP_DEAD_TIME".to_string(), t.to_rfc3339());
        }
        env
    }
}

/// Traduce cada entrada `existing_xform` al run del nodo de origen.
///
/// Una entrada con bucket asignado apunta directo al almacenamiento; el
/// resto lee los artefactos del run de origen (con el prefijo asignado, si
/// lo hay).
pub fn resolve_inputs(node: &Node, statuses: &StatusMap) -> Result<Vec<InputSpec>, EngineError> {
    node.input
        .iter()
        .map(|input| {
            let InputSource::ExistingXform {
                source_node_id,
                bucketname,
                prefix,
                time_spec,
            } = &input.source
            else {
                return Ok(input.clone());
            };

            // cada campo de la porción se aplica por separado: con bucket se
            // lee del storage, sin bucket de los artefactos del run de origen
            let source = match bucketname {
                Some(bucketname) => {
                    let prefix = prefix.clone().unwrap_or_default();
                    match time_spec {
                        Some(time_spec) => InputSource::Infinslice {
                            bucketname: bucketname.clone(),
                            prefix,
                            time_spec: time_spec.clone(),
                        },
                        None => InputSource::OtherStorage {
                            bucketname: bucketname.clone(),
                            prefix,
                        },
                    }
                }
                None => {
                    let run_id = statuses
                        .get(source_node_id)
                        .and_then(|s| s.run_id.clone())
                        .ok_or_else(|| EngineError::NodeLaunchFailure {
                            node_id: node.id.clone(),
                            message: format!("el nodo de origen {source_node_id} no tiene run"),
                        })?;
                    InputSource::RunArtifacts {
                        run_id,
                        prefix: prefix.clone(),
                    }
                }
            };

            let mut resolved = input.clone();
            resolved.source = source;
            Ok(resolved)
        })
        .collect()
}

/// Lanza un nodo: crea el run hijo, lo registra como RUNNING, envía el job
/// y guarda el handle que devuelve el backend.
///
/// Si el envío falla después de crear el run, el run se marca FAILED (sin
/// garantía) y el nodo queda RUNNING con su `run_id` en el colector.
pub async fn launch_node(
    ctx: &LaunchContext,
    node: &Node,
    statuses: &StatusMap,
    tracking: &dyn TrackingStore,
    backend: &dyn JobBackend,
    collector: &LaunchCollector,
) -> Result<(), EngineError> {
    let inputs = resolve_inputs(node, statuses)?;

    let run = tracking
        .create_run(&ctx.experiment_id, &ctx.run_tags(node))
        .await
        .map_err(|e| EngineError::NodeLaunchFailure {
            node_id: node.id.clone(),
            message: format!("no se pudo crear el run: {e}"),
        })?;

    {
        let mut launched = collector.lock().map_err(|_| EngineError::NodeLaunchFailure {
            node_id: node.id.clone(),
            message: "colector envenenado".to_string(),
        })?;
        launched.insert(
            node.id.clone(),
            NodeStatus {
                status: NodeState::Running,
                run_id: Some(run.run_id.clone()),
                artifact_uri: run.artifact_uri.clone(),
                lifecycle_stage: run.lifecycle_stage.clone(),
                job_handle: None,
                previous_attempts: statuses
                    .get(&node.id)
                    .map(|s| s.previous_attempts.clone())
                    .unwrap_or_default(),
            },
        );
    }

    let submission = JobSubmission {
        spec: JobSpec {
            dag_execution_id: ctx.dag_execution_id.clone(),
            node_id: node.id.clone(),
            original_node_id: node.logical_id().to_string(),
            run_id: run.run_id.clone(),
            parent_run_id: ctx.parent_run_id.clone(),
            experiment_id: ctx.experiment_id.clone(),
            transform_name: node.transform_name.clone(),
            transform_path: node.transform_path.clone(),
            kwargs: node.kwargs.clone(),
            positional_args: node.positional_args.clone(),
            instance_type: node.instance_type.clone(),
            k8s_params: node.k8s_params.clone(),
            inputs,
            periodic_run_id: ctx.periodic_run_id.clone(),
            drop_dead_time: ctx.drop_dead_time,
        },
        env: ctx.job_env(&run.run_id),
        credentials: ctx.auth_info.clone(),
    };

    match backend.submit_job(&submission).await {
        Ok(handle) => {
            info!(
                node_id = %node.id,
                run_id = %run.run_id,
                job = %handle.0,
                "nodo lanzado"
            );
            let mut launched = collector.lock().map_err(|_| EngineError::NodeLaunchFailure {
                node_id: node.id.clone(),
                message: "colector envenenado".to_string(),
            })?;
            if let Some(st) = launched.get_mut(&node.id) {
                st.job_handle = Some(handle.0);
            }
            Ok(())
        }
        Err(e) => {
            warn!(node_id = %node.id, run_id = %run.run_id, "fallo enviando job: {}", e);
            if let Err(te) = tracking.set_terminated(&run.run_id, RunStatus::Failed).await {
                warn!(run_id = %run.run_id, "no se pudo marcar el run como FAILED: {}", te);
            }
            Err(EngineError::NodeLaunchFailure {
                node_id: node.id.clone(),
                message: e.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeBackend, FakeTracking};
    use common::PartitionSlice;

    fn ctx() -> LaunchContext {
        LaunchContext {
            dag_id: "dag-1".into(),
            dag_execution_id: "dag-1-x".into(),
            parent_run_id: "parent".into(),
            experiment_id: "7".into(),
            username: "alice".into(),
            auth_info: serde_json::json!({"token": "t"}),
            periodic_run_id: Some("p1".into()),
            drop_dead_time: None,
            tracking_uri: "http://mlflow".into(),
            callback_base_url: Some("http://master/".into()),
        }
    }

    fn consumer_of(source: &str) -> Node {
        let mut n: Node = serde_json::from_value(serde_json::json!({"id": "b"})).unwrap();
        n.input = vec![InputSpec::existing_xform(source)];
        n
    }

    fn finished(run: &str) -> NodeStatus {
        NodeStatus {
            status: NodeState::Finished,
            run_id: Some(run.into()),
            ..NodeStatus::pending()
        }
    }

    #[test]
    fn existing_xform_apunta_al_run_de_origen() {
        let statuses = StatusMap::from([("a".to_string(), finished("run-a"))]);
        let inputs = resolve_inputs(&consumer_of("a"), &statuses).unwrap();
        assert_eq!(
            inputs[0].source,
            InputSource::RunArtifacts {
                run_id: "run-a".into(),
                prefix: None
            }
        );
    }

    #[test]
    fn porcion_asignada_va_directo_al_storage() {
        let mut node = consumer_of("a");
        node.input[0].assign_slice(&PartitionSlice {
            bucketname: Some("bkt".into()),
            prefix: Some("out/p0".into()),
            time_spec: None,
        });
        let inputs = resolve_inputs(&node, &StatusMap::new()).unwrap();
        assert_eq!(
            inputs[0].source,
            InputSource::OtherStorage {
                bucketname: "bkt".into(),
                prefix: "out/p0".into()
            }
        );
    }

    #[test]
    fn porcion_solo_con_bucket_conserva_el_bucket() {
        let mut node = consumer_of("a");
        node.input[0].assign_slice(&PartitionSlice {
            bucketname: Some("bkt".into()),
            prefix: None,
            time_spec: Some("tm202401010000-tm202401020000".into()),
        });
        let inputs = resolve_inputs(&node, &StatusMap::new()).unwrap();
        assert_eq!(
            inputs[0].source,
            InputSource::Infinslice {
                bucketname: "bkt".into(),
                prefix: String::new(),
                time_spec: "tm202401010000-tm202401020000".into()
            }
        );
    }

    #[test]
    fn porcion_solo_con_prefijo_lee_artefactos_del_run() {
        let mut node = consumer_of("a");
        node.input[0].assign_slice(&PartitionSlice {
            bucketname: None,
            prefix: Some("out/p1".into()),
            time_spec: None,
        });
        let statuses = StatusMap::from([("a".to_string(), finished("run-a"))]);
        let inputs = resolve_inputs(&node, &statuses).unwrap();
        assert_eq!(
            inputs[0].source,
            InputSource::RunArtifacts {
                run_id: "run-a".into(),
                prefix: Some("out/p1".into())
            }
        );
    }

    #[test]
    fn origen_sin_run_no_se_puede_lanzar() {
        let err = resolve_inputs(&consumer_of("a"), &StatusMap::new()).unwrap_err();
        assert!(matches!(err, EngineError::NodeLaunchFailure { .. }));
    }

    #[tokio::test]
    async fn lanzamiento_registra_running_y_envia_job() {
        let tracking = FakeTracking::default();
        let backend = FakeBackend::default();
        let collector = LaunchCollector::default();
        let statuses = StatusMap::from([("a".to_string(), finished("run-a"))]);

        launch_node(&ctx(), &consumer_of("a"), &statuses, &tracking, &backend, &collector)
            .await
            .unwrap();

        let launched = collector.lock().unwrap();
        let st = &launched["b"];
        assert_eq!(st.status, NodeState::Running);
        let run_id = st.run_id.clone().unwrap();
        assert_eq!(st.job_handle, Some(format!("fake-job-{run_id}")));

        let subs = backend.submissions();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].spec.run_id, run_id);
        assert_eq!(subs[0].spec.periodic_run_id.as_deref(), Some("p1"));
        assert_eq!(subs[0].credentials["token"], "t");
        assert_eq!(
            subs[0].env["PARALLELS_CALLBACK_URL"],
            "http://master/api/v1/execute-dag"
        );
        assert_eq!(subs[0].env["PARALLELS_USER"], "alice");

        let tags = tracking.tags_of(&run_id);
        assert_eq!(tags["mlflow.parentRunId"], "parent");
        assert_eq!(tags["parallels.node_id"], "b");
    }

    #[tokio::test]
    async fn fallo_de_envio_deja_running_y_marca_run_failed() {
        let tracking = FakeTracking::default();
        let backend = FakeBackend::default();
        backend.fail_node("b");
        let collector = LaunchCollector::default();
        let statuses = StatusMap::from([("a".to_string(), finished("run-a"))]);

        let err = launch_node(&ctx(), &consumer_of("a"), &statuses, &tracking, &backend, &collector)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NodeLaunchFailure { ref node_id, .. } if node_id == "b"));

        let launched = collector.lock().unwrap();
        let st = &launched["b"];
        assert_eq!(st.status, NodeState::Running);
        let run_id = st.run_id.clone().unwrap();
        assert_eq!(st.job_handle, None);
        assert_eq!(tracking.status_of(&run_id), Some(RunStatus::Failed));
    }
}
