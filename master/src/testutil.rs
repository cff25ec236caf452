//! Dobles en memoria del tracking store y del backend de jobs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use common::{
    DagDefinition, DagExecutionRecord, InputSpec, JobSubmission, LockState, Node, NodeStatus,
};

use crate::backend::{JobBackend, JobHandle, PodPhase};
use crate::config::Config;
use crate::lock::LockSettings;
use crate::remote::RemoteError;
use crate::state::AppState;
use crate::store::{ExecutionStore, MemoryStore};
use crate::tracking::{RunInfo, RunStatus, TrackingStore};

#[derive(Default)]
pub struct FakeTracking {
    next: AtomicUsize,
    runs: Mutex<HashMap<String, (RunInfo, BTreeMap<String, String>)>>,
    experiments: Mutex<HashMap<String, String>>,
    artifacts: Mutex<Vec<(String, String, Vec<u8>)>>,
}

impl FakeTracking {
    pub fn status_of(&self, run_id: &str) -> Option<RunStatus> {
        self.runs.lock().unwrap().get(run_id).map(|(r, _)| r.status)
    }

    pub fn tags_of(&self, run_id: &str) -> BTreeMap<String, String> {
        self.runs.lock().unwrap()[run_id].1.clone()
    }

    /// Simula que el job del run terminó.
    pub fn finish(&self, run_id: &str, status: RunStatus) {
        if let Some((r, _)) = self.runs.lock().unwrap().get_mut(run_id) {
            r.status = status;
        }
    }

    pub fn artifacts(&self) -> Vec<(String, String, Vec<u8>)> {
        self.artifacts.lock().unwrap().clone()
    }

    pub fn run_count(&self) -> usize {
        self.runs.lock().unwrap().len()
    }
}

#[async_trait]
impl TrackingStore for FakeTracking {
    async fn create_experiment(&self, name: &str) -> Result<String, RemoteError> {
        let mut exps = self.experiments.lock().unwrap();
        let next_id = (exps.len() + 1).to_string();
        Ok(exps.entry(name.to_string()).or_insert(next_id).clone())
    }

    async fn create_run(
        &self,
        _experiment_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<RunInfo, RemoteError> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        let info = RunInfo {
            run_id: format!("run-{n}"),
            status: RunStatus::Running,
            artifact_uri: Some(format!("mlflow-artifacts:/1/run-{n}/artifacts")),
            lifecycle_stage: Some("active".into()),
        };
        self.runs
            .lock()
            .unwrap()
            .insert(info.run_id.clone(), (info.clone(), tags.clone()));
        Ok(info)
    }

    async fn get_run(&self, run_id: &str) -> Result<RunInfo, RemoteError> {
        self.runs
            .lock()
            .unwrap()
            .get(run_id)
            .map(|(r, _)| r.clone())
            .ok_or_else(|| RemoteError::Status {
                url: format!("fake://runs/{run_id}"),
                status: 404,
                body: "RESOURCE_DOES_NOT_EXIST".into(),
            })
    }

    async fn update_run_status(&self, run_id: &str, status: RunStatus) -> Result<(), RemoteError> {
        self.finish(run_id, status);
        Ok(())
    }

    async fn log_artifact(
        &self,
        run_id: &str,
        artifact_path: &str,
        contents: Vec<u8>,
    ) -> Result<(), RemoteError> {
        self.artifacts
            .lock()
            .unwrap()
            .push((run_id.to_string(), artifact_path.to_string(), contents));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeBackend {
    submissions: Mutex<Vec<JobSubmission>>,
    failing: Mutex<HashSet<String>>,
    phases: Mutex<HashMap<String, PodPhase>>,
    delay: Mutex<Option<Duration>>,
}

impl FakeBackend {
    pub fn submissions(&self) -> Vec<JobSubmission> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn fail_node(&self, node_id: &str) {
        self.failing.lock().unwrap().insert(node_id.to_string());
    }

    pub fn set_phase(&self, run_id: &str, phase: PodPhase) {
        self.phases
            .lock()
            .unwrap()
            .insert(Self::handle_for(run_id).0, phase);
    }

    /// Handle que este backend asigna a un run; distinto de `for_run` para
    /// que el driver tenga que usar el que quedó guardado.
    pub fn handle_for(run_id: &str) -> JobHandle {
        JobHandle(format!("fake-job-{run_id}"))
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl JobBackend for FakeBackend {
    async fn submit_job(&self, submission: &JobSubmission) -> Result<JobHandle, RemoteError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        if self.failing.lock().unwrap().contains(&submission.spec.node_id) {
            return Err(RemoteError::Status {
                url: "fake://jobs".into(),
                status: 500,
                body: "quota exceeded".into(),
            });
        }
        self.submissions.lock().unwrap().push(submission.clone());
        Ok(Self::handle_for(&submission.spec.run_id))
    }

    async fn get_job_pod_status(&self, handle: &JobHandle) -> Result<PodPhase, RemoteError> {
        Ok(self
            .phases
            .lock()
            .unwrap()
            .get(&handle.0)
            .copied()
            .unwrap_or(PodPhase::Running))
    }
}

/* --------- fixtures --------- */

fn node(id: &str, sources: &[&str]) -> Node {
    let mut n: Node = serde_json::from_value(json!({
        "id": id,
        "transform_name": format!("xform-{id}"),
        "transform_path": format!("transforms/{id}.py"),
    }))
    .unwrap();
    n.input = sources.iter().map(|s| InputSpec::existing_xform(*s)).collect();
    n
}

/// `a -> b -> c`
pub fn sample_dag() -> DagDefinition {
    DagDefinition {
        id: "dag-1".into(),
        name: "sample".into(),
        nodes: vec![node("a", &[]), node("b", &["a"]), node("c", &["b"])],
        edges: vec![
            common::Edge::new("a", "b"),
            common::Edge::new("b", "c"),
        ],
        experiment_id: Some("7".into()),
    }
}

pub fn sample_record(username: &str, execution_id: &str) -> DagExecutionRecord {
    let dag = sample_dag();
    let now = Utc::now();
    DagExecutionRecord {
        dag_id: dag.id.clone(),
        dag_execution_id: execution_id.to_string(),
        username: username.to_string(),
        parent_run_id: "parent-run".into(),
        experiment_id: "7".into(),
        auth_info: json!({}),
        node_statuses: dag
            .nodes
            .iter()
            .map(|n| (n.id.clone(), NodeStatus::pending()))
            .collect(),
        dag_json: dag,
        locked: LockState::Yes,
        update_time: now,
        start_time: now,
        periodic_run_id: None,
        time_window: None,
        drop_dead_time: None,
    }
}

pub struct TestEnv {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub tracking: Arc<FakeTracking>,
    pub backend: Arc<FakeBackend>,
}

/// Estado con store en memoria, fakes remotos y tiempos de lock cortos.
pub fn test_env() -> TestEnv {
    let store = Arc::new(MemoryStore::new());
    let tracking = Arc::new(FakeTracking::default());
    let backend = Arc::new(FakeBackend::default());

    let config = Config {
        lock: LockSettings {
            idle: Duration::from_secs(120),
            max_wait: Duration::from_millis(50),
            poll: Duration::from_millis(10),
            renew_every: Duration::from_millis(10),
        },
        launch_timeout: Duration::from_secs(5),
        ..Config::default()
    };

    let state = AppState::new(
        config,
        store.clone() as Arc<dyn ExecutionStore>,
        tracking.clone() as Arc<dyn TrackingStore>,
        backend.clone() as Arc<dyn JobBackend>,
    );

    TestEnv {
        state,
        store,
        tracking,
        backend,
    }
}
