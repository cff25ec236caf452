use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use common::{DagDefinition, DagExecutionRecord, LockState, PeriodicRunConfig, StatusMap};

/// Namespace bajo el que se guardan las definiciones de DAG.
pub const DAG_NAMESPACE: &str = "parallelinfo";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store no disponible: {0}")]
    Backend(String),

    #[error("error de serialización: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("error de sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("conflicto: {0}")]
    Conflict(String),

    #[error("error de E/S: {0}")]
    Io(#[from] std::io::Error),
}

/// Estado durable del engine.
///
/// Las ejecuciones se indexan por `(username, dag_execution_id)`. Los
/// cambios de lock son escrituras condicionales; el resto son
/// sobrescrituras simples que sólo se hacen con el lock tomado.
pub trait ExecutionStore: Send + Sync {
    fn put_dag(&self, dag: &DagDefinition) -> Result<(), StoreError>;
    fn get_dag(&self, dag_id: &str) -> Result<Option<DagDefinition>, StoreError>;

    /// Inserta un registro nuevo. Falla con `Conflict` si ya existe.
    fn create_execution(&self, record: &DagExecutionRecord) -> Result<(), StoreError>;
    fn get_execution(
        &self,
        username: &str,
        execution_id: &str,
    ) -> Result<Option<DagExecutionRecord>, StoreError>;

    /// Sobrescribe el DAG y el mapa de estados de una ejecución existente.
    fn put_state(
        &self,
        username: &str,
        execution_id: &str,
        dag_json: &DagDefinition,
        statuses: &StatusMap,
    ) -> Result<(), StoreError>;

    /// Escribe `locked = new` si el valor actual es `expected`
    /// (`None` = incondicional). Devuelve si la escritura se aplicó.
    fn set_lock(
        &self,
        username: &str,
        execution_id: &str,
        expected: Option<LockState>,
        new: LockState,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Refresca `update_time` sólo si el lock sigue tomado.
    fn touch_lock(
        &self,
        username: &str,
        execution_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Ejecución más reciente (por `start_time`) lanzada por una ejecución periódica.
    fn latest_for_periodic(
        &self,
        periodic_run_id: &str,
    ) -> Result<Option<DagExecutionRecord>, StoreError>;

    fn put_periodic_run(&self, config: &PeriodicRunConfig) -> Result<(), StoreError>;
    fn get_periodic_run(&self, id: &str) -> Result<Option<PeriodicRunConfig>, StoreError>;
    fn list_periodic_runs(&self) -> Result<Vec<PeriodicRunConfig>, StoreError>;
}

/* =========================
   En memoria
   ========================= */

#[derive(Default)]
struct MemoryInner {
    dags: HashMap<String, DagDefinition>,
    executions: HashMap<(String, String), DagExecutionRecord>,
    periodic: HashMap<String, PeriodicRunConfig>,
}

/// Store en memoria; se pierde al reiniciar el proceso.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("mutex envenenado".into()))
    }
}

fn key(username: &str, execution_id: &str) -> (String, String) {
    (username.to_string(), execution_id.to_string())
}

impl ExecutionStore for MemoryStore {
    fn put_dag(&self, dag: &DagDefinition) -> Result<(), StoreError> {
        self.lock()?.dags.insert(dag.id.clone(), dag.clone());
        Ok(())
    }

    fn get_dag(&self, dag_id: &str) -> Result<Option<DagDefinition>, StoreError> {
        Ok(self.lock()?.dags.get(dag_id).cloned())
    }

    fn create_execution(&self, record: &DagExecutionRecord) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let k = key(&record.username, &record.dag_execution_id);
        if inner.executions.contains_key(&k) {
            return Err(StoreError::Conflict(format!(
                "la ejecución {} ya existe",
                record.dag_execution_id
            )));
        }
        inner.executions.insert(k, record.clone());
        Ok(())
    }

    fn get_execution(
        &self,
        username: &str,
        execution_id: &str,
    ) -> Result<Option<DagExecutionRecord>, StoreError> {
        Ok(self
            .lock()?
            .executions
            .get(&key(username, execution_id))
            .cloned())
    }

    fn put_state(
        &self,
        username: &str,
        execution_id: &str,
        dag_json: &DagDefinition,
        statuses: &StatusMap,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let rec = inner
            .executions
            .get_mut(&key(username, execution_id))
            .ok_or_else(|| StoreError::Conflict(format!("la ejecución {execution_id} no existe")))?;
        rec.dag_json = dag_json.clone();
        rec.node_statuses = statuses.clone();
        Ok(())
    }

    fn set_lock(
        &self,
        username: &str,
        execution_id: &str,
        expected: Option<LockState>,
        new: LockState,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        let Some(rec) = inner.executions.get_mut(&key(username, execution_id)) else {
            return Ok(false);
        };
        if expected.is_some_and(|e| e != rec.locked) {
            return Ok(false);
        }
        rec.locked = new;
        rec.update_time = now;
        Ok(true)
    }

    fn touch_lock(
        &self,
        username: &str,
        execution_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        match inner.executions.get_mut(&key(username, execution_id)) {
            Some(rec) if rec.locked == LockState::Yes => {
                rec.update_time = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn latest_for_periodic(
        &self,
        periodic_run_id: &str,
    ) -> Result<Option<DagExecutionRecord>, StoreError> {
        Ok(self
            .lock()?
            .executions
            .values()
            .filter(|r| r.periodic_run_id.as_deref() == Some(periodic_run_id))
            .max_by_key(|r| r.start_time)
            .cloned())
    }

    fn put_periodic_run(&self, config: &PeriodicRunConfig) -> Result<(), StoreError> {
        self.lock()?.periodic.insert(config.id.clone(), config.clone());
        Ok(())
    }

    fn get_periodic_run(&self, id: &str) -> Result<Option<PeriodicRunConfig>, StoreError> {
        Ok(self.lock()?.periodic.get(id).cloned())
    }

    fn list_periodic_runs(&self) -> Result<Vec<PeriodicRunConfig>, StoreError> {
        let mut out: Vec<_> = self.lock()?.periodic.values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }
}

/* =========================
   SQLite
   ========================= */

/// Store durable sobre SQLite.
///
/// `locked` y `update_time` viven en columnas propias para que las
/// transiciones de lock sean un único `UPDATE ... WHERE locked = ?`. El
/// resto del registro se guarda como JSON en `body`.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("fecha inválida {raw:?}: {e}")))
}

fn parse_lock(raw: &str) -> Result<LockState, StoreError> {
    match raw {
        "yes" => Ok(LockState::Yes),
        "no" => Ok(LockState::No),
        other => Err(StoreError::Backend(format!("valor de lock inválido: {other:?}"))),
    }
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS dags (
                 namespace TEXT NOT NULL,
                 dag_id TEXT NOT NULL,
                 body TEXT NOT NULL,
                 PRIMARY KEY (namespace, dag_id)
             );

             CREATE TABLE IF NOT EXISTS executions (
                 username TEXT NOT NULL,
                 dag_execution_id TEXT NOT NULL,
                 dag_id TEXT NOT NULL,
                 periodic_run_id TEXT,
                 locked TEXT NOT NULL,
                 update_time TEXT NOT NULL,
                 start_time TEXT NOT NULL,
                 body TEXT NOT NULL,
                 PRIMARY KEY (username, dag_execution_id)
             );

             CREATE INDEX IF NOT EXISTS idx_exec_periodic
                 ON executions(periodic_run_id, start_time DESC);

             CREATE TABLE IF NOT EXISTS periodic_runs (
                 id TEXT PRIMARY KEY,
                 body TEXT NOT NULL
             );",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("mutex envenenado".into()))
    }

    fn row_to_record(
        body: String,
        locked: String,
        update_time: String,
    ) -> Result<DagExecutionRecord, StoreError> {
        let mut rec: DagExecutionRecord = serde_json::from_str(&body)?;
        rec.locked = parse_lock(&locked)?;
        rec.update_time = parse_ts(&update_time)?;
        Ok(rec)
    }
}

impl ExecutionStore for SqliteStore {
    fn put_dag(&self, dag: &DagDefinition) -> Result<(), StoreError> {
        let body = serde_json::to_string(dag)?;
        self.conn()?.execute(
            "INSERT INTO dags (namespace, dag_id, body) VALUES (?1, ?2, ?3)
             ON CONFLICT(namespace, dag_id) DO UPDATE SET body = excluded.body",
            params![DAG_NAMESPACE, dag.id, body],
        )?;
        Ok(())
    }

    fn get_dag(&self, dag_id: &str) -> Result<Option<DagDefinition>, StoreError> {
        let body: Option<String> = self
            .conn()?
            .query_row(
                "SELECT body FROM dags WHERE namespace = ?1 AND dag_id = ?2",
                params![DAG_NAMESPACE, dag_id],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| serde_json::from_str(&b))
            .transpose()
            .map_err(StoreError::from)
    }

    fn create_execution(&self, record: &DagExecutionRecord) -> Result<(), StoreError> {
        let body = serde_json::to_string(record)?;
        let inserted = self.conn()?.execute(
            "INSERT OR IGNORE INTO executions
                 (username, dag_execution_id, dag_id, periodic_run_id, locked, update_time, start_time, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.username,
                record.dag_execution_id,
                record.dag_id,
                record.periodic_run_id,
                record.locked.as_str(),
                ts(record.update_time),
                ts(record.start_time),
                body,
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::Conflict(format!(
                "la ejecución {} ya existe",
                record.dag_execution_id
            )));
        }
        Ok(())
    }

    fn get_execution(
        &self,
        username: &str,
        execution_id: &str,
    ) -> Result<Option<DagExecutionRecord>, StoreError> {
        let row: Option<(String, String, String)> = self
            .conn()?
            .query_row(
                "SELECT body, locked, update_time FROM executions
                 WHERE username = ?1 AND dag_execution_id = ?2",
                params![username, execution_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        row.map(|(body, locked, t)| Self::row_to_record(body, locked, t))
            .transpose()
    }

    fn put_state(
        &self,
        username: &str,
        execution_id: &str,
        dag_json: &DagDefinition,
        statuses: &StatusMap,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM executions WHERE username = ?1 AND dag_execution_id = ?2",
                params![username, execution_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(body) = body else {
            return Err(StoreError::Conflict(format!(
                "la ejecución {execution_id} no existe"
            )));
        };

        let mut rec: DagExecutionRecord = serde_json::from_str(&body)?;
        rec.dag_json = dag_json.clone();
        rec.node_statuses = statuses.clone();

        conn.execute(
            "UPDATE executions SET body = ?3 WHERE username = ?1 AND dag_execution_id = ?2",
            params![username, execution_id, serde_json::to_string(&rec)?],
        )?;
        Ok(())
    }

    fn set_lock(
        &self,
        username: &str,
        execution_id: &str,
        expected: Option<LockState>,
        new: LockState,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = match expected {
            Some(expected) => conn.execute(
                "UPDATE executions SET locked = ?3, update_time = ?4
                 WHERE username = ?1 AND dag_execution_id = ?2 AND locked = ?5",
                params![username, execution_id, new.as_str(), ts(now), expected.as_str()],
            )?,
            None => conn.execute(
                "UPDATE executions SET locked = ?3, update_time = ?4
                 WHERE username = ?1 AND dag_execution_id = ?2",
                params![username, execution_id, new.as_str(), ts(now)],
            )?,
        };
        Ok(changed == 1)
    }

    fn touch_lock(
        &self,
        username: &str,
        execution_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let changed = self.conn()?.execute(
            "UPDATE executions SET update_time = ?3
             WHERE username = ?1 AND dag_execution_id = ?2 AND locked = 'yes'",
            params![username, execution_id, ts(now)],
        )?;
        Ok(changed == 1)
    }

    fn latest_for_periodic(
        &self,
        periodic_run_id: &str,
    ) -> Result<Option<DagExecutionRecord>, StoreError> {
        let row: Option<(String, String, String)> = self
            .conn()?
            .query_row(
                "SELECT body, locked, update_time FROM executions
                 WHERE periodic_run_id = ?1
                 ORDER BY start_time DESC
                 LIMIT 1",
                params![periodic_run_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        row.map(|(body, locked, t)| Self::row_to_record(body, locked, t))
            .transpose()
    }

    fn put_periodic_run(&self, config: &PeriodicRunConfig) -> Result<(), StoreError> {
        let body = serde_json::to_string(config)?;
        self.conn()?.execute(
            "INSERT INTO periodic_runs (id, body) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET body = excluded.body",
            params![config.id, body],
        )?;
        Ok(())
    }

    fn get_periodic_run(&self, id: &str) -> Result<Option<PeriodicRunConfig>, StoreError> {
        let body: Option<String> = self
            .conn()?
            .query_row(
                "SELECT body FROM periodic_runs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| serde_json::from_str(&b))
            .transpose()
            .map_err(StoreError::from)
    }

    fn list_periodic_runs(&self) -> Result<Vec<PeriodicRunConfig>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT body FROM periodic_runs ORDER BY id")?;
        let bodies = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(StoreError::from))
            .collect()
    }
}
