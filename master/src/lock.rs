use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use common::LockState;

use crate::error::EngineError;
use crate::store::ExecutionStore;

/// Parámetros del lock por ejecución.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSettings {
    /// Un lock sin renovar durante más de `idle` se considera abandonado.
    pub idle: Duration,
    pub max_wait: Duration,
    pub poll: Duration,
    pub renew_every: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(120),
            max_wait: Duration::from_secs(300),
            poll: Duration::from_secs(30),
            renew_every: Duration::from_secs(30),
        }
    }
}

/// Intenta tomar el lock una sola vez (`no` -> `yes`).
pub fn acquire_lock(
    store: &dyn ExecutionStore,
    username: &str,
    execution_id: &str,
) -> Result<bool, EngineError> {
    Ok(store.set_lock(
        username,
        execution_id,
        Some(LockState::No),
        LockState::Yes,
        Utc::now(),
    )?)
}

/// Suelta el lock (`yes` -> `no`). Devuelve false si no estaba tomado.
pub fn release_lock(
    store: &dyn ExecutionStore,
    username: &str,
    execution_id: &str,
) -> Result<bool, EngineError> {
    Ok(store.set_lock(
        username,
        execution_id,
        Some(LockState::Yes),
        LockState::No,
        Utc::now(),
    )?)
}

fn force_unlock(
    store: &dyn ExecutionStore,
    username: &str,
    execution_id: &str,
) -> Result<bool, EngineError> {
    Ok(store.set_lock(username, execution_id, None, LockState::No, Utc::now())?)
}

/// Toma el lock esperando a que se libere.
///
/// Cada `poll` vuelve a mirar el registro; si el dueño actual lleva más de
/// `idle` sin renovar, se fuerza el desbloqueo y se reintenta. Pasado
/// `max_wait` sin éxito devuelve `LockUnavailable`.
pub async fn acquire_idle_lock(
    store: Arc<dyn ExecutionStore>,
    username: &str,
    execution_id: &str,
    settings: LockSettings,
) -> Result<LockLease, EngineError> {
    let started = Instant::now();

    loop {
        if acquire_lock(store.as_ref(), username, execution_id)? {
            debug!(execution_id, "lock tomado");
            return Ok(LockLease::held(store, username, execution_id, settings));
        }

        let record = store
            .get_execution(username, execution_id)?
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?;

        let idle_for = (Utc::now() - record.update_time)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if idle_for > settings.idle {
            warn!(
                execution_id,
                "lock sin renovar hace {:?}, forzando desbloqueo", idle_for
            );
            force_unlock(store.as_ref(), username, execution_id)?;
            if acquire_lock(store.as_ref(), username, execution_id)? {
                info!(execution_id, "lock recuperado tras desbloqueo forzado");
                return Ok(LockLease::held(store, username, execution_id, settings));
            }
        }

        let waited = started.elapsed();
        if waited >= settings.max_wait {
            warn!(execution_id, "no se pudo tomar el lock tras {:?}", waited);
            return Err(EngineError::LockUnavailable(execution_id.to_string()));
        }

        sleep(settings.poll.min(settings.max_wait - waited)).await;
    }
}

/// Lock tomado sobre una ejecución.
///
/// Se suelta con [`LockLease::release`]; si se descarta sin soltar (error,
/// `?` temprano) se suelta igualmente en `Drop`.
pub struct LockLease {
    store: Arc<dyn ExecutionStore>,
    username: String,
    execution_id: String,
    renew_every: Duration,
    last_renewal: Instant,
    released: bool,
}

impl std::fmt::Debug for LockLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockLease")
            .field("username", &self.username)
            .field("execution_id", &self.execution_id)
            .field("renew_every", &self.renew_every)
            .field("last_renewal", &self.last_renewal)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl LockLease {
    /// Envuelve un lock que ya está en `yes` (por ejemplo, un registro
    /// recién creado con el lock tomado).
    pub fn held(
        store: Arc<dyn ExecutionStore>,
        username: &str,
        execution_id: &str,
        settings: LockSettings,
    ) -> Self {
        Self {
            store,
            username: username.to_string(),
            execution_id: execution_id.to_string(),
            renew_every: settings.renew_every,
            last_renewal: Instant::now(),
            released: false,
        }
    }

    /// Refresca `update_time` si pasó más de `renew_every` desde la última
    /// renovación. Los fallos sólo se registran.
    pub fn renew(&mut self) {
        if self.last_renewal.elapsed() < self.renew_every {
            return;
        }
        match self
            .store
            .touch_lock(&self.username, &self.execution_id, Utc::now())
        {
            Ok(true) => {
                self.last_renewal = Instant::now();
                debug!(execution_id = %self.execution_id, "lock renovado");
            }
            Ok(false) => warn!(
                execution_id = %self.execution_id,
                "no se pudo renovar el lock: ya no está tomado"
            ),
            Err(e) => warn!(execution_id = %self.execution_id, "error renovando lock: {}", e),
        }
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match release_lock(self.store.as_ref(), &self.username, &self.execution_id) {
            Ok(true) => debug!(execution_id = %self.execution_id, "lock liberado"),
            Ok(false) => warn!(
                execution_id = %self.execution_id,
                "el lock ya estaba libre al soltarlo"
            ),
            Err(e) => warn!(execution_id = %self.execution_id, "error liberando lock: {}", e),
        }
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testutil::sample_record;

    fn fast() -> LockSettings {
        LockSettings {
            idle: Duration::from_secs(120),
            max_wait: Duration::from_millis(60),
            poll: Duration::from_millis(10),
            renew_every: Duration::ZERO,
        }
    }

    fn store_with(locked: LockState, idle_secs: i64) -> Arc<dyn ExecutionStore> {
        let store = MemoryStore::new();
        let mut rec = sample_record("alice", "e1");
        rec.locked = locked;
        rec.update_time = Utc::now() - chrono::Duration::seconds(idle_secs);
        store.create_execution(&rec).unwrap();
        Arc::new(store)
    }

    fn locked_state(store: &Arc<dyn ExecutionStore>) -> LockState {
        store.get_execution("alice", "e1").unwrap().unwrap().locked
    }

    #[test]
    fn solo_un_acquire_gana() {
        let store = store_with(LockState::No, 0);
        let first = acquire_lock(store.as_ref(), "alice", "e1").unwrap();
        let second = acquire_lock(store.as_ref(), "alice", "e1").unwrap();
        assert!(first);
        assert!(!second);
        assert_eq!(locked_state(&store), LockState::Yes);
    }

    #[tokio::test]
    async fn lock_ocupado_agota_max_wait() {
        let store = store_with(LockState::Yes, 0);
        let err = acquire_idle_lock(store.clone(), "alice", "e1", fast())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::LockUnavailable(_)));
        assert!(err.is_retryable());
        assert_eq!(locked_state(&store), LockState::Yes);
    }

    #[tokio::test]
    async fn lock_abandonado_se_recupera() {
        let store = store_with(LockState::Yes, 600);
        let lease = acquire_idle_lock(store.clone(), "alice", "e1", fast())
            .await
            .unwrap();
        assert_eq!(locked_state(&store), LockState::Yes);

        lease.release();
        assert_eq!(locked_state(&store), LockState::No);
    }

    #[tokio::test]
    async fn ejecucion_inexistente_es_error() {
        let store: Arc<dyn ExecutionStore> = Arc::new(MemoryStore::new());
        let err = acquire_idle_lock(store, "alice", "nope", fast())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::ExecutionNotFound(_)));
    }

    #[tokio::test]
    async fn drop_libera_el_lock() {
        let store = store_with(LockState::No, 0);
        {
            let _lease = acquire_idle_lock(store.clone(), "alice", "e1", fast())
                .await
                .unwrap();
            assert_eq!(locked_state(&store), LockState::Yes);
        }
        assert_eq!(locked_state(&store), LockState::No);
    }

    #[tokio::test]
    async fn renew_refresca_update_time() {
        let store = store_with(LockState::No, 50);
        let mut lease = acquire_idle_lock(store.clone(), "alice", "e1", fast())
            .await
            .unwrap();
        let before = store.get_execution("alice", "e1").unwrap().unwrap().update_time;

        tokio::time::sleep(Duration::from_millis(5)).await;
        lease.renew();
        let after = store.get_execution("alice", "e1").unwrap().unwrap().update_time;
        assert!(after > before);
    }
}
