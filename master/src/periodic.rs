use chrono::Utc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use common::{next_window, PeriodRunResponse, PriorOutcome};

use crate::driver::{self, PeriodicLaunch, StartRequest};
use crate::error::EngineError;
use crate::state::AppState;
use crate::tracking::RunStatus;

pub const PREVIOUS_RUN_IN_PROGRESS: &str = "Previous run still in progress";

/// Dispara una ejecución periódica.
///
/// Si la ejecución anterior sigue corriendo no hace nada. Si no, calcula la
/// ventana de datos siguiente y arranca una ejecución nueva del DAG.
pub async fn period_run(
    state: &AppState,
    periodic_run_id: &str,
) -> Result<PeriodRunResponse, EngineError> {
    let config = state
        .store
        .get_periodic_run(periodic_run_id)?
        .ok_or_else(|| EngineError::PeriodicRunNotFound(periodic_run_id.to_string()))?;

    let prior = match state.store.latest_for_periodic(periodic_run_id)? {
        None => None,
        Some(rec) => {
            let parent = state.tracking.get_run(&rec.parent_run_id).await?;
            match parent.status {
                RunStatus::Running | RunStatus::Scheduled => {
                    info!(
                        periodic_run_id,
                        execution_id = %rec.dag_execution_id,
                        "ejecución anterior en curso, se salta este disparo"
                    );
                    return Ok(PeriodRunResponse::Skipped {
                        message: PREVIOUS_RUN_IN_PROGRESS.to_string(),
                    });
                }
                RunStatus::Finished => rec.time_window.map(|w| (w, PriorOutcome::Succeeded)),
                RunStatus::Failed | RunStatus::Killed => {
                    rec.time_window.map(|w| (w, PriorOutcome::Failed))
                }
            }
        }
    };

    let now = Utc::now();
    let window = next_window(prior, config.frequency, now);
    let drop_dead_time = now + config.frequency.drop_dead_budget();
    debug!(
        periodic_run_id,
        start = %window.start,
        end = %window.end,
        "ventana calculada"
    );

    let started = driver::start(
        state,
        StartRequest {
            username: config.username.clone(),
            dag_id: config.dagid.clone(),
            dag_execution_id: None,
            dag_params: config.dag_params.clone(),
            recovery: false,
            auth_info: config.auth_info.clone(),
            periodic: Some(PeriodicLaunch {
                periodic_run_id: config.id.clone(),
                window,
                drop_dead_time,
                experiment_id: config.experiment_id.clone(),
            }),
        },
    )
    .await?;

    info!(
        periodic_run_id,
        execution_id = %started.dag_execution_id,
        "ejecución periódica lanzada"
    );

    Ok(PeriodRunResponse::Started {
        dag_execution_id: started.dag_execution_id,
        parent_run_id: started.parent_run_id,
    })
}

/// Loop en segundo plano que dispara las ejecuciones periódicas vencidas.
pub async fn run_scheduler_loop(state: AppState) {
    loop {
        sleep(state.config.periodic_sweep).await;
        sweep_once(&state).await;
    }
}

/// Una pasada del scheduler. Un disparo fallido no se marca como hecho, así
/// que se reintenta en la pasada siguiente.
pub async fn sweep_once(state: &AppState) {
    let configs = match state.store.list_periodic_runs() {
        Ok(c) => c,
        Err(e) => {
            warn!("error leyendo ejecuciones periódicas: {}", e);
            return;
        }
    };

    let now = Utc::now();
    for mut config in configs.into_iter().filter(|c| c.is_due(now)) {
        match period_run(state, &config.id).await {
            Ok(_) => {
                config.last_fired = Some(now);
                if let Err(e) = state.store.put_periodic_run(&config) {
                    warn!(periodic_run_id = %config.id, "no se pudo guardar last_fired: {}", e);
                }
            }
            Err(e) => warn!(
                periodic_run_id = %config.id,
                retryable = e.is_retryable(),
                "disparo periódico fallido: {}",
                e
            ),
        }
    }
}
