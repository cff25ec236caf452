use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dag::{DagDefinition, DagRuntimeParams, InputSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
    #[serde(other)]
    Custom,
}

impl Frequency {
    /// Intervalo entre disparos.
    pub fn period(&self) -> Duration {
        match self {
            Frequency::Hourly => Duration::hours(1),
            Frequency::Daily | Frequency::Custom => Duration::days(1),
            Frequency::Weekly => Duration::weeks(1),
            Frequency::Monthly => Duration::days(30),
            Frequency::Yearly => Duration::days(365),
        }
    }

    /// Tiempo máximo que se le da a una ejecución periódica antes de
    /// considerarla abandonada.
    pub fn drop_dead_budget(&self) -> Duration {
        match self {
            Frequency::Hourly => Duration::hours(2),
            Frequency::Daily | Frequency::Weekly | Frequency::Monthly => Duration::days(2),
            Frequency::Yearly => Duration::days(7),
            Frequency::Custom => Duration::hours(24),
        }
    }
}

/// Configuración de una ejecución periódica de un DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodicRunConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub frequency: Frequency,
    pub dagid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_id: Option<String>,
    pub username: String,
    #[serde(default)]
    pub auth_info: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dag_params: Option<DagRuntimeParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fired: Option<DateTime<Utc>>,
}

impl PeriodicRunConfig {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_fired {
            Some(last) => now - last >= self.frequency.period(),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Cómo terminó la ejecución periódica anterior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorOutcome {
    Succeeded,
    Failed,
}

/// Ventana de datos de la próxima ejecución periódica:
/// - tras un éxito, desde el final de la ventana anterior
/// - tras un fallo, se reintenta desde el inicio de la ventana anterior
/// - la primera vez, un periodo hacia atrás
pub fn next_window(
    prior: Option<(TimeWindow, PriorOutcome)>,
    frequency: Frequency,
    now: DateTime<Utc>,
) -> TimeWindow {
    let start = match prior {
        Some((w, PriorOutcome::Succeeded)) => w.end,
        Some((w, PriorOutcome::Failed)) => w.start,
        None => now - frequency.period(),
    };
    TimeWindow { start, end: now }
}

fn tm(t: DateTime<Utc>) -> String {
    format!("tm{}", t.format("%Y%m%d%H%M"))
}

pub fn slice_time_spec(window: &TimeWindow) -> String {
    format!("{}-{}", tm(window.start), tm(window.end))
}

pub fn snap_time_spec(window: &TimeWindow) -> String {
    tm(window.end)
}

/// Inyecta la ventana en cada entrada `infinslice` / `infinsnap` del DAG.
/// Devuelve el DAG nuevo y cuántas entradas se tocaron.
pub fn with_time_window(dag: &DagDefinition, window: &TimeWindow) -> (DagDefinition, usize) {
    let mut out = dag.clone();
    let mut touched = 0;

    for node in out.nodes.iter_mut() {
        for input in node.input.iter_mut() {
            match &mut input.source {
                InputSource::Infinslice { time_spec, .. } => {
                    *time_spec = slice_time_spec(window);
                    touched += 1;
                }
                InputSource::Infinsnap { time_spec, .. } => {
                    *time_spec = snap_time_spec(window);
                    touched += 1;
                }
                _ => {}
            }
        }
    }

    (out, touched)
}
