use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::engine::MetricsEngine;
use crate::state::{MetricsSnapshot, MotionPhase};

/// Polls the engine so stop detection and warnings run without scrapes,
/// and reports phase changes.
pub struct StatusMonitor {
    engine: Arc<MetricsEngine>,
    check_interval: Duration,
    last_phase: Option<MotionPhase>,
    failures: u64,
}

impl StatusMonitor {
    pub fn new(engine: Arc<MetricsEngine>, check_interval: Duration) -> Self {
        StatusMonitor {
            engine,
            check_interval,
            last_phase: None,
            failures: 0,
        }
    }

    /// Take one snapshot. Returns the status line when the phase changed.
    pub fn poll(&mut self) -> Option<String> {
        match self.engine.get_metrics_snapshot() {
            Ok(snapshot) => self.observe(&snapshot),
            Err(e) => {
                self.failures += 1;
                log::warn!("status snapshot failed ({} so far): {}", self.failures, e);
                None
            }
        }
    }

    fn observe(&mut self, snapshot: &MetricsSnapshot) -> Option<String> {
        if self.last_phase == Some(snapshot.phase) {
            return None;
        }
        self.last_phase = Some(snapshot.phase);
        Some(format_status(snapshot))
    }
}

fn phase_label(phase: MotionPhase) -> &'static str {
    match phase {
        MotionPhase::Idle => "IDLE",
        MotionPhase::Moving => "MOVING",
        MotionPhase::Stopped => "STOPPED",
        MotionPhase::Warning => "WARNING",
    }
}

/// One-line summary for the log
pub fn format_status(snapshot: &MetricsSnapshot) -> String {
    let service = if snapshot.service_enabled { "on" } else { "off" };
    format!(
        "Status: {} | {:.1} rpm | {:.2} mi | {:.1} kcal | service {} | warnings {} | errors {}",
        phase_label(snapshot.phase),
        snapshot.cadence_rpm,
        snapshot.distance_miles,
        snapshot.calories,
        service,
        snapshot.warning_count,
        snapshot.error_count
    )
}

/// Run the monitor until `shutdown` flips to true
pub async fn status_monitor_task(mut monitor: StatusMonitor, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(monitor.check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(line) = monitor.poll() {
                    log::info!("{}", line);
                }
            }
            changed = shutdown.changed() => {
                let stop = changed.is_err() || *shutdown.borrow();
                if stop {
                    break;
                }
            }
        }
    }
    log::debug!("status monitor stopped");
}
