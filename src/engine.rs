use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::buzzer::{BeepKind, Beeper, Buzzer};
use crate::config::BikeConfig;
use crate::error::{BikeError, BikeResult};
use crate::pulse::{PulseEvent, PulseIngestor};
use crate::state::{lock_state, BikeState, MetricsSnapshot, PulseUpdate, SharedState};
use crate::warning::WarningScheduler;

/// Result of a stop-detection check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCheck {
    Unchanged,
    Stopped { warning_started: bool },
}

/// Result of a `/service` disable request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisableReport {
    pub disable_count: u64,
    /// A running warning was cancelled by this request
    pub silenced: bool,
}

/// Owns the bike state, the stop-detection state machine and the warning
/// scheduler. Shared as `Arc<MetricsEngine>` between the pulse loop, the
/// HTTP handlers and the status monitor.
pub struct MetricsEngine {
    config: BikeConfig,
    state: SharedState,
    warnings: WarningScheduler,
    beeper: Beeper,
}

impl MetricsEngine {
    pub fn new(config: BikeConfig, buzzer: Arc<dyn Buzzer>) -> Self {
        let beeper = Beeper::new(buzzer, &config);
        let warnings = WarningScheduler::new(&config, beeper.clone());
        Self {
            state: Arc::new(Mutex::new(BikeState::new(Instant::now()))),
            config,
            warnings,
            beeper,
        }
    }

    pub fn config(&self) -> &BikeConfig {
        &self.config
    }

    /// Read access to the raw state, for diagnostics and tests
    pub fn with_state<R>(&self, f: impl FnOnce(&BikeState) -> R) -> R {
        f(&lock_state(&self.state))
    }

    /// Bounded pulse channel feeding [`MetricsEngine::run_pulse_loop`]
    pub fn pulse_channel(&self) -> (PulseIngestor, mpsc::Receiver<PulseEvent>) {
        let (tx, rx) = mpsc::channel(self.config.pulse_channel_capacity);
        let ingestor = PulseIngestor::new(tx, self.config.pulse_debounce(), self.state.clone());
        (ingestor, rx)
    }

    /// Consume pulses in arrival order until every sender is gone
    pub async fn run_pulse_loop(self: Arc<Self>, mut rx: mpsc::Receiver<PulseEvent>) {
        while let Some(event) = rx.recv().await {
            if let Err(e) = self.on_pulse_at(event.at) {
                log::debug!("pulse {} rejected: {}", event.seq, e);
            }
        }
        log::info!("pulse channel closed, pulse loop exiting");
    }

    pub fn on_pulse(&self) -> BikeResult<PulseUpdate> {
        self.on_pulse_at(Instant::now())
    }

    /// Apply one pulse. Recoverable faults are counted before being returned,
    /// callers only need the error for logging.
    pub fn on_pulse_at(&self, at: Instant) -> BikeResult<PulseUpdate> {
        let (update, cancelled) = {
            let mut state = lock_state(&self.state);
            let update = match state.record_pulse(at, &self.config) {
                Ok(update) => update,
                Err(e) => {
                    state.record_error();
                    return Err(e);
                }
            };
            let cancelled = if update.resumed {
                self.warnings.request_stop(&mut state, at)
            } else {
                None
            };
            (update, cancelled)
        };

        if let Some(running) = cancelled {
            let limit = self.config.join_timeout();
            tokio::spawn(running.join(limit));
        }

        if update.resumed {
            log::info!("pedaling started");
            if update.reenabled {
                log::info!("service re-enabled by pedal activity");
            }
            self.spawn_beep(BeepKind::Short);
        } else {
            log::trace!("pulse: {:.1} rpm", update.cadence_rpm);
        }
        Ok(update)
    }

    pub fn check_pedaling_status(&self) -> StopCheck {
        self.check_pedaling_status_at(Instant::now())
    }

    pub fn check_pedaling_status_at(&self, now: Instant) -> StopCheck {
        let mut state = lock_state(&self.state);
        self.check_locked(&mut state, now)
    }

    fn check_locked(&self, state: &mut BikeState, now: Instant) -> StopCheck {
        if !state.detect_stop(now, self.config.stop_detection_timeout()) {
            return StopCheck::Unchanged;
        }

        log::info!(
            "stopped pedaling: {:.2} m, {:.1} kcal",
            state.total_distance_m,
            state.calories
        );
        // Queued ahead of the warning so the long tone plays first
        self.spawn_beep(BeepKind::Long);
        let warning_started = self.warnings.start(&self.state, state, now);
        StopCheck::Stopped { warning_started }
    }

    /// Start a warning session now. No-op (false) while one is running or
    /// the service is disabled.
    pub fn start_stop_warning(&self) -> bool {
        let mut state = lock_state(&self.state);
        self.warnings.start(&self.state, &mut state, Instant::now())
    }

    pub fn warning_active(&self) -> bool {
        self.warnings.is_active()
    }

    /// Turn the service off and silence any running warning
    pub async fn disable_service(&self) -> DisableReport {
        let now = Instant::now();
        let (disable_count, running) = {
            let mut state = lock_state(&self.state);
            state.disable_service(now);
            (
                state.service_disable_count,
                self.warnings.request_stop(&mut state, now),
            )
        };

        let silenced = running.is_some();
        if let Some(running) = running {
            running.join(self.config.join_timeout()).await;
        }
        log::info!(
            "service disabled (disable #{}{})",
            disable_count,
            if silenced { ", warning silenced" } else { "" }
        );
        DisableReport {
            disable_count,
            silenced,
        }
    }

    pub fn get_metrics_snapshot(&self) -> BikeResult<MetricsSnapshot> {
        self.get_metrics_snapshot_at(Instant::now())
    }

    /// Snapshot with a throttled recompute: the stop check and time-in-state
    /// accumulation run at most once per update interval.
    pub fn get_metrics_snapshot_at(&self, now: Instant) -> BikeResult<MetricsSnapshot> {
        let snapshot = {
            let mut state = lock_state(&self.state);
            if state.recompute_due(now, &self.config) {
                self.check_locked(&mut state, now);
                state.mark_recomputed(now);
            }
            state.snapshot(now, &self.config)
        };
        ensure_finite(&snapshot)?;
        Ok(snapshot)
    }

    /// Count a recoverable fault raised outside the engine
    pub fn record_fault(&self, err: &BikeError) {
        log::warn!("fault: {}", err);
        lock_state(&self.state).record_error();
    }

    /// Stop any warning and release the buzzer
    pub async fn shutdown(&self) {
        if let Some(outcome) = self
            .warnings
            .stop_and_join(&self.state, self.config.join_timeout())
            .await
        {
            log::info!("warning session stopped for shutdown ({:?})", outcome);
        }
        self.beeper.release();
    }

    fn spawn_beep(&self, kind: BeepKind) {
        let beeper = self.beeper.clone();
        let shared = self.state.clone();
        tokio::spawn(async move {
            if let Err(e) = beeper.beep(kind).await {
                log::warn!("{} beep failed: {}", kind, e);
                lock_state(&shared).record_error();
            }
        });
    }
}

fn ensure_finite(snapshot: &MetricsSnapshot) -> BikeResult<()> {
    let values = [
        ("distance", snapshot.distance_m),
        ("cadence", snapshot.cadence_rpm),
        ("calories", snapshot.calories),
        ("peak_rpm", snapshot.peak_rpm),
        ("peak_speed", snapshot.peak_speed_kph),
    ];
    for (name, value) in values {
        if !value.is_finite() {
            return Err(BikeError::Internal(format!("{} is not finite", name)));
        }
    }
    Ok(())
}
