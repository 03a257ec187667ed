use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::{Duration, Instant};

use crate::config::{BikeConfig, ReenablePolicy, METERS_PER_MILE};
use crate::error::{BikeError, BikeResult};

/// Monitor state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionPhase {
    /// No pulse seen since start
    Idle,
    /// Pulses arriving faster than the stop-detection timeout
    Moving,
    /// Stopped, no warning running
    Stopped,
    /// Stopped with a warning session beeping
    Warning,
}

/// Why the service flag was cleared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisableReason {
    /// Operator hit the /service endpoint
    Manual,
    /// A warning session ran to its maximum duration
    Inactivity,
}

/// What a single accepted pulse changed
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PulseUpdate {
    /// First pulse after a stop (or the very first pulse)
    pub resumed: bool,
    /// Service flag was turned back on by this pulse
    pub reenabled: bool,
    pub cadence_rpm: f64,
}

/// Authoritative bike state, guarded by the engine's mutex.
///
/// Every method takes `now` explicitly so the engine decides the clock and
/// tests can drive it deterministically.
#[derive(Debug, Clone)]
pub struct BikeState {
    pub started_at: Instant,
    pub last_pulse_time: Option<Instant>,
    pub pulse_count: u64,
    pub total_pulses: u64,
    pub total_distance_m: f64,
    pub cadence_rpm: f64,
    pub is_moving: bool,
    pub calories: f64,
    pub service_enabled: bool,
    pub disable_reason: Option<DisableReason>,
    pub peak_rpm: f64,
    pub peak_speed_kph: f64,
    pub warning_count: u64,
    pub service_disable_count: u64,
    pub error_count: u64,
    pub last_service_disable_time: Option<Instant>,
    /// Id of the live warning session, if any
    pub warning_session: Option<u64>,
    pub total_pedaling: Duration,
    pub total_idle: Duration,
    pub total_warning: Duration,
    pub last_recompute: Option<Instant>,
    pub recompute_count: u64,
    phase_since: Instant,
}

impl BikeState {
    pub fn new(now: Instant) -> Self {
        Self {
            started_at: now,
            last_pulse_time: None,
            pulse_count: 0,
            total_pulses: 0,
            total_distance_m: 0.0,
            cadence_rpm: 0.0,
            is_moving: false,
            calories: 0.0,
            service_enabled: true,
            disable_reason: None,
            peak_rpm: 0.0,
            peak_speed_kph: 0.0,
            warning_count: 0,
            service_disable_count: 0,
            error_count: 0,
            last_service_disable_time: None,
            warning_session: None,
            total_pedaling: Duration::ZERO,
            total_idle: Duration::ZERO,
            total_warning: Duration::ZERO,
            last_recompute: None,
            recompute_count: 0,
            phase_since: now,
        }
    }

    pub fn phase(&self) -> MotionPhase {
        if self.is_moving {
            MotionPhase::Moving
        } else if self.warning_session.is_some() {
            MotionPhase::Warning
        } else if self.last_pulse_time.is_none() {
            MotionPhase::Idle
        } else {
            MotionPhase::Stopped
        }
    }

    /// Fold the time spent in the current phase into its accumulator.
    /// Must run before any field change that alters `phase()`.
    pub fn accumulate(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.phase_since);
        match self.phase() {
            MotionPhase::Moving => self.total_pedaling += elapsed,
            MotionPhase::Warning => self.total_warning += elapsed,
            MotionPhase::Idle | MotionPhase::Stopped => self.total_idle += elapsed,
        }
        if now > self.phase_since {
            self.phase_since = now;
        }
    }

    pub fn record_pulse(&mut self, now: Instant, config: &BikeConfig) -> BikeResult<PulseUpdate> {
        let interval = match self.last_pulse_time {
            Some(last) if now <= last => {
                return Err(BikeError::NonMonotonicPulse(
                    last.duration_since(now).as_secs_f64(),
                ));
            }
            Some(last) => Some(now.duration_since(last)),
            None => None,
        };

        let resumed = !self.is_moving;
        let mut reenabled = false;
        if resumed {
            self.accumulate(now);
            self.is_moving = true;
            self.pulse_count = 0;
            if !self.service_enabled && self.may_reenable(config.reenable_policy) {
                self.service_enabled = true;
                self.disable_reason = None;
                reenabled = true;
            }
        }

        if let Some(dt) = interval {
            let dt = dt.as_secs_f64();
            if dt > 0.0 {
                self.cadence_rpm = 60.0 / dt;
                self.peak_rpm = self.peak_rpm.max(self.cadence_rpm);
                self.peak_speed_kph = self.peak_speed_kph.max(config.speed_kph(self.cadence_rpm));
            }
        }

        self.pulse_count += 1;
        self.total_pulses += 1;
        self.total_distance_m += config.wheel_circumference_m;
        self.calories = self
            .calories
            .max(self.total_distance_m * config.calories_per_meter);
        self.last_pulse_time = Some(now);

        Ok(PulseUpdate {
            resumed,
            reenabled,
            cadence_rpm: self.cadence_rpm,
        })
    }

    fn may_reenable(&self, policy: ReenablePolicy) -> bool {
        match policy {
            ReenablePolicy::Always => true,
            ReenablePolicy::InactivityOnly => {
                self.disable_reason == Some(DisableReason::Inactivity)
            }
        }
    }

    /// Moving → stopped once the pulse gap exceeds `timeout`. Returns true on
    /// the transition, false when nothing changed.
    pub fn detect_stop(&mut self, now: Instant, timeout: Duration) -> bool {
        if !self.is_moving {
            return false;
        }
        let silent = self
            .last_pulse_time
            .map(|last| now.saturating_duration_since(last) > timeout)
            .unwrap_or(false);
        if !silent {
            return false;
        }

        self.accumulate(now);
        self.is_moving = false;
        self.cadence_rpm = 0.0;
        true
    }

    pub fn disable_service(&mut self, now: Instant) {
        self.service_enabled = false;
        self.disable_reason = Some(DisableReason::Manual);
        self.service_disable_count += 1;
        self.last_service_disable_time = Some(now);
    }

    pub fn begin_warning(&mut self, id: u64, now: Instant) {
        self.accumulate(now);
        self.warning_session = Some(id);
        self.warning_count += 1;
    }

    /// Clear session `id` if it is still the live one. A timed-out session
    /// marks the service as disabled by inactivity.
    pub fn end_warning(&mut self, id: u64, now: Instant, timed_out: bool) -> bool {
        if self.warning_session != Some(id) {
            return false;
        }
        self.accumulate(now);
        self.warning_session = None;
        if timed_out && self.service_enabled {
            self.service_enabled = false;
            self.disable_reason = Some(DisableReason::Inactivity);
            self.service_disable_count += 1;
            self.last_service_disable_time = Some(now);
        }
        true
    }

    pub fn record_error(&mut self) {
        self.error_count += 1;
    }

    /// Recompute interval for the current service state
    pub fn update_interval(&self, config: &BikeConfig) -> Duration {
        if self.service_enabled {
            config.active_interval()
        } else {
            config.disabled_interval()
        }
    }

    pub fn recompute_due(&self, now: Instant, config: &BikeConfig) -> bool {
        match self.last_recompute {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.update_interval(config),
        }
    }

    pub fn mark_recomputed(&mut self, now: Instant) {
        self.accumulate(now);
        self.last_recompute = Some(now);
        self.recompute_count += 1;
    }

    pub fn snapshot(&self, now: Instant, config: &BikeConfig) -> MetricsSnapshot {
        MetricsSnapshot {
            phase: self.phase(),
            distance_m: self.total_distance_m,
            distance_miles: self.total_distance_m / METERS_PER_MILE,
            cadence_rpm: self.cadence_rpm,
            speed_kph: config.speed_kph(self.cadence_rpm),
            is_moving: self.is_moving,
            calories: self.calories,
            service_enabled: self.service_enabled,
            alarm_active: self.warning_session.is_some(),
            uptime_secs: now.saturating_duration_since(self.started_at).as_secs_f64(),
            total_pedaling_secs: self.total_pedaling.as_secs_f64(),
            total_idle_secs: self.total_idle.as_secs_f64(),
            total_warning_secs: self.total_warning.as_secs_f64(),
            warning_count: self.warning_count,
            service_disable_count: self.service_disable_count,
            peak_rpm: self.peak_rpm,
            peak_speed_kph: self.peak_speed_kph,
            total_pulses: self.total_pulses,
            error_count: self.error_count,
            last_service_disable_secs: self
                .last_service_disable_time
                .map(|t| now.saturating_duration_since(t).as_secs_f64()),
            update_interval_secs: self.update_interval(config).as_secs_f64(),
            recompute_count: self.recompute_count,
        }
    }
}

/// The single shared state instance
pub type SharedState = Arc<Mutex<BikeState>>;

/// Lock the shared state, recovering from poisoning. A poisoned lock means a
/// panic happened mid-update; the fault is counted and the state kept.
pub fn lock_state(shared: &SharedState) -> MutexGuard<'_, BikeState> {
    match shared.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::error!("{}, recovering", BikeError::StatePoisoned);
            shared.clear_poison();
            let mut guard = poisoned.into_inner();
            guard.record_error();
            guard
        }
    }
}

/// Immutable copy of the derived metrics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub phase: MotionPhase,
    pub distance_m: f64,
    pub distance_miles: f64,
    pub cadence_rpm: f64,
    pub speed_kph: f64,
    pub is_moving: bool,
    pub calories: f64,
    pub service_enabled: bool,
    pub alarm_active: bool,
    pub uptime_secs: f64,
    pub total_pedaling_secs: f64,
    pub total_idle_secs: f64,
    pub total_warning_secs: f64,
    pub warning_count: u64,
    pub service_disable_count: u64,
    pub peak_rpm: f64,
    pub peak_speed_kph: f64,
    pub total_pulses: u64,
    pub error_count: u64,
    pub last_service_disable_secs: Option<f64>,
    pub update_interval_secs: f64,
    pub recompute_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    #[test]
    fn test_cadence_from_constant_interval() {
        let config = BikeConfig::default();
        let t0 = Instant::now();
        let mut state = BikeState::new(t0);

        for i in 0..5 {
            state.record_pulse(t0 + secs(0.5 * i as f64), &config).unwrap();
        }
        assert_abs_diff_eq!(state.cadence_rpm, 120.0, epsilon = 1e-9);
        assert_abs_diff_eq!(state.peak_rpm, 120.0, epsilon = 1e-9);
        assert!(state.is_moving);
    }

    #[test]
    fn test_first_pulse_has_no_cadence() {
        let config = BikeConfig::default();
        let t0 = Instant::now();
        let mut state = BikeState::new(t0);

        let update = state.record_pulse(t0 + secs(1.0), &config).unwrap();
        assert!(update.resumed);
        assert_eq!(update.cadence_rpm, 0.0);
        assert_eq!(state.phase(), MotionPhase::Moving);
    }

    #[test]
    fn test_distance_and_calories_accumulate() {
        let config = BikeConfig::default();
        let t0 = Instant::now();
        let mut state = BikeState::new(t0);

        let mut last_calories = 0.0;
        for i in 1..=40 {
            state.record_pulse(t0 + secs(0.4 * i as f64), &config).unwrap();
            assert!(state.calories >= last_calories);
            last_calories = state.calories;
        }
        assert_abs_diff_eq!(state.total_distance_m, 40.0 * 2.1, epsilon = 1e-9);
        assert_abs_diff_eq!(state.calories, 40.0 * 2.1 / 10.0, epsilon = 1e-9);
        assert_eq!(state.total_pulses, 40);
    }

    #[test]
    fn test_non_monotonic_pulse_rejected() {
        let config = BikeConfig::default();
        let t0 = Instant::now();
        let mut state = BikeState::new(t0);

        state.record_pulse(t0 + secs(1.0), &config).unwrap();
        let err = state.record_pulse(t0 + secs(1.0), &config).unwrap_err();
        assert!(matches!(err, BikeError::NonMonotonicPulse(_)));
        assert_eq!(state.total_pulses, 1);
    }

    #[test]
    fn test_stop_detection_clears_cadence() {
        let config = BikeConfig::default();
        let t0 = Instant::now();
        let mut state = BikeState::new(t0);
        state.record_pulse(t0, &config).unwrap();
        state.record_pulse(t0 + secs(0.3), &config).unwrap();

        assert!(!state.detect_stop(t0 + secs(2.2), config.stop_detection_timeout()));
        assert!(state.detect_stop(t0 + secs(2.4), config.stop_detection_timeout()));
        assert!(!state.is_moving);
        assert_eq!(state.cadence_rpm, 0.0);
        assert_eq!(state.phase(), MotionPhase::Stopped);

        // Already stopped: no second transition
        assert!(!state.detect_stop(t0 + secs(9.0), config.stop_detection_timeout()));
    }

    #[test]
    fn test_idle_never_stops() {
        let t0 = Instant::now();
        let mut state = BikeState::new(t0);
        assert!(!state.detect_stop(t0 + secs(60.0), Duration::from_secs(2)));
        assert_eq!(state.phase(), MotionPhase::Idle);
    }

    #[test]
    fn test_manual_disable_survives_pulse_by_default() {
        let config = BikeConfig::default();
        let t0 = Instant::now();
        let mut state = BikeState::new(t0);
        state.record_pulse(t0, &config).unwrap();
        state.detect_stop(t0 + secs(3.0), config.stop_detection_timeout());
        state.disable_service(t0 + secs(4.0));

        let update = state.record_pulse(t0 + secs(5.0), &config).unwrap();
        assert!(update.resumed);
        assert!(!update.reenabled);
        assert!(!state.service_enabled);
        assert_eq!(state.disable_reason, Some(DisableReason::Manual));
    }

    #[test]
    fn test_always_policy_reenables_after_manual_disable() {
        let config = BikeConfig {
            reenable_policy: ReenablePolicy::Always,
            ..BikeConfig::default()
        };
        let t0 = Instant::now();
        let mut state = BikeState::new(t0);
        state.disable_service(t0);

        let update = state.record_pulse(t0 + secs(1.0), &config).unwrap();
        assert!(update.reenabled);
        assert!(state.service_enabled);
        assert_eq!(state.disable_reason, None);
    }

    #[test]
    fn test_warning_timeout_disables_until_next_pulse() {
        let config = BikeConfig::default();
        let t0 = Instant::now();
        let mut state = BikeState::new(t0);
        state.record_pulse(t0, &config).unwrap();
        state.detect_stop(t0 + secs(3.0), config.stop_detection_timeout());
        state.begin_warning(7, t0 + secs(3.0));
        assert_eq!(state.phase(), MotionPhase::Warning);

        assert!(state.end_warning(7, t0 + secs(183.0), true));
        assert!(!state.service_enabled);
        assert_eq!(state.disable_reason, Some(DisableReason::Inactivity));
        assert_eq!(state.service_disable_count, 1);
        assert_eq!(state.last_service_disable_time, Some(t0 + secs(183.0)));

        let update = state.record_pulse(t0 + secs(200.0), &config).unwrap();
        assert!(update.reenabled);
        assert!(state.service_enabled);
    }

    #[test]
    fn test_stale_session_end_ignored() {
        let t0 = Instant::now();
        let mut state = BikeState::new(t0);
        state.begin_warning(2, t0);
        assert!(!state.end_warning(1, t0 + secs(1.0), true));
        assert_eq!(state.warning_session, Some(2));
        assert!(state.service_enabled);
    }

    #[test]
    fn test_time_in_state_accumulates_per_phase() {
        let config = BikeConfig::default();
        let t0 = Instant::now();
        let mut state = BikeState::new(t0);

        state.record_pulse(t0 + secs(5.0), &config).unwrap(); // 5s idle
        state.record_pulse(t0 + secs(6.0), &config).unwrap();
        state.detect_stop(t0 + secs(9.0), config.stop_detection_timeout()); // 4s pedaling
        state.begin_warning(1, t0 + secs(10.0)); // 1s stopped
        state.end_warning(1, t0 + secs(30.0), false); // 20s warning
        state.mark_recomputed(t0 + secs(32.0)); // 2s stopped

        assert_abs_diff_eq!(state.total_idle.as_secs_f64(), 8.0, epsilon = 1e-6);
        assert_abs_diff_eq!(state.total_pedaling.as_secs_f64(), 4.0, epsilon = 1e-6);
        assert_abs_diff_eq!(state.total_warning.as_secs_f64(), 20.0, epsilon = 1e-6);
    }

    #[test]
    fn test_recompute_interval_follows_service_flag() {
        let config = BikeConfig::default();
        let t0 = Instant::now();
        let mut state = BikeState::new(t0);
        assert!(state.recompute_due(t0, &config));

        state.mark_recomputed(t0);
        assert!(!state.recompute_due(t0 + secs(0.5), &config));
        assert!(state.recompute_due(t0 + secs(1.0), &config));

        state.disable_service(t0);
        assert!(!state.recompute_due(t0 + secs(4.0), &config));
        assert!(state.recompute_due(t0 + secs(5.0), &config));
    }

    #[test]
    fn test_poisoned_lock_recovers_and_counts() {
        let shared: SharedState = Arc::new(Mutex::new(BikeState::new(Instant::now())));
        let clone = shared.clone();
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison");
        })
        .join();

        assert_eq!(lock_state(&shared).error_count, 1);
        // Poison is cleared, so the fault is counted once
        assert_eq!(lock_state(&shared).error_count, 1);
    }

    #[test]
    fn test_snapshot_units() {
        let config = BikeConfig::default();
        let t0 = Instant::now();
        let mut state = BikeState::new(t0);
        for i in 0..1000 {
            state.record_pulse(t0 + secs(0.5 * (i + 1) as f64), &config).unwrap();
        }
        let snap = state.snapshot(t0 + secs(600.0), &config);
        assert_abs_diff_eq!(snap.distance_m, 2100.0, epsilon = 1e-6);
        assert_abs_diff_eq!(snap.distance_miles, 2100.0 / 1609.34, epsilon = 1e-9);
        assert_abs_diff_eq!(snap.uptime_secs, 600.0, epsilon = 1e-6);
        assert_eq!(snap.last_service_disable_secs, None);
        assert_eq!(snap.update_interval_secs, 1.0);
    }
}
