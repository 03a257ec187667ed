use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{BikeError, BikeResult};

/// Meters per mile, used for the `bike_distance` gauge
pub const METERS_PER_MILE: f64 = 1609.34;

/// When a new pulse may turn a disabled service back on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ReenablePolicy {
    /// Any pulse re-enables the service, including after a manual disable
    Always,
    /// Only a disable caused by inactivity (warning timeout) is undone by a pulse
    InactivityOnly,
}

/// All tunables of the monitor. Times are seconds, lengths are meters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BikeConfig {
    pub wheel_circumference_m: f64,
    pub calories_per_meter: f64,
    pub stop_detection_timeout_secs: f64,
    pub max_warning_secs: f64,
    pub warning_cycle_secs: f64,
    pub beep_spacing_secs: f64,
    pub short_beep_secs: f64,
    pub long_beep_secs: f64,
    pub active_interval_secs: f64,
    pub disabled_interval_secs: f64,
    pub join_timeout_secs: f64,
    pub pulse_debounce_secs: f64,
    pub pulse_channel_capacity: usize,
    pub reenable_policy: ReenablePolicy,
    pub metrics_port: u16,
    pub service_port: u16,
    pub logs_port: u16,
    pub status_interval_secs: f64,
    pub log_buffer_lines: usize,
    pub request_timeout_secs: f64,
}

impl Default for BikeConfig {
    fn default() -> Self {
        Self {
            wheel_circumference_m: 2.1,
            calories_per_meter: 0.1,
            stop_detection_timeout_secs: 2.0,
            max_warning_secs: 180.0,
            warning_cycle_secs: 10.0,
            beep_spacing_secs: 0.2,
            short_beep_secs: 0.1,
            long_beep_secs: 1.0,
            active_interval_secs: 1.0,
            disabled_interval_secs: 5.0,
            join_timeout_secs: 2.0,
            pulse_debounce_secs: 0.005,
            pulse_channel_capacity: 256,
            reenable_policy: ReenablePolicy::InactivityOnly,
            metrics_port: 8000,
            service_port: 5000,
            logs_port: 5001,
            status_interval_secs: 1.0,
            log_buffer_lines: 500,
            request_timeout_secs: 5.0,
        }
    }
}

impl BikeConfig {
    /// Load a JSON config file; missing fields keep their defaults.
    pub fn from_json_file(path: &Path) -> BikeResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            BikeError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: BikeConfig = serde_json::from_str(&text).map_err(|e| {
            BikeError::InvalidConfig(format!("cannot parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BikeResult<()> {
        let positive = [
            ("wheel_circumference_m", self.wheel_circumference_m),
            ("stop_detection_timeout_secs", self.stop_detection_timeout_secs),
            ("max_warning_secs", self.max_warning_secs),
            ("warning_cycle_secs", self.warning_cycle_secs),
            ("beep_spacing_secs", self.beep_spacing_secs),
            ("short_beep_secs", self.short_beep_secs),
            ("long_beep_secs", self.long_beep_secs),
            ("active_interval_secs", self.active_interval_secs),
            ("disabled_interval_secs", self.disabled_interval_secs),
            ("join_timeout_secs", self.join_timeout_secs),
            ("request_timeout_secs", self.request_timeout_secs),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(BikeError::InvalidConfig(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }

        let non_negative = [
            ("calories_per_meter", self.calories_per_meter),
            ("pulse_debounce_secs", self.pulse_debounce_secs),
            ("status_interval_secs", self.status_interval_secs),
        ];
        for (name, value) in non_negative {
            if !(value.is_finite() && value >= 0.0) {
                return Err(BikeError::InvalidConfig(format!(
                    "{} must be non-negative, got {}",
                    name, value
                )));
            }
        }

        // Spacing is start to start; the tone must end before the next one
        if self.short_beep_secs >= self.beep_spacing_secs {
            return Err(BikeError::InvalidConfig(format!(
                "short beep ({}s) leaves no gap within beep spacing ({}s)",
                self.short_beep_secs, self.beep_spacing_secs
            )));
        }
        if self.pulse_channel_capacity == 0 {
            return Err(BikeError::InvalidConfig(
                "pulse_channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.log_buffer_lines == 0 {
            return Err(BikeError::InvalidConfig(
                "log_buffer_lines must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn stop_detection_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.stop_detection_timeout_secs)
    }

    pub fn max_warning_time(&self) -> Duration {
        Duration::from_secs_f64(self.max_warning_secs)
    }

    pub fn warning_cycle(&self) -> Duration {
        Duration::from_secs_f64(self.warning_cycle_secs)
    }

    pub fn beep_spacing(&self) -> Duration {
        Duration::from_secs_f64(self.beep_spacing_secs)
    }

    pub fn short_beep(&self) -> Duration {
        Duration::from_secs_f64(self.short_beep_secs)
    }

    pub fn long_beep(&self) -> Duration {
        Duration::from_secs_f64(self.long_beep_secs)
    }

    pub fn active_interval(&self) -> Duration {
        Duration::from_secs_f64(self.active_interval_secs)
    }

    pub fn disabled_interval(&self) -> Duration {
        Duration::from_secs_f64(self.disabled_interval_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.join_timeout_secs)
    }

    pub fn pulse_debounce(&self) -> Duration {
        Duration::from_secs_f64(self.pulse_debounce_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout_secs)
    }

    /// `None` when the periodic status check is switched off
    pub fn status_interval(&self) -> Option<Duration> {
        if self.status_interval_secs > 0.0 {
            Some(Duration::from_secs_f64(self.status_interval_secs))
        } else {
            None
        }
    }

    /// Road speed for a given cadence, km/h
    pub fn speed_kph(&self, cadence_rpm: f64) -> f64 {
        cadence_rpm * self.wheel_circumference_m * 60.0 / 1000.0
    }
}
