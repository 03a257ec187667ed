use std::fmt::Write;

use crate::state::MetricsSnapshot;

/// Content type of the text exposition format
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Gauge,
    Counter,
}

impl MetricKind {
    fn as_str(self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

/// One exposition block, value already formatted
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: &'static str,
    pub help: &'static str,
    pub kind: MetricKind,
    pub value: String,
}

impl Metric {
    fn gauge(name: &'static str, help: &'static str, value: String) -> Self {
        Metric {
            name,
            help,
            kind: MetricKind::Gauge,
            value,
        }
    }

    fn counter(name: &'static str, help: &'static str, value: String) -> Self {
        Metric {
            name,
            help,
            kind: MetricKind::Counter,
            value,
        }
    }
}

fn flag(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}

/// Metric list for a snapshot, in exposition order
pub fn metrics(s: &MetricsSnapshot) -> Vec<Metric> {
    let mut out = vec![
        Metric::gauge(
            "bike_distance",
            "Total distance traveled (miles)",
            format!("{:.2}", s.distance_miles),
        ),
        Metric::gauge("bike_rpm", "Current cadence (revolutions per minute)", format!("{:.1}", s.cadence_rpm)),
        Metric::gauge("bike_pedaling", "Pedaling state (0=stopped,1=pedaling)", flag(s.is_moving)),
        Metric::gauge("bike_calories", "Total estimated calories burned", format!("{:.2}", s.calories)),
        Metric::gauge("bike_service_enabled", "Service state (0=off,1=on)", flag(s.service_enabled)),
        Metric::gauge("bike_alarm_state", "Alarm state (0=off,1=on)", flag(s.alarm_active)),
        Metric::gauge("bike_speed", "Current speed (km/h)", format!("{:.2}", s.speed_kph)),
        Metric::gauge("bike_system_uptime", "Seconds since the monitor started", format!("{:.1}", s.uptime_secs)),
        Metric::counter(
            "bike_total_pedaling_time",
            "Seconds spent pedaling",
            format!("{:.1}", s.total_pedaling_secs),
        ),
        Metric::counter(
            "bike_total_idle_time",
            "Seconds spent stopped without a warning",
            format!("{:.1}", s.total_idle_secs),
        ),
        Metric::counter(
            "bike_total_warning_time",
            "Seconds spent with the warning active",
            format!("{:.1}", s.total_warning_secs),
        ),
        Metric::counter("bike_warning_count", "Warning sessions started", s.warning_count.to_string()),
        Metric::counter(
            "bike_service_disable_count",
            "Times the service was disabled",
            s.service_disable_count.to_string(),
        ),
        Metric::gauge("bike_peak_rpm", "Highest cadence seen", format!("{:.1}", s.peak_rpm)),
        Metric::gauge("bike_peak_speed", "Highest speed seen (km/h)", format!("{:.2}", s.peak_speed_kph)),
        Metric::counter("bike_total_pulses", "Pulses received", s.total_pulses.to_string()),
        Metric::counter("bike_error_count", "Recoverable faults", s.error_count.to_string()),
    ];

    if let Some(secs) = s.last_service_disable_secs {
        out.push(Metric::gauge(
            "bike_last_service_disable_seconds",
            "Seconds since the service was last disabled",
            format!("{:.1}", secs),
        ));
    }

    out.push(Metric::gauge(
        "bike_metrics_update_interval",
        "Current metrics recompute interval (seconds)",
        format!("{:.1}", s.update_interval_secs),
    ));
    out
}

/// Render a snapshot as HELP/TYPE/value blocks separated by blank lines
pub fn render(snapshot: &MetricsSnapshot) -> String {
    let mut body = String::new();
    for (i, metric) in metrics(snapshot).iter().enumerate() {
        if i > 0 {
            body.push('\n');
        }
        // writing into a String cannot fail
        let _ = writeln!(body, "# HELP {} {}", metric.name, metric.help);
        let _ = writeln!(body, "# TYPE {} {}", metric.name, metric.kind.as_str());
        let _ = writeln!(body, "{} {}", metric.name, metric.value);
    }
    body
}
