use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Duration;

use bike_monitor::buzzer::{Buzzer, BuzzerKind, LogBuzzer, SysfsBuzzer};
use bike_monitor::config::{BikeConfig, ReenablePolicy};
use bike_monitor::engine::MetricsEngine;
use bike_monitor::log_buffer::init_logging;
use bike_monitor::pulse_source::{self, PulseCommand, PulseSourceKind, RideProfile};
use bike_monitor::restart::RestartState;
use bike_monitor::server::{self, AppState};
use bike_monitor::status_monitor::{status_monitor_task, StatusMonitor};

#[derive(Parser, Debug)]
#[command(name = "bike_monitor")]
#[command(about = "Exercise bike monitor - cadence, distance, calories and an inactivity alarm", long_about = None)]
struct Args {
    /// JSON config file; flags below override its values
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Where pulses come from
    #[arg(long, value_enum, default_value = "simulated")]
    pulse_source: PulseSourceKind,

    /// GPIO chip watched by gpiomon
    #[arg(long, default_value = "gpiochip0")]
    gpio_chip: String,

    /// GPIO line of the reed switch
    #[arg(long, default_value = "17")]
    gpio_line: u32,

    /// Max gpiomon restarts before giving up
    #[arg(long, default_value = "60")]
    max_restarts: u32,

    /// Simulated cadence
    #[arg(long, default_value = "80")]
    sim_rpm: f64,

    /// Simulated ride length in seconds (0 = never stop)
    #[arg(long, default_value = "60")]
    sim_ride_secs: f64,

    /// Simulated rest between rides in seconds
    #[arg(long, default_value = "20")]
    sim_pause_secs: f64,

    /// Buzzer backend
    #[arg(long, value_enum, default_value = "log")]
    buzzer: BuzzerKind,

    /// sysfs file driving the buzzer (GPIO value or PWM enable)
    #[arg(long, default_value = "/sys/class/gpio/gpio18/value")]
    buzzer_path: PathBuf,

    #[arg(long)]
    wheel_circumference: Option<f64>,

    #[arg(long)]
    stop_timeout: Option<f64>,

    #[arg(long)]
    max_warning: Option<f64>,

    #[arg(long, value_enum)]
    reenable_policy: Option<ReenablePolicy>,

    #[arg(long)]
    metrics_port: Option<u16>,

    #[arg(long)]
    service_port: Option<u16>,

    #[arg(long)]
    logs_port: Option<u16>,

    /// Status monitor poll interval in seconds (0 = off)
    #[arg(long)]
    status_interval: Option<f64>,
}

impl Args {
    fn load_config(&self) -> Result<BikeConfig> {
        let mut config = match &self.config {
            Some(path) => BikeConfig::from_json_file(path)?,
            None => BikeConfig::default(),
        };

        if let Some(v) = self.wheel_circumference {
            config.wheel_circumference_m = v;
        }
        if let Some(v) = self.stop_timeout {
            config.stop_detection_timeout_secs = v;
        }
        if let Some(v) = self.max_warning {
            config.max_warning_secs = v;
        }
        if let Some(v) = self.reenable_policy {
            config.reenable_policy = v;
        }
        if let Some(v) = self.metrics_port {
            config.metrics_port = v;
        }
        if let Some(v) = self.service_port {
            config.service_port = v;
        }
        if let Some(v) = self.logs_port {
            config.logs_port = v;
        }
        if let Some(v) = self.status_interval {
            config.status_interval_secs = v;
        }

        config.validate()?;
        Ok(config)
    }

    fn buzzer(&self) -> Result<Arc<dyn Buzzer>> {
        let buzzer: Arc<dyn Buzzer> = match self.buzzer {
            BuzzerKind::Log => Arc::new(LogBuzzer),
            BuzzerKind::Sysfs => {
                Arc::new(SysfsBuzzer::new(&self.buzzer_path).context("opening buzzer")?)
            }
        };
        Ok(buzzer)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.load_config()?;
    let logs = init_logging(config.log_buffer_lines)?;

    log::info!("bike monitor starting");
    log::info!(
        "  wheel {:.2} m, stop after {:.1}s, warning up to {:.0}s, re-enable {:?}",
        config.wheel_circumference_m,
        config.stop_detection_timeout_secs,
        config.max_warning_secs,
        config.reenable_policy
    );

    let engine = Arc::new(MetricsEngine::new(config.clone(), args.buzzer()?));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (ingestor, pulses) = engine.pulse_channel();
    let pulse_loop = tokio::spawn(engine.clone().run_pulse_loop(pulses));

    let mut source = match args.pulse_source {
        PulseSourceKind::Simulated => {
            let profile = RideProfile::new(args.sim_rpm, args.sim_ride_secs, args.sim_pause_secs)?;
            tokio::spawn(pulse_source::simulated_loop(ingestor, profile))
        }
        PulseSourceKind::Gpiomon => {
            let command = PulseCommand::gpiomon(&args.gpio_chip, args.gpio_line);
            let restart = RestartState::new("gpiomon", args.max_restarts, Duration::from_secs(2));
            tokio::spawn(pulse_source::command_loop(ingestor, engine.clone(), command, restart))
        }
    };

    let monitor = config.status_interval().map(|interval| {
        tokio::spawn(status_monitor_task(
            StatusMonitor::new(engine.clone(), interval),
            shutdown_rx.clone(),
        ))
    });

    let state = AppState {
        engine: engine.clone(),
        logs,
    };
    let mut http = tokio::spawn({
        let config = config.clone();
        let shutdown = shutdown_rx.clone();
        async move { server::serve_all(state, &config, shutdown).await }
    });

    // Without pulses the monitor cannot detect motion, so a dead source ends the process
    let (http_result, source_result) = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("ctrl-c received, shutting down");
            (None, Ok(()))
        }
        result = &mut http => (Some(result), Ok(())),
        result = &mut source => {
            let err = match result {
                Ok(Ok(())) => anyhow::anyhow!("pulse source finished unexpectedly"),
                Ok(Err(e)) => anyhow::Error::new(e).context("pulse source failed"),
                Err(e) => anyhow::Error::new(e).context("pulse source task panicked"),
            };
            log::error!("{:#}, shutting down", err);
            (None, Err(err))
        }
    };

    let _ = shutdown_tx.send(true);
    let http_result = match http_result {
        Some(result) => result,
        None => http.await,
    };

    source.abort();
    pulse_loop.abort();
    if let Some(monitor) = monitor {
        let _ = monitor.await;
    }
    engine.shutdown().await;
    log::info!("bike monitor stopped");

    source_result?;
    http_result.context("http task panicked")?
}
