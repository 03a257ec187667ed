use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{sleep_until, Duration, Instant};

use crate::engine::MetricsEngine;
use crate::error::{BikeError, BikeResult};
use crate::pulse::PulseIngestor;
use crate::restart::RestartState;

/// A gpiomon run at least this long counts as healthy and resets the backoff
const STABLE_RUN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PulseSourceKind {
    /// Synthetic ride, no hardware needed
    Simulated,
    /// libgpiod `gpiomon` watching the reed switch line
    Gpiomon,
}

/// Synthetic ride: pedal at a fixed cadence for `ride`, rest for `pause`,
/// repeat. Without a ride length it pedals forever.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RideProfile {
    pub rpm: f64,
    pub ride: Option<Duration>,
    pub pause: Duration,
}

impl RideProfile {
    pub fn new(rpm: f64, ride_secs: f64, pause_secs: f64) -> BikeResult<Self> {
        if !(rpm.is_finite() && rpm > 0.0) {
            return Err(BikeError::InvalidConfig(format!(
                "simulated cadence must be positive, got {}",
                rpm
            )));
        }
        if !(ride_secs.is_finite() && ride_secs >= 0.0 && pause_secs.is_finite() && pause_secs >= 0.0)
        {
            return Err(BikeError::InvalidConfig(
                "simulated ride/pause lengths must be non-negative".to_string(),
            ));
        }
        Ok(Self {
            rpm,
            ride: (ride_secs > 0.0).then(|| Duration::from_secs_f64(ride_secs)),
            pause: Duration::from_secs_f64(pause_secs),
        })
    }

    pub fn pulse_interval(&self) -> Duration {
        Duration::from_secs_f64(60.0 / self.rpm)
    }
}

/// Feed pulses following `profile` until the engine side of the channel is gone
pub async fn simulated_loop(mut ingestor: PulseIngestor, profile: RideProfile) -> BikeResult<()> {
    let interval = profile.pulse_interval();
    let mut segment_start = Instant::now();
    let mut next = segment_start;
    let mut rides = 0u64;

    log::info!(
        "simulated pulse source: {:.0} rpm, ride {:?}, pause {:?}",
        profile.rpm,
        profile.ride,
        profile.pause
    );

    loop {
        if let Some(ride) = profile.ride {
            if next >= segment_start + ride {
                rides += 1;
                log::debug!("simulated ride {} done, resting {:?}", rides, profile.pause);
                segment_start = segment_start + ride + profile.pause;
                next = segment_start;
            }
        }

        sleep_until(next).await;
        match ingestor.notify() {
            Ok(_) | Err(BikeError::PulseDropped) => {}
            Err(BikeError::ChannelClosed) => {
                log::info!("simulated pulse source stopping, channel closed");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        next += interval;
    }
}

/// External command that prints one line per pulse
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulseCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl PulseCommand {
    /// `gpiomon --falling-edge <chip> <line>` (libgpiod 1.x syntax)
    pub fn gpiomon(chip: &str, line: u32) -> Self {
        Self {
            program: "gpiomon".to_string(),
            args: vec![
                "--falling-edge".to_string(),
                chip.to_string(),
                line.to_string(),
            ],
        }
    }

    fn describe(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }
}

enum RunEnd {
    ChannelClosed,
    Exited(String),
}

/// Run `command` under supervision: every output line is one pulse, and a
/// child that exits is restarted with backoff until `restart` gives up.
/// A command that cannot be spawned at all on the first try is a startup
/// error and returned at once.
pub async fn command_loop(
    mut ingestor: PulseIngestor,
    engine: Arc<MetricsEngine>,
    command: PulseCommand,
    mut restart: RestartState,
) -> BikeResult<()> {
    let mut child = Some(spawn_child(&command)?);
    loop {
        let started = Instant::now();
        let run = match child.take() {
            Some(running) => Ok(running),
            None => spawn_child(&command),
        };
        let end = match run {
            Ok(running) => drain(running, &mut ingestor, &command).await,
            Err(e) => Err(e),
        };
        let end = match end {
            Ok(RunEnd::ChannelClosed) => {
                log::info!("{} stopping, channel closed", restart.name);
                return Ok(());
            }
            Ok(RunEnd::Exited(status)) => {
                BikeError::PulseSource(format!("{} exited: {}", command.describe(), status))
            }
            Err(e) => e,
        };
        engine.record_fault(&end);

        let now = Instant::now();
        if now.duration_since(started) >= STABLE_RUN {
            restart.record_success(now);
        }
        restart.record_failed_attempt(now);
        if !restart.can_restart() {
            log::error!("{}", restart.status(now));
            return Err(BikeError::PulseSource(format!(
                "{} gave up after {} attempts",
                restart.name, restart.attempts
            )));
        }
        sleep_until(restart.next_retry_time).await;
    }
}

fn spawn_child(command: &PulseCommand) -> BikeResult<Child> {
    let child = Command::new(&command.program)
        .args(&command.args)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| BikeError::PulseSource(format!("cannot spawn {}: {}", command.program, e)))?;
    log::info!("started `{}`", command.describe());
    Ok(child)
}

async fn drain(
    mut child: Child,
    ingestor: &mut PulseIngestor,
    command: &PulseCommand,
) -> BikeResult<RunEnd> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| BikeError::PulseSource("child stdout not captured".to_string()))?;
    let mut lines = BufReader::new(stdout).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(_)) => match ingestor.notify() {
                Ok(_) | Err(BikeError::PulseDropped) => {}
                Err(BikeError::ChannelClosed) => return Ok(RunEnd::ChannelClosed),
                Err(e) => return Err(e),
            },
            Ok(None) => break,
            Err(e) => {
                return Err(BikeError::PulseSource(format!(
                    "reading {} output: {}",
                    command.program, e
                )))
            }
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| BikeError::PulseSource(format!("waiting for {}: {}", command.program, e)))?;
    Ok(RunEnd::Exited(status.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buzzer::testing::RecordingBuzzer;
    use crate::config::BikeConfig;

    fn engine() -> Arc<MetricsEngine> {
        let config = BikeConfig {
            pulse_debounce_secs: 0.0,
            ..BikeConfig::default()
        };
        Arc::new(MetricsEngine::new(config, RecordingBuzzer::new()))
    }

    #[test]
    fn test_ride_profile() {
        let profile = RideProfile::new(120.0, 0.0, 5.0).unwrap();
        assert_eq!(profile.ride, None);
        assert_eq!(profile.pulse_interval(), Duration::from_millis(500));
        assert!(RideProfile::new(0.0, 10.0, 5.0).is_err());
        assert!(RideProfile::new(60.0, -1.0, 5.0).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_ride_then_pause() {
        let engine = engine();
        let (ingestor, mut rx) = engine.pulse_channel();
        let profile = RideProfile::new(60.0, 3.0, 5.0).unwrap();

        // pulses at 0, 1, 2 s then quiet until 8 s
        let run = tokio::time::timeout(Duration::from_millis(7500), simulated_loop(ingestor, profile));
        assert!(run.await.is_err());

        let mut seen = 0;
        while rx.try_recv().is_ok() {
            seen += 1;
        }
        assert_eq!(seen, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_stops_when_channel_closes() {
        let engine = engine();
        let (ingestor, rx) = engine.pulse_channel();
        drop(rx);
        let profile = RideProfile::new(90.0, 0.0, 0.0).unwrap();
        assert!(simulated_loop(ingestor, profile).await.is_ok());
    }

    #[test]
    fn test_gpiomon_command_line() {
        let command = PulseCommand::gpiomon("gpiochip0", 17);
        assert_eq!(command.describe(), "gpiomon --falling-edge gpiochip0 17");
    }

    #[tokio::test]
    async fn test_command_lines_become_pulses_and_exit_is_supervised() {
        let engine = engine();
        let (ingestor, mut rx) = engine.pulse_channel();
        let command = PulseCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "echo edge; echo edge".to_string()],
        };
        let restart = RestartState::new("test source", 1, Duration::from_millis(10));

        let err = command_loop(ingestor, engine.clone(), command, restart)
            .await
            .unwrap_err();
        assert!(matches!(err, BikeError::PulseSource(_)));

        let mut seen = 0;
        while rx.try_recv().is_ok() {
            seen += 1;
        }
        assert_eq!(seen, 2);
        assert_eq!(engine.with_state(|s| s.error_count), 1);
    }

    #[tokio::test]
    async fn test_missing_program_fails_without_retrying() {
        let engine = engine();
        let (ingestor, _rx) = engine.pulse_channel();
        let command = PulseCommand {
            program: "/nonexistent/gpiomon".to_string(),
            args: Vec::new(),
        };
        let restart = RestartState::new("gpiomon", 60, Duration::from_secs(2));

        let started = Instant::now();
        let err = command_loop(ingestor, engine.clone(), command, restart)
            .await
            .unwrap_err();
        assert!(matches!(err, BikeError::PulseSource(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(engine.with_state(|s| s.error_count), 0);
    }

    #[tokio::test]
    async fn test_exited_command_is_restarted() {
        let engine = engine();
        let (ingestor, mut rx) = engine.pulse_channel();
        let command = PulseCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "echo edge".to_string()],
        };
        let restart = RestartState::new("test source", 3, Duration::from_millis(10));

        assert!(command_loop(ingestor, engine.clone(), command, restart)
            .await
            .is_err());
        let mut seen = 0;
        while rx.try_recv().is_ok() {
            seen += 1;
        }
        assert_eq!(seen, 3);
        assert_eq!(engine.with_state(|s| s.error_count), 3);
    }
}
