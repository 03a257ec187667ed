use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

use crate::config::BikeConfig;
use crate::error::{BikeError, BikeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeepKind {
    Short,
    Long,
}

impl fmt::Display for BeepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BeepKind::Short => write!(f, "short"),
            BeepKind::Long => write!(f, "long"),
        }
    }
}

/// Buzzer backend selectable from the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BuzzerKind {
    /// Log tones instead of driving hardware
    Log,
    /// Write `1`/`0` to a sysfs GPIO or PWM file
    Sysfs,
}

/// Audible feedback device. Implementations only switch the tone; timing
/// lives in [`Beeper`].
pub trait Buzzer: Send + Sync {
    fn tone_on(&self, kind: BeepKind) -> BikeResult<()>;
    fn tone_off(&self) -> BikeResult<()>;
    /// Silence and hand the device back. Called once at shutdown.
    fn release(&self);
}

/// Buzzer without hardware: every tone goes to the log
pub struct LogBuzzer;

impl Buzzer for LogBuzzer {
    fn tone_on(&self, kind: BeepKind) -> BikeResult<()> {
        log::info!("beep ({})", kind);
        Ok(())
    }

    fn tone_off(&self) -> BikeResult<()> {
        Ok(())
    }

    fn release(&self) {
        log::debug!("log buzzer released");
    }
}

/// Drives an active buzzer through a sysfs attribute: a GPIO `value` file or
/// a PWM channel's `enable` file. Writes `1` for on and `0` for off.
pub struct SysfsBuzzer {
    path: PathBuf,
}

impl SysfsBuzzer {
    pub fn new(path: impl Into<PathBuf>) -> BikeResult<Self> {
        let path = path.into();
        if !path.exists() {
            return Err(BikeError::Buzzer(format!(
                "{} does not exist (is the GPIO exported?)",
                path.display()
            )));
        }
        let buzzer = SysfsBuzzer { path };
        buzzer.tone_off()?;
        Ok(buzzer)
    }

    fn write(&self, value: &str) -> BikeResult<()> {
        std::fs::write(&self.path, value)
            .map_err(|e| BikeError::Buzzer(format!("{}: {}", self.path.display(), e)))
    }
}

impl Buzzer for SysfsBuzzer {
    fn tone_on(&self, _kind: BeepKind) -> BikeResult<()> {
        self.write("1")
    }

    fn tone_off(&self) -> BikeResult<()> {
        self.write("0")
    }

    fn release(&self) {
        if let Err(e) = self.tone_off() {
            log::warn!("buzzer release failed: {}", e);
        }
    }
}

/// Turns the tone off if a beep is dropped half-way
struct ToneGuard<'a> {
    buzzer: &'a dyn Buzzer,
    armed: bool,
}

impl ToneGuard<'_> {
    fn finish(mut self) -> BikeResult<()> {
        self.armed = false;
        self.buzzer.tone_off()
    }
}

impl Drop for ToneGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.buzzer.tone_off();
        }
    }
}

/// Timed beeps on top of a [`Buzzer`]. Cheap to clone; clones share the
/// device and play one tone at a time.
#[derive(Clone)]
pub struct Beeper {
    buzzer: Arc<dyn Buzzer>,
    short: Duration,
    long: Duration,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl Beeper {
    pub fn new(buzzer: Arc<dyn Buzzer>, config: &BikeConfig) -> Self {
        Self {
            buzzer,
            short: config.short_beep(),
            long: config.long_beep(),
            gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn duration(&self, kind: BeepKind) -> Duration {
        match kind {
            BeepKind::Short => self.short,
            BeepKind::Long => self.long,
        }
    }

    pub async fn beep(&self, kind: BeepKind) -> BikeResult<()> {
        let _turn = self.gate.lock().await;
        self.buzzer.tone_on(kind)?;
        let guard = ToneGuard {
            buzzer: self.buzzer.as_ref(),
            armed: true,
        };
        sleep(self.duration(kind)).await;
        guard.finish()
    }

    pub fn release(&self) {
        self.buzzer.release();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Records every tone with the (tokio) time it started
    #[derive(Default)]
    pub struct RecordingBuzzer {
        tones: Mutex<Vec<(BeepKind, Instant)>>,
        offs: Mutex<Vec<Instant>>,
        failing: AtomicBool,
        released: AtomicBool,
    }

    impl RecordingBuzzer {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn tones(&self) -> Vec<(BeepKind, Instant)> {
            self.tones.lock().unwrap().clone()
        }

        pub fn count(&self, kind: BeepKind) -> usize {
            self.tones().iter().filter(|(k, _)| *k == kind).count()
        }

        pub fn offs(&self) -> usize {
            self.offs.lock().unwrap().len()
        }

        /// Times the tone was switched off
        pub fn off_times(&self) -> Vec<Instant> {
            self.offs.lock().unwrap().clone()
        }

        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        pub fn released(&self) -> bool {
            self.released.load(Ordering::SeqCst)
        }
    }

    impl Buzzer for RecordingBuzzer {
        fn tone_on(&self, kind: BeepKind) -> BikeResult<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(BikeError::Buzzer("simulated fault".to_string()));
            }
            self.tones.lock().unwrap().push((kind, Instant::now()));
            Ok(())
        }

        fn tone_off(&self) -> BikeResult<()> {
            self.offs.lock().unwrap().push(Instant::now());
            Ok(())
        }

        fn release(&self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingBuzzer;
    use super::*;
    use tokio::time::Instant;

    fn assert_close(actual: Duration, expected: Duration) {
        let diff = if actual > expected {
            actual - expected
        } else {
            expected - actual
        };
        assert!(diff < Duration::from_millis(5), "{:?} vs {:?}", actual, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_beep_durations() {
        let buzzer = RecordingBuzzer::new();
        let beeper = Beeper::new(buzzer.clone(), &BikeConfig::default());

        let start = Instant::now();
        beeper.beep(BeepKind::Long).await.unwrap();
        assert_close(start.elapsed(), Duration::from_secs(1));
        beeper.beep(BeepKind::Short).await.unwrap();
        assert_close(start.elapsed(), Duration::from_millis(1100));
        assert_eq!(buzzer.offs(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tones_do_not_overlap() {
        let buzzer = RecordingBuzzer::new();
        let beeper = Beeper::new(buzzer.clone(), &BikeConfig::default());

        let other = beeper.clone();
        let long = tokio::spawn(async move { other.beep(BeepKind::Long).await });
        tokio::task::yield_now().await;
        beeper.beep(BeepKind::Short).await.unwrap();
        long.await.unwrap().unwrap();

        let tones = buzzer.tones();
        assert_eq!(tones.len(), 2);
        assert_eq!(tones[0].0, BeepKind::Long);
        assert_close(tones[1].1 - tones[0].1, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_tone_reports_error() {
        let buzzer = RecordingBuzzer::new();
        buzzer.set_failing(true);
        let beeper = Beeper::new(buzzer.clone(), &BikeConfig::default());

        let err = beeper.beep(BeepKind::Short).await.unwrap_err();
        assert!(matches!(err, BikeError::Buzzer(_)));
        assert!(buzzer.tones().is_empty());
    }

    #[test]
    fn test_sysfs_buzzer_writes_value_file() {
        let path = std::env::temp_dir().join(format!("bike_buzzer_{}", std::process::id()));
        std::fs::write(&path, "1").unwrap();

        let buzzer = SysfsBuzzer::new(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "0");
        buzzer.tone_on(BeepKind::Short).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1");
        buzzer.release();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "0");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_sysfs_buzzer_missing_path() {
        assert!(SysfsBuzzer::new("/nonexistent/gpio18/value").is_err());
    }
}
