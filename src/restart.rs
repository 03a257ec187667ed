use tokio::time::{Duration, Instant};

/// Longest wait between two restarts of a pulse source
pub const MAX_COOLDOWN: Duration = Duration::from_secs(30);

/// Restart bookkeeping for one supervised pulse source
#[derive(Clone, Debug)]
pub struct RestartState {
    pub name: String,
    pub next_retry_time: Instant,
    pub attempts: u32,
    pub max_attempts: u32,
    pub base_cooldown: Duration,
    pub current_cooldown: Duration,
}

impl RestartState {
    pub fn new(name: &str, max_attempts: u32, base_cooldown: Duration) -> Self {
        RestartState {
            name: name.to_string(),
            next_retry_time: Instant::now(),
            attempts: 0,
            max_attempts,
            base_cooldown,
            current_cooldown: base_cooldown,
        }
    }

    /// Check if the cooldown since the last failure has passed
    pub fn can_retry(&self, now: Instant) -> bool {
        now >= self.next_retry_time
    }

    /// Record a failed run and schedule the next retry.
    /// The first failure waits the base cooldown, each further one 1.5x longer.
    pub fn record_failed_attempt(&mut self, now: Instant) {
        if self.attempts > 0 {
            self.current_cooldown = Duration::from_secs_f64(
                (self.current_cooldown.as_secs_f64() * 1.5).min(MAX_COOLDOWN.as_secs_f64()),
            );
        }
        self.attempts += 1;
        self.next_retry_time = now + self.current_cooldown;

        log::warn!(
            "{} failed (attempt {}/{}), next retry in {:.1}s",
            self.name,
            self.attempts,
            self.max_attempts,
            self.current_cooldown.as_secs_f64()
        );
    }

    /// A run that stayed up long enough resets the backoff
    pub fn record_success(&mut self, now: Instant) {
        if self.attempts > 0 {
            log::info!(
                "{} running again after {} failed attempt(s)",
                self.name,
                self.attempts
            );
        }
        self.attempts = 0;
        self.current_cooldown = self.base_cooldown;
        self.next_retry_time = now;
    }

    pub fn can_restart(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn status(&self, now: Instant) -> String {
        if self.attempts == 0 {
            return format!("{}: OK", self.name);
        }
        if !self.can_restart() {
            return format!("{}: MAX_ATTEMPTS_EXCEEDED", self.name);
        }
        if !self.can_retry(now) {
            let wait = self.next_retry_time.saturating_duration_since(now);
            return format!(
                "{}: RESTART_PENDING (waiting {:.1}s, attempt {}/{})",
                self.name,
                wait.as_secs_f64(),
                self.attempts,
                self.max_attempts
            );
        }
        format!(
            "{}: READY_TO_RESTART (attempt {}/{})",
            self.name, self.attempts, self.max_attempts
        )
    }
}
