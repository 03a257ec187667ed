use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Duration, Instant};

use crate::buzzer::{BeepKind, Beeper};
use crate::config::BikeConfig;
use crate::error::BikeError;
use crate::state::{lock_state, BikeState, SharedState};

/// Why a warning session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningOutcome {
    MotionResumed,
    ServiceDisabled,
    TimedOut,
    Cancelled,
    Fault,
}

#[derive(Debug, Clone, Copy)]
struct WarningTimings {
    max: Duration,
    cycle: Duration,
    spacing: Duration,
}

/// One escalating warning run
#[derive(Debug, Clone, Copy)]
pub struct WarningSession {
    pub id: u64,
    pub start_time: Instant,
    /// Short beeps in the current cycle, starts at 1
    pub beep_count: u32,
}

/// Handle to a spawned session task
pub struct RunningWarning {
    session_id: u64,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<WarningOutcome>,
}

impl RunningWarning {
    pub fn id(&self) -> u64 {
        self.session_id
    }

    /// Wait for the task to exit, at most `limit`. A timeout is logged and
    /// the task is left to stop on its next check.
    pub async fn join(self, limit: Duration) -> Option<WarningOutcome> {
        let RunningWarning {
            session_id,
            cancel,
            handle,
        } = self;
        let result = timeout(limit, handle).await;
        drop(cancel);

        match result {
            Ok(Ok(outcome)) => {
                log::debug!("warning session {} joined ({:?})", session_id, outcome);
                Some(outcome)
            }
            Ok(Err(e)) => {
                let err = BikeError::WarningTask(e.to_string());
                log::error!("warning session {}: {}", session_id, err);
                None
            }
            Err(_) => {
                log::warn!(
                    "warning session {} did not stop within {:.1}s",
                    session_id,
                    limit.as_secs_f64()
                );
                None
            }
        }
    }
}

/// Owns the (at most one) background warning task
pub struct WarningScheduler {
    timings: WarningTimings,
    beeper: Beeper,
    slot: Mutex<Option<RunningWarning>>,
    next_id: AtomicU64,
}

impl WarningScheduler {
    pub fn new(config: &BikeConfig, beeper: Beeper) -> Self {
        Self {
            timings: WarningTimings {
                max: config.max_warning_time(),
                cycle: config.warning_cycle(),
                spacing: config.beep_spacing(),
            },
            beeper,
            slot: Mutex::new(None),
            next_id: AtomicU64::new(0),
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<RunningWarning>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn a session unless one is live or the service is off.
    ///
    /// The caller holds the state lock (`state` is the guarded value of
    /// `shared`). Returns true if a session was started.
    pub fn start(&self, shared: &SharedState, state: &mut BikeState, now: Instant) -> bool {
        if !state.service_enabled || state.is_moving || state.warning_session.is_some() {
            return false;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        state.begin_warning(id, now);

        let session = WarningSession {
            id,
            start_time: now,
            beep_count: 1,
        };
        let (cancel, cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(run_session(
            session,
            shared.clone(),
            self.beeper.clone(),
            self.timings,
            cancel_rx,
        ));

        *self.lock_slot() = Some(RunningWarning {
            session_id: id,
            cancel,
            handle,
        });
        log::info!("warning session {} started", id);
        true
    }

    /// Signal the live session to stop and clear it from `state` (caller
    /// holds the state lock). The returned handle can be joined after the
    /// lock is released. `None` when no session was still running.
    pub fn request_stop(&self, state: &mut BikeState, now: Instant) -> Option<RunningWarning> {
        let running = self.lock_slot().take()?;
        let _ = running.cancel.send(true);
        let live = state.end_warning(running.session_id, now, false);
        if !live || running.handle.is_finished() {
            return None;
        }
        Some(running)
    }

    /// Cancel and wait up to `limit` for the task to exit
    pub async fn stop_and_join(&self, shared: &SharedState, limit: Duration) -> Option<WarningOutcome> {
        let running = self.request_stop(&mut lock_state(shared), Instant::now())?;
        running.join(limit).await
    }

    pub fn is_active(&self) -> bool {
        self.lock_slot()
            .as_ref()
            .map(|running| !running.handle.is_finished())
            .unwrap_or(false)
    }
}

async fn run_session(
    mut session: WarningSession,
    shared: SharedState,
    beeper: Beeper,
    timings: WarningTimings,
    mut cancel: watch::Receiver<bool>,
) -> WarningOutcome {
    let outcome = escalate(&mut session, &shared, &beeper, timings, &mut cancel).await;

    let now = Instant::now();
    {
        let mut state = lock_state(&shared);
        if outcome == WarningOutcome::Fault {
            state.record_error();
        }
        state.end_warning(session.id, now, outcome == WarningOutcome::TimedOut);
    }
    log::info!(
        "warning session {} ended after {:.1}s ({:?}, last cycle {} beeps)",
        session.id,
        now.saturating_duration_since(session.start_time).as_secs_f64(),
        outcome,
        session.beep_count
    );
    outcome
}

async fn escalate(
    session: &mut WarningSession,
    shared: &SharedState,
    beeper: &Beeper,
    timings: WarningTimings,
    cancel: &mut watch::Receiver<bool>,
) -> WarningOutcome {
    let deadline = session.start_time + timings.max;
    let mut cycle_start = session.start_time;

    loop {
        if Instant::now() >= deadline {
            return WarningOutcome::TimedOut;
        }

        for step in 1..=session.beep_count {
            // Re-checked before every beep, not once per cycle
            let cancelled = *cancel.borrow();
            if let Some(outcome) = check(session.id, shared, cancelled) {
                return outcome;
            }
            // The beep may queue behind another tone; cancellation must not wait for it
            let beeped = tokio::select! {
                result = beeper.beep(BeepKind::Short) => Some(result),
                _ = cancel.changed() => None,
            };
            match beeped {
                Some(Ok(())) => {}
                Some(Err(e)) => {
                    log::warn!("warning session {} beep failed: {}", session.id, e);
                    return WarningOutcome::Fault;
                }
                None => {
                    return check(session.id, shared, true).unwrap_or(WarningOutcome::Cancelled)
                }
            }
            let slot_end = cycle_start + timings.spacing * step;
            if let Some(outcome) = wait_until(slot_end, deadline, session.id, shared, cancel).await {
                return outcome;
            }
        }

        cycle_start += timings.cycle;
        if let Some(outcome) = wait_until(cycle_start, deadline, session.id, shared, cancel).await {
            return outcome;
        }
        session.beep_count += 1;
    }
}

/// Sleep until `target` (never past `deadline`), waking early on cancellation
async fn wait_until(
    target: Instant,
    deadline: Instant,
    id: u64,
    shared: &SharedState,
    cancel: &mut watch::Receiver<bool>,
) -> Option<WarningOutcome> {
    let target = target.min(deadline);
    let mut sender_gone = false;
    let already_cancelled = *cancel.borrow();
    if !already_cancelled {
        tokio::select! {
            _ = sleep_until(target) => {}
            changed = cancel.changed() => sender_gone = changed.is_err(),
        }
    }
    let cancelled = sender_gone || *cancel.borrow();

    if let Some(outcome) = check(id, shared, cancelled) {
        return Some(outcome);
    }
    if Instant::now() >= deadline {
        return Some(WarningOutcome::TimedOut);
    }
    None
}

fn check(id: u64, shared: &SharedState, cancelled: bool) -> Option<WarningOutcome> {
    let state = lock_state(shared);
    if state.is_moving {
        Some(WarningOutcome::MotionResumed)
    } else if !state.service_enabled {
        Some(WarningOutcome::ServiceDisabled)
    } else if cancelled || state.warning_session != Some(id) {
        Some(WarningOutcome::Cancelled)
    } else {
        None
    }
}
