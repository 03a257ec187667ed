use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Duration, Instant};

use crate::error::{BikeError, BikeResult};
use crate::state::{lock_state, SharedState};

/// One revolution, timestamped where the sensor reported it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PulseEvent {
    pub seq: u64,
    pub at: Instant,
    /// Cadence implied by the gap to the previous accepted pulse
    pub instant_rpm: Option<f64>,
}

/// Producer side of the pulse channel. Lives in the pulse source context and
/// never waits: a full channel drops the pulse and counts a fault.
pub struct PulseIngestor {
    tx: mpsc::Sender<PulseEvent>,
    debounce: Duration,
    faults: SharedState,
    last_accepted: Option<Instant>,
    seq: u64,
    dropped: u64,
    bounced: u64,
}

impl PulseIngestor {
    pub fn new(tx: mpsc::Sender<PulseEvent>, debounce: Duration, faults: SharedState) -> Self {
        Self {
            tx,
            debounce,
            faults,
            last_accepted: None,
            seq: 0,
            dropped: 0,
            bounced: 0,
        }
    }

    pub fn notify(&mut self) -> BikeResult<Option<PulseEvent>> {
        self.notify_at(Instant::now())
    }

    /// Forward a pulse seen at `at`. `Ok(None)` means it was swallowed as
    /// contact bounce.
    pub fn notify_at(&mut self, at: Instant) -> BikeResult<Option<PulseEvent>> {
        let gap = self.last_accepted.map(|last| at.saturating_duration_since(last));
        if let Some(gap) = gap {
            if gap < self.debounce {
                self.bounced += 1;
                return Ok(None);
            }
        }

        self.seq += 1;
        let event = PulseEvent {
            seq: self.seq,
            at,
            instant_rpm: gap
                .filter(|g| !g.is_zero())
                .map(|g| 60.0 / g.as_secs_f64()),
        };

        match self.tx.try_send(event) {
            Ok(()) => {
                self.last_accepted = Some(at);
                if let Some(rpm) = event.instant_rpm {
                    log::trace!("pulse {} at {:.1} rpm", event.seq, rpm);
                }
                Ok(Some(event))
            }
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                lock_state(&self.faults).record_error();
                if self.dropped % 100 == 1 {
                    log::warn!("pulse channel full, {} pulses dropped", self.dropped);
                }
                Err(BikeError::PulseDropped)
            }
            Err(TrySendError::Closed(_)) => Err(BikeError::ChannelClosed),
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn bounced(&self) -> u64 {
        self.bounced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::BikeState;
    use approx::assert_abs_diff_eq;
    use std::sync::{Arc, Mutex};

    fn shared() -> SharedState {
        Arc::new(Mutex::new(BikeState::new(Instant::now())))
    }

    #[test]
    fn test_instant_cadence_and_ordering() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut ingestor = PulseIngestor::new(tx, Duration::from_millis(5), shared());
        let t0 = Instant::now();

        ingestor.notify_at(t0).unwrap();
        ingestor.notify_at(t0 + Duration::from_millis(750)).unwrap();

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!((first.seq, second.seq), (1, 2));
        assert_eq!(first.instant_rpm, None);
        assert_abs_diff_eq!(second.instant_rpm.unwrap(), 80.0, epsilon = 1e-9);
    }

    #[test]
    fn test_bounce_is_swallowed() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut ingestor = PulseIngestor::new(tx, Duration::from_millis(5), shared());
        let t0 = Instant::now();

        assert!(ingestor.notify_at(t0).unwrap().is_some());
        assert!(ingestor
            .notify_at(t0 + Duration::from_millis(2))
            .unwrap()
            .is_none());
        assert_eq!(ingestor.bounced(), 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_full_channel_drops_and_counts() {
        let (tx, _rx) = mpsc::channel(1);
        let state = shared();
        let mut ingestor = PulseIngestor::new(tx, Duration::ZERO, state.clone());
        let t0 = Instant::now();

        ingestor.notify_at(t0).unwrap();
        let err = ingestor
            .notify_at(t0 + Duration::from_millis(500))
            .unwrap_err();
        assert_eq!(err, BikeError::PulseDropped);
        assert_eq!(ingestor.dropped(), 1);
        assert_eq!(lock_state(&state).error_count, 1);
    }

    #[test]
    fn test_closed_channel_reported() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut ingestor = PulseIngestor::new(tx, Duration::ZERO, shared());
        assert_eq!(ingestor.notify().unwrap_err(), BikeError::ChannelClosed);
    }
}
