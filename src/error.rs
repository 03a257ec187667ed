use thiserror::Error;

/// Bike monitor error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BikeError {
    #[error("Pulse dropped: event channel full")]
    PulseDropped,

    #[error("Pulse channel closed")]
    ChannelClosed,

    #[error("Non-monotonic pulse timestamp ({0:.3}s before previous pulse)")]
    NonMonotonicPulse(f64),

    #[error("Buzzer failed: {0}")]
    Buzzer(String),

    #[error("State lock poisoned")]
    StatePoisoned,

    #[error("Warning task failed: {0}")]
    WarningTask(String),

    #[error("Pulse source failed: {0}")]
    PulseSource(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BikeError {
    /// Faults that are counted and absorbed on the pulse/warning paths.
    ///
    /// Anything else is a startup or wiring problem and propagates to `main`.
    pub fn is_recoverable(&self) -> bool {
        match self {
            BikeError::PulseDropped
            | BikeError::NonMonotonicPulse(_)
            | BikeError::Buzzer(_)
            | BikeError::StatePoisoned
            | BikeError::WarningTask(_) => true,
            BikeError::ChannelClosed
            | BikeError::PulseSource(_)
            | BikeError::InvalidConfig(_)
            | BikeError::Internal(_) => false,
        }
    }
}

/// Result type for core operations
pub type BikeResult<T> = Result<T, BikeError>;
