//! Exercise bike monitor: wheel pulses in, metrics, stop detection and an
//! escalating warning buzzer out, with a small HTTP surface for scraping and
//! silencing.

pub mod buzzer;
pub mod config;
pub mod engine;
pub mod error;
pub mod exposition;
pub mod log_buffer;
pub mod pulse;
pub mod pulse_source;
pub mod restart;
pub mod server;
pub mod state;
pub mod status_monitor;
pub mod warning;

pub use buzzer::{BeepKind, Beeper, Buzzer, LogBuzzer, SysfsBuzzer};
pub use config::{BikeConfig, ReenablePolicy};
pub use engine::{DisableReport, MetricsEngine, StopCheck};
pub use error::{BikeError, BikeResult};
pub use state::{BikeState, MetricsSnapshot, MotionPhase};
pub use warning::WarningOutcome;
