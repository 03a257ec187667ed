use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use log::{Log, Metadata, Record};

use crate::error::{BikeError, BikeResult};

/// Bounded in-memory copy of recent log lines, served by `/logs`
#[derive(Clone, Debug)]
pub struct LogBuffer {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        LogBuffer {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Append a line, evicting the oldest once full
    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn lines(&self) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().cloned().collect()
    }

    /// All lines, oldest first, newline-terminated
    pub fn dump(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = String::new();
        for line in lines.iter() {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    pub fn len(&self) -> usize {
        self.lines.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `env_logger` front end that also keeps each record in a [`LogBuffer`]
pub struct BufferedLogger {
    inner: env_logger::Logger,
    buffer: LogBuffer,
}

impl BufferedLogger {
    pub fn new(inner: env_logger::Logger, buffer: LogBuffer) -> Self {
        Self { inner, buffer }
    }
}

pub fn format_line(record: &Record) -> String {
    format!(
        "{} {:<5} {}: {}",
        chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
        record.level(),
        record.target(),
        record.args()
    )
}

impl Log for BufferedLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if !self.inner.matches(record) {
            return;
        }
        self.buffer.push(format_line(record));
        self.inner.log(record);
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

/// Install the global logger (`RUST_LOG`, default `info`) and return the
/// buffer backing `/logs`.
pub fn init_logging(capacity: usize) -> BikeResult<LogBuffer> {
    let inner =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).build();
    let max_level = inner.filter();
    let buffer = LogBuffer::new(capacity);

    let logger: &'static BufferedLogger =
        Box::leak(Box::new(BufferedLogger::new(inner, buffer.clone())));
    log::set_logger(logger)
        .map_err(|e| BikeError::Internal(format!("logger already installed: {}", e)))?;
    log::set_max_level(max_level);
    Ok(buffer)
}
