//! Proxy adapter: request context services.
//!
//! The proxy seam gives the engines a wall clock, the remaining-execution-time
//! countdown every bounded waiter consults, response formatting, and log
//! sinks. Log calls default to the `tracing` macros.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

/// Log severity accepted by the proxy log sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Response envelope handed back to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyResponse {
    pub status_code: u16,
    pub body: String,
    /// Tells the transport to mask the body in any log or trace output
    pub secret: bool,
}

impl ProxyResponse {
    /// Checks for the empty no-change heartbeat body
    pub fn is_empty_body(&self) -> bool {
        self.body.is_empty()
    }
}

/// Request context capability set
pub trait ProxyAdapter: Send + Sync {
    /// Current wall-clock time in ms since the epoch
    fn now_ms(&self) -> u64;

    /// Monotonic countdown until the execution environment kills the handler
    fn remaining_execution_time_ms(&self) -> u64;

    /// Formats a response envelope
    fn format_response(&self, status_code: u16, body: String, secret: bool) -> ProxyResponse {
        ProxyResponse {
            status_code,
            body,
            secret,
        }
    }

    /// Emits a log line at the given level
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => debug!("{}", message),
            LogLevel::Info => info!("{}", message),
            LogLevel::Warn => warn!("{}", message),
            LogLevel::Error => error!("{}", message),
        }
    }
}

/// Proxy backed by the system clock and a fixed time budget
pub struct SystemProxy {
    started: Instant,
    budget: Duration,
}

impl SystemProxy {
    /// Creates a proxy whose countdown starts now with the given budget
    pub fn with_time_budget(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }
}

impl ProxyAdapter for SystemProxy {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn remaining_execution_time_ms(&self) -> u64 {
        self.budget
            .saturating_sub(self.started.elapsed())
            .as_millis() as u64
    }
}
