//! Syslog writer for audit events.

use std::sync::{Mutex, OnceLock};

use syslog::{Facility, Formatter3164};
use tracing::{debug, error};

use super::error::TelemetryError;
use super::events::AuditEvent;

/// Syslog tag for all audit events.
pub const SYSLOG_TAG: &str = "GUESTPORT";

/// Global audit logger instance.
static AUDIT_LOGGER: OnceLock<AuditLogger> = OnceLock::new();

/// Audit logger that writes structured JSON events to syslog.
///
/// Interior mutability (Mutex) allows logging through shared references,
/// which the global `OnceLock` storage and the `Arc` handles passed to the
/// forwarding components both require.
pub struct AuditLogger {
    /// Syslog writer. `None` is the null logger used in tests and when the
    /// embedding runtime runs without syslog.
    writer: Option<Mutex<syslog::Logger<syslog::LoggerBackend, Formatter3164>>>,
}

impl AuditLogger {
    /// Create an audit logger connected to the local syslog daemon.
    pub fn new() -> Result<Self, TelemetryError> {
        let formatter = Formatter3164 {
            facility: Facility::LOG_USER,
            hostname: None,
            process: SYSLOG_TAG.to_string(),
            pid: std::process::id(),
        };

        let writer = syslog::unix(formatter).map_err(|e| {
            TelemetryError::SyslogConnection(format!("Failed to connect to syslog: {e}"))
        })?;

        debug!("Connected to syslog with tag '{}'", SYSLOG_TAG);
        Ok(Self {
            writer: Some(Mutex::new(writer)),
        })
    }

    /// Create a null audit logger that discards all events.
    pub fn new_null() -> Self {
        Self { writer: None }
    }

    /// Log an audit event, serialized as JSON with an ISO8601 timestamp.
    ///
    /// Null loggers discard silently; write failures are logged via
    /// `tracing` and never propagated.
    pub fn log(&self, event: AuditEvent) {
        let Some(ref writer) = self.writer else {
            return;
        };

        let timestamped = event.with_timestamp();
        match serde_json::to_string(&timestamped) {
            Ok(json) => match writer.lock() {
                Ok(mut writer) => {
                    if let Err(e) = writer.info(&json) {
                        error!("Failed to write to syslog: {}", e);
                    }
                }
                Err(e) => {
                    error!("Failed to acquire syslog writer lock: {}", e);
                }
            },
            Err(e) => {
                error!("Failed to serialize audit event: {}", e);
            }
        }
    }
}

/// Initialize the global audit logger with a syslog connection.
///
/// Call once at startup before any component logs. Fails if syslog is
/// unreachable or the logger was already initialized.
pub fn init_logger() -> Result<(), TelemetryError> {
    let logger = AuditLogger::new()?;
    AUDIT_LOGGER
        .set(logger)
        .map_err(|_| TelemetryError::AlreadyInitialized)
}

/// Get the global audit logger.
///
/// Falls back to a null logger when [`init_logger`] was never called, so
/// call sites never need to care whether syslog is wired up.
pub fn audit() -> &'static AuditLogger {
    AUDIT_LOGGER.get_or_init(AuditLogger::new_null)
}
