//! Audit logging for forwarding lifecycle events.
//!
//! Structured JSON events go to syslog under the `GUESTPORT` tag so the
//! embedding runtime's session logs capture when ports were exposed, when
//! connections crossed the boundary, and how teardown behaved. Debug logging
//! stays on `tracing` and is a completely separate concern.
//!
//! # Event format
//!
//! ```json
//! {"ts":"2026-08-04T10:12:45Z","event":"forward_start","host_port":8080,"guest_port":3000,"transport_port":9000}
//! ```

mod error;
mod events;
mod syslog;

pub use error::TelemetryError;
pub use events::AuditEvent;
pub use syslog::{AuditLogger, SYSLOG_TAG, audit, init_logger};
