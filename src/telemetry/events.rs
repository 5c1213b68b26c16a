//! Audit event types for forwarding lifecycle logging.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Audit events emitted by the forwarding subsystem.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Port forwarding became active.
    ForwardStart {
        /// Host TCP port being listened on.
        host_port: u16,
        /// Guest-local TCP port being forwarded to.
        guest_port: u16,
        /// Transport port carrying the relayed connections.
        transport_port: u32,
    },

    /// Port forwarding was stopped.
    ForwardStop {
        /// Host TCP port that was listened on.
        host_port: u16,
    },

    /// A host connection was accepted and relayed into the guest.
    ConnectionOpen {
        /// Connection id.
        id: Uuid,
        /// Host TCP port the connection arrived on.
        host_port: u16,
    },

    /// A relayed connection ended (either side closed or errored).
    ConnectionClose {
        /// Connection id.
        id: Uuid,
    },

    /// A forwarding tool install was attempted inside the guest.
    BridgeInstall {
        /// Package manager binary used.
        manager: String,
        /// Whether the tool was usable afterwards.
        success: bool,
    },

    /// The guest-side forwarding helper was launched.
    BridgeLaunch {
        /// Helper binary.
        tool: String,
        /// Transport port the helper listens on.
        transport_port: u32,
    },

    /// The guest-side forwarding helper was signalled to stop.
    BridgeStop {
        /// Helper binary.
        tool: String,
    },

    /// A teardown phase exceeded its time budget and was abandoned.
    ShutdownTimeout {
        /// Which phase timed out (`forwarder`, `channel`, `context`, `master`).
        phase: String,
    },
}

/// Wrapper adding an ISO8601 timestamp for serialization.
#[derive(Debug, Serialize)]
pub struct TimestampedEvent<'a> {
    /// ISO8601 timestamp.
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    /// The event payload, flattened into the same object.
    #[serde(flatten)]
    pub event: &'a AuditEvent,
}

impl AuditEvent {
    /// Wrap this event with a timestamp for serialization.
    pub fn with_timestamp(&self) -> TimestampedEvent<'_> {
        TimestampedEvent {
            timestamp: Utc::now(),
            event: self,
        }
    }
}
