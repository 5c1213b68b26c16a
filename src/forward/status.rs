//! Externally observable forwarding status.

use std::fmt;

/// State of the port forwarding service, observed by callers through
/// polling or a watch subscription.
///
/// Transitions per lifecycle: `Inactive → Starting → Active(n) | Error`,
/// `Active(n) → Active(n±1)` as connections open and close, and any state
/// back to `Inactive` on stop. Only the service's tracker task mutates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardingStatus {
    /// Forwarding is not running.
    Inactive,
    /// Bridge install and listener startup are in progress.
    Starting,
    /// Forwarding is up, with the given number of live relayed connections.
    Active {
        /// Connections whose relay legs have not both exited yet.
        connections: u32,
    },
    /// Startup failed; the message is a human-readable summary.
    Error {
        /// What went wrong.
        message: String,
    },
}

impl ForwardingStatus {
    /// Whether the service is inactive.
    pub fn is_inactive(&self) -> bool {
        matches!(self, ForwardingStatus::Inactive)
    }

    /// Whether forwarding is up.
    pub fn is_active(&self) -> bool {
        matches!(self, ForwardingStatus::Active { .. })
    }

    /// Live connection count, if active.
    pub fn connections(&self) -> Option<u32> {
        match self {
            ForwardingStatus::Active { connections } => Some(*connections),
            _ => None,
        }
    }
}

impl fmt::Display for ForwardingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardingStatus::Inactive => write!(f, "inactive"),
            ForwardingStatus::Starting => write!(f, "starting"),
            ForwardingStatus::Active { connections } => {
                write!(f, "active ({connections} connections)")
            }
            ForwardingStatus::Error { message } => write!(f, "error: {message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        assert!(ForwardingStatus::Inactive.is_inactive());
        assert!(!ForwardingStatus::Starting.is_inactive());
        assert!(ForwardingStatus::Active { connections: 0 }.is_active());
        assert!(
            !ForwardingStatus::Error {
                message: "x".into()
            }
            .is_active()
        );
    }

    #[test]
    fn test_connections_accessor() {
        assert_eq!(
            ForwardingStatus::Active { connections: 3 }.connections(),
            Some(3)
        );
        assert_eq!(ForwardingStatus::Starting.connections(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(ForwardingStatus::Inactive.to_string(), "inactive");
        assert_eq!(
            ForwardingStatus::Active { connections: 2 }.to_string(),
            "active (2 connections)"
        );
        assert_eq!(
            ForwardingStatus::Error {
                message: "no bridge".into()
            }
            .to_string(),
            "error: no bridge"
        );
    }
}
