//! Error types for the forwarding service.

use crate::bridge::BridgeError;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors from starting or running port forwarding.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// The guest-side bridge could not be made available.
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// Could not bind the host-side TCP listener.
    #[error("Failed to listen on host port {port}: {source}")]
    ListenFailed {
        /// The host port we tried to bind.
        port: u16,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The host listener did not signal readiness in time.
    #[error("Host listener not ready within {timeout:?}")]
    ReadyTimeout {
        /// How long we waited.
        timeout: Duration,
    },

    /// The host listener task ended before signalling readiness.
    #[error("Host listener terminated before becoming ready")]
    ListenerAborted,

    /// Dialing the guest transport failed for a connection.
    #[error("Failed to dial guest on transport port {port}: {source}")]
    DialFailed {
        /// The transport port that was dialed.
        port: u32,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },
}

/// Result type for forwarding operations.
pub type ForwardResult<T> = Result<T, ForwardError>;
