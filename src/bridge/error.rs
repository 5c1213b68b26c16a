//! Error types for guest bridge operations.

use thiserror::Error;

/// Errors from detecting, installing, or running the guest bridge helper.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// No forwarding tool is present in the guest and none could be obtained.
    /// This is structural: the guest image carries neither helper nor any
    /// known package manager.
    #[error("No forwarding tool available in guest (probed socat, nc; no package manager found)")]
    NoBridgeTool,

    /// A package manager was found but installing the helper did not leave it
    /// usable. Retryable once the helper is installed by other means.
    #[error("Forwarding tool not installed (install via {manager} failed); install socat in the guest and retry")]
    InstallIncomplete {
        /// Binary name of the package manager that was tried.
        manager: String,
    },

    /// The helper launch command ran but the helper never showed up.
    #[error("Failed to launch bridge process after {attempts} attempts: {last}")]
    LaunchFailed {
        /// How many launch attempts were made.
        attempts: u32,
        /// Description of the last failure.
        last: String,
    },

    /// Guest-side setup for the helper failed (e.g. pipe directory creation).
    #[error("Guest setup failed: {0}")]
    Setup(String),

    /// The command execution capability itself failed.
    #[error("Guest command failed: {0}")]
    Exec(String),
}

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;
