//! guestport: host-to-guest TCP port forwarding for isolated workloads
//!
//! This crate makes TCP services running inside an isolated guest
//! environment reachable from the host. It listens on a host port, relays
//! every accepted connection through a point-to-point, port-addressed
//! transport into the guest, and keeps a forwarding helper alive inside the
//! guest to complete the last hop to the local service port.
//!
//! # Architecture
//!
//! - **Guest seams**: command execution and transport dialing are narrow
//!   traits supplied by the embedding runtime ([`guest`])
//! - **Bridge**: detects, installs, and supervises the guest-side
//!   forwarding helper ([`bridge`])
//! - **Forwarding**: host listener, per-connection byte relays, and the
//!   observable status state machine ([`forward`])
//! - **Lifecycle**: cascading-timeout teardown that always converges to a
//!   clean stopped state ([`lifecycle`])
//! - **Telemetry**: structured syslog audit events ([`telemetry`])
//!
//! # Failure model
//!
//! Startup failures surface to the caller and into the status machine.
//! Teardown failures are logged and absorbed: stopping always completes,
//! bounded by per-phase and master time budgets, and always leaves the
//! observable state inactive.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod bridge;
pub mod config;
pub mod forward;
pub mod guest;
pub mod lifecycle;
pub mod telemetry;
