//! Capability boundaries into the guest environment.
//!
//! The forwarding subsystem never talks to the guest directly. Everything it
//! needs is expressed as two narrow seams supplied by the embedding runtime:
//!
//! - [`GuestCommandRunner`]: run a shell command inside the guest and collect
//!   its exit code and output. Used only for probing tools, installing the
//!   forwarding helper, launching its restart loop, and signalling it.
//! - [`GuestTransport`]: dial a port-addressed byte-stream channel into the
//!   guest, independent of the guest's own network namespace.
//!
//! Keeping these as traits lets the detection and relay logic be tested with
//! fake implementations and keeps VM lifecycle concerns out of this crate.

pub mod exec;
pub mod transport;

pub use exec::{CommandOutput, GuestCommandRunner};
pub use transport::{GuestStream, GuestTransport, VsockTransport};
