//! Host-side port forwarding: listener, per-connection relays, service.
//!
//! A [`PortForwardService`] owns the whole forwarding lifecycle: it makes
//! sure the guest-side bridge helper is running, binds a host TCP listener,
//! and relays every accepted connection through a freshly dialed guest
//! transport channel. The externally observable [`ForwardingStatus`] state
//! machine is mutated by a single tracker task and read through a watch
//! channel.
//!
//! # Example
//!
//! ```ignore
//! use guestport::bridge::BridgeInstaller;
//! use guestport::config::RetryPolicy;
//! use guestport::forward::{PortForwardConfig, PortForwardService};
//! use guestport::guest::VsockTransport;
//! use std::sync::Arc;
//!
//! let installer = BridgeInstaller::new(runner, RetryPolicy::default());
//! let transport = Arc::new(VsockTransport::new(guest_cid));
//!
//! // host:8080 -> transport:9000 -> guest:3000
//! let mut service = PortForwardService::new(
//!     PortForwardConfig::new(8080, 9000, 3000),
//!     installer,
//!     transport,
//! );
//!
//! service.start().await?;
//! println!("Forwarding: {}", service.status());
//!
//! service.stop().await;
//! ```

mod error;
mod listener;
pub mod relay;
pub mod service;
mod status;

pub use error::{ForwardError, ForwardResult};
pub use relay::{Connection, ConnectionRelay};
pub use service::{PortForwardConfig, PortForwardService};
pub use status::ForwardingStatus;
