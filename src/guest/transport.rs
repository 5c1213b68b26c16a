//! Port-addressed byte-stream transport into the guest.

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// A byte-stream handle to a guest-side endpoint.
///
/// Blanket-implemented for anything that can be read and written
/// asynchronously, so tests can substitute in-memory duplex streams.
pub trait GuestStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> GuestStream for T {}

/// Dials point-to-point channels into the guest by port number.
///
/// One dial per relayed connection. The transport is addressed by a single
/// unsigned 32-bit port; how that maps onto the hypervisor's channel
/// mechanism is the implementation's business.
#[async_trait]
pub trait GuestTransport: Send + Sync {
    /// Open a new byte-stream channel to `port` inside the guest.
    async fn dial(&self, port: u32) -> io::Result<Box<dyn GuestStream>>;
}

/// [`GuestTransport`] backed by a virtio socket.
///
/// Connects to the guest's context id on the requested port. Requires the
/// guest kernel to expose vsock and the forwarding helper to be listening.
#[derive(Debug, Clone)]
pub struct VsockTransport {
    cid: u32,
}

impl VsockTransport {
    /// Create a transport dialing the guest with the given context id.
    pub fn new(cid: u32) -> Self {
        Self { cid }
    }

    /// The guest context id this transport dials.
    pub fn cid(&self) -> u32 {
        self.cid
    }
}

#[async_trait]
impl GuestTransport for VsockTransport {
    async fn dial(&self, port: u32) -> io::Result<Box<dyn GuestStream>> {
        let addr = tokio_vsock::VsockAddr::new(self.cid, port);
        let stream = tokio_vsock::VsockStream::connect(addr).await?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vsock_transport_cid() {
        let transport = VsockTransport::new(3);
        assert_eq!(transport.cid(), 3);
    }

    #[tokio::test]
    async fn test_duplex_is_a_guest_stream() {
        // The blanket impl must accept tokio's in-memory duplex stream,
        // which is what the test suites dial instead of a real guest.
        let (client, _server) = tokio::io::duplex(64);
        let _boxed: Box<dyn GuestStream> = Box::new(client);
    }
}
