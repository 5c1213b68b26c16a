//! Bidirectional byte relay between one host socket and one guest channel.
//!
//! A relay runs two copy legs concurrently, one per direction. A leg ends on
//! EOF, on a read/write error, or when the connection is cancelled; it then
//! half-closes its writer so the opposite leg drains to EOF instead of
//! blocking. The relay returns once both legs have exited and closes the
//! connection exactly once. No framing or protocol interpretation is
//! applied; bytes pass through unmodified and in order on each leg.

use crate::guest::GuestStream;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

/// Read chunk size for each copy leg. A tuning parameter, not a correctness
/// property.
pub(crate) const RELAY_BUFFER_SIZE: usize = 8 * 1024;

/// One accepted host connection paired with one guest transport channel.
///
/// The socket halves live inside the relay's copy-leg tasks; `Connection`
/// carries the identity and the close/cancel state shared between the relay
/// and the owning service. `closed` is the only piece of state raced from
/// two sides, so it sits behind a mutex.
pub struct Connection {
    id: Uuid,
    closed: Mutex<bool>,
    cancel_tx: watch::Sender<bool>,
}

impl Connection {
    /// Create a new connection identity.
    pub fn new() -> Arc<Self> {
        let (cancel_tx, _) = watch::channel(false);
        Arc::new(Self {
            id: Uuid::new_v4(),
            closed: Mutex::new(false),
            cancel_tx,
        })
    }

    /// Unique id of this connection.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Close the connection: cancel both copy legs so their socket halves
    /// are released.
    ///
    /// Idempotent; the first caller wins and every later call (including a
    /// concurrent one) is a no-op.
    pub fn close(&self) {
        let mut closed = match self.closed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *closed {
            return;
        }
        *closed = true;
        let _ = self.cancel_tx.send(true);
        debug!("Connection {} closed", self.id);
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        match self.closed.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub(crate) fn cancelled(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }
}

/// The paired copy loops joining one host socket to one guest channel.
pub struct ConnectionRelay {
    conn: Arc<Connection>,
    host: TcpStream,
    guest: Box<dyn GuestStream>,
}

impl ConnectionRelay {
    /// Create a relay over an accepted host socket and a dialed guest
    /// channel.
    pub fn new(conn: Arc<Connection>, host: TcpStream, guest: Box<dyn GuestStream>) -> Self {
        Self { conn, host, guest }
    }

    /// Relay bytes in both directions until both legs have exited, then
    /// close the connection.
    ///
    /// Leg failures are connection-end events, logged and absorbed; they
    /// never affect other connections or the service.
    pub async fn run(self) {
        let Self { conn, host, guest } = self;
        let id = conn.id();
        let (host_read, host_write) = host.into_split();
        let (guest_read, guest_write) = tokio::io::split(guest);

        let outbound = tokio::spawn(copy_leg(
            host_read,
            guest_write,
            conn.cancelled(),
            "Host->guest",
        ));
        let inbound = tokio::spawn(copy_leg(
            guest_read,
            host_write,
            conn.cancelled(),
            "Guest->host",
        ));

        // Neither leg waits for the other; the relay is done when both are.
        let _ = outbound.await;
        let _ = inbound.await;

        conn.close();
        debug!("Relay {} finished", id);
    }
}

/// Copy bytes from `reader` to `writer` until EOF, error, or cancellation,
/// then half-close the writer so the peer leg sees EOF.
async fn copy_leg<R, W>(
    mut reader: R,
    mut writer: W,
    mut cancel: watch::Receiver<bool>,
    direction: &'static str,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // The close may have already happened between registration and leg
    // startup; a fresh receiver only wakes on future changes.
    if *cancel.borrow_and_update() {
        let _ = writer.shutdown().await;
        return;
    }

    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        debug!("{} leg reached EOF", direction);
                        break;
                    }
                    Ok(n) => {
                        if let Err(e) = writer.write_all(&buf[..n]).await {
                            debug!("{} leg write ended: {}", direction, e);
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("{} leg read ended: {}", direction, e);
                        break;
                    }
                }
            }
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    debug!("{} leg cancelled", direction);
                    break;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    /// Loopback socket pair for driving the relay's host side.
    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_relay_round_trip() {
        let (mut client, server) = tcp_pair().await;
        let (guest_end, mut far_end) = tokio::io::duplex(64 * 1024);

        let conn = Connection::new();
        let relay = ConnectionRelay::new(conn.clone(), server, Box::new(guest_end));
        let relay_task = tokio::spawn(relay.run());

        // Host -> guest
        client.write_all(b"hello guest").await.unwrap();
        let mut buf = [0u8; 11];
        far_end.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello guest");

        // Guest -> host
        far_end.write_all(b"hello host").await.unwrap();
        let mut buf = [0u8; 10];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello host");

        // Host closes; relay tears down and the guest end sees EOF.
        drop(client);
        let mut rest = Vec::new();
        far_end.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        drop(far_end);

        relay_task.await.unwrap();
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_relay_multi_chunk_payload_in_order() {
        let (mut client, server) = tcp_pair().await;
        let (guest_end, mut far_end) = tokio::io::duplex(256 * 1024);

        let conn = Connection::new();
        let relay_task = tokio::spawn(ConnectionRelay::new(conn, server, Box::new(guest_end)).run());

        // Payload spanning many read chunks, with a recognizable sequence.
        let payload: Vec<u8> = (0..10 * RELAY_BUFFER_SIZE).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client.shutdown().await.unwrap();
            client
        });

        let mut received = Vec::with_capacity(expected.len());
        far_end.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, expected);

        drop(far_end);
        writer.await.unwrap();
        relay_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_relay_zero_length_session() {
        let (mut client, server) = tcp_pair().await;
        let (guest_end, mut far_end) = tokio::io::duplex(1024);

        let conn = Connection::new();
        let relay_task = tokio::spawn(
            ConnectionRelay::new(conn.clone(), server, Box::new(guest_end)).run(),
        );

        // No bytes in either direction; both sides just close.
        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        far_end.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        drop(far_end);
        drop(client);

        relay_task.await.unwrap();
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_guest_eof_closes_host_side() {
        let (mut client, server) = tcp_pair().await;
        let (guest_end, far_end) = tokio::io::duplex(1024);

        let conn = Connection::new();
        let relay_task = tokio::spawn(ConnectionRelay::new(conn, server, Box::new(guest_end)).run());

        // Guest channel breaks (helper crashed); host read must see EOF
        // rather than blocking indefinitely.
        drop(far_end);

        let mut buf = Vec::new();
        tokio::time::timeout(std::time::Duration::from_secs(5), client.read_to_end(&mut buf))
            .await
            .expect("host side must not block after guest EOF")
            .unwrap();
        assert!(buf.is_empty());

        drop(client);
        relay_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_cancels_legs() {
        let (client, server) = tcp_pair().await;
        let (guest_end, far_end) = tokio::io::duplex(1024);

        let conn = Connection::new();
        let relay_task = tokio::spawn(
            ConnectionRelay::new(conn.clone(), server, Box::new(guest_end)).run(),
        );

        // Both peers stay open; only close() ends the relay.
        conn.close();
        tokio::time::timeout(std::time::Duration::from_secs(5), relay_task)
            .await
            .expect("relay must end after close")
            .unwrap();

        drop(client);
        drop(far_end);
    }

    #[tokio::test]
    async fn test_double_close_concurrent_is_safe() {
        let conn = Connection::new();
        let mut cancel = conn.cancelled();

        let a = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.close() })
        };
        let b = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.close() })
        };
        a.await.unwrap();
        b.await.unwrap();

        assert!(conn.is_closed());
        // Exactly one cancellation was observed, no fault.
        assert!(*cancel.borrow_and_update());
        conn.close();
        assert!(conn.is_closed());
    }
}
