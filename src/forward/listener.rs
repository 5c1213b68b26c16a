//! Host-side TCP listener feeding accepted connections into relays.

use super::error::{ForwardError, ForwardResult};
use super::relay::{Connection, ConnectionRelay};
use super::service::{PortForwardConfig, TrackerMessage};
use crate::config::RetryPolicy;
use crate::guest::{GuestStream, GuestTransport};
use crate::telemetry::{AuditEvent, AuditLogger};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Accepts host connections on a configured TCP port and hands each one to
/// a new relay backed by a freshly dialed guest transport channel.
pub(crate) struct HostListener {
    host_port: u16,
    transport_port: u32,
    dial_retry: RetryPolicy,
    transport: Arc<dyn GuestTransport>,
    tracker: mpsc::Sender<TrackerMessage>,
    shutdown_rx: watch::Receiver<bool>,
    /// One-shot readiness cell. Taken on first signal so a second signal is
    /// a safe no-op rather than a fault.
    ready_tx: Option<oneshot::Sender<ForwardResult<()>>>,
    audit: Option<Arc<AuditLogger>>,
}

impl HostListener {
    pub(crate) fn new(
        config: &PortForwardConfig,
        transport: Arc<dyn GuestTransport>,
        tracker: mpsc::Sender<TrackerMessage>,
        shutdown_rx: watch::Receiver<bool>,
        ready_tx: oneshot::Sender<ForwardResult<()>>,
        audit: Option<Arc<AuditLogger>>,
    ) -> Self {
        Self {
            host_port: config.host_port,
            transport_port: config.transport_port,
            dial_retry: config.dial_retry.clone(),
            transport,
            tracker,
            shutdown_rx,
            ready_tx: Some(ready_tx),
            audit,
        }
    }

    fn signal_ready(&mut self, result: ForwardResult<()>) {
        if let Some(tx) = self.ready_tx.take() {
            let _ = tx.send(result);
        } else {
            debug!("Listener readiness already signalled");
        }
    }

    /// Bind and run the accept loop until the shutdown signal flips.
    pub(crate) async fn run(mut self) {
        let listener = match TcpListener::bind(("0.0.0.0", self.host_port)).await {
            Ok(listener) => listener,
            Err(e) => {
                self.signal_ready(Err(ForwardError::ListenFailed {
                    port: self.host_port,
                    source: e,
                }));
                return;
            }
        };

        info!(
            "Host listener ready: 0.0.0.0:{} -> transport port {}",
            self.host_port, self.transport_port
        );
        self.signal_ready(Ok(()));

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            debug!("Accepted host connection from {}", peer_addr);
                            self.spawn_connection(stream);
                        }
                        Err(e) => {
                            warn!("Accept error on host port {}: {}", self.host_port, e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Host listener on port {} shutting down", self.host_port);
                        break;
                    }
                }
            }
        }
    }

    /// One task per accepted connection: dial the guest, register, relay.
    fn spawn_connection(&self, host_stream: TcpStream) {
        let transport = self.transport.clone();
        let tracker = self.tracker.clone();
        let transport_port = self.transport_port;
        let host_port = self.host_port;
        let retry = self.dial_retry.clone();
        let audit = self.audit.clone();

        tokio::spawn(async move {
            let mut host_stream = host_stream;
            let guest_stream =
                match dial_with_retry(&*transport, transport_port, &retry).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        debug!("Dropping host connection: {}", e);
                        let _ = host_stream.shutdown().await;
                        return;
                    }
                };

            let conn = Connection::new();
            let id = conn.id();
            if tracker
                .send(TrackerMessage::Opened { conn: conn.clone() })
                .await
                .is_err()
            {
                // Service is gone; nothing to relay for.
                return;
            }
            if let Some(ref audit) = audit {
                audit.log(AuditEvent::ConnectionOpen { id, host_port });
            }

            ConnectionRelay::new(conn, host_stream, guest_stream).run().await;

            let _ = tracker.send(TrackerMessage::Closed { id }).await;
            if let Some(ref audit) = audit {
                audit.log(AuditEvent::ConnectionClose { id });
            }
        });
    }
}

/// Dial the guest transport, retrying transient failures per policy.
async fn dial_with_retry(
    transport: &dyn GuestTransport,
    port: u32,
    retry: &RetryPolicy,
) -> ForwardResult<Box<dyn GuestStream>> {
    let mut last = None;
    for attempt in 0..=retry.max_retries {
        if attempt > 0 {
            tokio::time::sleep(retry.delay_for(attempt - 1)).await;
        }
        match transport.dial(port).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(
                    "Guest dial attempt {}/{} failed: {}",
                    attempt + 1,
                    retry.max_retries + 1,
                    e
                );
                last = Some(e);
            }
        }
    }
    Err(ForwardError::DialFailed {
        port,
        source: last.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotConnected, "guest dial failed")
        }),
    })
}
