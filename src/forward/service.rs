//! Port forwarding service: startup ordering, status machine, teardown.

use super::error::{ForwardError, ForwardResult};
use super::listener::HostListener;
use super::relay::Connection;
use super::status::ForwardingStatus;
use crate::bridge::BridgeInstaller;
use crate::config::{RetryPolicy, Settings};
use crate::guest::GuestTransport;
use crate::telemetry::{AuditEvent, AuditLogger};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Mailbox capacity for the status tracker.
const TRACKER_CHANNEL_SIZE: usize = 64;

/// Upper bound on waiting for the tracker to apply a status transition.
const STATUS_SYNC_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for a [`PortForwardService`].
#[derive(Debug, Clone)]
pub struct PortForwardConfig {
    /// TCP port to listen on host-side.
    pub host_port: u16,
    /// Transport port the guest-side bridge listens on.
    pub transport_port: u32,
    /// Guest-local TCP port the bridge forwards to.
    pub guest_port: u16,
    /// Pause between bridge launch and listener start.
    pub settle_delay: Duration,
    /// How long to wait for the host listener to become ready.
    pub ready_timeout: Duration,
    /// Retry policy for per-connection guest dials.
    pub dial_retry: RetryPolicy,
}

impl PortForwardConfig {
    /// Config for one forwarding rule with default timing.
    pub fn new(host_port: u16, transport_port: u32, guest_port: u16) -> Self {
        Self {
            host_port,
            transport_port,
            guest_port,
            settle_delay: Duration::from_millis(300),
            ready_timeout: Duration::from_secs(5),
            dial_retry: RetryPolicy::default(),
        }
    }

    /// Build a config from loaded [`Settings`].
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            host_port: settings.forward.host_port,
            transport_port: settings.forward.transport_port,
            guest_port: settings.forward.guest_port,
            settle_delay: settings.forward.settle_delay(),
            ready_timeout: settings.forward.ready_timeout(),
            dial_retry: settings.retry.clone(),
        }
    }
}

/// Messages for the status tracker task.
///
/// The tracker is the single owner of the active connection set and of the
/// status value; every other task talks to it through this mailbox.
pub(crate) enum TrackerMessage {
    /// Startup began.
    SetStarting,
    /// Startup failed with a human-readable message.
    SetError {
        /// What went wrong.
        message: String,
    },
    /// Startup finished; begin reporting the live connection count.
    Activate,
    /// Forwarding stopped.
    Deactivate,
    /// A connection was accepted and its relay is starting.
    Opened {
        /// The registered connection.
        conn: Arc<Connection>,
    },
    /// A connection's relay finished (both legs exited).
    Closed {
        /// Id of the finished connection.
        id: Uuid,
    },
    /// Close every live connection and report how many there were.
    CloseAll {
        /// Acknowledgement with the number of connections closed.
        done: oneshot::Sender<usize>,
    },
}

/// Orchestrates the guest bridge, the host listener, and per-connection
/// relays, exposing a [`ForwardingStatus`] state machine to observers.
pub struct PortForwardService {
    config: PortForwardConfig,
    installer: BridgeInstaller,
    transport: Arc<dyn GuestTransport>,
    tracker_tx: mpsc::Sender<TrackerMessage>,
    tracker_task: JoinHandle<()>,
    status_rx: watch::Receiver<ForwardingStatus>,
    listener_shutdown: watch::Sender<bool>,
    listener_task: Option<JoinHandle<()>>,
    audit: Option<Arc<AuditLogger>>,
}

impl PortForwardService {
    /// Create a service. Nothing runs until [`start`](Self::start).
    pub fn new(
        config: PortForwardConfig,
        installer: BridgeInstaller,
        transport: Arc<dyn GuestTransport>,
    ) -> Self {
        let (tracker_tx, tracker_rx) = mpsc::channel(TRACKER_CHANNEL_SIZE);
        let (status_tx, status_rx) = watch::channel(ForwardingStatus::Inactive);
        let tracker_task = tokio::spawn(run_tracker(tracker_rx, status_tx));
        let (listener_shutdown, _) = watch::channel(false);

        Self {
            config,
            installer,
            transport,
            tracker_tx,
            tracker_task,
            status_rx,
            listener_shutdown,
            listener_task: None,
            audit: None,
        }
    }

    /// Set the audit logger for forwarding lifecycle events.
    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Current status snapshot.
    pub fn status(&self) -> ForwardingStatus {
        self.status_rx.borrow().clone()
    }

    /// Subscribe to status changes.
    pub fn subscribe(&self) -> watch::Receiver<ForwardingStatus> {
        self.status_rx.clone()
    }

    /// Whether forwarding is currently active.
    pub fn is_active(&self) -> bool {
        self.status().is_active()
    }

    /// Number of live relayed connections.
    pub fn connection_count(&self) -> u32 {
        self.status().connections().unwrap_or(0)
    }

    /// Start forwarding: bring up the guest bridge, then the host listener.
    ///
    /// Rejected (as a logged no-op) unless the service is currently
    /// inactive.
    ///
    /// # Errors
    ///
    /// Every failure is returned to the caller and also captured into the
    /// status machine as `Error`; anything already started is rolled back,
    /// so a failed start leaves nothing running.
    pub async fn start(&mut self) -> ForwardResult<()> {
        if !self.status().is_inactive() {
            warn!("Port forwarding is {}; start ignored", self.status());
            return Ok(());
        }

        self.send_tracker(TrackerMessage::SetStarting).await;
        info!(
            "Starting port forwarding: host {} -> transport {} -> guest {}",
            self.config.host_port, self.config.transport_port, self.config.guest_port
        );

        if let Err(e) = self
            .installer
            .ensure_running(self.config.transport_port, self.config.guest_port)
            .await
        {
            let err = ForwardError::from(e);
            error!("Bridge start failed: {}", err);
            self.installer.stop().await;
            self.set_status_and_wait(
                TrackerMessage::SetError {
                    message: err.to_string(),
                },
                |status| matches!(status, ForwardingStatus::Error { .. }),
            )
            .await;
            return Err(err);
        }

        // Give the freshly launched helper a moment to bind its listener
        // before connections start dialing it.
        tokio::time::sleep(self.config.settle_delay).await;

        let (ready_tx, ready_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.listener_shutdown = shutdown_tx;

        let listener = HostListener::new(
            &self.config,
            self.transport.clone(),
            self.tracker_tx.clone(),
            shutdown_rx,
            ready_tx,
            self.audit.clone(),
        );
        let listener_task = tokio::spawn(listener.run());

        let ready = tokio::time::timeout(self.config.ready_timeout, ready_rx).await;
        let startup_error = match ready {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(e))) => Some(e),
            Ok(Err(_)) => Some(ForwardError::ListenerAborted),
            Err(_) => Some(ForwardError::ReadyTimeout {
                timeout: self.config.ready_timeout,
            }),
        };

        if let Some(err) = startup_error {
            error!("Host listener start failed: {}", err);
            listener_task.abort();
            // Roll back the bridge so a failed start leaves nothing behind.
            self.installer.stop().await;
            self.set_status_and_wait(
                TrackerMessage::SetError {
                    message: err.to_string(),
                },
                |status| matches!(status, ForwardingStatus::Error { .. }),
            )
            .await;
            return Err(err);
        }

        self.listener_task = Some(listener_task);
        self.set_status_and_wait(TrackerMessage::Activate, ForwardingStatus::is_active)
            .await;

        if let Some(ref audit) = self.audit {
            audit.log(AuditEvent::ForwardStart {
                host_port: self.config.host_port,
                guest_port: self.config.guest_port,
                transport_port: self.config.transport_port,
            });
        }
        info!(
            "Port forwarding active on 0.0.0.0:{}",
            self.config.host_port
        );
        Ok(())
    }

    /// Stop forwarding: close connections, stop the listener, stop the
    /// bridge, and mark the service inactive.
    ///
    /// Never fails; teardown errors are logged and absorbed so shutdown
    /// always completes. Calling this while already inactive has no
    /// observable side effects.
    pub async fn stop(&mut self) {
        if self.listener_task.is_none() && self.status().is_inactive() {
            debug!("Port forwarding already inactive");
            return;
        }
        info!(
            "Stopping port forwarding on host port {}",
            self.config.host_port
        );

        // 1. Cancel in-flight relays and close their connections.
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .tracker_tx
            .send(TrackerMessage::CloseAll { done: done_tx })
            .await
            .is_ok()
            && let Ok(closed) = done_rx.await
            && closed > 0
        {
            debug!("Closed {} active connections", closed);
        }

        // 2. Stop the host listener.
        let _ = self.listener_shutdown.send(true);
        if let Some(task) = self.listener_task.take()
            && tokio::time::timeout(Duration::from_secs(1), task).await.is_err()
        {
            warn!("Host listener did not stop in time; abandoning wait");
        }

        // 3. Stop the guest bridge helper (best effort).
        self.installer.stop().await;

        // 4. Observable state always lands on inactive.
        self.set_status_and_wait(TrackerMessage::Deactivate, ForwardingStatus::is_inactive)
            .await;

        if let Some(ref audit) = self.audit {
            audit.log(AuditEvent::ForwardStop {
                host_port: self.config.host_port,
            });
        }
        info!("Port forwarding stopped");
    }

    async fn send_tracker(&self, message: TrackerMessage) {
        if self.tracker_tx.send(message).await.is_err() {
            // Tracker lives as long as the service; this only trips if the
            // runtime is tearing down around us.
            debug!("Status tracker unavailable");
        }
    }

    /// Send a status transition and wait until observers can see it, so
    /// callers of `start`/`stop` never read a stale status on return.
    async fn set_status_and_wait(
        &self,
        message: TrackerMessage,
        reached: fn(&ForwardingStatus) -> bool,
    ) {
        self.send_tracker(message).await;
        let mut rx = self.status_rx.clone();
        let _ = tokio::time::timeout(STATUS_SYNC_TIMEOUT, rx.wait_for(|status| reached(status)))
            .await;
    }
}

impl Drop for PortForwardService {
    fn drop(&mut self) {
        self.tracker_task.abort();
        if let Some(task) = self.listener_task.take() {
            task.abort();
        }
    }
}

/// Single-owner task for the status value and the active connection set.
///
/// All mutation funnels through the mailbox; observers only ever see the
/// watch channel. `Active(n)` always reports the current size of the set.
async fn run_tracker(
    mut rx: mpsc::Receiver<TrackerMessage>,
    status_tx: watch::Sender<ForwardingStatus>,
) {
    let mut connections: HashMap<Uuid, Arc<Connection>> = HashMap::new();
    let mut active = false;

    let publish = |status_tx: &watch::Sender<ForwardingStatus>, status: ForwardingStatus| {
        if *status_tx.borrow() != status {
            let _ = status_tx.send(status);
        }
    };

    while let Some(message) = rx.recv().await {
        match message {
            TrackerMessage::SetStarting => {
                active = false;
                publish(&status_tx, ForwardingStatus::Starting);
            }
            TrackerMessage::SetError { message } => {
                active = false;
                publish(&status_tx, ForwardingStatus::Error { message });
            }
            TrackerMessage::Activate => {
                active = true;
                publish(
                    &status_tx,
                    ForwardingStatus::Active {
                        connections: connections.len() as u32,
                    },
                );
            }
            TrackerMessage::Deactivate => {
                active = false;
                publish(&status_tx, ForwardingStatus::Inactive);
            }
            TrackerMessage::Opened { conn } => {
                connections.insert(conn.id(), conn);
                if active {
                    publish(
                        &status_tx,
                        ForwardingStatus::Active {
                            connections: connections.len() as u32,
                        },
                    );
                }
            }
            TrackerMessage::Closed { id } => {
                connections.remove(&id);
                if active {
                    publish(
                        &status_tx,
                        ForwardingStatus::Active {
                            connections: connections.len() as u32,
                        },
                    );
                }
            }
            TrackerMessage::CloseAll { done } => {
                let count = connections.len();
                for conn in connections.values() {
                    conn.close();
                }
                connections.clear();
                let _ = done.send(count);
            }
        }
    }
}
