//! Workload lifecycle: cascading-timeout teardown of the forwarding stack.
//!
//! A [`WorkloadSession`] fronts the aggregate of the port forwarding
//! service, the control channel to the guest, and the execution context
//! running the workload. Stopping it walks a strictly ordered sequence of
//! phases, each bounded by its own timeout and all of them bounded by one
//! master timeout, and always ends in a single unconditional state-clear.
//! Whatever the underlying resources do, after [`stop`](WorkloadSession::stop)
//! returns the observable state is `Stopped` and every local reference is
//! gone.

use crate::config::TimeoutBudget;
use crate::forward::PortForwardService;
use crate::telemetry::{self, AuditEvent};
use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Control connection to the guest (e.g. the agent channel).
///
/// Supplied by the embedding runtime; disconnect failures are opaque.
#[async_trait]
pub trait ControlChannel: Send {
    /// Disconnect the channel.
    async fn disconnect(&mut self) -> anyhow::Result<()>;
}

/// The running workload's execution environment (e.g. the VM or container).
///
/// Supplied by the embedding runtime; stop failures are opaque.
#[async_trait]
pub trait ExecutionContext: Send {
    /// Stop the execution context.
    async fn stop(&mut self) -> anyhow::Result<()>;
}

/// Observable lifecycle state of a workload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadState {
    /// A workload is running.
    Running,
    /// No workload; all resources released or abandoned.
    Stopped,
}

/// Owns the resources fronting one running workload and tears them down
/// deterministically under time pressure.
pub struct WorkloadSession {
    forwarder: Option<PortForwardService>,
    channel: Option<Box<dyn ControlChannel>>,
    context: Option<Box<dyn ExecutionContext>>,
    budget: TimeoutBudget,
    state_tx: watch::Sender<WorkloadState>,
    status_message: Option<String>,
}

impl WorkloadSession {
    /// Create a session over the given resources.
    ///
    /// The session is `Running` when an execution context is present.
    pub fn new(
        forwarder: Option<PortForwardService>,
        channel: Option<Box<dyn ControlChannel>>,
        context: Option<Box<dyn ExecutionContext>>,
        budget: TimeoutBudget,
    ) -> Self {
        let state = if context.is_some() {
            WorkloadState::Running
        } else {
            WorkloadState::Stopped
        };
        let (state_tx, _) = watch::channel(state);
        Self {
            forwarder,
            channel,
            context,
            budget,
            state_tx,
            status_message: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkloadState {
        *self.state_tx.borrow()
    }

    /// Subscribe to lifecycle state changes.
    pub fn subscribe(&self) -> watch::Receiver<WorkloadState> {
        self.state_tx.subscribe()
    }

    /// Whether a workload is currently running.
    pub fn is_running(&self) -> bool {
        self.state() == WorkloadState::Running
    }

    /// User-facing status message, if any.
    pub fn status_message(&self) -> Option<&str> {
        self.status_message.as_deref()
    }

    /// Set the user-facing status message.
    pub fn set_status_message(&mut self, message: impl Into<String>) {
        self.status_message = Some(message.into());
    }

    /// Access the forwarding service while the workload is running.
    pub fn forwarder(&mut self) -> Option<&mut PortForwardService> {
        self.forwarder.as_mut()
    }

    /// Stop the workload: forwarding service, control channel, execution
    /// context, in that order, each phase bounded by its budget and the
    /// whole sequence by the master budget.
    ///
    /// Cannot fail. A phase that exceeds its budget is abandoned (the
    /// awaited stop future is dropped, not killed at the OS level) and the
    /// sequence moves on. The final state-clear runs on every path.
    pub async fn stop(&mut self) {
        if self.context.is_none() {
            debug!("No active workload; clearing state");
            self.clear_state();
            return;
        }

        info!(
            "Stopping workload (master budget {:?})",
            self.budget.master()
        );

        // References leave the session before the waits begin, so even an
        // abandoned phase cannot resurface a half-stopped resource.
        let forwarder = self.forwarder.take();
        let channel = self.channel.take();
        let context = self.context.take();

        let sequence = teardown_sequence(forwarder, channel, context, &self.budget);
        if timeout(self.budget.master(), sequence).await.is_err() {
            warn!(
                "Workload teardown exceeded master budget {:?}; forcing final cleanup",
                self.budget.master()
            );
            telemetry::audit().log(AuditEvent::ShutdownTimeout {
                phase: "master".to_string(),
            });
        }

        self.clear_state();
        info!("Workload stopped");
    }

    /// The one unconditional clearing step. Synchronous, infallible, and
    /// reached from every path out of [`stop`](Self::stop).
    fn clear_state(&mut self) {
        self.forwarder = None;
        self.channel = None;
        self.context = None;
        self.status_message = None;
        if *self.state_tx.borrow() != WorkloadState::Stopped {
            let _ = self.state_tx.send(WorkloadState::Stopped);
        }
    }
}

/// Strictly ordered teardown phases, each independently timeout-bounded.
async fn teardown_sequence(
    forwarder: Option<PortForwardService>,
    channel: Option<Box<dyn ControlChannel>>,
    context: Option<Box<dyn ExecutionContext>>,
    budget: &TimeoutBudget,
) {
    if let Some(mut forwarder) = forwarder {
        if timeout(budget.forwarder(), forwarder.stop()).await.is_err() {
            warn!(
                "Port forwarding stop exceeded {:?}; abandoning wait",
                budget.forwarder()
            );
            telemetry::audit().log(AuditEvent::ShutdownTimeout {
                phase: "forwarder".to_string(),
            });
        }
    }

    if let Some(mut channel) = channel {
        match timeout(budget.channel(), channel.disconnect()).await {
            Ok(Ok(())) => debug!("Control channel disconnected"),
            Ok(Err(e)) => warn!("Control channel disconnect failed: {:#}", e),
            Err(_) => {
                warn!(
                    "Control channel disconnect exceeded {:?}; abandoning wait",
                    budget.channel()
                );
                telemetry::audit().log(AuditEvent::ShutdownTimeout {
                    phase: "channel".to_string(),
                });
            }
        }
    }

    if let Some(mut context) = context {
        match timeout(budget.context(), context.stop()).await {
            Ok(Ok(())) => info!("Execution context stopped"),
            Ok(Err(e)) => warn!("Execution context stop failed: {:#}", e),
            Err(_) => {
                warn!(
                    "Execution context stop exceeded {:?}; it may be orphaned",
                    budget.context()
                );
                telemetry::audit().log(AuditEvent::ShutdownTimeout {
                    phase: "context".to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct PromptChannel {
        disconnected: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ControlChannel for PromptChannel {
        async fn disconnect(&mut self) -> anyhow::Result<()> {
            self.disconnected.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct PromptContext {
        stopped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ExecutionContext for PromptContext {
        async fn stop(&mut self) -> anyhow::Result<()> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Context whose stop never completes.
    struct HangingContext;

    #[async_trait]
    impl ExecutionContext for HangingContext {
        async fn stop(&mut self) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    /// Channel whose disconnect reports an error.
    struct FailingChannel;

    #[async_trait]
    impl ControlChannel for FailingChannel {
        async fn disconnect(&mut self) -> anyhow::Result<()> {
            anyhow::bail!("peer already gone")
        }
    }

    fn tight_budget() -> TimeoutBudget {
        TimeoutBudget {
            master_secs: 2,
            forwarder_secs: 1,
            channel_secs: 1,
            context_secs: 1,
        }
    }

    #[tokio::test]
    async fn test_stop_without_workload_is_idempotent_noop() {
        let mut session = WorkloadSession::new(None, None, None, tight_budget());
        assert_eq!(session.state(), WorkloadState::Stopped);

        session.stop().await;
        assert_eq!(session.state(), WorkloadState::Stopped);

        // Second stop is just as uneventful.
        session.stop().await;
        assert_eq!(session.state(), WorkloadState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_runs_all_phases_in_order() {
        let disconnected = Arc::new(AtomicBool::new(false));
        let stopped = Arc::new(AtomicBool::new(false));

        let mut session = WorkloadSession::new(
            None,
            Some(Box::new(PromptChannel {
                disconnected: disconnected.clone(),
            })),
            Some(Box::new(PromptContext {
                stopped: stopped.clone(),
            })),
            tight_budget(),
        );
        session.set_status_message("workload running");
        assert!(session.is_running());

        session.stop().await;

        assert!(disconnected.load(Ordering::SeqCst));
        assert!(stopped.load(Ordering::SeqCst));
        assert_eq!(session.state(), WorkloadState::Stopped);
        assert!(session.status_message().is_none());
    }

    #[tokio::test]
    async fn test_hanging_context_is_abandoned_within_budget() {
        let mut session =
            WorkloadSession::new(None, None, Some(Box::new(HangingContext)), tight_budget());

        let started = tokio::time::Instant::now();
        session.stop().await;
        let elapsed = started.elapsed();

        // Bounded by the context budget (1s) plus scheduling slack, well
        // under the master budget.
        assert!(elapsed < Duration::from_secs(2), "stop took {elapsed:?}");
        assert_eq!(session.state(), WorkloadState::Stopped);
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn test_channel_error_does_not_block_context_stop() {
        let stopped = Arc::new(AtomicBool::new(false));
        let mut session = WorkloadSession::new(
            None,
            Some(Box::new(FailingChannel)),
            Some(Box::new(PromptContext {
                stopped: stopped.clone(),
            })),
            tight_budget(),
        );

        session.stop().await;

        // The failed disconnect must not prevent the later phase.
        assert!(stopped.load(Ordering::SeqCst));
        assert_eq!(session.state(), WorkloadState::Stopped);
    }

    #[tokio::test]
    async fn test_state_subscription_sees_stop() {
        let mut session =
            WorkloadSession::new(None, None, Some(Box::new(HangingContext)), tight_budget());
        let mut state_rx = session.subscribe();
        assert_eq!(*state_rx.borrow_and_update(), WorkloadState::Running);

        session.stop().await;

        state_rx.changed().await.unwrap();
        assert_eq!(*state_rx.borrow(), WorkloadState::Stopped);
    }
}
