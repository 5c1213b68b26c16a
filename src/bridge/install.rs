//! Installing and supervising the guest-side forwarding helper.
//!
//! The helper is launched as a detached, self-restarting shell loop so it
//! outlives the command that started it and survives its own crashes:
//!
//! ```text
//! nohup sh -c 'while true; do <helper>; sleep <backoff>; done' >/dev/null 2>&1 &
//! ```
//!
//! Termination is explicit: [`BridgeInstaller::stop`] signals the process
//! tree by command-line pattern. Structured-concurrency scoping is never
//! relied on for the helper's lifetime.

use super::detect::{BridgeTool, binary_present, detect_package_manager};
use super::error::{BridgeError, BridgeResult};
use crate::config::RetryPolicy;
use crate::guest::GuestCommandRunner;
use crate::telemetry::{AuditEvent, AuditLogger};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Directory inside the guest for the netcat fallback's named pipes.
const PIPE_DIR: &str = "/tmp/.portbridge";

/// Identity of the helper process running inside the guest.
#[derive(Debug, Clone)]
pub struct BridgeProcessHandle {
    /// Which helper is running.
    pub tool: BridgeTool,
    /// Transport port the helper listens on.
    pub transport_port: u32,
    /// Guest-local TCP port the helper forwards to.
    pub guest_port: u16,
    /// Whether the helper was confirmed running at launch.
    pub running: bool,
}

/// Makes a forwarding helper available and running inside the guest.
///
/// Owns the [`BridgeProcessHandle`] exclusively: it is created on a
/// successful launch and cleared by [`stop`](BridgeInstaller::stop) no
/// matter whether the termination signal landed.
pub struct BridgeInstaller {
    runner: Arc<dyn GuestCommandRunner>,
    retry: RetryPolicy,
    handle: Option<BridgeProcessHandle>,
    audit: Option<Arc<AuditLogger>>,
}

impl BridgeInstaller {
    /// Create an installer driving the given guest command capability.
    pub fn new(runner: Arc<dyn GuestCommandRunner>, retry: RetryPolicy) -> Self {
        Self {
            runner,
            retry,
            handle: None,
            audit: None,
        }
    }

    /// Set the audit logger for install and launch events.
    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Handle of the running helper, if any.
    pub fn handle(&self) -> Option<&BridgeProcessHandle> {
        self.handle.as_ref()
    }

    /// Whether a helper launch has succeeded and not been stopped.
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Try to install the primary forwarding tool via a detected package
    /// manager. Returns whether socat is usable afterwards; failures are
    /// logged, never raised.
    pub async fn install_forward_tool(&self) -> bool {
        let Some(manager) = detect_package_manager(&*self.runner).await else {
            debug!("No package manager available; skipping install");
            return false;
        };
        self.try_install(manager).await
    }

    async fn try_install(&self, manager: super::detect::PackageManager) -> bool {
        info!("Installing socat via {}", manager.binary());
        let command = manager.install_command("socat");
        let installed = match self.runner.run_command(&command).await {
            Ok(output) if output.success() => {
                binary_present(&*self.runner, BridgeTool::Socat.binary()).await
            }
            Ok(output) => {
                warn!(
                    "Failed to install socat via {}: exit {} ({})",
                    manager.binary(),
                    output.exit_code,
                    output.stderr.trim()
                );
                false
            }
            Err(e) => {
                warn!("Failed to install socat via {}: {:#}", manager.binary(), e);
                false
            }
        };

        if let Some(ref audit) = self.audit {
            audit.log(AuditEvent::BridgeInstall {
                manager: manager.binary().to_string(),
                success: installed,
            });
        }
        installed
    }

    /// Ensure a forwarding helper is running, bridging `transport_port` to
    /// the guest-local `guest_port`.
    ///
    /// Prefers socat, installing it if a package manager is available; falls
    /// back to a netcat pipe relay.
    ///
    /// # Errors
    ///
    /// Fails only when no helper can be made to work:
    /// [`BridgeError::NoBridgeTool`] when the guest has neither helper nor a
    /// package manager, [`BridgeError::InstallIncomplete`] when an install
    /// was attempted but the helper is still unusable. Either aborts the
    /// whole forwarding start.
    pub async fn ensure_running(
        &mut self,
        transport_port: u32,
        guest_port: u16,
    ) -> BridgeResult<()> {
        if let Some(ref handle) = self.handle {
            debug!(
                "Bridge already running ({} on transport port {})",
                handle.tool.binary(),
                handle.transport_port
            );
            return Ok(());
        }

        let mut have_socat = binary_present(&*self.runner, BridgeTool::Socat.binary()).await;
        let mut manager_seen = false;
        if !have_socat
            && let Some(manager) = detect_package_manager(&*self.runner).await
        {
            manager_seen = true;
            have_socat = self.try_install(manager).await;
        }

        let tool = if have_socat {
            BridgeTool::Socat
        } else if binary_present(&*self.runner, BridgeTool::Netcat.binary()).await {
            info!("Socat unavailable; falling back to netcat pipe relay");
            BridgeTool::Netcat
        } else if manager_seen {
            let manager = detect_package_manager(&*self.runner)
                .await
                .map(|m| m.binary().to_string())
                .unwrap_or_else(|| "package manager".to_string());
            return Err(BridgeError::InstallIncomplete { manager });
        } else {
            return Err(BridgeError::NoBridgeTool);
        };

        let command = match tool {
            BridgeTool::Socat => self.socat_loop_command(transport_port, guest_port),
            BridgeTool::Netcat => {
                self.prepare_pipe_dir().await?;
                self.netcat_loop_command(transport_port, guest_port)
            }
        };

        self.launch(tool, &command, transport_port).await?;

        self.handle = Some(BridgeProcessHandle {
            tool,
            transport_port,
            guest_port,
            running: true,
        });

        if let Some(ref audit) = self.audit {
            audit.log(AuditEvent::BridgeLaunch {
                tool: tool.binary().to_string(),
                transport_port,
            });
        }
        info!(
            "Bridge running: {} listening on transport port {} -> 127.0.0.1:{}",
            tool.binary(),
            transport_port,
            guest_port
        );
        Ok(())
    }

    /// Launch the restart loop and verify the helper came up, retrying per
    /// the configured policy.
    async fn launch(
        &self,
        tool: BridgeTool,
        command: &str,
        transport_port: u32,
    ) -> BridgeResult<()> {
        let pattern = tool.process_pattern(transport_port);
        let probe = format!("pgrep -f '{pattern}' >/dev/null 2>&1");
        let mut last = String::from("helper never started");

        for attempt in 0..=self.retry.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.retry.delay_for(attempt - 1)).await;
            }

            match self.runner.run_command(command).await {
                Ok(output) if output.success() => {}
                Ok(output) => {
                    last = format!(
                        "launch command exited {}: {}",
                        output.exit_code,
                        output.stderr.trim()
                    );
                    debug!("Bridge launch attempt {} failed: {}", attempt + 1, last);
                    continue;
                }
                Err(e) => {
                    last = format!("launch command failed: {e:#}");
                    debug!("Bridge launch attempt {} failed: {}", attempt + 1, last);
                    continue;
                }
            }

            // The loop detaches immediately; confirm the helper actually
            // appeared before declaring success.
            match self.runner.run_command(&probe).await {
                Ok(output) if output.success() => return Ok(()),
                Ok(_) => {
                    last = format!("no process matching '{pattern}' after launch");
                    debug!("Bridge launch attempt {}: {}", attempt + 1, last);
                }
                Err(e) => {
                    last = format!("liveness probe failed: {e:#}");
                    debug!("Bridge launch attempt {}: {}", attempt + 1, last);
                }
            }
        }

        Err(BridgeError::LaunchFailed {
            attempts: self.retry.max_retries + 1,
            last,
        })
    }

    async fn prepare_pipe_dir(&self) -> BridgeResult<()> {
        let command = format!("mkdir -p {PIPE_DIR} && chmod 700 {PIPE_DIR}");
        match self.runner.run_command(&command).await {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => Err(BridgeError::Setup(format!(
                "could not create {PIPE_DIR}: exit {} ({})",
                output.exit_code,
                output.stderr.trim()
            ))),
            Err(e) => Err(BridgeError::Exec(format!("{e:#}"))),
        }
    }

    fn restart_backoff_secs(&self) -> u64 {
        self.retry.base_delay().as_secs().max(1)
    }

    fn socat_loop_command(&self, transport_port: u32, guest_port: u16) -> String {
        let backoff = self.restart_backoff_secs();
        format!(
            "nohup sh -c 'while true; do \
             socat VSOCK-LISTEN:{transport_port},reuseaddr,fork TCP:127.0.0.1:{guest_port}; \
             sleep {backoff}; done' >/dev/null 2>&1 &"
        )
    }

    fn netcat_loop_command(&self, transport_port: u32, guest_port: u16) -> String {
        let backoff = self.restart_backoff_secs();
        let pipe = format!("{PIPE_DIR}/relay-{transport_port}.pipe");
        format!(
            "nohup sh -c 'while true; do \
             rm -f {pipe}; mkfifo {pipe}; \
             nc -l -p {transport_port} < {pipe} | nc 127.0.0.1 {guest_port} > {pipe}; \
             sleep {backoff}; done' >/dev/null 2>&1 &"
        )
    }

    /// Best-effort termination of the helper process tree.
    ///
    /// The handle is always cleared, whether or not the signal landed: a
    /// failed signal must not leave the installer believing a dead handle
    /// is live.
    pub async fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        let pattern = handle.tool.process_pattern(handle.transport_port);
        match self
            .runner
            .run_command(&format!("pkill -f '{pattern}'"))
            .await
        {
            Ok(output) if output.success() => {
                debug!("Signalled bridge process matching '{}'", pattern);
            }
            Ok(_) => {
                // pkill exits 1 when nothing matched; the helper already died.
                debug!("No bridge process matched '{}'", pattern);
            }
            Err(e) => {
                warn!("Failed to signal bridge process: {:#}", e);
            }
        }

        if let Some(ref audit) = self.audit {
            audit.log(AuditEvent::BridgeStop {
                tool: handle.tool.binary().to_string(),
            });
        }
        info!("Bridge stopped ({})", handle.tool.binary());
    }
}
