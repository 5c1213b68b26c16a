//! Probing the guest for forwarding tools and package managers.
//!
//! All probes go through the [`GuestCommandRunner`] capability and are pure
//! decision logic over exit codes. A probe that errors (guest unreachable,
//! shell missing) is treated the same as "absent" so detection itself can
//! never wedge a start sequence; only the final "nothing usable" outcome is
//! surfaced, by the installer.

use crate::guest::GuestCommandRunner;
use tracing::{debug, trace};

/// Forwarding helpers the installer knows how to drive, in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeTool {
    /// Primary helper: listens on the transport port directly and forks per
    /// connection.
    Socat,
    /// Fallback helper: single-connection relay built from a named pipe.
    Netcat,
}

impl BridgeTool {
    /// Binary name probed for inside the guest.
    pub fn binary(&self) -> &'static str {
        match self {
            BridgeTool::Socat => "socat",
            BridgeTool::Netcat => "nc",
        }
    }

    /// Command-line pattern that uniquely identifies this helper's process
    /// tree for a given transport port. Matched with `pkill -f` / `pgrep -f`,
    /// so it also catches the restart-loop shell wrapping the helper.
    pub fn process_pattern(&self, transport_port: u32) -> String {
        match self {
            BridgeTool::Socat => format!("VSOCK-LISTEN:{transport_port}"),
            BridgeTool::Netcat => format!("nc -l -p {transport_port}"),
        }
    }
}

/// Package managers probed in fixed priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    /// Alpine.
    Apk,
    /// Debian/Ubuntu.
    AptGet,
    /// Fedora.
    Dnf,
    /// RHEL/CentOS.
    Yum,
    /// openSUSE.
    Zypper,
}

impl PackageManager {
    /// Probe order. First hit wins.
    pub const PROBE_ORDER: [PackageManager; 5] = [
        PackageManager::Apk,
        PackageManager::AptGet,
        PackageManager::Dnf,
        PackageManager::Yum,
        PackageManager::Zypper,
    ];

    /// Binary name probed for inside the guest.
    pub fn binary(&self) -> &'static str {
        match self {
            PackageManager::Apk => "apk",
            PackageManager::AptGet => "apt-get",
            PackageManager::Dnf => "dnf",
            PackageManager::Yum => "yum",
            PackageManager::Zypper => "zypper",
        }
    }

    /// Non-interactive install invocation for `package`.
    pub fn install_command(&self, package: &str) -> String {
        match self {
            PackageManager::Apk => format!("apk add --no-cache {package}"),
            PackageManager::AptGet => format!(
                "apt-get update -qq >/dev/null 2>&1; \
                 DEBIAN_FRONTEND=noninteractive apt-get install -y -qq {package}"
            ),
            PackageManager::Dnf => format!("dnf install -y -q {package}"),
            PackageManager::Yum => format!("yum install -y -q {package}"),
            PackageManager::Zypper => format!("zypper --non-interactive --quiet install {package}"),
        }
    }
}

/// Check whether a binary is on the guest's PATH.
///
/// Probe failures count as "absent".
pub(crate) async fn binary_present(runner: &dyn GuestCommandRunner, binary: &str) -> bool {
    let probe = format!("command -v {binary} >/dev/null 2>&1");
    match runner.run_command(&probe).await {
        Ok(output) => {
            trace!("Probe for '{}' exited {}", binary, output.exit_code);
            output.success()
        }
        Err(e) => {
            debug!("Probe for '{}' failed: {:#}", binary, e);
            false
        }
    }
}

/// Find the best available forwarding tool in the guest.
///
/// Probes socat first, then nc. Returns `None` when neither is present.
pub async fn detect_bridge_tool(runner: &dyn GuestCommandRunner) -> Option<BridgeTool> {
    for tool in [BridgeTool::Socat, BridgeTool::Netcat] {
        if binary_present(runner, tool.binary()).await {
            debug!("Detected forwarding tool: {}", tool.binary());
            return Some(tool);
        }
    }
    debug!("No forwarding tool detected in guest");
    None
}

/// Find the first known package manager present in the guest.
pub async fn detect_package_manager(runner: &dyn GuestCommandRunner) -> Option<PackageManager> {
    for manager in PackageManager::PROBE_ORDER {
        if binary_present(runner, manager.binary()).await {
            debug!("Detected package manager: {}", manager.binary());
            return Some(manager);
        }
    }
    debug!("No package manager detected in guest");
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest::CommandOutput;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Fake runner that reports a fixed set of binaries as present and
    /// records every command it is asked to run.
    struct StubRunner {
        present: HashSet<&'static str>,
        commands: Mutex<Vec<String>>,
        fail_all: bool,
    }

    impl StubRunner {
        fn with_binaries(present: &[&'static str]) -> Self {
            Self {
                present: present.iter().copied().collect(),
                commands: Mutex::new(Vec::new()),
                fail_all: false,
            }
        }

        fn unreachable_guest() -> Self {
            Self {
                present: HashSet::new(),
                commands: Mutex::new(Vec::new()),
                fail_all: true,
            }
        }
    }

    #[async_trait]
    impl GuestCommandRunner for StubRunner {
        async fn run_command(&self, command: &str) -> anyhow::Result<CommandOutput> {
            self.commands.lock().unwrap().push(command.to_string());
            if self.fail_all {
                anyhow::bail!("guest unreachable");
            }
            let found = self
                .present
                .iter()
                .any(|bin| command.contains(&format!("command -v {bin} ")));
            Ok(CommandOutput {
                exit_code: if found { 0 } else { 1 },
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_detect_prefers_socat() {
        let runner = StubRunner::with_binaries(&["socat", "nc"]);
        assert_eq!(detect_bridge_tool(&runner).await, Some(BridgeTool::Socat));
    }

    #[tokio::test]
    async fn test_detect_falls_back_to_netcat() {
        let runner = StubRunner::with_binaries(&["nc"]);
        assert_eq!(detect_bridge_tool(&runner).await, Some(BridgeTool::Netcat));
    }

    #[tokio::test]
    async fn test_detect_none_available() {
        let runner = StubRunner::with_binaries(&[]);
        assert_eq!(detect_bridge_tool(&runner).await, None);
    }

    #[tokio::test]
    async fn test_probe_error_treated_as_absent() {
        let runner = StubRunner::unreachable_guest();
        assert_eq!(detect_bridge_tool(&runner).await, None);
        assert_eq!(detect_package_manager(&runner).await, None);
    }

    #[tokio::test]
    async fn test_package_manager_priority_order() {
        // Both present: apk wins because it is probed first.
        let runner = StubRunner::with_binaries(&["apt-get", "apk"]);
        assert_eq!(
            detect_package_manager(&runner).await,
            Some(PackageManager::Apk)
        );

        let runner = StubRunner::with_binaries(&["zypper", "yum"]);
        assert_eq!(
            detect_package_manager(&runner).await,
            Some(PackageManager::Yum)
        );
    }

    #[test]
    fn test_install_commands_are_non_interactive() {
        for manager in PackageManager::PROBE_ORDER {
            let cmd = manager.install_command("socat");
            assert!(cmd.contains("socat"), "{cmd}");
            // Every invocation must be able to run unattended.
            let unattended = cmd.contains("-y")
                || cmd.contains("--no-cache")
                || cmd.contains("--non-interactive");
            assert!(unattended, "{cmd}");
        }
    }

    #[test]
    fn test_process_pattern_scoped_by_port() {
        assert_eq!(
            BridgeTool::Socat.process_pattern(9000),
            "VSOCK-LISTEN:9000"
        );
        assert_eq!(BridgeTool::Netcat.process_pattern(9000), "nc -l -p 9000");
    }
}
