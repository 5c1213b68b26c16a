//! Shell command execution inside the guest.

use async_trait::async_trait;

/// Captured result of a guest command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Process exit code.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited successfully.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs shell commands inside the guest environment.
///
/// Implementations are supplied by the embedding runtime (typically a guest
/// agent connection). Commands are opaque shell strings; callers get back an
/// exit code plus captured output and nothing else.
///
/// Errors from `run_command` mean the capability itself failed (the guest is
/// unreachable, the agent died). A command that ran but exited nonzero is a
/// successful `run_command` call with a nonzero `exit_code`.
#[async_trait]
pub trait GuestCommandRunner: Send + Sync {
    /// Run `command` through the guest's shell and wait for it to exit.
    async fn run_command(&self, command: &str) -> anyhow::Result<CommandOutput>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_output_success() {
        let ok = CommandOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert!(ok.success());

        let failed = CommandOutput {
            exit_code: 127,
            stdout: String::new(),
            stderr: "not found".to_string(),
        };
        assert!(!failed.success());
    }
}
