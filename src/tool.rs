//! Running the host administration tools wincage shells out to

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::debug;

use crate::error::{ContainmentError, Result};

/// Resolve a tool on PATH, falling back to its System32 location
pub fn resolve_tool(name: &str) -> PathBuf {
    which::which(name).unwrap_or_else(|_| PathBuf::from(r"C:\Windows\System32").join(name))
}

/// Run `program` to completion; a non-zero exit becomes `CommandFailed`
pub async fn run_tool(program: &Path, args: &[String]) -> Result<String> {
    debug!(program = %program.display(), ?args, "Running tool");

    let output = Command::new(program).args(args).output().await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        // netsh reports failures on stdout
        let detail = if stderr.is_empty() {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        } else {
            stderr
        };
        return Err(ContainmentError::CommandFailed {
            command: program.display().to_string(),
            status: output.status.to_string(),
            stderr: detail,
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_non_zero_exit_is_command_failed() {
        let err = run_tool(
            Path::new("sh"),
            &["-c".to_string(), "echo nope >&2; exit 3".to_string()],
        )
        .await
        .unwrap_err();

        match err {
            ContainmentError::CommandFailed { stderr, .. } => assert_eq!(stderr, "nope"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_success_returns_stdout() {
        let out = run_tool(Path::new("sh"), &["-c".to_string(), "echo ok".to_string()])
            .await
            .unwrap();
        assert_eq!(out.trim(), "ok");
    }
}
