//! Helpers for interpreting git CLI output.

use std::process::Output;

/// Formats a failed git invocation into a single error message, preferring
/// stderr over stdout over the bare exit status.
pub fn format_git_error(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stdout = stdout.trim();
    if !stdout.is_empty() {
        return stdout.to_string();
    }

    format!("exit code {}", output.status.code().unwrap_or(-1))
}

/// Whether a pull/merge left the tree unchanged.
pub fn is_already_up_to_date(stdout: &str) -> bool {
    stdout.contains("Already up to date") || stdout.contains("Already up-to-date")
}
