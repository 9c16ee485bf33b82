use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

// ---------------------------------------------------------------------------
// Naming
// ---------------------------------------------------------------------------

/// Session name the multiplexer knows a polecat by.
pub fn session_name(rig: &str, polecat: &str) -> String {
    format!("gt-{rig}-{polecat}")
}

/// Agent address of a polecat, as recorded in bead assignees.
pub fn polecat_address(rig: &str, polecat: &str) -> String {
    format!("{rig}/polecats/{polecat}")
}

/// Split a polecat-style assignee back into `(rig, polecat)`.
///
/// Returns `None` for crew, witness, or any other address shape; the
/// dead-assignee auto-force only ever applies to polecats.
pub fn parse_polecat_address(assignee: &str) -> Option<(String, String)> {
    let mut parts = assignee.split('/');
    let rig = parts.next()?;
    let kind = parts.next()?;
    let name = parts.next()?;
    if kind != "polecats" || rig.is_empty() || name.is_empty() || parts.next().is_some() {
        return None;
    }
    Some((rig.to_string(), name.to_string()))
}

// ---------------------------------------------------------------------------
// SessionHost
// ---------------------------------------------------------------------------

/// The slice of the terminal-multiplexer contract the core consumes:
/// liveness checks, session start, session kill.
#[async_trait]
pub trait SessionHost: Send + Sync {
    async fn is_alive(&self, session: &str) -> bool;

    async fn start(&self, session: &str, cwd: &Path) -> std::io::Result<()>;

    async fn kill(&self, session: &str) -> std::io::Result<()>;
}

// ---------------------------------------------------------------------------
// TmuxHost
// ---------------------------------------------------------------------------

/// Production session host backed by `tmux`.
#[derive(Debug, Clone, Default)]
pub struct TmuxHost;

#[async_trait]
impl SessionHost for TmuxHost {
    async fn is_alive(&self, session: &str) -> bool {
        match tokio::process::Command::new("tmux")
            .args(["has-session", "-t", session])
            .output()
            .await
        {
            Ok(output) => output.status.success(),
            Err(_) => false,
        }
    }

    async fn start(&self, session: &str, cwd: &Path) -> std::io::Result<()> {
        debug!(session, cwd = %cwd.display(), "starting session");
        let output = tokio::process::Command::new("tmux")
            .args(["new-session", "-d", "-s", session, "-c"])
            .arg(cwd)
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(std::io::Error::other(stderr.to_string()));
        }
        Ok(())
    }

    async fn kill(&self, session: &str) -> std::io::Result<()> {
        let output = tokio::process::Command::new("tmux")
            .args(["kill-session", "-t", session])
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(std::io::Error::other(stderr.to_string()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
