use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, warn};

use gt_core::routes::RigInfo;

use crate::session::{polecat_address, session_name, SessionHost};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("git command failed: {0}")]
    Git(String),
    #[error("dolt command failed: {0}")]
    Dolt(String),
    #[error("session start failed: {0}")]
    Session(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProvisionError>;

// ---------------------------------------------------------------------------
// SpawnOpts
// ---------------------------------------------------------------------------

/// Options the executor passes through to provisioning.
#[derive(Debug, Clone, Default)]
pub struct SpawnOpts {
    pub base_branch: Option<String>,
    pub account: Option<String>,
    pub agent_override: Option<String>,
    /// When set, the caller (the queue dispatcher) wakes rig supervisors
    /// itself; the provisioner must not boot anything beyond the session.
    pub no_boot: bool,
}

// ---------------------------------------------------------------------------
// ProvisionedPolecat
// ---------------------------------------------------------------------------

/// Handle to a freshly provisioned worker. Owned by the sling executor
/// through the pipeline; ownership passes to the session host once the
/// session is running.
#[async_trait]
pub trait ProvisionedPolecat: Send + Sync {
    fn name(&self) -> &str;
    fn rig(&self) -> &str;
    fn clone_path(&self) -> &Path;
    fn base_branch(&self) -> &str;
    fn dolt_branch(&self) -> &str;

    /// Agent address recorded as the bead assignee.
    fn agent_id(&self) -> String;

    async fn create_dolt_branch(&self) -> Result<()>;

    async fn start_session(&self) -> Result<()>;

    /// Tear down everything this polecat owns. Used on rollback.
    async fn destroy(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// PolecatProvisioner
// ---------------------------------------------------------------------------

/// The one provisioning operation the executor calls. Responsible for name
/// allocation, clone creation, environment seeding, and session naming; the
/// executor owns call ordering and rollback.
#[async_trait]
pub trait PolecatProvisioner: Send + Sync {
    async fn spawn_polecat_for_sling(
        &self,
        rig: &RigInfo,
        opts: &SpawnOpts,
    ) -> Result<Box<dyn ProvisionedPolecat>>;
}

// ---------------------------------------------------------------------------
// Name allocation
// ---------------------------------------------------------------------------

const POLECAT_NAMES: &[&str] = &[
    "ace", "buzzard", "dag", "furiosa", "nux", "rictus", "slit", "toast", "valkyrie", "warboy",
];

fn allocate_name(taken_under: &Path) -> String {
    let mut rng = rand::thread_rng();
    loop {
        let base = POLECAT_NAMES[rng.gen_range(0..POLECAT_NAMES.len())];
        let suffix: String = (0..2)
            .map(|_| (b'a' + rng.gen_range(0..26u8)) as char)
            .collect();
        let name = format!("{base}-{suffix}");
        if !taken_under.join(&name).exists() {
            return name;
        }
    }
}

// ---------------------------------------------------------------------------
// GitPolecatProvisioner
// ---------------------------------------------------------------------------

/// Production provisioner: a git worktree clone under
/// `<rig path>/polecats/<name>`, a dolt branch on the rig's store, and a
/// tmux session named `gt-<rig>-<name>`.
pub struct GitPolecatProvisioner {
    host: Arc<dyn SessionHost>,
}

impl GitPolecatProvisioner {
    pub fn new(host: Arc<dyn SessionHost>) -> Self {
        Self { host }
    }

    async fn default_branch(rig_path: &Path) -> String {
        let out = tokio::process::Command::new("git")
            .args(["symbolic-ref", "--short", "HEAD"])
            .current_dir(rig_path)
            .output()
            .await;
        match out {
            Ok(output) if output.status.success() => {
                String::from_utf8_lossy(&output.stdout).trim().to_string()
            }
            _ => "main".to_string(),
        }
    }
}

#[async_trait]
impl PolecatProvisioner for GitPolecatProvisioner {
    async fn spawn_polecat_for_sling(
        &self,
        rig: &RigInfo,
        opts: &SpawnOpts,
    ) -> Result<Box<dyn ProvisionedPolecat>> {
        let polecats_dir = rig.path.join("polecats");
        std::fs::create_dir_all(&polecats_dir)?;

        let name = allocate_name(&polecats_dir);
        let clone_path = polecats_dir.join(&name);
        let base_branch = match &opts.base_branch {
            Some(b) => b.clone(),
            None => Self::default_branch(&rig.path).await,
        };
        let work_branch = format!("polecat/{name}");

        let output = tokio::process::Command::new("git")
            .args(["worktree", "add", "-b", &work_branch])
            .arg(&clone_path)
            .arg(&base_branch)
            .current_dir(&rig.path)
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProvisionError::Git(stderr.to_string()));
        }

        // Seed the polecat's identity into its clone.
        let seed_dir = clone_path.join(".gastown");
        std::fs::create_dir_all(&seed_dir)?;
        std::fs::write(
            seed_dir.join("polecat.json"),
            serde_json::to_string_pretty(&serde_json::json!({
                "polecat": name,
                "rig": rig.name,
                "base_branch": base_branch,
            }))
            .unwrap_or_default(),
        )?;

        debug!(polecat = %name, rig = %rig.name, "polecat provisioned");

        Ok(Box::new(GitPolecat {
            rig: rig.clone(),
            name: name.clone(),
            clone_path,
            base_branch,
            dolt_branch: work_branch,
            session: session_name(&rig.name, &name),
            host: Arc::clone(&self.host),
        }))
    }
}

struct GitPolecat {
    rig: RigInfo,
    name: String,
    clone_path: PathBuf,
    base_branch: String,
    dolt_branch: String,
    session: String,
    host: Arc<dyn SessionHost>,
}

#[async_trait]
impl ProvisionedPolecat for GitPolecat {
    fn name(&self) -> &str {
        &self.name
    }

    fn rig(&self) -> &str {
        &self.rig.name
    }

    fn clone_path(&self) -> &Path {
        &self.clone_path
    }

    fn base_branch(&self) -> &str {
        &self.base_branch
    }

    fn dolt_branch(&self) -> &str {
        &self.dolt_branch
    }

    fn agent_id(&self) -> String {
        polecat_address(&self.rig.name, &self.name)
    }

    async fn create_dolt_branch(&self) -> Result<()> {
        let output = tokio::process::Command::new("dolt")
            .args(["branch", &self.dolt_branch])
            .current_dir(&self.rig.path)
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProvisionError::Dolt(stderr.to_string()));
        }
        Ok(())
    }

    async fn start_session(&self) -> Result<()> {
        self.host
            .start(&self.session, &self.clone_path)
            .await
            .map_err(|e| ProvisionError::Session(e.to_string()))
    }

    async fn destroy(&self) -> Result<()> {
        if let Err(e) = self.host.kill(&self.session).await {
            debug!(session = %self.session, error = %e, "session kill skipped");
        }

        let output = tokio::process::Command::new("git")
            .args(["worktree", "remove", "--force"])
            .arg(&self.clone_path)
            .current_dir(&self.rig.path)
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(polecat = %self.name, "worktree removal failed: {stderr}");
        }

        let output = tokio::process::Command::new("dolt")
            .args(["branch", "-D", &self.dolt_branch])
            .current_dir(&self.rig.path)
            .output()
            .await;
        if let Ok(out) = output {
            if !out.status.success() {
                debug!(branch = %self.dolt_branch, "dolt branch removal skipped");
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_names_avoid_existing_dirs() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let name = allocate_name(tmp.path());
        assert!(name.contains('-'));
        let (base, suffix) = name.split_once('-').expect("shape");
        assert!(POLECAT_NAMES.contains(&base));
        assert_eq!(suffix.len(), 2);
    }
}
