//! Shared fixtures for dispatch integration tests: an in-memory store, a
//! mock provisioner, and a scriptable session host.
#![allow(dead_code)]

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use gt_core::config::TownConfig;
use gt_core::env::TownEnv;
use gt_core::routes::{RigInfo, Routes};
use gt_rig::provision::{
    PolecatProvisioner, ProvisionError, ProvisionedPolecat, SpawnOpts,
};
use gt_rig::session::SessionHost;
use gt_store::memory::MemStore;

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// A town with two rigs: `gastown` (prefix `gt`) and `boxcar` (prefix `bx`).
pub fn test_env(town_root: &Path) -> TownEnv {
    let mut routes = Routes::new();
    routes.register(
        "gt",
        RigInfo {
            name: "gastown".into(),
            path: town_root.join("rigs/gastown"),
        },
    );
    routes.register(
        "bx",
        RigInfo {
            name: "boxcar".into(),
            path: town_root.join("rigs/boxcar"),
        },
    );
    std::fs::create_dir_all(town_root.join("rigs/gastown")).expect("mkdir gastown");
    std::fs::create_dir_all(town_root.join("rigs/boxcar")).expect("mkdir boxcar");

    let mut config = TownConfig::default();
    // Keep tests fast.
    config.dispatch.inter_spawn_delay_ms = 0;
    config.dispatch.batch_spawn_delay_ms = 0;
    config.dispatch.batch_cooldown_ms = 0;

    TownEnv::with_parts(town_root.to_path_buf(), routes, config)
}

// ---------------------------------------------------------------------------
// MockSessionHost
// ---------------------------------------------------------------------------

/// Session host with a scriptable dead-set; everything else is alive.
#[derive(Default)]
pub struct MockSessionHost {
    dead: Mutex<BTreeSet<String>>,
}

impl MockSessionHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_dead(&self, session: &str) {
        self.dead.lock().expect("dead lock").insert(session.to_string());
    }
}

#[async_trait]
impl SessionHost for MockSessionHost {
    async fn is_alive(&self, session: &str) -> bool {
        !self.dead.lock().expect("dead lock").contains(session)
    }

    async fn start(&self, _session: &str, _cwd: &Path) -> std::io::Result<()> {
        Ok(())
    }

    async fn kill(&self, _session: &str) -> std::io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockProvisioner
// ---------------------------------------------------------------------------

/// Provisioner that hands out numbered polecats and journals branch,
/// session, and destroy calls into the store's op log.
pub struct MockProvisioner {
    store: Arc<MemStore>,
    counter: AtomicU64,
    pub fail_spawn: AtomicBool,
    pub fail_branch: AtomicBool,
    pub fail_session: AtomicBool,
}

impl MockProvisioner {
    pub fn new(store: Arc<MemStore>) -> Self {
        Self {
            store,
            counter: AtomicU64::new(0),
            fail_spawn: AtomicBool::new(false),
            fail_branch: AtomicBool::new(false),
            fail_session: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl PolecatProvisioner for MockProvisioner {
    async fn spawn_polecat_for_sling(
        &self,
        rig: &RigInfo,
        _opts: &SpawnOpts,
    ) -> Result<Box<dyn ProvisionedPolecat>, ProvisionError> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(ProvisionError::Git("simulated spawn failure".into()));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let name = format!("polecat-{n:02}");
        self.store.note(format!("spawn {name}"));
        Ok(Box::new(MockPolecat {
            name: name.clone(),
            rig: rig.name.clone(),
            clone_path: rig.path.join("polecats").join(&name),
            base_branch: "main".into(),
            dolt_branch: format!("polecat/{name}"),
            store: Arc::clone(&self.store),
            fail_branch: self.fail_branch.load(Ordering::SeqCst),
            fail_session: self.fail_session.load(Ordering::SeqCst),
        }))
    }
}

pub struct MockPolecat {
    name: String,
    rig: String,
    clone_path: PathBuf,
    base_branch: String,
    dolt_branch: String,
    store: Arc<MemStore>,
    fail_branch: bool,
    fail_session: bool,
}

#[async_trait]
impl ProvisionedPolecat for MockPolecat {
    fn name(&self) -> &str {
        &self.name
    }

    fn rig(&self) -> &str {
        &self.rig
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
        format!("{}/polecats/{}", self.rig, self.name)
    }

    async fn create_dolt_branch(&self) -> Result<(), ProvisionError> {
        if self.fail_branch {
            return Err(ProvisionError::Dolt("simulated branch failure".into()));
        }
        self.store.note(format!("branch {}", self.dolt_branch));
        Ok(())
    }

    async fn start_session(&self) -> Result<(), ProvisionError> {
        if self.fail_session {
            return Err(ProvisionError::Session("simulated session failure".into()));
        }
        self.store.note(format!("session gt-{}-{}", self.rig, self.name));
        Ok(())
    }

    async fn destroy(&self) -> Result<(), ProvisionError> {
        self.store.note(format!("destroy {}", self.name));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Log helpers
// ---------------------------------------------------------------------------

/// Index of the first op matching a prefix, for ordering assertions.
pub fn op_index(log: &[String], prefix: &str) -> Option<usize> {
    log.iter().position(|op| op.starts_with(prefix))
}
