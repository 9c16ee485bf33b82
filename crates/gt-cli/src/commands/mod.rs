pub mod dispatch;
pub mod launch;
pub mod rig;
pub mod schedule;
pub mod sling;
pub mod stage;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use gt_core::env::TownEnv;
use gt_core::types::BeadId;
use gt_dispatch::sling::SlingExecutor;
use gt_rig::provision::GitPolecatProvisioner;
use gt_rig::session::TmuxHost;
use gt_store::bd::BdCli;
use gt_store::BeadStore;

/// Resolve the town root: explicit flag, `GT_TOWN` env, or the cwd.
pub fn town_root(flag: Option<String>) -> PathBuf {
    if let Some(path) = flag {
        return PathBuf::from(path);
    }
    if let Ok(path) = std::env::var("GT_TOWN") {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

pub fn load_env(town: &PathBuf) -> anyhow::Result<TownEnv> {
    Ok(TownEnv::load(town.clone())?)
}

pub fn open_store(env: &TownEnv) -> Arc<dyn BeadStore> {
    let cli = BdCli::new(env.town_root.clone(), env.routes.clone()).with_timeouts(
        Duration::from_secs(env.config.timeouts.status_secs),
        Duration::from_secs(env.config.timeouts.op_secs),
    );
    Arc::new(cli)
}

pub fn build_executor(env: &TownEnv) -> SlingExecutor {
    let store = open_store(env);
    let host = Arc::new(TmuxHost);
    let provisioner = Arc::new(GitPolecatProvisioner::new(host.clone()));
    SlingExecutor::new(env.clone(), store, provisioner, host)
}

pub fn to_bead_ids(raw: &[String]) -> Vec<BeadId> {
    raw.iter().map(|s| BeadId::new(s.clone())).collect()
}

/// Split a `sling`/`schedule` positional list into beads and an optional
/// trailing target rig.
pub fn split_target(env: &TownEnv, args: &[String]) -> (Vec<BeadId>, Option<String>) {
    if args.len() >= 2 {
        if let Some(last) = args.last() {
            if env.routes.is_known_rig(last) {
                let beads = to_bead_ids(&args[..args.len() - 1]);
                return (beads, Some(last.clone()));
            }
        }
    }
    (to_bead_ids(args), None)
}

/// Parse repeated `--var k=v` bindings.
pub fn parse_vars(raw: &[String]) -> Vec<(String, String)> {
    raw.iter()
        .filter_map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect()
}

/// Surface an error: a JSON envelope plus exit code 1 in `--json` mode, a
/// plain anyhow error otherwise.
pub fn fail(json: bool, msg: impl Into<String>) -> anyhow::Result<()> {
    let msg = msg.into();
    if json {
        println!(
            "{}",
            serde_json::json!({ "status": "error", "error": msg })
        );
        std::process::exit(1);
    }
    anyhow::bail!(msg)
}
