use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use gt_core::routes::Routes;
use gt_core::types::{Bead, BeadId, BeadStatus, BeadType, DepEdge, EdgeType};

use crate::store::{
    BeadPatch, BeadStore, MoleculeBond, NewBead, Result, StoreError, StoreScope,
};

// ---------------------------------------------------------------------------
// Environment handling
// ---------------------------------------------------------------------------

/// Deduplicate an env var list so only the first entry per key survives.
///
/// Child processes use first-match-wins semantics, so a duplicated
/// `BD_DOLT_AUTO_COMMIT` would shadow whichever value the caller intended.
pub fn dedup_env(pairs: Vec<(String, String)>) -> Vec<(String, String)> {
    let mut seen: Vec<String> = Vec::new();
    let mut out = Vec::with_capacity(pairs.len());
    for (key, value) in pairs {
        if seen.iter().any(|k| k == &key) {
            continue;
        }
        seen.push(key.clone());
        out.push((key, value));
    }
    out
}

// ---------------------------------------------------------------------------
// Raw JSON shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawBead {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    issue_type: String,
    #[serde(default)]
    assignee: String,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct RawDep {
    from: String,
    to: String,
    #[serde(alias = "dep_type", alias = "type")]
    edge_type: String,
}

#[derive(Debug, Deserialize)]
struct RawMolecule {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RawBond {
    #[serde(alias = "molecule_id")]
    id: String,
    root: String,
}

// ---------------------------------------------------------------------------
// BdCli
// ---------------------------------------------------------------------------

/// Production [`BeadStore`] backed by the `bd` CLI.
///
/// `bd` is CWD-sensitive: id-addressed calls run in the owning store's
/// directory (resolved through the prefix map), town-level calls in the town
/// root. Every write passes `BD_DOLT_AUTO_COMMIT=on`.
#[derive(Debug, Clone)]
pub struct BdCli {
    town_root: PathBuf,
    routes: Routes,
    /// Added to the child env as `GT_ROOT` only when non-empty.
    gt_root: String,
    status_timeout: Duration,
    op_timeout: Duration,
}

impl BdCli {
    pub fn new(town_root: impl Into<PathBuf>, routes: Routes) -> Self {
        let town_root = town_root.into();
        let gt_root = town_root.display().to_string();
        Self {
            town_root,
            routes,
            gt_root,
            status_timeout: Duration::from_secs(10),
            op_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeouts(mut self, status: Duration, op: Duration) -> Self {
        self.status_timeout = status;
        self.op_timeout = op;
        self
    }

    /// Owning store directory for an id: the rig path when the prefix is
    /// registered, otherwise the town root.
    fn store_dir_for(&self, id: &BeadId) -> PathBuf {
        self.routes
            .resolve(id)
            .map(|rig| rig.path.clone())
            .unwrap_or_else(|| self.town_root.clone())
    }

    fn scope_dir(&self, scope: &StoreScope) -> PathBuf {
        match scope {
            StoreScope::Town => self.town_root.clone(),
            StoreScope::Rig(name) => self
                .routes
                .rig_by_name(name)
                .map(|rig| rig.path.clone())
                .unwrap_or_else(|| self.town_root.clone()),
        }
    }

    fn child_env(&self, write: bool) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if write {
            pairs.push(("BD_DOLT_AUTO_COMMIT".to_string(), "on".to_string()));
        }
        if !self.gt_root.is_empty() {
            pairs.push(("GT_ROOT".to_string(), self.gt_root.clone()));
        }
        dedup_env(pairs)
    }

    async fn run(&self, cwd: &Path, args: &[String], write: bool) -> Result<String> {
        let timeout = if write {
            self.op_timeout
        } else {
            self.status_timeout
        };

        let mut cmd = tokio::process::Command::new("bd");
        cmd.args(args).current_dir(cwd);
        for (key, value) in self.child_env(write) {
            cmd.env(key, value);
        }

        debug!(?args, cwd = %cwd.display(), write, "bd invocation");

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| StoreError::Timeout(timeout.as_secs()))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(StoreError::Command(stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn parse_beads(&self, raw: &str) -> Result<Vec<Bead>> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        let items: Vec<RawBead> =
            serde_json::from_str(trimmed).map_err(|e| StoreError::Json(e.to_string()))?;
        Ok(items.into_iter().map(|r| self.to_bead(r)).collect())
    }

    fn to_bead(&self, raw: RawBead) -> Bead {
        let id = BeadId::new(raw.id);
        let rig = self.routes.rig_name_for(&id);
        Bead {
            id,
            title: raw.title,
            bead_type: BeadType::parse(&raw.issue_type),
            status: BeadStatus::parse(&raw.status),
            assignee: raw.assignee,
            labels: raw.labels,
            description: raw.description,
            rig,
        }
    }
}

fn is_not_found(err: &StoreError) -> bool {
    matches!(err, StoreError::Command(stderr) if stderr.contains("not found"))
}

#[async_trait]
impl BeadStore for BdCli {
    async fn show(&self, id: &BeadId) -> Result<Bead> {
        let dir = self.store_dir_for(id);
        let args = vec!["show".to_string(), id.to_string(), "--json".to_string()];
        let out = match self.run(&dir, &args, false).await {
            Ok(out) => out,
            Err(e) if is_not_found(&e) => return Err(StoreError::NotFound(id.clone())),
            Err(e) => return Err(e),
        };
        self.parse_beads(&out)?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn exists(&self, id: &BeadId) -> Result<bool> {
        let dir = self.store_dir_for(id);
        let args = vec![
            "show".to_string(),
            id.to_string(),
            "--json".to_string(),
            "--allow-stale".to_string(),
        ];
        match self.run(&dir, &args, false).await {
            Ok(out) => Ok(!self.parse_beads(&out)?.is_empty()),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn children(&self, id: &BeadId) -> Result<Vec<Bead>> {
        let dir = self.store_dir_for(id);
        let args = vec![
            "list".to_string(),
            format!("--parent={id}"),
            "--json".to_string(),
        ];
        let out = self.run(&dir, &args, false).await?;
        self.parse_beads(&out)
    }

    async fn deps_out(&self, id: &BeadId) -> Result<Vec<DepEdge>> {
        let dir = self.store_dir_for(id);
        let args = vec![
            "dep".to_string(),
            "list".to_string(),
            id.to_string(),
            "--direction=down".to_string(),
            "--json".to_string(),
        ];
        let out = self.run(&dir, &args, false).await?;
        let trimmed = out.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        let items: Vec<RawDep> =
            serde_json::from_str(trimmed).map_err(|e| StoreError::Json(e.to_string()))?;
        Ok(items
            .into_iter()
            .map(|r| DepEdge {
                from: BeadId::new(r.from),
                to: BeadId::new(r.to),
                edge_type: EdgeType::parse(&r.edge_type),
            })
            .collect())
    }

    async fn list_convoys(&self) -> Result<Vec<Bead>> {
        let args = vec![
            "list".to_string(),
            "--type=convoy".to_string(),
            "--all".to_string(),
            "--json".to_string(),
        ];
        let out = self.run(&self.town_root, &args, false).await?;
        self.parse_beads(&out)
    }

    async fn list_by_type(&self, scope: StoreScope, bead_type: &BeadType) -> Result<Vec<Bead>> {
        let dir = self.scope_dir(&scope);
        let args = vec![
            "list".to_string(),
            format!("--type={}", bead_type.as_str()),
            "--all".to_string(),
            "--json".to_string(),
        ];
        let out = self.run(&dir, &args, false).await?;
        self.parse_beads(&out)
    }

    async fn tracked_beads(&self, convoy: &BeadId) -> Result<Vec<BeadId>> {
        let dir = self.store_dir_for(convoy);
        let args = vec![
            "dep".to_string(),
            "list".to_string(),
            convoy.to_string(),
            "--direction=down".to_string(),
            "--type=tracks".to_string(),
            "--json".to_string(),
        ];
        let out = self.run(&dir, &args, false).await?;
        let trimmed = out.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        let items: Vec<RawDep> =
            serde_json::from_str(trimmed).map_err(|e| StoreError::Json(e.to_string()))?;
        Ok(items.into_iter().map(|r| BeadId::new(r.to)).collect())
    }

    async fn create_bead(&self, scope: StoreScope, new: NewBead) -> Result<()> {
        let dir = self.scope_dir(&scope);
        let mut args = vec![
            "create".to_string(),
            format!("--id={}", new.id),
            format!("--type={}", new.bead_type.as_str()),
            format!("--title={}", new.title),
            format!("--status={}", new.status.as_str()),
        ];
        if !new.assignee.is_empty() {
            args.push(format!("--assignee={}", new.assignee));
        }
        for label in &new.labels {
            args.push(format!("--label={label}"));
        }
        if !new.description.is_empty() {
            args.push(format!("--description={}", new.description));
        }
        self.run(&dir, &args, true).await?;
        Ok(())
    }

    async fn update_bead(&self, id: &BeadId, patch: BeadPatch) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }
        let dir = self.store_dir_for(id);
        let mut args = vec!["update".to_string(), id.to_string()];
        if let Some(status) = &patch.status {
            args.push(format!("--status={}", status.as_str()));
        }
        if let Some(assignee) = &patch.assignee {
            args.push(format!("--assignee={assignee}"));
        }
        if let Some(title) = &patch.title {
            args.push(format!("--title={title}"));
        }
        if let Some(description) = &patch.description {
            args.push(format!("--description={description}"));
        }
        self.run(&dir, &args, true).await?;
        Ok(())
    }

    async fn dep_add(&self, from: &BeadId, to: &BeadId, edge_type: &EdgeType) -> Result<()> {
        let dir = self.store_dir_for(from);
        let args = vec![
            "dep".to_string(),
            "add".to_string(),
            from.to_string(),
            to.to_string(),
            format!("--type={}", edge_type.as_str()),
        ];
        self.run(&dir, &args, true).await?;
        Ok(())
    }

    async fn dep_remove(&self, from: &BeadId, to: &BeadId, edge_type: &EdgeType) -> Result<()> {
        let dir = self.store_dir_for(from);
        let args = vec![
            "dep".to_string(),
            "remove".to_string(),
            from.to_string(),
            to.to_string(),
            format!("--type={}", edge_type.as_str()),
        ];
        self.run(&dir, &args, true).await?;
        Ok(())
    }

    async fn label_add(&self, id: &BeadId, label: &str) -> Result<()> {
        let dir = self.store_dir_for(id);
        let args = vec![
            "label".to_string(),
            "add".to_string(),
            id.to_string(),
            label.to_string(),
        ];
        self.run(&dir, &args, true).await?;
        Ok(())
    }

    async fn label_remove(&self, id: &BeadId, label: &str) -> Result<()> {
        let dir = self.store_dir_for(id);
        let args = vec![
            "label".to_string(),
            "remove".to_string(),
            id.to_string(),
            label.to_string(),
        ];
        self.run(&dir, &args, true).await?;
        Ok(())
    }

    async fn formula_exists(&self, name: &str) -> Result<bool> {
        let args = vec![
            "formula".to_string(),
            "show".to_string(),
            name.to_string(),
            "--json".to_string(),
        ];
        match self.run(&self.town_root, &args, false).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn cook_formula(&self, name: &str) -> Result<()> {
        let args = vec!["cook".to_string(), name.to_string()];
        self.run(&self.town_root, &args, true).await?;
        Ok(())
    }

    async fn instantiate_formula(
        &self,
        bead: &BeadId,
        formula: &str,
        vars: &[(String, String)],
    ) -> Result<MoleculeBond> {
        let dir = self.store_dir_for(bead);
        let mut args = vec![
            "mol".to_string(),
            "bond".to_string(),
            formula.to_string(),
            bead.to_string(),
        ];
        for (key, value) in vars {
            args.push(format!("--var={key}={value}"));
        }
        args.push("--json".to_string());
        let out = self.run(&dir, &args, true).await?;
        let bond: RawBond =
            serde_json::from_str(out.trim()).map_err(|e| StoreError::Json(e.to_string()))?;
        Ok(MoleculeBond {
            molecule: bond.id,
            root: BeadId::new(bond.root),
        })
    }

    async fn burn_molecule(&self, molecule: &str, bead: &BeadId) -> Result<()> {
        let dir = self.store_dir_for(bead);
        let args = vec![
            "mol".to_string(),
            "burn".to_string(),
            molecule.to_string(),
            format!("--bead={bead}"),
        ];
        self.run(&dir, &args, true).await?;
        Ok(())
    }

    async fn attached_molecules(&self, bead: &BeadId) -> Result<Vec<String>> {
        let dir = self.store_dir_for(bead);
        let args = vec![
            "mol".to_string(),
            "list".to_string(),
            bead.to_string(),
            "--json".to_string(),
        ];
        let out = self.run(&dir, &args, false).await?;
        let trimmed = out.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        let items: Vec<RawMolecule> =
            serde_json::from_str(trimmed).map_err(|e| StoreError::Json(e.to_string()))?;
        Ok(items.into_iter().map(|m| m.id).collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use gt_core::routes::RigInfo;

    #[test]
    fn dedup_env_keeps_first_occurrence() {
        let pairs = vec![
            ("BD_DOLT_AUTO_COMMIT".to_string(), "on".to_string()),
            ("GT_ROOT".to_string(), "/town".to_string()),
            ("BD_DOLT_AUTO_COMMIT".to_string(), "off".to_string()),
        ];
        let deduped = dedup_env(pairs);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0], ("BD_DOLT_AUTO_COMMIT".to_string(), "on".to_string()));
        assert_eq!(deduped[1].0, "GT_ROOT");
    }

    #[test]
    fn gt_root_omitted_when_empty() {
        let mut cli = BdCli::new("/town", Routes::new());
        cli.gt_root = String::new();
        let env = cli.child_env(true);
        assert!(env.iter().all(|(k, _)| k != "GT_ROOT"));
        assert!(env.iter().any(|(k, _)| k == "BD_DOLT_AUTO_COMMIT"));
    }

    #[test]
    fn reads_carry_no_auto_commit() {
        let cli = BdCli::new("/town", Routes::new());
        let env = cli.child_env(false);
        assert!(env.iter().all(|(k, _)| k != "BD_DOLT_AUTO_COMMIT"));
    }

    #[test]
    fn store_dir_routes_by_prefix() {
        let mut routes = Routes::new();
        routes.register(
            "bx",
            RigInfo {
                name: "boxcar".into(),
                path: PathBuf::from("/town/rigs/boxcar"),
            },
        );
        let cli = BdCli::new("/town", routes);
        assert_eq!(
            cli.store_dir_for(&BeadId::from("bx-00001")),
            PathBuf::from("/town/rigs/boxcar")
        );
        // Unregistered prefixes fall back to the town store.
        assert_eq!(
            cli.store_dir_for(&BeadId::from("hq-cv-abc12")),
            PathBuf::from("/town")
        );
    }

    #[test]
    fn parse_beads_tolerates_empty_output() {
        let cli = BdCli::new("/town", Routes::new());
        assert!(cli.parse_beads("").expect("empty").is_empty());
        assert!(cli.parse_beads("[]").expect("empty array").is_empty());
    }

    #[test]
    fn parse_beads_reads_show_shape() {
        let cli = BdCli::new("/town", Routes::new());
        let raw = r#"[{"id":"gt-abc12","title":"Fix flaky test","status":"open","issue_type":"bug","assignee":"","labels":["ci"]}]"#;
        let beads = cli.parse_beads(raw).expect("parse");
        assert_eq!(beads.len(), 1);
        assert_eq!(beads[0].bead_type, BeadType::Bug);
        assert_eq!(beads[0].status, BeadStatus::Open);
        assert!(beads[0].has_label("ci"));
    }
}
