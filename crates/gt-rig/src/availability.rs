use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use gt_core::routes::RigInfo;
use gt_core::types::{BeadId, RigAvailability};
use gt_store::{BeadStore, StoreError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RigError {
    #[error("wisp io: {0}")]
    Wisp(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, RigError>;

pub const PARKED_LABEL: &str = "status:parked";
pub const DOCKED_LABEL: &str = "status:docked";

/// Identity bead of a rig, kept in the town store.
pub fn identity_bead_id(rig_name: &str) -> BeadId {
    BeadId::new(format!("hq-rig-{rig_name}"))
}

// ---------------------------------------------------------------------------
// WispStore
// ---------------------------------------------------------------------------

/// Ephemeral per-rig key/value store at `<rig path>/.gastown/wisp.json`.
///
/// Lives with the rig checkout, outside the dolt-backed store, and is lost
/// when the checkout goes away. A missing file reads as empty.
#[derive(Debug, Clone)]
pub struct WispStore {
    path: PathBuf,
}

impl WispStore {
    pub fn for_rig(rig_path: &Path) -> Self {
        Self {
            path: rig_path.join(".gastown").join("wisp.json"),
        }
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read_all()?.get(key).cloned())
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut map = self.read_all()?;
        map.insert(key.to_string(), value.to_string());
        self.write_all(&map)
    }

    pub fn clear(&self, key: &str) -> Result<()> {
        let mut map = self.read_all()?;
        if map.remove(key).is_some() {
            self.write_all(&map)?;
        }
        Ok(())
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let text =
            std::fs::read_to_string(&self.path).map_err(|e| RigError::Wisp(e.to_string()))?;
        if text.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&text).map_err(|e| RigError::Wisp(e.to_string()))
    }

    fn write_all(&self, map: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RigError::Wisp(e.to_string()))?;
        }
        let text = serde_json::to_string_pretty(map).map_err(|e| RigError::Wisp(e.to_string()))?;
        std::fs::write(&self.path, text).map_err(|e| RigError::Wisp(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Availability
// ---------------------------------------------------------------------------

/// Read a rig's availability as the OR of both backing stores.
///
/// Parked may live in either the wisp or the identity-bead label; docked
/// only in the label. Docked wins when both are present. A missing identity
/// bead reads as unlabeled.
pub async fn rig_availability(store: &dyn BeadStore, rig: &RigInfo) -> Result<RigAvailability> {
    let labels = match store.show(&identity_bead_id(&rig.name)).await {
        Ok(bead) => bead.labels,
        Err(StoreError::NotFound(_)) => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    if labels.iter().any(|l| l == DOCKED_LABEL) {
        return Ok(RigAvailability::Docked);
    }
    if labels.iter().any(|l| l == PARKED_LABEL) {
        return Ok(RigAvailability::Parked);
    }

    let wisp = WispStore::for_rig(&rig.path);
    if wisp.get("status")?.as_deref() == Some("parked") {
        return Ok(RigAvailability::Parked);
    }
    Ok(RigAvailability::Active)
}

/// Park a rig: writes both the wisp and the persistent label.
pub async fn park(store: &dyn BeadStore, rig: &RigInfo) -> Result<()> {
    WispStore::for_rig(&rig.path).set("status", "parked")?;
    store
        .label_add(&identity_bead_id(&rig.name), PARKED_LABEL)
        .await?;
    Ok(())
}

/// Unpark clears both stores.
pub async fn unpark(store: &dyn BeadStore, rig: &RigInfo) -> Result<()> {
    WispStore::for_rig(&rig.path).set("status", "active")?;
    store
        .label_remove(&identity_bead_id(&rig.name), PARKED_LABEL)
        .await?;
    Ok(())
}

/// Dock writes only the persistent label.
pub async fn dock(store: &dyn BeadStore, rig: &RigInfo) -> Result<()> {
    store
        .label_add(&identity_bead_id(&rig.name), DOCKED_LABEL)
        .await?;
    Ok(())
}

pub async fn undock(store: &dyn BeadStore, rig: &RigInfo) -> Result<()> {
    store
        .label_remove(&identity_bead_id(&rig.name), DOCKED_LABEL)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use gt_core::types::{BeadStatus, BeadType};
    use gt_store::memory::MemStore;

    fn rig_at(path: &Path) -> RigInfo {
        RigInfo {
            name: "gastown".into(),
            path: path.to_path_buf(),
        }
    }

    fn seed_identity(store: &MemStore) {
        store.put_simple(
            identity_bead_id("gastown").as_str(),
            BeadType::Other("rig".into()),
            BeadStatus::Open,
            "",
        );
    }

    #[tokio::test]
    async fn fresh_rig_is_active() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = MemStore::new();
        seed_identity(&store);
        let avail = rig_availability(&store, &rig_at(tmp.path())).await.expect("read");
        assert_eq!(avail, RigAvailability::Active);
    }

    #[tokio::test]
    async fn park_is_visible_through_either_store() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = MemStore::new();
        seed_identity(&store);
        let rig = rig_at(tmp.path());

        park(&store, &rig).await.expect("park");

        // Label path.
        assert_eq!(
            rig_availability(&store, &rig).await.expect("read"),
            RigAvailability::Parked
        );

        // Strip the label; the wisp alone still reports parked.
        store
            .label_remove(&identity_bead_id("gastown"), PARKED_LABEL)
            .await
            .expect("label remove");
        assert_eq!(
            rig_availability(&store, &rig).await.expect("read"),
            RigAvailability::Parked
        );

        unpark(&store, &rig).await.expect("unpark");
        assert_eq!(
            rig_availability(&store, &rig).await.expect("read"),
            RigAvailability::Active
        );
    }

    #[tokio::test]
    async fn dock_writes_only_the_label() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = MemStore::new();
        seed_identity(&store);
        let rig = rig_at(tmp.path());

        dock(&store, &rig).await.expect("dock");
        assert_eq!(
            rig_availability(&store, &rig).await.expect("read"),
            RigAvailability::Docked
        );
        // The wisp never saw it.
        assert!(WispStore::for_rig(&rig.path).get("status").expect("wisp").is_none());

        undock(&store, &rig).await.expect("undock");
        assert_eq!(
            rig_availability(&store, &rig).await.expect("read"),
            RigAvailability::Active
        );
    }

    #[tokio::test]
    async fn missing_identity_bead_reads_unlabeled() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = MemStore::new();
        let avail = rig_availability(&store, &rig_at(tmp.path())).await.expect("read");
        assert_eq!(avail, RigAvailability::Active);
    }

    #[test]
    fn wisp_tolerates_missing_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let wisp = WispStore::for_rig(tmp.path());
        assert!(wisp.get("status").expect("get").is_none());
        wisp.clear("status").expect("clear of missing key");
    }
}
