use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use gt_core::types::{BeadId, BeadType};

use crate::context::random_suffix;
use crate::store::{BeadStore, NewBead, StoreScope};

// ---------------------------------------------------------------------------
// ShutdownNotice
// ---------------------------------------------------------------------------

/// Payload of the one message the executor ever mails: a high-priority
/// `LIFECYCLE:Shutdown` to a rig's witness when force-preempting a live
/// polecat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownNotice {
    /// Caller context of the sling that triggered the preemption.
    pub caller: String,
    pub work_bead: BeadId,
    pub new_assignee: String,
    /// Always `work_reassigned` for dispatch-core preemptions.
    pub reason: String,
}

impl ShutdownNotice {
    pub fn work_reassigned(
        caller: impl Into<String>,
        work_bead: BeadId,
        new_assignee: impl Into<String>,
    ) -> Self {
        Self {
            caller: caller.into(),
            work_bead,
            new_assignee: new_assignee.into(),
            reason: "work_reassigned".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sending
// ---------------------------------------------------------------------------

/// Address of a rig's witness agent.
pub fn witness_address(rig: &str) -> String {
    format!("{rig}/witness")
}

/// Send a `LIFECYCLE:Shutdown` to the rig's witness.
///
/// Delivery is best-effort: a failed send is logged and swallowed, and the
/// caller proceeds either way. A short drain wait gives the notification
/// pump a chance to pick the message up before the new polecat lands.
pub async fn send_shutdown(store: &dyn BeadStore, rig: &str, notice: &ShutdownNotice) {
    let id = BeadId::new(format!("hq-msg-{}", random_suffix()));
    let payload = match serde_json::to_string_pretty(notice) {
        Ok(p) => p,
        Err(e) => {
            warn!(rig, error = %e, "shutdown notice encode failed; skipping send");
            return;
        }
    };

    let mut new = NewBead::new(id, "LIFECYCLE:Shutdown", BeadType::Message);
    new.assignee = witness_address(rig);
    new.labels = vec!["priority:high".to_string()];
    new.description = payload;

    match store.create_bead(StoreScope::Town, new).await {
        Ok(()) => {
            // Pending-notification drain window.
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        Err(e) => {
            warn!(rig, error = %e, "shutdown notice send failed (best-effort)");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn witness_address_shape() {
        assert_eq!(witness_address("gastown"), "gastown/witness");
    }

    #[test]
    fn notice_serializes_reason() {
        let notice = ShutdownNotice::work_reassigned(
            "cli",
            BeadId::from("gt-abc12"),
            "gastown/polecats/rictus",
        );
        let json = serde_json::to_string(&notice).expect("serialize");
        assert!(json.contains("work_reassigned"));
        assert!(json.contains("gt-abc12"));
    }
}
