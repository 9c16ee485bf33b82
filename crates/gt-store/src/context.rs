use chrono::{DateTime, Utc};
use rand::Rng;

use gt_core::types::{
    BeadId, BeadStatus, BeadType, MergeStrategy, SlingContext, SlingMode,
};

use crate::store::{BeadStore, NewBead, Result, StoreError, StoreScope};

// ---------------------------------------------------------------------------
// Block codec
// ---------------------------------------------------------------------------

const BLOCK_HEADER: &str = "--- sling-context v1 ---";
const BLOCK_FOOTER: &str = "--- end sling-context ---";

/// Encode a sling context as the versioned description block.
///
/// `extras` carries unknown keys from a previous decode so re-encoding
/// round-trips them.
pub fn encode_context(ctx: &SlingContext, extras: &[(String, String)]) -> String {
    let mut lines = vec![BLOCK_HEADER.to_string()];
    lines.push(format!("work: {}", ctx.work_bead));
    lines.push(format!("rig: {}", ctx.target_rig));
    lines.push(format!("enqueued-at: {}", ctx.enqueued_at.to_rfc3339()));
    if let Some(formula) = &ctx.formula {
        lines.push(format!("formula: {formula}"));
    }
    if let Some(args) = &ctx.args {
        lines.push(format!("args: {args}"));
    }
    for (key, value) in &ctx.vars {
        lines.push(format!("var: {key}={value}"));
    }
    if let Some(merge) = &ctx.merge {
        lines.push(format!("merge: {}", merge.as_str()));
    }
    if let Some(branch) = &ctx.base_branch {
        lines.push(format!("base-branch: {branch}"));
    }
    if let Some(account) = &ctx.account {
        lines.push(format!("account: {account}"));
    }
    if let Some(agent) = &ctx.agent_override {
        lines.push(format!("agent: {agent}"));
    }
    if ctx.no_merge {
        lines.push("no-merge: true".to_string());
    }
    if ctx.hook_raw {
        lines.push("hook-raw: true".to_string());
    }
    if ctx.mode != SlingMode::Normal {
        lines.push(format!("mode: {}", ctx.mode.as_str()));
    }
    if ctx.owned {
        lines.push("owned: true".to_string());
    }
    if let Some(convoy) = &ctx.convoy {
        lines.push(format!("convoy: {convoy}"));
    }
    for (key, value) in extras {
        lines.push(format!("{key}: {value}"));
    }
    lines.push(BLOCK_FOOTER.to_string());
    lines.join("\n")
}

/// Decode the sling-context block out of a bead description.
///
/// Unknown keys are collected rather than rejected; the known set is parsed
/// strictly.
pub fn decode_context(description: &str) -> Result<(SlingContext, Vec<(String, String)>)> {
    let mut in_block = false;
    let mut work: Option<BeadId> = None;
    let mut rig = String::new();
    let mut enqueued_at: Option<DateTime<Utc>> = None;
    let mut ctx_fields: Vec<(String, String)> = Vec::new();

    for line in description.lines() {
        let trimmed = line.trim();
        if trimmed == BLOCK_HEADER {
            in_block = true;
            continue;
        }
        if trimmed == BLOCK_FOOTER {
            in_block = false;
            continue;
        }
        if !in_block {
            continue;
        }
        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        match key {
            "work" => work = Some(BeadId::new(value)),
            "rig" => rig = value.to_string(),
            "enqueued-at" => {
                let parsed = DateTime::parse_from_rfc3339(value)
                    .map_err(|e| StoreError::Json(format!("enqueued-at: {e}")))?;
                enqueued_at = Some(parsed.with_timezone(&Utc));
            }
            _ => ctx_fields.push((key.to_string(), value.to_string())),
        }
    }

    let work = work.ok_or_else(|| StoreError::Json("sling-context block missing work".into()))?;
    if rig.is_empty() {
        return Err(StoreError::Json("sling-context block missing rig".into()));
    }

    let mut ctx = SlingContext::new(work, rig);
    if let Some(at) = enqueued_at {
        ctx.enqueued_at = at;
    }

    let mut extras = Vec::new();
    for (key, value) in ctx_fields {
        match key.as_str() {
            "formula" => ctx.formula = Some(value),
            "args" => ctx.args = Some(value),
            "var" => {
                if let Some((k, v)) = value.split_once('=') {
                    ctx.vars.push((k.to_string(), v.to_string()));
                }
            }
            "merge" => ctx.merge = MergeStrategy::parse(&value),
            "base-branch" => ctx.base_branch = Some(value),
            "account" => ctx.account = Some(value),
            "agent" => ctx.agent_override = Some(value),
            "no-merge" => ctx.no_merge = value == "true",
            "hook-raw" => ctx.hook_raw = value == "true",
            "mode" => ctx.mode = SlingMode::parse(&value),
            "owned" => ctx.owned = value == "true",
            "convoy" => ctx.convoy = Some(BeadId::new(value)),
            _ => extras.push((key, value)),
        }
    }

    Ok((ctx, extras))
}

// ---------------------------------------------------------------------------
// Store operations
// ---------------------------------------------------------------------------

/// Generate a fresh sling-context bead id in the town namespace.
pub fn new_context_id() -> BeadId {
    BeadId::new(format!("hq-sc-{}", random_suffix()))
}

pub(crate) fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..5)
        .map(|_| {
            let idx = rng.gen_range(0..36u8);
            if idx < 10 {
                (b'0' + idx) as char
            } else {
                (b'a' + idx - 10) as char
            }
        })
        .collect()
}

/// All open sling contexts in the town store, decoded.
///
/// Any read or decode failure propagates; callers on the scheduling path
/// treat that as "assume scheduled" (fail closed).
pub async fn open_contexts(
    store: &dyn BeadStore,
) -> Result<Vec<(BeadId, SlingContext)>> {
    let beads = store
        .list_by_type(StoreScope::Town, &BeadType::SlingContext)
        .await?;
    let mut out = Vec::new();
    for bead in beads {
        if bead.status != BeadStatus::Open {
            continue;
        }
        let (ctx, _) = decode_context(&bead.description)?;
        out.push((bead.id, ctx));
    }
    Ok(out)
}

/// Persist a new sling context as a single atomic write. Returns the
/// context bead id.
pub async fn create_context(store: &dyn BeadStore, ctx: &SlingContext) -> Result<BeadId> {
    let id = new_context_id();
    let mut new = NewBead::new(
        id.clone(),
        format!("Sling {} -> {}", ctx.work_bead, ctx.target_rig),
        BeadType::SlingContext,
    );
    new.status = BeadStatus::Open;
    new.description = encode_context(ctx, &[]);
    store.create_bead(StoreScope::Town, new).await?;
    Ok(id)
}

/// Close a context bead (dispatched or cancelled).
pub async fn close_context(store: &dyn BeadStore, id: &BeadId) -> Result<()> {
    store
        .update_bead(id, crate::store::BeadPatch::status(BeadStatus::Closed))
        .await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn full_context() -> SlingContext {
        let mut ctx = SlingContext::new(BeadId::from("gt-abc12"), "gastown");
        ctx.formula = Some("mol-polish".into());
        ctx.args = Some("--fast".into());
        ctx.vars = vec![("BRANCH".into(), "main".into()), ("DEPTH".into(), "2".into())];
        ctx.merge = Some(MergeStrategy::Mr);
        ctx.base_branch = Some("main".into());
        ctx.account = Some("ops".into());
        ctx.agent_override = Some("crew/dave".into());
        ctx.no_merge = true;
        ctx.hook_raw = true;
        ctx.mode = SlingMode::Ralph;
        ctx.owned = true;
        ctx.convoy = Some(BeadId::from("hq-cv-xyz99"));
        ctx
    }

    #[test]
    fn round_trips_every_field() {
        let ctx = full_context();
        let block = encode_context(&ctx, &[]);
        let (back, extras) = decode_context(&block).expect("decode");
        assert_eq!(back, ctx);
        assert!(extras.is_empty());
    }

    #[test]
    fn minimal_context_round_trips() {
        let ctx = SlingContext::new(BeadId::from("bx-00001"), "boxcar");
        let block = encode_context(&ctx, &[]);
        let (back, _) = decode_context(&block).expect("decode");
        assert_eq!(back, ctx);
    }

    #[test]
    fn unknown_keys_survive_re_encode() {
        let ctx = SlingContext::new(BeadId::from("gt-abc12"), "gastown");
        let mut block = encode_context(&ctx, &[]);
        block = block.replace(
            BLOCK_FOOTER,
            &format!("future-knob: seventeen\n{BLOCK_FOOTER}"),
        );

        let (back, extras) = decode_context(&block).expect("decode");
        assert_eq!(extras, vec![("future-knob".to_string(), "seventeen".to_string())]);

        let re = encode_context(&back, &extras);
        let (_, extras2) = decode_context(&re).expect("re-decode");
        assert_eq!(extras2, extras);
    }

    #[test]
    fn block_embedded_in_free_text_decodes() {
        let ctx = SlingContext::new(BeadId::from("gt-abc12"), "gastown");
        let description = format!(
            "Queued while the rig was busy.\n\n{}\n\ntrailing notes",
            encode_context(&ctx, &[])
        );
        let (back, _) = decode_context(&description).expect("decode");
        assert_eq!(back.work_bead, ctx.work_bead);
        assert_eq!(back.target_rig, "gastown");
    }

    #[test]
    fn missing_work_is_an_error() {
        let bad = format!("{BLOCK_HEADER}\nrig: gastown\n{BLOCK_FOOTER}");
        assert!(decode_context(&bad).is_err());
    }

    #[test]
    fn context_ids_are_town_scoped() {
        let id = new_context_id();
        assert!(id.as_str().starts_with("hq-sc-"));
        assert_eq!(id.as_str().len(), "hq-sc-".len() + 5);
    }
}
