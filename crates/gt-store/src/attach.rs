use gt_core::types::{AttachmentFields, SlingMode};

// ---------------------------------------------------------------------------
// Attachment block codec
// ---------------------------------------------------------------------------

const BLOCK_HEADER: &str = "--- attachment ---";
const BLOCK_FOOTER: &str = "--- end attachment ---";

/// Render the attachment block, appending unknown keys from a previous
/// decode.
pub fn encode_attachment(fields: &AttachmentFields, extras: &[(String, String)]) -> String {
    let mut lines = vec![BLOCK_HEADER.to_string()];
    if !fields.dispatcher.is_empty() {
        lines.push(format!("dispatcher: {}", fields.dispatcher));
    }
    if !fields.args.is_empty() {
        lines.push(format!("args: {}", fields.args));
    }
    if !fields.molecule.is_empty() {
        lines.push(format!("molecule: {}", fields.molecule));
    }
    if fields.no_merge {
        lines.push("no-merge: true".to_string());
    }
    if fields.mode != SlingMode::Normal {
        lines.push(format!("mode: {}", fields.mode.as_str()));
    }
    for (key, value) in extras {
        lines.push(format!("{key}: {value}"));
    }
    lines.push(BLOCK_FOOTER.to_string());
    lines.join("\n")
}

/// Extract the attachment block from a description. Returns the parsed
/// known fields and any unknown keys found in the block.
pub fn decode_attachment(description: &str) -> Option<(AttachmentFields, Vec<(String, String)>)> {
    let mut in_block = false;
    let mut saw_block = false;
    let mut fields = AttachmentFields::default();
    let mut extras = Vec::new();

    for line in description.lines() {
        let trimmed = line.trim();
        if trimmed == BLOCK_HEADER {
            in_block = true;
            saw_block = true;
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
            "dispatcher" => fields.dispatcher = value.to_string(),
            "args" => fields.args = value.to_string(),
            "molecule" => fields.molecule = value.to_string(),
            "no-merge" => fields.no_merge = value == "true",
            "mode" => fields.mode = SlingMode::parse(value),
            _ => extras.push((key.to_string(), value.to_string())),
        }
    }

    saw_block.then_some((fields, extras))
}

/// Rewrite the attachment block inside a description, preserving the
/// surrounding free text and any unknown keys of an existing block. When no
/// block exists the new one is appended.
pub fn upsert_attachment(description: &str, fields: &AttachmentFields) -> String {
    let extras = decode_attachment(description)
        .map(|(_, extras)| extras)
        .unwrap_or_default();
    let block = encode_attachment(fields, &extras);

    let mut out = Vec::new();
    let mut in_block = false;
    let mut replaced = false;
    for line in description.lines() {
        let trimmed = line.trim();
        if trimmed == BLOCK_HEADER {
            in_block = true;
            if !replaced {
                out.push(block.clone());
                replaced = true;
            }
            continue;
        }
        if trimmed == BLOCK_FOOTER {
            in_block = false;
            continue;
        }
        if !in_block {
            out.push(line.to_string());
        }
    }

    if !replaced {
        if !description.trim().is_empty() {
            out.push(String::new());
        }
        out.push(block);
    }
    out.join("\n")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AttachmentFields {
        AttachmentFields {
            dispatcher: "crew/dave".into(),
            args: "--fast".into(),
            molecule: "mol-7fk2".into(),
            no_merge: true,
            mode: SlingMode::Ralph,
        }
    }

    #[test]
    fn round_trip() {
        let fields = sample();
        let block = encode_attachment(&fields, &[]);
        let (back, extras) = decode_attachment(&block).expect("decode");
        assert_eq!(back, fields);
        assert!(extras.is_empty());
    }

    #[test]
    fn upsert_replaces_existing_block_preserving_text() {
        let original = format!(
            "Fix the flaky CI gate.\n\n{}\n\nSee also gt-def34.",
            encode_attachment(&sample(), &[])
        );
        let mut updated_fields = sample();
        updated_fields.molecule = "mol-9xx1".into();

        let updated = upsert_attachment(&original, &updated_fields);
        assert!(updated.contains("Fix the flaky CI gate."));
        assert!(updated.contains("See also gt-def34."));
        assert!(updated.contains("molecule: mol-9xx1"));
        assert!(!updated.contains("mol-7fk2"));
        // Still exactly one block.
        assert_eq!(updated.matches(BLOCK_HEADER).count(), 1);
    }

    #[test]
    fn upsert_appends_when_absent() {
        let updated = upsert_attachment("Plain description.", &sample());
        assert!(updated.starts_with("Plain description."));
        assert!(updated.contains(BLOCK_HEADER));
        let (back, _) = decode_attachment(&updated).expect("decode");
        assert_eq!(back.dispatcher, "crew/dave");
    }

    #[test]
    fn unknown_keys_survive_upsert() {
        let mut block = encode_attachment(&sample(), &[]);
        block = block.replace(
            BLOCK_FOOTER,
            &format!("handoff-token: abc\n{BLOCK_FOOTER}"),
        );
        let updated = upsert_attachment(&block, &AttachmentFields::default());
        assert!(updated.contains("handoff-token: abc"));
    }

    #[test]
    fn no_block_decodes_to_none() {
        assert!(decode_attachment("just prose").is_none());
    }

    #[test]
    fn default_fields_render_minimal_block() {
        let block = encode_attachment(&AttachmentFields::default(), &[]);
        let lines: Vec<&str> = block.lines().collect();
        assert_eq!(lines, vec![BLOCK_HEADER, BLOCK_FOOTER]);
    }
}
