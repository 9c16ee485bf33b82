use std::path::PathBuf;
use std::sync::Arc;

use gt_core::types::StageStatus;
use gt_dispatch::convoy::ConvoyRegistry;
use gt_dispatch::stage::{StageOpts, Stager};

use super::{build_executor, fail, load_env, open_store, to_bead_ids};

pub async fn run(
    town: &PathBuf,
    ids: Vec<String>,
    title: Option<String>,
    launch: bool,
    json: bool,
) -> anyhow::Result<()> {
    let env = load_env(town)?;
    let store = open_store(&env);
    let stager = Stager::new(env.clone(), Arc::clone(&store));

    let bead_ids = to_bead_ids(&ids);
    let opts = StageOpts { title };

    let result = match stager.stage(&bead_ids, &opts).await {
        Ok(result) => result,
        Err(e) => return fail(json, e.to_string()),
    };

    if json && !launch {
        println!("{}", serde_json::to_string_pretty(&result)?);
        if result.status == StageStatus::Error {
            std::process::exit(1);
        }
        return Ok(());
    }

    if !json {
        match result.status {
            StageStatus::Error => {
                eprintln!("staging failed:");
                for finding in &result.errors {
                    eprintln!("  [{}] {}", finding.category, finding.message);
                    if !finding.suggested_fix.is_empty() {
                        eprintln!("        fix: {}", finding.suggested_fix);
                    }
                }
                std::process::exit(1);
            }
            StageStatus::StagedWarnings | StageStatus::StagedReady => {
                let convoy = result
                    .convoy_id
                    .as_ref()
                    .map(|c| c.as_str().to_string())
                    .unwrap_or_default();
                let verb = if result.restaged { "re-staged" } else { "staged" };
                println!("Convoy {convoy} {verb} ({} waves)", result.waves.len());
                for wave in &result.waves {
                    let tasks: Vec<&str> = wave.tasks.iter().map(|t| t.as_str()).collect();
                    println!("  wave {}: {}", wave.number, tasks.join(", "));
                }
                for finding in &result.warnings {
                    println!("  warning [{}] {}", finding.category, finding.message);
                }
            }
        }
    }

    if launch {
        let convoy = match &result.convoy_id {
            Some(id) => id.clone(),
            None => return fail(json, "staging failed validation; nothing to launch"),
        };
        let executor = build_executor(&env);
        let registry = ConvoyRegistry::new(store);
        match registry.launch(&executor, &convoy, false).await {
            Ok(report) => {
                if json {
                    println!(
                        "{}",
                        serde_json::json!({ "staged": result, "launch": report })
                    );
                } else {
                    super::launch::print_report(&report);
                }
            }
            Err(e) => return fail(json, e.to_string()),
        }
    }

    Ok(())
}
