use std::path::PathBuf;
use std::sync::Arc;

use gt_dispatch::convoy::{ConvoyRegistry, LaunchReport};
use gt_dispatch::stage::Stager;

use super::{build_executor, fail, load_env, open_store, to_bead_ids};

pub async fn run(town: &PathBuf, ids: Vec<String>, force: bool, json: bool) -> anyhow::Result<()> {
    let env = load_env(town)?;
    let store = open_store(&env);
    let stager = Stager::new(env.clone(), Arc::clone(&store));

    let bead_ids = to_bead_ids(&ids);
    let convoy = match stager.resolve_launch_target(&bead_ids).await {
        Ok(convoy) => convoy,
        Err(e) => return fail(json, e.to_string()),
    };

    let executor = build_executor(&env);
    let registry = ConvoyRegistry::new(store);
    match registry.launch(&executor, &convoy, force).await {
        Ok(report) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
            if report.dispatched.iter().any(|o| !o.success) {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(e) => fail(json, e.to_string()),
    }
}

pub fn print_report(report: &LaunchReport) {
    println!("Convoy {} launched", report.convoy);
    if let Some(blocked) = &report.blocked_warning {
        println!("  warning: launched over blocked rigs ({blocked})");
    }
    for outcome in &report.dispatched {
        if outcome.success {
            println!("  {} -> polecat {}", outcome.bead_id, outcome.polecat);
        } else {
            println!("  {} FAILED: {}", outcome.bead_id, outcome.err_msg);
        }
    }
    if report.waves.len() > 1 {
        println!(
            "  {} later wave(s) will dispatch as Wave 1 completes",
            report.waves.len() - 1
        );
    }
}
