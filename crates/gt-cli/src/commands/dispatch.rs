use std::path::PathBuf;

use gt_core::types::BeadId;
use gt_dispatch::scheduler::Dispatcher;

use super::{build_executor, fail, load_env};

pub async fn run(town: &PathBuf, json: bool) -> anyhow::Result<()> {
    let env = load_env(town)?;
    let dispatcher = Dispatcher::new(build_executor(&env));

    match dispatcher.dispatch_pending().await {
        Ok(reports) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else if reports.is_empty() {
                println!("queue empty");
            } else {
                for report in &reports {
                    let o = &report.outcome;
                    if o.success {
                        println!("{} -> polecat {} (context {})", o.bead_id, o.polecat, report.context_id);
                    } else {
                        println!("{} FAILED: {} (context {})", o.bead_id, o.err_msg, report.context_id);
                    }
                }
            }
            Ok(())
        }
        Err(e) => fail(json, e.to_string()),
    }
}

pub async fn reconcile(town: &PathBuf, convoy: String, json: bool) -> anyhow::Result<()> {
    let env = load_env(town)?;
    let dispatcher = Dispatcher::new(build_executor(&env));

    match dispatcher.reconcile_convoy(&BeadId::new(convoy)).await {
        Ok(report) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else if report.convoy_closed {
                println!("convoy {} closed (all tracked beads done)", report.convoy);
            } else if report.dispatched.is_empty() {
                println!("convoy {}: nothing to dispatch yet", report.convoy);
            } else {
                for o in &report.dispatched {
                    if o.success {
                        println!("{} -> polecat {}", o.bead_id, o.polecat);
                    } else {
                        println!("{} FAILED: {}", o.bead_id, o.err_msg);
                    }
                }
            }
            Ok(())
        }
        Err(e) => fail(json, e.to_string()),
    }
}
