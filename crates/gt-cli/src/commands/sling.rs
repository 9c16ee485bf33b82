use std::path::PathBuf;

use gt_core::types::{MergeStrategy, SlingContext, SlingMode};
use gt_dispatch::guards::{check_batch_target, check_rig_available};
use gt_dispatch::scheduler::Scheduler;
use gt_dispatch::sling::SlingParams;

use super::{build_executor, fail, load_env, open_store, parse_vars, split_target};

pub struct SlingCliOpts {
    pub force: bool,
    pub no_convoy: bool,
    pub no_boot: bool,
    pub naked: bool,
    pub agent: Option<String>,
    pub account: Option<String>,
    pub formula: Option<String>,
    pub hook_raw_bead: bool,
    pub vars: Vec<String>,
    pub args_str: Option<String>,
    pub merge: Option<String>,
    pub base_branch: Option<String>,
    pub ralph: bool,
    pub no_merge: bool,
    pub max_concurrent: usize,
    pub json: bool,
}

pub async fn run(town: &PathBuf, args: Vec<String>, opts: SlingCliOpts) -> anyhow::Result<()> {
    let env = load_env(town)?;
    let json = opts.json;

    let (beads, target) = split_target(&env, &args);
    if beads.is_empty() {
        return fail(json, "no beads given");
    }

    let merge = match &opts.merge {
        Some(raw) => match MergeStrategy::parse(raw) {
            Some(m) => Some(m),
            None => return fail(json, format!("unknown merge strategy: {raw}")),
        },
        None => None,
    };

    // Guard rails run before anything is provisioned.
    let target_rig =
        match check_batch_target(&env.routes, &beads, target.as_deref(), opts.force) {
            Ok(rig) => rig,
            Err(e) => return fail(json, e.to_string()),
        };
    let store = open_store(&env);
    if let Err(e) =
        check_rig_available(store.as_ref(), &env.routes, &target_rig, opts.force).await
    {
        return fail(json, e.to_string());
    }

    let vars = parse_vars(&opts.vars);
    let mode = if opts.ralph {
        SlingMode::Ralph
    } else {
        SlingMode::Normal
    };

    // Deferred mode turns the sling into a queued context.
    if env.deferred_dispatch() {
        let scheduler = Scheduler::new(env.clone(), store);
        let mut results = Vec::new();
        for bead in &beads {
            let mut ctx = SlingContext::new(bead.clone(), target_rig.clone());
            ctx.formula = opts.formula.clone();
            ctx.args = opts.args_str.clone();
            ctx.vars = vars.clone();
            ctx.merge = merge;
            ctx.base_branch = opts.base_branch.clone();
            ctx.account = opts.account.clone();
            ctx.agent_override = opts.agent.clone();
            ctx.no_merge = opts.no_merge;
            ctx.hook_raw = opts.hook_raw_bead;
            ctx.mode = mode;
            match scheduler.schedule(bead, &target_rig, ctx, opts.force, false).await {
                Ok(outcome) => results.push((bead.clone(), Ok(outcome))),
                Err(e) => results.push((bead.clone(), Err(e.to_string()))),
            }
        }
        let failed = results.iter().any(|(_, r)| r.is_err());
        if json {
            let rendered: Vec<serde_json::Value> = results
                .into_iter()
                .map(|(bead, r)| match r {
                    Ok(outcome) => serde_json::json!({ "bead": bead, "scheduled": outcome }),
                    Err(msg) => serde_json::json!({ "bead": bead, "error": msg }),
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rendered)?);
        } else {
            for (bead, r) in results {
                match r {
                    Ok(outcome) if outcome.already_scheduled => {
                        println!("{bead}: already scheduled");
                    }
                    Ok(outcome) => match outcome.context_id {
                        Some(ctx) => println!("{bead}: queued as {ctx}"),
                        None => println!("{bead}: dry run ok"),
                    },
                    Err(msg) => println!("{bead}: FAILED: {msg}"),
                }
            }
        }
        if failed {
            std::process::exit(1);
        }
        return Ok(());
    }

    // Direct dispatch.
    let executor = build_executor(&env);
    let mut template = if beads.len() == 1 {
        SlingParams::single(beads[0].clone(), target_rig.clone())
    } else {
        SlingParams::batch_member(beads[0].clone(), target_rig.clone())
    };
    template.formula = opts.formula.clone();
    template.args = opts.args_str.clone();
    template.vars = vars;
    template.merge = merge;
    template.base_branch = opts.base_branch.clone();
    template.account = opts.account.clone();
    template.agent_override = opts.agent.clone();
    template.force = opts.force;
    template.no_convoy = opts.no_convoy;
    template.no_merge = opts.no_merge;
    template.hook_raw = opts.hook_raw_bead;
    template.mode = mode;
    template.skip_cook = opts.naked;
    template.no_boot = opts.no_boot;

    let outcomes = executor
        .execute_batch(&beads, &template, opts.max_concurrent)
        .await;

    let failed = outcomes.iter().any(|o| !o.success);
    if json {
        println!("{}", serde_json::to_string_pretty(&outcomes)?);
    } else {
        for outcome in &outcomes {
            if outcome.success {
                println!("{} -> polecat {}", outcome.bead_id, outcome.polecat);
            } else {
                println!("{} FAILED: {}", outcome.bead_id, outcome.err_msg);
            }
        }
    }
    if failed {
        std::process::exit(1);
    }
    Ok(())
}
