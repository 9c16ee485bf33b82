use std::path::PathBuf;

use gt_core::types::{MergeStrategy, SlingContext, SlingMode};
use gt_dispatch::scheduler::Scheduler;

use super::{fail, load_env, open_store, parse_vars, split_target};

pub struct ScheduleCliOpts {
    pub force: bool,
    pub dry_run: bool,
    pub formula: Option<String>,
    pub vars: Vec<String>,
    pub args_str: Option<String>,
    pub merge: Option<String>,
    pub base_branch: Option<String>,
    pub account: Option<String>,
    pub agent: Option<String>,
    pub no_merge: bool,
    pub hook_raw_bead: bool,
    pub ralph: bool,
    pub owned: bool,
    pub json: bool,
}

pub async fn run(town: &PathBuf, args: Vec<String>, opts: ScheduleCliOpts) -> anyhow::Result<()> {
    let env = load_env(town)?;
    let json = opts.json;

    let (beads, target) = split_target(&env, &args);
    if beads.is_empty() {
        return fail(json, "no beads given");
    }
    let Some(rig) = target else {
        return fail(json, "schedule needs an explicit target rig as the last argument");
    };

    let merge = match &opts.merge {
        Some(raw) => match MergeStrategy::parse(raw) {
            Some(m) => Some(m),
            None => return fail(json, format!("unknown merge strategy: {raw}")),
        },
        None => None,
    };
    let vars = parse_vars(&opts.vars);
    let mode = if opts.ralph {
        SlingMode::Ralph
    } else {
        SlingMode::Normal
    };

    let store = open_store(&env);
    let scheduler = Scheduler::new(env.clone(), store);

    let mut results = Vec::new();
    for bead in &beads {
        let mut ctx = SlingContext::new(bead.clone(), rig.clone());
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
        ctx.owned = opts.owned;
        match scheduler
            .schedule(bead, &rig, ctx, opts.force, opts.dry_run)
            .await
        {
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
    Ok(())
}
