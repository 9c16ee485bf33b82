use std::path::PathBuf;

use gt_rig::availability;

use super::{fail, load_env, open_store};

pub async fn park(town: &PathBuf, name: String) -> anyhow::Result<()> {
    with_rig(town, &name, |store, rig| async move {
        availability::park(store.as_ref(), &rig).await?;
        println!("rig {} parked", rig.name);
        Ok(())
    })
    .await
}

pub async fn unpark(town: &PathBuf, name: String) -> anyhow::Result<()> {
    with_rig(town, &name, |store, rig| async move {
        availability::unpark(store.as_ref(), &rig).await?;
        println!("rig {} active", rig.name);
        Ok(())
    })
    .await
}

pub async fn dock(town: &PathBuf, name: String) -> anyhow::Result<()> {
    with_rig(town, &name, |store, rig| async move {
        availability::dock(store.as_ref(), &rig).await?;
        println!("rig {} docked", rig.name);
        Ok(())
    })
    .await
}

pub async fn undock(town: &PathBuf, name: String) -> anyhow::Result<()> {
    with_rig(town, &name, |store, rig| async move {
        availability::undock(store.as_ref(), &rig).await?;
        println!("rig {} undocked", rig.name);
        Ok(())
    })
    .await
}

pub async fn status(town: &PathBuf, json: bool) -> anyhow::Result<()> {
    let env = load_env(town)?;
    let store = open_store(&env);

    let mut rows = Vec::new();
    for rig in env.routes.rigs() {
        let state = match availability::rig_availability(store.as_ref(), rig).await {
            Ok(state) => state,
            Err(e) => return fail(json, e.to_string()),
        };
        rows.push((rig.name.clone(), state));
    }

    if json {
        let rendered: Vec<serde_json::Value> = rows
            .iter()
            .map(|(name, state)| serde_json::json!({ "rig": name, "status": state }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&rendered)?);
    } else if rows.is_empty() {
        println!("no rigs registered");
    } else {
        for (name, state) in rows {
            println!("{name:<24} {}", state.as_str());
        }
    }
    Ok(())
}

async fn with_rig<F, Fut>(town: &PathBuf, name: &str, f: F) -> anyhow::Result<()>
where
    F: FnOnce(std::sync::Arc<dyn gt_store::BeadStore>, gt_core::routes::RigInfo) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<()>>,
{
    let env = load_env(town)?;
    let Some(rig) = env.routes.rig_by_name(name).cloned() else {
        anyhow::bail!("unknown rig: {name}");
    };
    let store = open_store(&env);
    f(store, rig).await
}
