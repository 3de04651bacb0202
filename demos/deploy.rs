// demos/deploy.rs
// Run with: cargo run --example deploy -- <profile.json> <local_dir> [remote_dir] [--full] [--config config.json]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use sitepush::{DeployConfig, DeployEngine, JsonTaskStore, ServerProfile, TracingProgress};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut positional = Vec::new();
    let mut incremental = true;
    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--full" => incremental = false,
            "--config" => {
                config_path = Some(args.next().context("--config needs a path")?.into());
            }
            _ => positional.push(arg),
        }
    }
    if positional.len() < 2 {
        bail!("usage: deploy <profile.json> <local_dir> [remote_dir] [--full] [--config config.json]");
    }

    // 1. Load the server profile and engine tuning
    let profile = ServerProfile::from_json_file(&positional[0])?;
    let config = match config_path {
        Some(path) => DeployConfig::from_json_file(path)?,
        None => DeployConfig::default(),
    };
    let remote_dir = positional.get(2).cloned().unwrap_or_default();

    // 2. Task store surviving restarts, next to the profile
    let store = JsonTaskStore::open(PathBuf::from(&positional[0]).with_extension("tasks.json")).await?;
    println!("Task store: {}", store.path().display());

    let engine = DeployEngine::with_ssh(Arc::new(store), Arc::new(TracingProgress), config);

    // 3. Pre-flight check
    engine
        .test_connection(&profile)
        .await
        .context("connection test failed")?;
    println!("Connected to {}", profile.display_name());

    // 4. Deploy
    let result = engine
        .execute_deployment(&profile, &positional[1], &remote_dir, incremental)
        .await;

    println!("{}", result.message);
    println!("{}", result.output);
    println!("{}", serde_json::to_string_pretty(&result)?);

    if !result.success {
        bail!("deployment failed");
    }
    Ok(())
}
