use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use tracing::{info, warn};

mod analysis;
mod compat;
mod config;
mod llm;
mod pipeline;
mod utils;
mod validation;

use config::CONFIG;
use llm::oracle::{ImageOracle, VisionOracle};
use llm::{GeminiOracle, KeyPool};
use pipeline::{run_batch, run_session, SessionInputs};
use utils::logging::init_logging;
use validation::ProfileRegistry;

fn usage() -> &'static str {
    "Usage:\n  \
     lookbook_studio shoot --identity <path|url> --pose <path|url> --background <path|url> \
     [--outfit <path|url>] [--workflow <name>] [--prompt <text>] [--label <name>]\n  \
     lookbook_studio batch --manifest <path> [--concurrency <n>]"
}

fn parse_shoot_args(args: &[String]) -> Result<SessionInputs> {
    let mut identity = None;
    let mut pose = None;
    let mut background = None;
    let mut outfit = None;
    let mut workflow = None;
    let mut extra_prompt = None;
    let mut label = None;

    let mut index = 2;
    while index < args.len() {
        let flag = args[index].as_str();
        index += 1;
        let value = args
            .get(index)
            .ok_or_else(|| anyhow!("Missing value for {flag}"))?
            .clone();
        match flag {
            "--identity" => identity = Some(value),
            "--pose" => pose = Some(value),
            "--background" => background = Some(value),
            "--outfit" => outfit = Some(value),
            "--workflow" => workflow = Some(value),
            "--prompt" => extra_prompt = Some(value),
            "--label" => label = Some(value),
            other => return Err(anyhow!("Unknown option: {other}")),
        }
        index += 1;
    }

    Ok(SessionInputs {
        identity_ref: identity.ok_or_else(|| anyhow!("--identity is required"))?,
        pose_ref: pose.ok_or_else(|| anyhow!("--pose is required"))?,
        background_ref: background.ok_or_else(|| anyhow!("--background is required"))?,
        outfit_ref: outfit,
        workflow,
        extra_prompt,
        label,
    })
}

struct BatchArgs {
    manifest: PathBuf,
    concurrency: Option<usize>,
}

fn parse_batch_args(args: &[String]) -> Result<BatchArgs> {
    let mut manifest = None;
    let mut concurrency = None;

    let mut index = 2;
    while index < args.len() {
        let flag = args[index].as_str();
        index += 1;
        let value = args
            .get(index)
            .ok_or_else(|| anyhow!("Missing value for {flag}"))?;
        match flag {
            "--manifest" => manifest = Some(PathBuf::from(value)),
            "--concurrency" => {
                concurrency = Some(
                    value
                        .parse::<usize>()
                        .map_err(|_| anyhow!("Invalid --concurrency value: {value}"))?
                        .max(1),
                );
            }
            other => return Err(anyhow!("Unknown option: {other}")),
        }
        index += 1;
    }

    Ok(BatchArgs {
        manifest: manifest.ok_or_else(|| anyhow!("--manifest is required"))?,
        concurrency,
    })
}

#[derive(Debug, Deserialize)]
struct BatchManifest {
    sessions: Vec<SessionInputs>,
}

fn build_oracles() -> Result<(Arc<dyn VisionOracle>, Arc<dyn ImageOracle>)> {
    let keys = Arc::new(KeyPool::new(CONFIG.gemini_api_keys.clone())?);
    info!("Using {} Gemini API key(s)", keys.len());
    let oracle = Arc::new(GeminiOracle::new(keys));
    Ok((oracle.clone(), oracle))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let _logging_guards = init_logging();

    let args: Vec<String> = env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("shoot") => {
            let inputs = parse_shoot_args(&args).map_err(|err| {
                eprintln!("{}", usage());
                err
            })?;
            let (vision, generator) = build_oracles()?;
            let registry = ProfileRegistry::load(&CONFIG.workflow_profiles_path);

            let report = run_session(vision, generator, &registry, &inputs).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.outcome == "failed" {
                std::process::exit(1);
            }
            Ok(())
        }
        Some("batch") => {
            let batch_args = parse_batch_args(&args).map_err(|err| {
                eprintln!("{}", usage());
                err
            })?;
            let raw = std::fs::read_to_string(&batch_args.manifest).with_context(|| {
                format!("failed to read manifest {}", batch_args.manifest.display())
            })?;
            let manifest: BatchManifest = serde_json::from_str(&raw).with_context(|| {
                format!("failed to parse manifest {}", batch_args.manifest.display())
            })?;
            if manifest.sessions.is_empty() {
                warn!("Manifest contains no sessions; nothing to do");
                return Ok(());
            }

            let (vision, generator) = build_oracles()?;
            let registry = Arc::new(ProfileRegistry::load(&CONFIG.workflow_profiles_path));
            let concurrency = batch_args.concurrency.unwrap_or(CONFIG.batch_concurrency);

            let total = manifest.sessions.len();
            info!("Running {total} session(s) with concurrency {concurrency}");
            let reports = run_batch(vision, generator, registry, manifest.sessions, concurrency)
                .await;

            let passed = reports.iter().filter(|r| r.outcome == "passed").count();
            let best_effort = reports.iter().filter(|r| r.outcome == "best_effort").count();
            info!(
                "Batch finished: {passed} passed, {best_effort} best-effort, {} failed or errored",
                total - passed - best_effort
            );
            println!("{}", serde_json::to_string_pretty(&reports)?);
            if passed == 0 && !reports.is_empty() {
                std::process::exit(1);
            }
            Ok(())
        }
        _ => {
            eprintln!("{}", usage());
            std::process::exit(2);
        }
    }
}
