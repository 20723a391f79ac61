//! Sonar 一次性命令行
//!
//! 用法: sonar [--mode full|fast] [--config FILE] [--assets DIR] [--fixtures DIR] "<问题>"
//! 输出完整响应 JSON（answer / blocks / screen / status / trace）。失败时退出码为 2。

use std::path::PathBuf;

use anyhow::{bail, Context};
use sonar::config::load_config;
use sonar::stages::RunMode;
use sonar::{OrchestrateRequest, OrchestratorBuilder};

struct CliArgs {
    mode: RunMode,
    config: Option<PathBuf>,
    assets: Option<PathBuf>,
    fixtures: Option<PathBuf>,
    question: String,
}

fn parse_args() -> anyhow::Result<CliArgs> {
    let mut args = std::env::args().skip(1);
    let mut cli = CliArgs {
        mode: RunMode::Full,
        config: None,
        assets: None,
        fixtures: None,
        question: String::new(),
    };
    let mut words = Vec::new();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--mode" => {
                let value = args.next().context("--mode needs a value")?;
                cli.mode = RunMode::parse(&value)
                    .with_context(|| format!("unknown mode '{value}' (expected full or fast)"))?;
            }
            "--config" => cli.config = Some(args.next().context("--config needs a path")?.into()),
            "--assets" => cli.assets = Some(args.next().context("--assets needs a path")?.into()),
            "--fixtures" => {
                cli.fixtures = Some(args.next().context("--fixtures needs a path")?.into())
            }
            "-h" | "--help" => {
                println!(
                    "usage: sonar [--mode full|fast] [--config FILE] [--assets DIR] [--fixtures DIR] \"<question>\""
                );
                std::process::exit(0);
            }
            flag if flag.starts_with("--") => bail!("unknown option {flag}"),
            _ => words.push(arg),
        }
    }
    cli.question = words.join(" ");
    if cli.question.trim().is_empty() {
        bail!("a question is required (see --help)");
    }
    Ok(cli)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sonar::observability::init();

    let cli = parse_args()?;
    let mut cfg = load_config(cli.config.clone()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        Default::default()
    });
    if let Some(dir) = cli.fixtures {
        cfg.app.fixtures_dir = Some(dir);
    }

    let mut builder = OrchestratorBuilder::new(cfg);
    if let Some(dir) = cli.assets {
        builder = builder.with_assets_dir(dir);
    }
    let orchestrator = builder.build().context("Failed to build orchestrator")?;

    let response = orchestrator
        .orchestrate(OrchestrateRequest::ask(cli.question).with_mode(cli.mode))
        .await
        .context("Orchestration request rejected")?;
    let failed = response.status == sonar::trace::RunStatus::Failed;
    println!(
        "{}",
        serde_json::to_string_pretty(&response).context("Failed to serialize response")?
    );
    if failed {
        std::process::exit(2);
    }
    Ok(())
}
