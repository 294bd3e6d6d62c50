//! Hive 命令行入口
//!
//! `hive [--config FILE] [--runtime local|docker|remote] [--planning MODE] [--tools a,b] [--user ID] [--conversation ID] <goal>`
//!
//! 加载配置，启动一次运行，把每条消息按 JSON 行打印到 stdout；Ctrl+C 取消运行。

use std::path::PathBuf;

use anyhow::{bail, Context};
use hive::codeact::PlanningMode;
use hive::core::create_agent_builder;
use hive::runtime::RuntimeKind;
use hive::{observability, RunRequest, RunState};

struct CliArgs {
    config: Option<PathBuf>,
    runtime: Option<RuntimeKind>,
    planning: Option<PlanningMode>,
    tools: Vec<String>,
    user: String,
    conversation: Option<String>,
    goal: String,
}

fn parse_args() -> anyhow::Result<CliArgs> {
    let mut args = std::env::args().skip(1);
    let mut cli = CliArgs {
        config: None,
        runtime: None,
        planning: None,
        tools: Vec::new(),
        user: "local".to_string(),
        conversation: None,
        goal: String::new(),
    };
    let mut goal = Vec::new();
    while let Some(arg) = args.next() {
        let mut value = |name: &str| args.next().with_context(|| format!("{} needs a value", name));
        match arg.as_str() {
            "--config" => cli.config = Some(PathBuf::from(value("--config")?)),
            "--runtime" => cli.runtime = Some(value("--runtime")?.parse()?),
            "--planning" => cli.planning = Some(value("--planning")?.parse()?),
            "--tools" => {
                cli.tools = value("--tools")?
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            }
            "--user" => cli.user = value("--user")?,
            "--conversation" => cli.conversation = Some(value("--conversation")?),
            other => goal.push(other.to_string()),
        }
    }
    cli.goal = goal.join(" ");
    if cli.goal.trim().is_empty() {
        bail!("usage: hive [options] <goal>");
    }
    Ok(cli)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();
    let cli = parse_args()?;

    let orchestrator = create_agent_builder(cli.config.clone())
        .build()
        .context("Failed to build orchestrator")?;

    let conversation = cli
        .conversation
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut request = RunRequest::new(cli.goal.clone(), conversation, cli.user.clone())
        .with_tools(cli.tools.clone());
    if let Some(kind) = cli.runtime {
        request = request.with_runtime(kind);
    }
    if let Some(mode) = cli.planning {
        request = request.with_planning_mode(mode);
    }

    let mut handle = orchestrator.start_run(request);
    let cancel = handle.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl+C received, cancelling run");
            cancel.cancel();
        }
    });

    while let Some(msg) = handle.events.recv().await {
        println!(
            "{}",
            serde_json::to_string(&msg).context("Failed to encode message")?
        );
    }
    let (outcome, _) = handle.wait().await.context("Run task panicked")?;
    if outcome.state != RunState::Done {
        std::process::exit(1);
    }
    Ok(())
}
