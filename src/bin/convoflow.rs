use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use convoflow::flow::constants::api_types;
use convoflow::utils::LoggingConfig;
use convoflow::{
    load_flow_from_file, ApiHandlerRegistry, ApiQueueWorker, EngineConfig, ExecutionContext,
    ExecutionScheduler, ExecutionStatus, FlowEngine, FlowRegistry, FlowValidator, InboundReply,
    LoggingHandler, LoggingProvider, MessageDispatcher, QueueConfig, QueueStores, SchedulerConfig,
    StartRequest, TriggerIntake,
};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "convoflow", version, about = "Conversational flow engine CLI", author)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 校验流程文件
    Validate { file: PathBuf },
    /// 在内存中从入口执行一次引擎
    Run {
        file: PathBuf,
        /// key=value，value 按 JSON 解析，失败时作为字符串
        #[arg(long = "var")]
        vars: Vec<String>,
    },
    /// 使用内存队列完整模拟一段对话
    Simulate {
        file: PathBuf,
        #[arg(long = "var")]
        vars: Vec<String>,
        /// 依次喂给等待输入的节点
        #[arg(long = "reply")]
        replies: Vec<String>,
        #[arg(long, default_value_t = 64)]
        max_rounds: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    LoggingConfig::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Validate { file } => handle_validate(file),
        Command::Run { file, vars } => handle_run(file, vars),
        Command::Simulate {
            file,
            vars,
            replies,
            max_rounds,
        } => handle_simulate(file, vars, replies, max_rounds).await,
    }
}

fn parse_vars(raw: &[String]) -> anyhow::Result<HashMap<String, Value>> {
    raw.iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("expected key=value, got `{pair}`"))?;
            let value = serde_json::from_str(value).unwrap_or_else(|_| Value::from(value));
            Ok((key.trim().to_string(), value))
        })
        .collect()
}

fn handle_validate(file: PathBuf) -> anyhow::Result<()> {
    let spec = load_flow_from_file(&file)?;
    let report = FlowValidator::new().validate(&spec);
    let output = json!({
        "file": file.display().to_string(),
        "valid": report.valid,
        "error": report.error.as_ref().map(|err| err.to_string()),
        "warnings": report.warnings.iter().map(|w| w.to_string()).collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    if !report.is_valid() {
        std::process::exit(1);
    }
    Ok(())
}

fn handle_run(file: PathBuf, vars: Vec<String>) -> anyhow::Result<()> {
    let spec = load_flow_from_file(&file)?;
    let report = FlowValidator::new().validate(&spec);
    if let Some(err) = report.error {
        return Err(err).context("flow is invalid");
    }

    let mut ctx = ExecutionContext::new("cli", "cli-conversation", "cli-contact", &spec.entry)
        .with_variables(parse_vars(&vars)?);
    let engine = FlowEngine::new(EngineConfig::from_env());
    let result = engine.run(&spec, &mut ctx, Utc::now());

    let output = json!({
        "outcome": match &result {
            Ok(outcome) => format!("{outcome:?}"),
            Err(err) => format!("error: {err}"),
        },
        "path": ctx.execution_path(),
        "currentNodeId": ctx.current_node_id,
        "effects": ctx.effects(),
        "variables": ctx.variables(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    result.map(|_| ()).map_err(Into::into)
}

async fn handle_simulate(
    file: PathBuf,
    vars: Vec<String>,
    replies: Vec<String>,
    max_rounds: usize,
) -> anyhow::Result<()> {
    let spec = load_flow_from_file(&file)?;
    let flows = Arc::new(FlowRegistry::new());
    flows.register_spec("simulation", spec)?;

    let stores = QueueStores::in_memory();
    let scheduler_config = SchedulerConfig::from_env();
    let queue_config = QueueConfig::from_env();
    let provider = Arc::new(LoggingProvider::new());
    let mut handlers = ApiHandlerRegistry::with_messaging(provider.clone());
    for api_type in [api_types::HTTP_REQUEST, api_types::NOTIFY_TEAM] {
        handlers.register(api_type, Arc::new(LoggingHandler));
    }

    let intake = TriggerIntake::new(
        flows.clone(),
        stores.executions.clone(),
        scheduler_config.clone(),
    );
    let scheduler = ExecutionScheduler::new(
        flows,
        stores.clone(),
        FlowEngine::new(EngineConfig::from_env()),
        scheduler_config,
    )
    .with_queue_config(queue_config.clone());
    let dispatcher = MessageDispatcher::new(
        stores.messages.clone(),
        stores.api_queue.clone(),
        queue_config.clone(),
    );
    let worker = ApiQueueWorker::new(
        stores.api_queue.clone(),
        stores.messages.clone(),
        handlers,
        queue_config,
    );

    let mut request = StartRequest::new("simulation", "sim-conversation", "sim-contact");
    request.variables = parse_vars(&vars)?;
    let execution = intake.start(request).await?;
    let mut replies: VecDeque<String> = replies.into();

    // 虚拟时钟：Wait 节点和退避直接快进
    let mut now = Utc::now();
    for _ in 0..max_rounds {
        now = now.max(Utc::now());
        let ran = scheduler.poll_once(now).await?;
        let dispatched = dispatcher.poll_once(now).await?;
        let called = worker.poll_once(now).await?;

        let row = stores
            .executions
            .get(&execution.id)
            .await?
            .ok_or_else(|| anyhow!("execution disappeared"))?;
        match row.status {
            ExecutionStatus::Completed | ExecutionStatus::Failed => {
                if dispatched.is_idle() && called.is_idle() {
                    break;
                }
            }
            ExecutionStatus::WaitingInput => {
                if !(dispatched.is_idle() && called.is_idle()) {
                    continue;
                }
                match replies.pop_front() {
                    Some(text) => {
                        println!("> {text}");
                        intake.reply(&row.id, InboundReply::text(text)).await?;
                    }
                    None => break,
                }
            }
            ExecutionStatus::Queued if ran.is_idle() && row.scheduled_at > now => {
                now = row.scheduled_at;
            }
            _ => {}
        }
    }

    let row = stores
        .executions
        .get(&execution.id)
        .await?
        .ok_or_else(|| anyhow!("execution disappeared"))?;
    let transcript: Vec<Value> = provider
        .delivered()
        .into_iter()
        .map(|request| json!({ "text": request.content.text, "quickReplies": request.content.quick_replies }))
        .collect();
    let output = json!({
        "status": row.status,
        "currentNodeId": row.current_node_id,
        "path": row.execution_path,
        "error": row.error,
        "transcript": transcript,
        "variables": row.variables,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
