use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use foldersync_lib::commands::{job, sync};
use foldersync_lib::core::schedule::Trigger;
use foldersync_lib::core::ConflictPolicy;
use foldersync_lib::logging::{get_log_dir, init_logging};
use foldersync_lib::{AppState, SyncDirection, SyncMode, SyncOptions};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// 双向目录比较与同步
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 预览两个目录之间的同步计划
    Preview(PairArgs),
    /// 同步两个目录
    Sync(PairArgs),
    /// 创建任务
    AddJob {
        name: String,
        #[command(flatten)]
        pair: PairArgs,
        /// 触发方式（JSON），例如 {"type":"interval","seconds":3600}
        #[arg(long, default_value = r#"{"type":"manual"}"#)]
        schedule: String,
    },
    /// 列出任务
    Jobs,
    /// 运行任务
    Run { job_id: String },
    /// 运行所有到期的任务
    RunDue,
    /// 删除任务
    RemoveJob { job_id: String },
    /// 同步历史
    History {
        job_id: String,
        #[arg(long)]
        limit: Option<i64>,
    },
    /// 等待处理的冲突
    Conflicts { job_id: String },
}

#[derive(clap::Args)]
struct PairArgs {
    source: PathBuf,
    dest: PathBuf,
    /// mirror / update / echo / contribute
    #[arg(long, default_value = "mirror")]
    mode: String,
    /// source_to_destination / destination_to_source / bidirectional
    #[arg(long, default_value = "source_to_destination")]
    direction: String,
    /// 冲突策略：newer_wins / larger_wins / source_wins / destination_wins / skip / keep_both / ask
    #[arg(long, default_value = "keep_both")]
    policy: String,
    /// 扫描时计算内容 hash
    #[arg(long)]
    verify: bool,
    /// 第一个失败后停止
    #[arg(long)]
    fail_fast: bool,
    /// 额外的排除规则
    #[arg(long, value_delimiter = ',')]
    exclude: Vec<String>,
}

impl PairArgs {
    fn options(&self) -> Result<SyncOptions> {
        let mut options = SyncOptions {
            mode: parse_value::<SyncMode>(&self.mode)?,
            direction: parse_value::<SyncDirection>(&self.direction)?,
            conflict_policy: parse_value::<ConflictPolicy>(&self.policy)?,
            verify_with_hash: self.verify,
            fail_fast: self.fail_fast,
            ..Default::default()
        };
        options.filters.exclude_patterns.extend(self.exclude.iter().cloned());
        Ok(options)
    }
}

fn parse_value<T: DeserializeOwned>(value: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(value.to_lowercase()))
        .with_context(|| format!("无效的取值: {}", value))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&get_log_dir());

    let state = AppState::new().await.context("初始化应用状态失败")?;
    let outcome = dispatch(&state, cli.command).await;
    state.cleanup().await;
    outcome
}

async fn dispatch(state: &AppState, command: Commands) -> Result<()> {
    match command {
        Commands::Preview(pair) => {
            let plan = sync::preview_sync(state, &pair.source, &pair.dest, &pair.options()?).await?;
            print_json(&plan)
        }
        Commands::Sync(pair) => {
            let options = pair.options()?;
            let result = sync::run_sync(state, &pair.source, &pair.dest, &options, None).await?;
            print_json(&result)
        }
        Commands::AddJob { name, pair, schedule } => {
            let trigger: Trigger = serde_json::from_str(&schedule).context("无效的触发方式")?;
            let created = job::create_job(
                state,
                name,
                pair.source.to_string_lossy().to_string(),
                pair.dest.to_string_lossy().to_string(),
                pair.options()?,
                trigger,
            )
            .await?;
            print_json(&created)
        }
        Commands::Jobs => print_json(&job::get_jobs(state).await?),
        Commands::Run { job_id } => {
            let result = job::run_job(state, &job_id, HashMap::new(), None).await?;
            print_json(&result)
        }
        Commands::RunDue => {
            let now = chrono::Utc::now().timestamp();
            let mut results = Vec::new();
            for due in job::due_jobs(state, now).await? {
                match job::run_job(state, &due.id, HashMap::new(), None).await {
                    Ok(result) => results.push(result),
                    Err(e) => tracing::error!("任务 {} 运行失败: {}", due.id, e),
                }
            }
            print_json(&results)
        }
        Commands::RemoveJob { job_id } => {
            job::delete_job(state, &job_id).await?;
            Ok(())
        }
        Commands::History { job_id, limit } => {
            print_json(&sync::get_sync_history(state, &job_id, limit).await?)
        }
        Commands::Conflicts { job_id } => {
            print_json(&sync::get_pending_conflicts(state, &job_id).await?)
        }
    }
}
