use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tierkeep::config::Config;
use tierkeep::core::{RecordId, Tier};
use tierkeep::migrate::CancelHandle;
use tierkeep::query::QueryServer;
use tierkeep::vault::TieredVault;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tierkeep", version, about = "Tiered billing record store")]
struct Cli {
    /// 配置文件（TOML）；缺省使用内置默认值
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 写入一条新记录（只进热层）
    Put {
        id: String,
        #[arg(long, conflicts_with = "file")]
        data: Option<String>,
        #[arg(long)]
        file: Option<PathBuf>,
        /// RFC 3339，缺省为当前时间
        #[arg(long)]
        created_at: Option<DateTime<Utc>>,
    },
    /// 按 ID 检索，无需指定层
    Get {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// 跑一轮指定的迁移任务
    Migrate {
        #[arg(long)]
        source: Tier,
        #[arg(long)]
        dest: Tier,
    },
    /// 所有配置任务各跑一轮；--watch 时按间隔常驻
    RunJobs {
        #[arg(long)]
        watch: bool,
    },
    /// 记录分布与统计
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// 把位置索引压成 snapshot 并截断 WAL
    Checkpoint,
    /// HTTP 服务 + 后台迁移调度
    Serve {
        #[arg(long)]
        bind: Option<String>,
    },
}

/// Ctrl-C 触发取消；在途记录收尾后各循环退出
fn cancel_on_ctrl_c() -> CancelHandle {
    let cancel = CancelHandle::new();
    let handle = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
            handle.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load_or_default(cli.config.as_deref())?;
    let vault = Arc::new(TieredVault::open(&config).await?);

    match cli.command {
        Command::Put {
            id,
            data,
            file,
            created_at,
        } => {
            let payload = match (data, file) {
                (Some(d), _) => d.into_bytes(),
                (None, Some(path)) => tokio::fs::read(&path).await?,
                (None, None) => anyhow::bail!("one of --data or --file is required"),
            };
            let entry = vault
                .create(id, payload, created_at.unwrap_or_else(Utc::now))
                .await?;
            vault.checkpoint().await?;
            println!("{} -> {} ({})", entry.id, entry.tier, entry.key);
        }
        Command::Get { ids } => {
            let ids: Vec<RecordId> = ids.into_iter().map(RecordId::new).collect();
            let mut missing = 0usize;
            for (id, result) in vault.resolve_many(&ids).await {
                match result {
                    Ok(r) => {
                        println!(
                            "{}\t{}\t{:?}\t{:.2}ms\t{}",
                            id,
                            r.tier,
                            r.lookup,
                            r.elapsed.as_secs_f64() * 1000.0,
                            String::from_utf8_lossy(&r.record.payload)
                        );
                    }
                    Err(e) => {
                        missing += 1;
                        eprintln!("{}", e);
                    }
                }
            }
            if missing > 0 {
                std::process::exit(1);
            }
        }
        Command::Migrate { source, dest } => {
            let job = vault
                .job(source, dest)
                .ok_or_else(|| anyhow::anyhow!("no job configured from {} to {}", source, dest))?;
            let report = vault.run_cycle(&job, &cancel_on_ctrl_c()).await?;
            vault.checkpoint().await?;
            println!("{}", report);
        }
        Command::RunJobs { watch } => {
            let cancel = cancel_on_ctrl_c();
            if watch {
                vault.run_scheduled(&cancel).await;
                vault.checkpoint().await?;
            } else {
                for (name, result) in vault.run_jobs(&cancel).await {
                    match result {
                        Ok(report) => println!("{}", report),
                        Err(e) => eprintln!("{}: {}", name, e),
                    }
                }
            }
        }
        Command::Stats { json } => {
            let report = vault.stats();
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report);
            }
        }
        Command::Checkpoint => {
            vault.checkpoint().await?;
            info!("Checkpoint written under {:?}", config.index_dir());
        }
        Command::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.server.bind.clone());
            let cancel = cancel_on_ctrl_c();
            let server = QueryServer::new(vault.clone()).with_cancel(cancel.clone());
            info!("tierkeep ready. Query via: http://{}/records/<id>", bind);
            // 两边都在取消后收尾，等它们都结束再落盘
            let (served, _) = tokio::join!(
                async {
                    let r = server.run(&bind).await;
                    if r.is_err() {
                        cancel.cancel();
                    }
                    r
                },
                vault.run_scheduled(&cancel)
            );
            vault.checkpoint().await?;
            served?;
        }
    }

    Ok(())
}
