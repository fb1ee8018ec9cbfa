use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::core::{RecordId, Tier};
use crate::migrate::{CancelHandle, CycleError, MigrationReport};
use crate::resolver::{Lookup, ResolveError};
use crate::stats::StatsReport;
use crate::vault::TieredVault;

#[derive(Serialize)]
pub struct RecordResponse {
    pub id: RecordId,
    pub tier: Tier,
    pub lookup: Lookup,
    pub elapsed_ms: f64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// 账单文档；不是 JSON 时按（有损）UTF-8 字符串返回
    pub document: serde_json::Value,
}

#[derive(Deserialize, Default)]
pub struct MigrateParams {
    pub source: Option<Tier>,
    pub dest: Option<Tier>,
}

#[derive(Serialize)]
pub struct JobResult {
    pub job: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<MigrationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn api_error(status: StatusCode, msg: impl ToString) -> ApiError {
    (
        status,
        Json(ErrorBody {
            error: msg.to_string(),
        }),
    )
}

#[derive(Clone)]
struct AppState {
    vault: Arc<TieredVault>,
    /// 与进程共用：关停时 /migrate 触发的迁移也停止认领新记录
    cancel: CancelHandle,
}

pub struct QueryServer {
    pub vault: Arc<TieredVault>,
    cancel: CancelHandle,
}

impl QueryServer {
    pub fn new(vault: Arc<TieredVault>) -> Self {
        Self {
            vault,
            cancel: CancelHandle::new(),
        }
    }

    /// 取消后服务不再接新连接，处理完在途请求即返回
    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/records/:id", get(record_handler))
            .route("/stats", get(stats_handler))
            .route("/migrate", post(migrate_handler))
            .with_state(AppState {
                vault: self.vault.clone(),
                cancel: self.cancel.clone(),
            })
    }

    pub async fn run(self, bind: &str) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(bind).await?;
        self.serve_on(listener).await
    }

    pub async fn serve_on(self, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
        let app = self.router();
        tracing::info!("HTTP server listening on {}", listener.local_addr()?);
        let cancel = self.cancel.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;
        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

async fn record_handler(
    Path(id): Path<String>,
    State(AppState { vault, .. }): State<AppState>,
) -> Result<Json<RecordResponse>, ApiError> {
    let resolved = vault
        .resolve(&RecordId::new(id))
        .await
        .map_err(|e| match e {
            ResolveError::NotFound(_) => api_error(StatusCode::NOT_FOUND, e),
        })?;

    let record = resolved.record;
    let document = serde_json::from_slice(&record.payload).unwrap_or_else(|_| {
        serde_json::Value::String(String::from_utf8_lossy(&record.payload).into_owned())
    });
    Ok(Json(RecordResponse {
        id: record.id,
        tier: resolved.tier,
        lookup: resolved.lookup,
        elapsed_ms: resolved.elapsed.as_secs_f64() * 1000.0,
        created_at: record.created_at,
        modified_at: record.modified_at,
        document,
    }))
}

async fn stats_handler(State(AppState { vault, .. }): State<AppState>) -> Json<StatsReport> {
    Json(vault.stats())
}

/// 指定 source/dest 时只跑该任务，否则按顺序跑全部配置任务
async fn migrate_handler(
    State(AppState { vault, cancel }): State<AppState>,
    params: Option<Json<MigrateParams>>,
) -> Result<Json<Vec<JobResult>>, ApiError> {
    let params = params.map(|Json(p)| p).unwrap_or_default();

    let results = match (params.source, params.dest) {
        (Some(source), Some(dest)) => {
            let job = vault.job(source, dest).ok_or_else(|| {
                api_error(
                    StatusCode::NOT_FOUND,
                    format!("no configured job moves {} to {}", source, dest),
                )
            })?;
            vec![(job.name.clone(), vault.run_cycle(&job, &cancel).await)]
        }
        (None, None) => vault.run_jobs(&cancel).await,
        _ => {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                "source and dest must be given together",
            ))
        }
    };

    if let [(_, Err(e @ CycleError::AlreadyRunning { .. }))] = results.as_slice() {
        return Err(api_error(StatusCode::CONFLICT, e));
    }

    Ok(Json(
        results
            .into_iter()
            .map(|(job, r)| match r {
                Ok(report) => JobResult {
                    job,
                    report: Some(report),
                    error: None,
                },
                Err(e) => JobResult {
                    job,
                    report: None,
                    error: Some(e.to_string()),
                },
            })
            .collect(),
    ))
}
