//! 一次完整的镜像 cycle
//!
//! 拉取 tracker 目录 → 替换服务器 → 刷新文件树 → 并发轮询在线用户。
//! 目录不可用时只用已入库的服务器刷新文件树。
//! 调度（定时、重试）由外部负责，这里只跑一遍。

use crate::config::MirrorConfig;
use crate::db::current_time_ms;
use crate::error::Result;
use crate::gateway::PersistenceGateway;
use crate::poller::{self, PollOutcome, PollSettings};
use crate::reconcile::ReconciliationEngine;
use crate::source::{DirectorySource, FileListingSource};
use crate::types::ServerDescriptor;
use std::sync::Arc;
use tracing::Instrument;

/// 运行日志中的任务名
pub const JOB_SERVER_UPDATER: &str = "server_updater";
pub const JOB_FILE_INDEXER: &str = "file_indexer";
pub const JOB_USER_POLLER: &str = "user_poller";

/// cycle 结果
#[derive(Debug, Default, Clone)]
pub struct CycleReport {
    pub cycle_id: String,
    /// cycle 开始时间 (毫秒)，也是本次用户记录的时间戳
    pub started_at: i64,
    pub servers_fetched: usize,
    pub servers_written: usize,
    pub file_servers_refreshed: usize,
    pub file_servers_skipped: usize,
    pub file_servers_failed: usize,
    pub files_inserted: usize,
    pub file_chunks_failed: usize,
    pub polls_succeeded: usize,
    pub polls_failed: usize,
    pub users_upserted: usize,
    pub outcomes: Vec<PollOutcome>,
    pub errors: Vec<String>,
}

/// 在阻塞线程池上执行存储操作
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| anyhow::anyhow!("spawn_blocking failed: {}", e))?
}

/// 执行一次 cycle
///
/// 配置校验失败直接返回错误，不会产生任何网络活动。
/// 其余失败（单台服务器、单批写入）记录在 `CycleReport::errors` 中。
pub async fn run_cycle<D, F, G>(
    config: &MirrorConfig,
    directory: &D,
    files: &F,
    gateway: Arc<G>,
) -> Result<CycleReport>
where
    D: DirectorySource,
    F: FileListingSource,
    G: PersistenceGateway + 'static,
{
    config.validate()?;

    let cycle_id = uuid::Uuid::new_v4().to_string();
    let span = tracing::info_span!("cycle", id = %cycle_id);

    async move {
        let mut report = CycleReport {
            cycle_id,
            started_at: current_time_ms(),
            ..Default::default()
        };

        let engine = Arc::new(ReconciliationEngine::new(
            gateway,
            config.servers_to_skip_refresh.clone(),
            config.file_batch_size,
        ));

        let fetched = match directory.fetch_servers().await {
            Ok(servers) if servers.is_empty() => {
                push_error(&mut report, "tracker 目录为空，不更新服务器与用户".to_string());
                None
            }
            Ok(servers) => Some(servers),
            Err(e) => {
                push_error(&mut report, format!("获取 tracker 目录失败: {}", e));
                None
            }
        };

        match fetched {
            Some(servers) => {
                report.servers_fetched = servers.len();
                let servers = Arc::new(servers);

                update_servers(&engine, &servers, &mut report).await;
                index_files(config, &engine, files, &servers, &mut report).await;
                poll_users(config, &engine, &servers, &mut report).await;
            }
            // 目录不可用时只按已入库的服务器刷新文件
            None => match stored_servers(&engine, &mut report).await {
                Some(servers) => index_files(config, &engine, files, &servers, &mut report).await,
                None => tracing::info!("没有已入库的服务器，跳过本次 cycle"),
            },
        }

        tracing::info!(
            "cycle 完成: 服务器 {}, 文件 {} (跳过 {} 台, 失败批次 {}), 轮询 {}/{}, 用户 {}, 错误 {}",
            report.servers_written,
            report.files_inserted,
            report.file_servers_skipped,
            report.file_chunks_failed,
            report.polls_succeeded,
            report.polls_succeeded + report.polls_failed,
            report.users_upserted,
            report.errors.len()
        );
        Ok(report)
    }
    .instrument(span)
    .await
}

fn push_error(report: &mut CycleReport, err_msg: String) {
    tracing::warn!("{}", err_msg);
    report.errors.push(err_msg);
}

async fn record_run<G>(engine: &Arc<ReconciliationEngine<G>>, job: &'static str, report: &mut CycleReport)
where
    G: PersistenceGateway + 'static,
{
    let engine = engine.clone();
    let at = current_time_ms();
    if let Err(e) = blocking(move || engine.gateway().record_job_run(job, at)).await {
        push_error(report, format!("[{}] 记录运行时间失败: {}", job, e));
    }
}

/// 读取已入库的服务器目录；为空或读取失败时返回 None
async fn stored_servers<G>(
    engine: &Arc<ReconciliationEngine<G>>,
    report: &mut CycleReport,
) -> Option<Arc<Vec<ServerDescriptor>>>
where
    G: PersistenceGateway + 'static,
{
    let task_engine = engine.clone();
    match blocking(move || task_engine.gateway().list_servers()).await {
        Ok(servers) if servers.is_empty() => None,
        Ok(servers) => {
            tracing::info!("使用已入库的 {} 台服务器刷新文件", servers.len());
            Some(Arc::new(servers))
        }
        Err(e) => {
            push_error(report, format!("读取已入库服务器失败: {}", e));
            None
        }
    }
}

// ==================== server_updater ====================

async fn update_servers<G>(
    engine: &Arc<ReconciliationEngine<G>>,
    servers: &Arc<Vec<ServerDescriptor>>,
    report: &mut CycleReport,
) where
    G: PersistenceGateway + 'static,
{
    let task_engine = engine.clone();
    let task_servers = servers.clone();
    match blocking(move || task_engine.replace_servers(&task_servers)).await {
        Ok(written) => {
            report.servers_written = written;
            record_run(engine, JOB_SERVER_UPDATER, report).await;
        }
        Err(e) => push_error(report, format!("[{}] 写入服务器失败: {}", JOB_SERVER_UPDATER, e)),
    }
}

// ==================== file_indexer ====================

async fn index_files<F, G>(
    config: &MirrorConfig,
    engine: &Arc<ReconciliationEngine<G>>,
    files: &F,
    servers: &Arc<Vec<ServerDescriptor>>,
    report: &mut CycleReport,
) where
    F: FileListingSource,
    G: PersistenceGateway + 'static,
{
    let targets = servers
        .iter()
        .filter(|s| s.is_file_target(config.include_loopback));

    for server in targets {
        let server_id = server.unique_id.clone();

        if engine.is_skipped(&server_id) {
            tracing::debug!("[{}] 在跳过列表中，不刷新文件", server_id);
            report.file_servers_skipped += 1;
            continue;
        }

        let listing = match files.fetch_files(&server_id).await {
            Ok(listing) => listing,
            Err(e) => {
                report.file_servers_failed += 1;
                push_error(report, format!("[{}] 获取文件列表失败: {}", server_id, e));
                continue;
            }
        };

        let task_engine = engine.clone();
        let task_id = server_id.clone();
        match blocking(move || task_engine.reconcile_files(&task_id, &listing)).await {
            Ok(result) => {
                report.file_servers_refreshed += 1;
                report.files_inserted += result.inserted;
                report.file_chunks_failed += result.chunks_failed;
                report.errors.extend(result.errors);
            }
            Err(e) => {
                report.file_servers_failed += 1;
                push_error(report, format!("[{}] 文件刷新失败: {}", server_id, e));
            }
        }
    }

    tracing::info!(
        "[{}] 刷新 {} 台, 跳过 {} 台, 失败 {} 台, 写入 {} 条",
        JOB_FILE_INDEXER,
        report.file_servers_refreshed,
        report.file_servers_skipped,
        report.file_servers_failed,
        report.files_inserted
    );
    record_run(engine, JOB_FILE_INDEXER, report).await;
}

// ==================== user_poller ====================

async fn poll_users<G>(
    config: &MirrorConfig,
    engine: &Arc<ReconciliationEngine<G>>,
    servers: &Arc<Vec<ServerDescriptor>>,
    report: &mut CycleReport,
) where
    G: PersistenceGateway + 'static,
{
    let targets: Vec<ServerDescriptor> = servers
        .iter()
        .filter(|s| s.is_poll_target())
        .cloned()
        .collect();
    tracing::debug!("[{}] 轮询 {} 台服务器", JOB_USER_POLLER, targets.len());

    let outcomes = poller::poll_all(
        targets,
        PollSettings::from(config),
        config.pool_size,
        report.started_at,
    )
    .await;

    report.polls_succeeded = outcomes.iter().filter(|o| o.is_success()).count();
    report.polls_failed = outcomes.len() - report.polls_succeeded;

    let task_engine = engine.clone();
    let written = blocking(move || {
        let result = task_engine.upsert_users(&outcomes);
        Ok((result, outcomes))
    })
    .await;

    match written {
        Ok((result, outcomes)) => {
            report.users_upserted = result.users_written;
            report.errors.extend(result.errors);
            report.outcomes = outcomes;
        }
        Err(e) => push_error(report, format!("[{}] 写入用户失败: {}", JOB_USER_POLLER, e)),
    }

    tracing::info!(
        "[{}] 成功 {}, 失败 {}, 用户 {}",
        JOB_USER_POLLER,
        report.polls_succeeded,
        report.polls_failed,
        report.users_upserted
    );
    record_run(engine, JOB_USER_POLLER, report).await;
}
