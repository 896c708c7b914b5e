//! hotline-mirror - 执行一次镜像 cycle
//!
//! 用法：`hotline-mirror [config.json]`
//!
//! 未指定路径时读取 `HOTLINE_MIRROR_CONFIG`，再退回 `~/.hotline-mirror/config.json`。
//! 定时执行交给 cron / systemd timer。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use hotline_mirror::{run_cycle, HttpSource, MirrorConfig, MirrorDB};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("hotline_mirror=info".parse()?))
        .init();

    tracing::info!("hotline-mirror v{}", env!("CARGO_PKG_VERSION"));

    let config = match std::env::args_os().nth(1) {
        Some(path) => MirrorConfig::load(&PathBuf::from(path))?,
        None => MirrorConfig::from_env()?,
    };

    let db = Arc::new(MirrorDB::connect(config.db_config())?);
    let source = HttpSource::new(config.tracker_url.clone())?;

    let report = run_cycle(&config, &source, &source, db.clone()).await?;

    let stats = db.get_stats()?;
    tracing::info!(
        "库中共 {} 台服务器, {} 条文件, {} 条用户记录",
        stats.server_count,
        stats.file_count,
        stats.user_count
    );

    if !report.errors.is_empty() {
        tracing::warn!("cycle {} 有 {} 个错误", report.cycle_id, report.errors.len());
    }
    Ok(())
}
