//! Reconciliation - 把本 cycle 拉取到的远端状态写入存储
//!
//! 三种实体三种策略：
//! - 服务器：整表替换
//! - 文件：按服务器条件替换（跳过列表中的保持不变，其余先删后分批插入）
//! - 用户：upsert，不删除

use crate::error::{Error, Result};
use crate::gateway::PersistenceGateway;
use crate::poller::PollOutcome;
use crate::types::{FileEntry, FileListing, FileRecord, ServerDescriptor};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// 条目缺少名称时的占位名
const UNKNOWN_NAME: &str = "Unknown";

/// 规范化目录路径：以 "/" 开头并以 "/" 结尾
pub fn normalize_dir_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", trimmed)
    }
}

/// 把文件列表中的一个条目转换为文件记录
pub fn normalize_entry(server_id: &str, dir_path: &str, entry: &FileEntry) -> FileRecord {
    let name = entry.name.clone().unwrap_or_else(|| UNKNOWN_NAME.to_string());
    let is_folder = entry.is_folder.unwrap_or(false);

    let parent_path = if dir_path == "/" {
        "/".to_string()
    } else {
        normalize_dir_path(dir_path)
    };
    let mut full_path = format!("{}{}", parent_path, name);
    if is_folder && !full_path.ends_with('/') {
        full_path.push('/');
    }

    FileRecord {
        server_id: server_id.to_string(),
        name,
        full_path,
        parent_path,
        size: entry.size,
        is_folder,
        type_code: entry.type_code.clone(),
        creator_code: entry.creator_code.clone(),
    }
}

/// 展开整棵文件树
pub fn normalize_listing(server_id: &str, listing: &FileListing) -> Vec<FileRecord> {
    let Some(paths) = listing.paths.as_ref() else {
        return Vec::new();
    };

    paths
        .iter()
        .flat_map(|(dir, entries)| {
            entries
                .iter()
                .map(move |entry| normalize_entry(server_id, dir, entry))
        })
        .collect()
}

/// 按服务器 ID 分配的互斥锁
///
/// 同一服务器的「删除 + 分批插入」不会与另一个写入者交错。
#[derive(Default)]
pub struct ServerLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ServerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, server_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(server_id.to_string())
            .or_default()
            .clone()
    }
}

/// 单台服务器的文件同步结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FileSyncResult {
    pub server_id: String,
    /// 在跳过列表中，未做任何修改
    pub skipped: bool,
    pub deleted: usize,
    pub inserted: usize,
    pub chunks_committed: usize,
    pub chunks_failed: usize,
    pub errors: Vec<String>,
}

/// 用户同步结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UserSyncResult {
    pub servers_written: usize,
    pub users_written: usize,
    pub errors: Vec<String>,
}

/// 写入计划的执行者
pub struct ReconciliationEngine<G> {
    gateway: Arc<G>,
    skip_list: HashSet<String>,
    chunk_size: usize,
    locks: ServerLocks,
}

impl<G: PersistenceGateway> ReconciliationEngine<G> {
    pub fn new(gateway: Arc<G>, skip_list: HashSet<String>, chunk_size: usize) -> Self {
        Self {
            gateway,
            skip_list,
            chunk_size: chunk_size.max(1),
            locks: ServerLocks::new(),
        }
    }

    pub fn gateway(&self) -> &Arc<G> {
        &self.gateway
    }

    pub fn is_skipped(&self, server_id: &str) -> bool {
        self.skip_list.contains(server_id)
    }

    /// 整表替换服务器目录
    ///
    /// 空目录视为 tracker 异常，不修改存储。
    pub fn replace_servers(&self, servers: &[ServerDescriptor]) -> Result<usize> {
        if servers.is_empty() {
            tracing::warn!("tracker 目录为空，保留现有服务器记录");
            return Ok(0);
        }

        let written = self.gateway.replace_servers(servers)?;
        tracing::info!("服务器目录已替换: {} 条", written);
        Ok(written)
    }

    /// 按服务器替换文件树
    ///
    /// 删除先单独提交，之后每批独立提交。某批失败只丢弃这一批，
    /// 之前已提交的批次保留，之后的批次继续写入。
    pub fn reconcile_files(&self, server_id: &str, listing: &FileListing) -> Result<FileSyncResult> {
        let mut result = FileSyncResult {
            server_id: server_id.to_string(),
            ..Default::default()
        };

        if self.is_skipped(server_id) {
            tracing::debug!("[{}] 在跳过列表中，保留旧数据", server_id);
            result.skipped = true;
            return Ok(result);
        }

        if !listing.is_ok() {
            return Err(Error::Data(format!(
                "[{}] 文件列表状态异常: {:?}",
                server_id, listing.status
            )));
        }

        let lock = self.locks.lock_for(server_id);
        let _guard = lock.lock();

        result.deleted = self.gateway.delete_files_for_server(server_id)?;

        let rows = normalize_listing(server_id, listing);
        for (index, chunk) in rows.chunks(self.chunk_size).enumerate() {
            match self.gateway.insert_file_chunk(chunk) {
                Ok(n) => {
                    result.inserted += n;
                    result.chunks_committed += 1;
                    tracing::debug!("[{}] 第 {} 批写入 {} 条", server_id, index + 1, n);
                }
                Err(e) => {
                    let err_msg = format!(
                        "[{}] 第 {} 批 ({} 条) 写入失败: {}",
                        server_id,
                        index + 1,
                        chunk.len(),
                        e
                    );
                    tracing::warn!("{}", err_msg);
                    result.chunks_failed += 1;
                    result.errors.push(err_msg);
                }
            }
        }

        tracing::debug!(
            "[{}] 文件树已替换: 删除 {}, 写入 {}/{}",
            server_id,
            result.deleted,
            result.inserted,
            rows.len()
        );
        Ok(result)
    }

    /// upsert 所有成功轮询到的用户
    ///
    /// 每台服务器单独提交，一台失败不影响其他。
    pub fn upsert_users(&self, outcomes: &[PollOutcome]) -> UserSyncResult {
        let mut result = UserSyncResult::default();

        for outcome in outcomes {
            let users = outcome.users();
            if users.is_empty() {
                continue;
            }

            let lock = self.locks.lock_for(&outcome.server_id);
            let _guard = lock.lock();

            match self.gateway.upsert_users(users) {
                Ok(n) => {
                    result.servers_written += 1;
                    result.users_written += n;
                }
                Err(e) => {
                    let err_msg = format!("[{}] 用户写入失败: {}", outcome.server_id, e);
                    tracing::warn!("{}", err_msg);
                    result.errors.push(err_msg);
                }
            }
        }

        result
    }
}
