//! 持久化边界
//!
//! reconcile 只通过这个 trait 写存储。每个方法是一次独立提交：
//! 方法返回 `Ok` 即已提交，返回 `Err` 则该次写入整体回滚。

use crate::error::Result;
use crate::types::{FileRecord, ServerDescriptor, UserRecord};

/// 批量写入接口
pub trait PersistenceGateway: Send + Sync {
    /// 读取当前已入库的服务器目录（按 unique_id 排序）
    fn list_servers(&self) -> Result<Vec<ServerDescriptor>>;

    /// 删除全部服务器记录并写入新目录（单个事务）
    ///
    /// 返回写入条数
    fn replace_servers(&self, servers: &[ServerDescriptor]) -> Result<usize>;

    /// 删除某服务器的全部文件记录并立即提交
    ///
    /// 返回删除条数
    fn delete_files_for_server(&self, server_id: &str) -> Result<usize>;

    /// 写入一批文件记录（单个事务）
    ///
    /// 返回实际写入条数；(server_id, full_path) 重复的记录被忽略
    fn insert_file_chunk(&self, rows: &[FileRecord]) -> Result<usize>;

    /// 按 (server_id, user_name) upsert 在线用户（单个事务）
    fn upsert_users(&self, users: &[UserRecord]) -> Result<usize>;

    /// 记录任务完成时间 (毫秒)
    fn record_job_run(&self, script_name: &str, at_ms: i64) -> Result<()>;
}
