//! 数据库连接和操作

use crate::config::DbConfig;
use crate::error::Result;
use crate::gateway::PersistenceGateway;
use crate::schema;
use crate::types::{FileRecord, JobRun, ServerDescriptor, UserRecord};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;

/// 镜像数据库
///
/// 所有写入经过同一把连接锁，天然串行。
pub struct MirrorDB {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

/// 统计信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    pub server_count: i64,
    pub file_count: i64,
    pub user_count: i64,
}

impl MirrorDB {
    /// 连接本地 SQLite
    pub fn connect(config: DbConfig) -> Result<Self> {
        let path = config.path();

        // 确保目录存在
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path)?;
        Self::init(conn, &config)
    }

    /// 内存数据库 (测试用)
    #[doc(hidden)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, &DbConfig::local(":memory:"))
    }

    fn init(conn: Connection, config: &DbConfig) -> Result<Self> {
        conn.execute_batch(schema::SCHEMA_SQL)?;
        tracing::info!("数据库已连接: {:?}", Path::new(&config.url));

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 获取底层连接 (用于测试)
    #[doc(hidden)]
    pub fn connection(&self) -> &Arc<Mutex<Connection>> {
        &self.conn
    }

    // ==================== File 查询 ====================

    /// 获取某服务器的文件记录（按 full_path 排序）
    pub fn list_files(&self, server_id: &str) -> Result<Vec<FileRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT server_id, name, full_path, parent_path, size, is_folder, type_code, creator_code
            FROM hotline_files
            WHERE server_id = ?1
            ORDER BY full_path
            "#,
        )?;

        let rows = stmt.query_map(params![server_id], |row| {
            Ok(FileRecord {
                server_id: row.get(0)?,
                name: row.get(1)?,
                full_path: row.get(2)?,
                parent_path: row.get(3)?,
                size: row.get(4)?,
                is_folder: row.get(5)?,
                type_code: row.get(6)?,
                creator_code: row.get(7)?,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// 某服务器的文件记录数
    pub fn count_files(&self, server_id: &str) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM hotline_files WHERE server_id = ?1",
            params![server_id],
            |row| row.get(0),
        )
        .map_err(Into::into)
    }

    // ==================== User 查询 ====================

    /// 获取某服务器的在线用户记录（按 user_name 排序）
    pub fn list_users(&self, server_id: &str) -> Result<Vec<UserRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT server_unique_id, server_name, user_name, user_icon_id, timestamp
            FROM hotline_users
            WHERE server_unique_id = ?1
            ORDER BY user_name
            "#,
        )?;

        let rows = stmt.query_map(params![server_id], |row| {
            Ok(UserRecord {
                server_id: row.get(0)?,
                server_name: row.get(1)?,
                user_name: row.get(2)?,
                icon_id: row.get(3)?,
                observed_at: row.get(4)?,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    // ==================== 运行日志 ====================

    /// 获取任务最近一次完成时间
    pub fn get_job_run(&self, script_name: &str) -> Result<Option<JobRun>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT script_name, last_run_utc FROM script_log WHERE script_name = ?1",
            params![script_name],
            |row| {
                Ok(JobRun {
                    script_name: row.get(0)?,
                    last_run_utc: row.get(1)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    /// 获取统计信息
    pub fn get_stats(&self) -> Result<Stats> {
        let conn = self.conn.lock();
        let server_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM hotline_servers", [], |row| row.get(0))?;
        let file_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM hotline_files", [], |row| row.get(0))?;
        let user_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM hotline_users", [], |row| row.get(0))?;

        Ok(Stats {
            server_count,
            file_count,
            user_count,
        })
    }
}

impl PersistenceGateway for MirrorDB {
    fn list_servers(&self) -> Result<Vec<ServerDescriptor>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT unique_id, name, description, ip, port, user_count, server_type,
                   filtered, filtered_by, last_checked_in, mirror_sources
            FROM hotline_servers
            ORDER BY unique_id
            "#,
        )?;

        let rows = stmt.query_map([], |row| {
            let mirror_sources: String = row.get(10)?;
            Ok(ServerDescriptor {
                unique_id: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
                ip: row.get(3)?,
                port: row.get(4)?,
                user_count: row.get(5)?,
                server_type: row.get(6)?,
                filtered: row.get(7)?,
                filtered_by: row.get(8)?,
                last_checked_in: row.get(9)?,
                mirror_sources: ServerDescriptor::split_mirror_sources(&mirror_sources),
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    fn replace_servers(&self, servers: &[ServerDescriptor]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM hotline_servers", [])?;

        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT OR REPLACE INTO hotline_servers (
                    unique_id, name, description, ip, port, user_count,
                    server_type, filtered, filtered_by, last_checked_in, mirror_sources
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                "#,
            )?;
            for server in servers {
                inserted += stmt.execute(params![
                    &server.unique_id,
                    &server.name,
                    &server.description,
                    &server.ip,
                    server.port,
                    server.user_count,
                    &server.server_type,
                    &server.filtered,
                    &server.filtered_by,
                    &server.last_checked_in,
                    server.mirror_sources_joined(),
                ])?;
            }
        }

        tx.commit()?;
        Ok(inserted)
    }

    fn delete_files_for_server(&self, server_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM hotline_files WHERE server_id = ?1",
            params![server_id],
        )?;
        Ok(deleted)
    }

    fn insert_file_chunk(&self, rows: &[FileRecord]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT OR IGNORE INTO hotline_files (
                    server_id, name, full_path, parent_path, size,
                    is_folder, type_code, creator_code
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )?;
            for row in rows {
                inserted += stmt.execute(params![
                    &row.server_id,
                    &row.name,
                    &row.full_path,
                    &row.parent_path,
                    &row.size,
                    row.is_folder,
                    &row.type_code,
                    &row.creator_code,
                ])?;
            }
        }

        tx.commit()?;
        Ok(inserted)
    }

    fn upsert_users(&self, users: &[UserRecord]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let mut written = 0;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO hotline_users (server_unique_id, server_name, user_name, user_icon_id, timestamp)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(server_unique_id, user_name) DO UPDATE SET
                    user_icon_id = excluded.user_icon_id,
                    timestamp = excluded.timestamp
                "#,
            )?;
            for user in users {
                written += stmt.execute(params![
                    &user.server_id,
                    &user.server_name,
                    &user.user_name,
                    user.icon_id,
                    user.observed_at,
                ])?;
            }
        }

        tx.commit()?;
        Ok(written)
    }

    fn record_job_run(&self, script_name: &str, at_ms: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO script_log (script_name, last_run_utc) VALUES (?1, ?2)
            ON CONFLICT(script_name) DO UPDATE SET last_run_utc = excluded.last_run_utc
            "#,
            params![script_name, at_ms],
        )?;
        Ok(())
    }
}

/// 获取当前时间戳 (毫秒)
pub fn current_time_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
