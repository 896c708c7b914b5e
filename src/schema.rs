//! 数据库 Schema 定义

/// 唯一约束名：在线用户 upsert 的冲突键
pub const USERS_UNIQUE_CONSTRAINT: &str = "uq_hotline_users_server_user";

/// 核心 Schema SQL
pub const SCHEMA_SQL: &str = r#"
-- tracker 目录（每个 cycle 整体替换）
CREATE TABLE IF NOT EXISTS hotline_servers (
    unique_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT,
    ip TEXT NOT NULL,
    port INTEGER NOT NULL,
    user_count INTEGER NOT NULL DEFAULT 0,
    server_type TEXT,
    filtered INTEGER,
    filtered_by TEXT,
    last_checked_in TEXT,
    mirror_sources TEXT NOT NULL DEFAULT ''   -- 逗号拼接
);

-- 文件树（按服务器整体删除后重建）
CREATE TABLE IF NOT EXISTS hotline_files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    server_id TEXT NOT NULL,
    name TEXT NOT NULL,
    full_path TEXT NOT NULL,
    parent_path TEXT NOT NULL,
    size INTEGER,
    is_folder INTEGER NOT NULL DEFAULT 0,
    type_code TEXT,
    creator_code TEXT,
    UNIQUE (server_id, full_path)
);

-- 在线用户（只 upsert，不删除）
CREATE TABLE IF NOT EXISTS hotline_users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    server_unique_id TEXT NOT NULL,
    server_name TEXT NOT NULL,
    user_name TEXT NOT NULL,
    user_icon_id INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,   -- 毫秒时间戳
    CONSTRAINT uq_hotline_users_server_user UNIQUE (server_unique_id, user_name)
);

-- 任务运行日志（外部存活探测用）
CREATE TABLE IF NOT EXISTS script_log (
    script_name TEXT PRIMARY KEY,
    last_run_utc INTEGER NOT NULL   -- 毫秒时间戳
);

-- 索引
CREATE INDEX IF NOT EXISTS idx_hotline_files_server ON hotline_files(server_id);
CREATE INDEX IF NOT EXISTS idx_hotline_files_parent ON hotline_files(server_id, parent_path);
CREATE INDEX IF NOT EXISTS idx_hotline_users_timestamp ON hotline_users(timestamp);
"#;
