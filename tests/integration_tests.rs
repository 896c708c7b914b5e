//! 集成测试

use hotline_mirror::reconcile::normalize_listing;
use hotline_mirror::*;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tempfile::TempDir;

/// 创建临时数据库
fn setup_db() -> (MirrorDB, TempDir) {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("test.db");
    let config = DbConfig::local(&db_path);
    let db = MirrorDB::connect(config).unwrap();
    (db, tmp)
}

fn server(unique_id: &str, user_count: i64) -> ServerDescriptor {
    ServerDescriptor {
        unique_id: unique_id.into(),
        name: format!("Server {}", unique_id),
        description: None,
        ip: "203.0.113.10".into(),
        port: 5500,
        user_count,
        server_type: None,
        filtered: None,
        filtered_by: None,
        last_checked_in: Some("2024-05-01T12:00:00Z".into()),
        mirror_sources: vec!["hltracker.com".into(), "tracked.example".into()],
    }
}

fn user(server_id: &str, name: &str, icon_id: u16, observed_at: i64) -> UserRecord {
    UserRecord {
        server_id: server_id.into(),
        server_name: format!("Server {}", server_id),
        user_name: name.into(),
        icon_id,
        observed_at,
    }
}

fn listing(count: usize) -> FileListing {
    let entries = (0..count)
        .map(|i| FileEntry {
            name: Some(format!("file{:05}.txt", i)),
            size: Some(i as i64),
            is_folder: Some(false),
            type_code: Some("TEXT".into()),
            creator_code: Some("ttxt".into()),
        })
        .collect();
    let mut paths = BTreeMap::new();
    paths.insert("/Files".to_string(), entries);
    FileListing {
        status: Some("ok".into()),
        paths: Some(paths),
    }
}

// ==================== DB 连接测试 ====================

mod connection_tests {
    use super::*;

    #[test]
    fn test_connect_creates_db_file() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("subdir").join("test.db");

        // 目录不存在
        assert!(!db_path.parent().unwrap().exists());

        let _db = MirrorDB::connect(DbConfig::local(&db_path)).unwrap();

        // 连接后文件应该存在
        assert!(db_path.exists());
    }

    #[test]
    fn test_connect_existing_db() {
        let (db1, tmp) = setup_db();
        db1.replace_servers(&[server("a", 1)]).unwrap();
        drop(db1);

        // 重新连接同一个数据库，schema 可重复执行
        let db2 = MirrorDB::connect(DbConfig::local(tmp.path().join("test.db"))).unwrap();
        assert_eq!(db2.get_stats().unwrap().server_count, 1);
    }

    #[test]
    fn test_users_unique_constraint_exists() {
        let (db, _tmp) = setup_db();
        let conn = db.connection().lock();
        let sql: String = conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = 'hotline_users'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(sql.contains(schema::USERS_UNIQUE_CONSTRAINT));
    }
}

// ==================== Server 测试 ====================

mod server_tests {
    use super::*;

    #[test]
    fn test_replace_servers_drops_missing() {
        let (db, _tmp) = setup_db();

        db.replace_servers(&[server("a", 1), server("b", 2)]).unwrap();
        db.replace_servers(&[server("b", 5), server("c", 0)]).unwrap();

        let servers = db.list_servers().unwrap();
        let ids: Vec<_> = servers.iter().map(|s| s.unique_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(servers[0].user_count, 5);
        assert_eq!(
            servers[0].mirror_sources,
            vec!["hltracker.com".to_string(), "tracked.example".to_string()]
        );
    }

    #[test]
    fn test_duplicate_ids_in_directory_keep_last() {
        let (db, _tmp) = setup_db();
        let mut second = server("a", 9);
        second.name = "Renamed".into();

        db.replace_servers(&[server("a", 1), second]).unwrap();

        let servers = db.list_servers().unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].name, "Renamed");
    }

    #[test]
    fn test_engine_ignores_empty_directory() {
        let (db, _tmp) = setup_db();
        db.replace_servers(&[server("a", 1)]).unwrap();

        let engine = ReconciliationEngine::new(Arc::new(db), HashSet::new(), 5000);
        assert_eq!(engine.replace_servers(&[]).unwrap(), 0);
        assert_eq!(engine.gateway().list_servers().unwrap().len(), 1);
    }
}

// ==================== File 测试 ====================

mod file_tests {
    use super::*;

    #[test]
    fn test_reconcile_replaces_server_files() {
        let (db, _tmp) = setup_db();
        let engine = ReconciliationEngine::new(Arc::new(db), HashSet::new(), 5000);

        engine.reconcile_files("s1", &listing(10)).unwrap();
        let result = engine.reconcile_files("s1", &listing(3)).unwrap();

        assert_eq!(result.deleted, 10);
        assert_eq!(result.inserted, 3);
        let files = engine.gateway().list_files("s1").unwrap();
        assert_eq!(files.len(), 3);
        assert_eq!(files[0].full_path, "/Files/file00000.txt");
        assert_eq!(files[0].parent_path, "/Files/");
    }

    #[test]
    fn test_chunked_insert_into_sqlite() {
        let (db, _tmp) = setup_db();
        let engine = ReconciliationEngine::new(Arc::new(db), HashSet::new(), 5000);

        let result = engine.reconcile_files("s1", &listing(12_000)).unwrap();

        assert_eq!(result.chunks_committed, 3);
        assert_eq!(result.inserted, 12_000);
        assert_eq!(engine.gateway().count_files("s1").unwrap(), 12_000);
    }

    #[test]
    fn test_skip_list_leaves_rows_unchanged() {
        let (db, _tmp) = setup_db();
        let skip: HashSet<String> = ["s1".to_string()].into_iter().collect();
        let rows = normalize_listing("s1", &listing(4));
        db.insert_file_chunk(&rows).unwrap();

        let engine = ReconciliationEngine::new(Arc::new(db), skip, 5000);
        let result = engine.reconcile_files("s1", &listing(100)).unwrap();

        assert!(result.skipped);
        assert_eq!(engine.gateway().list_files("s1").unwrap(), rows);
    }

    #[test]
    fn test_duplicate_paths_in_listing_ignored() {
        let (db, _tmp) = setup_db();
        let engine = ReconciliationEngine::new(Arc::new(db), HashSet::new(), 2);

        let mut paths = BTreeMap::new();
        let entry = FileEntry {
            name: Some("dup.txt".into()),
            ..Default::default()
        };
        // 两种写法归一化后是同一目录
        paths.insert("/A".to_string(), vec![entry.clone(), entry.clone()]);
        paths.insert("A/".to_string(), vec![entry]);
        let listing = FileListing {
            status: Some("ok".into()),
            paths: Some(paths),
        };

        let result = engine.reconcile_files("s1", &listing).unwrap();
        assert_eq!(result.chunks_failed, 0);
        assert_eq!(result.inserted, 1);
        assert_eq!(engine.gateway().count_files("s1").unwrap(), 1);
    }
}

// ==================== User 测试 ====================

mod user_tests {
    use super::*;

    #[test]
    fn test_upsert_twice_keeps_one_row() {
        let (db, _tmp) = setup_db();

        db.upsert_users(&[user("s1", "alice", 128, 1_000)]).unwrap();
        db.upsert_users(&[user("s1", "alice", 191, 2_000)]).unwrap();

        let users = db.list_users("s1").unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].icon_id, 191);
        assert_eq!(users[0].observed_at, 2_000);
    }

    #[test]
    fn test_users_are_never_deleted() {
        let (db, _tmp) = setup_db();
        let engine = ReconciliationEngine::new(Arc::new(db), HashSet::new(), 5000);

        let first = PollOutcome {
            server_id: "s1".into(),
            status: PollStatus::Success(vec![user("s1", "alice", 1, 1_000), user("s1", "bob", 2, 1_000)]),
        };
        let second = PollOutcome {
            server_id: "s1".into(),
            status: PollStatus::Success(vec![user("s1", "bob", 3, 2_000)]),
        };
        engine.upsert_users(&[first]);
        let result = engine.upsert_users(&[second]);
        assert_eq!(result.users_written, 1);

        let users = engine.gateway().list_users("s1").unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].user_name, "alice");
        assert_eq!(users[0].observed_at, 1_000);
        assert_eq!(users[1].icon_id, 3);
    }

    #[test]
    fn test_same_name_on_two_servers() {
        let (db, _tmp) = setup_db();
        db.upsert_users(&[user("s1", "guest", 1, 1), user("s2", "guest", 1, 1)])
            .unwrap();
        assert_eq!(db.get_stats().unwrap().user_count, 2);
    }
}

// ==================== 配置测试 ====================

mod config_tests {
    use super::*;

    #[test]
    fn test_load_full_config() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "db_path": "/var/lib/hotline/mirror.db",
                "servers_to_skip_refresh": ["big-server", "slow-server"],
                "tracker_url": "http://tracker.example/servers",
                "login": {"username": "mirror", "icon_id": 414},
                "timeouts": {"login_ms": 500},
                "pool_size": 8,
                "include_loopback": true
            }"#,
        )
        .unwrap();

        let config = MirrorConfig::load(&path).unwrap();
        assert_eq!(config.servers_to_skip_refresh.len(), 2);
        assert!(config.servers_to_skip_refresh.contains("slow-server"));
        assert_eq!(config.login.username, "mirror");
        assert_eq!(config.login.icon_id, 414);
        assert_eq!(config.timeouts.login_ms, 500);
        assert_eq!(config.timeouts.query_ms, 10_000);
        assert_eq!(config.pool_size, 8);
        assert_eq!(config.file_batch_size, 5000);
        assert!(config.include_loopback);

        let settings = PollSettings::from(&config);
        assert_eq!(settings.username, "mirror");
        assert_eq!(settings.icon_id, 414);
    }

    #[test]
    fn test_db_config_from_mirror_config() {
        let tmp = TempDir::new().unwrap();
        let config = MirrorConfig::new(tmp.path().join("m.db"), HashSet::new());
        let db = MirrorDB::connect(config.db_config()).unwrap();
        assert_eq!(db.get_stats().unwrap().file_count, 0);
        assert!(tmp.path().join("m.db").exists());
    }
}
