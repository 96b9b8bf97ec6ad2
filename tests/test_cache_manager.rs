use std::collections::HashMap;
use std::fs;

use nna_cache::{CacheConfig, CacheManager, DbKind, Error};
use tempfile::TempDir;

// Common test setup
fn setup_test_env() -> (TempDir, CacheConfig, CacheManager) {
    let temp_dir = TempDir::new().unwrap();
    let config = CacheConfig::new(temp_dir.path());
    let mut manager = CacheManager::new();
    manager.start(&config).unwrap();
    (temp_dir, config, manager)
}

#[test]
fn test_start_creates_db_dir() {
    let temp_dir = TempDir::new().unwrap();
    let base = temp_dir.path().join("nested").join("base");
    let config = CacheConfig::new(&base);
    let mut manager = CacheManager::new();
    manager.start(&config).unwrap();
    assert!(base.join("db").is_dir());
    assert!(base.join("db").join("nna_cache").is_file());
    assert_eq!(fs::read_dir(base.join("db")).unwrap().count(), 1);
}

#[test]
fn test_start_keeps_existing_dir() {
    let (_dir, config, mut manager) = setup_test_env();
    manager.cached_set("hosts").unwrap().insert("dn1").unwrap();
    manager.commit().unwrap();
    manager.stop();

    fs::write(config.db_dir().join("unrelated"), b"keep me").unwrap();
    manager.start(&config).unwrap();
    assert!(manager.cached_set("hosts").unwrap().contains("dn1").unwrap());
    assert_eq!(
        fs::read(config.db_dir().join("unrelated")).unwrap(),
        b"keep me"
    );
}

#[test]
fn test_double_start_fails() {
    let (_dir, config, mut manager) = setup_test_env();
    assert!(matches!(
        manager.start(&config),
        Err(Error::EnvAlreadyOpen(_))
    ));
    assert!(manager.is_started());

    let mut other = CacheManager::new();
    assert!(matches!(other.start(&config), Err(Error::EnvAlreadyOpen(_))));
    assert!(!other.is_started());
}

#[test]
fn test_closed_manager() {
    let mut manager = CacheManager::new();
    assert!(matches!(manager.cached_map("m"), Err(Error::EnvClosed)));
    assert!(matches!(manager.commit(), Err(Error::EnvClosed)));
    manager.stop();

    let (_dir, _config, mut manager) = setup_test_env();
    manager.stop();
    assert!(matches!(manager.cached_set("s"), Err(Error::EnvClosed)));
    assert!(matches!(manager.cached_string_map("s"), Err(Error::EnvClosed)));
    assert!(matches!(manager.cached_map_to_map("s"), Err(Error::EnvClosed)));
    manager.stop();
}

#[test]
fn test_same_name_same_data() {
    let (_dir, _config, manager) = setup_test_env();
    let a = manager.cached_map("fileCount").unwrap();
    let b = manager.cached_map("fileCount").unwrap();
    a.insert("user1", 7).unwrap();
    assert_eq!(b.get("user1").unwrap(), Some(7));
    manager.commit().unwrap();
    b.insert("user2", 8).unwrap();
    assert_eq!(a.get("user2").unwrap(), Some(8));
    assert_eq!(a.len().unwrap(), 2);
}

#[test]
fn test_kind_mismatch() {
    let (_dir, _config, manager) = setup_test_env();
    manager.cached_map("users").unwrap();
    match manager.cached_set("users") {
        Err(Error::Incompatible {
            name,
            expected,
            found,
        }) => {
            assert_eq!(name, "users");
            assert_eq!(expected, DbKind::StringSet);
            assert_eq!(found, DbKind::LongMap);
        }
        other => panic!("unexpected: {:?}", other.map(|_| ())),
    }
    assert!(matches!(manager.cached_map(""), Err(Error::BadName(_))));
}

#[test]
fn test_durability_round_trip() {
    let (_dir, config, mut manager) = setup_test_env();
    {
        let counts = manager.cached_map("counts").unwrap();
        let names = manager.cached_string_map("names").unwrap();
        counts.insert("a", 1).unwrap();
        names.insert("k", "committed".to_string()).unwrap();
        manager.commit().unwrap();
        counts.insert("b", 2).unwrap();
        names.insert("k", "pending".to_string()).unwrap();
        manager.cached_set("never").unwrap().insert("x").unwrap();
    }
    manager.stop();
    manager.start(&config).unwrap();

    let counts = manager.cached_map("counts").unwrap();
    assert_eq!(counts.get("a").unwrap(), Some(1));
    assert_eq!(counts.get("b").unwrap(), None);
    let names = manager.cached_string_map("names").unwrap();
    assert_eq!(names.get("k").unwrap().as_deref(), Some("committed"));
    assert!(!manager
        .environment()
        .unwrap()
        .db_names()
        .contains(&"never".to_string()));
}

#[test]
fn test_set_semantics() {
    let (_dir, config, mut manager) = setup_test_env();
    {
        let set = manager.cached_set("dirs").unwrap();
        for member in ["/b", "/a", "/c", "/a", "/b"] {
            set.insert(member).unwrap();
        }
        assert_eq!(set.len().unwrap(), 3);
        manager.commit().unwrap();
    }
    manager.stop();
    manager.start(&config).unwrap();

    let set = manager.cached_set("dirs").unwrap();
    let members: Vec<String> = set.iter().unwrap().map(Result::unwrap).collect();
    assert_eq!(members, vec!["/a", "/b", "/c"]);
    assert!(!set.insert("/c").unwrap());
}

#[test]
fn test_nested_map_fidelity() {
    let (_dir, config, mut manager) = setup_test_env();
    let mut usage = HashMap::new();
    usage.insert("hdfs".to_string(), i64::MAX);
    usage.insert("yarn".to_string(), -42);
    usage.insert("ünïcode".to_string(), 0);
    {
        let map = manager.cached_map_to_map("usage").unwrap();
        map.insert("2024-01", usage.clone()).unwrap();
        map.insert("empty", HashMap::new()).unwrap();
        manager.commit().unwrap();
    }
    manager.stop();
    manager.start(&config).unwrap();

    let map = manager.cached_map_to_map("usage").unwrap();
    assert_eq!(map.get("2024-01").unwrap(), Some(usage));
    assert_eq!(map.get("empty").unwrap(), Some(HashMap::new()));
}

#[test]
fn test_rollback_keeps_containers() {
    let (_dir, _config, manager) = setup_test_env();
    let map = manager.cached_map("m").unwrap();
    map.insert("a", 1).unwrap();
    manager.rollback().unwrap();
    assert!(map.is_empty().unwrap());
    map.insert("b", 2).unwrap();
    manager.commit().unwrap();
    assert_eq!(map.get("b").unwrap(), Some(2));
}

#[test]
fn test_without_mmap() {
    let temp_dir = TempDir::new().unwrap();
    let config = CacheConfig::new(temp_dir.path()).mmap(false).sync(false);
    let mut manager = CacheManager::new();
    manager.start(&config).unwrap();
    assert!(!manager.environment().unwrap().info().mapped);
    manager.cached_map("m").unwrap().insert("k", 5).unwrap();
    manager.commit().unwrap();
    manager.stop();

    manager.start(&config).unwrap();
    assert_eq!(manager.cached_map("m").unwrap().get("k").unwrap(), Some(5));
}

#[test]
fn test_start_rejects_huge_growth_step() {
    let temp_dir = TempDir::new().unwrap();
    let config = CacheConfig::new(temp_dir.path()).map_growth(usize::MAX);
    let mut manager = CacheManager::new();
    assert!(matches!(
        manager.start(&config),
        Err(Error::EnvInvalidConfig(_))
    ));
    assert!(!manager.is_started());
    assert!(!config.db_path().exists());
}
