use super::*;

#[test]
fn test_config_defaults() {
    let config = Config::default();
    assert_eq!(config.selva_port, 3000);
    assert_eq!(config.find_indices_max, 0);
    assert_eq!(config.find_indexing_interval, 60_000);
    assert!(!config.hierarchy_sort_by_depth);
}

#[test]
fn test_config_set_get() {
    let mut config = Config::default();

    for key in CONFIG_KEYS.iter() {
        // every listed key round-trips through its string form
        let value = config.get(key).unwrap();
        config.set(key, &value).unwrap();
    }

    config.set("FIND_INDICES_MAX", "32").unwrap();
    assert_eq!(config.find_indices_max, 32);
    assert_eq!(config.get("FIND_INDICES_MAX").unwrap(), "32");

    config.set("HIERARCHY_SORT_BY_DEPTH", "1").unwrap();
    assert!(config.hierarchy_sort_by_depth);

    assert!(config.set("FIND_INDICES_MAX", "not-a-number").is_err());
    assert!(config.set("NO_SUCH_KEY", "1").is_err());
    assert!(config.get("NO_SUCH_KEY").is_err());
}

#[test]
fn test_config_from_env() {
    std::env::set_var("FIND_INDEXING_THRESHOLD", "12.5");
    let config = Config::from_env().unwrap();
    assert_eq!(config.find_indexing_threshold, 12.5);
    std::env::remove_var("FIND_INDEXING_THRESHOLD");
}
