#[cfg(test)]
mod tests {
    use aqe_config::ConfigLoader;
    use aqe_config::schema::*;
    use std::io::Write;

    // ── Default tests ──────────────────────────────────────────

    #[test]
    fn test_database_config_defaults() {
        let config = DatabaseConfig::default();
        assert_eq!(config.dsn, "sqlite://aqe.db");
        assert_eq!(config.min_pool, 2);
        assert_eq!(config.max_pool, 10);
        assert_eq!(config.connect_timeout_ms, 5000);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_learning_config_defaults() {
        let config = LearningConfig::default();
        assert_eq!(config.alpha, 0.1);
        assert_eq!(config.gamma, 0.95);
        assert_eq!(config.epsilon.schedule, EpsilonScheduleKind::Exponential);
        assert_eq!(config.reward.success, 1.0);
        assert_eq!(config.reward.failure, -1.0);
    }

    #[test]
    fn test_memory_config_defaults() {
        let config = MemoryConfig::default();
        assert_eq!(config.namespace, "aqe");
        assert_eq!(config.backend, MemoryBackendKind::Sqlite);
        assert!(config.default_ttl_secs.is_none());
        assert_eq!(config.max_key_len, 512);
    }

    #[test]
    fn test_default_config_is_valid() {
        let warnings = AqeConfig::default().validate().unwrap();
        assert!(warnings.iter().all(|w| w.severity != WarningSeverity::Error));
    }

    // ── TOML tests ─────────────────────────────────────────────

    #[test]
    fn test_config_toml_roundtrip() {
        let config = AqeConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let restored: AqeConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(restored.database.dsn, config.database.dsn);
        assert_eq!(restored.learning.alpha, config.learning.alpha);
        assert_eq!(restored.memory.namespace, config.memory.namespace);
    }

    #[test]
    fn test_partial_toml_applies_defaults() {
        let toml_str = r#"
[learning]
alpha = 0.3

[learning.epsilon]
schedule = "linear"
decay = 0.01

[memory]
backend = "in_memory"
default_ttl_secs = 3600
"#;
        let config: AqeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.learning.alpha, 0.3);
        assert_eq!(config.learning.gamma, 0.95);
        assert_eq!(config.learning.epsilon.schedule, EpsilonScheduleKind::Linear);
        assert_eq!(config.learning.epsilon.initial, 0.3);
        assert_eq!(config.memory.backend, MemoryBackendKind::InMemory);
        assert_eq!(config.memory.default_ttl_secs, Some(3600));
        assert_eq!(config.database.max_pool, 10);
    }

    // ── Validation tests ───────────────────────────────────────

    #[test]
    fn test_validate_rejects_inverted_pool_bounds() {
        let mut config = AqeConfig::default();
        config.database.min_pool = 12;
        let err = config.validate().unwrap_err();
        assert!(err.contains("database.min_pool"));
    }

    #[test]
    fn test_validate_rejects_out_of_range_learning_params() {
        let mut config = AqeConfig::default();
        config.learning.alpha = 1.5;
        config.learning.gamma = -0.1;
        let err = config.validate().unwrap_err();
        assert!(err.contains("learning.alpha"));
        assert!(err.contains("learning.gamma"));
    }

    #[test]
    fn test_validate_rejects_bad_namespace() {
        let mut config = AqeConfig::default();
        config.memory.namespace = "aqe/nested".into();
        assert!(config.validate().unwrap_err().contains("memory.namespace"));
        config.memory.namespace = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_warns_on_unknown_log_format() {
        let mut config = AqeConfig::default();
        config.logging.format = "xml".into();
        let warnings = config.validate().unwrap();
        assert!(warnings.iter().any(|w| w.field == "logging.format"));
    }

    // ── ConfigLoader tests ─────────────────────────────────────

    #[test]
    fn test_config_loader_with_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("aqe.toml");
        let mut f = std::fs::File::create(&config_path).unwrap();
        writeln!(
            f,
            r#"
[database]
dsn = "sqlite:///var/lib/aqe/fleet.db"
max_pool = 4

[memory]
namespace = "fleet"
"#
        )
        .unwrap();

        let loader = ConfigLoader::load(Some(config_path.as_path())).unwrap();
        let config = loader.get();
        assert_eq!(config.database.max_pool, 4);
        assert_eq!(config.database.min_pool, 2);
        assert_eq!(config.memory.namespace, "fleet");
        assert_eq!(loader.path(), config_path.as_path());
    }

    #[test]
    fn test_config_loader_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("aqe.toml");
        std::fs::write(&config_path, "[learning]\nalpha = 7.0\n").unwrap();
        assert!(ConfigLoader::load(Some(config_path.as_path())).is_err());
    }

    #[test]
    fn test_config_loader_reload() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("aqe.toml");
        std::fs::write(&config_path, "[database]\nmax_pool = 3\n").unwrap();

        let loader = ConfigLoader::load(Some(config_path.as_path())).unwrap();
        assert_eq!(loader.get().database.max_pool, 3);

        std::fs::write(&config_path, "[database]\nmax_pool = 6\n").unwrap();
        loader.reload().unwrap();
        assert_eq!(loader.get().database.max_pool, 6);
    }

    #[test]
    fn test_config_loader_reload_keeps_config_on_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("aqe.toml");
        std::fs::write(&config_path, "[database]\nmax_pool = 3\n").unwrap();
        let loader = ConfigLoader::load(Some(config_path.as_path())).unwrap();

        std::fs::write(&config_path, "[database]\nmax_pool = 0\n").unwrap();
        assert!(loader.reload().is_err());
        assert_eq!(loader.get().database.max_pool, 3);
    }

    // ── JSON roundtrip ─────────────────────────────────────────

    #[test]
    fn test_config_json_roundtrip() {
        let config = AqeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let restored: AqeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.memory.backend, config.memory.backend);
    }
}
