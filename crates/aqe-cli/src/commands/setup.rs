use console::style;
use std::path::{Path, PathBuf};

use aqe_core::Result;

const MINIMAL_CONFIG: &str = r#"# AQE learning and shared-memory configuration

[database]
dsn = "sqlite://aqe.db"
# min_pool = 2
# max_pool = 10
# connect_timeout_ms = 5000
# busy_timeout_ms = 5000
# max_retries = 3

[learning]
alpha = 0.1
gamma = 0.95

[learning.epsilon]
schedule = "exponential"   # constant | linear | exponential
initial = 0.3
min = 0.01
decay = 0.995

[learning.reward]
# success = 1.0
# failure = -1.0
# coverage = 2.0
# baseline_secs = 60.0

[memory]
namespace = "aqe"
backend = "sqlite"         # sqlite | in_memory
# default_ttl_secs = 3600
reap_interval_secs = 60

[logging]
level = "info"
format = "pretty"          # pretty | compact | json
"#;

pub(super) fn cmd_init(local: bool) -> Result<()> {
    let dir = if local {
        std::env::current_dir()?
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".aqe")
    };
    match write_config(&dir)? {
        Some(path) => {
            println!("{} created {}", style("✓").green(), path.display());
            println!("   Edit it directly or use 'aqe set <key> <value>'.");
        }
        None => println!(
            "{} {} already exists",
            style("!").yellow(),
            dir.join("aqe.toml").display()
        ),
    }
    Ok(())
}

/// Write the starter config into `dir`. Returns `None` if one already exists.
fn write_config(dir: &Path) -> Result<Option<PathBuf>> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join("aqe.toml");
    if path.exists() {
        return Ok(None);
    }
    std::fs::write(&path, MINIMAL_CONFIG)?;
    Ok(Some(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aqe_config::{AqeConfig, ConfigLoader};

    #[test]
    fn test_starter_config_loads_and_validates() {
        let config: AqeConfig = toml::from_str(MINIMAL_CONFIG).unwrap();
        assert_eq!(config.memory.namespace, "aqe");
        assert_eq!(config.learning.gamma, 0.95);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_write_config_does_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path()).unwrap().unwrap();
        std::fs::write(&path, "[learning]\nalpha = 0.5\n").unwrap();
        assert!(write_config(dir.path()).unwrap().is_none());

        let loader = ConfigLoader::load(Some(&path)).unwrap();
        assert_eq!(loader.get().learning.alpha, 0.5);
    }
}
