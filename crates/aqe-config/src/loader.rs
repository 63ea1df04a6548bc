use notify::{Event as NotifyEvent, EventKind, RecursiveMode, Watcher};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use aqe_core::AqeError;

use crate::schema::AqeConfig;

/// Loads and optionally hot-reloads the AQE configuration.
pub struct ConfigLoader {
    config: Arc<RwLock<AqeConfig>>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > AQE_CONFIG env > ~/.aqe/aqe.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("AQE_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".aqe")
            .join("aqe.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> aqe_core::Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            let raw = std::fs::read_to_string(&config_path)?;
            Self::parse(&config_path, &raw)?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            AqeConfig::default()
        };

        let config = Self::apply_env_overrides(config);
        Self::check(&config)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Build a loader around an already-constructed config (no file backing).
    pub fn from_config(config: AqeConfig) -> aqe_core::Result<Self> {
        Self::check(&config)?;
        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path: PathBuf::new(),
        })
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> AqeConfig {
        self.config.read().clone()
    }

    /// Get a shared reference for subscription.
    pub fn shared(&self) -> Arc<RwLock<AqeConfig>> {
        Arc::clone(&self.config)
    }

    /// Path being watched.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    fn parse(path: &Path, raw: &str) -> aqe_core::Result<AqeConfig> {
        toml::from_str::<AqeConfig>(raw).map_err(|e| {
            AqeError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Log warnings, fail on errors.
    fn check(config: &AqeConfig) -> aqe_core::Result<()> {
        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
                Ok(())
            }
            Err(e) => Err(AqeError::Config(e)),
        }
    }

    /// Apply env var overrides (AQE_DATABASE_DSN, AQE_LEARNING_ALPHA, etc.)
    fn apply_env_overrides(mut config: AqeConfig) -> AqeConfig {
        if let Ok(v) = std::env::var("AQE_DATABASE_DSN") {
            config.database.dsn = v;
        }
        if let Ok(v) = std::env::var("AQE_DATABASE_MAX_POOL") {
            if let Ok(n) = v.parse::<usize>() {
                config.database.max_pool = n;
            }
        }
        if let Ok(v) = std::env::var("AQE_MEMORY_NAMESPACE") {
            config.memory.namespace = v;
        }
        if let Ok(v) = std::env::var("AQE_LEARNING_ALPHA") {
            if let Ok(alpha) = v.parse::<f64>() {
                config.learning.alpha = alpha;
            }
        }
        if let Ok(v) = std::env::var("AQE_LEARNING_GAMMA") {
            if let Ok(gamma) = v.parse::<f64>() {
                config.learning.gamma = gamma;
            }
        }
        if let Ok(v) = std::env::var("AQE_LOG_LEVEL") {
            config.logging.level = v;
        }
        config
    }

    /// Reload the config from disk.
    pub fn reload(&self) -> aqe_core::Result<()> {
        if !self.config_path.exists() {
            return Err(AqeError::Config(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let raw = std::fs::read_to_string(&self.config_path)?;
        let new_config = Self::apply_env_overrides(Self::parse(&self.config_path, &raw)?);
        Self::check(&new_config)?;
        *self.config.write() = new_config;
        info!("configuration reloaded");
        Ok(())
    }

    /// Start a background file watcher that swaps in the new config when the file changes.
    /// Returns a handle to the watcher (must be kept alive for watching to continue).
    pub fn watch(&self) -> aqe_core::Result<notify::RecommendedWatcher> {
        let config = Arc::clone(&self.config);
        let config_path = self.config_path.clone();

        info!(?config_path, "starting config file watcher");

        let path_for_event = config_path.clone();
        let mut watcher = notify::recommended_watcher(
            move |res: Result<NotifyEvent, notify::Error>| match res {
                Ok(event) => {
                    if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                        return;
                    }
                    let is_our_file = event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == path_for_event.file_name());
                    if !is_our_file {
                        return;
                    }

                    info!("config file changed, reloading");
                    let raw = match std::fs::read_to_string(&path_for_event) {
                        Ok(raw) => raw,
                        Err(e) => {
                            warn!(error = %e, "failed to read config file during hot-reload");
                            return;
                        }
                    };
                    match toml::from_str::<AqeConfig>(&raw) {
                        Ok(new_config) => {
                            let new_config = ConfigLoader::apply_env_overrides(new_config);
                            if let Err(e) = new_config.validate() {
                                warn!(
                                    error = %e,
                                    "reloaded config is invalid, keeping current config"
                                );
                                return;
                            }
                            *config.write() = new_config;
                            info!("configuration hot-reloaded successfully");
                        }
                        Err(e) => {
                            warn!(error = %e, "config file has errors, keeping current config");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "file watcher error");
                }
            },
        )
        .map_err(|e| AqeError::Config(format!("failed to create file watcher: {}", e)))?;

        // Watch the parent directory (some editors create temp files + rename)
        let watch_path = self.config_path.parent().unwrap_or(Path::new("."));
        watcher
            .watch(watch_path, RecursiveMode::NonRecursive)
            .map_err(|e| AqeError::Config(format!("failed to watch config directory: {}", e)))?;

        Ok(watcher)
    }
}
