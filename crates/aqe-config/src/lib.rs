//! # aqe-config
//!
//! Configuration system for the AQE learning subsystem. Reads from `aqe.toml`,
//! environment variables, and CLI overrides (in that precedence order).
//!
//! Components never read configuration ambiently: the loader produces an
//! [`AqeConfig`] whose sections are passed explicitly into constructors.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::AqeConfig;
pub use schema::{
    ConfigWarning, DatabaseConfig, EpsilonConfig, EpsilonScheduleKind, LearningConfig,
    LoggingConfig, MemoryBackendKind, MemoryConfig, RewardWeightsConfig, WarningSeverity,
};
