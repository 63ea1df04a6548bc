use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use console::style;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;

use aqe_config::{AqeConfig, ConfigLoader, WarningSeverity};
use aqe_core::{AqeError, Result, SessionId};
use aqe_memory::ConnectionManager;

mod learning;
mod memory;
mod setup;

/// AQE: learning and shared memory for quality-engineering agents
#[derive(Parser)]
#[command(name = "aqe", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to aqe.toml config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database connection string, overriding `database.dsn`
    #[arg(long, global = true, env = "AQE_DSN")]
    dsn: Option<String>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read and write the shared-memory blackboard
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },
    /// Manage learning sessions and agent types
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Inspect or reset learned Q-values
    Qtable {
        #[command(subcommand)]
        action: QTableAction,
    },
    /// Replay recorded transitions
    Trajectory {
        #[command(subcommand)]
        action: TrajectoryAction,
    },
    /// Choose an action for a context with the current policy
    Decide {
        /// Agent type, e.g. test-generator
        agent: String,
        /// Task context as JSON
        context: String,
        /// Candidate action (repeatable)
        #[arg(short, long = "action", required = true)]
        actions: Vec<String>,
        /// Exploration rate; derived from the epsilon schedule when omitted
        #[arg(short, long)]
        epsilon: Option<f64>,
        /// 1-based episode fed to the epsilon schedule
        #[arg(long, default_value = "1")]
        episode: u64,
    },
    /// Apply one learning update from a task outcome
    Learn {
        /// Agent type
        agent: String,
        /// Session the transition belongs to
        #[arg(short, long)]
        session: String,
        /// Task context the action was taken in (JSON)
        #[arg(long)]
        context: String,
        /// Action that was executed
        #[arg(short, long)]
        action: String,
        /// Task outcome (JSON), e.g. '{"success": true, "coverage_delta": 5}'
        #[arg(short, long)]
        outcome: String,
        /// Context after the action (JSON); defaults to `--context`
        #[arg(long)]
        next_context: Option<String>,
        /// Actions available in the next state (repeatable)
        #[arg(long = "next-action")]
        next_actions: Vec<String>,
    },
    /// Compute the reward for a task outcome without learning from it
    Reward {
        /// Task outcome as JSON
        outcome: String,
        /// Task context as JSON (drives the difficulty multiplier)
        #[arg(long)]
        context: Option<String>,
    },
    /// Show version and build info
    Version,
    /// Show current configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Set a config value in aqe.toml (dot-notation key)
    Set {
        /// Config key in dot notation (e.g. learning.alpha, memory.namespace)
        key: String,
        /// Value to set
        value: String,
    },
    /// Check configuration and store health
    Doctor,
    /// Initialize a new aqe.toml in the current or home directory
    Init {
        /// Create in current directory instead of ~/.aqe/
        #[arg(long)]
        local: bool,
    },
    /// Generate shell completions for bash, zsh, or fish
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum MemoryAction {
    /// Store a value (JSON, or a plain string) under a key
    Store {
        key: String,
        value: String,
        /// Time to live in seconds
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Print a value
    Get {
        key: String,
        /// Show timestamps and size as well
        #[arg(long)]
        entry: bool,
    },
    /// Find entries whose key matches a `*` glob
    Search { pattern: String },
    /// Delete a key
    Delete { key: String },
    /// List live keys under a prefix
    Keys { prefix: Option<String> },
    /// Entry count and total size
    Stats,
    /// Delete expired entries now
    Purge,
    /// Run the expiry reaper until interrupted
    Reap {
        /// Seconds between passes; `memory.reap_interval_secs` when omitted
        #[arg(long)]
        interval: Option<u64>,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Register an agent type
    Register {
        agent: String,
        /// Human-readable name
        #[arg(long)]
        name: Option<String>,
    },
    /// List registered agent types
    Agents,
    /// Open a session (episode) for an agent type
    Open { agent: String },
    /// Close a session
    Close { id: String },
    /// Show one session
    Show { id: String },
    /// List an agent type's sessions
    List { agent: String },
}

#[derive(Subcommand)]
enum QTableAction {
    /// Print an agent type's learned values
    Show {
        agent: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Drop an agent type's learned values
    Reset {
        agent: String,
        /// Skip the confirmation guard
        #[arg(long)]
        yes: bool,
    },
    /// Rebuild and print the best-action pattern per state
    Patterns {
        agent: String,
        /// Minimum visits for an action to qualify
        #[arg(long, default_value = "1")]
        min_visits: u64,
    },
}

#[derive(Subcommand)]
enum TrajectoryAction {
    /// Print a session's transitions in order
    Replay {
        id: String,
        /// Rows fetched per query
        #[arg(long, default_value = "500")]
        page_size: usize,
        /// One JSON object per line
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        // Load config first so we can use it for log format
        let config_loader = ConfigLoader::load(self.config.as_deref())?;
        let mut config = config_loader.get();
        if let Some(dsn) = self.dsn {
            config.database.dsn = dsn;
        }

        // --verbose > --quiet > --log-level > config
        let log_level = if self.verbose {
            "debug".to_string()
        } else if self.quiet {
            "error".to_string()
        } else {
            self.log_level.unwrap_or_else(|| config.logging.level.clone())
        };
        init_tracing(&config, &log_level);

        match self.command {
            Commands::Memory { action } => memory::cmd_memory(&config, action).await,
            Commands::Session { action } => learning::cmd_session(&config, action).await,
            Commands::Qtable { action } => learning::cmd_qtable(&config, action).await,
            Commands::Trajectory { action } => learning::cmd_trajectory(&config, action).await,
            Commands::Decide {
                agent,
                context,
                actions,
                epsilon,
                episode,
            } => learning::cmd_decide(&config, &agent, &context, &actions, epsilon, episode).await,
            Commands::Learn {
                agent,
                session,
                context,
                action,
                outcome,
                next_context,
                next_actions,
            } => {
                let request = learning::LearnRequest {
                    agent,
                    session,
                    context,
                    action,
                    outcome,
                    next_context,
                    next_actions,
                };
                learning::cmd_learn(&config, request).await
            }
            Commands::Reward { outcome, context } => {
                learning::cmd_reward(&config, &outcome, context.as_deref())
            }
            Commands::Version => Self::cmd_version(),
            Commands::Config { json } => Self::cmd_config(&config, json),
            Commands::Set { key, value } => {
                Self::cmd_config_set(ConfigLoader::resolve_path(self.config.as_deref()), key, value)
            }
            Commands::Doctor => Self::cmd_doctor(&config).await,
            Commands::Init { local } => setup::cmd_init(local),
            Commands::Completions { shell } => Self::cmd_completions(shell),
        }
    }

    fn cmd_config(config: &AqeConfig, json: bool) -> Result<()> {
        if json {
            println!("{}", serde_json::to_string_pretty(config)?);
        } else {
            println!(
                "{}",
                toml::to_string_pretty(config).map_err(|e| AqeError::Config(e.to_string()))?
            );
        }
        Ok(())
    }

    fn cmd_config_set(path: PathBuf, key: String, value: String) -> Result<()> {
        if !path.exists() {
            return Err(AqeError::Config(format!(
                "{} does not exist. Run 'aqe init' first.",
                path.display()
            )));
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| AqeError::Config(format!("Cannot read {}: {}", path.display(), e)))?;
        let mut doc = content
            .parse::<toml_edit::DocumentMut>()
            .map_err(|e| AqeError::Config(format!("Invalid TOML in {}: {}", path.display(), e)))?;

        let old_value = set_dotted(&mut doc, &key, &value)?;

        // Refuse to write a document the loader would reject
        let updated: AqeConfig =
            toml::from_str(&doc.to_string()).map_err(|e| AqeError::Config(format!("{key}: {e}")))?;
        updated.validate().map_err(AqeError::Config)?;

        std::fs::write(&path, doc.to_string())
            .map_err(|e| AqeError::Config(format!("Cannot write {}: {}", path.display(), e)))?;

        match old_value {
            Some(old) => println!(
                "{} {} = {} (was {})",
                style("✓").green(),
                key,
                value,
                old.trim()
            ),
            None => println!("{} {key} = {value} (new)", style("✓").green()),
        }
        Ok(())
    }

    async fn cmd_doctor(config: &AqeConfig) -> Result<()> {
        println!("{}", style("AQE doctor").bold());
        println!();

        let warnings = match config.validate() {
            Ok(w) => w,
            Err(e) => {
                println!("{e}");
                return Ok(());
            }
        };
        let mut warn_count = 0;
        for w in &warnings {
            println!("  {w}");
            if w.severity == WarningSeverity::Warning {
                warn_count += 1;
            }
        }
        if warnings.is_empty() {
            println!("  {} configuration is valid", style("✓").green());
        }

        let db = match ConnectionManager::from_config(&config.database).await {
            Ok(db) => db,
            Err(e) => {
                println!("  {} database {}: {e}", style("✗").red(), config.database.dsn);
                return Ok(());
            }
        };
        let version = match db
            .fetch_optional("PRAGMA user_version", vec![])
            .await?
            .and_then(|row| row.into_iter().next())
        {
            Some(aqe_memory::SqlValue::Integer(v)) => v,
            _ => 0,
        };
        let status = db.status();
        println!(
            "  {} database {} (schema v{version}, pool {}/{} open)",
            style("✓").green(),
            db.dsn(),
            status.size,
            status.max_size
        );

        match aqe_memory::PersistentMemory::open(&config.memory, Some(db.clone())) {
            Ok(memory) => {
                let stats = memory.stats().await?;
                println!(
                    "  {} memory '{}' on {} ({} entries, {} bytes)",
                    style("✓").green(),
                    memory.namespace().root(),
                    memory.backend_kind(),
                    stats.entry_count,
                    stats.total_size_bytes
                );
            }
            Err(e) => println!("  {} memory: {e}", style("✗").red()),
        }
        db.disconnect();

        println!();
        println!("  {warn_count} warnings");
        Ok(())
    }

    fn cmd_version() -> Result<()> {
        println!("aqe v{}", env!("CARGO_PKG_VERSION"));
        println!("   Schema version: {}", aqe_memory::schema::SCHEMA_VERSION);
        println!("   Target: {}", std::env::consts::ARCH);
        println!("   OS: {}", std::env::consts::OS);
        #[cfg(debug_assertions)]
        println!("   Profile: debug");
        #[cfg(not(debug_assertions))]
        println!("   Profile: release");
        Ok(())
    }

    fn cmd_completions(shell: Shell) -> Result<()> {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "aqe", &mut std::io::stdout());
        Ok(())
    }
}

fn init_tracing(config: &AqeConfig, level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    // try_init: a subscriber may already be installed when embedded
    let _ = match config.logging.format.as_str() {
        "json" => builder.json().with_target(true).try_init(),
        "compact" => builder.compact().with_target(false).try_init(),
        _ => builder.with_target(false).try_init(),
    };
}

/// Set a dot-notation key in a TOML document, creating intermediate tables.
/// Returns the previous value, if any.
fn set_dotted(doc: &mut toml_edit::DocumentMut, key: &str, value: &str) -> Result<Option<String>> {
    let parts: Vec<&str> = key.split('.').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(AqeError::Config(format!("invalid key '{key}'")));
    }
    let (leaf_key, table_parts) = match parts.split_last() {
        Some(split) => split,
        None => return Err(AqeError::Config("Empty key".into())),
    };

    let mut table: &mut toml_edit::Item = doc.as_item_mut();
    for part in table_parts {
        if table.get(part).is_none() {
            table[part] = toml_edit::Item::Table(toml_edit::Table::new());
        }
        table = &mut table[part];
    }

    // Infer the value type: bool, integer, float, or string
    let toml_value = if value == "true" {
        toml_edit::value(true)
    } else if value == "false" {
        toml_edit::value(false)
    } else if let Ok(i) = value.parse::<i64>() {
        toml_edit::value(i)
    } else if let Ok(f) = value.parse::<f64>() {
        toml_edit::value(f)
    } else {
        toml_edit::value(value)
    };

    let old_value = table.get(leaf_key).map(|v| v.to_string());
    table[*leaf_key] = toml_value;
    Ok(old_value)
}

async fn connect(config: &AqeConfig) -> Result<ConnectionManager> {
    ConnectionManager::from_config(&config.database).await
}

/// Parse a required JSON argument.
fn parse_json(field: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw)
        .map_err(|e| AqeError::validation(field, format!("not valid JSON: {e}")))
}

/// JSON when it parses, otherwise the raw text as a string.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_session_id(raw: &str) -> Result<SessionId> {
    uuid::Uuid::parse_str(raw)
        .map_err(|e| AqeError::validation("session_id", format!("'{raw}': {e}")))
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_value_falls_back_to_string() {
        assert_eq!(parse_value(r#"{"a": 1}"#), serde_json::json!({"a": 1}));
        assert_eq!(parse_value("42"), serde_json::json!(42));
        assert_eq!(parse_value("hello world"), serde_json::json!("hello world"));
    }

    #[test]
    fn test_parse_json_rejects_garbage() {
        assert!(parse_json("context", "{nope").unwrap_err().is_validation());
    }

    #[test]
    fn test_parse_session_id() {
        let id = uuid::Uuid::new_v4();
        assert_eq!(parse_session_id(&id.to_string()).unwrap(), id);
        assert!(parse_session_id("episode-1").is_err());
    }

    #[test]
    fn test_set_dotted_infers_types() {
        let mut doc = "[learning]\nalpha = 0.1\n".parse::<toml_edit::DocumentMut>().unwrap();
        let old = set_dotted(&mut doc, "learning.alpha", "0.2").unwrap();
        assert_eq!(old.as_deref().map(str::trim), Some("0.1"));
        set_dotted(&mut doc, "memory.namespace", "fleet").unwrap();
        set_dotted(&mut doc, "database.max_pool", "4").unwrap();

        let config: AqeConfig = toml::from_str(&doc.to_string()).unwrap();
        assert_eq!(config.learning.alpha, 0.2);
        assert_eq!(config.memory.namespace, "fleet");
        assert_eq!(config.database.max_pool, 4);
    }

    #[test]
    fn test_set_dotted_rejects_empty_segments() {
        let mut doc = toml_edit::DocumentMut::new();
        assert!(set_dotted(&mut doc, "learning..alpha", "1").is_err());
        assert!(set_dotted(&mut doc, "", "1").is_err());
    }

    #[test]
    fn test_global_dsn_flag_parses() {
        let cli =
            Cli::try_parse_from(["aqe", "--dsn", "sqlite::memory:", "memory", "stats"]).unwrap();
        assert_eq!(cli.dsn.as_deref(), Some("sqlite::memory:"));
        assert!(matches!(cli.command, Commands::Memory { action: MemoryAction::Stats }));
    }
}
