use console::style;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use aqe_config::{AqeConfig, MemoryBackendKind};
use aqe_core::Result;
use aqe_memory::PersistentMemory;

use super::{MemoryAction, connect, parse_value, print_json};

async fn open_memory(config: &AqeConfig) -> Result<PersistentMemory> {
    let db = match config.memory.backend {
        MemoryBackendKind::Sqlite => Some(connect(config).await?),
        MemoryBackendKind::InMemory => {
            tracing::warn!("memory.backend is in_memory; entries live only for this command");
            None
        }
    };
    PersistentMemory::open(&config.memory, db)
}

pub(super) async fn cmd_memory(config: &AqeConfig, action: MemoryAction) -> Result<()> {
    let memory = open_memory(config).await?;

    match action {
        MemoryAction::Store { key, value, ttl } => {
            let value = parse_value(&value);
            memory.store(&key, &value, ttl.map(Duration::from_secs)).await?;
            match ttl {
                Some(secs) => println!("{} stored {key} (expires in {secs}s)", style("✓").green()),
                None => println!("{} stored {key}", style("✓").green()),
            }
        }
        MemoryAction::Get { key, entry } => {
            if entry {
                match memory.retrieve_entry(&key).await? {
                    Some(e) => print_json(&e)?,
                    None => println!("{} {key} not found", style("·").dim()),
                }
            } else {
                match memory.retrieve(&key).await? {
                    Some(v) => print_json(&v)?,
                    None => println!("{} {key} not found", style("·").dim()),
                }
            }
        }
        MemoryAction::Search { pattern } => {
            let hits = memory.search(&pattern).await?;
            if hits.is_empty() {
                println!("No entries match '{pattern}'");
            }
            for (key, value) in hits {
                println!("{}  {}", style(key).cyan(), value);
            }
        }
        MemoryAction::Delete { key } => {
            if memory.delete(&key).await? {
                println!("{} deleted {key}", style("✓").green());
            } else {
                println!("{} {key} did not exist", style("·").dim());
            }
        }
        MemoryAction::Keys { prefix } => {
            for key in memory.list_keys(prefix.as_deref()).await? {
                println!("{key}");
            }
        }
        MemoryAction::Stats => {
            let stats = memory.stats().await?;
            println!("{}", style("Shared memory").bold());
            println!("  namespace: {}", memory.namespace().root());
            println!("  backend:   {}", memory.backend_kind());
            println!("  entries:   {}", stats.entry_count);
            println!("  size:      {} bytes", stats.total_size_bytes);
        }
        MemoryAction::Purge => {
            let removed = memory.purge_expired().await?;
            println!("{} purged {removed} expired entries", style("✓").green());
        }
        MemoryAction::Reap { interval } => {
            let secs = interval.unwrap_or(config.memory.reap_interval_secs);
            if secs == 0 {
                println!("Reaper disabled (interval 0)");
                return Ok(());
            }
            let cancel = CancellationToken::new();
            let handle = memory.spawn_reaper(Duration::from_secs(secs), cancel.clone());
            println!("Reaping every {secs}s, Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            cancel.cancel();
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "reaper task ended abnormally");
            }
        }
    }
    Ok(())
}
