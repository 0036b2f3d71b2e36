use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result, bail};
use burrow_store::{Key, LogEvent, RegistryBuilder, StorageLog, Store, StoreConfig};
use serde_json::Value;
use tracing::info;

use crate::config::{Cli, Command};

/// Value types the harness can read and write
pub fn register(types: &mut RegistryBuilder) {
    types.register_json::<Value>();
}

/// Build the store configuration from the config file and flag overrides
pub async fn resolve_config(cli: &Cli) -> Result<StoreConfig> {
    let mut config = match &cli.config {
        Some(path) => StoreConfig::load(path)
            .await
            .with_context(|| format!("loading config {}", path.display()))?,
        None => StoreConfig::default(),
    };
    if let Some(path) = &cli.store {
        config.path = path.clone();
    }
    if cli.compact_on_open {
        config.compact_on_open = true;
    }
    config.validate()?;
    Ok(config)
}

/// Execute one command and return what it prints
pub async fn execute(config: StoreConfig, command: Command) -> Result<String> {
    if command == Command::Dump {
        return dump(&config.path, config.max_record_size).await;
    }

    let store = Store::open_with_config(config, register)
        .await
        .context("opening store")?;
    let output = run(&store, command).await;
    store.close().await.context("closing store")?;
    output
}

async fn run(store: &Store, command: Command) -> Result<String> {
    match command {
        Command::Set { key, value } => {
            let value = parse_value(&value);
            store.set(&key, value).await?;
            Ok(String::new())
        }
        Command::Get { key } => match store.get::<_, Value>(&key).await? {
            Some(value) => Ok(format!("{}\n", serde_json::to_string_pretty(&value)?)),
            None => bail!("key not found: {}", key),
        },
        Command::Delete { key } => {
            if !store.delete(&key).await? {
                bail!("key not found: {}", key);
            }
            Ok(String::new())
        }
        Command::Keys => {
            let mut output = String::new();
            for key in store.keys().await {
                writeln!(output, "{}", display_key(&key))?;
            }
            Ok(output)
        }
        Command::Size => Ok(format!("{}\n", store.size().await?)),
        Command::Compact => {
            let stats = store.compact().await?;
            info!(
                live_keys = stats.live_keys,
                bytes_freed = stats.bytes_freed(),
                "Compacted"
            );
            Ok(format!(
                "{} keys, {} -> {} bytes\n",
                stats.live_keys, stats.bytes_before, stats.bytes_after
            ))
        }
        Command::Dump => dump(store.path(), store.config().max_record_size).await,
    }
}

/// Print every intact record of the log at `path`
async fn dump(path: &Path, max_record_size: u64) -> Result<String> {
    let mut lines = Vec::new();
    let summary = StorageLog::scan(path, max_record_size, |offset, event| {
        let line = match event {
            LogEvent::Session {
                id,
                timestamp_millis,
            } => format!("{}\tsession\t{}\t{}", offset, id, timestamp_millis),
            LogEvent::Set { tag, key, data } => format!(
                "{}\tset\t{}\t{}\t{}",
                offset,
                display_key(&key),
                tag,
                String::from_utf8_lossy(&data)
            ),
            LogEvent::Delete { tag, key } => {
                format!("{}\tdelete\t{}\t{}", offset, display_key(&key), tag)
            }
        };
        lines.push(line);
    })
    .await
    .with_context(|| format!("reading {}", path.display()))?;

    let mut output = lines.join("\n");
    if !output.is_empty() {
        output.push('\n');
    }
    if summary.torn_tail {
        writeln!(
            output,
            "# torn tail: {} of {} bytes intact",
            summary.valid_len, summary.file_len
        )?;
    }
    Ok(output)
}

/// Values that are not valid JSON are stored as strings
fn parse_value(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

/// Show string keys without their JSON quotes
fn display_key(key: &Key) -> String {
    key.decode::<String>()
        .unwrap_or_else(|_| key.as_str().to_string())
}
