// SPDX-License-Identifier: MPL-2.0

//! `ecoquest-sync replay <events.jsonl>`: push captured change payloads
//! through the engine against the in-memory backend and print the
//! resulting home feed as JSON.

use ecoquest_sync::config::APP_NAME;
use ecoquest_sync::model::UserId;
use ecoquest_sync::{
    FeedScope, MemoryBackend, MemoryStorage, SyncEngine, SyncError, SyncSettings, Table, runtime,
};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

const DEFAULT_USER: &str = "replay";

#[derive(Error, Debug)]
enum ReplayError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid storage URL: {0}")]
    StorageUrl(#[from] url::ParseError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("cannot encode feed: {0}")]
    Encode(#[from] serde_json::Error),
}

struct Args {
    events: PathBuf,
    user: UserId,
}

fn usage() {
    eprintln!("{APP_NAME}");
    eprintln!();
    eprintln!("usage: ecoquest-sync replay <events.jsonl> [--user <id>]");
    eprintln!();
    eprintln!("Each line holds one raw change payload. Set RUST_LOG=debug to trace");
    eprintln!("how every event is applied.");
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Option<Args> {
    if args.next()? != "replay" {
        return None;
    }
    let events = PathBuf::from(args.next()?);
    let mut user = UserId::new(DEFAULT_USER);
    while let Some(flag) = args.next() {
        match flag.as_str() {
            "--user" => user = UserId::new(args.next()?),
            _ => return None,
        }
    }
    Some(Args { events, user })
}

/// Table a raw payload is about, looking through a `data` wrapper.
fn payload_table(payload: &Value) -> Option<Table> {
    payload
        .get("table")
        .or_else(|| payload.get("data").and_then(|d| d.get("table")))
        .and_then(Value::as_str)
        .and_then(Table::from_name)
}

async fn replay(path: &Path, user: UserId) -> Result<String, ReplayError> {
    let settings = SyncSettings::load();
    let storage = Arc::new(MemoryStorage::new(Url::parse(&settings.storage_url)?));
    let backend = Arc::new(MemoryBackend::new());
    let engine = SyncEngine::new(backend.clone(), storage, settings);
    engine.start(user).await?;

    let text = std::fs::read_to_string(path).map_err(|source| ReplayError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let mut applied = 0;
    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let payload: Value = match serde_json::from_str(line) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(line = number + 1, error = %e, "skipping unparsable line");
                continue;
            }
        };
        let Some(table) = payload_table(&payload) else {
            warn!(line = number + 1, "skipping payload without a known table");
            continue;
        };
        if backend.emit_raw(table, payload) == 0 {
            warn!(line = number + 1, %table, "no subscription for table");
        }
        applied += engine.pump().await;
    }
    info!(applied, "replay finished");

    let feed = engine.snapshot(&FeedScope::Home).unwrap_or_default();
    engine.stop();
    Ok(serde_json::to_string_pretty(&feed)?)
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let Some(args) = parse_args(std::env::args().skip(1)) else {
        usage();
        return ExitCode::from(2);
    };

    match runtime::block_on(replay(&args.events, args.user)) {
        Ok(feed) => {
            println!("{feed}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
