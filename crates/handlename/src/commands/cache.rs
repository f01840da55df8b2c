use std::process::ExitCode;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use handlename_core::cache::{ResolutionCache, now_epoch_ms};
use handlename_core::config::Config;
use handlename_core::fetch::HttpFetcher;
use handlename_core::store::{JsonFileStore, SnapshotStore};
use handlename_core::{Error, Resolver};
use serde::Serialize;

use crate::cli::CacheAction;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EntryView {
    key: String,
    name: String,
    resolved_at: u64,
    resolved_at_iso: String,
}

pub async fn run(config: &Config, action: CacheAction) -> anyhow::Result<ExitCode> {
    match action {
        CacheAction::Path => {
            println!("{}", config.cache_path().display());
        }
        CacheAction::Show { json } => show(config, json).await?,
        CacheAction::Clear => clear(config).await?,
    }
    Ok(ExitCode::SUCCESS)
}

async fn show(config: &Config, json: bool) -> anyhow::Result<()> {
    let store = JsonFileStore::new(config.cache_path());
    let snapshot = store
        .get(&config.resolver.storage_key)
        .await
        .map_err(Error::from)?;
    let (cache, report) = match snapshot {
        Some(snapshot) => {
            ResolutionCache::from_snapshot(&snapshot, config.resolver.ttl(), now_epoch_ms())
        }
        None => (ResolutionCache::new(config.resolver.ttl()), Default::default()),
    };
    tracing::debug!(
        admitted = report.admitted,
        expired = report.expired,
        malformed = report.malformed,
        "cache snapshot read"
    );

    let entries: Vec<EntryView> = cache
        .iter()
        .map(|(key, entry)| EntryView {
            key: key.as_str().to_string(),
            name: entry.name.clone(),
            resolved_at: entry.resolved_at,
            resolved_at_iso: format_ms(entry.resolved_at),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else if entries.is_empty() {
        println!("cache is empty");
    } else {
        for entry in &entries {
            println!("{}\t{}\t{}", entry.key, entry.name, entry.resolved_at_iso);
        }
    }
    Ok(())
}

async fn clear(config: &Config) -> anyhow::Result<()> {
    let fetcher = HttpFetcher::new(
        config.resolver.request_timeout(),
        &config.resolver.user_agent,
    )
    .map_err(Error::from)?;
    let store = Arc::new(JsonFileStore::new(config.cache_path()));
    let resolver = Resolver::load(Arc::new(fetcher), store, &config.resolver).await;

    let removed = resolver.cache_entries().len();
    resolver.clear_cache();
    resolver.flush().await;
    println!("cleared {removed} cache entries");
    Ok(())
}

fn format_ms(ms: u64) -> String {
    i64::try_from(ms)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map_or_else(
            || ms.to_string(),
            |ts| ts.to_rfc3339_opts(SecondsFormat::Secs, true),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_epoch_millis_as_utc() {
        assert_eq!(format_ms(1_700_000_000_000), "2023-11-14T22:13:20Z");
    }
}
