//! Identity → display name resolution.
//!
//! The [`Resolver`] owns the [`ResolutionCache`]. A cache miss walks an
//! ordered list of channel page URLs, strictly one at a time, until a page
//! yields a display name. Concurrent calls for the same key share a single
//! walk.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, ResolutionCache, now_epoch_ms};
use crate::config::ResolverConfig;
use crate::error::{CandidateFailure, ResolveError};
use crate::extract::extract_display_name;
use crate::fetch::PageFetcher;
use crate::identity::{Identity, ResolutionKey};
use crate::persist::PersistHandle;
use crate::store::SnapshotStore;

/// Characters `encodeURIComponent` leaves alone.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

const HANDLE_SUFFIXES: &[&str] = &["", "/featured", "/about", "/videos", "/streams"];
const CHANNEL_SUFFIXES: &[&str] = &["", "/featured", "/about"];

/// A successful resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub name: String,
    /// True when served from the cache without any fetch.
    pub cached: bool,
}

type Waiter = oneshot::Sender<Result<Resolution, ResolveError>>;

/// Ordered candidate page URLs for an identity.
#[must_use]
pub fn candidate_urls(base_url: &str, identity: &Identity) -> Vec<String> {
    let base = base_url.trim_end_matches('/');
    match identity {
        Identity::Handle(handle) => {
            let prefix = format!("{base}/@{}", utf8_percent_encode(handle, COMPONENT));
            HANDLE_SUFFIXES
                .iter()
                .map(|suffix| format!("{prefix}{suffix}"))
                .collect()
        }
        Identity::ChannelId(id) => {
            let prefix = format!("{base}/channel/{}", utf8_percent_encode(id, COMPONENT));
            CHANNEL_SUFFIXES
                .iter()
                .map(|suffix| format!("{prefix}{suffix}"))
                .collect()
        }
    }
}

/// Resolves identities through the cache and the channel pages.
pub struct Resolver {
    fetcher: Arc<dyn PageFetcher>,
    cache: Arc<Mutex<ResolutionCache>>,
    persist: PersistHandle,
    inflight: Mutex<HashMap<ResolutionKey, Vec<Waiter>>>,
    base_url: String,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("base_url", &self.base_url)
            .field("cached", &self.lock_cache().len())
            .finish_non_exhaustive()
    }
}

impl Resolver {
    /// Build a resolver around an already constructed cache.
    ///
    /// Spawns the persistence task, so this must run inside a tokio runtime.
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        store: Arc<dyn SnapshotStore>,
        cache: ResolutionCache,
        config: &ResolverConfig,
    ) -> Self {
        let cache = Arc::new(Mutex::new(cache));
        let (persist, _task) = PersistHandle::spawn(
            cache.clone(),
            store,
            config.storage_key.clone(),
            config.persist_debounce(),
        );
        Self {
            fetcher,
            cache,
            persist,
            inflight: Mutex::new(HashMap::new()),
            base_url: config.base_url.clone(),
        }
    }

    /// Read the persisted snapshot once and build a resolver from it.
    ///
    /// A store that cannot be read leaves the resolver with an empty cache.
    pub async fn load(
        fetcher: Arc<dyn PageFetcher>,
        store: Arc<dyn SnapshotStore>,
        config: &ResolverConfig,
    ) -> Self {
        let now = now_epoch_ms();
        let cache = match store.get(&config.storage_key).await {
            Ok(Some(snapshot)) => ResolutionCache::from_snapshot(&snapshot, config.ttl(), now).0,
            Ok(None) => ResolutionCache::new(config.ttl()),
            Err(err) => {
                warn!(
                    error = %err,
                    storage_key = %config.storage_key,
                    "cache snapshot unreadable; starting empty"
                );
                ResolutionCache::new(config.ttl())
            }
        };
        Self::new(fetcher, store, cache, config)
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, ResolutionCache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cached(&self, key: &ResolutionKey) -> Option<Resolution> {
        self.lock_cache()
            .get(key, now_epoch_ms())
            .map(|entry| Resolution {
                name: entry.name.clone(),
                cached: true,
            })
    }

    /// Resolve from the optional wire fields.
    pub async fn resolve_parts(
        &self,
        handle: Option<&str>,
        channel_id: Option<&str>,
    ) -> Result<Resolution, ResolveError> {
        let identity = Identity::from_parts(handle, channel_id)?;
        self.resolve(&identity).await
    }

    /// Resolve one identity to its display name.
    pub async fn resolve(&self, identity: &Identity) -> Result<Resolution, ResolveError> {
        let blank = match identity {
            Identity::Handle(value) | Identity::ChannelId(value) => value.trim().is_empty(),
        };
        if blank {
            return Err(ResolveError::InvalidIdentity);
        }

        let key = identity.key();
        if let Some(hit) = self.cached(&key) {
            debug!(key = %key, cached = true, "display name served from cache");
            return Ok(hit);
        }

        let waiter = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(waiters) = inflight.get_mut(&key) {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Some(rx)
            } else {
                // The previous leader may have finished between the cache
                // check and taking this lock.
                if let Some(hit) = self.cached(&key) {
                    return Ok(hit);
                }
                inflight.insert(key.clone(), Vec::new());
                None
            }
        };

        if let Some(rx) = waiter {
            debug!(key = %key, "joining in-flight resolution");
            return rx
                .await
                .unwrap_or(Err(ResolveError::Exhausted { last: None }));
        }

        let guard = InflightGuard {
            inflight: &self.inflight,
            key: Some(key.clone()),
        };
        let result = self.walk_candidates(identity, &key).await;
        for waiter in guard.finish() {
            let _ = waiter.send(result.clone());
        }
        result
    }

    async fn walk_candidates(
        &self,
        identity: &Identity,
        key: &ResolutionKey,
    ) -> Result<Resolution, ResolveError> {
        let mut last = None;
        for url in candidate_urls(&self.base_url, identity) {
            let failure = match self.fetcher.fetch(&url).await {
                Err(err) => CandidateFailure::Network(err.to_string()),
                Ok(page) if !page.is_success() => CandidateFailure::Status(page.status),
                Ok(page) => match extract_display_name(&page.body) {
                    Some(name) => {
                        self.lock_cache()
                            .insert(key.clone(), name.clone(), now_epoch_ms());
                        self.persist.schedule();
                        info!(key = %key, url = %url, cached = false, "display name resolved");
                        return Ok(Resolution {
                            name,
                            cached: false,
                        });
                    }
                    None => CandidateFailure::NoDisplayName,
                },
            };
            debug!(key = %key, url = %url, reason = %failure, "candidate failed");
            last = Some(failure);
        }

        let err = ResolveError::Exhausted { last };
        warn!(key = %key, error = %err, "all candidates exhausted");
        Err(err)
    }

    /// Write any pending snapshot now.
    pub async fn flush(&self) {
        self.persist.flush().await;
    }

    /// All cache entries in key order, stale ones included.
    #[must_use]
    pub fn cache_entries(&self) -> Vec<(ResolutionKey, CacheEntry)> {
        self.lock_cache()
            .iter()
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect()
    }

    /// Drop every cache entry and schedule a write of the empty snapshot.
    pub fn clear_cache(&self) {
        self.lock_cache().clear();
        self.persist.schedule();
    }
}

/// Removes the in-flight entry even if the leading call is dropped, so
/// waiters see a closed channel instead of hanging.
struct InflightGuard<'a> {
    inflight: &'a Mutex<HashMap<ResolutionKey, Vec<Waiter>>>,
    key: Option<ResolutionKey>,
}

impl InflightGuard<'_> {
    fn finish(mut self) -> Vec<Waiter> {
        self.take().unwrap_or_default()
    }

    fn take(&mut self) -> Option<Vec<Waiter>> {
        let key = self.key.take()?;
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key)
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        let _ = self.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::fetch::{FetchFuture, FetchedPage};
    use crate::store::MemoryStore;
    use std::time::Duration;

    const BASE: &str = "https://www.youtube.com";

    /// Scripted fetcher: maps URL → status/body, records every request.
    #[derive(Default)]
    struct ScriptedFetcher {
        pages: HashMap<String, Result<FetchedPage, String>>,
        calls: Mutex<Vec<String>>,
        delay: Option<Duration>,
    }

    impl ScriptedFetcher {
        fn page(mut self, path: &str, status: u16, body: &str) -> Self {
            self.pages.insert(
                format!("{BASE}{path}"),
                Ok(FetchedPage {
                    status,
                    body: body.to_string(),
                }),
            );
            self
        }

        fn fail(mut self, path: &str, message: &str) -> Self {
            self.pages
                .insert(format!("{BASE}{path}"), Err(message.to_string()));
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl PageFetcher for ScriptedFetcher {
        fn fetch<'a>(&'a self, url: &'a str) -> FetchFuture<'a> {
            Box::pin(async move {
                self.calls.lock().unwrap().push(url.to_string());
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                match self.pages.get(url) {
                    Some(Ok(page)) => Ok(page.clone()),
                    Some(Err(message)) => Err(FetchError::Transport(message.clone())),
                    None => Ok(FetchedPage {
                        status: 404,
                        body: String::new(),
                    }),
                }
            })
        }
    }

    fn og(name: &str) -> String {
        format!(r#"<html><head><meta property="og:title" content="{name}"></head></html>"#)
    }

    fn resolver(fetcher: Arc<ScriptedFetcher>) -> (Resolver, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let resolver = Resolver::new(
            fetcher,
            store.clone(),
            ResolutionCache::default(),
            &ResolverConfig::default(),
        );
        (resolver, store)
    }

    #[test]
    fn handle_candidates_in_order() {
        let urls = candidate_urls(BASE, &Identity::Handle("someone".into()));
        assert_eq!(
            urls,
            vec![
                "https://www.youtube.com/@someone",
                "https://www.youtube.com/@someone/featured",
                "https://www.youtube.com/@someone/about",
                "https://www.youtube.com/@someone/videos",
                "https://www.youtube.com/@someone/streams",
            ]
        );
    }

    #[test]
    fn channel_candidates_in_order() {
        let urls = candidate_urls("http://localhost:8080/", &Identity::ChannelId("UC123".into()));
        assert_eq!(
            urls,
            vec![
                "http://localhost:8080/channel/UC123",
                "http://localhost:8080/channel/UC123/featured",
                "http://localhost:8080/channel/UC123/about",
            ]
        );
    }

    #[test]
    fn candidate_segments_are_component_encoded() {
        let urls = candidate_urls(BASE, &Identity::Handle("café bar/x".into()));
        assert_eq!(urls[0], "https://www.youtube.com/@caf%C3%A9%20bar%2Fx");
        let urls = candidate_urls(BASE, &Identity::Handle("a.b-c_d".into()));
        assert_eq!(urls[0], "https://www.youtube.com/@a.b-c_d");
    }

    #[tokio::test]
    async fn falls_back_to_about_page() {
        let fetcher = Arc::new(
            ScriptedFetcher::default()
                .page("/@examplechannel", 404, "")
                .fail("/@examplechannel/featured", "connection reset")
                .page("/@examplechannel/about", 200, &og("Example Channel")),
        );
        let (resolver, _store) = resolver(fetcher.clone());

        let resolution = resolver
            .resolve(&Identity::Handle("examplechannel".into()))
            .await
            .unwrap();

        assert_eq!(
            resolution,
            Resolution {
                name: "Example Channel".into(),
                cached: false
            }
        );
        assert_eq!(fetcher.calls().len(), 3, "no requests after /about");
    }

    #[tokio::test]
    async fn repeat_within_ttl_is_cached_without_fetching() {
        let fetcher = Arc::new(ScriptedFetcher::default().page("/@someone", 200, &og("Someone")));
        let (resolver, _store) = resolver(fetcher.clone());

        resolver
            .resolve(&Identity::Handle("someone".into()))
            .await
            .unwrap();
        let second = resolver
            .resolve(&Identity::Handle("SomeOne".into()))
            .await
            .unwrap();

        assert!(second.cached);
        assert_eq!(second.name, "Someone");
        assert_eq!(fetcher.calls().len(), 1);
    }

    #[tokio::test]
    async fn invalid_identity_does_no_io() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let (resolver, _store) = resolver(fetcher.clone());

        assert_eq!(
            resolver.resolve_parts(None, Some("")).await,
            Err(ResolveError::InvalidIdentity)
        );
        assert_eq!(
            resolver.resolve(&Identity::Handle(" ".into())).await,
            Err(ResolveError::InvalidIdentity)
        );
        assert!(fetcher.calls().is_empty());
    }

    #[tokio::test]
    async fn exhaustion_reports_last_reason() {
        let fetcher = Arc::new(
            ScriptedFetcher::default()
                .page("/channel/UCx", 200, "<html>nothing here</html>")
                .page("/channel/UCx/about", 503, ""),
        );
        let (resolver, store) = resolver(fetcher.clone());

        let err = resolver
            .resolve(&Identity::ChannelId("UCx".into()))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ResolveError::Exhausted {
                last: Some(CandidateFailure::Status(503))
            }
        );
        assert_eq!(err.to_string(), "Resolution failed: HTTP 503");
        assert_eq!(fetcher.calls().len(), 3);
        resolver.flush().await;
        assert_eq!(store.write_count(), 0, "failures are not cached");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_calls_share_one_walk() {
        let mut scripted = ScriptedFetcher::default().page("/@someone", 200, &og("Someone"));
        scripted.delay = Some(Duration::from_millis(50));
        let fetcher = Arc::new(scripted);
        let (resolver, _store) = resolver(fetcher.clone());

        let a = Identity::Handle("someone".into());
        let b = Identity::Handle("SOMEONE".into());
        let (first, second) = tokio::join!(resolver.resolve(&a), resolver.resolve(&b));

        assert_eq!(first.unwrap().name, "Someone");
        assert_eq!(second.unwrap().name, "Someone");
        assert_eq!(fetcher.calls().len(), 1);
    }

    #[tokio::test]
    async fn load_admits_persisted_entries() {
        let now = now_epoch_ms();
        let store = Arc::new(MemoryStore::new().with_value(
            "display_name_cache_v3",
            serde_json::json!({ "h:someone": { "name": "Someone", "ts": now } }),
        ));
        let fetcher = Arc::new(ScriptedFetcher::default());
        let resolver = Resolver::load(fetcher.clone(), store.clone(), &ResolverConfig::default()).await;

        let resolution = resolver
            .resolve(&Identity::Handle("someone".into()))
            .await
            .unwrap();
        assert!(resolution.cached);
        assert!(fetcher.calls().is_empty());
        assert_eq!(store.write_count(), 0, "loading does not re-persist");
    }

    #[tokio::test]
    async fn flush_persists_new_entries() {
        let fetcher = Arc::new(ScriptedFetcher::default().page("/channel/UCx", 200, &og("Chan")));
        let (resolver, store) = resolver(fetcher);

        resolver
            .resolve(&Identity::ChannelId("UCx".into()))
            .await
            .unwrap();
        resolver.flush().await;

        let written = store.peek("display_name_cache_v3").unwrap();
        assert_eq!(written["c:UCx"]["name"], "Chan");
    }
}
