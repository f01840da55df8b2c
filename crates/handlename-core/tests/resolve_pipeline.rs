//! End-to-end tests across resolver, file store, bridge and reconciler.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use handlename_core::bridge::{
    self, FailureKind, ResolveFailure, ResolveRequest, ResolveRequester, ResolverService,
};
use handlename_core::config::{ReconcilerConfig, ResolverConfig};
use handlename_core::dom::{Document, Element};
use handlename_core::error::{FetchError, ResolveError};
use handlename_core::fetch::{FetchFuture, FetchedPage, PageFetcher};
use handlename_core::reconciler::Reconciler;
use handlename_core::shadow::ShadowRegistry;
use handlename_core::store::{JsonFileStore, SnapshotStore};
use handlename_core::{Identity, Resolver};

/// Serves fixed pages by URL and 404s everything else.
#[derive(Default)]
struct FixturePages {
    pages: Mutex<HashMap<String, String>>,
    calls: AtomicUsize,
}

impl FixturePages {
    fn with(self, url: &str, body: &str) -> Self {
        self.pages
            .lock()
            .unwrap()
            .insert(url.to_string(), body.to_string());
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PageFetcher for FixturePages {
    fn fetch<'a>(&'a self, url: &'a str) -> FetchFuture<'a> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let body = self.pages.lock().unwrap().get(url).cloned();
            match body {
                Some(body) => Ok(FetchedPage { status: 200, body }),
                None if url.contains("/offline") => Err(FetchError::Transport("offline".into())),
                None => Ok(FetchedPage {
                    status: 404,
                    body: String::new(),
                }),
            }
        })
    }
}

fn og(name: &str) -> String {
    format!(r#"<meta property="og:title" content="{name}">"#)
}

#[tokio::test]
async fn resolved_names_survive_restart_through_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.json");
    let config = ResolverConfig::default();

    let pages = Arc::new(
        FixturePages::default()
            .with("https://www.youtube.com/@examplechannel/about", &og("Example Channel")),
    );
    let store: Arc<dyn SnapshotStore> = Arc::new(JsonFileStore::new(&path));
    let resolver = Resolver::load(pages.clone(), store.clone(), &config).await;

    let first = resolver
        .resolve(&Identity::Handle("examplechannel".into()))
        .await
        .unwrap();
    assert_eq!(first.name, "Example Channel");
    assert!(!first.cached);
    assert_eq!(pages.calls(), 3);
    resolver.flush().await;
    drop(resolver);

    let raw: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(
        raw["display_name_cache_v3"]["h:examplechannel"]["name"],
        "Example Channel"
    );

    let fresh_pages = Arc::new(FixturePages::default());
    let reloaded = Resolver::load(fresh_pages.clone(), store, &config).await;
    let again = reloaded
        .resolve(&Identity::Handle("ExampleChannel".into()))
        .await
        .unwrap();
    assert_eq!(again.name, "Example Channel");
    assert!(again.cached);
    assert_eq!(fresh_pages.calls(), 0);
}

#[tokio::test]
async fn corrupt_cache_file_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.json");
    std::fs::write(&path, "{ not json").unwrap();

    let pages = Arc::new(FixturePages::default().with("https://www.youtube.com/@x", &og("X")));
    let resolver = Resolver::load(
        pages.clone(),
        Arc::new(JsonFileStore::new(&path)),
        &ResolverConfig::default(),
    )
    .await;

    assert!(resolver.cache_entries().is_empty());
    let resolution = resolver.resolve(&Identity::Handle("x".into())).await.unwrap();
    assert_eq!(resolution.name, "X");

    // The next snapshot write replaces the corrupt file.
    resolver.flush().await;
    let raw: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert!(raw["display_name_cache_v3"]["h:x"].is_object());
}

#[tokio::test]
async fn network_failures_surface_as_network_kind() {
    let config = ResolverConfig {
        base_url: "https://www.youtube.com/offline".into(),
        ..ResolverConfig::default()
    };
    let pages = Arc::new(FixturePages::default());
    let resolver = Resolver::new(
        pages.clone(),
        Arc::new(handlename_core::store::MemoryStore::new()),
        handlename_core::cache::ResolutionCache::default(),
        &config,
    );

    let err = resolver
        .resolve(&Identity::ChannelId("UCgone".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, ResolveError::Exhausted { last: Some(_) }));
    assert!(err.to_string().contains("offline"));
    assert_eq!(ResolveFailure::from(&err).kind, FailureKind::Network);
    assert_eq!(pages.calls(), 3);
}

#[tokio::test]
async fn bridge_carries_requests_and_broadcasts_to_reconciler() {
    let pages = Arc::new(
        FixturePages::default()
            .with("https://www.youtube.com/@alpha", &og("Alpha &amp; Co"))
            .with("https://www.youtube.com/channel/UCbeta/featured", &og("Beta")),
    );
    let resolver = Resolver::new(
        pages.clone(),
        Arc::new(handlename_core::store::MemoryStore::new()),
        handlename_core::cache::ResolutionCache::default(),
        &ResolverConfig::default(),
    );
    let (mut page, endpoint) = bridge::channel();
    let service = ResolverService::new(Arc::new(resolver)).spawn(endpoint);

    let document = Document::new();
    let alpha_target = Element::new("yt-formatted-string")
        .with_class("author-text")
        .with_text("@alpha");
    document.append_child(
        Element::new("a")
            .with_id("name")
            .with_attr("href", "/@alpha")
            .with_child(alpha_target.clone()),
    );
    let beta = Element::new("a")
        .with_id("author-text")
        .with_attr("href", "https://www.youtube.com/channel/UCbeta")
        .with_text("UCbeta • 3 days ago");
    document.append_child(beta.clone());

    let mut reconciler = Reconciler::new(
        document,
        Rc::new(ShadowRegistry::new()),
        Box::new(page.requester()),
        &ReconcilerConfig::default(),
    )
    .unwrap();
    assert_eq!(reconciler.process_all(), 2);

    for _ in 0..2 {
        let response = page.recv().await.unwrap();
        reconciler.on_resolved(&response);
    }

    assert_eq!(alpha_target.text_content(), "Alpha & Co");
    assert_eq!(beta.text_content(), "Beta • 3 days ago");
    assert_eq!(pages.calls(), 3, "alpha: 1 request, beta: 2 requests");

    // An empty request comes back as an invalid-identity failure.
    page.request(ResolveRequest::default()).unwrap();
    let failure = page.recv().await.unwrap();
    assert_eq!(failure.error.unwrap().kind, FailureKind::InvalidIdentity);

    drop(reconciler);
    drop(page);
    service.await.unwrap();
}
