//! Page session event loop.
//!
//! A [`PageSession`] owns the page side: the reconciler, the bridge
//! receiver and the trigger scheduler. One `select!` loop drives all of
//! them, so reconciliation never runs concurrently with itself. The session
//! holds `Rc` state and must be awaited on the thread that built it.

use std::future::Future;
use std::rc::Rc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bridge::PageBridge;
use crate::config::Config;
use crate::dom::Document;
use crate::error::ConfigError;
use crate::reconciler::{ReconcileStats, Reconciler};
use crate::scheduler::{Trigger, TriggerScheduler};
use crate::shadow::ShadowRootSource;

/// Host-side handle for reporting page triggers.
#[derive(Debug, Clone)]
pub struct TriggerSender {
    tx: mpsc::UnboundedSender<Trigger>,
}

impl TriggerSender {
    /// Report a trigger. Returns `false` once the session has ended.
    pub fn fire(&self, trigger: Trigger) -> bool {
        self.tx.send(trigger).is_ok()
    }
}

pub struct PageSession {
    reconciler: Reconciler,
    bridge: PageBridge,
    triggers: mpsc::UnboundedReceiver<Trigger>,
    scheduler: TriggerScheduler,
}

impl std::fmt::Debug for PageSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageSession")
            .field("reconciler", &self.reconciler)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl PageSession {
    pub fn new(
        document: Document,
        shadows: Rc<dyn ShadowRootSource>,
        bridge: PageBridge,
        config: &Config,
    ) -> Result<(Self, TriggerSender), ConfigError> {
        let reconciler = Reconciler::new(
            document,
            shadows,
            Box::new(bridge.requester()),
            &config.reconciler,
        )?;
        let (tx, triggers) = mpsc::unbounded_channel();
        let session = Self {
            reconciler,
            bridge,
            triggers,
            scheduler: TriggerScheduler::new(&config.scheduler, Instant::now()),
        };
        Ok((session, TriggerSender { tx }))
    }

    #[must_use]
    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Run until `shutdown` resolves. Returns the reconciler for inspection.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Reconciler {
        tokio::pin!(shutdown);
        let mut triggers_open = true;
        let mut bridge_open = true;

        self.reconciler.process_all();

        loop {
            let retry_due = self.reconciler.next_retry_due();
            let wake = retry_due.map_or(self.scheduler.next_deadline(), |due| {
                due.min(self.scheduler.next_deadline())
            });

            tokio::select! {
                biased;

                () = &mut shutdown => break,

                trigger = self.triggers.recv(), if triggers_open => match trigger {
                    Some(trigger) => self.scheduler.note(trigger, Instant::now()),
                    None => {
                        debug!("trigger source closed; fallback timer only");
                        triggers_open = false;
                    }
                },

                response = self.bridge.recv(), if bridge_open => match response {
                    Some(response) => self.reconciler.on_resolved(&response),
                    None => {
                        warn!("resolver bridge closed; in-flight identities go to retry");
                        self.reconciler.on_bridge_closed();
                        bridge_open = false;
                    }
                },

                () = tokio::time::sleep_until(wake) => {
                    let now = Instant::now();
                    let retry_ready = retry_due.is_some_and(|due| due <= now);
                    if self.scheduler.take_due(now) || retry_ready {
                        self.reconciler.process_all();
                    }
                }
            }
        }

        let stats: ReconcileStats = self.reconciler.stats();
        info!(
            passes = stats.passes,
            processed = stats.processed,
            replaced_partial = stats.replaced_partial,
            replaced_full = stats.replaced_full,
            recycled = stats.recycled,
            "page session ended"
        );
        self.reconciler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{self, ResolverService};
    use crate::cache::ResolutionCache;
    use crate::dom::Element;
    use crate::error::FetchError;
    use crate::fetch::{FetchFuture, FetchedPage, PageFetcher};
    use crate::identity::Identity;
    use crate::resolver::Resolver;
    use crate::shadow::ShadowRegistry;
    use crate::store::MemoryStore;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Duration;

    /// Every `/@<handle>` page carries an og:title of the upper-cased handle.
    #[derive(Default)]
    struct UpperFetcher {
        calls: AtomicUsize,
    }

    impl PageFetcher for UpperFetcher {
        fn fetch<'a>(&'a self, url: &'a str) -> FetchFuture<'a> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let handle = url
                    .rsplit_once("/@")
                    .map(|(_, h)| h.to_uppercase())
                    .ok_or_else(|| FetchError::Transport("unexpected url".into()))?;
                Ok(FetchedPage {
                    status: 200,
                    body: format!(r#"<meta property="og:title" content="{handle}">"#),
                })
            })
        }
    }

    fn anchor(handle: &str) -> (Element, Element) {
        let target = Element::new("yt-formatted-string")
            .with_class("author-text")
            .with_text(&format!("@{handle}"));
        let anchor = Element::new("a")
            .with_id("author-text")
            .with_attr("href", &format!("/@{handle}"))
            .with_child(target.clone());
        (anchor, target)
    }

    #[tokio::test(start_paused = true)]
    async fn session_resolves_and_reacts_to_mutations() {
        let config = Config::default();
        let fetcher = Arc::new(UpperFetcher::default());
        let resolver = Resolver::new(
            fetcher.clone(),
            Arc::new(MemoryStore::new()),
            ResolutionCache::default(),
            &config.resolver,
        );
        let (page, endpoint) = bridge::channel();
        let service = ResolverService::new(Arc::new(resolver)).spawn(endpoint);

        let document = Document::new();
        let (first, first_target) = anchor("someone");
        document.append_child(first);

        let (session, triggers) = PageSession::new(
            document.clone(),
            Rc::new(ShadowRegistry::new()),
            page,
            &config,
        )
        .unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let driver = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(first_target.text_content(), "SOMEONE");

            let (second, second_target) = anchor("someone");
            document.append_child(second);
            assert!(triggers.fire(Trigger::Mutation));
            tokio::time::sleep(Duration::from_millis(150)).await;
            assert_eq!(second_target.text_content(), "SOMEONE");

            let _ = stop_tx.send(());
        };
        let (reconciler, ()) = tokio::join!(
            session.run(async {
                let _ = stop_rx.await;
            }),
            driver
        );

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(reconciler.stats().requests, 1);
        assert_eq!(
            reconciler.resolved_name(&Identity::Handle("someone".into()).key()),
            Some("SOMEONE")
        );

        drop(reconciler);
        service.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_pass_picks_up_silent_changes() {
        let config = Config::default();
        let resolver = Resolver::new(
            Arc::new(UpperFetcher::default()),
            Arc::new(MemoryStore::new()),
            ResolutionCache::default(),
            &config.resolver,
        );
        let (page, endpoint) = bridge::channel();
        let _service = ResolverService::new(Arc::new(resolver)).spawn(endpoint);

        let document = Document::new();
        let (session, _triggers) = PageSession::new(
            document.clone(),
            Rc::new(ShadowRegistry::new()),
            page,
            &config,
        )
        .unwrap();

        let driver = async {
            // No trigger is reported for this change.
            let (late, late_target) = anchor("quiet");
            document.append_child(late);
            tokio::time::sleep(Duration::from_millis(10_500)).await;
            late_target.text_content()
        };
        let (_, text) = tokio::join!(session.run(tokio::time::sleep(Duration::from_secs(11))), driver);
        assert_eq!(text, "QUIET");
    }

    #[tokio::test(start_paused = true)]
    async fn every_anchor_resolves_when_responses_pile_up() {
        let config = Config::default();
        let fetcher = Arc::new(UpperFetcher::default());
        let resolver = Resolver::new(
            fetcher.clone(),
            Arc::new(MemoryStore::new()),
            ResolutionCache::default(),
            &config.resolver,
        );
        let (page, endpoint) = bridge::channel();
        let _service = ResolverService::new(Arc::new(resolver)).spawn(endpoint);

        let document = Document::new();
        let targets: Vec<Element> = (0..1500)
            .map(|n| {
                let (anchor, target) = anchor(&format!("user{n}"));
                document.append_child(anchor);
                target
            })
            .collect();

        let (session, _triggers) = PageSession::new(
            document.clone(),
            Rc::new(ShadowRegistry::new()),
            page,
            &config,
        )
        .unwrap();
        let reconciler = session.run(tokio::time::sleep(Duration::from_secs(1))).await;

        let raw: Vec<String> = targets
            .iter()
            .map(Element::text_content)
            .filter(|text| text.starts_with('@'))
            .collect();
        assert!(raw.is_empty(), "{} anchors left unresolved", raw.len());
        assert_eq!(targets[1499].text_content(), "USER1499");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1500);
        assert_eq!(reconciler.stats().requests, 1500);
        assert_eq!(reconciler.stats().retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn severed_bridge_retries_then_gives_up() {
        let config = Config::default();
        let (page, endpoint) = bridge::channel();

        let document = Document::new();
        let (stranded, target) = anchor("stranded");
        document.append_child(stranded);

        let (session, _triggers) = PageSession::new(
            document.clone(),
            Rc::new(ShadowRegistry::new()),
            page,
            &config,
        )
        .unwrap();

        // The resolver side goes away while the first request is unanswered.
        let sever = async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(endpoint);
        };
        let (reconciler, ()) = tokio::join!(
            session.run(tokio::time::sleep(Duration::from_secs(20))),
            sever
        );

        let key = Identity::Handle("stranded".into()).key();
        assert!(reconciler.is_terminal(&key));
        assert_eq!(reconciler.next_retry_due(), None);
        assert_eq!(reconciler.stats().retries, 3);
        assert_eq!(reconciler.stats().requests, 4);
        assert_eq!(target.text_content(), "@stranded");
    }
}
