//! DOM reconciliation.
//!
//! The [`Reconciler`] tracks which elements currently show which identity,
//! asks the resolver for each key once, and writes resolved names into the
//! page. Elements are never owned: bookkeeping is a side table keyed by
//! [`ElementId`] holding weak handles, pruned as elements die or detach.
//!
//! State per tracked element is an [`AnchorState`]. A virtual list may reuse
//! an element for another identity at any time; [`Reconciler::process_one`]
//! notices the key change, strips the old name and starts over.

use std::collections::{BTreeSet, HashMap};
use std::ops::Range;
use std::rc::Rc;
use std::sync::LazyLock;

use percent_encoding::percent_decode_str;
use regex::Regex;
use serde::Serialize;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::bridge::{ResolveFailure, ResolveRequest, ResolveRequester, ResolveResponse};
use crate::config::ReconcilerConfig;
use crate::dom::{Document, Element, ElementId, Selector, WeakElement};
use crate::error::ConfigError;
use crate::identity::{Identity, ResolutionKey};
use crate::shadow::ShadowRootSource;

/// Identity encoded in a link: `/@handle` or `/channel/<id>`, relative or
/// absolute. The segment is percent-decoded and ends at `/`, `?` or `#`.
#[must_use]
pub fn identity_from_href(href: &str) -> Option<Identity> {
    let href = href.trim();
    let path = if href.starts_with('/') && !href.starts_with("//") {
        href.split(['?', '#']).next().unwrap_or_default().to_string()
    } else {
        let absolute = if href.starts_with("//") {
            format!("https:{href}")
        } else {
            href.to_string()
        };
        url::Url::parse(&absolute).ok()?.path().to_string()
    };

    if let Some(rest) = path.strip_prefix("/@") {
        return first_segment(rest).map(Identity::Handle);
    }
    if let Some(rest) = path.strip_prefix("/channel/") {
        return first_segment(rest).map(Identity::ChannelId);
    }
    None
}

fn first_segment(rest: &str) -> Option<String> {
    let raw = rest.split('/').next().unwrap_or_default();
    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map_or_else(|_| raw.to_string(), |s| s.into_owned());
    let decoded = decoded.trim();
    (!decoded.is_empty()).then(|| decoded.to_string())
}

/// Handle from visible text: the first token of text starting with `@`.
fn identity_from_text(text: &str) -> Option<Identity> {
    let token = text.trim().strip_prefix('@')?.split_whitespace().next()?;
    (!token.is_empty()).then(|| Identity::Handle(token.to_string()))
}

static CHANNEL_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/channel/(UC[0-9A-Za-z_-]{10,})").unwrap());

/// Levels searched by [`channel_id_near`]: the anchor and two ancestors.
const NEAR_ANCHOR_LEVELS: usize = 3;

/// Channel id from a `/channel/UC…` link near an anchor that names no
/// handle. Each level checks its own href when it is a link, then the first
/// descendant link whose href mentions `/channel/`.
fn channel_id_near(anchor: &Element) -> Option<Identity> {
    let mut level = Some(anchor.clone());
    for _ in 0..NEAR_ANCHOR_LEVELS {
        let element = level?;
        let own = is_link(&element).then(|| element.attr("href")).flatten();
        let found = own
            .as_deref()
            .and_then(channel_id_in)
            .or_else(|| first_channel_link(&element).as_deref().and_then(channel_id_in));
        if let Some(id) = found {
            return Some(Identity::ChannelId(id));
        }
        level = element.parent();
    }
    None
}

fn is_link(element: &Element) -> bool {
    element.tag().eq_ignore_ascii_case("a")
}

fn channel_id_in(href: &str) -> Option<String> {
    CHANNEL_LINK
        .captures(href)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Href of the first descendant link, in document order, mentioning `/channel/`.
fn first_channel_link(element: &Element) -> Option<String> {
    element.child_elements().into_iter().find_map(|child| {
        child
            .attr("href")
            .filter(|href| is_link(&child) && href.contains("/channel/"))
            .or_else(|| first_channel_link(&child))
    })
}

fn is_handle_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '.' | '_' | '-')
}

/// Byte range of the first occurrence of `token` in `haystack` that matches
/// under per-character lowercase folding and is not followed by a handle
/// character.
fn find_clean_token(haystack: &str, token: &str) -> Option<Range<usize>> {
    if token.is_empty() {
        return None;
    }
    haystack.char_indices().find_map(|(start, _)| {
        let end = start + folded_prefix_len(&haystack[start..], token)?;
        let followed = haystack[end..].chars().next().is_some_and(is_handle_char);
        (!followed).then_some(start..end)
    })
}

/// Byte length of the prefix of `text` that equals `token` case-insensitively.
fn folded_prefix_len(text: &str, token: &str) -> Option<usize> {
    let mut chars = text.char_indices();
    let mut len = 0;
    for expected in token.chars() {
        let (at, actual) = chars.next()?;
        if !actual.to_lowercase().eq(expected.to_lowercase()) {
            return None;
        }
        len = at + actual.len_utf8();
    }
    Some(len)
}

/// Per-element bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorState {
    pub key: ResolutionKey,
    /// Token the page rendered for this identity, e.g. `@handle`.
    pub raw_token: Option<String>,
    /// Whether the display name has been written for the current key.
    pub replaced: bool,
}

#[derive(Debug)]
struct Tracked {
    element: WeakElement,
    state: AnchorState,
}

#[derive(Debug)]
struct PendingRequest {
    identity: Identity,
    last_sent: Instant,
    retries: u32,
    retry_due: Option<Instant>,
    terminal: bool,
}

/// How a display name was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Only the token substring was replaced.
    Partial,
    /// The whole text content was replaced.
    Full,
}

impl ApplyMode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Partial => "partial",
            Self::Full => "full",
        }
    }
}

/// Result of [`Reconciler::process_one`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// No identity could be read from the element.
    NoIdentity,
    /// Registered; the key has no name yet.
    Waiting,
    /// The name was written now.
    Applied(ApplyMode),
    /// The name was already in place.
    AlreadyApplied,
}

/// Reconciler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub passes: u64,
    pub processed: u64,
    pub skipped_no_identity: u64,
    pub recycled: u64,
    pub replaced_partial: u64,
    pub replaced_full: u64,
    pub waiting: u64,
    pub requests: u64,
    pub retries: u64,
    pub pruned: u64,
}

/// Page-side state machine.
pub struct Reconciler {
    document: Document,
    shadows: Rc<dyn ShadowRootSource>,
    requester: Box<dyn ResolveRequester>,
    anchor_selector: Selector,
    target_selector: Selector,
    max_retries: u32,
    retry_interval: Duration,
    report_after: u32,

    tracked: HashMap<ElementId, Tracked>,
    members: HashMap<ResolutionKey, BTreeSet<ElementId>>,
    pending: HashMap<ResolutionKey, PendingRequest>,
    resolved: HashMap<ResolutionKey, String>,
    unresolved: HashMap<ResolutionKey, u32>,
    stats: ReconcileStats,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("tracked", &self.tracked.len())
            .field("pending", &self.pending.len())
            .field("resolved", &self.resolved.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(
        document: Document,
        shadows: Rc<dyn ShadowRootSource>,
        requester: Box<dyn ResolveRequester>,
        config: &ReconcilerConfig,
    ) -> Result<Self, ConfigError> {
        let anchor_selector: Selector =
            config.anchor_selector.parse().map_err(ConfigError::Invalid)?;
        let target_selector: Selector =
            config.target_selector.parse().map_err(ConfigError::Invalid)?;
        Ok(Self {
            document,
            shadows,
            requester,
            anchor_selector,
            target_selector,
            max_retries: config.max_retries,
            retry_interval: config.retry_interval(),
            report_after: config.unresolved_report_after,
            tracked: HashMap::new(),
            members: HashMap::new(),
            pending: HashMap::new(),
            resolved: HashMap::new(),
            unresolved: HashMap::new(),
            stats: ReconcileStats::default(),
        })
    }

    #[must_use]
    pub fn document(&self) -> &Document {
        &self.document
    }

    #[must_use]
    pub fn stats(&self) -> ReconcileStats {
        self.stats
    }

    /// Tracked state for an element, if any.
    #[must_use]
    pub fn anchor_state(&self, element: &Element) -> Option<&AnchorState> {
        self.tracked
            .get(&element.element_id())
            .map(|tracked| &tracked.state)
    }

    /// Number of registered elements under `key`.
    #[must_use]
    pub fn member_count(&self, key: &ResolutionKey) -> usize {
        self.members.get(key).map_or(0, BTreeSet::len)
    }

    #[must_use]
    pub fn is_pending(&self, key: &ResolutionKey) -> bool {
        self.pending.contains_key(key)
    }

    /// Whether `key` failed for good this session.
    #[must_use]
    pub fn is_terminal(&self, key: &ResolutionKey) -> bool {
        self.pending.get(key).is_some_and(|p| p.terminal)
    }

    #[must_use]
    pub fn resolved_name(&self, key: &ResolutionKey) -> Option<&str> {
        self.resolved.get(key).map(String::as_str)
    }

    /// Keys seen unresolved across passes, most persistent first.
    #[must_use]
    pub fn unresolved(&self) -> Vec<(ResolutionKey, u32)> {
        let mut out: Vec<_> = self
            .unresolved
            .iter()
            .map(|(key, passes)| (key.clone(), *passes))
            .collect();
        out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        out
    }

    /// Earliest instant a transient retry becomes due.
    #[must_use]
    pub fn next_retry_due(&self) -> Option<Instant> {
        self.pending.values().filter_map(|p| p.retry_due).min()
    }

    /// One reconciliation pass over the document and every exposed shadow
    /// root. Returns the number of anchors visited.
    pub fn process_all(&mut self) -> usize {
        let now = Instant::now();
        self.stats.passes += 1;
        self.fire_due_retries(now);
        self.prune_dead();

        let mut anchors = self.document.query_all(&self.anchor_selector);
        for root in self.shadows.all_roots() {
            if root.is_connected() {
                anchors.extend(root.query_all(&self.anchor_selector));
            }
        }

        for anchor in &anchors {
            self.process_one(anchor);
        }
        self.track_unresolved();
        anchors.len()
    }

    /// Identity shown by an anchor: `/@handle` href, then `/channel/<id>`
    /// href, then text starting with `@`, then a channel link near the anchor.
    #[must_use]
    pub fn extract_identity(&self, element: &Element) -> Option<Identity> {
        element
            .attr("href")
            .and_then(|href| identity_from_href(&href))
            .or_else(|| identity_from_text(&element.text_content()))
            .or_else(|| channel_id_near(element))
    }

    /// Reconcile a single anchor element.
    pub fn process_one(&mut self, anchor: &Element) -> ProcessOutcome {
        self.stats.processed += 1;
        let Some(identity) = self.extract_identity(anchor) else {
            self.stats.skipped_no_identity += 1;
            return ProcessOutcome::NoIdentity;
        };
        let key = identity.key();
        let raw_token = identity.raw_token();
        let target = anchor
            .query_first(&self.target_selector)
            .unwrap_or_else(|| anchor.clone());
        let target_id = target.element_id();

        let previous = self.tracked.get(&target_id).map(|t| t.state.key.clone());
        match previous {
            Some(old) if old != key => {
                self.remove_member(&old, target_id);
                if find_clean_token(&target.text_content(), &raw_token).is_none() {
                    target.set_text_content(&raw_token);
                }
                self.stats.recycled += 1;
                debug!(from = %old, to = %key, element = %target_id, "element recycled");
                self.tracked.insert(
                    target_id,
                    Tracked {
                        element: target.downgrade(),
                        state: AnchorState {
                            key: key.clone(),
                            raw_token: Some(raw_token),
                            replaced: false,
                        },
                    },
                );
            }
            Some(_) => {}
            None => {
                self.tracked.insert(
                    target_id,
                    Tracked {
                        element: target.downgrade(),
                        state: AnchorState {
                            key: key.clone(),
                            raw_token: Some(raw_token),
                            replaced: false,
                        },
                    },
                );
            }
        }
        self.members.entry(key.clone()).or_default().insert(target_id);

        self.request(&key, &identity);

        match self.resolved.get(&key).cloned() {
            Some(name) => match self.apply_display_name(&target, &key, &name) {
                Some(mode) => ProcessOutcome::Applied(mode),
                None => ProcessOutcome::AlreadyApplied,
            },
            None => {
                self.stats.waiting += 1;
                ProcessOutcome::Waiting
            }
        }
    }

    /// Write `name` into `target` for `key`. Returns how it was written, or
    /// `None` when nothing changed.
    pub fn apply_display_name(
        &mut self,
        target: &Element,
        key: &ResolutionKey,
        name: &str,
    ) -> Option<ApplyMode> {
        if name.trim().is_empty() {
            return None;
        }
        let tracked = self.tracked.get_mut(&target.element_id())?;
        if tracked.state.key != *key || tracked.state.replaced {
            return None;
        }

        let token = tracked.state.raw_token.clone().unwrap_or_default();
        let partial = target.text_nodes().into_iter().find_map(|node| {
            let data = node.data();
            find_clean_token(&data, &token).map(|range| (node, data, range))
        });

        let mode = match partial {
            Some((node, data, range)) => {
                node.set_data(format!("{}{name}{}", &data[..range.start], &data[range.end..]));
                self.stats.replaced_partial += 1;
                ApplyMode::Partial
            }
            None => {
                target.set_text_content(name);
                self.stats.replaced_full += 1;
                ApplyMode::Full
            }
        };

        tracked.state.replaced = true;
        tracked.state.raw_token = Some(token);
        trace!(key = %key, element = %target.element_id(), mode = mode.as_str(), "display name applied");
        Some(mode)
    }

    /// Handle a broadcast response.
    pub fn on_resolved(&mut self, response: &ResolveResponse) {
        let Some(key) = response.key() else {
            warn!(?response, "response without identity ignored");
            return;
        };

        if let Some(name) = response
            .display_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
        {
            debug!(key = %key, cached = ?response.cached, "display name received");
            if let Some(pending) = self.pending.get_mut(&key) {
                pending.retry_due = None;
                pending.terminal = false;
            }
            self.unresolved.remove(&key);
            self.resolved.insert(key.clone(), name.to_string());
            self.fan_out(&key, name);
            return;
        }

        if !self.pending.contains_key(&key) {
            return;
        }
        match &response.error {
            Some(failure) if failure.is_transient() => {
                self.schedule_retry(&key, Instant::now());
            }
            failure => {
                if let Some(pending) = self.pending.get_mut(&key) {
                    pending.terminal = true;
                }
                debug!(
                    key = %key,
                    error = ?failure.as_ref().map(|f| f.message.as_str()),
                    "resolution failed; identity stays raw"
                );
            }
        }
    }

    /// The response side of the bridge went away. Every key still waiting
    /// for an answer takes the transient retry path, so it either gets
    /// re-requested within its budget or becomes terminal.
    pub fn on_bridge_closed(&mut self) {
        let now = Instant::now();
        let waiting: Vec<ResolutionKey> = self
            .pending
            .iter()
            .filter(|(key, p)| {
                !p.terminal && p.retry_due.is_none() && !self.resolved.contains_key(*key)
            })
            .map(|(key, _)| key.clone())
            .collect();
        debug!(waiting = waiting.len(), "bridge closed with requests in flight");
        for key in waiting {
            self.schedule_retry(&key, now);
        }
    }

    fn fan_out(&mut self, key: &ResolutionKey, name: &str) {
        let ids: Vec<ElementId> = self
            .members
            .get(key)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();

        for id in ids {
            let live = self
                .tracked
                .get(&id)
                .and_then(|tracked| tracked.element.upgrade())
                .filter(Element::is_connected);
            match live {
                Some(element) => {
                    self.apply_display_name(&element, key, name);
                }
                None => {
                    self.remove_member(key, id);
                    if self
                        .tracked
                        .get(&id)
                        .is_some_and(|t| t.element.upgrade().is_none())
                    {
                        self.tracked.remove(&id);
                    }
                    self.stats.pruned += 1;
                }
            }
        }
    }

    fn request(&mut self, key: &ResolutionKey, identity: &Identity) {
        if self.resolved.contains_key(key) || self.pending.contains_key(key) {
            return;
        }
        let now = Instant::now();
        self.pending.insert(
            key.clone(),
            PendingRequest {
                identity: identity.clone(),
                last_sent: now,
                retries: 0,
                retry_due: None,
                terminal: false,
            },
        );
        self.send(key, identity, now);
    }

    fn send(&mut self, key: &ResolutionKey, identity: &Identity, now: Instant) {
        self.stats.requests += 1;
        if let Err(err) = self.requester.request(ResolveRequest::for_identity(identity)) {
            let failure = ResolveFailure::transient(&err);
            debug!(key = %key, error = %failure.message, "request not delivered");
            self.schedule_retry(key, now);
        }
    }

    fn schedule_retry(&mut self, key: &ResolutionKey, now: Instant) {
        let Some(pending) = self.pending.get_mut(key) else {
            return;
        };
        if pending.retries >= self.max_retries {
            pending.terminal = true;
            pending.retry_due = None;
            debug!(key = %key, retries = pending.retries, "retry budget exhausted");
            return;
        }
        pending.retries += 1;
        pending.retry_due = Some(pending.last_sent.max(now) + self.retry_interval);
        self.stats.retries += 1;
        trace!(key = %key, attempt = pending.retries, "transient failure; retry scheduled");
    }

    fn fire_due_retries(&mut self, now: Instant) {
        let due: Vec<(ResolutionKey, Identity)> = self
            .pending
            .iter_mut()
            .filter(|(_, p)| p.retry_due.is_some_and(|at| at <= now))
            .map(|(key, p)| {
                p.retry_due = None;
                p.last_sent = now;
                (key.clone(), p.identity.clone())
            })
            .collect();
        for (key, identity) in due {
            debug!(key = %key, "re-requesting after transient failure");
            self.send(&key, &identity, now);
        }
    }

    fn remove_member(&mut self, key: &ResolutionKey, id: ElementId) {
        if let Some(set) = self.members.get_mut(key) {
            set.remove(&id);
            if set.is_empty() {
                self.members.remove(key);
            }
        }
    }

    fn prune_dead(&mut self) {
        let dead: Vec<(ElementId, ResolutionKey)> = self
            .tracked
            .iter()
            .filter(|(_, t)| t.element.upgrade().is_none())
            .map(|(id, t)| (*id, t.state.key.clone()))
            .collect();
        for (id, key) in dead {
            self.tracked.remove(&id);
            self.remove_member(&key, id);
            self.stats.pruned += 1;
        }
    }

    fn track_unresolved(&mut self) {
        let waiting: Vec<ResolutionKey> = self
            .members
            .keys()
            .filter(|key| !self.resolved.contains_key(*key))
            .cloned()
            .collect();
        for key in waiting {
            let passes = self.unresolved.entry(key.clone()).or_insert(0);
            *passes += 1;
            if *passes == self.report_after {
                debug!(key = %key, passes = *passes, "identity still unresolved");
            }
        }
    }
}
