//! Request/broadcast bridge between page sessions and the resolver.
//!
//! Pages send [`ResolveRequest`]s over an unbounded queue; every
//! [`ResolveResponse`] is broadcast to all connected pages, which re-key it
//! from the identity fields it echoes back. Each page has its own unbounded
//! response queue, so a page that falls behind still sees every response.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, trace, warn};

use crate::error::{BridgeError, CandidateFailure, ResolveError};
use crate::identity::{Identity, ResolutionKey};
use crate::resolver::{Resolution, Resolver};

/// A request to resolve one identity.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
}

impl ResolveRequest {
    #[must_use]
    pub fn for_identity(identity: &Identity) -> Self {
        Self {
            handle: identity.handle().map(str::to_string),
            channel_id: identity.channel_id().map(str::to_string),
        }
    }

    pub fn identity(&self) -> Result<Identity, ResolveError> {
        Identity::from_parts(self.handle.as_deref(), self.channel_id.as_deref())
    }
}

/// Failure category carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidIdentity,
    Network,
    Extraction,
    Exhausted,
    TransientBridge,
}

/// Structured failure in a [`ResolveResponse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ResolveFailure {
    #[must_use]
    pub fn transient(err: &BridgeError) -> Self {
        Self {
            kind: FailureKind::TransientBridge,
            message: err.to_string(),
        }
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind == FailureKind::TransientBridge
    }
}

impl From<&ResolveError> for ResolveFailure {
    fn from(err: &ResolveError) -> Self {
        let kind = match err {
            ResolveError::InvalidIdentity => FailureKind::InvalidIdentity,
            ResolveError::Exhausted { last } => match last {
                Some(CandidateFailure::Status(_) | CandidateFailure::Network(_)) => {
                    FailureKind::Network
                }
                Some(CandidateFailure::NoDisplayName) => FailureKind::Extraction,
                None => FailureKind::Exhausted,
            },
        };
        Self {
            kind,
            message: err.to_string(),
        }
    }
}

/// Outcome of one request, echoing the request's identity fields.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResolveFailure>,
}

impl ResolveResponse {
    #[must_use]
    pub fn success(request: &ResolveRequest, resolution: Resolution) -> Self {
        Self {
            handle: request.handle.clone(),
            channel_id: request.channel_id.clone(),
            display_name: Some(resolution.name),
            cached: Some(resolution.cached),
            error: None,
        }
    }

    #[must_use]
    pub fn failure(request: &ResolveRequest, failure: ResolveFailure) -> Self {
        Self {
            handle: request.handle.clone(),
            channel_id: request.channel_id.clone(),
            error: Some(failure),
            ..Self::default()
        }
    }

    /// Key of the identity this response answers, if it names one.
    #[must_use]
    pub fn key(&self) -> Option<ResolutionKey> {
        Identity::from_parts(self.handle.as_deref(), self.channel_id.as_deref())
            .ok()
            .map(|identity| identity.key())
    }
}

/// Page-side request interface.
pub trait ResolveRequester {
    fn request(&self, request: ResolveRequest) -> Result<(), BridgeError>;
}

/// Cloneable request sender handed to the reconciler.
#[derive(Debug, Clone)]
pub struct BridgeRequester {
    requests: mpsc::UnboundedSender<ResolveRequest>,
}

impl ResolveRequester for BridgeRequester {
    fn request(&self, request: ResolveRequest) -> Result<(), BridgeError> {
        self.requests
            .send(request)
            .map_err(|_| BridgeError::Disconnected)
    }
}

/// Page end of the bridge.
#[derive(Debug)]
pub struct PageBridge {
    requester: BridgeRequester,
    responses: mpsc::UnboundedReceiver<ResolveResponse>,
}

impl PageBridge {
    #[must_use]
    pub fn requester(&self) -> BridgeRequester {
        self.requester.clone()
    }

    /// Next broadcast response; `None` once the resolver side is gone.
    pub async fn recv(&mut self) -> Option<ResolveResponse> {
        self.responses.recv().await
    }
}

/// Fan-out of responses to every connected page.
#[derive(Debug, Clone, Default)]
struct Subscribers {
    pages: Arc<Mutex<Vec<mpsc::UnboundedSender<ResolveResponse>>>>,
}

impl Subscribers {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ResolveResponse> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.pages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    /// Deliver to every live page, forgetting pages that went away.
    /// Returns the number of pages reached.
    fn publish(&self, response: &ResolveResponse) -> usize {
        let mut pages = self.pages.lock().unwrap_or_else(|e| e.into_inner());
        pages.retain(|page| page.send(response.clone()).is_ok());
        pages.len()
    }
}

impl ResolveRequester for PageBridge {
    fn request(&self, request: ResolveRequest) -> Result<(), BridgeError> {
        self.requester.request(request)
    }
}

/// Resolver end of the bridge.
#[derive(Debug)]
pub struct ResolverEndpoint {
    requests: mpsc::UnboundedReceiver<ResolveRequest>,
    request_tx: mpsc::WeakUnboundedSender<ResolveRequest>,
    responses: Subscribers,
}

impl ResolverEndpoint {
    /// Connect another page to the same resolver.
    pub fn connect(&self) -> Result<PageBridge, BridgeError> {
        let requests = self.request_tx.upgrade().ok_or(BridgeError::Disconnected)?;
        Ok(PageBridge {
            requester: BridgeRequester { requests },
            responses: self.responses.subscribe(),
        })
    }
}

/// Build a connected page/resolver pair.
#[must_use]
pub fn channel() -> (PageBridge, ResolverEndpoint) {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let responses = Subscribers::default();
    let endpoint = ResolverEndpoint {
        requests: request_rx,
        request_tx: request_tx.downgrade(),
        responses: responses.clone(),
    };
    let page = PageBridge {
        requester: BridgeRequester {
            requests: request_tx,
        },
        responses: responses.subscribe(),
    };
    (page, endpoint)
}

/// Serves bridge requests with a shared [`Resolver`].
#[derive(Debug, Clone)]
pub struct ResolverService {
    resolver: Arc<Resolver>,
}

impl ResolverService {
    #[must_use]
    pub fn new(resolver: Arc<Resolver>) -> Self {
        Self { resolver }
    }

    pub fn spawn(self, endpoint: ResolverEndpoint) -> JoinHandle<()> {
        tokio::spawn(self.serve(endpoint))
    }

    /// Resolve each request on its own task until every page is gone, then
    /// wait for outstanding resolutions to broadcast their results.
    pub async fn serve(self, endpoint: ResolverEndpoint) {
        let ResolverEndpoint {
            mut requests,
            responses,
            ..
        } = endpoint;
        let mut tasks = JoinSet::new();

        while let Some(request) = requests.recv().await {
            trace!(?request, "resolve request received");
            let resolver = self.resolver.clone();
            let responses = responses.clone();
            tasks.spawn(async move {
                let response = match resolver
                    .resolve_parts(request.handle.as_deref(), request.channel_id.as_deref())
                    .await
                {
                    Ok(resolution) => ResolveResponse::success(&request, resolution),
                    Err(err) => ResolveResponse::failure(&request, ResolveFailure::from(&err)),
                };
                if responses.publish(&response) == 0 {
                    trace!("no page listening for response");
                }
            });
            while let Some(joined) = tasks.try_join_next() {
                if let Err(err) = joined {
                    warn!(error = %err, "resolve task failed");
                }
            }
        }

        debug!(outstanding = tasks.len(), "bridge closed; draining resolutions");
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "resolve task failed");
            }
        }
    }
}
