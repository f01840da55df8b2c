//! handlename-core: Core library for handlename
//!
//! Resolves channel handles and channel ids to display names by scraping
//! public channel pages, and substitutes those names over identity mentions
//! in a page DOM, including shadow trees whose elements get recycled.
//!
//! # Architecture
//!
//! ```text
//! Scheduler → Reconciler.process_all() → request (deduplicated)
//!                                            ↓ bridge
//!                  Resolver (cache hit, or ordered fetch + extract)
//!                                            ↓ broadcast
//!              Reconciler.on_resolved() → every element under the key
//! ```
//!
//! # Modules
//!
//! - `identity`: Identities and normalized resolution keys
//! - `extract`: Display-name extraction from channel page HTML
//! - `cache`: TTL-bounded resolution cache and its snapshot format
//! - `store`: Durable snapshot storage (memory, JSON file)
//! - `persist`: Debounced snapshot writer
//! - `fetch`: Page fetching over HTTP
//! - `resolver`: Ordered candidate-URL resolution with single flight
//! - `bridge`: Request/broadcast channel between pages and the resolver
//! - `dom`: Minimal reference-counted DOM
//! - `shadow`: Shadow root capture
//! - `reconciler`: Per-element state machine and name substitution
//! - `scheduler`: Trigger debouncing and throttling
//! - `session`: Page-side event loop
//! - `config`: Configuration management
//! - `logging`: Structured logging setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod bridge;
pub mod cache;
pub mod config;
pub mod dom;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod identity;
pub mod logging;
pub mod persist;
pub mod reconciler;
pub mod resolver;
pub mod scheduler;
pub mod session;
pub mod shadow;
pub mod store;

pub use error::{Error, Result};
pub use identity::{Identity, ResolutionKey};
pub use resolver::{Resolution, Resolver};

/// Version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
