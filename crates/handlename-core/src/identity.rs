//! Channel identities and the cache keys derived from them.
//!
//! A [`ResolutionKey`] is the only value shared between the resolving side
//! and the page side: both derive it from an [`Identity`] with the same
//! normalization, so a name resolved for `@Foo` lands on elements that
//! mention `@foo`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ResolveError;

const HANDLE_PREFIX: &str = "h:";
const CHANNEL_PREFIX: &str = "c:";

/// A channel as referenced by the host page.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// Human-chosen handle, without the leading `@`. Case-insensitive.
    Handle(String),
    /// Canonical channel id. Case-sensitive.
    ChannelId(String),
}

impl Identity {
    /// Build an identity from the optional wire fields.
    ///
    /// A non-empty handle wins over a channel id; a leading `@` on the handle
    /// is dropped.
    pub fn from_parts(
        handle: Option<&str>,
        channel_id: Option<&str>,
    ) -> Result<Self, ResolveError> {
        let handle = handle
            .map(|h| h.trim().trim_start_matches('@'))
            .filter(|h| !h.is_empty());
        if let Some(handle) = handle {
            return Ok(Self::Handle(handle.to_string()));
        }
        match channel_id.map(str::trim).filter(|c| !c.is_empty()) {
            Some(id) => Ok(Self::ChannelId(id.to_string())),
            None => Err(ResolveError::InvalidIdentity),
        }
    }

    /// Parse user input: `@handle`, a `/@handle` or `/channel/<id>` URL, or a
    /// bare handle.
    pub fn parse(input: &str) -> Result<Self, ResolveError> {
        let input = input.trim();
        if let Some(identity) = crate::reconciler::identity_from_href(input) {
            return Ok(identity);
        }
        Self::from_parts(Some(input), None)
    }

    /// Normalized cache key for this identity.
    #[must_use]
    pub fn key(&self) -> ResolutionKey {
        match self {
            Self::Handle(handle) => {
                ResolutionKey(format!("{HANDLE_PREFIX}{}", handle.to_lowercase()))
            }
            Self::ChannelId(id) => ResolutionKey(format!("{CHANNEL_PREFIX}{id}")),
        }
    }

    /// The token the host page renders for this identity before substitution.
    #[must_use]
    pub fn raw_token(&self) -> String {
        match self {
            Self::Handle(handle) => format!("@{handle}"),
            Self::ChannelId(id) => id.clone(),
        }
    }

    /// Handle value, when this is a handle.
    #[must_use]
    pub fn handle(&self) -> Option<&str> {
        match self {
            Self::Handle(handle) => Some(handle),
            Self::ChannelId(_) => None,
        }
    }

    /// Channel id value, when this is a channel id.
    #[must_use]
    pub fn channel_id(&self) -> Option<&str> {
        match self {
            Self::Handle(_) => None,
            Self::ChannelId(id) => Some(id),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handle(handle) => write!(f, "@{handle}"),
            Self::ChannelId(id) => write!(f, "channel/{id}"),
        }
    }
}

/// Normalized identity key: `h:<lowercase handle>` or `c:<channel id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResolutionKey(String);

impl ResolutionKey {
    /// Validate a persisted key. Returns `None` for anything this crate
    /// would never have produced.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        if let Some(handle) = raw.strip_prefix(HANDLE_PREFIX) {
            if handle.is_empty() || handle != handle.to_lowercase() {
                return None;
            }
        } else if let Some(id) = raw.strip_prefix(CHANNEL_PREFIX) {
            if id.is_empty() {
                return None;
            }
        } else {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResolutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ResolutionKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("invalid resolution key: {value}"))
    }
}

impl From<ResolutionKey> for String {
    fn from(key: ResolutionKey) -> Self {
        key.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_keys_are_case_insensitive() {
        let upper = Identity::Handle("Foo".into()).key();
        let lower = Identity::Handle("foo".into()).key();
        assert_eq!(upper, lower);
        assert_eq!(upper.as_str(), "h:foo");
    }

    #[test]
    fn channel_keys_are_case_sensitive() {
        let a = Identity::ChannelId("UCabc".into()).key();
        let b = Identity::ChannelId("ucabc".into()).key();
        assert_ne!(a, b);
        assert_eq!(a.as_str(), "c:UCabc");
    }

    #[test]
    fn from_parts_prefers_handle() {
        let identity = Identity::from_parts(Some("@Someone"), Some("UC123")).unwrap();
        assert_eq!(identity, Identity::Handle("Someone".into()));
    }

    #[test]
    fn from_parts_treats_empty_as_absent() {
        let identity = Identity::from_parts(Some(""), Some("UC123")).unwrap();
        assert_eq!(identity, Identity::ChannelId("UC123".into()));
        assert_eq!(
            Identity::from_parts(Some("  "), Some("")),
            Err(ResolveError::InvalidIdentity)
        );
        assert_eq!(
            Identity::from_parts(None, None),
            Err(ResolveError::InvalidIdentity)
        );
    }

    #[test]
    fn parse_accepts_urls_and_bare_handles() {
        assert_eq!(
            Identity::parse("https://www.youtube.com/@Example/videos").unwrap(),
            Identity::Handle("Example".into())
        );
        assert_eq!(
            Identity::parse("/channel/UCxyz").unwrap(),
            Identity::ChannelId("UCxyz".into())
        );
        assert_eq!(
            Identity::parse("@someone").unwrap(),
            Identity::Handle("someone".into())
        );
        assert_eq!(
            Identity::parse("someone").unwrap(),
            Identity::Handle("someone".into())
        );
    }

    #[test]
    fn raw_tokens() {
        assert_eq!(Identity::Handle("Foo".into()).raw_token(), "@Foo");
        assert_eq!(Identity::ChannelId("UC1".into()).raw_token(), "UC1");
    }

    #[test]
    fn key_parse_rejects_foreign_values() {
        assert!(ResolutionKey::parse("h:foo").is_some());
        assert!(ResolutionKey::parse("c:UCabc").is_some());
        assert!(ResolutionKey::parse("h:").is_none());
        assert!(ResolutionKey::parse("h:Foo").is_none());
        assert!(ResolutionKey::parse("x:foo").is_none());
        assert!(ResolutionKey::parse("foo").is_none());
    }

    #[test]
    fn key_serde_validates() {
        let key: ResolutionKey = serde_json::from_str("\"c:UC1\"").unwrap();
        assert_eq!(key.as_str(), "c:UC1");
        assert!(serde_json::from_str::<ResolutionKey>("\"bogus\"").is_err());
    }
}
