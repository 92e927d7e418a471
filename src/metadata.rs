//! Transport-neutral request metadata.
//!
//! # Responsibilities
//! - Carry correlation identifiers across transport boundaries (HTTP, RPC, broker)
//! - Generate request IDs when none is present
//!
//! # Design Decisions
//! - One string map for every transport; each adapter maps it to its own headers
//! - The correlation entry lives under [`REQUEST_ID_KEY`] and travels on the wire
//!   as [`REQUEST_ID_HEADER`]

use std::collections::HashMap;

/// Metadata key holding the correlation (request) ID.
pub const REQUEST_ID_KEY: &str = "request-id";

/// Header name used to carry the correlation ID on the wire.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Key/value metadata attached to a request or message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata(HashMap<String, String>);

impl Metadata {
    /// Create empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create metadata carrying the given request ID.
    pub fn with_request_id(id: impl Into<String>) -> Self {
        let mut md = Self::new();
        md.insert(REQUEST_ID_KEY, id);
        md
    }

    /// Look up a value by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Insert a value, returning the previous one.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    /// The correlation ID, if one is attached.
    pub fn request_id(&self) -> Option<&str> {
        self.get(REQUEST_ID_KEY).filter(|id| !id.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl FromIterator<(String, String)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Generate a fresh request ID (UUID v4).
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_roundtrip() {
        let md = Metadata::with_request_id("abc");
        assert_eq!(md.request_id(), Some("abc"));
        assert_eq!(md.get(REQUEST_ID_KEY), Some("abc"));
    }

    #[test]
    fn empty_request_id_is_absent() {
        let mut md = Metadata::new();
        md.insert(REQUEST_ID_KEY, "");
        assert_eq!(md.request_id(), None);
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(new_request_id(), new_request_id());
    }
}
