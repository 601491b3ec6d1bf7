//! Window key generation and handling.

use crate::identity::Identity;

/// A key that uniquely identifies one sliding window.
///
/// Two checks share counters exactly when they share both identity and
/// bucket name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    /// Who the request is attributed to
    pub identity: Identity,
    /// Name of the resolved bucket
    pub bucket: String,
}

impl WindowKey {
    /// Create a new window key.
    pub fn new(identity: &Identity, bucket: &str) -> Self {
        Self {
            identity: identity.clone(),
            bucket: bucket.to_string(),
        }
    }

    /// The key under which this window lives in the distributed store.
    pub fn to_store_key(&self) -> String {
        format!("ratelimit:{}:{}", self.identity, self.bucket)
    }
}

impl std::fmt::Display for WindowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.identity, self.bucket)
    }
}
