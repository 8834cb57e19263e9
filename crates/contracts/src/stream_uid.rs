//! Per-outlet instance identifier.
//!
//! Every outlet draws a fresh uid, so a restarted producer can be told apart
//! from its predecessor even when both carry the same source id. The uid is
//! shared through an `Arc<str>` since descriptors get cloned into resolver
//! caches, inlets and discovery events.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct StreamUid(Arc<str>);

impl StreamUid {
    /// Draw a new random uid
    pub fn generate() -> Self {
        uuid::Uuid::new_v4().to_string().into()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for the placeholder carried by descriptors that were never published
    pub fn is_unset(&self) -> bool {
        self.0.is_empty()
    }
}

impl Deref for StreamUid {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for StreamUid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// lets HashMap<StreamUid, _> be queried with a plain &str
impl Borrow<str> for StreamUid {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StreamUid {
    fn from(uid: &str) -> Self {
        Self(uid.into())
    }
}

impl From<String> for StreamUid {
    fn from(uid: String) -> Self {
        Self(uid.into())
    }
}

impl From<StreamUid> for String {
    fn from(uid: StreamUid) -> Self {
        uid.0.to_string()
    }
}

impl fmt::Display for StreamUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for StreamUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StreamUid").field(&&*self.0).finish()
    }
}

impl PartialEq<str> for StreamUid {
    fn eq(&self, other: &str) -> bool {
        &*self.0 == other
    }
}

impl PartialEq<&str> for StreamUid {
    fn eq(&self, other: &&str) -> bool {
        &*self.0 == *other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generated_uids_differ() {
        let a = StreamUid::generate();
        let b = StreamUid::generate();
        assert_ne!(a, b);
        assert!(!a.is_unset());
        assert!(StreamUid::default().is_unset());
    }

    #[test]
    fn test_set_lookup_with_str() {
        let uid: StreamUid = "abc".into();
        let mut seen: HashSet<StreamUid> = HashSet::new();
        seen.insert(uid.clone());
        assert!(seen.contains("abc"));
        assert_eq!(uid, "abc");
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let uid: StreamUid = "u-1".into();
        let json = serde_json::to_string(&uid).unwrap();
        assert_eq!(json, "\"u-1\"");
        let parsed: StreamUid = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, uid);
    }
}
