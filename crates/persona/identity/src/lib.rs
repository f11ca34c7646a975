//! Persona identity - deterministic hierarchical names.
//!
//! Every logical component of an application (a store, a worker, a secret, a
//! generated file) is named by an [`Id`]. Ids are derived purely from the
//! declarative startup code, so the same program executed in different
//! processes arrives at the same ids and can match components across
//! environments without sharing any runtime state.
//!
//! An id is a dotted path of escaped segments. The derived encodings
//! ([`Id::to_file_path`], [`Id::to_filename`], [`Id::to_uri_path`],
//! [`Id::to_safe_name`]) are pure functions of that path.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

mod encode;
mod escape;

use escape::{escape_segment, unescape, SEPARATOR};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use encode::{SAFE_NAME_BUDGET, SAFE_NAME_HASH_LEN};

/// Hierarchical, escape-reversible component identity.
///
/// Two ids are equal iff their encoded values are equal.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id {
    value: String,
}

impl Id {
    /// Create a root identity from a bare top-level name.
    pub fn root(name: impl AsRef<str>) -> Self {
        Self {
            value: escape_segment(name.as_ref()),
        }
    }

    /// Derive a child identity by appending one segment.
    pub fn child(&self, suffix: impl AsRef<str>) -> Self {
        let segment = escape_segment(suffix.as_ref());
        let mut value = String::with_capacity(self.value.len() + 1 + segment.len());
        value.push_str(&self.value);
        value.push(SEPARATOR);
        value.push_str(&segment);
        Self { value }
    }

    /// Rebuild an id from a previously encoded value (e.g. a persisted key).
    pub fn from_encoded(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }

    /// The full encoded path.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Decoded path segments, root first.
    pub fn parts(&self) -> Vec<String> {
        self.value.split(SEPARATOR).map(unescape).collect()
    }

    /// Decoded last segment.
    pub fn name(&self) -> String {
        self.value
            .rsplit(SEPARATOR)
            .next()
            .map(unescape)
            .unwrap_or_default()
    }

    /// The id this one was derived from, if it is not a root.
    pub fn parent(&self) -> Option<Id> {
        self.value.rfind(SEPARATOR).map(|pos| Id {
            value: self.value[..pos].to_string(),
        })
    }

    /// Number of segments.
    pub fn depth(&self) -> usize {
        self.value.matches(SEPARATOR).count() + 1
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({:?})", self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_appends_escaped_segment() {
        let app = Id::root("shop");
        let id = app.child("orders").child("by.customer");
        assert_eq!(id.value(), "shop.orders.by[46]customer");
        assert_eq!(id.parts(), vec!["shop", "orders", "by.customer"]);
        assert_eq!(id.name(), "by.customer");
        assert_eq!(id.depth(), 3);
    }

    #[test]
    fn root_name_is_escaped() {
        let id = Id::root("a.b");
        assert_eq!(id.depth(), 1);
        assert_eq!(id.parts(), vec!["a.b"]);
        assert!(id.parent().is_none());
    }

    #[test]
    fn parent_strips_last_segment() {
        let id = Id::root("app").child("x.y").child("z");
        assert_eq!(id.parent(), Some(Id::root("app").child("x.y")));
    }

    #[test]
    fn equality_follows_encoded_value() {
        let a = Id::root("app").child("users");
        let b = Id::from_encoded("app.users");
        assert_eq!(a, b);
        assert_ne!(Id::root("app.users"), a);
    }

    #[test]
    fn serde_uses_encoded_string() {
        let id = Id::root("app").child("a.b");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"app.a[46]b\"");
        let back: Id = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
