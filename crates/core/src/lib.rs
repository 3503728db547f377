//! kreflect core types: the mirrored object model, change events and the
//! list/watch contract the reflector consumes.

#![forbid(unsafe_code)]

use std::fmt;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Store key derived from `(namespace, name)`.
///
/// Namespaced objects render as `namespace/name`, cluster-scoped ones as `name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        match namespace {
            Some(ns) if !ns.is_empty() => Self(format!("{}/{}", ns, name)),
            _ => Self(name.to_string()),
        }
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for ObjectKey {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

impl From<String> for ObjectKey {
    fn from(s: String) -> Self { Self(s) }
}

/// Opaque, server-issued collection version. Continuation point for the next watch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionVersion(String);

impl CollectionVersion {
    pub fn new(v: impl Into<String>) -> Self { Self(v.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for CollectionVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// A mirrored remote object. Identity is `(namespace, name)`; last write wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirroredObject {
    pub namespace: Option<String>,
    pub name: String,
    /// Per-object version, for display only.
    pub resource_version: Option<String>,
    /// Raw object payload.
    pub raw: serde_json::Value,
}

impl MirroredObject {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
            resource_version: None,
            raw: serde_json::Value::Null,
        }
    }

    pub fn with_resource_version(mut self, rv: impl Into<String>) -> Self {
        self.resource_version = Some(rv.into());
        self
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = raw;
        self
    }

    pub fn key(&self) -> ObjectKey { ObjectKey::new(self.namespace.as_deref(), &self.name) }

    /// Look up a dotted path (`status.phase`) in the raw payload and render it if scalar.
    pub fn field(&self, path: &str) -> Option<String> {
        let mut cur = &self.raw;
        for seg in path.split('.') {
            cur = cur.get(seg)?;
        }
        match cur {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

/// Status carried by an in-stream watch error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchStatus {
    pub code: u16,
    pub reason: String,
    pub message: String,
}

impl WatchStatus {
    /// True when the server no longer holds history for the requested version.
    pub fn is_expired(&self) -> bool {
        self.code == 410 || self.reason == "Expired" || self.reason == "Gone"
    }
}

impl fmt::Display for WatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.code, self.reason, self.message)
    }
}

/// One entry of the incremental change feed.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Added { object: MirroredObject, version: CollectionVersion },
    Modified { object: MirroredObject, version: CollectionVersion },
    Deleted { object: MirroredObject, version: CollectionVersion },
    /// Progress marker: no object changed, but the collection reached `version`.
    Bookmark { version: CollectionVersion },
    Error(WatchStatus),
}

impl ChangeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::Added { .. } => "added",
            ChangeEvent::Modified { .. } => "modified",
            ChangeEvent::Deleted { .. } => "deleted",
            ChangeEvent::Bookmark { .. } => "bookmark",
            ChangeEvent::Error(_) => "error",
        }
    }

    pub fn version(&self) -> Option<&CollectionVersion> {
        match self {
            ChangeEvent::Added { version, .. }
            | ChangeEvent::Modified { version, .. }
            | ChangeEvent::Deleted { version, .. }
            | ChangeEvent::Bookmark { version } => Some(version),
            ChangeEvent::Error(_) => None,
        }
    }
}

/// Restricts which objects a list/watch includes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    /// `None` means all namespaces.
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
}

impl Selector {
    pub fn everything() -> Self { Self::default() }

    pub fn namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = Some(ns.into());
        self
    }

    pub fn labels(mut self, sel: impl Into<String>) -> Self {
        self.label_selector = Some(sel.into());
        self
    }

    pub fn fields(mut self, sel: impl Into<String>) -> Self {
        self.field_selector = Some(sel.into());
        self
    }

    pub fn is_everything(&self) -> bool {
        self.namespace.is_none() && self.label_selector.is_none() && self.field_selector.is_none()
    }
}

/// Point-in-time full list.
#[derive(Debug, Clone)]
pub struct ListResult {
    pub items: Vec<MirroredObject>,
    pub version: CollectionVersion,
}

/// Failures of the remote list/watch calls. Neither is fatal to the reflector.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("transient fetch error: {0}")]
    Transient(String),
    #[error("continuation point expired: {0}")]
    Stale(String),
}

impl FetchError {
    pub fn is_stale(&self) -> bool { matches!(self, FetchError::Stale(_)) }
}

pub type EventStream = BoxStream<'static, Result<ChangeEvent, FetchError>>;

/// Remote collection client: a full list plus a change feed starting at a version.
#[async_trait::async_trait]
pub trait ListerWatcher: Send + Sync {
    async fn list(&self, selector: &Selector) -> Result<ListResult, FetchError>;

    async fn watch(&self, selector: &Selector, since: &CollectionVersion) -> Result<EventStream, FetchError>;
}

pub mod prelude {
    pub use super::{
        ChangeEvent, CollectionVersion, EventStream, FetchError, ListResult, ListerWatcher, MirroredObject, ObjectKey,
        Selector, WatchStatus,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_derivation() {
        let ns = MirroredObject::new(Some("default"), "a");
        assert_eq!(ns.key().as_str(), "default/a");
        let cluster = MirroredObject::new(None, "node-1");
        assert_eq!(cluster.key().as_str(), "node-1");
        let empty_ns = MirroredObject::new(Some(""), "x");
        assert_eq!(empty_ns.key().as_str(), "x");
    }

    #[test]
    fn selector_builder() {
        assert!(Selector::everything().is_everything());
        let sel = Selector::everything().namespace("default").labels("app=web");
        assert!(!sel.is_everything());
        assert_eq!(sel.namespace.as_deref(), Some("default"));
        assert_eq!(sel.label_selector.as_deref(), Some("app=web"));
        assert_eq!(sel.field_selector, None);
    }

    #[test]
    fn expired_status() {
        let gone = WatchStatus { code: 410, reason: "Gone".into(), message: "too old resource version".into() };
        assert!(gone.is_expired());
        let expired = WatchStatus { code: 200, reason: "Expired".into(), message: String::new() };
        assert!(expired.is_expired());
        let internal = WatchStatus { code: 500, reason: "InternalError".into(), message: String::new() };
        assert!(!internal.is_expired());
    }

    #[test]
    fn field_lookup() {
        let o = MirroredObject::new(Some("default"), "p").with_raw(serde_json::json!({
            "status": { "phase": "Running", "hostIP": "10.0.0.3", "restarts": 2 }
        }));
        assert_eq!(o.field("status.phase").as_deref(), Some("Running"));
        assert_eq!(o.field("status.restarts").as_deref(), Some("2"));
        assert_eq!(o.field("status.podIP"), None);
        assert_eq!(o.field("status"), None);
    }
}
