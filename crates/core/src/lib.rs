//! Converge core types: what a wait targets, what it observes and how it ends.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identity of a single remote resource. Used to filter notifications and fetches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceIdentity {
    pub kind: String,
    /// `None` for cluster-scoped resources.
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceIdentity {
    pub fn namespaced(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind: kind.into(), namespace: Some(namespace.into()), name: name.into() }
    }

    pub fn cluster(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind: kind.into(), namespace: None, name: name.into() }
    }

    /// The collection a watch must subscribe to in order to see this resource.
    pub fn scope(&self) -> CollectionScope {
        CollectionScope { kind: self.kind.clone(), namespace: self.namespace.clone() }
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum IdentityParseError {
    #[error("invalid identity: {0:?} (expect Kind/name or Kind/namespace/name)")]
    Shape(String),
    #[error("invalid identity: {0:?} has an empty segment")]
    EmptySegment(String),
}

/// Parses `Kind/name` (cluster-scoped) or `Kind/namespace/name`.
impl FromStr for ResourceIdentity {
    type Err = IdentityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.iter().any(|p| p.is_empty()) && parts.len() <= 3 {
            return Err(IdentityParseError::EmptySegment(s.to_string()));
        }
        match parts.as_slice() {
            [kind, name] => Ok(Self::cluster(*kind, *name)),
            [kind, ns, name] => Ok(Self::namespaced(*kind, *ns, *name)),
            _ => Err(IdentityParseError::Shape(s.to_string())),
        }
    }
}

/// A resource collection a watch is opened against (not filtered to one name).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CollectionScope {
    pub kind: String,
    /// `None` watches across all namespaces (or a cluster-scoped kind).
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChangeKind {
    Applied,
    Deleted,
}

/// One change delivered by a watch stream.
#[derive(Debug, Clone)]
pub struct Notification<S> {
    pub identity: ResourceIdentity,
    pub snapshot: S,
    pub change: ChangeKind,
}

impl<S> Notification<S> {
    pub fn applied(identity: ResourceIdentity, snapshot: S) -> Self {
        Self { identity, snapshot, change: ChangeKind::Applied }
    }

    pub fn deleted(identity: ResourceIdentity, snapshot: S) -> Self {
        Self { identity, snapshot, change: ChangeKind::Deleted }
    }

    /// What a classifier sees for this notification. Deletions read as absence.
    pub fn observed(&self) -> Observed<'_, S> {
        match self.change {
            ChangeKind::Applied => Observed::Present(&self.snapshot),
            ChangeKind::Deleted => Observed::Absent,
        }
    }
}

/// A resource as seen by a classifier: either a snapshot or confirmed absence.
#[derive(Debug)]
pub enum Observed<'a, S> {
    Present(&'a S),
    Absent,
}

impl<'a, S> Observed<'a, S> {
    pub fn present(self) -> Option<&'a S> {
        match self {
            Observed::Present(s) => Some(s),
            Observed::Absent => None,
        }
    }
}

impl<S> Clone for Observed<'_, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for Observed<'_, S> {}

/// Verdict of a classifier on one observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification<T> {
    Pending,
    Success(T),
    TerminalFailure(String),
}

impl<T> Classification<T> {
    pub fn failed(reason: impl Into<String>) -> Self {
        Classification::TerminalFailure(reason.into())
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Classification::Pending)
    }

    /// Terminal classifications become outcomes; `Pending` has none.
    pub fn into_outcome(self) -> Option<WaitOutcome<T>> {
        match self {
            Classification::Pending => None,
            Classification::Success(v) => Some(WaitOutcome::Success(v)),
            Classification::TerminalFailure(r) => Some(WaitOutcome::TerminalFailure(r)),
        }
    }
}

/// Maps an observation to a [`Classification`].
///
/// Implementations must be pure: the same observation always yields the same
/// verdict, whatever the number of prior calls. Duplicate or replayed
/// notifications then cannot flap between pending and terminal.
pub trait Classifier<S>: Send + Sync {
    type Output: Clone + Send + Sync + 'static;

    fn classify(&self, observed: Observed<'_, S>) -> Classification<Self::Output>;
}

impl<S, T, F> Classifier<S> for F
where
    F: for<'a> Fn(Observed<'a, S>) -> Classification<T> + Send + Sync,
    T: Clone + Send + Sync + 'static,
{
    type Output = T;

    fn classify(&self, observed: Observed<'_, S>) -> Classification<T> {
        self(observed)
    }
}

/// Failure of the observation mechanism itself.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransportError {
    #[error("subscribe: {0}")]
    Subscribe(String),
    #[error("fetch: {0}")]
    Fetch(String),
    #[error("watch: {0}")]
    Watch(String),
    #[error("watch stream ended before the wait resolved")]
    StreamEnded,
    #[error("subscription not released within {grace_ms}ms (resolved as {resolved})")]
    TeardownTimedOut { grace_ms: u64, resolved: String },
}

/// The single result of one wait call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum WaitOutcome<T> {
    Success(T),
    Timeout,
    TerminalFailure(String),
    TransportError(TransportError),
    /// Only produced when the caller supplied an external stop signal.
    Cancelled,
}

impl<T> WaitOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, WaitOutcome::Success(_))
    }

    /// Stable lowercase label (used for metrics and logs).
    pub fn label(&self) -> &'static str {
        match self {
            WaitOutcome::Success(_) => "success",
            WaitOutcome::Timeout => "timeout",
            WaitOutcome::TerminalFailure(_) => "terminal_failure",
            WaitOutcome::TransportError(_) => "transport_error",
            WaitOutcome::Cancelled => "cancelled",
        }
    }

    pub fn into_result(self) -> Result<T, WaitFailure> {
        match self {
            WaitOutcome::Success(v) => Ok(v),
            WaitOutcome::Timeout => Err(WaitFailure::Timeout),
            WaitOutcome::TerminalFailure(r) => Err(WaitFailure::Terminal(r)),
            WaitOutcome::TransportError(e) => Err(WaitFailure::Transport(e)),
            WaitOutcome::Cancelled => Err(WaitFailure::Cancelled),
        }
    }
}

/// Non-success outcomes as an error, for callers that propagate with `?`.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum WaitFailure {
    #[error("timed out waiting for condition")]
    Timeout,
    #[error("terminal failure: {0}")]
    Terminal(String),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("wait cancelled")]
    Cancelled,
}

pub mod prelude {
    pub use super::{
        ChangeKind, Classification, Classifier, CollectionScope, Notification, Observed, ResourceIdentity,
        TransportError, WaitFailure, WaitOutcome,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_namespaced_and_cluster_identities() {
        let id: ResourceIdentity = "Pod/csi-test/my-pod".parse().expect("ok");
        assert_eq!(id, ResourceIdentity::namespaced("Pod", "csi-test", "my-pod"));
        let id: ResourceIdentity = "PersistentVolume/pv-1".parse().expect("ok");
        assert_eq!(id.namespace, None);
        assert_eq!(id.to_string(), "PersistentVolume/pv-1");
    }

    #[test]
    fn rejects_malformed_identities() {
        assert!(matches!("Pod".parse::<ResourceIdentity>(), Err(IdentityParseError::Shape(_))));
        assert!(matches!("a/b/c/d".parse::<ResourceIdentity>(), Err(IdentityParseError::Shape(_))));
        assert!(matches!("Pod//x".parse::<ResourceIdentity>(), Err(IdentityParseError::EmptySegment(_))));
    }

    #[test]
    fn scope_drops_the_name() {
        let id = ResourceIdentity::namespaced("Pod", "ns", "a");
        assert_eq!(id.scope(), CollectionScope { kind: "Pod".into(), namespace: Some("ns".into()) });
    }

    #[test]
    fn deleted_notification_reads_as_absent() {
        let n = Notification::deleted(ResourceIdentity::cluster("Namespace", "x"), 1u8);
        assert!(matches!(n.observed(), Observed::Absent));
        let n = Notification::applied(ResourceIdentity::cluster("Namespace", "x"), 1u8);
        assert_eq!(n.observed().present(), Some(&1u8));
    }

    #[test]
    fn closures_are_classifiers() {
        let c = |o: Observed<'_, u32>| match o.present() {
            Some(v) if *v > 2 => Classification::Success(*v),
            Some(_) => Classification::Pending,
            None => Classification::failed("gone"),
        };
        assert_eq!(c.classify(Observed::Present(&3)), Classification::Success(3));
        assert_eq!(c.classify(Observed::Present(&1)), Classification::Pending);
        assert!(c.classify(Observed::Absent).is_terminal());
    }

    #[test]
    fn outcome_into_result_maps_failures() {
        assert_eq!(WaitOutcome::Success(1).into_result(), Ok(1));
        assert_eq!(WaitOutcome::<u8>::Timeout.into_result(), Err(WaitFailure::Timeout));
        let e = TransportError::Fetch("boom".into());
        assert_eq!(WaitOutcome::<u8>::TransportError(e.clone()).into_result(), Err(WaitFailure::Transport(e)));
        assert_eq!(WaitOutcome::<u8>::Cancelled.label(), "cancelled");
    }

    #[test]
    fn outcome_serializes_with_a_tag() {
        let v = serde_json::to_value(WaitOutcome::<u8>::TerminalFailure("claim lost".into())).expect("json");
        assert_eq!(v, serde_json::json!({ "outcome": "terminal_failure", "detail": "claim lost" }));
        let v = serde_json::to_value(WaitOutcome::<u8>::Timeout).expect("json");
        assert_eq!(v, serde_json::json!({ "outcome": "timeout" }));
    }
}
