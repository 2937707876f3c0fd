//! Converge kubehub – watch and fetch sources backed by kube-rs

#![forbid(unsafe_code)]

use std::fmt::Debug;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures::{stream, StreamExt};
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::{
    api::{Api, DeleteParams, ListParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use converge_core::{CollectionScope, Notification, ResourceIdentity, TransportError};
use converge_wait::{FetchSource, NotificationResult, Subscription, WatchSource, DEFAULT_WATCH_BUFFER};

pub use kube::Client as KubeClient;

/// Build a client from the ambient kubeconfig / in-cluster environment.
pub async fn client() -> Result<Client> {
    Client::try_default().await.context("building kube client")
}

type ApiFactory<K> = Arc<dyn Fn(Option<&str>) -> Api<K> + Send + Sync>;

/// Knows how to build an `Api<K>` for one kind, scoped to a namespace or not.
pub struct KubeApi<K> {
    kind: String,
    namespaced: bool,
    factory: ApiFactory<K>,
}

impl<K> Clone for KubeApi<K> {
    fn clone(&self) -> Self {
        Self { kind: self.kind.clone(), namespaced: self.namespaced, factory: Arc::clone(&self.factory) }
    }
}

impl<K> KubeApi<K>
where
    K: Resource<Scope = NamespaceResourceScope> + 'static,
    K::DynamicType: Default,
{
    /// Namespaced kind; a scope without a namespace watches all namespaces.
    pub fn namespaced(client: Client) -> Self {
        let kind = K::kind(&Default::default()).into_owned();
        let factory: ApiFactory<K> = Arc::new(move |ns: Option<&str>| match ns {
            Some(ns) => Api::namespaced(client.clone(), ns),
            None => Api::all(client.clone()),
        });
        Self { kind, namespaced: true, factory }
    }
}

impl<K> KubeApi<K>
where
    K: Resource<Scope = ClusterResourceScope> + 'static,
    K::DynamicType: Default,
{
    pub fn cluster(client: Client) -> Self {
        let kind = K::kind(&Default::default()).into_owned();
        let factory: ApiFactory<K> = Arc::new(move |_: Option<&str>| Api::all(client.clone()));
        Self { kind, namespaced: false, factory }
    }
}

impl KubeApi<DynamicObject> {
    /// Resolve a GVK key (`v1/Kind` or `group/v1/Kind`) through API discovery.
    pub async fn discover(client: Client, gvk_key: &str) -> Result<Self> {
        let gvk = parse_gvk_key(gvk_key)?;
        let (ar, namespaced) = resolve_gvk(client.clone(), &gvk).await?;
        let kind = ar.kind.clone();
        let factory: ApiFactory<DynamicObject> = Arc::new(move |ns: Option<&str>| match (namespaced, ns) {
            (true, Some(ns)) => Api::namespaced_with(client.clone(), ns, &ar),
            _ => Api::all_with(client.clone(), &ar),
        });
        debug!(gvk = %gvk_key, namespaced, "resolved dynamic api");
        Ok(Self { kind, namespaced, factory })
    }
}

impl<K> KubeApi<K> {
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn is_namespaced(&self) -> bool {
        self.namespaced
    }

    pub fn api(&self, namespace: Option<&str>) -> Api<K> {
        (self.factory)(if self.namespaced { namespace } else { None })
    }

    fn check_kind(&self, kind: &str) -> Result<(), String> {
        if kind == self.kind {
            Ok(())
        } else {
            Err(format!("source for {} cannot serve {}", self.kind, kind))
        }
    }

    /// Api for a single object; namespaced kinds need the identity's namespace.
    fn object_api(&self, identity: &ResourceIdentity) -> Result<Api<K>, String> {
        self.check_kind(&identity.kind)?;
        if self.namespaced && identity.namespace.is_none() {
            return Err(format!("{} is namespaced but {} has no namespace", self.kind, identity));
        }
        Ok(self.api(identity.namespace.as_deref()))
    }
}

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() }),
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

/// Runs discovery for the key's API group only and resolves the kind within it.
async fn resolve_gvk(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client)
        .filter(&[gvk.group.as_str()])
        .run()
        .await
        .with_context(|| format!("discovering api group {:?}", gvk.group))?;
    let (ar, caps) = discovery
        .resolve_gvk(gvk)
        .ok_or_else(|| anyhow!("{} {} is not served by this cluster", gvk.api_version(), gvk.kind))?;
    Ok((ar, matches!(caps.scope, Scope::Namespaced)))
}

fn strip_managed_fields<K: Resource>(obj: &mut K) {
    obj.meta_mut().managed_fields = None;
}

fn identity_of<K: Resource>(kind: &str, obj: &K) -> ResourceIdentity {
    ResourceIdentity { kind: kind.to_string(), namespace: obj.namespace(), name: obj.name_any() }
}

/// Flatten one watcher event into notifications. A relist replays every object as applied.
fn notifications<K: Resource>(kind: &str, ev: Result<Event<K>, watcher::Error>) -> Vec<NotificationResult<K>> {
    let applied = |mut o: K| {
        strip_managed_fields(&mut o);
        Ok(Notification::applied(identity_of(kind, &o), o))
    };
    match ev {
        Ok(Event::Applied(o)) => vec![applied(o)],
        Ok(Event::Deleted(mut o)) => {
            strip_managed_fields(&mut o);
            vec![Ok(Notification::deleted(identity_of(kind, &o), o))]
        }
        Ok(Event::Restarted(list)) => {
            debug!(kind = %kind, count = list.len(), "watch restart");
            list.into_iter().map(applied).collect()
        }
        Err(e) => vec![Err(TransportError::Watch(e.to_string()))],
    }
}

fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 404)
}

/// Watch source over a kube list+watch stream.
pub struct KubeWatch<K> {
    api: KubeApi<K>,
    buffer: usize,
}

impl<K> KubeWatch<K> {
    pub fn new(api: KubeApi<K>) -> Self {
        Self { api, buffer: DEFAULT_WATCH_BUFFER }
    }

    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer;
        self
    }
}

#[async_trait::async_trait]
impl<K> WatchSource<K> for KubeWatch<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn subscribe(&self, scope: &CollectionScope) -> Result<Subscription<K>, TransportError> {
        self.api.check_kind(&scope.kind).map_err(TransportError::Subscribe)?;
        let api = self.api.api(scope.namespace.as_deref());
        // The watcher connects lazily; probe so an unreachable API fails here.
        api.list(&ListParams::default().limit(1)).await.map_err(|e| TransportError::Subscribe(e.to_string()))?;

        let kind = self.api.kind.clone();
        let events = watcher::watcher(api, watcher::Config::default())
            .default_backoff()
            .flat_map(move |ev| stream::iter(notifications(&kind, ev)));
        info!(kind = %scope.kind, ns = ?scope.namespace, "watch established");
        Ok(Subscription::spawn(events, self.buffer))
    }
}

/// Fetch source doing a plain GET; 404 reads as not found.
pub struct KubeFetch<K> {
    api: KubeApi<K>,
}

impl<K> KubeFetch<K> {
    pub fn new(api: KubeApi<K>) -> Self {
        Self { api }
    }
}

#[async_trait::async_trait]
impl<K> FetchSource<K> for KubeFetch<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn fetch(&self, identity: &ResourceIdentity) -> Result<Option<K>, TransportError> {
        let api = self.api.object_api(identity).map_err(TransportError::Fetch)?;
        let mut found = api.get_opt(&identity.name).await.map_err(|e| TransportError::Fetch(e.to_string()))?;
        if let Some(obj) = found.as_mut() {
            strip_managed_fields(obj);
        }
        Ok(found)
    }
}

/// Fetch source that issues a foreground, zero-grace delete on every check.
///
/// Each accepted delete reads as "still present"; a 404 reads as absent. Pair it
/// with an absent classifier to keep deleting until the object is gone.
pub struct DeleteUntilGone<K> {
    api: KubeApi<K>,
}

impl<K> DeleteUntilGone<K> {
    pub fn new(api: KubeApi<K>) -> Self {
        Self { api }
    }
}

#[async_trait::async_trait]
impl<K> FetchSource<()> for DeleteUntilGone<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn fetch(&self, identity: &ResourceIdentity) -> Result<Option<()>, TransportError> {
        let api = self.api.object_api(identity).map_err(TransportError::Fetch)?;
        let dp = DeleteParams { grace_period_seconds: Some(0), ..DeleteParams::foreground() };
        match api.delete(&identity.name, &dp).await {
            Ok(_) => Ok(Some(())),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(TransportError::Fetch(e.to_string())),
        }
    }
}

/// Label selector matching objects deployed with `app=<name>`.
pub fn app_selector(app: &str) -> String {
    format!("app={}", app)
}

/// Fetch source listing every object matching a label selector in the
/// identity's namespace. A listing always exists, so it is never "not found".
pub struct SelectorList<K> {
    api: KubeApi<K>,
    selector: String,
}

impl<K> SelectorList<K> {
    pub fn new(api: KubeApi<K>, selector: impl Into<String>) -> Self {
        Self { api, selector: selector.into() }
    }

    pub fn selector(&self) -> &str {
        &self.selector
    }
}

#[async_trait::async_trait]
impl<K> FetchSource<Vec<K>> for SelectorList<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn fetch(&self, identity: &ResourceIdentity) -> Result<Option<Vec<K>>, TransportError> {
        self.api.check_kind(&identity.kind).map_err(TransportError::Fetch)?;
        let api = self.api.api(identity.namespace.as_deref());
        let list = api
            .list(&ListParams::default().labels(&self.selector))
            .await
            .map_err(|e| TransportError::Fetch(e.to_string()))?;
        let mut items = list.items;
        items.iter_mut().for_each(strip_managed_fields);
        Ok(Some(items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ManagedFieldsEntry, ObjectMeta};
    use converge_core::ChangeKind;

    fn pod(ns: &str, name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                managed_fields: Some(vec![ManagedFieldsEntry::default()]),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn parse_gvk_key_parses_core_and_group() {
        let gvk = parse_gvk_key("v1/Pod").expect("ok");
        assert_eq!((gvk.group.as_str(), gvk.version.as_str(), gvk.kind.as_str()), ("", "v1", "Pod"));
        let gvk = parse_gvk_key("snapshot.storage.k8s.io/v1/VolumeSnapshot").expect("ok");
        assert_eq!(gvk.group, "snapshot.storage.k8s.io");
        assert_eq!(gvk.kind, "VolumeSnapshot");
    }

    #[test]
    fn parse_gvk_key_invalid_returns_err() {
        assert!(parse_gvk_key("invalid").is_err());
        assert!(parse_gvk_key("").is_err());
        assert!(parse_gvk_key("v1/").is_err());
        assert!(parse_gvk_key("a/b/c/d").is_err());
    }

    #[test]
    fn applied_event_carries_identity_and_strips_managed_fields() {
        let out = notifications("Pod", Ok(Event::Applied(pod("csi-test", "web"))));
        assert_eq!(out.len(), 1);
        let n = out[0].as_ref().expect("notification");
        assert_eq!(n.identity, ResourceIdentity::namespaced("Pod", "csi-test", "web"));
        assert_eq!(n.change, ChangeKind::Applied);
        assert!(n.snapshot.metadata.managed_fields.is_none());
    }

    #[test]
    fn restart_replays_every_object_as_applied() {
        let out = notifications("Pod", Ok(Event::Restarted(vec![pod("a", "x"), pod("b", "y")])));
        let names: Vec<_> = out.iter().map(|n| n.as_ref().expect("ok").identity.to_string()).collect();
        assert_eq!(names, vec!["Pod/a/x", "Pod/b/y"]);
        assert!(out.iter().all(|n| n.as_ref().map(|n| n.change == ChangeKind::Applied).unwrap_or(false)));
    }

    #[test]
    fn deleted_event_maps_to_deleted_change() {
        let out = notifications("Pod", Ok(Event::Deleted(pod("a", "x"))));
        assert_eq!(out[0].as_ref().expect("ok").change, ChangeKind::Deleted);
    }

    #[test]
    fn app_selector_formats_label() {
        assert_eq!(app_selector("my-app"), "app=my-app");
    }
}
