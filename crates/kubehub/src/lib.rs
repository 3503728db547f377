//! kreflect kubehub: connection setup and list/watch against a Kubernetes API server.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use kreflect_core::{
    ChangeEvent, CollectionVersion, EventStream, FetchError, ListResult, ListerWatcher, MirroredObject, Selector,
    WatchStatus,
};
use kube::{
    api::{Api, ListParams, WatchEvent, WatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::Scope,
    Client, Config,
};
use tracing::{debug, info};

/// Server-side watch timeout; slightly under the API server's 5 minute cap.
pub const WATCH_TIMEOUT_SECS: u32 = 294;

/// Connection parameters. At least one must be set; the kubeconfig wins when both are.
#[derive(Debug, Clone, Default)]
pub struct ConnectParams {
    pub master_url: Option<String>,
    pub kubeconfig: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("must specify a master url or a kubeconfig")]
    Missing,
    #[error("reading kubeconfig {path}: {source}")]
    Kubeconfig {
        path: PathBuf,
        #[source]
        source: kube::config::KubeconfigError,
    },
    #[error("invalid master url {url:?}: {source}")]
    MasterUrl {
        url: String,
        #[source]
        source: http::uri::InvalidUri,
    },
    #[error("building kube client: {0}")]
    Client(#[from] kube::Error),
}

/// Build a client from the given parameters.
pub async fn connect(params: &ConnectParams) -> std::result::Result<Client, ConnectError> {
    let config = match (&params.kubeconfig, &params.master_url) {
        (Some(path), _) => config_from_kubeconfig(path).await?,
        (None, Some(url)) => {
            let uri = url
                .parse::<http::Uri>()
                .map_err(|source| ConnectError::MasterUrl { url: url.clone(), source })?;
            Config::new(uri)
        }
        (None, None) => return Err(ConnectError::Missing),
    };
    info!(cluster = %config.cluster_url, "connecting");
    Ok(Client::try_from(config)?)
}

async fn config_from_kubeconfig(path: &Path) -> std::result::Result<Config, ConnectError> {
    let wrap = |source| ConnectError::Kubeconfig { path: path.to_path_buf(), source };
    let kc = Kubeconfig::read_from(path).map_err(wrap)?;
    Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default()).await.map_err(wrap)
}

/// Parse `v1/Kind` or `group/v1/Kind`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind::gvk(group, version, kind)),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn to_mirrored(obj: &DynamicObject) -> MirroredObject {
    // DynamicObject serialization is infallible in practice; fall back to an empty payload.
    let mut raw = serde_json::to_value(obj).unwrap_or(serde_json::Value::Null);
    strip_managed_fields(&mut raw);
    MirroredObject {
        namespace: obj.metadata.namespace.clone(),
        name: obj.metadata.name.clone().unwrap_or_default(),
        resource_version: obj.metadata.resource_version.clone(),
        raw,
    }
}

fn fetch_error(err: kube::Error) -> FetchError {
    match &err {
        kube::Error::Api(resp) if resp.code == 410 => FetchError::Stale(resp.message.clone()),
        _ => FetchError::Transient(err.to_string()),
    }
}

fn change_event(ev: WatchEvent<DynamicObject>, since: &CollectionVersion) -> ChangeEvent {
    let version_of = |o: &DynamicObject| {
        o.metadata.resource_version.clone().map(CollectionVersion::new).unwrap_or_else(|| since.clone())
    };
    match ev {
        WatchEvent::Added(o) => ChangeEvent::Added { version: version_of(&o), object: to_mirrored(&o) },
        WatchEvent::Modified(o) => ChangeEvent::Modified { version: version_of(&o), object: to_mirrored(&o) },
        WatchEvent::Deleted(o) => ChangeEvent::Deleted { version: version_of(&o), object: to_mirrored(&o) },
        WatchEvent::Bookmark(b) => ChangeEvent::Bookmark { version: CollectionVersion::new(b.metadata.resource_version) },
        WatchEvent::Error(e) => ChangeEvent::Error(WatchStatus { code: e.code, reason: e.reason, message: e.message }),
    }
}

fn list_params(selector: &Selector) -> ListParams {
    let mut lp = ListParams::default();
    if let Some(labels) = selector.label_selector.as_deref() {
        lp = lp.labels(labels);
    }
    if let Some(fields) = selector.field_selector.as_deref() {
        lp = lp.fields(fields);
    }
    lp
}

fn watch_params(selector: &Selector) -> WatchParams {
    let mut wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
    if let Some(labels) = selector.label_selector.as_deref() {
        wp = wp.labels(labels);
    }
    if let Some(fields) = selector.field_selector.as_deref() {
        wp = wp.fields(fields);
    }
    wp
}

/// List/watch one resource kind through the dynamic API.
pub struct KubeListerWatcher {
    client: Client,
    resource: ApiResource,
    namespaced: bool,
}

impl KubeListerWatcher {
    /// Resolve `gvk_key` against the cluster's discovery information.
    pub async fn discover(client: Client, gvk_key: &str) -> Result<Self> {
        let gvk = parse_gvk_key(gvk_key)?;
        let (resource, caps) = kube::discovery::pinned_kind(&client, &gvk)
            .await
            .with_context(|| format!("resolving {} via discovery", gvk_key))?;
        let namespaced = matches!(caps.scope, Scope::Namespaced);
        debug!(gvk = %gvk_key, plural = %resource.plural, namespaced, "resource resolved");
        Ok(Self { client, resource, namespaced })
    }

    pub fn kind(&self) -> &str { &self.resource.kind }

    pub fn namespaced(&self) -> bool { self.namespaced }

    fn api(&self, selector: &Selector) -> Api<DynamicObject> {
        match selector.namespace.as_deref() {
            Some(ns) if self.namespaced => Api::namespaced_with(self.client.clone(), ns, &self.resource),
            _ => Api::all_with(self.client.clone(), &self.resource),
        }
    }
}

#[async_trait::async_trait]
impl ListerWatcher for KubeListerWatcher {
    async fn list(&self, selector: &Selector) -> std::result::Result<ListResult, FetchError> {
        let list = self.api(selector).list(&list_params(selector)).await.map_err(fetch_error)?;
        let version = list
            .metadata
            .resource_version
            .clone()
            .ok_or_else(|| FetchError::Transient("list response carried no resourceVersion".into()))?;
        let items = list.items.iter().map(to_mirrored).collect();
        Ok(ListResult { items, version: CollectionVersion::new(version) })
    }

    async fn watch(&self, selector: &Selector, since: &CollectionVersion) -> std::result::Result<EventStream, FetchError> {
        let stream = self
            .api(selector)
            .watch(&watch_params(selector), since.as_str())
            .await
            .map_err(fetch_error)?;
        let since = since.clone();
        Ok(stream
            .map(move |res| res.map(|ev| change_event(ev, &since)).map_err(fetch_error))
            .boxed())
    }
}
