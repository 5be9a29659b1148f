//! Fleetsweep kube integration: watch source and lister over dynamic objects.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use futures::TryStreamExt;
use kube::{
    api::{Api, DeleteParams, ListParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client, Config,
};
use fleetsweep_core::{EventKind, Lister, ObjectRef, ResourceKind, WatchEvent, WatchSource};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind {
            group: String::new(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        [group, version, kind] => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

fn ref_from(obj: &DynamicObject) -> Option<ObjectRef> {
    let name = obj.metadata.name.clone()?;
    Some(ObjectRef { namespace: obj.metadata.namespace.clone(), name })
}

/// Cluster access shared by the watch adapter, the resync lister and the
/// collector policy. Kinds are addressed by GVK key and resolved against API
/// discovery once, then cached.
pub struct KubeHub {
    client: Client,
    namespace: Option<String>,
    resources: Mutex<FxHashMap<ResourceKind, (ApiResource, bool)>>,
}

impl KubeHub {
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self { client, namespace, resources: Mutex::new(FxHashMap::default()) }
    }

    /// Build a client from an explicit kubeconfig path (development) or from
    /// the inferred environment (in-cluster or default context).
    pub async fn connect(kubeconfig: Option<&str>, namespace: Option<String>) -> Result<Self> {
        let config = match kubeconfig {
            Some(path) => {
                let kc = Kubeconfig::read_from(path)
                    .with_context(|| format!("reading kubeconfig at {path}"))?;
                Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                    .await
                    .context("loading kubeconfig")?
            }
            None => Config::infer().await.context("inferring cluster config")?,
        };
        let client = Client::try_from(config).context("building kube client")?;
        Ok(Self::new(client, namespace))
    }

    async fn resolve(&self, kind: &ResourceKind) -> Result<(ApiResource, bool)> {
        if let Some(found) = self.resources.lock().await.get(kind) {
            return Ok(found.clone());
        }
        let gvk = parse_gvk_key(kind.as_str())?;
        let discovery = Discovery::new(self.client.clone()).run().await?;
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    self.resources
                        .lock()
                        .await
                        .insert(kind.clone(), (ar.clone(), namespaced));
                    return Ok((ar, namespaced));
                }
            }
        }
        Err(anyhow!("kind not served by the cluster: {}", kind))
    }

    async fn api_for(&self, kind: &ResourceKind) -> Result<Api<DynamicObject>> {
        let (ar, namespaced) = self.resolve(kind).await?;
        let api = if namespaced {
            match &self.namespace {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
                None => Api::all_with(self.client.clone(), &ar),
            }
        } else {
            Api::all_with(self.client.clone(), &ar)
        };
        Ok(api)
    }

    /// Fetch one object; `None` when it no longer exists.
    pub async fn fetch(&self, kind: &ResourceKind, object: &ObjectRef) -> Result<Option<DynamicObject>> {
        let api = self.api_for(kind).await?;
        match api.get(&object.name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete one object; already-gone objects are a success (idempotent).
    pub async fn delete(&self, kind: &ResourceKind, object: &ObjectRef) -> Result<()> {
        let api = self.api_for(kind).await?;
        match api.delete(&object.name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(kind = %kind, name = %object.name, "object deleted");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait::async_trait]
impl WatchSource for KubeHub {
    /// Stream change notifications until the watch drops. The kube watcher
    /// does not distinguish creates from updates, so both surface as
    /// `Updated`; a re-list after a watch restart replays every object.
    /// The watcher connects lazily, so the readiness signal fires on the
    /// first delivered event (the initial re-list arrives immediately once
    /// the stream is actually open).
    async fn watch(
        &self,
        kind: &ResourceKind,
        events: mpsc::Sender<WatchEvent>,
        established: oneshot::Sender<()>,
    ) -> Result<()> {
        let api = self.api_for(kind).await?;
        let stream = kube::runtime::watcher::watcher(api, kube::runtime::watcher::Config::default());
        futures::pin_mut!(stream);
        let mut established = Some(established);
        while let Some(ev) = stream.try_next().await? {
            if let Some(ready) = established.take() {
                let _ = ready.send(());
                info!(kind = %kind, ns = ?self.namespace, "watch stream open");
            }
            use kube::runtime::watcher::Event;
            let mapped: Vec<WatchEvent> = match ev {
                Event::Applied(o) => to_events(EventKind::Updated, std::slice::from_ref(&o)),
                Event::Deleted(o) => to_events(EventKind::Deleted, std::slice::from_ref(&o)),
                Event::Restarted(list) => {
                    debug!(kind = %kind, count = list.len(), "watch restarted; replaying list");
                    to_events(EventKind::Updated, &list)
                }
            };
            for ev in mapped {
                if events.send(ev).await.is_err() {
                    // Receiver gone: the controller is shutting down.
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

fn to_events(kind: EventKind, objects: &[DynamicObject]) -> Vec<WatchEvent> {
    objects
        .iter()
        .filter_map(|o| match ref_from(o) {
            Some(object) => Some(WatchEvent { kind, object }),
            None => {
                // Objects without a name cannot be keyed.
                warn!("dropping watch event for unnamed object");
                None
            }
        })
        .collect()
}

#[async_trait::async_trait]
impl Lister for KubeHub {
    async fn list(&self, kind: &ResourceKind) -> Result<Vec<ObjectRef>> {
        let api = self.api_for(kind).await?;
        let objects = api.list(&ListParams::default()).await?;
        Ok(objects.items.iter().filter_map(ref_from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_key_parses_core_and_grouped_kinds() {
        let core = parse_gvk_key("v1/ConfigMap").expect("core kind");
        assert_eq!((core.group.as_str(), core.version.as_str(), core.kind.as_str()), ("", "v1", "ConfigMap"));

        let grouped = parse_gvk_key("agones.dev/v1/Fleet").expect("grouped kind");
        assert_eq!(
            (grouped.group.as_str(), grouped.version.as_str(), grouped.kind.as_str()),
            ("agones.dev", "v1", "Fleet")
        );

        assert!(parse_gvk_key("Fleet").is_err());
        assert!(parse_gvk_key("a/b/c/d").is_err());
    }

    #[test]
    fn object_refs_require_a_name() {
        let ar = ApiResource::from_gvk(&GroupVersionKind {
            group: "agones.dev".into(),
            version: "v1".into(),
            kind: "Fleet".into(),
        });
        let obj = DynamicObject::new("lobby", &ar).within("game");
        let r = ref_from(&obj).expect("named object");
        assert_eq!(r.name, "lobby");
        assert_eq!(r.namespace.as_deref(), Some("game"));

        let mut anon = DynamicObject::new("x", &ar);
        anon.metadata.name = None;
        assert!(ref_from(&anon).is_none());
    }
}
