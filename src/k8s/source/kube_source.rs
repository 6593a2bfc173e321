use super::{ListPage, Object, ResourceSource, SourceBinder, SourceEvent, WatchScope, WatchStream, plural_of};
use crate::error::{Error, Result};
use crate::k8s::cache::config::WATCH_TIMEOUT_SECONDS;
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, WatchEvent, WatchParams};
use kube::{Client, Resource};
use std::sync::Arc;
use tracing::debug;

type ApiFor<K> = fn(Client, Option<&str>) -> Api<K>;

/// Builds [`KubeSource`]s for one kind from a shared `kube::Client`
pub struct KubeBinder<K> {
    api_for: ApiFor<K>,
}

impl<K: Object> KubeBinder<K> {
    /// For namespaced kinds: scoped scopes watch one namespace, others watch all
    #[must_use]
    pub fn namespaced() -> Self
    where
        K: Resource<Scope = NamespaceResourceScope>,
    {
        Self {
            api_for: |client, namespace| match namespace {
                Some(ns) => Api::namespaced(client, ns),
                None => Api::all(client),
            },
        }
    }

    /// For cluster-scoped kinds such as `Namespace` or `Node`
    #[must_use]
    pub fn cluster() -> Self {
        Self {
            api_for: |client, _| Api::all(client),
        }
    }
}

impl<K: Object> SourceBinder<Client, K> for KubeBinder<K> {
    fn bind(&self, client: &Client, scope: &WatchScope) -> Arc<dyn ResourceSource<K>> {
        Arc::new(KubeSource {
            client: client.clone(),
            scope: scope.clone(),
            api_for: self.api_for,
        })
    }
}

/// List-watch source backed by the Kubernetes API server
pub struct KubeSource<K> {
    client: Client,
    scope: WatchScope,
    api_for: ApiFor<K>,
}

impl<K: Object> KubeSource<K> {
    fn api(&self, namespace: Option<&str>) -> Api<K> {
        (self.api_for)(self.client.clone(), namespace)
    }

    fn list_params(&self) -> ListParams {
        let lp = ListParams::default();
        match &self.scope.field_selector {
            Some(selector) => lp.fields(selector),
            None => lp,
        }
    }

    fn watch_params(&self) -> WatchParams {
        let wp = WatchParams::default().timeout(WATCH_TIMEOUT_SECONDS);
        match &self.scope.field_selector {
            Some(selector) => wp.fields(selector),
            None => wp,
        }
    }
}

fn convert<K: Object>(event: WatchEvent<K>) -> Result<SourceEvent<K>> {
    match event {
        WatchEvent::Added(obj) | WatchEvent::Modified(obj) => Ok(SourceEvent::Applied(obj)),
        WatchEvent::Deleted(obj) => Ok(SourceEvent::Deleted(obj)),
        WatchEvent::Bookmark(bookmark) => Ok(SourceEvent::Bookmark(
            bookmark.metadata.resource_version,
        )),
        WatchEvent::Error(resp) if resp.code == 410 => Ok(SourceEvent::Expired),
        WatchEvent::Error(resp) => Err(Error::from_kube(
            kube::Error::Api(resp),
            "watch",
            &plural_of::<K>(),
        )),
    }
}

#[async_trait]
impl<K: Object> ResourceSource<K> for KubeSource<K> {
    async fn list(&self) -> Result<ListPage<K>> {
        let api = self.api(self.scope.namespace.as_deref());
        let list = api
            .list(&self.list_params())
            .await
            .map_err(|e| Error::from_kube(e, "list", &plural_of::<K>()))?;

        debug!("📋 Listed {} {}", list.items.len(), plural_of::<K>());
        Ok(ListPage {
            resource_version: list.metadata.resource_version.unwrap_or_default(),
            items: list.items,
        })
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream<K>> {
        let api = self.api(self.scope.namespace.as_deref());
        let stream = api
            .watch(&self.watch_params(), resource_version)
            .await
            .map_err(|e| Error::from_kube(e, "watch", &plural_of::<K>()))?;

        Ok(stream
            .map(|item| match item {
                Ok(event) => convert(event),
                Err(e) => Err(Error::from_kube(e, "watch", &plural_of::<K>())),
            })
            .boxed())
    }

    async fn get(&self, name: &str, namespace: Option<&str>) -> Result<K> {
        self.api(namespace)
            .get(name)
            .await
            .map_err(|e| match Error::from_kube(e, "get", &plural_of::<K>()) {
                Error::NotFound { resource, .. } => Error::NotFound {
                    resource,
                    name: name.to_string(),
                },
                other => other,
            })
    }

    async fn delete(&self, name: &str, namespace: Option<&str>) -> Result<()> {
        self.api(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| Error::from_kube(e, "delete", &plural_of::<K>()))?;
        Ok(())
    }
}
