use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::{NamespaceResourceScope, api::core::v1::Pod};
use kube::{
    Api, Client, Resource,
    api::{DeleteParams, ListParams, Patch, PatchParams},
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::json;

#[cfg(test)]
use mockall::automock;

use crate::{
    Error, Result,
    api::{SpireAgent, SpireServer, SpireServerStatus},
    plan::{Payload, ResourceDescriptor},
};

const MANAGER_NAME: &str = "spire-operator";

/// Every cluster round trip the reconcilers and health monitors make.
///
/// Each call is a single request; failures are returned, never retried here.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_server(&self, namespace: &str, name: &str) -> Result<Option<SpireServer>>;

    async fn get_agent(&self, namespace: &str, name: &str) -> Result<Option<SpireAgent>>;

    async fn list_servers(&self, namespace: &str) -> Result<Vec<SpireServer>>;

    /// Succeeds if the object is already gone.
    async fn delete_server(&self, namespace: &str, name: &str) -> Result<()>;

    /// Succeeds if the object is already gone.
    async fn delete_agent(&self, namespace: &str, name: &str) -> Result<()>;

    /// Creates the object, or leaves an identical one from an earlier pass in place.
    async fn apply(&self, descriptor: &ResourceDescriptor) -> Result<()>;

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;

    async fn patch_server_status(
        &self,
        namespace: &str,
        name: &str,
        status: &SpireServerStatus,
    ) -> Result<()>;
}

/// [`ClusterClient`] backed by the Kubernetes API server.
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, namespace: Option<&str>) -> Result<Api<K>>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        let namespace = namespace.ok_or(Error::MissingField)?;
        Ok(Api::namespaced(self.client.clone(), namespace))
    }
}

async fn server_side_apply<K>(api: Api<K>, name: &str, object: &K) -> Result<()>
where
    K: Clone + DeserializeOwned + Serialize + Debug,
{
    api.patch(name, &PatchParams::apply(MANAGER_NAME), &Patch::Apply(object))
        .await?;
    Ok(())
}

async fn delete_if_present<K>(api: Api<K>, name: &str) -> Result<()>
where
    K: Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_server(&self, namespace: &str, name: &str) -> Result<Option<SpireServer>> {
        let servers = Api::<SpireServer>::namespaced(self.client.clone(), namespace);
        Ok(servers.get_opt(name).await?)
    }

    async fn get_agent(&self, namespace: &str, name: &str) -> Result<Option<SpireAgent>> {
        let agents = Api::<SpireAgent>::namespaced(self.client.clone(), namespace);
        Ok(agents.get_opt(name).await?)
    }

    async fn list_servers(&self, namespace: &str) -> Result<Vec<SpireServer>> {
        let servers = Api::<SpireServer>::namespaced(self.client.clone(), namespace);
        Ok(servers.list(&ListParams::default()).await?.items)
    }

    async fn delete_server(&self, namespace: &str, name: &str) -> Result<()> {
        delete_if_present(
            Api::<SpireServer>::namespaced(self.client.clone(), namespace),
            name,
        )
        .await
    }

    async fn delete_agent(&self, namespace: &str, name: &str) -> Result<()> {
        delete_if_present(
            Api::<SpireAgent>::namespaced(self.client.clone(), namespace),
            name,
        )
        .await
    }

    async fn apply(&self, descriptor: &ResourceDescriptor) -> Result<()> {
        let name = descriptor.name.as_str();
        let namespace = descriptor.namespace.as_deref();

        match &descriptor.payload {
            Payload::ServiceAccount(sa) => {
                server_side_apply(self.namespaced(namespace)?, name, sa).await
            }
            Payload::Role(role) => server_side_apply(self.namespaced(namespace)?, name, role).await,
            Payload::RoleBinding(binding) => {
                server_side_apply(self.namespaced(namespace)?, name, binding).await
            }
            Payload::ConfigMap(cm) => server_side_apply(self.namespaced(namespace)?, name, cm).await,
            Payload::StatefulSet(sts) => {
                server_side_apply(self.namespaced(namespace)?, name, sts).await
            }
            Payload::DaemonSet(ds) => server_side_apply(self.namespaced(namespace)?, name, ds).await,
            Payload::Service(svc) => server_side_apply(self.namespaced(namespace)?, name, svc).await,
            Payload::ClusterRole(role) => {
                server_side_apply(Api::all(self.client.clone()), name, role).await
            }
            Payload::ClusterRoleBinding(binding) => {
                server_side_apply(Api::all(self.client.clone()), name, binding).await
            }
        }
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let pods = Api::<Pod>::namespaced(self.client.clone(), namespace);
        Ok(pods
            .list(&ListParams::default().labels(label_selector))
            .await?
            .items)
    }

    async fn patch_server_status(
        &self,
        namespace: &str,
        name: &str,
        status: &SpireServerStatus,
    ) -> Result<()> {
        let servers = Api::<SpireServer>::namespaced(self.client.clone(), namespace);
        servers
            .patch_status(
                name,
                &PatchParams::default(),
                &Patch::Merge(json!({ "status": status })),
            )
            .await?;
        Ok(())
    }
}
