use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    Api, Client,
    api::{DeleteParams, Patch, PatchParams, PostParams},
};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::{
    crds::controlplane::{ControlPlane, ControlPlaneStatus},
    error::ReconcileError,
};

/// Field name to raw bytes, as stored in a Secret's `data`.
pub type SecretData = BTreeMap<String, Vec<u8>>;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubernetesGateway: Send + Sync {
    async fn get_secret(&self, ns: &str, name: &str) -> Result<Option<SecretData>, ReconcileError>;

    /// Create a secret owned by `owner`. Fails if it already exists.
    async fn create_secret(
        &self,
        ns: &str,
        name: &str,
        data: SecretData,
        owner: &OwnerReference,
    ) -> Result<(), ReconcileError>;

    async fn delete_secret(&self, ns: &str, name: &str) -> Result<(), ReconcileError>;

    async fn get_deployment(&self, ns: &str, name: &str)
    -> Result<Option<Deployment>, ReconcileError>;

    async fn create_deployment(&self, ns: &str, deployment: &Deployment)
    -> Result<(), ReconcileError>;

    async fn scale_deployment(&self, ns: &str, name: &str, replicas: i32)
    -> Result<(), ReconcileError>;

    async fn delete_deployment(&self, ns: &str, name: &str) -> Result<(), ReconcileError>;

    async fn get_service(&self, ns: &str, name: &str) -> Result<Option<Service>, ReconcileError>;

    async fn create_service(&self, ns: &str, service: &Service) -> Result<(), ReconcileError>;

    async fn delete_service(&self, ns: &str, name: &str) -> Result<(), ReconcileError>;

    async fn set_finalizers(
        &self,
        ns: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), ReconcileError>;

    async fn patch_status(
        &self,
        ns: &str,
        name: &str,
        status: &ControlPlaneStatus,
    ) -> Result<(), ReconcileError>;
}

#[derive(Clone)]
pub struct KubeGateway {
    client: Client,
    field_manager: String,
}

impl KubeGateway {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }
}

fn ignore_not_found(res: Result<(), kube::Error>) -> Result<(), ReconcileError> {
    match res {
        Ok(()) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl KubernetesGateway for KubeGateway {
    async fn get_secret(&self, ns: &str, name: &str) -> Result<Option<SecretData>, ReconcileError> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), ns);
        Ok(secrets.get_opt(name).await?.map(|sec| {
            sec.data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, v.0))
                .collect()
        }))
    }

    async fn create_secret(
        &self,
        ns: &str,
        name: &str,
        data: SecretData,
        owner: &OwnerReference,
    ) -> Result<(), ReconcileError> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), ns);
        let sec = Secret {
            metadata: kube::core::ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                owner_references: Some(vec![owner.clone()]),
                ..Default::default()
            },
            data: Some(
                data.into_iter()
                    .map(|(k, v)| (k, ByteString(v)))
                    .collect(),
            ),
            ..Default::default()
        };
        secrets.create(&PostParams::default(), &sec).await?;
        debug!(secret = name, "secret created");
        Ok(())
    }

    async fn delete_secret(&self, ns: &str, name: &str) -> Result<(), ReconcileError> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), ns);
        ignore_not_found(
            secrets
                .delete(name, &DeleteParams::default())
                .await
                .map(|_| ()),
        )
    }

    async fn get_deployment(
        &self,
        ns: &str,
        name: &str,
    ) -> Result<Option<Deployment>, ReconcileError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), ns);
        Ok(api.get_opt(name).await?)
    }

    async fn create_deployment(
        &self,
        ns: &str,
        deployment: &Deployment,
    ) -> Result<(), ReconcileError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), ns);
        api.create(&PostParams::default(), deployment).await?;
        Ok(())
    }

    async fn scale_deployment(
        &self,
        ns: &str,
        name: &str,
        replicas: i32,
    ) -> Result<(), ReconcileError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), ns);
        let pp = PatchParams::apply(&self.field_manager);
        let patch = serde_json::json!({"spec": {"replicas": replicas}});
        let _ = api.patch(name, &pp, &Patch::Merge(&patch)).await?;
        Ok(())
    }

    async fn delete_deployment(&self, ns: &str, name: &str) -> Result<(), ReconcileError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), ns);
        // foreground: the object stays until its pods are gone
        ignore_not_found(
            api.delete(name, &DeleteParams::foreground())
                .await
                .map(|_| ()),
        )
    }

    async fn get_service(&self, ns: &str, name: &str) -> Result<Option<Service>, ReconcileError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), ns);
        Ok(api.get_opt(name).await?)
    }

    async fn create_service(&self, ns: &str, service: &Service) -> Result<(), ReconcileError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), ns);
        api.create(&PostParams::default(), service).await?;
        Ok(())
    }

    async fn delete_service(&self, ns: &str, name: &str) -> Result<(), ReconcileError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), ns);
        ignore_not_found(
            api.delete(name, &DeleteParams::default())
                .await
                .map(|_| ()),
        )
    }

    async fn set_finalizers(
        &self,
        ns: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), ReconcileError> {
        let api: Api<ControlPlane> = Api::namespaced(self.client.clone(), ns);
        let pp = PatchParams::default();
        let patch = serde_json::json!({"metadata": {"finalizers": finalizers}});
        let _ = api.patch(name, &pp, &Patch::Merge(&patch)).await?;
        Ok(())
    }

    async fn patch_status(
        &self,
        ns: &str,
        name: &str,
        status: &ControlPlaneStatus,
    ) -> Result<(), ReconcileError> {
        let api: Api<ControlPlane> = Api::namespaced(self.client.clone(), ns);
        let pp = PatchParams::apply(&self.field_manager);
        let _ = api
            .patch_status(
                name,
                &pp,
                &Patch::Merge(serde_json::json!({ "status": status })),
            )
            .await?;
        Ok(())
    }
}
