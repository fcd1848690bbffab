use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    config::DeletionPoll,
    crds::controlplane::ControlPlane,
    error::ReconcileError,
    gateway::KubernetesGateway,
    lifecycle::LifecycleState,
    manifest,
};

/// What a convergence step did to the workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadOutcome {
    Created,
    /// Stale objects were deleted, confirmed gone, and created again
    Recreated,
    ServiceRestored,
    Unchanged,
    /// Scaled to zero, pods may still be running
    Draining,
    Drained,
}

fn is_drained(dep: &Deployment) -> bool {
    let desired = dep.spec.as_ref().and_then(|s| s.replicas);
    let running = dep.status.as_ref().and_then(|s| s.replicas).unwrap_or(0);
    desired == Some(0) && running == 0
}

pub struct WorkloadReconciler<'a> {
    gateway: &'a dyn KubernetesGateway,
    namespace: &'a str,
    owner: &'a OwnerReference,
    poll: DeletionPoll,
    cancel: &'a CancellationToken,
}

impl<'a> WorkloadReconciler<'a> {
    pub fn new(
        gateway: &'a dyn KubernetesGateway,
        namespace: &'a str,
        owner: &'a OwnerReference,
        poll: DeletionPoll,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            gateway,
            namespace,
            owner,
            poll,
            cancel,
        }
    }

    /// `dirty` must be true when any certificate or kubeconfig was re-issued
    /// earlier in the pass.
    pub async fn converge(
        &self,
        cp: &ControlPlane,
        dirty: bool,
        state: LifecycleState,
    ) -> Result<WorkloadOutcome, ReconcileError> {
        let name = cp.name_any();
        let name = name.as_str();
        match state {
            LifecycleState::WantDown => return self.drain(name).await,
            LifecycleState::GoingDown => return Ok(WorkloadOutcome::Unchanged),
            LifecycleState::Up => {}
        }

        let credentials = self.credentials_hash().await?;
        let Some(live) = self.gateway.get_deployment(self.namespace, name).await? else {
            self.create(cp, name, &credentials).await?;
            return Ok(WorkloadOutcome::Created);
        };

        let drifted = !cp.is_converged();
        let stale_credentials =
            manifest::template_credentials_hash(&live) != Some(credentials.as_str());
        if dirty || drifted || stale_credentials {
            info!(workload = name, dirty, drifted, stale_credentials, "recreate workload");
            self.delete(name).await?;
            self.wait_for_absence(name).await?;
            self.create(cp, name, &credentials).await?;
            return Ok(WorkloadOutcome::Recreated);
        }

        let svc = manifest::service_name(name);
        if self.gateway.get_service(self.namespace, &svc).await?.is_none() {
            info!(service = %svc, "create missing service");
            let service = manifest::build_service(name, self.namespace, cp.spec.port, self.owner);
            self.gateway.create_service(self.namespace, &service).await?;
            return Ok(WorkloadOutcome::ServiceRestored);
        }

        debug!(workload = name, "workload up to date");
        Ok(WorkloadOutcome::Unchanged)
    }

    async fn drain(&self, name: &str) -> Result<WorkloadOutcome, ReconcileError> {
        let Some(dep) = self.gateway.get_deployment(self.namespace, name).await? else {
            debug!(workload = name, "nothing to drain");
            return Ok(WorkloadOutcome::Drained);
        };
        if is_drained(&dep) {
            debug!(workload = name, "workload drained");
            return Ok(WorkloadOutcome::Drained);
        }
        if dep.spec.as_ref().and_then(|s| s.replicas) != Some(0) {
            info!(workload = name, "scale replicas down to 0");
            self.gateway.scale_deployment(self.namespace, name, 0).await?;
        }
        Ok(WorkloadOutcome::Draining)
    }

    async fn credentials_hash(&self) -> Result<String, ReconcileError> {
        let mut secrets = Vec::new();
        for secret in manifest::mounted_secrets() {
            secrets.push((secret, self.gateway.get_secret(self.namespace, secret).await?));
        }
        Ok(manifest::credentials_hash(
            secrets.iter().map(|(name, data)| (*name, data.as_ref())),
        ))
    }

    async fn create(
        &self,
        cp: &ControlPlane,
        name: &str,
        credentials: &str,
    ) -> Result<(), ReconcileError> {
        let svc = manifest::service_name(name);
        if self.gateway.get_service(self.namespace, &svc).await?.is_none() {
            info!(service = %svc, "create service");
            let service = manifest::build_service(name, self.namespace, cp.spec.port, self.owner);
            self.gateway.create_service(self.namespace, &service).await?;
        }
        info!(workload = name, "create deployment");
        let deployment = manifest::build_deployment(
            name,
            self.namespace,
            &cp.spec,
            self.owner,
            credentials,
        );
        self.gateway
            .create_deployment(self.namespace, &deployment)
            .await
    }

    async fn delete(&self, name: &str) -> Result<(), ReconcileError> {
        self.gateway.delete_deployment(self.namespace, name).await?;
        self.gateway
            .delete_service(self.namespace, &manifest::service_name(name))
            .await
    }

    pub async fn wait_for_absence(&self, name: &str) -> Result<(), ReconcileError> {
        let svc = manifest::service_name(name);
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let kind = if self.gateway.get_deployment(self.namespace, name).await?.is_some() {
                "Deployment"
            } else if self.gateway.get_service(self.namespace, &svc).await?.is_some() {
                "Service"
            } else {
                debug!(workload = name, attempts, "workload deletion confirmed");
                return Ok(());
            };
            if attempts >= self.poll.attempts {
                return Err(ReconcileError::DeletionTimeout {
                    kind,
                    name: name.to_string(),
                    attempts,
                });
            }
            debug!(workload = name, kind, attempts, "waiting for deletion");
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(ReconcileError::Cancelled(name.to_string()));
                }
                _ = tokio::time::sleep(self.poll.interval) => {}
            }
        }
    }
}
