use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    Api, Client, ResourceExt,
    runtime::controller::{Action, Controller},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::{
    certificates::{CertificateHierarchy, CertificateOutcome, CertificateStore},
    config::OperatorConfig,
    crds::controlplane::{ControlPlane, ControlPlaneStatus},
    error::ReconcileError,
    gateway::KubernetesGateway,
    kubeconfig::KubeconfigReconciler,
    lifecycle::{self, LifecycleState},
    pki::IssueParams,
    workload::{WorkloadOutcome, WorkloadReconciler},
};

#[derive(Clone)]
pub struct Ctx {
    pub gateway: Arc<dyn KubernetesGateway>,
    pub config: OperatorConfig,
    /// Aborts in-flight deletion waits on shutdown
    pub cancel: CancellationToken,
}

pub fn controller(client: Client) -> Controller<ControlPlane> {
    let api: Api<ControlPlane> = Api::all(client.clone());
    Controller::new(api, Default::default())
        .owns(Api::<Secret>::all(client.clone()), Default::default())
        .owns(Api::<Deployment>::all(client.clone()), Default::default())
        .owns(Api::<Service>::all(client), Default::default())
        .shutdown_on_signal()
}

/// Everything one reconcile pass decided and wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub state: LifecycleState,
    pub certificates: CertificateOutcome,
    pub kubeconfigs_changed: bool,
    /// `None` when the workload was not examined
    pub workload: Option<WorkloadOutcome>,
    pub finalizer_released: bool,
    pub status_committed: bool,
}

impl PassReport {
    fn new(state: LifecycleState) -> Self {
        Self {
            state,
            certificates: CertificateOutcome::default(),
            kubeconfigs_changed: false,
            workload: None,
            finalizer_released: false,
            status_committed: false,
        }
    }

    pub fn dirty(&self) -> bool {
        self.certificates.any_changed || self.kubeconfigs_changed
    }

    pub fn action(&self, config: &OperatorConfig) -> Action {
        if self.state == LifecycleState::GoingDown || self.finalizer_released {
            return Action::await_change();
        }
        match self.workload {
            Some(WorkloadOutcome::Draining) => Action::requeue(config.drain_requeue),
            _ => Action::requeue(config.resync_interval),
        }
    }
}

#[instrument(skip(cp, ctx), fields(namespace = %cp.namespace().unwrap_or_default(), name = %cp.name_any()))]
pub async fn reconcile(cp: Arc<ControlPlane>, ctx: Arc<Ctx>) -> Result<Action, ReconcileError> {
    let report = run_pass(ctx.gateway.as_ref(), &ctx.config, &ctx.cancel, &cp).await?;
    info!(
        state = %report.state,
        root_changed = report.certificates.root_changed,
        dirty = report.dirty(),
        workload = ?report.workload,
        "reconcile pass complete"
    );
    Ok(report.action(&ctx.config))
}

/// One full pass: lifecycle gate, certificates and kubeconfigs (UP only),
/// workload, then finalizer release or status commit.
pub async fn run_pass(
    gateway: &dyn KubernetesGateway,
    config: &OperatorConfig,
    cancel: &CancellationToken,
    cp: &ControlPlane,
) -> Result<PassReport, ReconcileError> {
    let name = cp.name_any();
    let ns = cp
        .namespace()
        .ok_or_else(|| ReconcileError::MissingNamespace(name.clone()))?;

    let state = lifecycle::evaluate(gateway, &ns, cp).await?;
    let mut report = PassReport::new(state);
    if state == LifecycleState::GoingDown {
        debug!("finalizer already released, nothing to do");
        return Ok(report);
    }

    let owner = owner_ref(cp);
    if state == LifecycleState::Up {
        cp.spec.validate()?;
        let params = IssueParams {
            advertise_host: cp.spec.advertise_host.clone(),
            advertise_address: cp.spec.advertise_address.clone(),
        };
        let store = CertificateStore::new(gateway, &ns, &owner);
        report.certificates = CertificateHierarchy::new(store, params.clone())
            .reconcile(false)
            .await?;
        report.kubeconfigs_changed =
            KubeconfigReconciler::new(gateway, &ns, &owner, params, cp.spec.port)
                .reconcile_all(report.certificates.root_changed)
                .await?;
    }

    let outcome = WorkloadReconciler::new(gateway, &ns, &owner, config.deletion_poll, cancel)
        .converge(cp, report.dirty(), state)
        .await?;
    report.workload = Some(outcome);

    match state {
        LifecycleState::WantDown if outcome == WorkloadOutcome::Drained => {
            lifecycle::release(gateway, &ns, cp).await?;
            report.finalizer_released = true;
        }
        LifecycleState::Up if !cp.is_converged() => {
            info!("commit target spec");
            let status = ControlPlaneStatus {
                target_spec: Some(cp.spec.clone()),
            };
            gateway.patch_status(&ns, &name, &status).await?;
            report.status_committed = true;
        }
        _ => {}
    }
    Ok(report)
}

pub fn error_policy(_cp: Arc<ControlPlane>, err: &ReconcileError, ctx: Arc<Ctx>) -> Action {
    error!(error = ?err, "reconcile failed");
    Action::requeue(ctx.config.error_requeue)
}

pub fn owner_ref(cp: &ControlPlane) -> OwnerReference {
    OwnerReference {
        api_version: "controlplane.operator.dev/v1alpha1".into(),
        kind: "ControlPlane".into(),
        name: cp.metadata.name.clone().unwrap_or_default(),
        uid: cp.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}
