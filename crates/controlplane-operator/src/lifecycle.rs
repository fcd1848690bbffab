use kube::ResourceExt;
use tracing::info;

use crate::{crds::controlplane::ControlPlane, error::ReconcileError, gateway::KubernetesGateway};

pub const FINALIZER: &str = "controlplane.operator.dev/finalizer";

/// Where a ControlPlane is in its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Not being deleted; full reconciliation applies
    Up,
    /// Deletion requested, our finalizer still holds the object
    WantDown,
    /// Deletion requested and our finalizer is gone; nothing left to do
    GoingDown,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Up => "UP",
            Self::WantDown => "WANTDOWN",
            Self::GoingDown => "GOINGDOWN",
        })
    }
}

pub fn has_finalizer(cp: &ControlPlane) -> bool {
    cp.finalizers().iter().any(|f| f == FINALIZER)
}

/// Classify without side effects.
pub fn observe(cp: &ControlPlane) -> LifecycleState {
    match (cp.metadata.deletion_timestamp.is_some(), has_finalizer(cp)) {
        (false, _) => LifecycleState::Up,
        (true, true) => LifecycleState::WantDown,
        (true, false) => LifecycleState::GoingDown,
    }
}

/// Classify and register our finalizer on live objects that lack it.
pub async fn evaluate(
    gateway: &dyn KubernetesGateway,
    ns: &str,
    cp: &ControlPlane,
) -> Result<LifecycleState, ReconcileError> {
    let state = observe(cp);
    if state == LifecycleState::Up && !has_finalizer(cp) {
        info!("add finalizer");
        let mut finals: Vec<String> = cp.finalizers().to_vec();
        finals.push(FINALIZER.to_string());
        gateway.set_finalizers(ns, &cp.name_any(), finals).await?;
    }
    Ok(state)
}

/// Drop our finalizer, keeping any others.
pub async fn release(
    gateway: &dyn KubernetesGateway,
    ns: &str,
    cp: &ControlPlane,
) -> Result<(), ReconcileError> {
    info!("remove finalizer");
    let finals: Vec<String> = cp
        .finalizers()
        .iter()
        .filter(|f| *f != FINALIZER)
        .cloned()
        .collect();
    gateway.set_finalizers(ns, &cp.name_any(), finals).await
}
