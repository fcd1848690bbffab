use thiserror::Error;

use crate::pki::PkiError;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
    #[error(transparent)]
    Kube(#[from] kube::Error),
    #[error(transparent)]
    Pki(#[from] PkiError),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid spec: {0}")]
    InvalidSpec(String),
    #[error("issuer {0} is not stored")]
    MissingIssuer(&'static str),
    #[error("{kind} {name} still present after {attempts} deletion checks")]
    DeletionTimeout {
        kind: &'static str,
        name: String,
        attempts: u32,
    },
    #[error("waiting for deletion of {0} was cancelled")]
    Cancelled(String),
    #[error("control plane {0} has no namespace")]
    MissingNamespace(String),
}
