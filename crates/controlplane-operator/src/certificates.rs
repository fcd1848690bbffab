use std::collections::HashSet;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use tracing::{debug, info};

use crate::{
    error::ReconcileError,
    gateway::{KubernetesGateway, SecretData},
    pki::{self, Certificate, CertificatePurpose, IssueParams},
};

/// What one hierarchy pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CertificateOutcome {
    pub root_changed: bool,
    pub any_changed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateState {
    Absent,
    Valid(Certificate),
    Stale,
}

fn field(name: &str, suffix: &str) -> String {
    format!("{name}.{suffix}")
}

/// Lay a certificate out as `<name>.key`, `<name>.crt`, `<name>.pub`.
pub fn to_secret_data(name: &str, cert: &Certificate) -> SecretData {
    SecretData::from([
        (field(name, "key"), cert.key_pem.clone().into_bytes()),
        (field(name, "crt"), cert.cert_pem.clone().into_bytes()),
        (field(name, "pub"), cert.pub_pem.clone().into_bytes()),
    ])
}

/// Read a certificate back; `None` if any field is missing or not UTF-8.
pub fn from_secret_data(name: &str, data: &SecretData) -> Option<Certificate> {
    let text = |suffix: &str| {
        data.get(&field(name, suffix))
            .and_then(|bytes| String::from_utf8(bytes.clone()).ok())
    };
    Some(Certificate {
        key_pem: text("key")?,
        cert_pem: text("crt")?,
        pub_pem: text("pub")?,
    })
}

/// Maps named certificates onto secrets in one namespace.
pub struct CertificateStore<'a> {
    gateway: &'a dyn KubernetesGateway,
    namespace: &'a str,
    owner: &'a OwnerReference,
}

impl<'a> CertificateStore<'a> {
    pub fn new(
        gateway: &'a dyn KubernetesGateway,
        namespace: &'a str,
        owner: &'a OwnerReference,
    ) -> Self {
        Self {
            gateway,
            namespace,
            owner,
        }
    }

    pub async fn get(&self, name: &str) -> Result<Option<Certificate>, ReconcileError> {
        Ok(self
            .gateway
            .get_secret(self.namespace, name)
            .await?
            .and_then(|data| from_secret_data(name, &data)))
    }

    /// Fetch a CA that must already be stored.
    pub async fn require(&self, purpose: CertificatePurpose) -> Result<Certificate, ReconcileError> {
        self.get(purpose.name())
            .await?
            .ok_or(ReconcileError::MissingIssuer(purpose.name()))
    }

    pub async fn create(&self, name: &str, cert: &Certificate) -> Result<(), ReconcileError> {
        self.gateway
            .create_secret(self.namespace, name, to_secret_data(name, cert), self.owner)
            .await
    }

    pub async fn delete(&self, name: &str) -> Result<(), ReconcileError> {
        self.gateway.delete_secret(self.namespace, name).await
    }

    /// Whether a stored certificate may be reused.
    pub fn is_valid(&self, cert: &Certificate, issuer: Option<&Certificate>) -> bool {
        pki::is_consistent(cert, issuer)
    }

    pub async fn load(
        &self,
        purpose: CertificatePurpose,
        issuer: Option<&Certificate>,
    ) -> Result<CertificateState, ReconcileError> {
        let name = purpose.name();
        let Some(data) = self.gateway.get_secret(self.namespace, name).await? else {
            return Ok(CertificateState::Absent);
        };
        Ok(match from_secret_data(name, &data) {
            Some(cert) if self.is_valid(&cert, issuer) => CertificateState::Valid(cert),
            _ => CertificateState::Stale,
        })
    }
}

/// Guarantees every stored certificate exists and chains to the current CA.
pub struct CertificateHierarchy<'a> {
    store: CertificateStore<'a>,
    params: IssueParams,
}

impl<'a> CertificateHierarchy<'a> {
    pub fn new(store: CertificateStore<'a>, params: IssueParams) -> Self {
        Self { store, params }
    }

    /// CAs first; a leaf is re-issued whenever its CA changed in this call.
    pub async fn reconcile(
        &self,
        force_root_renewal: bool,
    ) -> Result<CertificateOutcome, ReconcileError> {
        let mut renewed: HashSet<CertificatePurpose> = HashSet::new();
        for purpose in CertificatePurpose::STORED {
            let force = if purpose.is_ca() {
                force_root_renewal
            } else {
                purpose.issuer().is_some_and(|ca| renewed.contains(&ca))
            };
            if self.ensure(purpose, force).await? {
                renewed.insert(purpose);
            }
        }
        Ok(CertificateOutcome {
            root_changed: renewed.contains(&CertificatePurpose::RootCa),
            any_changed: !renewed.is_empty(),
        })
    }

    /// Returns true when a new certificate was written.
    async fn ensure(
        &self,
        purpose: CertificatePurpose,
        force: bool,
    ) -> Result<bool, ReconcileError> {
        let issuer = match purpose.issuer() {
            Some(ca) => Some(self.store.require(ca).await?),
            None => None,
        };

        let present = match self.store.load(purpose, issuer.as_ref()).await? {
            CertificateState::Valid(_) if !force => {
                debug!(certificate = %purpose, "certificate valid");
                return Ok(false);
            }
            CertificateState::Valid(_) => {
                info!(certificate = %purpose, "issuer changed, renewing certificate");
                true
            }
            CertificateState::Stale => {
                info!(certificate = %purpose, "stored certificate is stale");
                true
            }
            CertificateState::Absent => false,
        };

        // issue before touching the store so a failure leaves the old record
        let cert = pki::issue(purpose, issuer.as_ref(), &self.params)?;
        if present {
            info!(certificate = %purpose, "delete old secret");
            self.store.delete(purpose.name()).await?;
        }
        info!(certificate = %purpose, "create certificate");
        self.store.create(purpose.name(), &cert).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockKubernetesGateway;

    fn owner() -> OwnerReference {
        OwnerReference {
            api_version: "controlplane.operator.dev/v1alpha1".into(),
            kind: "ControlPlane".into(),
            name: "acme".into(),
            uid: "uid".into(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    fn params() -> IssueParams {
        IssueParams {
            advertise_host: "acme.example.com".into(),
            advertise_address: "203.0.113.10".into(),
        }
    }

    #[test]
    fn secret_layout_uses_name_prefixed_fields() {
        let cert = Certificate {
            key_pem: "k".into(),
            cert_pem: "c".into(),
            pub_pem: "p".into(),
        };
        let data = to_secret_data("front-proxy-ca", &cert);
        let keys: Vec<_> = data.keys().cloned().collect();
        assert_eq!(
            keys,
            vec!["front-proxy-ca.crt", "front-proxy-ca.key", "front-proxy-ca.pub"]
        );
        assert_eq!(from_secret_data("front-proxy-ca", &data), Some(cert));
    }

    #[test]
    fn missing_field_reads_as_none() {
        let mut data = to_secret_data(
            "sa",
            &Certificate {
                key_pem: "k".into(),
                cert_pem: "c".into(),
                pub_pem: "p".into(),
            },
        );
        data.remove("sa.pub");
        assert_eq!(from_secret_data("sa", &data), None);
    }

    #[tokio::test]
    async fn incomplete_record_is_stale() {
        let mut gw = MockKubernetesGateway::new();
        gw.expect_get_secret()
            .returning(|_, _| Ok(Some(SecretData::from([("ca.key".to_string(), b"k".to_vec())]))));
        let owner = owner();
        let store = CertificateStore::new(&gw, "tenant", &owner);
        let state = store.load(CertificatePurpose::RootCa, None).await.unwrap();
        assert_eq!(state, CertificateState::Stale);
    }

    #[tokio::test]
    async fn leaf_without_stored_issuer_fails_before_writing() {
        let mut gw = MockKubernetesGateway::new();
        gw.expect_get_secret().returning(|_, _| Ok(None));
        gw.expect_create_secret().never();
        let owner = owner();
        let hierarchy = CertificateHierarchy::new(CertificateStore::new(&gw, "tenant", &owner), params());
        let err = hierarchy
            .ensure(CertificatePurpose::ApiServer, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::MissingIssuer("ca")));
    }

    #[tokio::test]
    async fn store_failure_aborts_without_create() {
        let mut gw = MockKubernetesGateway::new();
        gw.expect_get_secret()
            .returning(|_, _| Err(ReconcileError::Anyhow(anyhow::anyhow!("api unavailable"))));
        gw.expect_create_secret().never();
        let owner = owner();
        let hierarchy = CertificateHierarchy::new(CertificateStore::new(&gw, "tenant", &owner), params());
        assert!(hierarchy.reconcile(false).await.is_err());
    }
}
