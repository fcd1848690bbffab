use std::collections::BTreeMap;

use base64::{Engine, engine::general_purpose::STANDARD};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    certificates::CertificateStore,
    error::ReconcileError,
    gateway::{KubernetesGateway, SecretData},
    pki::{self, CertificatePurpose, IssueParams},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KubeconfigKind {
    Admin,
    Scheduler,
    ControllerManager,
    NetworkProxyServer,
}

impl KubeconfigKind {
    pub const ALL: [KubeconfigKind; 4] = [
        KubeconfigKind::Admin,
        KubeconfigKind::Scheduler,
        KubeconfigKind::ControllerManager,
        KubeconfigKind::NetworkProxyServer,
    ];

    pub fn secret_name(self) -> &'static str {
        match self {
            Self::Admin => "kubeconfig-admin",
            Self::Scheduler => "kubeconfig-scheduler",
            Self::ControllerManager => "kubeconfig-controller",
            Self::NetworkProxyServer => "kubeconfig-konnectivity",
        }
    }

    /// Field key inside the secret, also the file name once mounted.
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Admin => "super-admin.conf",
            Self::Scheduler => "scheduler.conf",
            Self::ControllerManager => "controller-manager.conf",
            Self::NetworkProxyServer => "konnectivity-server.conf",
        }
    }

    pub fn username(self) -> &'static str {
        match self {
            Self::Admin => "kubernetes-admin",
            Self::Scheduler => "system:kube-scheduler",
            Self::ControllerManager => "system:kube-controller-manager",
            Self::NetworkProxyServer => "system:konnectivity-server",
        }
    }

    /// The admin config is named after the tenant namespace so operators
    /// can merge several tenants into one file.
    pub fn cluster_name(self, namespace: &str) -> String {
        match self {
            Self::Admin => namespace.to_string(),
            _ => "kubernetes".to_string(),
        }
    }

    pub fn purpose(self) -> CertificatePurpose {
        match self {
            Self::Admin => CertificatePurpose::AdminClient,
            Self::Scheduler => CertificatePurpose::SchedulerClient,
            Self::ControllerManager => CertificatePurpose::ControllerManagerClient,
            Self::NetworkProxyServer => CertificatePurpose::NetworkProxyClient,
        }
    }

    /// Mounted into the workload; the admin config is for operators only.
    pub fn mounted(self) -> bool {
        !matches!(self, Self::Admin)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kubeconfig {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub clusters: Vec<NamedCluster>,
    pub contexts: Vec<NamedContext>,
    #[serde(rename = "current-context")]
    pub current_context: String,
    pub preferences: BTreeMap<String, String>,
    pub users: Vec<NamedUser>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: Cluster,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    #[serde(rename = "certificate-authority-data")]
    pub certificate_authority_data: String,
    pub server: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: Context,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub cluster: String,
    pub user: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedUser {
    pub name: String,
    pub user: User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(rename = "client-certificate-data")]
    pub client_certificate_data: String,
    #[serde(rename = "client-key-data")]
    pub client_key_data: String,
}

impl Kubeconfig {
    /// Build a single-cluster, single-user config; PEM inputs are embedded
    /// base64-encoded.
    pub fn new(
        cluster_name: &str,
        server: &str,
        user: &str,
        ca_cert_pem: &str,
        client_cert_pem: &str,
        client_key_pem: &str,
    ) -> Self {
        let context_name = format!("{user}@{cluster_name}");
        Self {
            api_version: "v1".into(),
            kind: "Config".into(),
            clusters: vec![NamedCluster {
                name: cluster_name.to_string(),
                cluster: Cluster {
                    certificate_authority_data: STANDARD.encode(ca_cert_pem),
                    server: server.to_string(),
                },
            }],
            contexts: vec![NamedContext {
                name: context_name.clone(),
                context: Context {
                    cluster: cluster_name.to_string(),
                    user: user.to_string(),
                },
            }],
            current_context: context_name,
            preferences: BTreeMap::new(),
            users: vec![NamedUser {
                name: user.to_string(),
                user: User {
                    client_certificate_data: STANDARD.encode(client_cert_pem),
                    client_key_data: STANDARD.encode(client_key_pem),
                },
            }],
        }
    }

    pub fn to_yaml(&self) -> Result<Vec<u8>, ReconcileError> {
        Ok(serde_yaml::to_string(self)?.into_bytes())
    }

    pub fn from_yaml(doc: &[u8]) -> Result<Self, ReconcileError> {
        Ok(serde_yaml::from_slice(doc)?)
    }

    /// Whether this config still points at `server`, embeds `ca_cert_pem`
    /// and holds a client certificate signed by it.
    pub fn is_current(&self, ca_cert_pem: &str, server: &str) -> bool {
        let (Some(cluster), Some(user)) = (self.clusters.first(), self.users.first()) else {
            return false;
        };
        let decode = |data: &str| {
            STANDARD
                .decode(data)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        };
        let (Some(embedded_ca), Some(client_cert)) = (
            decode(&cluster.cluster.certificate_authority_data),
            decode(&user.user.client_certificate_data),
        ) else {
            return false;
        };
        cluster.cluster.server == server
            && embedded_ca == ca_cert_pem
            && pki::verify_issued_by(&client_cert, ca_cert_pem).unwrap_or(false)
    }
}

/// Keeps the bootstrap kubeconfig secrets in sync with the root CA.
pub struct KubeconfigReconciler<'a> {
    gateway: &'a dyn KubernetesGateway,
    namespace: &'a str,
    owner: &'a OwnerReference,
    params: IssueParams,
    server_port: u16,
}

impl<'a> KubeconfigReconciler<'a> {
    pub fn new(
        gateway: &'a dyn KubernetesGateway,
        namespace: &'a str,
        owner: &'a OwnerReference,
        params: IssueParams,
        server_port: u16,
    ) -> Self {
        Self {
            gateway,
            namespace,
            owner,
            params,
            server_port,
        }
    }

    fn server_url(&self) -> String {
        format!("https://{}:{}", self.params.advertise_host, self.server_port)
    }

    /// Reconcile every kubeconfig; `force_recreate` must be the root-CA
    /// change flag of the certificate pass that just completed.
    pub async fn reconcile_all(&self, force_recreate: bool) -> Result<bool, ReconcileError> {
        let mut changed = false;
        for kind in KubeconfigKind::ALL {
            let (_, kind_changed) = self.reconcile(kind, force_recreate).await?;
            changed |= kind_changed;
        }
        Ok(changed)
    }

    /// Return the stored document, regenerating it when forced, absent, or
    /// no longer trusted by the stored root CA.
    pub async fn reconcile(
        &self,
        kind: KubeconfigKind,
        force_recreate: bool,
    ) -> Result<(Vec<u8>, bool), ReconcileError> {
        let name = kind.secret_name();
        let store = CertificateStore::new(self.gateway, self.namespace, self.owner);
        let ca = store.require(CertificatePurpose::RootCa).await?;
        let server = self.server_url();

        if let Some(data) = self.gateway.get_secret(self.namespace, name).await? {
            match data.get(kind.file_name()) {
                Some(doc) if !force_recreate => {
                    let current = Kubeconfig::from_yaml(doc)
                        .map(|cfg| cfg.is_current(&ca.cert_pem, &server))
                        .unwrap_or(false);
                    if current {
                        debug!(kubeconfig = name, "kubeconfig present");
                        return Ok((doc.clone(), false));
                    }
                    info!(kubeconfig = name, "stored kubeconfig is stale");
                }
                Some(_) => {}
                None => info!(kubeconfig = name, "kubeconfig secret has no document"),
            }
            info!(kubeconfig = name, "delete old kubeconfig");
            self.gateway.delete_secret(self.namespace, name).await?;
        }

        let client = pki::issue(kind.purpose(), Some(&ca), &self.params)?;
        let doc = Kubeconfig::new(
            &kind.cluster_name(self.namespace),
            &server,
            kind.username(),
            &ca.cert_pem,
            &client.cert_pem,
            &client.key_pem,
        )
        .to_yaml()?;

        info!(kubeconfig = name, "create kubeconfig");
        let data = SecretData::from([(kind.file_name().to_string(), doc.clone())]);
        self.gateway
            .create_secret(self.namespace, name, data, self.owner)
            .await?;
        Ok((doc, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_layout() {
        let cfg = Kubeconfig::new(
            "kubernetes",
            "https://acme.example.com:6443",
            "system:kube-scheduler",
            "CA PEM",
            "CERT PEM",
            "KEY PEM",
        );
        let yaml = String::from_utf8(cfg.to_yaml().unwrap()).unwrap();
        let value: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(value["apiVersion"], "v1");
        assert_eq!(value["kind"], "Config");
        assert_eq!(
            value["clusters"][0]["cluster"]["server"],
            "https://acme.example.com:6443"
        );
        assert_eq!(
            value["clusters"][0]["cluster"]["certificate-authority-data"],
            STANDARD.encode("CA PEM").as_str()
        );
        assert_eq!(
            value["contexts"][0]["name"],
            "system:kube-scheduler@kubernetes"
        );
        assert_eq!(value["current-context"], "system:kube-scheduler@kubernetes");
        assert_eq!(
            value["users"][0]["user"]["client-certificate-data"],
            STANDARD.encode("CERT PEM").as_str()
        );
        assert_eq!(
            value["users"][0]["user"]["client-key-data"],
            STANDARD.encode("KEY PEM").as_str()
        );
        assert_eq!(Kubeconfig::from_yaml(yaml.as_bytes()).unwrap(), cfg);
    }

    #[test]
    fn only_configs_signed_by_the_current_ca_are_current() {
        let params = IssueParams {
            advertise_host: "acme.example.com".into(),
            advertise_address: "203.0.113.10".into(),
        };
        let server = "https://acme.example.com:6443";
        let ca = pki::issue(CertificatePurpose::RootCa, None, &params).unwrap();
        let rotated = pki::issue(CertificatePurpose::RootCa, None, &params).unwrap();
        let client = pki::issue(CertificatePurpose::SchedulerClient, Some(&ca), &params).unwrap();
        let cfg = Kubeconfig::new(
            "kubernetes",
            server,
            "system:kube-scheduler",
            &ca.cert_pem,
            &client.cert_pem,
            &client.key_pem,
        );

        assert!(cfg.is_current(&ca.cert_pem, server));
        assert!(!cfg.is_current(&rotated.cert_pem, server));
        assert!(!cfg.is_current(&ca.cert_pem, "https://acme.example.com:6543"));

        let foreign_client = Kubeconfig::new(
            "kubernetes",
            server,
            "system:kube-scheduler",
            &ca.cert_pem,
            &pki::issue(CertificatePurpose::SchedulerClient, Some(&rotated), &params)
                .unwrap()
                .cert_pem,
            &client.key_pem,
        );
        assert!(!foreign_client.is_current(&ca.cert_pem, server));
    }

    #[test]
    fn kinds_map_to_fixed_secret_fields() {
        let files: Vec<_> = KubeconfigKind::ALL.iter().map(|k| k.file_name()).collect();
        assert_eq!(
            files,
            vec![
                "super-admin.conf",
                "scheduler.conf",
                "controller-manager.conf",
                "konnectivity-server.conf"
            ]
        );
        assert_eq!(KubeconfigKind::Admin.cluster_name("tenant-a"), "tenant-a");
        assert_eq!(KubeconfigKind::Scheduler.cluster_name("tenant-a"), "kubernetes");
        assert!(!KubeconfigKind::Admin.mounted());
    }
}
