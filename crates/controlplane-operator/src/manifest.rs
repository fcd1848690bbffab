//! Deployment and Service objects for a tenant control plane.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, HTTPGetAction, PodSpec, PodTemplateSpec, Probe,
    ProjectedVolumeSource, ResourceRequirements, SecretProjection, Service, ServicePort,
    ServiceSpec, Volume, VolumeMount, VolumeProjection,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use sha2::{Digest, Sha256};

use crate::{
    crds::controlplane::ControlPlaneSpec, gateway::SecretData, kubeconfig::KubeconfigKind,
    pki::CertificatePurpose,
};

pub const PKI_DIR: &str = "/etc/kubernetes/pki";
const PKI_VOLUME: &str = "kubernetes-pki";
const UDS_VOLUME: &str = "konnectivity-uds";
const UDS_DIR: &str = "/run/konnectivity";
const IMAGE_REGISTRY: &str = "registry.k8s.io";
const KONNECTIVITY_IMAGE: &str = "registry.k8s.io/kas-network-proxy/proxy-server:v0.0.37";
const SCHEDULER_HEALTH_PORT: i32 = 10259;
const CONTROLLER_MANAGER_HEALTH_PORT: i32 = 10257;
pub const CREDENTIALS_ANNOTATION: &str = "controlplane.operator.dev/credentials-hash";

pub fn service_name(name: &str) -> String {
    format!("{name}-apiserver")
}

fn labels(app: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(String::from("app"), app.to_string())])
}

fn pki(file: &str) -> String {
    format!("{PKI_DIR}/{file}")
}

fn https_probe(path: &str, port: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.into()),
            port: IntOrString::Int(port),
            scheme: Some("HTTPS".into()),
            ..Default::default()
        }),
        failure_threshold: Some(3),
        period_seconds: Some(10),
        success_threshold: Some(1),
        timeout_seconds: Some(1),
        ..Default::default()
    }
}

fn requests(cpu: &str, memory: &str) -> ResourceRequirements {
    ResourceRequirements {
        requests: Some(BTreeMap::from([
            (String::from("cpu"), Quantity(cpu.into())),
            (String::from("memory"), Quantity(memory.into())),
        ])),
        ..Default::default()
    }
}

fn pki_mount() -> VolumeMount {
    VolumeMount {
        name: PKI_VOLUME.into(),
        mount_path: PKI_DIR.into(),
        read_only: Some(true),
        ..Default::default()
    }
}

/// Secrets projected into the pki volume: every stored certificate plus
/// the kubeconfigs the components read.
pub fn mounted_secrets() -> Vec<&'static str> {
    CertificatePurpose::STORED
        .iter()
        .map(|p| p.name())
        .chain(
            KubeconfigKind::ALL
                .iter()
                .filter(|k| k.mounted())
                .map(|k| k.secret_name()),
        )
        .collect()
}

/// SHA-256 over the mounted secrets, in mount order.
pub fn credentials_hash<'a>(
    secrets: impl IntoIterator<Item = (&'a str, Option<&'a SecretData>)>,
) -> String {
    let mut hasher = Sha256::new();
    for (name, data) in secrets {
        hasher.update(name.as_bytes());
        match data {
            Some(data) => {
                for (field, value) in data {
                    hasher.update((field.len() as u64).to_be_bytes());
                    hasher.update(field.as_bytes());
                    hasher.update((value.len() as u64).to_be_bytes());
                    hasher.update(value);
                }
            }
            None => hasher.update(b"\0absent"),
        }
        hasher.update(b"\0");
    }
    format!("{:x}", hasher.finalize())
}

/// Credentials hash the pods of `dep` were started with.
pub fn template_credentials_hash(dep: &Deployment) -> Option<&str> {
    dep.spec
        .as_ref()?
        .template
        .metadata
        .as_ref()?
        .annotations
        .as_ref()?
        .get(CREDENTIALS_ANNOTATION)
        .map(String::as_str)
}

fn api_server(spec: &ControlPlaneSpec) -> Container {
    let port = i32::from(spec.port);
    Container {
        name: "kube-apiserver".into(),
        image: Some(format!("{IMAGE_REGISTRY}/kube-apiserver:v{}", spec.version)),
        command: Some(vec!["kube-apiserver".into()]),
        args: Some(vec![
            "--allow-privileged=true".into(),
            "--authorization-mode=Node,RBAC".into(),
            format!("--client-ca-file={}", pki("ca.crt")),
            "--enable-bootstrap-token-auth=true".into(),
            format!("--etcd-prefix=/{}", spec.name),
            format!("--etcd-servers={}", spec.database),
            format!("--external-hostname={}", spec.advertise_host),
            format!("--kubelet-client-certificate={}", pki("apiserver-kubelet-client.crt")),
            format!("--kubelet-client-key={}", pki("apiserver-kubelet-client.key")),
            "--kubelet-preferred-address-types=InternalIP,ExternalIP,Hostname".into(),
            format!("--proxy-client-cert-file={}", pki("front-proxy-client.crt")),
            format!("--proxy-client-key-file={}", pki("front-proxy-client.key")),
            "--requestheader-allowed-names=front-proxy-client".into(),
            format!("--requestheader-client-ca-file={}", pki("front-proxy-ca.crt")),
            "--requestheader-extra-headers-prefix=X-Remote-Extra-".into(),
            "--requestheader-group-headers=X-Remote-Group".into(),
            "--requestheader-username-headers=X-Remote-User".into(),
            format!("--secure-port={port}"),
            "--service-account-issuer=https://kubernetes.default.svc.cluster.local".into(),
            format!("--service-account-key-file={}", pki("sa.pub")),
            format!("--service-account-signing-key-file={}", pki("sa.key")),
            format!("--service-cluster-ip-range={}", spec.service_cidr),
            format!("--tls-cert-file={}", pki("apiserver.crt")),
            format!("--tls-private-key-file={}", pki("apiserver.key")),
        ]),
        liveness_probe: Some(https_probe("/livez", port)),
        readiness_probe: Some(https_probe("/readyz", port)),
        startup_probe: Some(https_probe("/livez", port)),
        resources: Some(requests("125m", "512Mi")),
        volume_mounts: Some(vec![pki_mount()]),
        ..Default::default()
    }
}

fn scheduler(spec: &ControlPlaneSpec) -> Container {
    let kubeconfig = pki(KubeconfigKind::Scheduler.file_name());
    Container {
        name: "kube-scheduler".into(),
        image: Some(format!("{IMAGE_REGISTRY}/kube-scheduler:v{}", spec.version)),
        command: Some(vec!["kube-scheduler".into()]),
        args: Some(vec![
            format!("--authentication-kubeconfig={kubeconfig}"),
            format!("--authorization-kubeconfig={kubeconfig}"),
            "--bind-address=0.0.0.0".into(),
            format!("--kubeconfig={kubeconfig}"),
            "--leader-elect=true".into(),
        ]),
        liveness_probe: Some(https_probe("/healthz", SCHEDULER_HEALTH_PORT)),
        startup_probe: Some(https_probe("/healthz", SCHEDULER_HEALTH_PORT)),
        resources: Some(requests("125m", "256Mi")),
        volume_mounts: Some(vec![pki_mount()]),
        ..Default::default()
    }
}

fn controller_manager(spec: &ControlPlaneSpec) -> Container {
    let kubeconfig = pki(KubeconfigKind::ControllerManager.file_name());
    Container {
        name: "kube-controller-manager".into(),
        image: Some(format!(
            "{IMAGE_REGISTRY}/kube-controller-manager:v{}",
            spec.version
        )),
        command: Some(vec!["kube-controller-manager".into()]),
        args: Some(vec![
            "--allocate-node-cidrs=true".into(),
            format!("--authentication-kubeconfig={kubeconfig}"),
            format!("--authorization-kubeconfig={kubeconfig}"),
            "--bind-address=0.0.0.0".into(),
            format!("--client-ca-file={}", pki("ca.crt")),
            format!("--cluster-cidr={}", spec.cluster_cidr),
            format!("--cluster-name={}", spec.name),
            format!("--cluster-signing-cert-file={}", pki("ca.crt")),
            format!("--cluster-signing-key-file={}", pki("ca.key")),
            "--controllers=*,bootstrapsigner,tokencleaner".into(),
            format!("--kubeconfig={kubeconfig}"),
            "--leader-elect=true".into(),
            format!("--requestheader-client-ca-file={}", pki("front-proxy-ca.crt")),
            format!("--root-ca-file={}", pki("ca.crt")),
            format!("--service-account-private-key-file={}", pki("sa.key")),
            format!("--service-cluster-ip-range={}", spec.service_cidr),
            "--use-service-account-credentials=true".into(),
        ]),
        liveness_probe: Some(https_probe("/healthz", CONTROLLER_MANAGER_HEALTH_PORT)),
        startup_probe: Some(https_probe("/healthz", CONTROLLER_MANAGER_HEALTH_PORT)),
        resources: Some(requests("125m", "256Mi")),
        volume_mounts: Some(vec![pki_mount()]),
        ..Default::default()
    }
}

fn konnectivity_server(namespace: &str) -> Container {
    Container {
        name: "konnectivity-server".into(),
        image: Some(KONNECTIVITY_IMAGE.into()),
        command: Some(vec!["/proxy-server".into()]),
        args: Some(vec![
            "--admin-port=8133".into(),
            "--agent-port=8132".into(),
            "--health-port=8134".into(),
            "--mode=grpc".into(),
            "--server-count=1".into(),
            "--server-port=0".into(),
            format!("--agent-namespace={namespace}"),
            "--agent-service-account=konnectivity-agent".into(),
            "--authentication-audience=system:konnectivity-server".into(),
            format!("--cluster-cert={}", pki("apiserver.crt")),
            format!("--cluster-key={}", pki("apiserver.key")),
            format!("--kubeconfig={}", pki(KubeconfigKind::NetworkProxyServer.file_name())),
            format!("--uds-name={UDS_DIR}/konnectivity-server.socket"),
        ]),
        volume_mounts: Some(vec![
            pki_mount(),
            VolumeMount {
                name: UDS_VOLUME.into(),
                mount_path: UDS_DIR.into(),
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

/// Certificate and kubeconfig content reaches the pods only through the
/// projected secrets; `credentials_hash` pins which content that was.
pub fn build_deployment(
    name: &str,
    namespace: &str,
    spec: &ControlPlaneSpec,
    owner: &OwnerReference,
    credentials_hash: &str,
) -> Deployment {
    let sources = mounted_secrets()
        .into_iter()
        .map(|secret| VolumeProjection {
            secret: Some(SecretProjection {
                name: secret.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect();

    Deployment {
        metadata: kube::core::ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels(name)),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels(name)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(kube::core::ObjectMeta {
                    labels: Some(labels(name)),
                    annotations: Some(BTreeMap::from([(
                        CREDENTIALS_ANNOTATION.to_string(),
                        credentials_hash.to_string(),
                    )])),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![
                        api_server(spec),
                        scheduler(spec),
                        controller_manager(spec),
                        konnectivity_server(namespace),
                    ],
                    volumes: Some(vec![
                        Volume {
                            name: PKI_VOLUME.into(),
                            projected: Some(ProjectedVolumeSource {
                                sources: Some(sources),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                        Volume {
                            name: UDS_VOLUME.into(),
                            empty_dir: Some(EmptyDirVolumeSource {
                                medium: Some("Memory".into()),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// LoadBalancer in front of the API server pods.
pub fn build_service(
    name: &str,
    namespace: &str,
    port: u16,
    owner: &OwnerReference,
) -> Service {
    let svc = service_name(name);
    Service {
        metadata: kube::core::ObjectMeta {
            name: Some(svc.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels(&svc)),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".into()),
            selector: Some(labels(name)),
            ports: Some(vec![ServicePort {
                name: Some("https".into()),
                port: i32::from(port),
                target_port: Some(IntOrString::Int(i32::from(port))),
                protocol: Some("TCP".into()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn spec() -> ControlPlaneSpec {
        ControlPlaneSpec {
            name: "acme".into(),
            advertise_host: "acme.example.com".into(),
            advertise_address: "203.0.113.10".into(),
            port: 6443,
            service_cidr: "10.96.0.0/12".into(),
            cluster_cidr: "10.244.0.0/16".into(),
            database: "http://etcd.storage.svc:2379".into(),
            version: "1.31.1".into(),
        }
    }

    #[test]
    fn deployment_renders_spec_values() {
        let dep = build_deployment("acme", "tenant-acme", &spec(), &owner(), "c0ffee");
        assert_eq!(dep.metadata.owner_references.as_ref().unwrap()[0].name, "acme");
        let pod = dep.spec.as_ref().unwrap().template.spec.clone().unwrap();
        let names: Vec<_> = pod.containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "kube-apiserver",
                "kube-scheduler",
                "kube-controller-manager",
                "konnectivity-server"
            ]
        );

        let api = &pod.containers[0];
        assert_eq!(api.image.as_deref(), Some("registry.k8s.io/kube-apiserver:v1.31.1"));
        let args = api.args.as_ref().unwrap();
        assert!(args.contains(&"--etcd-servers=http://etcd.storage.svc:2379".to_string()));
        assert!(args.contains(&"--etcd-prefix=/acme".to_string()));
        assert!(args.contains(&"--external-hostname=acme.example.com".to_string()));
        assert!(args.contains(&"--secure-port=6443".to_string()));

        let konnectivity = pod.containers[3].args.as_ref().unwrap();
        assert!(konnectivity.contains(&"--agent-namespace=tenant-acme".to_string()));
    }

    #[test]
    fn pki_volume_projects_certificates_and_component_kubeconfigs() {
        let dep = build_deployment("acme", "tenant-acme", &spec(), &owner(), "c0ffee");
        let pod = dep.spec.unwrap().template.spec.unwrap();
        let volume = &pod.volumes.as_ref().unwrap()[0];
        let projected: Vec<String> = volume
            .projected
            .as_ref()
            .unwrap()
            .sources
            .as_ref()
            .unwrap()
            .iter()
            .map(|s| s.secret.as_ref().unwrap().name.clone())
            .collect();
        assert_eq!(
            projected,
            vec![
                "ca",
                "apiserver",
                "apiserver-kubelet-client",
                "front-proxy-ca",
                "front-proxy-client",
                "sa",
                "kubeconfig-scheduler",
                "kubeconfig-controller",
                "kubeconfig-konnectivity"
            ]
        );
    }

    #[test]
    fn pod_template_carries_credentials_hash() {
        let dep = build_deployment("acme", "tenant-acme", &spec(), &owner(), "c0ffee");
        assert_eq!(template_credentials_hash(&dep), Some("c0ffee"));
        assert_eq!(template_credentials_hash(&Deployment::default()), None);
    }

    #[test]
    fn credentials_hash_tracks_secret_content() {
        let ca = SecretData::from([("ca.crt".to_string(), b"one".to_vec())]);
        let rotated = SecretData::from([("ca.crt".to_string(), b"two".to_vec())]);

        let base = credentials_hash([("ca", Some(&ca))]);
        assert_eq!(base, credentials_hash([("ca", Some(&ca))]));
        assert_eq!(base.len(), 64);
        assert_ne!(base, credentials_hash([("ca", Some(&rotated))]));
        assert_ne!(base, credentials_hash([("ca", None)]));
        assert_ne!(
            credentials_hash([("ca", None), ("sa", None)]),
            credentials_hash([("sa", None), ("ca", None)])
        );
    }

    #[test]
    fn service_exposes_api_port() {
        let svc = build_service("acme", "tenant-acme", 6443, &owner());
        assert_eq!(svc.metadata.name.as_deref(), Some("acme-apiserver"));
        let s = svc.spec.unwrap();
        assert_eq!(s.type_.as_deref(), Some("LoadBalancer"));
        assert_eq!(s.ports.as_ref().unwrap()[0].port, 6443);
        assert_eq!(s.selector.unwrap().get("app").map(String::as_str), Some("acme"));
    }
}
