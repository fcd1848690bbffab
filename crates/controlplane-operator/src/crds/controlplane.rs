use std::net::IpAddr;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ReconcileError;

#[derive(CustomResource, Debug, Serialize, Deserialize, Clone, PartialEq, Eq, JsonSchema)]
#[kube(
    group = "controlplane.operator.dev",
    version = "v1alpha1",
    kind = "ControlPlane",
    plural = "controlplanes",
    namespaced,
    status = "ControlPlaneStatus",
    shortname = "cp"
)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneSpec {
    /// Tenant name, used as the datastore key prefix
    pub name: String,
    /// Hostname clients use to reach the API server
    pub advertise_host: String,
    /// IP address clients use to reach the API server
    pub advertise_address: String,
    /// API server secure port, default 6443
    #[serde(default = "default_port")]
    pub port: u16,
    /// Service cluster IP range, e.g. "10.96.0.0/12"
    pub service_cidr: String,
    /// Pod network range, e.g. "10.244.0.0/16"
    pub cluster_cidr: String,
    /// Backing datastore endpoint passed to --etcd-servers
    pub database: String,
    /// Kubernetes version without the leading "v", e.g. "1.31.1"
    pub version: String,
}

fn default_port() -> u16 {
    6443
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneStatus {
    /// Last spec that was fully applied
    pub target_spec: Option<ControlPlaneSpec>,
}

impl ControlPlaneSpec {
    /// Reject specs that can never produce a working control plane.
    pub fn validate(&self) -> Result<(), ReconcileError> {
        let required = [
            ("advertiseHost", &self.advertise_host),
            ("serviceCidr", &self.service_cidr),
            ("clusterCidr", &self.cluster_cidr),
            ("database", &self.database),
            ("version", &self.version),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ReconcileError::InvalidSpec(format!("{field} must not be empty")));
            }
        }
        if self.port == 0 {
            return Err(ReconcileError::InvalidSpec("port must not be 0".into()));
        }
        self.advertise_address.parse::<IpAddr>().map_err(|_| {
            ReconcileError::InvalidSpec(format!(
                "advertiseAddress {:?} is not an IP address",
                self.advertise_address
            ))
        })?;
        Ok(())
    }
}

impl ControlPlane {
    /// True when the live workload was built from the current spec.
    pub fn is_converged(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.target_spec.as_ref())
            .is_some_and(|target| *target == self.spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn valid_spec_passes() {
        assert!(spec().validate().is_ok());
    }

    #[test]
    fn malformed_address_is_rejected() {
        let mut s = spec();
        s.advertise_address = "not-an-ip".into();
        assert!(matches!(s.validate(), Err(ReconcileError::InvalidSpec(m)) if m.contains("advertiseAddress")));
    }

    #[test]
    fn empty_required_field_is_rejected() {
        let mut s = spec();
        s.version = " ".into();
        assert!(matches!(s.validate(), Err(ReconcileError::InvalidSpec(m)) if m.contains("version")));
    }

    #[test]
    fn port_defaults_when_omitted() {
        let s: ControlPlaneSpec = serde_json::from_value(serde_json::json!({
            "name": "acme",
            "advertiseHost": "acme.example.com",
            "advertiseAddress": "203.0.113.10",
            "serviceCidr": "10.96.0.0/12",
            "clusterCidr": "10.244.0.0/16",
            "database": "http://etcd:2379",
            "version": "1.31.1"
        }))
        .unwrap();
        assert_eq!(s.port, 6443);
    }

    #[test]
    fn converged_only_when_target_matches() {
        let mut cp = ControlPlane::new("acme", spec());
        assert!(!cp.is_converged());
        cp.status = Some(ControlPlaneStatus {
            target_spec: Some(spec()),
        });
        assert!(cp.is_converged());
        cp.spec.advertise_host = "other.example.com".into();
        assert!(!cp.is_converged());
    }
}
