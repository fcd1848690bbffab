//! Certificate issuance for the tenant control plane.
//!
//! Every certificate the operator manages is described by a [`CertificatePurpose`].
//! A purpose fixes the subject, key usages, validity and issuing CA, so
//! [`issue`] is the only place certificate templates are built.
//!
//! Issuance is pure: no I/O, a fresh key pair per call, and a random serial
//! drawn from the OS random source. If that source fails, issuance fails.

use std::net::{IpAddr, Ipv4Addr};

use rand::{TryRngCore, rngs::OsRng};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
    string::Ia5String,
};
use thiserror::Error;
use x509_parser::prelude::*;

/// Validity of CA certificates (10 years)
pub const CA_VALIDITY_YEARS: i64 = 10;

/// Validity of leaf certificates (1 year)
pub const LEAF_VALIDITY_YEARS: i64 = 1;

/// Serials are drawn uniformly from [1, 2^62)
const SERIAL_BITS: u32 = 62;

/// Cluster IP of the in-cluster `kubernetes` service
pub const KUBERNETES_SERVICE_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 128, 1);

const API_SERVER_DNS_NAMES: [&str; 5] = [
    "kubernetes",
    "kubernetes.default",
    "kubernetes.default.svc",
    "kubernetes.default.svc.cluster.local",
    "localhost",
];

#[derive(Debug, Error)]
pub enum PkiError {
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    #[error("certificate parsing error: {0}")]
    ParseError(String),

    #[error("invalid advertised IP address: {0:?}")]
    InvalidAddress(String),

    #[error("random source unavailable for serial number: {0}")]
    RandomSource(String),

    #[error("{purpose} requires an issuer")]
    IssuerRequired { purpose: &'static str },

    #[error("{purpose} is self-signed and takes no issuer")]
    UnexpectedIssuer { purpose: &'static str },
}

pub type Result<T> = std::result::Result<T, PkiError>;

/// PEM-encoded key material for one certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    pub key_pem: String,
    pub cert_pem: String,
    pub pub_pem: String,
}

/// Every certificate kind the control plane uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CertificatePurpose {
    RootCa,
    ApiServer,
    ApiServerKubeletClient,
    FrontProxyCa,
    FrontProxyClient,
    /// Service-account token signing key. Self-signed, never chained.
    ServiceAccount,
    AdminClient,
    SchedulerClient,
    ControllerManagerClient,
    NetworkProxyClient,
}

impl CertificatePurpose {
    /// Certificates persisted as secrets, CAs ahead of their leaves.
    pub const STORED: [CertificatePurpose; 6] = [
        CertificatePurpose::RootCa,
        CertificatePurpose::ApiServer,
        CertificatePurpose::ApiServerKubeletClient,
        CertificatePurpose::FrontProxyCa,
        CertificatePurpose::FrontProxyClient,
        CertificatePurpose::ServiceAccount,
    ];

    /// Logical name; for stored certificates this is also the secret name
    /// and the prefix of its `.key`/`.crt`/`.pub` fields.
    pub fn name(self) -> &'static str {
        match self {
            Self::RootCa => "ca",
            Self::ApiServer => "apiserver",
            Self::ApiServerKubeletClient => "apiserver-kubelet-client",
            Self::FrontProxyCa => "front-proxy-ca",
            Self::FrontProxyClient => "front-proxy-client",
            Self::ServiceAccount => "sa",
            Self::AdminClient => "admin",
            Self::SchedulerClient => "scheduler",
            Self::ControllerManagerClient => "controller-manager",
            Self::NetworkProxyClient => "konnectivity-server",
        }
    }

    pub fn is_ca(self) -> bool {
        matches!(self, Self::RootCa | Self::FrontProxyCa)
    }

    /// The CA that signs this certificate, `None` for self-signed ones.
    pub fn issuer(self) -> Option<CertificatePurpose> {
        match self {
            Self::RootCa | Self::FrontProxyCa | Self::ServiceAccount => None,
            Self::FrontProxyClient => Some(Self::FrontProxyCa),
            Self::ApiServer
            | Self::ApiServerKubeletClient
            | Self::AdminClient
            | Self::SchedulerClient
            | Self::ControllerManagerClient
            | Self::NetworkProxyClient => Some(Self::RootCa),
        }
    }

    fn common_name(self) -> &'static str {
        match self {
            Self::RootCa => "kubernetes",
            Self::ApiServer => "kube-apiserver",
            Self::ApiServerKubeletClient => "kube-apiserver-kubelet-client",
            Self::FrontProxyCa => "front-proxy-ca",
            Self::FrontProxyClient => "front-proxy-client",
            Self::ServiceAccount => "service-accounts",
            Self::AdminClient => "kubernetes-admin",
            Self::SchedulerClient => "system:kube-scheduler",
            Self::ControllerManagerClient => "system:kube-controller-manager",
            Self::NetworkProxyClient => "system:konnectivity-server",
        }
    }

    fn organization(self) -> Option<&'static str> {
        match self {
            Self::ApiServerKubeletClient | Self::AdminClient => Some("system:masters"),
            _ => None,
        }
    }

    fn validity_years(self) -> i64 {
        if self.is_ca() {
            CA_VALIDITY_YEARS
        } else {
            LEAF_VALIDITY_YEARS
        }
    }

    fn key_usages(self) -> Vec<KeyUsagePurpose> {
        let mut usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        if self.is_ca() {
            usages.push(KeyUsagePurpose::KeyCertSign);
        }
        usages
    }

    fn extended_key_usages(self) -> Vec<ExtendedKeyUsagePurpose> {
        match self {
            Self::RootCa | Self::FrontProxyCa => vec![],
            Self::ApiServer | Self::FrontProxyClient => vec![ExtendedKeyUsagePurpose::ServerAuth],
            Self::ServiceAccount => vec![
                ExtendedKeyUsagePurpose::ServerAuth,
                ExtendedKeyUsagePurpose::ClientAuth,
            ],
            Self::ApiServerKubeletClient
            | Self::AdminClient
            | Self::SchedulerClient
            | Self::ControllerManagerClient
            | Self::NetworkProxyClient => vec![ExtendedKeyUsagePurpose::ClientAuth],
        }
    }
}

impl std::fmt::Display for CertificatePurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Tenant-specific inputs to certificate templates.
#[derive(Debug, Clone)]
pub struct IssueParams {
    pub advertise_host: String,
    pub advertise_address: String,
}

/// Issue a fresh certificate for `purpose`, signed by `issuer` when the
/// purpose has one and self-signed otherwise.
pub fn issue(
    purpose: CertificatePurpose,
    issuer: Option<&Certificate>,
    params: &IssueParams,
) -> Result<Certificate> {
    match (purpose.issuer(), issuer) {
        (Some(_), None) => {
            return Err(PkiError::IssuerRequired {
                purpose: purpose.name(),
            });
        }
        (None, Some(_)) => {
            return Err(PkiError::UnexpectedIssuer {
                purpose: purpose.name(),
            });
        }
        _ => {}
    }

    let mut cert_params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(purpose.common_name().to_string()),
    );
    if let Some(org) = purpose.organization() {
        dn.push(DnType::OrganizationName, DnValue::Utf8String(org.to_string()));
    }
    cert_params.distinguished_name = dn;

    cert_params.serial_number = Some(random_serial()?);
    let (not_before, not_after) = compute_validity(purpose.validity_years());
    cert_params.not_before = not_before;
    cert_params.not_after = not_after;

    cert_params.is_ca = if purpose.is_ca() {
        IsCa::Ca(BasicConstraints::Unconstrained)
    } else {
        IsCa::NoCa
    };
    cert_params.key_usages = purpose.key_usages();
    cert_params.extended_key_usages = purpose.extended_key_usages();

    if purpose == CertificatePurpose::ApiServer {
        cert_params.subject_alt_names = api_server_sans(params)?;
    }

    let key_pair = KeyPair::generate().map_err(|e| {
        PkiError::KeyGenerationFailed(format!("failed to generate {} key: {}", purpose, e))
    })?;

    let cert = match issuer {
        None => cert_params.self_signed(&key_pair),
        Some(ca) => {
            let ca_key = KeyPair::from_pem(&ca.key_pem)
                .map_err(|e| PkiError::ParseError(format!("failed to parse CA key: {}", e)))?;
            let ca_issuer = Issuer::from_ca_cert_pem(&ca.cert_pem, &ca_key)
                .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;
            cert_params.signed_by(&key_pair, &ca_issuer)
        }
    }
    .map_err(|e| {
        PkiError::CertificateGenerationFailed(format!("failed to sign {}: {}", purpose, e))
    })?;

    Ok(Certificate {
        key_pem: key_pair.serialize_pem(),
        cert_pem: cert.pem(),
        pub_pem: key_pair.public_key_pem(),
    })
}

fn api_server_sans(params: &IssueParams) -> Result<Vec<SanType>> {
    let advertised: IpAddr = params
        .advertise_address
        .parse()
        .map_err(|_| PkiError::InvalidAddress(params.advertise_address.clone()))?;

    let mut sans = vec![
        SanType::IpAddress(IpAddr::V4(KUBERNETES_SERVICE_IP)),
        SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        SanType::IpAddress(advertised),
    ];
    for name in API_SERVER_DNS_NAMES
        .iter()
        .copied()
        .chain(std::iter::once(params.advertise_host.as_str()))
    {
        let dns = Ia5String::try_from(name.to_string()).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("invalid DNS name '{}': {}", name, e))
        })?;
        sans.push(SanType::DnsName(dns));
    }
    Ok(sans)
}

fn compute_validity(years: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    (now, now + ::time::Duration::days(years * 365))
}

/// Random serial in [1, 2^62). Fails closed when the OS source is unavailable.
pub fn random_serial() -> Result<SerialNumber> {
    let raw = OsRng
        .try_next_u64()
        .map_err(|e| PkiError::RandomSource(e.to_string()))?;
    let serial = (raw >> (64 - SERIAL_BITS)).max(1);
    Ok(SerialNumber::from_slice(&serial.to_be_bytes()))
}

/// Decode a PEM block into its DER contents.
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// Encode DER certificate bytes the same way issued certificates are encoded.
pub fn encode_certificate_pem(der: &[u8]) -> String {
    let config = ::pem::EncodeConfig::new().set_line_ending(::pem::LineEnding::LF);
    ::pem::encode_config(&::pem::Pem::new("CERTIFICATE", der.to_vec()), config)
}

/// Verify that `cert_pem` carries a valid signature from `issuer_cert_pem`.
///
/// Returns `Ok(false)` for a well-formed certificate signed by another key.
pub fn verify_issued_by(cert_pem: &str, issuer_cert_pem: &str) -> Result<bool> {
    let cert_der = parse_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&cert_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;
    let issuer_der = parse_pem(issuer_cert_pem)?;
    let (_, issuer) = X509Certificate::from_der(&issuer_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse issuer: {}", e)))?;
    Ok(cert.verify_signature(Some(issuer.public_key())).is_ok())
}

/// Check a stored certificate before trusting it again: the private key must
/// parse and match both the public key and the certificate, and the
/// certificate must be signed by `issuer` (or by itself when there is none).
pub fn is_consistent(cert: &Certificate, issuer: Option<&Certificate>) -> bool {
    let Ok(key_pair) = KeyPair::from_pem(&cert.key_pem) else {
        return false;
    };
    let (Ok(derived_pub), Ok(stored_pub), Ok(cert_der)) = (
        parse_pem(&key_pair.public_key_pem()),
        parse_pem(&cert.pub_pem),
        parse_pem(&cert.cert_pem),
    ) else {
        return false;
    };
    let Ok((_, parsed)) = X509Certificate::from_der(&cert_der) else {
        return false;
    };
    if derived_pub != stored_pub || parsed.public_key().raw != stored_pub.as_slice() {
        return false;
    }
    match issuer {
        Some(ca) => verify_issued_by(&cert.cert_pem, &ca.cert_pem).unwrap_or(false),
        None => parsed.verify_signature(None).is_ok(),
    }
}
