use crate::constants::KUBELET_SERVING_SIGNER;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::FromDer;

/// The parts of a `CertificateSigningRequest` needed to decide whether it may be approved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest {
    pub name: String,
    pub signer_name: String,
    pub pending: bool,
    pub san_addresses: Vec<IpAddr>,
}

impl CertificateRequest {
    pub fn from_k8s(csr: &CertificateSigningRequest) -> Self {
        let name = csr.metadata.name.clone().unwrap_or_default();
        let pending = match &csr.status {
            None => true,
            Some(status) => {
                status.certificate.is_none()
                    && !status.conditions.iter().flatten().any(|condition| {
                        matches!(condition.type_.as_str(), "Approved" | "Denied" | "Failed")
                    })
            }
        };
        let san_addresses = san_ip_addresses(&request_der(&csr.spec.request.0));
        Self {
            name,
            signer_name: csr.spec.signer_name.clone(),
            pending,
            san_addresses,
        }
    }

    pub fn is_kubelet_serving(&self) -> bool {
        self.signer_name.contains(KUBELET_SERVING_SIGNER)
    }

    /// A request may be approved when it is pending, asks for a kubelet serving certificate and
    /// names `node_ip` among its subject alternative names.
    pub fn is_eligible(&self, node_ip: IpAddr) -> bool {
        self.pending && self.is_kubelet_serving() && self.san_addresses.contains(&node_ip)
    }
}

/// Returns the DER bytes of a PKCS#10 request that is either PEM armored or already DER.
pub fn request_der(request: &[u8]) -> Vec<u8> {
    match parse_x509_pem(request) {
        Ok((_, pem)) => pem.contents,
        Err(_) => request.to_vec(),
    }
}

/// The IP addresses named in the `subjectAltName` extensions requested by the DER encoded
/// request. A request that does not parse names no addresses.
pub fn san_ip_addresses(der: &[u8]) -> Vec<IpAddr> {
    let request = match X509CertificationRequest::from_der(der) {
        Ok((_, request)) => request,
        Err(_) => return Vec::new(),
    };
    let mut addresses = Vec::new();
    for extension in request.requested_extensions().into_iter().flatten() {
        if let ParsedExtension::SubjectAlternativeName(san) = extension {
            for name in &san.general_names {
                if let GeneralName::IPAddress(octets) = name {
                    match ip_address(octets) {
                        Some(address) if !addresses.contains(&address) => addresses.push(address),
                        _ => {}
                    }
                }
            }
        }
    }
    addresses
}

fn ip_address(octets: &[u8]) -> Option<IpAddr> {
    if let Ok(octets) = <[u8; 4]>::try_from(octets) {
        Some(IpAddr::V4(Ipv4Addr::from(octets)))
    } else if let Ok(octets) = <[u8; 16]>::try_from(octets) {
        Some(IpAddr::V6(Ipv6Addr::from(octets)))
    } else {
        None
    }
}
