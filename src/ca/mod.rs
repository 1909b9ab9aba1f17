use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::PrivateKeyDer;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use time::{Duration, OffsetDateTime};

#[derive(Debug, Error)]
pub enum CaError {
    #[error("certificate generation failed: {0}")]
    Generation(String),

    #[error("invalid name for certificate: {0}")]
    InvalidName(String),
}

/// A keypair plus its PEM-encoded certificate chain (leaf first, root last),
/// ready to feed to `rustls::ServerConfig`/`ClientConfig`.
pub struct IssuedCert {
    pub cert_chain_pem: String,
    pub private_key_pem: String,
    pub private_key_der: Vec<u8>,
}

impl IssuedCert {
    pub fn private_key(&self) -> Result<PrivateKeyDer<'static>, CaError> {
        PrivateKeyDer::try_from(self.private_key_der.clone())
            .map_err(|e| CaError::Generation(format!("invalid private key: {e:?}")))
    }
}

/// Per-run, in-memory-only certificate authority. Generated once at process
/// startup and discarded at exit; it never touches disk. Issues the
/// aggregator's own server certificate and one client certificate per
/// plugin, all chained to the same root so the root PEM alone is a
/// sufficient trust anchor for every plugin worker.
pub struct Authority {
    root_cert: Certificate,
    root_key: KeyPair,
    next_serial: AtomicU64,
}

impl Authority {
    pub fn generate() -> Result<Self, CaError> {
        let mut params = CertificateParams::new(vec!["Aggregator Root CA".to_string()])
            .map_err(|e| CaError::Generation(e.to_string()))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Aggregator Root CA");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.not_before = OffsetDateTime::now_utc() - Duration::minutes(5);
        params.not_after = OffsetDateTime::now_utc() + Duration::hours(12);

        let key_pair = KeyPair::generate().map_err(|e| CaError::Generation(e.to_string()))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CaError::Generation(e.to_string()))?;

        Ok(Self {
            root_cert: cert,
            root_key: key_pair,
            next_serial: AtomicU64::new(1),
        })
    }

    fn next_serial(&self) -> u64 {
        self.next_serial.fetch_add(1, Ordering::SeqCst)
    }

    /// Issues a server keypair bound to `name` (a DNS name or IP), with
    /// server-auth EKU, for the aggregator's own listener.
    pub fn issue_server(&self, name: &str) -> Result<IssuedCert, CaError> {
        self.issue(name, ExtendedKeyUsagePurpose::ServerAuth)
    }

    /// Issues a client keypair bound to `name`, with client-auth EKU, for a
    /// single plugin to authenticate itself against the aggregator.
    pub fn issue_client(&self, name: &str) -> Result<IssuedCert, CaError> {
        self.issue(name, ExtendedKeyUsagePurpose::ClientAuth)
    }

    fn issue(&self, name: &str, eku: ExtendedKeyUsagePurpose) -> Result<IssuedCert, CaError> {
        let mut params = CertificateParams::new(vec![name.to_string()])
            .map_err(|e| CaError::Generation(e.to_string()))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, name);
        params.distinguished_name = dn;
        params.serial_number = Some(self.next_serial().into());
        params.extended_key_usages = vec![eku];
        params.not_before = OffsetDateTime::now_utc() - Duration::minutes(5);
        params.not_after = OffsetDateTime::now_utc() + Duration::hours(12);

        let san = if name.parse::<std::net::IpAddr>().is_ok() {
            rcgen::SanType::IpAddress(name.parse().unwrap())
        } else {
            rcgen::SanType::DnsName(
                name.to_string()
                    .try_into()
                    .map_err(|e| CaError::InvalidName(format!("{e:?}")))?,
            )
        };
        params.subject_alt_names = vec![san];

        let key_pair = KeyPair::generate().map_err(|e| CaError::Generation(e.to_string()))?;
        let cert = params
            .signed_by(&key_pair, &self.root_cert, &self.root_key)
            .map_err(|e| CaError::Generation(e.to_string()))?;

        let cert_chain_pem = format!("{}\n{}", cert.pem(), self.root_cert.pem());

        Ok(IssuedCert {
            cert_chain_pem,
            private_key_pem: key_pair.serialize_pem(),
            private_key_der: key_pair.serialize_der(),
        })
    }

    /// The root certificate PEM, handed to every plugin as trust anchor.
    pub fn root_cert_pem(&self) -> String {
        self.root_cert.pem()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_root_with_valid_pem() {
        let authority = Authority::generate().unwrap();
        let pem = authority.root_cert_pem();
        assert!(pem.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn issues_server_cert_chained_to_root() {
        let authority = Authority::generate().unwrap();
        let issued = authority.issue_server("aggregator.default.svc").unwrap();
        assert!(issued.cert_chain_pem.contains("BEGIN CERTIFICATE"));
        assert!(issued.private_key().is_ok());
    }

    #[test]
    fn issues_client_cert_for_plugin() {
        let authority = Authority::generate().unwrap();
        let issued = authority.issue_client("systemd_logs").unwrap();
        assert!(issued.cert_chain_pem.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn serial_numbers_are_monotonic() {
        let authority = Authority::generate().unwrap();
        assert_eq!(authority.next_serial(), 1);
        assert_eq!(authority.next_serial(), 2);
        assert_eq!(authority.next_serial(), 3);
    }
}
