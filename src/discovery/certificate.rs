use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use super::DiscoveryError;

/// A proxy's CA certificate with its pinned public-key fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyCertificate {
    pem: String,
    fingerprint: String,
    subject: String,
}

impl ProxyCertificate {
    pub fn from_pem(pem: &str) -> Result<Self, DiscoveryError> {
        let (_, parsed) = x509_parser::pem::parse_x509_pem(pem.trim().as_bytes())
            .map_err(|e| DiscoveryError::InvalidCertificate(format!("pem: {e}")))?;
        let (_, cert) = X509Certificate::from_der(&parsed.contents)
            .map_err(|e| DiscoveryError::InvalidCertificate(format!("der: {e}")))?;
        Ok(ProxyCertificate {
            pem: pem.trim().to_string(),
            fingerprint: spki_fingerprint(&cert),
            subject: cert.subject().to_string(),
        })
    }

    #[must_use]
    pub fn pem(&self) -> &str {
        &self.pem
    }

    /// Base64 SHA-256 of the DER SubjectPublicKeyInfo.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }
}

#[must_use]
pub fn spki_fingerprint(cert: &X509Certificate<'_>) -> String {
    let digest = Sha256::digest(cert.tbs_certificate.subject_pki.raw);
    STANDARD.encode(digest)
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// Self-signed P-256 CA, valid until 2126.
    pub const TEST_CA_PEM: &str = "-----BEGIN CERTIFICATE-----
MIIBjDCCATOgAwIBAgIUSb2scFOah2vPSVFvj5YqI96voQwwCgYIKoZIzj0EAwIw
GzEZMBcGA1UEAwwQVHVuc25hcmUgVGVzdCBDQTAgFw0yNjEwMTcwNjA5NDNaGA8y
MTI2MDkyMzA2MDk0M1owGzEZMBcGA1UEAwwQVHVuc25hcmUgVGVzdCBDQTBZMBMG
ByqGSM49AgEGCCqGSM49AwEHA0IABHF7doh3BEZ18bTEiraTEuuDIJp5RQ3ZzZYX
pkcOVmjc7pH1JSCIMb6SKD8Mf3pRwsk13TwoWUuVNchiZeu6DqijUzBRMB0GA1Ud
DgQWBBQkGWsuf0LNgYv+hKTo8KQsNBKzCDAfBgNVHSMEGDAWgBQkGWsuf0LNgYv+
hKTo8KQsNBKzCDAPBgNVHRMBAf8EBTADAQH/MAoGCCqGSM49BAMCA0cAMEQCIAJQ
a6QUqZ91npGdj7DlsHcL/M0oGwPzE0ISXVzOesQ3AiBuAuQmWghTCd+62sLOA+1l
0VW7/djKSIoNRm5+pegbNw==
-----END CERTIFICATE-----
";
    pub const TEST_CA_FINGERPRINT: &str = "nFb35NU9dYasMlgBfV1m8p7DElhZqjHRucNQRCfYlnE=";
}

#[cfg(test)]
mod tests {
    use super::fixtures::{TEST_CA_FINGERPRINT, TEST_CA_PEM};
    use super::*;

    #[test]
    fn test_fingerprint_matches_openssl_spki_digest() {
        let cert = ProxyCertificate::from_pem(TEST_CA_PEM).expect("parse");
        assert_eq!(cert.fingerprint(), TEST_CA_FINGERPRINT);
        assert_eq!(cert.subject(), "CN=Tunsnare Test CA");
        assert!(cert.pem().starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[test]
    fn test_distinct_keys_have_distinct_fingerprints() {
        let generated = rcgen::generate_simple_self_signed(vec!["proxy.test".to_string()])
            .expect("generate");
        let cert = ProxyCertificate::from_pem(&generated.cert.pem()).expect("parse");
        assert_ne!(cert.fingerprint(), TEST_CA_FINGERPRINT);
        // 32 bytes in standard base64.
        assert_eq!(cert.fingerprint().len(), 44);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            ProxyCertificate::from_pem("hello"),
            Err(DiscoveryError::InvalidCertificate(_))
        ));
        assert!(matches!(
            ProxyCertificate::from_pem(
                "-----BEGIN CERTIFICATE-----\naGVsbG8=\n-----END CERTIFICATE-----\n"
            ),
            Err(DiscoveryError::InvalidCertificate(_))
        ));
    }
}
