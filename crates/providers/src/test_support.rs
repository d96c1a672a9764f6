//! Self-signed certificates for unit tests

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

/// A self-signed certificate for `domain` as `(cert_pem, key_pem)`
pub(crate) fn self_signed(domain: &str) -> (String, String) {
    let mut params = CertificateParams::new(vec![domain.to_string()]).unwrap();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, domain);
    params.distinguished_name = dn;

    let key = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    (cert.pem(), key.serialize_pem())
}
