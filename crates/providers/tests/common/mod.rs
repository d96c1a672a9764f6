//! Shared helpers for backend integration tests

#![allow(dead_code)]

use rcgen::{date_time_ymd, CertificateParams, DistinguishedName, DnType, KeyPair};

pub const NOT_BEFORE: &str = "2025-01-01T00:00:00Z";
pub const NOT_AFTER: &str = "2025-04-01T00:00:00Z";

/// Self-signed certificate valid from [`NOT_BEFORE`] to [`NOT_AFTER`]
pub fn test_certificate(sans: &[&str]) -> (String, String) {
    let mut params = CertificateParams::new(sans.iter().map(|s| s.to_string()).collect::<Vec<_>>()).unwrap();
    params.not_before = date_time_ymd(2025, 1, 1);
    params.not_after = date_time_ymd(2025, 4, 1);

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, sans[0]);
    params.distinguished_name = dn;

    let key = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    (cert.pem(), key.serialize_pem())
}
