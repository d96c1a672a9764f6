//! Self-signed certificates for unit tests

use rcgen::{date_time_ymd, CertificateParams, DistinguishedName, DnType, KeyPair, SerialNumber};

type Ymd = (i32, u8, u8);

pub(crate) struct IssuedCert {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Builder for a self-signed ECDSA P-256 certificate
pub(crate) struct TestCert {
    sans: Vec<String>,
    common_name: Option<String>,
    not_before: Ymd,
    not_after: Ymd,
    serial: u8,
}

impl TestCert {
    pub(crate) fn new(sans: &[&str]) -> Self {
        Self {
            sans: sans.iter().map(|s| s.to_string()).collect(),
            common_name: None,
            not_before: (2025, 1, 1),
            not_after: (2025, 4, 1),
            serial: 1,
        }
    }

    pub(crate) fn validity(mut self, not_before: Ymd, not_after: Ymd) -> Self {
        self.not_before = not_before;
        self.not_after = not_after;
        self
    }

    /// Subject CN; defaults to the first SAN
    pub(crate) fn common_name(mut self, cn: &str) -> Self {
        self.common_name = Some(cn.to_string());
        self
    }

    pub(crate) fn serial(mut self, serial: u8) -> Self {
        self.serial = serial;
        self
    }

    pub(crate) fn build(self) -> IssuedCert {
        let mut params = CertificateParams::new(self.sans.clone()).unwrap();
        params.not_before = date_time_ymd(self.not_before.0, self.not_before.1, self.not_before.2);
        params.not_after = date_time_ymd(self.not_after.0, self.not_after.1, self.not_after.2);
        params.serial_number = Some(SerialNumber::from(vec![self.serial]));

        let mut dn = DistinguishedName::new();
        if let Some(cn) = self.common_name.or_else(|| self.sans.first().cloned()) {
            dn.push(DnType::CommonName, cn);
        }
        dn.push(DnType::OrganizationName, "Test Issuer");
        params.distinguished_name = dn;

        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        IssuedCert {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        }
    }
}
