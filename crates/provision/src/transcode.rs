//! Certificate output formats

use crate::error::{ProvisionError, Result};
use openssl::pkcs12::Pkcs12;
use openssl::pkey::PKey;
use openssl::stack::Stack;
use openssl::x509::X509;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Pem,
    /// PKCS#12 archive holding key, leaf and chain
    Pfx,
}

impl FromStr for OutputFormat {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pem" => Ok(Self::Pem),
            "pfx" | "p12" | "pkcs12" => Ok(Self::Pfx),
            "jks" => Err(ProvisionError::UnsupportedConfiguration(
                "JKS output is not supported, use pfx".to_string(),
            )),
            other => Err(ProvisionError::UnsupportedConfiguration(format!(
                "unknown certificate output format '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pem => write!(f, "pem"),
            Self::Pfx => write!(f, "pfx"),
        }
    }
}

fn openssl_err(e: openssl::error::ErrorStack) -> ProvisionError {
    ProvisionError::Certificate(e.to_string())
}

/// Bundle a PEM chain and key into a DER-encoded PKCS#12 archive
pub fn pem_to_pfx(cert_pem: &str, key_pem: &str, password: &str, friendly_name: &str) -> Result<Vec<u8>> {
    let mut certs = X509::stack_from_pem(cert_pem.as_bytes()).map_err(openssl_err)?.into_iter();
    let leaf = certs
        .next()
        .ok_or_else(|| ProvisionError::Certificate("No certificate in PEM input".to_string()))?;
    let key = PKey::private_key_from_pem(key_pem.as_bytes()).map_err(openssl_err)?;

    let mut chain = Stack::new().map_err(openssl_err)?;
    for cert in certs {
        chain.push(cert).map_err(openssl_err)?;
    }

    let pfx = Pkcs12::builder()
        .name(friendly_name)
        .pkey(&key)
        .cert(&leaf)
        .ca(chain)
        .build2(password)
        .map_err(openssl_err)?;

    pfx.to_der().map_err(openssl_err)
}
