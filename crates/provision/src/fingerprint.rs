//! Certificate fingerprints and inventory deduplication
//!
//! Many certificate backends assign a fresh id on every upload and expose no
//! stable natural key. To avoid uploading the same certificate twice we
//! compare a [`CertificateFingerprint`] of the new certificate against every
//! inventory entry, eliminating entries field by field. Which fields can be
//! compared depends on what the backend reports, described by a
//! [`MatchProfile`].

use crate::error::{ProvisionError, Result};
use crate::paging::{Page, PageRequest, Pages};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use x509_parser::prelude::*;

/// Signature algorithm of a certificate
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SignatureAlgorithm {
    Sha256WithRsa,
    Sha384WithRsa,
    Sha512WithRsa,
    EcdsaWithSha256,
    EcdsaWithSha384,
    EcdsaWithSha512,
    Ed25519,
    /// Any other algorithm, by dotted OID
    Unknown(String),
}

impl SignatureAlgorithm {
    pub fn from_oid(oid: &str) -> Self {
        match oid {
            "1.2.840.113549.1.1.11" => Self::Sha256WithRsa,
            "1.2.840.113549.1.1.12" => Self::Sha384WithRsa,
            "1.2.840.113549.1.1.13" => Self::Sha512WithRsa,
            "1.2.840.10045.4.3.2" => Self::EcdsaWithSha256,
            "1.2.840.10045.4.3.3" => Self::EcdsaWithSha384,
            "1.2.840.10045.4.3.4" => Self::EcdsaWithSha512,
            "1.3.101.112" => Self::Ed25519,
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// Comparison key derived from a parsed certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateFingerprint {
    pub common_name: Option<String>,
    pub serial_number_hex: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// DNS names from the SAN extension, lowercase
    pub san_set: BTreeSet<String>,
    pub issuer_org: Option<String>,
    pub signature_algorithm: SignatureAlgorithm,
    /// DER encoding of the leaf certificate
    pub der: Vec<u8>,
}

impl CertificateFingerprint {
    /// Fingerprint the first certificate (the leaf) of a PEM chain
    pub fn from_pem(cert_pem: &str) -> Result<Self> {
        let blocks = ::pem::parse_many(cert_pem)
            .map_err(|e| ProvisionError::Certificate(format!("Failed to parse PEM: {}", e)))?;
        let leaf = blocks
            .iter()
            .find(|block| block.tag() == "CERTIFICATE")
            .ok_or_else(|| ProvisionError::Certificate("No CERTIFICATE block in PEM input".to_string()))?;

        Self::from_der(leaf.contents())
    }

    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| ProvisionError::Certificate(format!("Failed to parse X509: {}", e)))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);

        let issuer_org = cert
            .issuer()
            .iter_organization()
            .next()
            .and_then(|o| o.as_str().ok())
            .map(str::to_string);

        let mut san_set = BTreeSet::new();
        if let Ok(Some(san_ext)) = cert.subject_alternative_name() {
            for name in &san_ext.value.general_names {
                if let GeneralName::DNSName(dns) = name {
                    san_set.insert(dns.to_ascii_lowercase());
                }
            }
        }

        let serial_number_hex = cert
            .tbs_certificate
            .raw_serial()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();

        let not_before = to_utc(cert.validity().not_before)?;
        let not_after = to_utc(cert.validity().not_after)?;
        let signature_algorithm = SignatureAlgorithm::from_oid(&cert.signature_algorithm.algorithm.to_id_string());

        Ok(Self {
            common_name,
            serial_number_hex,
            not_before,
            not_after,
            san_set,
            issuer_org,
            signature_algorithm,
            der: der.to_vec(),
        })
    }

    /// Whether the certificate is valid for `hostname`
    ///
    /// SAN entries are matched exactly or as single-label wildcards. The
    /// common name is never consulted, so a certificate without SANs
    /// verifies no hostname.
    pub fn verify_hostname(&self, hostname: &str) -> bool {
        let host = hostname.trim_end_matches('.').to_ascii_lowercase();
        if host.is_empty() {
            return false;
        }

        self.san_set.iter().any(|pattern| name_matches(pattern, &host))
    }
}

fn to_utc(time: ASN1Time) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(time.timestamp(), 0)
        .ok_or_else(|| ProvisionError::Certificate(format!("Validity time out of range: {}", time)))
}

fn name_matches(pattern: &str, host: &str) -> bool {
    match pattern.strip_prefix("*.") {
        Some(suffix) => host
            .split_once('.')
            .is_some_and(|(label, rest)| !label.is_empty() && rest == suffix),
        None => pattern == host,
    }
}

/// One entry of a backend's certificate inventory
///
/// Fields the backend does not report stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateSummary {
    pub id: String,
    pub name: String,
    pub common_name: Option<String>,
    pub san_set: Option<BTreeSet<String>>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    pub issuer_org: Option<String>,
    /// Algorithm in the backend's own naming
    pub signature_algorithm: Option<String>,
    pub certificate_pem: Option<String>,
}

/// Which name a backend records for a certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameField {
    CommonName,
    SanSet,
}

/// Maps a signature algorithm to a backend's name for it
pub type AlgorithmMapper = fn(&SignatureAlgorithm) -> Option<&'static str>;

/// The comparisons a backend's inventory supports
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchProfile {
    pub validity: bool,
    pub name: Option<NameField>,
    pub issuer_org: bool,
    pub signature_algorithm: Option<AlgorithmMapper>,
    pub certificate_bytes: bool,
}

impl MatchProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validity(mut self) -> Self {
        self.validity = true;
        self
    }

    pub fn name(mut self, field: NameField) -> Self {
        self.name = Some(field);
        self
    }

    pub fn issuer_org(mut self) -> Self {
        self.issuer_org = true;
        self
    }

    pub fn signature_algorithm(mut self, mapper: AlgorithmMapper) -> Self {
        self.signature_algorithm = Some(mapper);
        self
    }

    pub fn certificate_bytes(mut self) -> Self {
        self.certificate_bytes = true;
        self
    }

    /// True when no comparison is enabled
    pub fn is_empty(&self) -> bool {
        !self.validity
            && self.name.is_none()
            && !self.issuer_org
            && self.signature_algorithm.is_none()
            && !self.certificate_bytes
    }
}

/// Whether `summary` represents the certificate behind `fp`
pub fn matches(fp: &CertificateFingerprint, summary: &CertificateSummary, profile: &MatchProfile) -> bool {
    if profile.is_empty() {
        return false;
    }

    if profile.validity
        && (summary.not_before != Some(fp.not_before) || summary.not_after != Some(fp.not_after))
    {
        return false;
    }

    match profile.name {
        Some(NameField::CommonName) => {
            let (Some(ours), Some(theirs)) = (fp.common_name.as_deref(), summary.common_name.as_deref()) else {
                return false;
            };
            if !ours.eq_ignore_ascii_case(theirs) {
                return false;
            }
        }
        Some(NameField::SanSet) => {
            let Some(theirs) = &summary.san_set else {
                return false;
            };
            let theirs: BTreeSet<String> = theirs.iter().map(|s| s.to_ascii_lowercase()).collect();
            if theirs != fp.san_set {
                return false;
            }
        }
        None => {}
    }

    if profile.issuer_org {
        let (Some(ours), Some(theirs)) = (fp.issuer_org.as_deref(), summary.issuer_org.as_deref()) else {
            return false;
        };
        if ours != theirs {
            return false;
        }
    }

    if let Some(mapper) = profile.signature_algorithm {
        let (Some(ours), Some(theirs)) = (mapper(&fp.signature_algorithm), summary.signature_algorithm.as_deref())
        else {
            return false;
        };
        if !ours.eq_ignore_ascii_case(theirs) {
            return false;
        }
    }

    if profile.certificate_bytes {
        let Some(pem) = &summary.certificate_pem else {
            return false;
        };
        match CertificateFingerprint::from_pem(pem) {
            Ok(theirs) if theirs.der == fp.der => {}
            _ => return false,
        }
    }

    true
}

/// Scan a paginated inventory for an entry matching `fp`
pub async fn find_matching<F, Fut>(
    cancel: &CancellationToken,
    fp: &CertificateFingerprint,
    profile: &MatchProfile,
    page_size: u32,
    fetch: F,
) -> Result<Option<CertificateSummary>>
where
    F: FnMut(PageRequest) -> Fut,
    Fut: Future<Output = Result<Page<CertificateSummary>>>,
{
    if profile.is_empty() {
        debug!("Match profile enables no comparison, skipping inventory scan");
        return Ok(None);
    }

    Pages::new(page_size, fetch)
        .with_cancel(cancel)
        .find_map(|summary| {
            let found = matches(fp, &summary, profile);
            trace!(id = %summary.id, matched = found, "Compared inventory certificate");
            found.then_some(summary)
        })
        .await
}
