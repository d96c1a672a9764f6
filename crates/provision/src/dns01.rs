//! DNS-01 record naming and zone resolution

use crate::challenge::Zone;
use crate::error::{ProvisionError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Label prepended to the domain for DNS-01 TXT records
pub const ACME_CHALLENGE_LABEL: &str = "_acme-challenge";

/// The TXT record an ACME server expects for a DNS-01 challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeRecord {
    /// Fully qualified record name, lowercase, no trailing dot
    pub fqdn: String,
    /// base64url(SHA-256(key authorization)), unpadded
    pub value: String,
}

/// Build the DNS-01 record for `domain` and a key authorization
pub fn challenge_record(domain: &str, key_authorization: &str) -> ChallengeRecord {
    ChallengeRecord {
        fqdn: format!("{}.{}", ACME_CHALLENGE_LABEL, normalize_domain(domain)),
        value: challenge_value(key_authorization),
    }
}

pub fn challenge_value(key_authorization: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(key_authorization.as_bytes()))
}

/// Strip a wildcard prefix and trailing dot, lowercase the rest
pub fn normalize_domain(domain: &str) -> String {
    let domain = domain.strip_prefix("*.").unwrap_or(domain);
    domain.trim_end_matches('.').to_ascii_lowercase()
}

/// Find the zone owning `fqdn`, preferring the longest (most specific) match
pub fn find_zone<'a>(fqdn: &str, zones: &'a [Zone]) -> Result<&'a Zone> {
    let fqdn = normalize_domain(fqdn);
    let mut candidate = fqdn.as_str();

    loop {
        if let Some(zone) = zones.iter().find(|z| normalize_domain(&z.name) == candidate) {
            return Ok(zone);
        }
        match candidate.split_once('.') {
            Some((_, parent)) if !parent.is_empty() => candidate = parent,
            _ => break,
        }
    }

    Err(ProvisionError::ZoneNotFound { fqdn })
}

/// Name of `fqdn` relative to `zone`; `@` for the apex
pub fn relative_name(fqdn: &str, zone: &str) -> String {
    let fqdn = normalize_domain(fqdn);
    let zone = normalize_domain(zone);

    if fqdn == zone {
        return "@".to_string();
    }
    match fqdn.strip_suffix(&zone).and_then(|s| s.strip_suffix('.')) {
        Some(relative) => relative.to_string(),
        None => fqdn,
    }
}
