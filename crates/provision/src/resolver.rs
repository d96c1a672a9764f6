//! Deploy target resolution
//!
//! Expands a configured [`DomainSpec`] into the concrete domains a deployer
//! binds the certificate to.

use crate::error::{ProvisionError, Result};
use crate::fingerprint::CertificateFingerprint;
use crate::paging::{Page, PageRequest, Pages, DEFAULT_PAGE_SIZE};
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// How a [`DomainSpec`] value selects targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPattern {
    /// The value itself is the only target
    Exact,
    /// Backend domains under the `*.` suffix of the value
    Wildcard,
    /// Backend domains the certificate is valid for
    CertSan,
}

impl FromStr for MatchPattern {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "exact" => Ok(Self::Exact),
            "wildcard" => Ok(Self::Wildcard),
            "certsan" => Ok(Self::CertSan),
            other => Err(ProvisionError::UnsupportedConfiguration(format!(
                "unknown domain match pattern '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for MatchPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact => write!(f, "exact"),
            Self::Wildcard => write!(f, "wildcard"),
            Self::CertSan => write!(f, "certsan"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainSpec {
    pub pattern: MatchPattern,
    pub value: String,
}

impl DomainSpec {
    /// Parse a configured pattern name and value
    pub fn parse(pattern: &str, value: &str) -> Result<Self> {
        let pattern: MatchPattern = pattern.parse()?;
        let value = value.trim().to_string();

        match pattern {
            MatchPattern::Exact if value.is_empty() => Err(ProvisionError::UnsupportedConfiguration(
                "exact domain match requires a domain".to_string(),
            )),
            MatchPattern::Wildcard if !value.starts_with("*.") || value.len() <= 2 => {
                Err(ProvisionError::UnsupportedConfiguration(format!(
                    "wildcard domain '{}' must start with '*.'",
                    value
                )))
            }
            _ => Ok(Self { pattern, value }),
        }
    }

    pub fn exact(domain: impl Into<String>) -> Self {
        Self {
            pattern: MatchPattern::Exact,
            value: domain.into(),
        }
    }

    pub fn wildcard(domain: impl Into<String>) -> Self {
        Self {
            pattern: MatchPattern::Wildcard,
            value: domain.into(),
        }
    }

    pub fn cert_san() -> Self {
        Self {
            pattern: MatchPattern::CertSan,
            value: String::new(),
        }
    }
}

/// A domain (or listener) known to a deployment backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendDomain {
    pub name: String,
    /// Offline or disabled entries are never deploy targets
    pub active: bool,
}

impl BackendDomain {
    pub fn active(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            active: true,
        }
    }
}

/// Domain listing of a deployment backend
#[async_trait]
pub trait DomainInventory: Send + Sync {
    fn domain_page_size(&self) -> u32 {
        DEFAULT_PAGE_SIZE
    }

    async fn list_domains(&self, page: PageRequest) -> Result<Page<BackendDomain>>;
}

#[derive(Debug, Clone)]
pub struct DomainResolver {
    spec: DomainSpec,
    allow_empty: bool,
}

impl DomainResolver {
    pub fn new(spec: DomainSpec) -> Self {
        Self {
            spec,
            allow_empty: false,
        }
    }

    /// Treat an empty wildcard/certsan result as a no-op instead of an error
    pub fn allow_empty(mut self, allow: bool) -> Self {
        self.allow_empty = allow;
        self
    }

    pub fn spec(&self) -> &DomainSpec {
        &self.spec
    }

    /// Resolve deploy targets, deduplicated in inventory order
    pub async fn resolve<D>(
        &self,
        cancel: &CancellationToken,
        inventory: &D,
        fingerprint: &CertificateFingerprint,
    ) -> Result<Vec<String>>
    where
        D: DomainInventory + ?Sized,
    {
        if self.spec.pattern == MatchPattern::Exact {
            return Ok(vec![self.spec.value.clone()]);
        }

        let suffix = self
            .spec
            .value
            .strip_prefix('*')
            .unwrap_or(&self.spec.value)
            .to_ascii_lowercase();

        let mut pages = Pages::new(inventory.domain_page_size(), |page| inventory.list_domains(page)).with_cancel(cancel);
        let mut seen = HashSet::new();
        let mut targets = Vec::new();

        while let Some(domains) = pages.next_page().await? {
            for domain in domains {
                if !domain.active {
                    debug!(domain = %domain.name, "Skipping inactive domain");
                    continue;
                }
                let keep = match self.spec.pattern {
                    MatchPattern::Wildcard => domain.name.to_ascii_lowercase().ends_with(&suffix),
                    MatchPattern::CertSan => fingerprint.verify_hostname(&domain.name),
                    MatchPattern::Exact => false,
                };
                if keep && seen.insert(domain.name.to_ascii_lowercase()) {
                    targets.push(domain.name);
                }
            }
        }

        if targets.is_empty() {
            if self.allow_empty {
                info!(
                    pattern = %self.spec.pattern,
                    value = %self.spec.value,
                    "No deploy targets resolved, nothing to do"
                );
                return Ok(targets);
            }
            return Err(ProvisionError::NoTargetsResolved {
                pattern: self.spec.pattern.to_string(),
                value: self.spec.value.clone(),
            });
        }

        debug!(pattern = %self.spec.pattern, count = targets.len(), "Resolved deploy targets");
        Ok(targets)
    }
}
