//! Certificate manager providers
//!
//! A certificate manager stores certificates in a backend's own inventory so
//! deployers can reference them by id. [`InventoryCertificateManager`] adds
//! fingerprint deduplication on top of any [`CertificateInventory`].

use crate::error::{ProvisionError, Result};
use crate::fingerprint::{find_matching, CertificateFingerprint, CertificateSummary, MatchProfile};
use crate::paging::{Page, PageRequest, DEFAULT_PAGE_SIZE};
use crate::poll::{ensure_active, run_or_cancel};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Identifies a certificate stored by a manager
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadResult {
    pub cert_id: String,
    pub cert_name: String,
    /// Backend-specific extras (ARNs, regions, ...)
    pub extended_data: BTreeMap<String, String>,
}

impl UploadResult {
    pub fn new(cert_id: impl Into<String>, cert_name: impl Into<String>) -> Self {
        Self {
            cert_id: cert_id.into(),
            cert_name: cert_name.into(),
            extended_data: BTreeMap::new(),
        }
    }
}

impl From<CertificateSummary> for UploadResult {
    fn from(summary: CertificateSummary) -> Self {
        Self::new(summary.id, summary.name)
    }
}

/// Outcome of [`CertificateManager::replace`]
///
/// Carries the backend's own id and name for the overwritten certificate,
/// which may differ from the id-or-name the caller passed in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperateResult {
    pub cert_id: String,
    pub cert_name: String,
}

impl OperateResult {
    pub fn new(cert_id: impl Into<String>, cert_name: impl Into<String>) -> Self {
        Self {
            cert_id: cert_id.into(),
            cert_name: cert_name.into(),
        }
    }
}

impl From<OperateResult> for UploadResult {
    fn from(result: OperateResult) -> Self {
        Self::new(result.cert_id, result.cert_name)
    }
}

#[async_trait]
pub trait CertificateManager: Send + Sync {
    fn name(&self) -> &str;

    /// Store a certificate, reusing an identical one already present
    async fn upload(&self, cancel: &CancellationToken, cert_pem: &str, key_pem: &str) -> Result<UploadResult>;

    /// Overwrite the certificate stored under `cert_id_or_name`, returning
    /// its resolved identity
    async fn replace(
        &self,
        cancel: &CancellationToken,
        cert_id_or_name: &str,
        cert_pem: &str,
        key_pem: &str,
    ) -> Result<OperateResult> {
        let _ = (cancel, cert_id_or_name, cert_pem, key_pem);
        Err(ProvisionError::UnsupportedConfiguration(format!(
            "certificate manager '{}' cannot replace certificates",
            self.name()
        )))
    }
}

/// Certificate storage API of a backend
#[async_trait]
pub trait CertificateInventory: Send + Sync {
    fn name(&self) -> &str;

    /// Fields this backend reports for stored certificates
    fn match_profile(&self) -> MatchProfile;

    fn page_size(&self) -> u32 {
        DEFAULT_PAGE_SIZE
    }

    async fn list_certificates(&self, page: PageRequest) -> Result<Page<CertificateSummary>>;

    async fn import_certificate(&self, name: &str, cert_pem: &str, key_pem: &str) -> Result<UploadResult>;

    /// Overwrite a stored certificate located by id or name
    async fn replace_certificate(&self, id_or_name: &str, cert_pem: &str, key_pem: &str) -> Result<OperateResult> {
        let _ = (id_or_name, cert_pem, key_pem);
        Err(ProvisionError::UnsupportedConfiguration(format!(
            "certificate inventory '{}' cannot replace certificates",
            self.name()
        )))
    }
}

/// Name for a newly imported certificate: `<prefix>-<unix millis>`
pub fn certificate_name(prefix: &str) -> String {
    format!("{}-{}", prefix, Utc::now().timestamp_millis())
}

/// Deduplicating [`CertificateManager`] over a [`CertificateInventory`]
pub struct InventoryCertificateManager<I> {
    inventory: I,
    name_prefix: String,
}

impl<I: CertificateInventory> InventoryCertificateManager<I> {
    pub fn new(inventory: I, name_prefix: impl Into<String>) -> Self {
        Self {
            inventory,
            name_prefix: name_prefix.into(),
        }
    }

    pub fn inventory(&self) -> &I {
        &self.inventory
    }

    /// Find an inventory entry for the same certificate
    pub async fn find_existing(
        &self,
        cancel: &CancellationToken,
        fingerprint: &CertificateFingerprint,
    ) -> Result<Option<CertificateSummary>> {
        let profile = self.inventory.match_profile();
        find_matching(cancel, fingerprint, &profile, self.inventory.page_size(), |page| {
            self.inventory.list_certificates(page)
        })
        .await
    }
}

#[async_trait]
impl<I: CertificateInventory> CertificateManager for InventoryCertificateManager<I> {
    fn name(&self) -> &str {
        self.inventory.name()
    }

    async fn upload(&self, cancel: &CancellationToken, cert_pem: &str, key_pem: &str) -> Result<UploadResult> {
        let fingerprint = CertificateFingerprint::from_pem(cert_pem)?;

        if let Some(existing) = self.find_existing(cancel, &fingerprint).await? {
            info!(
                manager = %self.inventory.name(),
                cert_id = %existing.id,
                serial = %fingerprint.serial_number_hex,
                "Certificate already uploaded, reusing"
            );
            return Ok(existing.into());
        }

        ensure_active(cancel)?;
        let name = certificate_name(&self.name_prefix);
        debug!(manager = %self.inventory.name(), name = %name, "Importing certificate");
        let uploaded = run_or_cancel(cancel, self.inventory.import_certificate(&name, cert_pem, key_pem)).await?;

        info!(
            manager = %self.inventory.name(),
            cert_id = %uploaded.cert_id,
            name = %uploaded.cert_name,
            "Certificate uploaded"
        );
        Ok(uploaded)
    }

    async fn replace(
        &self,
        cancel: &CancellationToken,
        cert_id_or_name: &str,
        cert_pem: &str,
        key_pem: &str,
    ) -> Result<OperateResult> {
        CertificateFingerprint::from_pem(cert_pem)?;
        ensure_active(cancel)?;

        let replaced = run_or_cancel(
            cancel,
            self.inventory.replace_certificate(cert_id_or_name, cert_pem, key_pem),
        )
        .await?;
        info!(
            manager = %self.inventory.name(),
            cert = %cert_id_or_name,
            cert_id = %replaced.cert_id,
            name = %replaced.cert_name,
            "Certificate replaced"
        );
        Ok(replaced)
    }
}
