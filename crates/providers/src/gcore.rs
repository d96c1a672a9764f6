//! Gcore CDN backend
//!
//! Certificates live in the CDN's SSL data store (`/cdn/sslData`); CDN
//! resources (`/cdn/resources`) are the deploy targets, addressed by their
//! CNAME. Neither listing is paginated by the API.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use provision::{
    BackendDomain, BindOutcome, CertificateInventory, CertificateSummary, DomainInventory, MatchProfile, NameField,
    OperateResult, Page, PageRequest, ProvisionError, Result, TargetBinder, UploadResult,
};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, trace};

/// Gcore API base URL
pub const GCORE_API_BASE: &str = "https://api.gcore.com";

/// Authenticated Gcore API client shared by the certificate and CDN halves
#[derive(Debug, Clone)]
pub struct GcoreClient {
    client: Client,
    token: String,
    base_url: String,
}

impl GcoreClient {
    pub fn new(token: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProvisionError::backend("create http client", e))?;

        Ok(Self {
            client,
            token: token.to_string(),
            base_url: GCORE_API_BASE.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(&self, operation: &str, request: RequestBuilder) -> Result<T> {
        let response = request
            .header("Authorization", format!("APIKey {}", self.token))
            .send()
            .await
            .map_err(|e| ProvisionError::backend(operation, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProvisionError::backend(operation, format!("HTTP {} - {}", status, body)));
        }

        response
            .json()
            .await
            .map_err(|e| ProvisionError::backend(operation, format!("invalid response: {}", e)))
    }

    async fn ssl_data(&self) -> Result<Vec<SslData>> {
        self.send("list certificates", self.client.get(self.url("/cdn/sslData")))
            .await
    }

    async fn resources(&self) -> Result<Vec<CdnResource>> {
        self.send("list resources", self.client.get(self.url("/cdn/resources")))
            .await
    }
}

/// Gcore CDN certificate store
#[derive(Debug, Clone)]
pub struct GcoreCertificates {
    api: GcoreClient,
}

impl GcoreCertificates {
    pub fn new(api: GcoreClient) -> Self {
        Self { api }
    }

    /// Find a stored certificate by numeric id or by name
    async fn lookup(&self, id_or_name: &str) -> Result<SslData> {
        let id = id_or_name.parse::<u64>().ok();
        self.api
            .ssl_data()
            .await?
            .into_iter()
            .filter(|c| !c.deleted)
            .find(|c| Some(c.id) == id || c.name == id_or_name)
            .ok_or_else(|| {
                ProvisionError::backend(
                    "replace certificate",
                    format!("no certificate with id or name '{}'", id_or_name),
                )
            })
    }
}

#[async_trait]
impl CertificateInventory for GcoreCertificates {
    fn name(&self) -> &str {
        "gcore-cdn"
    }

    fn match_profile(&self) -> MatchProfile {
        MatchProfile::new().validity().name(NameField::CommonName)
    }

    async fn list_certificates(&self, page: PageRequest) -> Result<Page<CertificateSummary>> {
        // The store has no paging; only the first request returns data
        if page.number > 1 {
            return Ok(Page::complete(Vec::new()));
        }

        let summaries: Vec<CertificateSummary> = self
            .api
            .ssl_data()
            .await?
            .into_iter()
            .filter(|c| !c.deleted)
            .map(SslData::into_summary)
            .collect();
        trace!(count = summaries.len(), "Listed Gcore certificates");

        Ok(Page::complete(summaries))
    }

    async fn import_certificate(&self, name: &str, cert_pem: &str, key_pem: &str) -> Result<UploadResult> {
        let body = SslDataRequest {
            name,
            ssl_certificate: cert_pem,
            ssl_private_key: key_pem,
            validate_root_ca: false,
        };
        let created: SslData = self
            .api
            .send(
                "upload certificate",
                self.api.client.post(self.api.url("/cdn/sslData")).json(&body),
            )
            .await?;
        debug!(cert_id = created.id, cert_name = %created.name, "Uploaded certificate to Gcore");

        Ok(UploadResult::new(created.id.to_string(), created.name))
    }

    async fn replace_certificate(&self, id_or_name: &str, cert_pem: &str, key_pem: &str) -> Result<OperateResult> {
        let existing = self.lookup(id_or_name).await?;
        let id = existing.id;
        let body = SslDataRequest {
            name: &existing.name,
            ssl_certificate: cert_pem,
            ssl_private_key: key_pem,
            validate_root_ca: false,
        };
        let _: serde_json::Value = self
            .api
            .send(
                "replace certificate",
                self.api
                    .client
                    .put(self.api.url(&format!("/cdn/sslData/{}", id)))
                    .json(&body),
            )
            .await?;
        debug!(cert_id = id, cert_name = %existing.name, "Replaced Gcore certificate");

        Ok(OperateResult::new(id.to_string(), existing.name))
    }
}

/// Gcore CDN resources as deploy targets
#[derive(Debug, Clone)]
pub struct GcoreCdn {
    api: GcoreClient,
}

impl GcoreCdn {
    pub fn new(api: GcoreClient) -> Self {
        Self { api }
    }

    async fn resource_id(&self, cname: &str) -> Result<u64> {
        self.api
            .resources()
            .await?
            .into_iter()
            .find(|r| r.cname.eq_ignore_ascii_case(cname))
            .map(|r| r.id)
            .ok_or_else(|| ProvisionError::backend("bind certificate", format!("no CDN resource for '{}'", cname)))
    }
}

#[async_trait]
impl DomainInventory for GcoreCdn {
    async fn list_domains(&self, page: PageRequest) -> Result<Page<BackendDomain>> {
        if page.number > 1 {
            return Ok(Page::complete(Vec::new()));
        }

        let domains = self
            .api
            .resources()
            .await?
            .into_iter()
            .map(|r| BackendDomain {
                name: r.cname,
                active: r.active,
            })
            .collect();
        Ok(Page::complete(domains))
    }
}

#[async_trait]
impl TargetBinder for GcoreCdn {
    fn name(&self) -> &str {
        "gcore-cdn"
    }

    async fn bind_certificate(&self, target: &str, certificate: &UploadResult) -> Result<BindOutcome> {
        let cert_id: u64 = certificate.cert_id.parse().map_err(|_| {
            ProvisionError::backend(
                "bind certificate",
                format!("certificate id '{}' is not numeric", certificate.cert_id),
            )
        })?;
        let resource_id = self.resource_id(target).await?;

        let _: serde_json::Value = self
            .api
            .send(
                "bind certificate",
                self.api
                    .client
                    .patch(self.api.url(&format!("/cdn/resources/{}", resource_id)))
                    .json(&json!({ "sslData": cert_id, "sslEnabled": true })),
            )
            .await?;
        debug!(resource_id, cert_id, cname = %target, "Bound certificate to Gcore CDN resource");

        Ok(BindOutcome::Done)
    }
}

// API types

#[derive(Debug, Deserialize)]
struct SslData {
    id: u64,
    name: String,
    #[serde(default)]
    deleted: bool,
    cert_subject_cn: Option<String>,
    validity_not_before: Option<String>,
    validity_not_after: Option<String>,
}

impl SslData {
    fn into_summary(self) -> CertificateSummary {
        CertificateSummary {
            id: self.id.to_string(),
            name: self.name,
            common_name: self.cert_subject_cn,
            not_before: self.validity_not_before.as_deref().and_then(parse_timestamp),
            not_after: self.validity_not_after.as_deref().and_then(parse_timestamp),
            ..Default::default()
        }
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SslDataRequest<'a> {
    name: &'a str,
    ssl_certificate: &'a str,
    ssl_private_key: &'a str,
    #[serde(rename = "validate_root_ca")]
    validate_root_ca: bool,
}

#[derive(Debug, Deserialize)]
struct CdnResource {
    id: u64,
    cname: String,
    #[serde(default)]
    active: bool,
}
