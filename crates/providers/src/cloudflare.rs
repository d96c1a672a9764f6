//! Cloudflare DNS backend
//!
//! Manages DNS-01 TXT records through the Cloudflare v4 API.
//! API documentation: <https://developers.cloudflare.com/api/>

use std::time::Duration;

use async_trait::async_trait;
use provision::dns01::relative_name;
use provision::{DnsBackend, DnsRecord, Page, PageRequest, ProvisionError, Result, Zone};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Cloudflare API base URL
pub const CLOUDFLARE_API_BASE: &str = "https://api.cloudflare.com/client/v4";

/// Largest page Cloudflare accepts for zone listings
const CLOUDFLARE_PAGE_SIZE: u32 = 50;

/// Cloudflare DNS backend
#[derive(Debug, Clone)]
pub struct CloudflareDns {
    client: Client,
    token: String,
    base_url: String,
}

impl CloudflareDns {
    /// Create a backend authenticating with a scoped API token
    pub fn new(token: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProvisionError::backend("create http client", e))?;

        Ok(Self {
            client,
            token: token.to_string(),
            base_url: CLOUDFLARE_API_BASE.to_string(),
        })
    }

    /// Point the backend at another API endpoint
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn send<T: DeserializeOwned>(&self, operation: &str, request: RequestBuilder) -> Result<Envelope<T>> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| ProvisionError::backend(operation, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProvisionError::backend(operation, format!("HTTP {} - {}", status, body)));
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| ProvisionError::backend(operation, format!("invalid response: {}", e)))?;

        if !envelope.success {
            return Err(ProvisionError::backend(operation, envelope.error_summary()));
        }
        Ok(envelope)
    }

    fn full_name(name: &str, zone: &Zone) -> String {
        if name == "@" {
            zone.name.clone()
        } else {
            format!("{}.{}", name, zone.name)
        }
    }
}

#[async_trait]
impl DnsBackend for CloudflareDns {
    fn name(&self) -> &str {
        "cloudflare"
    }

    fn page_size(&self) -> u32 {
        CLOUDFLARE_PAGE_SIZE
    }

    async fn list_zones(&self, page: PageRequest) -> Result<Page<Zone>> {
        let request = self
            .client
            .get(format!("{}/zones", self.base_url))
            .query(&[("page", page.number), ("per_page", page.size)]);
        let envelope: Envelope<Vec<CloudflareZone>> = self.send("list zones", request).await?;

        let zones: Vec<Zone> = envelope
            .result
            .unwrap_or_default()
            .into_iter()
            .map(|z| Zone { id: z.id, name: z.name })
            .collect();
        trace!(page = page.number, count = zones.len(), "Listed Cloudflare zones");

        Ok(with_result_info(Page::new(zones), envelope.result_info))
    }

    async fn create_txt_record(&self, zone: &Zone, name: &str, value: &str, ttl: u32) -> Result<DnsRecord> {
        let body = CreateRecord {
            record_type: "TXT",
            name: Self::full_name(name, zone),
            content: value,
            ttl,
        };
        let request = self
            .client
            .post(format!("{}/zones/{}/dns_records", self.base_url, zone.id))
            .json(&body);
        let envelope: Envelope<CloudflareRecord> = self.send("create record", request).await?;

        let record = envelope
            .result
            .ok_or_else(|| ProvisionError::backend("create record", "response carried no record"))?;
        debug!(zone = %zone.name, record_id = %record.id, name = %body.name, "Created Cloudflare TXT record");

        Ok(DnsRecord::txt(Some(record.id), name, value))
    }

    async fn list_records(&self, zone: &Zone, page: PageRequest) -> Result<Page<DnsRecord>> {
        let request = self
            .client
            .get(format!("{}/zones/{}/dns_records", self.base_url, zone.id))
            .query(&[("type", "TXT")])
            .query(&[("page", page.number), ("per_page", page.size)]);
        let envelope: Envelope<Vec<CloudflareRecord>> = self.send("list records", request).await?;

        let records = envelope
            .result
            .unwrap_or_default()
            .into_iter()
            .map(|r| DnsRecord {
                id: Some(r.id),
                record_type: r.record_type,
                name: relative_name(&r.name, &zone.name),
                value: r.content,
            })
            .collect();

        Ok(with_result_info(Page::new(records), envelope.result_info))
    }

    async fn delete_record(&self, zone: &Zone, record: &DnsRecord) -> Result<()> {
        let Some(record_id) = record.id.as_deref() else {
            return Err(ProvisionError::backend("delete record", "record has no id"));
        };

        let response = self
            .client
            .delete(format!("{}/zones/{}/dns_records/{}", self.base_url, zone.id, record_id))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| ProvisionError::backend("delete record", e))?;

        // Already gone
        if response.status() == StatusCode::NOT_FOUND {
            debug!(zone = %zone.name, record_id = %record_id, "Cloudflare record already deleted");
            return Ok(());
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProvisionError::backend(
                "delete record",
                format!("HTTP {} - {}", status, body),
            ));
        }

        debug!(zone = %zone.name, record_id = %record_id, "Deleted Cloudflare TXT record");
        Ok(())
    }
}

fn with_result_info<T>(page: Page<T>, info: Option<ResultInfo>) -> Page<T> {
    let Some(info) = info else {
        return page;
    };
    let page = match info.total_count {
        Some(total) => page.with_total_items(total),
        None => page,
    };
    match info.total_pages {
        Some(pages) => page.with_total_pages(pages),
        None => page,
    }
}

// API types

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
    result_info: Option<ResultInfo>,
}

impl<T> Envelope<T> {
    fn error_summary(&self) -> String {
        if self.errors.is_empty() {
            return "request unsuccessful".to_string();
        }
        self.errors
            .iter()
            .map(|e| format!("{} ({})", e.message, e.code))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ResultInfo {
    total_count: Option<u64>,
    total_pages: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CloudflareZone {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct CloudflareRecord {
    id: String,
    #[serde(rename = "type")]
    record_type: String,
    name: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct CreateRecord<'a> {
    #[serde(rename = "type")]
    record_type: &'static str,
    name: String,
    content: &'a str,
    ttl: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_name() {
        let zone = Zone {
            id: "z1".to_string(),
            name: "example.com".to_string(),
        };
        assert_eq!(CloudflareDns::full_name("_acme-challenge", &zone), "_acme-challenge.example.com");
        assert_eq!(CloudflareDns::full_name("@", &zone), "example.com");
    }

    #[test]
    fn test_error_summary() {
        let envelope: Envelope<()> = serde_json::from_str(
            r#"{"success":false,"errors":[{"code":9109,"message":"Invalid access token"}],"result":null}"#,
        )
        .unwrap();
        assert_eq!(envelope.error_summary(), "Invalid access token (9109)");
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let dns = CloudflareDns::new("t", Duration::from_secs(5))
            .unwrap()
            .with_base_url("http://127.0.0.1:9/");
        assert_eq!(dns.base_url, "http://127.0.0.1:9");
    }
}
