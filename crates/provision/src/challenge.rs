//! ACME challenge providers
//!
//! A [`ChallengeProvider`] makes a challenge answer visible (`present`) and
//! withdraws it again (`clean_up`). [`Dns01Provider`] implements the DNS-01
//! flow once, over any [`DnsBackend`]: it resolves the owning zone, creates
//! the TXT record, and remembers how to delete it in a [`RecordTracker`].

use crate::dns01::{challenge_record, find_zone, relative_name};
use crate::error::{ProvisionError, Result};
use crate::paging::{Page, PageRequest, Pages, DEFAULT_PAGE_SIZE};
use crate::poll::PollSettings;
use crate::tracker::RecordTracker;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default TTL for challenge TXT records, in seconds
pub const DEFAULT_TXT_TTL: u32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    Dns01,
    Http01,
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dns01 => write!(f, "dns-01"),
            Self::Http01 => write!(f, "http-01"),
        }
    }
}

/// Proves control of a domain to an ACME server
#[async_trait]
pub trait ChallengeProvider: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ChallengeKind;

    /// Publish the answer for `token`
    async fn present(&self, domain: &str, token: &str, key_auth: &str) -> Result<()>;

    /// Withdraw the answer previously published for `token`
    async fn clean_up(&self, domain: &str, token: &str, key_auth: &str) -> Result<()>;

    /// How long, and how often, to wait for the answer to become visible
    fn timeout(&self) -> PollSettings;
}

/// A DNS zone managed by a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zone {
    pub id: String,
    pub name: String,
}

/// A DNS record as a backend reports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    /// Backend record id; `None` for backends that delete by content
    pub id: Option<String>,
    pub record_type: String,
    /// Name relative to the zone
    pub name: String,
    pub value: String,
}

impl DnsRecord {
    pub fn txt(id: Option<String>, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id,
            record_type: "TXT".to_string(),
            name: name.into(),
            value: value.into(),
        }
    }

    /// Exact `{type, name, value}` match, ignoring id and name case
    pub fn same_content(&self, other: &DnsRecord) -> bool {
        self.record_type.eq_ignore_ascii_case(&other.record_type)
            && self.name.eq_ignore_ascii_case(&other.name)
            && self.value == other.value
    }
}

/// Everything needed to delete a presented challenge record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedRecord {
    pub zone: Zone,
    pub record: DnsRecord,
}

/// Zone and record operations of a DNS hosting API
#[async_trait]
pub trait DnsBackend: Send + Sync {
    fn name(&self) -> &str;

    fn page_size(&self) -> u32 {
        DEFAULT_PAGE_SIZE
    }

    async fn list_zones(&self, page: PageRequest) -> Result<Page<Zone>>;

    /// Create a TXT record named `name` (relative to `zone`)
    async fn create_txt_record(&self, zone: &Zone, name: &str, value: &str, ttl: u32) -> Result<DnsRecord>;

    /// List records of `zone`; required by backends that return no record ids
    async fn list_records(&self, zone: &Zone, page: PageRequest) -> Result<Page<DnsRecord>> {
        let _ = (zone, page);
        Err(ProvisionError::UnsupportedConfiguration(format!(
            "DNS backend '{}' cannot list records",
            self.name()
        )))
    }

    async fn delete_record(&self, zone: &Zone, record: &DnsRecord) -> Result<()>;
}

/// Per-provider DNS-01 settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsChallengeConfig {
    pub ttl: u32,
    pub propagation_timeout: Duration,
    pub polling_interval: Duration,
}

impl Default for DnsChallengeConfig {
    fn default() -> Self {
        let poll = PollSettings::default();
        Self {
            ttl: DEFAULT_TXT_TTL,
            propagation_timeout: poll.timeout,
            polling_interval: poll.interval,
        }
    }
}

/// DNS-01 challenge provider over a [`DnsBackend`]
pub struct Dns01Provider<B> {
    backend: B,
    config: DnsChallengeConfig,
    records: RecordTracker<TrackedRecord>,
}

impl<B: DnsBackend> Dns01Provider<B> {
    pub fn new(backend: B, config: DnsChallengeConfig) -> Self {
        Self {
            backend,
            config,
            records: RecordTracker::new(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Records presented and not yet cleaned up
    pub fn records(&self) -> &RecordTracker<TrackedRecord> {
        &self.records
    }

    async fn zones(&self) -> Result<Vec<Zone>> {
        Pages::new(self.backend.page_size(), |page| self.backend.list_zones(page))
            .try_collect()
            .await
    }

    async fn delete_by_content(&self, handle: &TrackedRecord) -> Result<()> {
        let zone = &handle.zone;
        let found = Pages::new(self.backend.page_size(), |page| self.backend.list_records(zone, page))
            .find_map(|record| record.same_content(&handle.record).then_some(record))
            .await?;

        match found {
            Some(record) => self.backend.delete_record(zone, &record).await,
            None => {
                debug!(
                    zone = %zone.name,
                    name = %handle.record.name,
                    "Challenge record already absent"
                );
                Ok(())
            }
        }
    }
}

#[async_trait]
impl<B: DnsBackend> ChallengeProvider for Dns01Provider<B> {
    fn name(&self) -> &str {
        self.backend.name()
    }

    fn kind(&self) -> ChallengeKind {
        ChallengeKind::Dns01
    }

    async fn present(&self, domain: &str, token: &str, key_auth: &str) -> Result<()> {
        if self.records.is_tracked(token) {
            return Err(ProvisionError::TokenInUse {
                token: token.to_string(),
            });
        }

        let challenge = challenge_record(domain, key_auth);
        let zones = self.zones().await?;
        let zone = find_zone(&challenge.fqdn, &zones)?.clone();
        let name = relative_name(&challenge.fqdn, &zone.name);

        debug!(
            provider = %self.backend.name(),
            zone = %zone.name,
            name = %name,
            "Creating DNS-01 challenge record"
        );
        let record = self
            .backend
            .create_txt_record(&zone, &name, &challenge.value, self.config.ttl)
            .await?;

        let handle = TrackedRecord { zone, record };
        if let Err(e) = self.records.track(token, handle.clone()) {
            // Another present for this token won the race; drop our duplicate
            warn!(token = %token, "Concurrent present for the same token, removing duplicate record");
            if let Err(del) = self.backend.delete_record(&handle.zone, &handle.record).await {
                warn!(token = %token, error = %del, "Failed to remove duplicate challenge record");
            }
            return Err(e);
        }

        info!(
            domain = %domain,
            fqdn = %challenge.fqdn,
            provider = %self.backend.name(),
            "DNS-01 challenge record presented"
        );
        Ok(())
    }

    async fn clean_up(&self, domain: &str, token: &str, _key_auth: &str) -> Result<()> {
        let handle = self.records.handle(token)?;

        if handle.record.id.is_some() {
            self.backend.delete_record(&handle.zone, &handle.record).await?;
        } else {
            self.delete_by_content(&handle).await?;
        }

        self.records.release(token);
        info!(domain = %domain, zone = %handle.zone.name, "DNS-01 challenge record cleaned up");
        Ok(())
    }

    fn timeout(&self) -> PollSettings {
        PollSettings::new(self.config.propagation_timeout, self.config.polling_interval)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// In-memory DNS backend
    pub(crate) struct FakeDns {
        zones: Vec<Zone>,
        with_ids: bool,
        records: Mutex<Vec<(String, DnsRecord)>>,
        next_id: AtomicU32,
        failing_deletes: AtomicU32,
        pub creates: AtomicU32,
    }

    impl FakeDns {
        pub(crate) fn new(zones: &[(&str, &str)], with_ids: bool) -> Self {
            Self {
                zones: zones
                    .iter()
                    .map(|(id, name)| Zone {
                        id: id.to_string(),
                        name: name.to_string(),
                    })
                    .collect(),
                with_ids,
                records: Mutex::new(Vec::new()),
                next_id: AtomicU32::new(1),
                failing_deletes: AtomicU32::new(0),
                creates: AtomicU32::new(0),
            }
        }

        fn fail_next_deletes(&self, n: u32) {
            self.failing_deletes.store(n, Ordering::SeqCst);
        }

        pub(crate) fn records(&self) -> Vec<(String, DnsRecord)> {
            self.records.lock().clone()
        }
    }

    #[async_trait]
    impl DnsBackend for FakeDns {
        fn name(&self) -> &str {
            "fake"
        }

        fn page_size(&self) -> u32 {
            1
        }

        async fn list_zones(&self, page: PageRequest) -> Result<Page<Zone>> {
            let start = (page.offset() as usize).min(self.zones.len());
            let end = (start + page.size as usize).min(self.zones.len());
            Ok(Page::new(self.zones[start..end].to_vec()).with_total_items(self.zones.len() as u64))
        }

        async fn create_txt_record(&self, zone: &Zone, name: &str, value: &str, _ttl: u32) -> Result<DnsRecord> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let record = DnsRecord::txt(Some(format!("rec-{}", id)), name, value);
            self.records.lock().push((zone.id.clone(), record.clone()));

            if self.with_ids {
                Ok(record)
            } else {
                Ok(DnsRecord { id: None, ..record })
            }
        }

        async fn list_records(&self, zone: &Zone, _page: PageRequest) -> Result<Page<DnsRecord>> {
            if self.with_ids {
                return Err(ProvisionError::UnsupportedConfiguration("ids only".to_string()));
            }
            let records: Vec<DnsRecord> = self
                .records
                .lock()
                .iter()
                .filter(|(zone_id, _)| *zone_id == zone.id)
                .map(|(_, r)| r.clone())
                .collect();
            Ok(Page::complete(records))
        }

        async fn delete_record(&self, zone: &Zone, record: &DnsRecord) -> Result<()> {
            if self
                .failing_deletes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ProvisionError::backend("delete record", "HTTP 503"));
            }
            self.records
                .lock()
                .retain(|(zone_id, r)| !(*zone_id == zone.id && r.id == record.id));
            Ok(())
        }
    }

    fn provider(with_ids: bool) -> Dns01Provider<FakeDns> {
        let backend = FakeDns::new(&[("z1", "example.com"), ("z2", "sub.example.com")], with_ids);
        Dns01Provider::new(backend, DnsChallengeConfig::default())
    }

    #[tokio::test]
    async fn test_present_creates_record_in_longest_zone() {
        let provider = provider(true);
        provider.present("www.sub.example.com", "tok", "tok.thumb").await.unwrap();

        let records = provider.backend().records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, "z2");
        assert_eq!(records[0].1.name, "_acme-challenge.www");
        assert_eq!(records[0].1.value, crate::dns01::challenge_value("tok.thumb"));
        assert!(provider.records().is_tracked("tok"));
    }

    #[tokio::test]
    async fn test_present_unknown_zone() {
        let provider = provider(true);
        let err = provider.present("example.org", "tok", "ka").await.unwrap_err();

        assert!(matches!(err, ProvisionError::ZoneNotFound { .. }));
        assert_eq!(provider.backend().creates.load(Ordering::SeqCst), 0);
        assert!(provider.records().is_empty());
    }

    #[tokio::test]
    async fn test_second_clean_up_is_unknown_record() {
        let provider = provider(true);
        provider.present("example.com", "tok", "ka").await.unwrap();
        provider.clean_up("example.com", "tok", "ka").await.unwrap();

        let err = provider.clean_up("example.com", "tok", "ka").await.unwrap_err();
        assert!(matches!(err, ProvisionError::UnknownRecord { ref token } if token == "tok"));
        assert!(provider.backend().records().is_empty());
    }

    #[tokio::test]
    async fn test_present_twice_rejected_before_network() {
        let provider = provider(true);
        provider.present("example.com", "tok", "ka").await.unwrap();

        let err = provider.present("example.com", "tok", "ka").await.unwrap_err();
        assert!(matches!(err, ProvisionError::TokenInUse { .. }));
        assert_eq!(provider.backend().creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_entry_for_retry() {
        let provider = provider(true);
        provider.present("example.com", "tok", "ka").await.unwrap();

        provider.backend().fail_next_deletes(1);
        let err = provider.clean_up("example.com", "tok", "ka").await.unwrap_err();
        assert!(matches!(err, ProvisionError::Backend { .. }));
        assert!(provider.records().is_tracked("tok"));

        provider.clean_up("example.com", "tok", "ka").await.unwrap();
        assert!(!provider.records().is_tracked("tok"));
        assert!(provider.backend().records().is_empty());
    }

    #[tokio::test]
    async fn test_clean_up_by_content_without_ids() {
        let provider = provider(false);
        provider.present("*.example.com", "tok-a", "ka-a").await.unwrap();
        provider.present("example.com", "tok-b", "ka-b").await.unwrap();
        assert!(provider.records().get("tok-a").unwrap().record.id.is_none());

        provider.clean_up("*.example.com", "tok-a", "ka-a").await.unwrap();

        let remaining = provider.backend().records();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].1.value, crate::dns01::challenge_value("ka-b"));
        assert!(provider.records().is_tracked("tok-b"));
    }

    #[tokio::test]
    async fn test_clean_up_releases_when_record_already_gone() {
        let provider = provider(false);
        provider.present("example.com", "tok", "ka").await.unwrap();
        provider.backend().records.lock().clear();

        provider.clean_up("example.com", "tok", "ka").await.unwrap();
        assert!(provider.records().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_present_for_distinct_tokens() {
        let provider = provider(true);
        let (a, b, c) = tokio::join!(
            provider.present("a.example.com", "tok-a", "ka-a"),
            provider.present("b.example.com", "tok-b", "ka-b"),
            provider.present("c.sub.example.com", "tok-c", "ka-c"),
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();

        assert_eq!(provider.records().len(), 3);
        assert_eq!(provider.backend().records().len(), 3);
    }

    #[test]
    fn test_default_timeout() {
        let provider = provider(true);
        let settings = provider.timeout();
        assert_eq!(settings.timeout, Duration::from_secs(300));
        assert_eq!(settings.interval, Duration::from_secs(5));
        assert_eq!(provider.kind(), ChallengeKind::Dns01);
    }
}
