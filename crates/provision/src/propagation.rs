//! DNS propagation checks for DNS-01 challenges

use crate::dns01::ChallengeRecord;
use crate::error::{ProvisionError, Result};
use crate::poll::{poll_until, PollSettings};
use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfig, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::xfer::Protocol;
use hickory_resolver::{Resolver, TokioResolver};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Resolves the TXT values published at a name
#[async_trait]
pub trait TxtLookup: Send + Sync {
    /// Current TXT values at `fqdn`; an absent name yields an empty list
    async fn txt_values(&self, fqdn: &str) -> Result<Vec<String>>;
}

/// [`TxtLookup`] over hickory-resolver with caching disabled
pub struct DnsTxtLookup {
    resolver: TokioResolver,
}

impl DnsTxtLookup {
    /// Query `nameservers` over UDP, or the system defaults when empty
    pub fn new(nameservers: &[IpAddr]) -> Self {
        let config = if nameservers.is_empty() {
            ResolverConfig::default()
        } else {
            let mut config = ResolverConfig::new();
            for ip in nameservers {
                config.add_name_server(NameServerConfig::new(SocketAddr::new(*ip, 53), Protocol::Udp));
            }
            config
        };

        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(5);
        opts.attempts = 2;
        opts.cache_size = 0;

        let resolver = Resolver::builder_with_config(config, TokioConnectionProvider::default())
            .with_options(opts)
            .build();
        Self { resolver }
    }
}

#[async_trait]
impl TxtLookup for DnsTxtLookup {
    async fn txt_values(&self, fqdn: &str) -> Result<Vec<String>> {
        match self.resolver.txt_lookup(fqdn).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|txt| {
                    txt.txt_data()
                        .iter()
                        .map(|data| String::from_utf8_lossy(data))
                        .collect::<String>()
                })
                .collect()),
            Err(e) => {
                let message = e.to_string().to_lowercase();
                if message.contains("no records found")
                    || message.contains("nxdomain")
                    || message.contains("record not found")
                {
                    Ok(Vec::new())
                } else {
                    Err(ProvisionError::backend("txt lookup", format!("{}: {}", fqdn, e)))
                }
            }
        }
    }
}

/// Wait until `record` is visible through `lookup`
pub async fn wait_for_txt(
    cancel: &CancellationToken,
    lookup: &dyn TxtLookup,
    record: &ChallengeRecord,
    settings: PollSettings,
) -> Result<()> {
    debug!(
        fqdn = %record.fqdn,
        timeout_secs = settings.timeout.as_secs(),
        "Waiting for DNS propagation"
    );

    let what = format!("DNS propagation of {}", record.fqdn);
    poll_until(cancel, settings, &what, || async move {
        match lookup.txt_values(&record.fqdn).await {
            Ok(values) => {
                trace!(fqdn = %record.fqdn, found = ?values, "Checked TXT record");
                Ok(values.iter().any(|v| *v == record.value).then_some(()))
            }
            Err(e) => {
                warn!(fqdn = %record.fqdn, error = %e, "DNS lookup error");
                Ok(None)
            }
        }
    })
    .await
}
