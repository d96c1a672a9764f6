//! ACME certificate issuance
//!
//! Drives an `instant-acme` order through any [`ChallengeProvider`]: every
//! pending authorization is presented, DNS-01 answers are checked for
//! propagation, and all presented answers are cleaned up again whether or
//! not the order succeeds.

use crate::challenge::{ChallengeKind, ChallengeProvider};
use crate::dns01::challenge_record;
use crate::error::{ProvisionError, Result};
use crate::poll::{ensure_active, run_or_cancel, sleep_or_cancel, PollSettings};
use crate::propagation::{wait_for_txt, TxtLookup};
use instant_acme::{
    Account, AuthorizationStatus, ChallengeType, Identifier, NewAccount, NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Let's Encrypt production CA
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging CA (for testing)
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

pub const ZEROSSL_PRODUCTION: &str = "https://acme.zerossl.com/v2/DV90";

pub const GOOGLE_TRUST_SERVICES: &str = "https://dv.acme-v02.api.pki.goog/directory";

pub const BUYPASS_PRODUCTION: &str = "https://api.buypass.com/acme/directory";

pub const BUYPASS_STAGING: &str = "https://api.test4.buypass.no/acme/directory";

/// Time allowed for an order to become ready, and then valid
const ACME_ORDER_TIMEOUT_SECS: u64 = 300;

const ACME_ORDER_POLL_SECS: u64 = 2;

/// Resolve an ACME directory URL from a CA name or a direct URL
///
/// Supported names (case-insensitive): `letsencrypt`/`le`,
/// `letsencrypt-staging`/`le-staging`, `zerossl`, `google`/`gts`,
/// `buypass`, `buypass-staging`.
pub fn resolve_acme_ca(name_or_url: &str) -> Result<String> {
    let normalized = name_or_url.trim().to_lowercase();

    if normalized.starts_with("http://") || normalized.starts_with("https://") {
        return Ok(name_or_url.trim().to_string());
    }

    let url = match normalized.as_str() {
        "letsencrypt" | "le" | "letsencrypt-production" => LETS_ENCRYPT_PRODUCTION,
        "letsencrypt-staging" | "le-staging" | "staging" => LETS_ENCRYPT_STAGING,
        "zerossl" => ZEROSSL_PRODUCTION,
        "google" | "gts" => GOOGLE_TRUST_SERVICES,
        "buypass" => BUYPASS_PRODUCTION,
        "buypass-staging" => BUYPASS_STAGING,
        _ => {
            return Err(ProvisionError::UnsupportedConfiguration(format!(
                "unknown ACME CA '{}'",
                name_or_url
            )))
        }
    };
    Ok(url.to_string())
}

/// Human-readable name for an ACME directory URL
pub fn acme_ca_name(url: &str) -> &'static str {
    match url {
        LETS_ENCRYPT_PRODUCTION => "Let's Encrypt",
        LETS_ENCRYPT_STAGING => "Let's Encrypt (Staging)",
        ZEROSSL_PRODUCTION => "ZeroSSL",
        GOOGLE_TRUST_SERVICES => "Google Trust Services",
        BUYPASS_PRODUCTION => "Buypass",
        BUYPASS_STAGING => "Buypass (Staging)",
        _ => "Custom CA",
    }
}

/// Validate a domain name for an ACME order
///
/// A leading `*.` is accepted; wildcard names need a DNS-01 provider.
pub fn validate_domain(domain: &str) -> Result<()> {
    let invalid = |reason: &str| Err(ProvisionError::Acme(format!("{}: {}", reason, domain)));

    let name = domain.strip_prefix("*.").unwrap_or(domain);
    if name.is_empty() {
        return invalid("Domain name cannot be empty");
    }
    if name.len() > 253 {
        return invalid("Domain name too long");
    }

    let labels: Vec<&str> = name.split('.').collect();
    if labels.len() < 2 {
        return invalid("Domain must have at least two labels");
    }

    for label in &labels {
        if label.is_empty() || label.len() > 63 {
            return invalid("Invalid label length in domain");
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return invalid("Invalid characters in domain");
        }
        if label.starts_with('-') || label.ends_with('-') {
            return invalid("Domain label cannot start or end with hyphen");
        }
    }

    if labels.last().is_some_and(|tld| tld.chars().all(|c| c.is_ascii_digit())) {
        return invalid("TLD cannot be all numeric");
    }

    Ok(())
}

/// A certificate chain and its freshly generated private key
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub domains: Vec<String>,
    pub certificate_pem: String,
    pub private_key_pem: String,
}

/// A challenge answer that has to be withdrawn after the order
struct Presented {
    domain: String,
    token: String,
    key_auth: String,
}

fn acme_err(e: instant_acme::Error) -> ProvisionError {
    ProvisionError::Acme(e.to_string())
}

/// Obtains certificates from an ACME CA
pub struct AcmeIssuer {
    ca_url: String,
    email: String,
    challenge: Arc<dyn ChallengeProvider>,
    lookup: Option<Arc<dyn TxtLookup>>,
    order_poll: PollSettings,
}

impl AcmeIssuer {
    pub fn new(ca_url: impl Into<String>, email: impl Into<String>, challenge: Arc<dyn ChallengeProvider>) -> Self {
        Self {
            ca_url: ca_url.into(),
            email: email.into(),
            challenge,
            lookup: None,
            order_poll: PollSettings::new(
                Duration::from_secs(ACME_ORDER_TIMEOUT_SECS),
                Duration::from_secs(ACME_ORDER_POLL_SECS),
            ),
        }
    }

    /// Check DNS-01 answers through `lookup` before notifying the CA
    pub fn with_txt_lookup(mut self, lookup: Arc<dyn TxtLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    fn challenge_type(&self) -> ChallengeType {
        match self.challenge.kind() {
            ChallengeKind::Dns01 => ChallengeType::Dns01,
            ChallengeKind::Http01 => ChallengeType::Http01,
        }
    }

    async fn account(&self) -> Result<Account> {
        info!(email = %self.email, ca = %acme_ca_name(&self.ca_url), "Creating ACME account");

        let contact = format!("mailto:{}", self.email);
        let (account, _credentials) = Account::create(
            &NewAccount {
                contact: &[contact.as_str()],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.ca_url,
            None,
        )
        .await
        .map_err(acme_err)?;

        Ok(account)
    }

    /// Obtain one certificate covering every name in `domains`
    pub async fn issue(&self, cancel: &CancellationToken, domains: &[String]) -> Result<IssuedCertificate> {
        if domains.is_empty() {
            return Err(ProvisionError::Acme("No domains to issue for".to_string()));
        }
        for domain in domains {
            validate_domain(domain)?;
            if domain.starts_with("*.") && self.challenge.kind() != ChallengeKind::Dns01 {
                return Err(ProvisionError::UnsupportedConfiguration(format!(
                    "wildcard domain '{}' requires a DNS-01 challenge provider",
                    domain
                )));
            }
        }
        ensure_active(cancel)?;

        info!(domains = ?domains, provider = %self.challenge.name(), "Obtaining certificate via ACME");
        let account = run_or_cancel(cancel, self.account()).await?;

        let identifiers: Vec<Identifier> = domains.iter().map(|d| Identifier::Dns(d.clone())).collect();
        let mut order = run_or_cancel(cancel, async {
            account
                .new_order(&NewOrder {
                    identifiers: &identifiers,
                })
                .await
                .map_err(acme_err)
        })
        .await?;

        let mut presented = Vec::new();
        let authorized = self.authorize(cancel, &mut order, &mut presented).await;
        self.withdraw_all(&presented, authorized).await?;

        let mut params = CertificateParams::new(domains.to_vec()).map_err(|e| ProvisionError::Acme(e.to_string()))?;
        params.distinguished_name = DistinguishedName::new();
        let key_pair = KeyPair::generate().map_err(|e| ProvisionError::Acme(e.to_string()))?;
        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| ProvisionError::Acme(e.to_string()))?;

        ensure_active(cancel)?;
        run_or_cancel(cancel, async { order.finalize(csr.der()).await.map_err(acme_err) }).await?;
        self.wait_for_order(cancel, &mut order, true).await?;

        let certificate_pem = run_or_cancel(cancel, async { order.certificate().await.map_err(acme_err) })
            .await?
            .ok_or_else(|| ProvisionError::Acme("No certificate returned".to_string()))?;

        info!(domains = ?domains, "Certificate obtained successfully");
        Ok(IssuedCertificate {
            domains: domains.to_vec(),
            certificate_pem,
            private_key_pem: key_pair.serialize_pem(),
        })
    }

    /// Withdraw every presented answer, then pass `outcome` through
    ///
    /// Clean-up failures are logged and never replace `outcome`.
    async fn withdraw_all<T>(&self, presented: &[Presented], outcome: Result<T>) -> Result<T> {
        for p in presented {
            if let Err(e) = self.challenge.clean_up(&p.domain, &p.token, &p.key_auth).await {
                warn!(domain = %p.domain, error = %e, "Failed to clean up challenge");
            }
        }
        outcome
    }

    /// Present every pending authorization and wait for the order to be ready
    async fn authorize(
        &self,
        cancel: &CancellationToken,
        order: &mut Order,
        presented: &mut Vec<Presented>,
    ) -> Result<()> {
        let authorizations = run_or_cancel(cancel, async { order.authorizations().await.map_err(acme_err) }).await?;
        let wanted = self.challenge_type();

        for auth in &authorizations {
            let domain = match &auth.identifier {
                Identifier::Dns(domain) => domain.clone(),
                #[allow(unreachable_patterns)]
                other => return Err(ProvisionError::Acme(format!("Unsupported identifier: {:?}", other))),
            };

            match &auth.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => {
                    debug!(domain = %domain, "Authorization already valid");
                    continue;
                }
                status => {
                    return Err(ProvisionError::Acme(format!(
                        "Unexpected authorization status for {}: {:?}",
                        domain, status
                    )))
                }
            }

            let challenge = auth
                .challenges
                .iter()
                .find(|c| c.r#type == wanted)
                .ok_or_else(|| ProvisionError::Acme(format!("No {} challenge offered for {}", self.challenge.kind(), domain)))?;
            let key_auth = order.key_authorization(challenge).as_str().to_string();

            ensure_active(cancel)?;
            self.challenge.present(&domain, &challenge.token, &key_auth).await?;
            presented.push(Presented {
                domain: domain.clone(),
                token: challenge.token.clone(),
                key_auth: key_auth.clone(),
            });

            if let (ChallengeKind::Dns01, Some(lookup)) = (self.challenge.kind(), &self.lookup) {
                let record = challenge_record(&domain, &key_auth);
                wait_for_txt(cancel, lookup.as_ref(), &record, self.challenge.timeout()).await?;
            }

            run_or_cancel(cancel, async { order.set_challenge_ready(&challenge.url).await.map_err(acme_err) }).await?;
            debug!(domain = %domain, "Challenge marked ready");
        }

        self.wait_for_order(cancel, order, false).await
    }

    /// Poll the order until it is ready (or valid, when `until_valid`)
    async fn wait_for_order(&self, cancel: &CancellationToken, order: &mut Order, until_valid: bool) -> Result<()> {
        let start = Instant::now();

        loop {
            ensure_active(cancel)?;
            run_or_cancel(cancel, async { order.refresh().await.map(|_| ()).map_err(acme_err) }).await?;

            match order.state().status {
                OrderStatus::Valid => return Ok(()),
                OrderStatus::Ready if !until_valid => return Ok(()),
                OrderStatus::Invalid => return Err(ProvisionError::Acme("Order became invalid".to_string())),
                _ => debug!(elapsed_ms = start.elapsed().as_millis() as u64, "Waiting for ACME order"),
            }

            let elapsed = start.elapsed();
            if elapsed >= self.order_poll.timeout {
                return Err(ProvisionError::PollTimeout {
                    what: "ACME order".to_string(),
                    elapsed,
                });
            }
            sleep_or_cancel(cancel, self.order_poll.interval).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http01::Http01Provider;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Records clean-ups, failing the ones for `failing`
    #[derive(Default)]
    struct RecordingChallenge {
        failing: Option<String>,
        cleaned: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChallengeProvider for RecordingChallenge {
        fn name(&self) -> &str {
            "recording"
        }

        fn kind(&self) -> ChallengeKind {
            ChallengeKind::Dns01
        }

        async fn present(&self, _domain: &str, _token: &str, _key_auth: &str) -> Result<()> {
            Ok(())
        }

        async fn clean_up(&self, _domain: &str, token: &str, _key_auth: &str) -> Result<()> {
            self.cleaned.lock().push(token.to_string());
            if self.failing.as_deref() == Some(token) {
                return Err(ProvisionError::backend("delete record", "HTTP 500"));
            }
            Ok(())
        }

        fn timeout(&self) -> PollSettings {
            PollSettings::default()
        }
    }

    fn presented(tokens: &[&str]) -> Vec<Presented> {
        tokens
            .iter()
            .map(|token| Presented {
                domain: "example.com".to_string(),
                token: token.to_string(),
                key_auth: format!("{}.thumbprint", token),
            })
            .collect()
    }

    fn recording_issuer(failing: Option<&str>) -> (AcmeIssuer, Arc<RecordingChallenge>) {
        let challenge = Arc::new(RecordingChallenge {
            failing: failing.map(str::to_string),
            ..Default::default()
        });
        let issuer = AcmeIssuer::new(LETS_ENCRYPT_STAGING, "ops@example.com", challenge.clone());
        (issuer, challenge)
    }

    #[test]
    fn test_resolve_acme_ca() {
        assert_eq!(resolve_acme_ca("letsencrypt").unwrap(), LETS_ENCRYPT_PRODUCTION);
        assert_eq!(resolve_acme_ca("LE-Staging").unwrap(), LETS_ENCRYPT_STAGING);
        assert_eq!(resolve_acme_ca("gts").unwrap(), GOOGLE_TRUST_SERVICES);
        assert_eq!(
            resolve_acme_ca("https://acme.internal/directory").unwrap(),
            "https://acme.internal/directory"
        );
        assert!(matches!(
            resolve_acme_ca("someca"),
            Err(ProvisionError::UnsupportedConfiguration(_))
        ));
    }

    #[test]
    fn test_acme_ca_name() {
        assert_eq!(acme_ca_name(ZEROSSL_PRODUCTION), "ZeroSSL");
        assert_eq!(acme_ca_name("https://acme.internal/directory"), "Custom CA");
    }

    #[test]
    fn test_validate_domain() {
        assert!(validate_domain("example.com").is_ok());
        assert!(validate_domain("*.example.com").is_ok());
        assert!(validate_domain("a-b.example.co.uk").is_ok());

        assert!(validate_domain("").is_err());
        assert!(validate_domain("localhost").is_err());
        assert!(validate_domain("-bad.example.com").is_err());
        assert!(validate_domain("bad-.example.com").is_err());
        assert!(validate_domain("exa mple.com").is_err());
        assert!(validate_domain("example.123").is_err());
        assert!(validate_domain(&format!("{}.com", "a".repeat(64))).is_err());
    }

    #[tokio::test]
    async fn test_wildcard_requires_dns01() {
        let issuer = AcmeIssuer::new(LETS_ENCRYPT_STAGING, "ops@example.com", Arc::new(Http01Provider::default()));
        let err = issuer
            .issue(&CancellationToken::new(), &["*.example.com".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::UnsupportedConfiguration(_)));
    }

    #[tokio::test]
    async fn test_cancelled_issue_makes_no_request() {
        let issuer = AcmeIssuer::new(LETS_ENCRYPT_STAGING, "ops@example.com", Arc::new(Http01Provider::default()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = issuer.issue(&cancel, &["example.com".to_string()]).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_failed_authorization_still_cleans_up_every_answer() {
        let (issuer, challenge) = recording_issuer(Some("t2"));

        let err = issuer
            .withdraw_all(
                &presented(&["t1", "t2", "t3"]),
                Err::<(), _>(ProvisionError::Acme("authorization invalid".to_string())),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::Acme(ref m) if m == "authorization invalid"));
        assert_eq!(*challenge.cleaned.lock(), vec!["t1", "t2", "t3"]);
    }

    #[tokio::test]
    async fn test_clean_up_failure_does_not_fail_authorized_order() {
        let (issuer, challenge) = recording_issuer(Some("t1"));

        issuer.withdraw_all(&presented(&["t1", "t2"]), Ok(())).await.unwrap();
        assert_eq!(*challenge.cleaned.lock(), vec!["t1", "t2"]);
    }
}
