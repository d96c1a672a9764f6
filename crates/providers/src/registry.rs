//! Build providers from configuration
//!
//! Everything that can be rejected statically (match patterns, output
//! formats, missing paths) is rejected here, before any network call.

use std::sync::Arc;
use std::time::Duration;

use config::{ChallengeConfig, DeployerConfig, GcoreCdnDeployerConfig, LocalDeployerConfig};
use provision::{
    BindingDeployer, ChallengeProvider, Deployer, DnsChallengeConfig, Dns01Provider, DomainResolver, DomainSpec,
    Http01Provider, InventoryCertificateManager, OutputFormat, PollSettings, Result,
};
use tracing::debug;

use crate::cloudflare::CloudflareDns;
use crate::gcore::{GcoreCdn, GcoreCertificates, GcoreClient};
use crate::local::LocalDeployer;

pub fn build_challenge_provider(config: &ChallengeConfig) -> Result<Arc<dyn ChallengeProvider>> {
    debug!(provider = config.provider_name(), "Building challenge provider");

    let provider: Arc<dyn ChallengeProvider> = match config {
        ChallengeConfig::Cloudflare(cf) => {
            let backend = CloudflareDns::new(&cf.api_token, Duration::from_secs(cf.api_timeout_secs))?;
            Arc::new(Dns01Provider::new(
                backend,
                DnsChallengeConfig {
                    ttl: cf.ttl,
                    propagation_timeout: cf.propagation_timeout(),
                    polling_interval: cf.polling_interval(),
                },
            ))
        }
        ChallengeConfig::Http01(http) => {
            let provider = Http01Provider::new(PollSettings::new(
                Duration::from_secs(http.propagation_timeout_secs),
                Duration::from_secs(http.polling_interval_secs),
            ));
            match &http.webroot {
                Some(webroot) => Arc::new(provider.with_webroot(webroot.clone())),
                None => Arc::new(provider),
            }
        }
    };
    Ok(provider)
}

pub fn build_deployer(config: &DeployerConfig) -> Result<Box<dyn Deployer>> {
    debug!(provider = config.provider_name(), "Building deployer");

    match config {
        DeployerConfig::GcoreCdn(gcore) => Ok(Box::new(gcore_deployer(gcore, GcoreClient::new)?)),
        DeployerConfig::Local(local) => Ok(Box::new(local_deployer(local)?)),
    }
}

/// Build every configured deployer, failing on the first bad entry
pub fn build_deployers(configs: &[DeployerConfig]) -> Result<Vec<Box<dyn Deployer>>> {
    configs.iter().map(build_deployer).collect()
}

type GcoreDeployer = BindingDeployer<InventoryCertificateManager<GcoreCertificates>, GcoreCdn>;

fn gcore_deployer(
    config: &GcoreCdnDeployerConfig,
    client: impl FnOnce(&str, Duration) -> Result<GcoreClient>,
) -> Result<GcoreDeployer> {
    let spec = DomainSpec::parse(&config.domain_match, &config.domain)?;
    let api = client(&config.api_token, Duration::from_secs(config.api_timeout_secs))?;

    let manager = InventoryCertificateManager::new(GcoreCertificates::new(api.clone()), config.name_prefix.clone());
    let resolver = DomainResolver::new(spec).allow_empty(config.allow_empty);

    Ok(BindingDeployer::new(manager, GcoreCdn::new(api), resolver)
        .with_existing_certificate(config.certificate_id.clone()))
}

fn local_deployer(config: &LocalDeployerConfig) -> Result<LocalDeployer> {
    let format: OutputFormat = config.format.parse()?;
    let deployer = LocalDeployer::new(config.cert_path.clone(), config.key_path.clone(), format)?;

    Ok(match &config.pfx_password {
        Some(password) => deployer.with_pfx_password(password.clone()),
        None => deployer,
    })
}
