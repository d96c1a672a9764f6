//! certrelay: certificate provisioning and fan-out deployment
//!
//! Obtains certificates from an ACME CA through a DNS-01 or HTTP-01
//! challenge provider and pushes them to every configured deployer.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use provision::issuer::acme_ca_name;
use provision::{deploy_all, resolve_acme_ca, AcmeIssuer, Deployer, DnsTxtLookup};
use providers::{build_challenge_provider, build_deployers};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "certrelay")]
#[command(author, version, about = "Certificate provisioning and fan-out deployment")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "certrelay.toml")]
    config: PathBuf,

    /// Log level (overrides `global.log_level`)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Obtain a certificate over ACME and deploy it everywhere
    Issue,
    /// Deploy an existing PEM certificate and key
    Deploy {
        #[arg(long)]
        cert: PathBuf,
        #[arg(long)]
        key: PathBuf,
    },
    /// Validate configuration
    Validate,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config =
        Config::load(&cli.config).with_context(|| format!("Failed to load config from {:?}", cli.config))?;

    // Setup logging
    let log_level = cli.log_level.as_deref().unwrap_or(&config.global.log_level);
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")?;

    match cli.command {
        Commands::Validate => validate_config(&config),
        Commands::Issue => run(|rt, cancel| rt.block_on(issue(&config, cancel))),
        Commands::Deploy { cert, key } => run(|rt, cancel| rt.block_on(deploy_files(&config, cancel, &cert, &key))),
    }
}

/// Run `f` on a fresh runtime with Ctrl-C wired to cancellation
fn run<F>(f: F) -> Result<()>
where
    F: FnOnce(&tokio::runtime::Runtime, &CancellationToken) -> Result<()>,
{
    let rt = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    let cancel = CancellationToken::new();

    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        warn!("Received interrupt, cancelling");
        handler_token.cancel();
    })
    .context("Failed to install interrupt handler")?;

    f(&rt, &cancel)
}

fn deployers(config: &Config) -> Result<Vec<Arc<dyn Deployer>>> {
    let built = build_deployers(&config.deployers).context("Invalid deployer configuration")?;

    Ok(built
        .into_iter()
        .enumerate()
        .map(|(index, mut deployer)| {
            let span = info_span!("deploy", index, provider = %deployer.name());
            deployer.set_span(span);
            Arc::from(deployer)
        })
        .collect())
}

async fn issue(config: &Config, cancel: &CancellationToken) -> Result<()> {
    let challenge_config = config
        .challenge
        .as_ref()
        .context("No [challenge] section configured")?;
    let ca_url = resolve_acme_ca(&config.acme.ca)?;
    let challenge = build_challenge_provider(challenge_config).context("Invalid challenge configuration")?;
    let deployers = deployers(config)?;

    info!(
        ca = %acme_ca_name(&ca_url),
        challenge = %challenge.name(),
        domains = ?config.acme.domains,
        "Issuing certificate"
    );

    let issuer = AcmeIssuer::new(ca_url, config.acme.email.clone(), challenge)
        .with_txt_lookup(Arc::new(DnsTxtLookup::new(&config.acme.nameservers)));
    let issued = issuer
        .issue(cancel, &config.acme.domains)
        .await
        .context("Certificate issuance failed")?;

    deploy(cancel, &deployers, &issued.certificate_pem, &issued.private_key_pem).await
}

async fn deploy_files(config: &Config, cancel: &CancellationToken, cert: &Path, key: &Path) -> Result<()> {
    let cert_pem = tokio::fs::read_to_string(cert)
        .await
        .with_context(|| format!("Failed to read certificate from {:?}", cert))?;
    let key_pem = tokio::fs::read_to_string(key)
        .await
        .with_context(|| format!("Failed to read private key from {:?}", key))?;

    let deployers = deployers(config)?;
    deploy(cancel, &deployers, &cert_pem, &key_pem).await
}

async fn deploy(cancel: &CancellationToken, deployers: &[Arc<dyn Deployer>], cert_pem: &str, key_pem: &str) -> Result<()> {
    if deployers.is_empty() {
        warn!("No deployers configured, nothing to deploy");
        return Ok(());
    }

    info!(deployers = deployers.len(), "Deploying certificate");
    deploy_all(cancel, deployers, cert_pem, key_pem)
        .await
        .context("Deployment failed")?;
    info!("Certificate deployed to every target");
    Ok(())
}

fn validate_config(config: &Config) -> Result<()> {
    if let Some(challenge) = &config.challenge {
        resolve_acme_ca(&config.acme.ca)?;
        build_challenge_provider(challenge).context("Invalid challenge configuration")?;
    }
    build_deployers(&config.deployers).context("Invalid deployer configuration")?;

    println!("Configuration is valid!");
    match &config.challenge {
        Some(challenge) => {
            println!("  ACME CA: {}", config.acme.ca);
            println!("  Challenge: {}", challenge.provider_name());
            println!("  Domains: {:?}", config.acme.domains);
        }
        None => println!("  No challenge configured (deploy only)"),
    }
    println!("  Deployers: {}", config.deployers.len());
    for deployer in &config.deployers {
        println!("  - {}", deployer.provider_name());
    }

    Ok(())
}
