//! Deployer providers
//!
//! A [`Deployer`] takes an issued certificate to wherever it is served from.
//! [`BindingDeployer`] is the common shape for CDN and load balancer
//! backends: store the certificate with a [`CertificateManager`], resolve the
//! target domains, then bind the stored certificate to each of them.

use crate::certmgr::{CertificateManager, UploadResult};
use crate::error::{ProvisionError, Result};
use crate::fanout::fan_out;
use crate::fingerprint::CertificateFingerprint;
use crate::poll::{ensure_active, poll_until, run_or_cancel, PollSettings};
use crate::resolver::{DomainInventory, DomainResolver};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument, Span};

/// Success marker for [`Deployer::deploy`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeployResult;

#[async_trait]
pub trait Deployer: Send + Sync {
    fn name(&self) -> &str;

    /// Deploy a PEM certificate chain and its private key
    async fn deploy(&self, cancel: &CancellationToken, cert_pem: &str, key_pem: &str) -> Result<DeployResult>;

    /// Replace the span this deployer's work is recorded under
    fn set_span(&mut self, span: Span);
}

/// Result of binding a certificate to one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    Done,
    /// The backend applies the change asynchronously under this task id
    Pending(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Succeeded,
    Failed(String),
}

/// Attaches stored certificates to a backend's domains
#[async_trait]
pub trait TargetBinder: DomainInventory {
    fn name(&self) -> &str;

    async fn bind_certificate(&self, target: &str, certificate: &UploadResult) -> Result<BindOutcome>;

    async fn task_status(&self, task_id: &str) -> Result<TaskStatus> {
        let _ = task_id;
        Ok(TaskStatus::Succeeded)
    }

    /// Wait settings for pending bind tasks
    fn task_poll(&self) -> PollSettings {
        PollSettings::default()
    }
}

/// Upload, resolve, bind
pub struct BindingDeployer<M, B> {
    manager: M,
    binder: B,
    resolver: DomainResolver,
    existing_certificate: Option<String>,
    span: Span,
}

impl<M, B> BindingDeployer<M, B>
where
    M: CertificateManager,
    B: TargetBinder,
{
    pub fn new(manager: M, binder: B, resolver: DomainResolver) -> Self {
        let span = info_span!("deploy", provider = %binder.name());
        Self {
            manager,
            binder,
            resolver,
            existing_certificate: None,
            span,
        }
    }

    /// Update this certificate in place instead of uploading a new one
    pub fn with_existing_certificate(mut self, cert_id: Option<String>) -> Self {
        self.existing_certificate = cert_id;
        self
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    pub fn binder(&self) -> &B {
        &self.binder
    }

    async fn store(&self, cancel: &CancellationToken, cert_pem: &str, key_pem: &str) -> Result<UploadResult> {
        match &self.existing_certificate {
            Some(cert_id_or_name) => {
                // Bind with the id the backend resolved, never the configured name
                let replaced = self.manager.replace(cancel, cert_id_or_name, cert_pem, key_pem).await?;
                Ok(replaced.into())
            }
            None => self.manager.upload(cancel, cert_pem, key_pem).await,
        }
    }

    async fn bind(&self, cancel: &CancellationToken, target: &str, certificate: &UploadResult) -> Result<()> {
        let outcome = run_or_cancel(cancel, self.binder.bind_certificate(target, certificate)).await?;

        if let BindOutcome::Pending(task_id) = outcome {
            debug!(domain = %target, task = %task_id, "Waiting for bind task");
            let what = format!("bind task {} for {}", task_id, target);
            let task_id = &task_id;
            poll_until(cancel, self.binder.task_poll(), &what, || async move {
                match self.binder.task_status(task_id).await? {
                    TaskStatus::Running => Ok(None),
                    TaskStatus::Succeeded => Ok(Some(())),
                    TaskStatus::Failed(reason) => Err(ProvisionError::backend("bind task", reason)),
                }
            })
            .await?;
        }

        info!(domain = %target, cert_id = %certificate.cert_id, "Certificate bound");
        Ok(())
    }
}

#[async_trait]
impl<M, B> Deployer for BindingDeployer<M, B>
where
    M: CertificateManager,
    B: TargetBinder,
{
    fn name(&self) -> &str {
        self.binder.name()
    }

    async fn deploy(&self, cancel: &CancellationToken, cert_pem: &str, key_pem: &str) -> Result<DeployResult> {
        let span = self.span.clone();
        async move {
            let fingerprint = CertificateFingerprint::from_pem(cert_pem)?;
            ensure_active(cancel)?;

            let certificate = self.store(cancel, cert_pem, key_pem).await?;
            let targets = self.resolver.resolve(cancel, &self.binder, &fingerprint).await?;
            if targets.is_empty() {
                return Ok(DeployResult);
            }

            info!(
                cert_id = %certificate.cert_id,
                targets = targets.len(),
                "Binding certificate to targets"
            );
            let certificate = &certificate;
            fan_out(cancel, &targets, |_, target| self.bind(cancel, target, certificate)).await?;

            info!(cert_id = %certificate.cert_id, "Deployment complete");
            Ok(DeployResult)
        }
        .instrument(span)
        .await
    }

    fn set_span(&mut self, span: Span) {
        self.span = span;
    }
}

/// Deploy to every deployer, collecting failures per deployer
///
/// Failures are labelled `<name>#<index>` so that several deployers of the
/// same kind stay distinguishable.
pub async fn deploy_all(
    cancel: &CancellationToken,
    deployers: &[Arc<dyn Deployer>],
    cert_pem: &str,
    key_pem: &str,
) -> Result<()> {
    let names: Vec<String> = deployers
        .iter()
        .enumerate()
        .map(|(index, d)| format!("{}#{}", d.name(), index))
        .collect();

    fan_out(cancel, &names, |index, _| {
        let deployer = deployers[index].clone();
        async move { deployer.deploy(cancel, cert_pem, key_pem).await.map(|_| ()) }
    })
    .await
}
