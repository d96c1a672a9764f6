//! Local filesystem deployer
//!
//! Writes the certificate either as PEM files or as a single PKCS#12
//! archive, for servers that read their certificates from disk.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use provision::poll::ensure_active;
use provision::{pem_to_pfx, CertificateFingerprint, DeployResult, Deployer, OutputFormat, ProvisionError, Result};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument, Span};

pub struct LocalDeployer {
    cert_path: PathBuf,
    key_path: Option<PathBuf>,
    format: OutputFormat,
    pfx_password: String,
    span: Span,
}

impl LocalDeployer {
    /// PEM output needs `key_path`; PFX output bundles the key into `cert_path`
    pub fn new(cert_path: PathBuf, key_path: Option<PathBuf>, format: OutputFormat) -> Result<Self> {
        if format == OutputFormat::Pem && key_path.is_none() {
            return Err(ProvisionError::UnsupportedConfiguration(
                "PEM output requires a key path".to_string(),
            ));
        }

        Ok(Self {
            cert_path,
            key_path,
            format,
            pfx_password: String::new(),
            span: info_span!("deploy", provider = "local"),
        })
    }

    pub fn with_pfx_password(mut self, password: impl Into<String>) -> Self {
        self.pfx_password = password.into();
        self
    }

    async fn write_pem(&self, cert_pem: &str, key_pem: &str) -> Result<()> {
        let key_path = self.key_path.as_deref().ok_or_else(|| {
            ProvisionError::UnsupportedConfiguration("PEM output requires a key path".to_string())
        })?;

        write_file(&self.cert_path, cert_pem.as_bytes()).await?;
        write_file(key_path, key_pem.as_bytes()).await?;
        restrict_permissions(key_path);

        info!(cert = ?self.cert_path, key = ?key_path, "Wrote PEM certificate");
        Ok(())
    }

    async fn write_pfx(&self, fingerprint: &CertificateFingerprint, cert_pem: &str, key_pem: &str) -> Result<()> {
        let friendly_name = fingerprint.common_name.as_deref().unwrap_or("certrelay");
        let der = pem_to_pfx(cert_pem, key_pem, &self.pfx_password, friendly_name)?;

        write_file(&self.cert_path, &der).await?;
        restrict_permissions(&self.cert_path);

        info!(path = ?self.cert_path, "Wrote PKCS#12 certificate");
        Ok(())
    }
}

#[async_trait]
impl Deployer for LocalDeployer {
    fn name(&self) -> &str {
        "local"
    }

    async fn deploy(&self, cancel: &CancellationToken, cert_pem: &str, key_pem: &str) -> Result<DeployResult> {
        let span = self.span.clone();
        async move {
            let fingerprint = CertificateFingerprint::from_pem(cert_pem)?;
            ensure_active(cancel)?;

            match self.format {
                OutputFormat::Pem => self.write_pem(cert_pem, key_pem).await?,
                OutputFormat::Pfx => self.write_pfx(&fingerprint, cert_pem, key_pem).await?,
            }
            Ok(DeployResult)
        }
        .instrument(span)
        .await
    }

    fn set_span(&mut self, span: Span) {
        self.span = span;
    }
}

async fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, contents).await?;
    Ok(())
}

/// Owner-only access for files holding a private key (Unix only)
fn restrict_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let permissions = std::fs::Permissions::from_mode(0o600);
        if let Err(e) = std::fs::set_permissions(path, permissions) {
            warn!(path = ?path, error = %e, "Failed to set key file permissions");
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::self_signed;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_pem_files_written() {
        let dir = TempDir::new().unwrap();
        let cert_path = dir.path().join("certs/example.com.crt");
        let key_path = dir.path().join("private/example.com.key");
        let (cert_pem, key_pem) = self_signed("example.com");

        let deployer = LocalDeployer::new(cert_path.clone(), Some(key_path.clone()), OutputFormat::Pem).unwrap();
        deployer
            .deploy(&CancellationToken::new(), &cert_pem, &key_pem)
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(&cert_path).unwrap(), cert_pem);
        assert_eq!(std::fs::read_to_string(&key_path).unwrap(), key_pem);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&key_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_pfx_written() {
        let dir = TempDir::new().unwrap();
        let cert_path = dir.path().join("example.com.pfx");
        let (cert_pem, key_pem) = self_signed("example.com");

        let deployer = LocalDeployer::new(cert_path.clone(), None, OutputFormat::Pfx)
            .unwrap()
            .with_pfx_password("secret");
        deployer
            .deploy(&CancellationToken::new(), &cert_pem, &key_pem)
            .await
            .unwrap();

        let der = std::fs::read(&cert_path).unwrap();
        // DER SEQUENCE
        assert_eq!(der.first(), Some(&0x30));
    }

    #[test]
    fn test_pem_without_key_path_rejected() {
        assert!(matches!(
            LocalDeployer::new(PathBuf::from("cert.pem"), None, OutputFormat::Pem),
            Err(ProvisionError::UnsupportedConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_certificate_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");

        let deployer = LocalDeployer::new(cert_path.clone(), Some(key_path), OutputFormat::Pem).unwrap();
        let result = deployer
            .deploy(&CancellationToken::new(), "not a certificate", "not a key")
            .await;

        assert!(matches!(result, Err(ProvisionError::Certificate(_))));
        assert!(!cert_path.exists());
    }

    #[tokio::test]
    async fn test_cancelled_deploy_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let (cert_pem, key_pem) = self_signed("example.com");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let deployer =
            LocalDeployer::new(cert_path.clone(), Some(dir.path().join("key.pem")), OutputFormat::Pem).unwrap();
        let result = deployer.deploy(&cancel, &cert_pem, &key_pem).await;

        assert!(matches!(result, Err(ProvisionError::Cancelled)));
        assert!(!cert_path.exists());
    }
}
