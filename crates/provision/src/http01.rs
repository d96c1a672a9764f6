//! In-memory HTTP-01 challenge provider
//!
//! Holds `token -> key authorization` for the host HTTP server, which answers
//! `GET /.well-known/acme-challenge/<token>` through [`Http01Provider::key_authorization`].
//! With a webroot configured, the answers are also written as files for an
//! external web server to serve.

use crate::challenge::{ChallengeKind, ChallengeProvider};
use crate::error::Result;
use crate::poll::PollSettings;
use crate::tracker::RecordTracker;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

/// URL path prefix for HTTP-01 challenge responses
pub const CHALLENGE_PATH_PREFIX: &str = "/.well-known/acme-challenge/";

pub fn challenge_path(token: &str) -> String {
    format!("{}{}", CHALLENGE_PATH_PREFIX, token)
}

pub struct Http01Provider {
    tokens: RecordTracker<String>,
    settings: PollSettings,
    webroot: Option<PathBuf>,
}

impl Http01Provider {
    pub fn new(settings: PollSettings) -> Self {
        Self {
            tokens: RecordTracker::new(),
            settings,
            webroot: None,
        }
    }

    /// Also write challenge files below `webroot`
    pub fn with_webroot(mut self, webroot: impl Into<PathBuf>) -> Self {
        self.webroot = Some(webroot.into());
        self
    }

    fn challenge_file(webroot: &Path, token: &str) -> PathBuf {
        webroot.join(challenge_path(token).trim_start_matches('/'))
    }

    /// Response body for `token`, if a challenge is being presented
    pub fn key_authorization(&self, token: &str) -> Option<String> {
        self.tokens.get(token)
    }

    /// Whether any challenge is still being presented
    pub fn records_pending(&self) -> bool {
        !self.tokens.is_empty()
    }

    /// Response body for a request path under `/.well-known/acme-challenge/`
    pub fn respond(&self, path: &str) -> Option<String> {
        let token = path.strip_prefix(CHALLENGE_PATH_PREFIX)?;
        if token.is_empty() || token.contains('/') {
            return None;
        }
        self.key_authorization(token)
    }
}

impl Default for Http01Provider {
    fn default() -> Self {
        Self::new(PollSettings::default())
    }
}

#[async_trait]
impl ChallengeProvider for Http01Provider {
    fn name(&self) -> &str {
        "http01"
    }

    fn kind(&self) -> ChallengeKind {
        ChallengeKind::Http01
    }

    async fn present(&self, domain: &str, token: &str, key_auth: &str) -> Result<()> {
        self.tokens.track(token, key_auth.to_string())?;

        if let Some(webroot) = &self.webroot {
            let file = Self::challenge_file(webroot, token);
            let written = async {
                if let Some(dir) = file.parent() {
                    fs::create_dir_all(dir).await?;
                }
                fs::write(&file, key_auth).await
            }
            .await;
            if let Err(e) = written {
                self.tokens.release(token);
                return Err(e.into());
            }
            debug!(file = ?file, "Wrote HTTP-01 challenge file");
        }

        debug!(domain = %domain, path = %challenge_path(token), "Serving HTTP-01 challenge");
        Ok(())
    }

    async fn clean_up(&self, domain: &str, token: &str, _key_auth: &str) -> Result<()> {
        self.tokens.handle(token)?;

        if let Some(webroot) = &self.webroot {
            let file = Self::challenge_file(webroot, token);
            match fs::remove_file(&file).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    warn!(file = ?file, "HTTP-01 challenge file already removed");
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.tokens.release(token);
        info!(domain = %domain, "HTTP-01 challenge withdrawn");
        Ok(())
    }

    fn timeout(&self) -> PollSettings {
        self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProvisionError;

    #[tokio::test]
    async fn test_present_serves_key_authorization() {
        let provider = Http01Provider::default();
        provider.present("example.com", "abc", "abc.thumb").await.unwrap();

        assert_eq!(provider.key_authorization("abc").as_deref(), Some("abc.thumb"));
        assert_eq!(
            provider.respond("/.well-known/acme-challenge/abc").as_deref(),
            Some("abc.thumb")
        );
        assert_eq!(provider.respond("/.well-known/acme-challenge/"), None);
        assert_eq!(provider.respond("/other/abc"), None);
    }

    #[tokio::test]
    async fn test_clean_up_withdraws_token() {
        let provider = Http01Provider::default();
        provider.present("example.com", "abc", "abc.thumb").await.unwrap();
        provider.clean_up("example.com", "abc", "abc.thumb").await.unwrap();

        assert_eq!(provider.key_authorization("abc"), None);
        let err = provider.clean_up("example.com", "abc", "abc.thumb").await.unwrap_err();
        assert!(matches!(err, ProvisionError::UnknownRecord { .. }));
    }

    #[tokio::test]
    async fn test_webroot_files_follow_challenge() {
        let dir = tempfile::TempDir::new().unwrap();
        let provider = Http01Provider::default().with_webroot(dir.path());
        let file = dir.path().join(".well-known/acme-challenge/abc");

        provider.present("example.com", "abc", "abc.thumb").await.unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "abc.thumb");

        provider.clean_up("example.com", "abc", "abc.thumb").await.unwrap();
        assert!(!file.exists());
        assert!(!provider.records_pending());
    }

    #[tokio::test]
    async fn test_unwritable_webroot_does_not_track_token() {
        let dir = tempfile::TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "file, not a directory").unwrap();
        let provider = Http01Provider::default().with_webroot(&blocker);

        let err = provider.present("example.com", "abc", "abc.thumb").await.unwrap_err();
        assert!(matches!(err, ProvisionError::Io(_)));
        assert_eq!(provider.key_authorization("abc"), None);
    }

    #[test]
    fn test_challenge_path() {
        assert_eq!(challenge_path("test_token"), "/.well-known/acme-challenge/test_token");
    }
}
