//! provision: challenge, certificate manager and deployer contracts
//!
//! This crate holds the provider-independent core of certrelay: the
//! DNS-01/HTTP-01 challenge providers with their record tracker, certificate
//! fingerprint deduplication, domain resolution and partial-failure fan-out
//! deployment, plus the ACME issuer that ties them together.

pub mod certmgr;
pub mod challenge;
pub mod deployer;
pub mod dns01;
pub mod error;
pub mod fanout;
pub mod fingerprint;
pub mod http01;
pub mod issuer;
pub mod paging;
pub mod poll;
pub mod propagation;
pub mod resolver;
pub mod tracker;
pub mod transcode;

#[cfg(test)]
mod test_support;

pub use certmgr::{
    certificate_name, CertificateInventory, CertificateManager, InventoryCertificateManager, OperateResult,
    UploadResult,
};
pub use challenge::{
    ChallengeKind, ChallengeProvider, DnsBackend, DnsChallengeConfig, DnsRecord, Dns01Provider, TrackedRecord, Zone,
};
pub use deployer::{deploy_all, BindOutcome, BindingDeployer, DeployResult, Deployer, TargetBinder, TaskStatus};
pub use error::{ProvisionError, Result, TargetFailure};
pub use fingerprint::{CertificateFingerprint, CertificateSummary, MatchProfile, NameField, SignatureAlgorithm};
pub use http01::Http01Provider;
pub use issuer::{resolve_acme_ca, AcmeIssuer, IssuedCertificate};
pub use paging::{Page, PageRequest, Pages};
pub use poll::PollSettings;
pub use propagation::{DnsTxtLookup, TxtLookup};
pub use resolver::{BackendDomain, DomainInventory, DomainResolver, DomainSpec, MatchPattern};
pub use tracker::RecordTracker;
pub use transcode::{pem_to_pfx, OutputFormat};
