//! providers: concrete backends for certrelay
//!
//! HTTP API clients implementing the `provision` capability traits, the
//! local file deployer, and the registry that builds them from
//! configuration.

pub mod cloudflare;
pub mod gcore;
pub mod local;
pub mod registry;

#[cfg(test)]
mod test_support;

pub use cloudflare::CloudflareDns;
pub use gcore::{GcoreCdn, GcoreCertificates, GcoreClient};
pub use local::LocalDeployer;
pub use registry::{build_challenge_provider, build_deployer, build_deployers};
