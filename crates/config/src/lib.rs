//! config: configuration parsing and validation for certrelay
//!
//! This crate defines the TOML configuration of the certrelay binary: the
//! ACME account, the challenge provider and the list of deployers.

pub mod config;

pub use config::*;
