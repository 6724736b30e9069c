//! Trellis Core
//!
//! Core types and abstractions for the Trellis cluster provisioner.
//!
//! This crate contains:
//! - Domain types: cluster definitions, ingress rules, provider resources, node records
//! - DTOs: provider-neutral request payloads
//! - Errors: the provider and provisioning error taxonomy shared by every crate

pub mod domain;
pub mod dto;
pub mod error;

pub use error::{ProviderError, ProvisionError, Result};
