//! Idempotent provisioning of AWS IAM principals, policies, access keys and
//! IAM Identity Center assignments.
//!
//! The [`services::Provisioner`] drives every request against a
//! [`backend::BackendClient`], which wraps either the AWS SDK (feature
//! `backend-aws`) or the in-memory backend.

pub mod backend;
pub mod config;
pub mod error;
#[cfg(feature = "cli")]
pub mod observability;
pub mod policy;
pub mod services;

pub use error::{ProvisionError, ProvisionResult};
