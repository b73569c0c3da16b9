//! `jobrunner-core`: identifiers and error primitives.
//!
//! This crate has no storage or runtime concerns; the job engine and any
//! submitting application both depend on it.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{SubjectId, TenantId, UserId};
