//! Identifiers and errors shared by every caseflow crate.
//!
//! This crate has no infrastructure concerns.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{OrgId, UserId};
