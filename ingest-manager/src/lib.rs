//! Ingestion service for external data sources.
//!
//! Each provider integration implements [`source::DataSource`]: it owns its
//! credential lifecycle (via the keeper credential store) and produces a
//! normalized snapshot per fetch. The [`scheduler::IngestScheduler`] fans out
//! over every user with stored credentials, and the [`api`] module exposes
//! the linking flows plus on-demand ingestion over HTTP.

pub mod api;
pub mod email;
pub mod failure;
pub mod financial;
pub mod retry;
pub mod scheduler;
pub mod source;

pub use scheduler::{IngestReport, IngestScheduler};
pub use source::{DataSource, FetchOutcome};
