//! unslave library crate
//!
//! Exposes the crawl, the remediation pipeline and their collaborators so the
//! binary, benchmarks and tests can drive them without going through CLI
//! startup.

pub mod clock;
pub mod config;
pub mod context;
pub mod crawl;
pub mod credentials;
pub mod error;
pub mod git_ops;
pub mod github;
pub mod hosting;
pub mod ledger;
pub mod pipeline;
pub mod proposal;
pub mod quota;
pub mod retry;
pub mod rewrite;
pub mod runner;
pub mod util;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;
