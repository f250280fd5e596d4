//! Prometheus exporter for Siebel CRM driven through a long-lived `srvrmgr`
//! admin shell.
//!
//! The [`session::ProcessSession`] owns the child process and its pipes,
//! [`channel`] frames one command/response exchange, and [`watchdog`] keeps
//! the session alive. A [`engine::ScrapeEngine`] turns the tabular replies
//! into Prometheus samples using the definitions in a [`catalog::Catalog`].

pub mod catalog;
pub mod channel;
pub mod config;
pub mod engine;
pub mod mapper;
pub mod metrics;
pub mod parser;
pub mod retry;
pub mod session;
pub mod signals;
pub mod status;
pub mod watchdog;

#[cfg(test)]
mod testing;

pub use catalog::{Catalog, CatalogSource, MetricDefinition, TomlCatalog};
pub use config::ExporterConfig;
pub use engine::{ScrapeEngine, ScrapeReport};
pub use mapper::Sample;
pub use session::{ProcessSession, SessionError, SessionSettings};
pub use status::ConnectionStatus;
