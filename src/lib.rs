//! Acquires a user's GitHub pull requests and commits from the REST API and the web UI,
//! reconciles both views into one contribution ledger, and derives metrics from it.

pub mod config;
pub mod credentials;
pub mod fetch;
pub mod merge;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod ratelimit;
pub mod report;
pub mod store;
