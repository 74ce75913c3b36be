//! Centrix rebuild orchestrator.
//!
//! Consumes change-events (signed advisories, module builds, content
//! changes, manual requests), works out which artifacts must be rebuilt and
//! in which order, submits the rebuilds to external build systems and tracks
//! them to completion.

pub mod clients;
pub mod config;
pub mod error;
pub mod events;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod routes;
pub mod schema;
pub mod services;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
