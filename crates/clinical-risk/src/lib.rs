//! Clinical risk scoring and predictive health intelligence.
//!
//! The crate is organised as a pure core (scoring, PHI protection, population analysis,
//! forecasting, intervention lookup, alert decisions) wrapped by two stateful edges: the
//! assessment intake service and the signed webhook delivery service.

pub mod alerts;
pub mod cache;
pub mod config;
pub mod delivery;
pub mod domain;
pub mod error;
pub mod forecast;
pub mod intake;
pub mod interventions;
pub mod phi;
pub mod population;
pub mod scoring;
pub mod telemetry;
