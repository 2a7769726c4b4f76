//! Observability surface: Prometheus metrics and the health endpoint.

pub mod health;
pub mod metrics;

pub use health::{ComponentHealth, HealthRegistry};
