//! Admin HTTP listener: health checks and Prometheus metrics.

pub mod handler;
