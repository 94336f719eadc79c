//! Metrics module
//!
//! Exposes per-cache stats in the Prometheus text format.

mod exporter;

pub use exporter::CacheMetricsExporter;
