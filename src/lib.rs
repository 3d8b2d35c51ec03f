#![deny(missing_docs)]

//! Core library for casedraft: token-bounded chunking and hierarchical summarization of long
//! case documents.

/// Environment-driven configuration management.
pub mod config;
/// Structured logging and tracing setup.
pub mod logging;
/// Pipeline run counters.
pub mod metrics;
/// Document summarization pipeline.
pub mod processing;
/// Generation providers, registry and selection.
pub mod provider;
/// Classification-aware retry with backoff and deadline.
pub mod retry;
/// Token estimation and caching.
pub mod tokens;
