//! # c3voit-core
//!
//! Cost-optimization and orchestration core for a structured-extraction
//! pipeline: a conformal-prediction cache sitting in front of a
//! budget-aware model-tier selector.
//!
//! ## Architecture
//!
//! - **C³ (Conformal Counterfactual Cache)**: content-addressed and
//!   embedding-similarity reuse of prior extractions, gated by a
//!   conformal-prediction risk bound.
//! - **VoIT (Value-of-Insight Tree) orchestrator**: picks the cheapest
//!   model tier predicted to meet a per-request quality target, escalating
//!   or ensembling under a budget.
//! - **ExtractionPipeline**: the façade composing fingerprinting, C³
//!   lookup, single-flight-deduplicated VoIT rebuilds, write-back and
//!   telemetry into one `process` call.
//!
//! ## Usage
//!
//! The crate is an embeddable library, not a service: callers inject their
//! own `EmbeddingProvider`, `CacheStore`, `VectorIndex`, `CalibrationLog`,
//! `ModelTier` implementations, `Clock` and `TelemetrySink`, then drive
//! requests through `pipeline::ExtractionPipeline::process`.

/// The conformal counterfactual cache: reuse-vs-rebuild decisions with a
/// quantified risk bound.
pub mod c3;
/// Durable content-addressed store from content hash to cache entry.
pub mod cache_store;
/// Append-only, partition-scoped nonconformity score log.
pub mod calibration;
/// Monotonic + wall clock abstraction, injected for testable deadlines.
pub mod clock;
/// Configuration surface: every tunable with a documented default.
pub mod config;
/// Error types and handling
pub mod error;
/// Deterministic canonicalization, content hashing and embedding lookup.
pub mod fingerprint;
/// Pluggable model tier trait and per-tier statistics.
pub mod model_tier;
/// Core data models
pub mod models;
/// Thin façade composing the engine into one public operation.
pub mod pipeline;
/// Per-content-hash rebuild deduplication.
pub mod single_flight;
/// Structured telemetry emission.
pub mod telemetry;
/// Pure quality evaluation of an extraction result against a request.
pub mod validator;
/// Approximate nearest-neighbor lookup over fingerprint embeddings.
pub mod vector_index;
/// Budget- and value-aware model tier selection.
pub mod voit;

pub use error::{CoreError, Result};
