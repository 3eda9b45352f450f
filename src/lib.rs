//! # tollgate
//!
//! Admission and cost-governance layer in front of an expensive LLM
//! backend. Every inbound request passes through one decision pipeline:
//! semantic cache, sliding-window rate limits, multi-period token budgets,
//! and a degradation ladder that prefers a cheaper answer over a hard
//! rejection.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tollgate::{
//!     AdmissionConfig, AdmissionController, AdmissionRequest, Principal, Tier,
//!     store::MemoryCounterStore,
//! };
//! # use tollgate::cache::EmbeddingProvider;
//! # use tollgate::backend::BackendCaller;
//! # fn embedder() -> Arc<dyn EmbeddingProvider> { unimplemented!() }
//! # fn backend() -> Arc<dyn BackendCaller> { unimplemented!() }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tollgate::AdmissionError> {
//!     let controller = AdmissionController::new(
//!         AdmissionConfig::default(),
//!         Arc::new(MemoryCounterStore::new()),
//!         embedder(),
//!         backend(),
//!     )?;
//!
//!     let principal = Principal::new("acct-42", Tier::Pro);
//!     let decision = controller
//!         .admit(AdmissionRequest::new(principal, "What is the return policy?"))
//!         .await;
//!     if let Some(response) = decision.outcome.response() {
//!         println!("{response}");
//!     }
//!     Ok(())
//! }
//! ```

#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod backend;
pub mod budget;
pub mod cache;
pub mod config;
pub mod error;
pub mod limiter;
pub mod orchestrator;
pub mod principal;
pub mod queue;
pub mod sinks;
pub mod store;

// Re-exports for convenience
pub use backend::{BackendCaller, BackendResponse, Backoff, ModelProfile};
pub use budget::{BudgetLedger, BudgetResult, UsageSnapshot};
pub use cache::{CacheHit, EmbeddingProvider, SemanticCache};
pub use config::{AdmissionConfig, BudgetPolicy, RateLimits};
pub use error::{AdmissionError, BackendError, EmbeddingError, StoreError};
pub use limiter::{RateCheck, SlidingWindowLimiter, estimate_tokens};
pub use orchestrator::{
    AdmissionController, AdmissionDecision, AdmissionRequest, DegradedReason, Outcome, RejectReason,
};
pub use principal::{Principal, Tier};
pub use queue::{QueuedRequest, RequestQueue};
pub use sinks::{AlertSink, AuditRecord, AuditSink, BudgetAlert};
pub use store::{CounterStore, FailurePolicy, MemoryCounterStore};
