//! Multi-provider generation orchestrator.
//!
//! Requests for text completions and media jobs go through one [`Router`],
//! which validates them, waits for admission from the [`Coordinator`], drives
//! the right provider protocol with retries inside the request deadline, and
//! returns a single normalized [`GenerationResult`].

pub mod coordinator;
pub mod error;
pub mod factory;
pub mod job;
pub mod normalizer;
pub mod provider;
pub mod providers;
pub mod retry;
pub mod router;
pub mod schema;
pub mod sse_stream;
pub mod types;

// Re-export core types for easy usage
pub use coordinator::{Coordinator, Permit, RateBudget, RateBudgetConfig};
pub use error::{Error, ErrorKind};
pub use factory::OrchestratorFactory;
pub use job::{JobHandle, JobProgress, JobState, ProviderJob};
pub use provider::{Adapter, CompletionProvider, JobProvider};
pub use providers::*;
pub use retry::RetryPolicy;
pub use router::Router;
pub use schema::{FieldType, ParameterSchema};
pub use sse_stream::SseEvent;
pub use types::*;
