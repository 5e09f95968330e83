//! Provider adapters.

pub mod fal;
pub mod http;
pub mod openai;

// Re-export commonly used provider types
pub use fal::FalProvider;
pub use openai::OpenAIProvider;
