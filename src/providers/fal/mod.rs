//! Queue-based media generation provider (fal.ai queue API).

pub mod client;
pub mod types;

pub use client::*;
pub use types::*;
