//! `cachet-core` — shared building blocks for the job engine.
//!
//! This crate contains **pure value types** (no threads, no IO): job
//! identifiers, cache keys and cache freshness rules.

pub mod error;
pub mod freshness;
pub mod id;
pub mod key;

pub use error::{CoreError, CoreResult};
pub use freshness::Freshness;
pub use id::JobId;
pub use key::CacheKey;
