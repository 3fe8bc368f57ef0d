//! `cachet-persistence` — file-backed cache storage.
//!
//! [`FileCache`] implements the engine's `CachePort` on a local directory.
//! Serialization is delegated to a [`ResponseConverter`]; [`JsonConverter`]
//! is the default.

pub mod converter;
pub mod file_cache;

pub use converter::{ConverterError, JsonConverter, ResponseConverter};
pub use file_cache::FileCache;
