//! Application services consuming the cache.

pub mod catalog;
pub mod error;
