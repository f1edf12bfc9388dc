//! Entry lifecycle: fresh, then stale-but-revalidatable, then expired.
//!
//! Every function here is a pure function of `(now, entry)`. Age is measured
//! from `created_at`; an entry written "in the future" (clock skew) has age
//! zero.

use std::time::Duration;

use time::OffsetDateTime;

use super::store::CacheEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// `age <= ttl`.
    Fresh,
    /// Past its TTL but inside the stale-while-revalidate window.
    Stale,
    /// Logically absent.
    Expired,
}

impl Freshness {
    /// Whether the entry may still be served.
    pub fn is_servable(self) -> bool {
        !matches!(self, Self::Expired)
    }
}

pub fn evaluate<V>(now: OffsetDateTime, entry: &CacheEntry<V>) -> Freshness {
    let age = age(now, entry.created_at);
    if age <= entry.ttl {
        return Freshness::Fresh;
    }
    match entry.stale_while_revalidate {
        Some(window) if age <= entry.ttl.saturating_add(window) => Freshness::Stale,
        _ => Freshness::Expired,
    }
}

pub fn is_fresh<V>(now: OffsetDateTime, entry: &CacheEntry<V>) -> bool {
    evaluate(now, entry) == Freshness::Fresh
}

pub fn is_stale_but_revalidatable<V>(now: OffsetDateTime, entry: &CacheEntry<V>) -> bool {
    evaluate(now, entry) == Freshness::Stale
}

pub fn is_expired<V>(now: OffsetDateTime, entry: &CacheEntry<V>) -> bool {
    evaluate(now, entry) == Freshness::Expired
}

fn age(now: OffsetDateTime, created_at: OffsetDateTime) -> Duration {
    Duration::try_from(now - created_at).unwrap_or(Duration::ZERO)
}
