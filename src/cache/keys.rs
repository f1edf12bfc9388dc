//! Cache key definitions.
//!
//! `EntityKey` names the things the social layer caches (profiles, follow
//! lists, libraries, catalog games). Its string form doubles as the object
//! cache key and as the invalidation tag for everything derived from it.
//! `RequestKey` identifies a cacheable HTTP response.

use std::fmt;

use axum::http::{HeaderMap, Method, Uri, header};
use uuid::Uuid;

use super::config::RoutePolicy;
use super::fingerprint::fingerprint_bytes;

/// Tag attached to every response cached under a private policy.
pub const PRIVATE_TAG: &str = "private";

/// Tag attached to every catalog game.
pub const CATALOG_TAG: &str = "catalog";

/// Identifies a cached entity or a derived collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKey {
    /// A user's public profile card.
    Profile(Uuid),
    /// Users following the given user.
    Followers(Uuid),
    /// Users the given user follows.
    Following(Uuid),
    /// Mutual friends of the given user.
    Friends(Uuid),
    /// A user's tracked games (status, rating, playtime).
    Library(Uuid),
    /// Catalog metadata for a game.
    Game(u64),
    /// Aggregated community stats for a game (ratings, players).
    GameStats(u64),
}

impl EntityKey {
    /// Parse the catalog game id out of a `game:{id}` key.
    pub fn parse_game(key: &str) -> Option<u64> {
        key.strip_prefix("game:")?.parse().ok()
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Profile(id) => write!(f, "profile:{id}"),
            Self::Followers(id) => write!(f, "followers:{id}"),
            Self::Following(id) => write!(f, "following:{id}"),
            Self::Friends(id) => write!(f, "friends:{id}"),
            Self::Library(id) => write!(f, "library:{id}"),
            Self::Game(id) => write!(f, "game:{id}"),
            Self::GameStats(id) => write!(f, "game-stats:{id}"),
        }
    }
}

/// Key of a cached HTTP response.
///
/// Layout: `GET /path?a=1&b=2|accept-language=en|user:<scope>`. Query pairs
/// are sorted, so parameter order never splits the cache. The user segment is
/// present only for private routes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey(String);

impl RequestKey {
    pub fn derive(method: &Method, uri: &Uri, headers: &HeaderMap, policy: &RoutePolicy) -> Self {
        let mut key = format!("{} {}", method, uri.path());

        if let Some(query) = uri.query().filter(|q| !q.is_empty()) {
            let mut pairs: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
            pairs.sort_unstable();
            key.push('?');
            key.push_str(&pairs.join("&"));
        }

        for name in &policy.vary {
            let value = headers
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            key.push('|');
            key.push_str(&name.to_ascii_lowercase());
            key.push('=');
            key.push_str(value);
        }

        if policy.private {
            key.push_str("|user:");
            key.push_str(&viewer_scope(headers));
        }

        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable, non-reversible scope for the caller's credentials.
fn viewer_scope(headers: &HeaderMap) -> String {
    let credential = headers
        .get(header::AUTHORIZATION)
        .or_else(|| headers.get(header::COOKIE))
        .map(|value| value.as_bytes());

    match credential {
        Some(bytes) => fingerprint_bytes(bytes).trim_matches('"').to_string(),
        None => "anon".to_string(),
    }
}
