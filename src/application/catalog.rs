//! Catalog lookups through the object cache.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::cache::{
    CATALOG_TAG, CacheError, CacheOrchestrator, EntityKey, EntryOptions, FetchError,
    FetchStrategy, Resolved,
};

/// Upper bound on ids accepted by one batch lookup.
pub const MAX_BATCH: usize = 100;

/// Upstream game catalog.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn game(&self, id: u64) -> Result<Value, FetchError>;

    /// Ids unknown upstream are simply absent from the result.
    async fn games(&self, ids: &[u64]) -> Result<HashMap<u64, Value>, FetchError>;
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("batch of {count} ids exceeds the limit of {limit}", limit = MAX_BATCH)]
    BatchTooLarge { count: usize },
    #[error("game {0} is not cached")]
    NotCached(u64),
    #[error("game {0} not found upstream")]
    NotFound(u64),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[derive(Clone)]
pub struct CatalogService {
    source: Arc<dyn CatalogSource>,
    cache: CacheOrchestrator<Value>,
    options: EntryOptions,
}

impl CatalogService {
    /// `options` sets the lifetime of cached games; tags are added per game.
    pub fn new(
        source: Arc<dyn CatalogSource>,
        cache: CacheOrchestrator<Value>,
        options: EntryOptions,
    ) -> Self {
        Self {
            source,
            cache,
            options,
        }
    }

    pub fn cache(&self) -> &CacheOrchestrator<Value> {
        &self.cache
    }

    #[instrument(skip(self, strategy), fields(strategy = %strategy))]
    pub async fn game(
        &self,
        id: u64,
        strategy: FetchStrategy,
    ) -> Result<Resolved<Value>, CatalogError> {
        let key = EntityKey::Game(id).to_string();
        let source = Arc::clone(&self.source);
        let resolved = self
            .cache
            .resolve(
                &key,
                move || async move { source.game(id).await },
                strategy,
                &game_options(&self.options, id),
            )
            .await
            .map_err(|err| match err.fetch_error() {
                Some(fetch) if fetch.is_not_found() => CatalogError::NotFound(id),
                _ => CatalogError::Cache(err),
            })?;

        resolved.ok_or(CatalogError::NotCached(id))
    }

    /// Look up `ids` with at most one upstream call. Results follow `ids`;
    /// games unknown upstream (or not cached under `cache-only`) are `None`.
    #[instrument(skip(self, ids, strategy), fields(count = ids.len(), strategy = %strategy))]
    pub async fn games(
        &self,
        ids: &[u64],
        strategy: FetchStrategy,
    ) -> Result<Vec<Option<Value>>, CatalogError> {
        if ids.len() > MAX_BATCH {
            return Err(CatalogError::BatchTooLarge { count: ids.len() });
        }

        let keys: Vec<String> = ids
            .iter()
            .map(|id| EntityKey::Game(*id).to_string())
            .collect();
        let source = Arc::clone(&self.source);
        let base = self.options.clone();

        let values = self
            .cache
            .resolve_many(
                &keys,
                move |keys: Vec<String>| {
                    let source = Arc::clone(&source);
                    async move {
                        let ids: Vec<u64> =
                            keys.iter().filter_map(|key| EntityKey::parse_game(key)).collect();
                        let games = source.games(&ids).await?;
                        Ok::<HashMap<String, Value>, FetchError>(
                            games
                                .into_iter()
                                .map(|(id, game)| (EntityKey::Game(id).to_string(), game))
                                .collect(),
                        )
                    }
                },
                strategy,
                move |key: &str| match EntityKey::parse_game(key) {
                    Some(id) => game_options(&base, id),
                    None => base.clone(),
                },
            )
            .await?;

        debug!(
            found = values.iter().filter(|value| value.is_some()).count(),
            "Batch catalog lookup"
        );
        Ok(values)
    }
}

fn game_options(base: &EntryOptions, id: u64) -> EntryOptions {
    base.clone()
        .tag(CATALOG_TAG)
        .tag(EntityKey::Game(id).to_string())
}
