//! Cache trigger service.
//!
//! Write paths call the trigger after a successful mutation; it drops every
//! entry tagged by the event in both cache layers.

use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use super::config::CacheConfig;
use super::events::EventKind;
use super::orchestrator::CacheOrchestrator;
use super::response::CachedResponse;

/// Outcome of one trigger call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Invalidated {
    pub objects: usize,
    pub responses: usize,
}

impl Invalidated {
    pub fn total(&self) -> usize {
        self.objects + self.responses
    }
}

#[derive(Clone)]
pub struct CacheTrigger {
    objects_enabled: bool,
    responses_enabled: bool,
    objects: CacheOrchestrator<Value>,
    responses: CacheOrchestrator<CachedResponse>,
}

impl CacheTrigger {
    pub fn new(
        config: &CacheConfig,
        objects: CacheOrchestrator<Value>,
        responses: CacheOrchestrator<CachedResponse>,
    ) -> Self {
        Self {
            objects_enabled: config.enabled,
            responses_enabled: config.enable_response_cache,
            objects,
            responses,
        }
    }

    /// Invalidate everything tagged by `kind`.
    pub fn trigger(&self, kind: &EventKind) -> Invalidated {
        if !self.objects_enabled && !self.responses_enabled {
            debug!(event_kind = %kind, "Cache trigger skipped: cache disabled");
            return Invalidated::default();
        }

        let tags = kind.tags();
        let invalidated = Invalidated {
            objects: if self.objects_enabled {
                self.objects.invalidate_by_tags(&tags)
            } else {
                0
            },
            responses: if self.responses_enabled {
                self.responses.invalidate_by_tags(&tags)
            } else {
                0
            },
        };

        info!(
            event_kind = %kind,
            tags = ?tags,
            objects = invalidated.objects,
            responses = invalidated.responses,
            "Cache event applied"
        );
        invalidated
    }

    pub fn profile_updated(&self, user_id: Uuid) -> Invalidated {
        self.trigger(&EventKind::ProfileUpdated { user_id })
    }

    pub fn follow_changed(&self, follower: Uuid, followee: Uuid) -> Invalidated {
        self.trigger(&EventKind::FollowChanged { follower, followee })
    }

    pub fn game_metadata_refreshed(&self, game_id: u64) -> Invalidated {
        self.trigger(&EventKind::GameMetadataRefreshed { game_id })
    }

    pub fn signed_out(&self, user_id: Uuid) -> Invalidated {
        self.trigger(&EventKind::SignedOut { user_id })
    }
}
