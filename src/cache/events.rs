//! Mutation signals.
//!
//! Each [`EventKind`] describes a write on the social side and knows which
//! cache tags it makes stale. Tags are the string forms of [`EntityKey`], so
//! the same event reaches object entries and cached responses alike.

use std::fmt;

use serde::Deserialize;
use uuid::Uuid;

use super::keys::{EntityKey, PRIVATE_TAG};

/// Domain mutations that invalidate cached data.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// Display name, avatar or bio changed.
    ProfileUpdated { user_id: Uuid },
    /// Profile visibility changed; everything shown about the user may differ.
    PrivacyChanged { user_id: Uuid },
    /// `follower` started or stopped following `followee`.
    FollowChanged { follower: Uuid, followee: Uuid },
    FriendshipChanged { user_a: Uuid, user_b: Uuid },
    /// A library row (status, rating, playtime) was written.
    GameTrackingChanged { user_id: Uuid, game_id: u64 },
    /// Upstream catalog data for the game was refreshed.
    GameMetadataRefreshed { game_id: u64 },
    SignedOut { user_id: Uuid },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ProfileUpdated { .. } => "profile_updated",
            Self::PrivacyChanged { .. } => "privacy_changed",
            Self::FollowChanged { .. } => "follow_changed",
            Self::FriendshipChanged { .. } => "friendship_changed",
            Self::GameTrackingChanged { .. } => "game_tracking_changed",
            Self::GameMetadataRefreshed { .. } => "game_metadata_refreshed",
            Self::SignedOut { .. } => "signed_out",
        }
    }

    /// Tags made stale by this mutation.
    ///
    /// Private responses carry no per-user tag, so signing out drops every
    /// private response.
    pub fn tags(&self) -> Vec<String> {
        let keys = match *self {
            Self::ProfileUpdated { user_id } => vec![EntityKey::Profile(user_id)],
            Self::PrivacyChanged { user_id } => vec![
                EntityKey::Profile(user_id),
                EntityKey::Followers(user_id),
                EntityKey::Following(user_id),
                EntityKey::Friends(user_id),
                EntityKey::Library(user_id),
            ],
            Self::FollowChanged { follower, followee } => vec![
                EntityKey::Following(follower),
                EntityKey::Followers(followee),
                EntityKey::Friends(follower),
                EntityKey::Friends(followee),
                EntityKey::Profile(follower),
                EntityKey::Profile(followee),
            ],
            Self::FriendshipChanged { user_a, user_b } => {
                vec![EntityKey::Friends(user_a), EntityKey::Friends(user_b)]
            }
            Self::GameTrackingChanged { user_id, game_id } => vec![
                EntityKey::Library(user_id),
                EntityKey::Profile(user_id),
                EntityKey::GameStats(game_id),
            ],
            Self::GameMetadataRefreshed { game_id } => vec![EntityKey::Game(game_id)],
            Self::SignedOut { .. } => return vec![PRIVATE_TAG.to_string()],
        };

        keys.iter().map(ToString::to_string).collect()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
