//! Bidirectional tag index.
//!
//! Tracks `tag -> keys` and `key -> tags` so that invalidating a tag finds
//! every affected entry without scanning the store, and evicting an entry
//! cleans up its tags. Not synchronized on its own: the store keeps it under
//! the same lock as the entry table.

use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub struct TagIndex {
    tag_to_keys: HashMap<String, HashSet<String>>,
    key_to_tags: HashMap<String, HashSet<String>>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the tags of `key`, replacing whatever it was tagged with before.
    pub fn insert(&mut self, key: &str, tags: &HashSet<String>) {
        self.remove_key(key);
        if tags.is_empty() {
            return;
        }

        for tag in tags {
            self.tag_to_keys
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        self.key_to_tags.insert(key.to_string(), tags.clone());
    }

    /// Forget `key` and drop tags that no longer point anywhere.
    pub fn remove_key(&mut self, key: &str) {
        let Some(tags) = self.key_to_tags.remove(key) else {
            return;
        };

        for tag in tags {
            if let Some(keys) = self.tag_to_keys.get_mut(&tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_to_keys.remove(&tag);
                }
            }
        }
    }

    /// Every key whose tag set intersects `tags`.
    pub fn keys_for_tags<S: AsRef<str>>(&self, tags: &[S]) -> HashSet<String> {
        tags.iter()
            .filter_map(|tag| self.tag_to_keys.get(tag.as_ref()))
            .flatten()
            .cloned()
            .collect()
    }

    pub fn tags_for_key(&self, key: &str) -> Option<&HashSet<String>> {
        self.key_to_tags.get(key)
    }

    pub fn clear(&mut self) {
        self.tag_to_keys.clear();
        self.key_to_tags.clear();
    }

    pub fn tag_count(&self) -> usize {
        self.tag_to_keys.len()
    }

    pub fn key_count(&self) -> usize {
        self.key_to_tags.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(list: &[&str]) -> HashSet<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn insert_and_lookup() {
        let mut index = TagIndex::new();
        index.insert("game:1", &tags(&["game:1", "catalog"]));
        index.insert("game:2", &tags(&["game:2", "catalog"]));

        let hit = index.keys_for_tags(&["catalog"]);
        assert_eq!(hit.len(), 2);

        let hit = index.keys_for_tags(&["game:2", "unknown"]);
        assert_eq!(hit, tags(&["game:2"]));
        assert_eq!(index.tags_for_key("game:1"), Some(&tags(&["game:1", "catalog"])));
    }

    #[test]
    fn reinsert_replaces_previous_tags() {
        let mut index = TagIndex::new();
        index.insert("profile:1", &tags(&["profile:1", "private"]));
        index.insert("profile:1", &tags(&["profile:1"]));

        assert!(index.keys_for_tags(&["private"]).is_empty());
        assert_eq!(index.tag_count(), 1);
        assert_eq!(index.key_count(), 1);
    }

    #[test]
    fn remove_key_cleans_up_empty_tags() {
        let mut index = TagIndex::new();
        index.insert("library:1", &tags(&["library:1", "private"]));
        index.insert("library:2", &tags(&["library:2", "private"]));

        index.remove_key("library:1");
        assert_eq!(index.keys_for_tags(&["private"]), tags(&["library:2"]));
        assert!(index.keys_for_tags(&["library:1"]).is_empty());
        assert_eq!(index.tag_count(), 2);

        index.remove_key("library:1");
        index.remove_key("library:2");
        assert_eq!(index.tag_count(), 0);
        assert_eq!(index.key_count(), 0);
    }

    #[test]
    fn untagged_keys_are_not_tracked() {
        let mut index = TagIndex::new();
        index.insert("k", &HashSet::new());
        assert_eq!(index.key_count(), 0);
    }

    #[test]
    fn clear_removes_all_mappings() {
        let mut index = TagIndex::new();
        index.insert("game:1", &tags(&["catalog"]));
        index.clear();
        assert_eq!(index.tag_count(), 0);
        assert_eq!(index.key_count(), 0);
    }
}
