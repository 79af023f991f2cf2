// SPDX-License-Identifier: MPL-2.0

use crate::model::{Post, PostId, PostPatch};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// How a replace-all page fetch decides there is nothing more to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// The fetch returned as many posts as were already held.
    #[default]
    SameLength,
    /// The fetch returned fewer posts than requested.
    ShortPage,
}

/// Result of [`FeedStore::prepend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prepended {
    Inserted,
    /// The id was already held; its fields were replaced in place.
    Merged,
}

/// The visible feed: posts in display order, unique by id.
///
/// Fetched pages keep the backend's order (newest `created_at` first).
/// Posts observed live are put at the head regardless of their timestamp,
/// so the head is "most recently observed", not strictly newest.
#[derive(Debug, Clone, Default)]
pub struct FeedStore {
    posts: Vec<Post>,
    exhausted: bool,
}

impl FeedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn posts(&self) -> &[Post] {
        &self.posts
    }

    pub fn len(&self) -> usize {
        self.posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
    }

    pub fn get(&self, id: PostId) -> Option<&Post> {
        self.posts.iter().find(|p| p.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: PostId) -> Option<&mut Post> {
        self.posts.iter_mut().find(|p| p.id == id)
    }

    pub fn contains(&self, id: PostId) -> bool {
        self.get(id).is_some()
    }

    pub fn ids(&self) -> Vec<PostId> {
        self.posts.iter().map(|p| p.id).collect()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub(crate) fn set_exhausted(&mut self, exhausted: bool) {
        self.exhausted = exhausted;
    }

    /// Replace the whole collection with a freshly fetched page.
    ///
    /// `requested` is the limit the page was fetched with. Returns whether
    /// the feed is now exhausted.
    pub fn replace_page(
        &mut self,
        posts: Vec<Post>,
        requested: usize,
        policy: ExhaustionPolicy,
    ) -> bool {
        let previous = self.posts.len();
        let posts = dedup(posts);
        let exhausted = match policy {
            ExhaustionPolicy::SameLength => posts.len() == previous,
            ExhaustionPolicy::ShortPage => posts.len() < requested,
        };
        self.posts = posts;
        if exhausted {
            self.exhausted = true;
        }
        self.exhausted
    }

    /// Replace the held posts with a re-read of the same window, keeping
    /// the exhaustion flag. Used for warm starts and gap recovery.
    pub fn reload(&mut self, posts: Vec<Post>) {
        self.posts = dedup(posts);
    }

    /// Append an older page below the held posts, skipping ids already held.
    ///
    /// A page shorter than `requested` exhausts the feed. Returns the
    /// number of posts appended.
    pub fn append_page(&mut self, posts: Vec<Post>, requested: usize) -> usize {
        let fetched = posts.len();
        let before = self.posts.len();
        for post in posts {
            if !self.contains(post.id) {
                self.posts.push(post);
            }
        }
        if fetched < requested {
            self.exhausted = true;
        }
        self.posts.len() - before
    }

    /// Put a post at the head, or merge it in place when its id is held.
    ///
    /// A merge replaces the post's own columns; the derived like list and
    /// comment count are left to the count reconciler.
    pub fn prepend(&mut self, post: Post) -> Prepended {
        match self.get_mut(post.id) {
            Some(existing) => {
                let patch = PostPatch {
                    likes: None,
                    comment_count: None,
                    ..PostPatch::from(&post)
                };
                patch.apply(existing);
                Prepended::Merged
            }
            None => {
                self.posts.insert(0, post);
                Prepended::Inserted
            }
        }
    }

    /// Replace the named fields of a held post. Returns false if absent.
    pub fn patch_by_id(&mut self, id: PostId, patch: PostPatch) -> bool {
        match self.get_mut(id) {
            Some(post) => {
                patch.apply(post);
                true
            }
            None => false,
        }
    }

    pub fn remove_by_id(&mut self, id: PostId) -> Option<Post> {
        let index = self.posts.iter().position(|p| p.id == id)?;
        Some(self.posts.remove(index))
    }

    pub fn clear(&mut self) {
        self.posts.clear();
        self.exhausted = false;
    }
}

fn dedup(posts: Vec<Post>) -> Vec<Post> {
    let mut seen = HashSet::with_capacity(posts.len());
    posts.into_iter().filter(|p| seen.insert(p.id)).collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::UserId;
    use chrono::{Duration, TimeZone, Utc};

    pub(crate) fn post(id: i64, minutes: i64) -> Post {
        Post {
            id: PostId(id),
            author_id: UserId::new("author"),
            body: format!("post {id}"),
            media: None,
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
                + Duration::minutes(minutes),
            likes: Vec::new(),
            comment_count: 0,
            author: None,
        }
    }

    fn ids(store: &FeedStore) -> Vec<i64> {
        store.posts().iter().map(|p| p.id.0).collect()
    }

    #[test]
    fn test_replace_page_keeps_backend_order() {
        let mut store = FeedStore::new();
        let exhausted =
            store.replace_page(vec![post(3, 30), post(2, 20), post(1, 10)], 4, ExhaustionPolicy::SameLength);
        assert!(!exhausted);
        assert_eq!(ids(&store), vec![3, 2, 1]);
    }

    #[test]
    fn test_replace_page_same_length_exhausts() {
        let mut store = FeedStore::new();
        store.replace_page(vec![post(2, 20), post(1, 10)], 4, ExhaustionPolicy::SameLength);
        assert!(store.replace_page(vec![post(2, 20), post(1, 10)], 8, ExhaustionPolicy::SameLength));
        assert!(store.is_exhausted());
    }

    #[test]
    fn test_replace_page_short_page_exhausts() {
        let mut store = FeedStore::new();
        let full: Vec<Post> = (1..=4).rev().map(|i| post(i, i)).collect();
        assert!(!store.replace_page(full.clone(), 4, ExhaustionPolicy::ShortPage));
        // Same count as before but a full page: not exhausted under this policy.
        let next: Vec<Post> = (5..=8).rev().map(|i| post(i, i)).collect();
        assert!(!store.replace_page(next, 4, ExhaustionPolicy::ShortPage));
        assert!(store.replace_page(full, 8, ExhaustionPolicy::ShortPage));
    }

    #[test]
    fn test_prepend_ignores_timestamp_order() {
        let mut store = FeedStore::new();
        store.replace_page(
            vec![post(4, 40), post(3, 30), post(2, 20), post(1, 10)],
            4,
            ExhaustionPolicy::SameLength,
        );
        assert_eq!(store.prepend(post(5, -100)), Prepended::Inserted);
        assert_eq!(ids(&store), vec![5, 4, 3, 2, 1]);
    }

    #[test]
    fn test_prepend_same_id_twice_merges() {
        let mut store = FeedStore::new();
        assert_eq!(store.prepend(post(1, 0)), Prepended::Inserted);
        let mut edited = post(1, 0);
        edited.body = "edited".into();
        assert_eq!(store.prepend(edited), Prepended::Merged);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(PostId(1)).unwrap().body, "edited");
    }

    #[test]
    fn test_patch_and_remove_missing_are_noops() {
        let mut store = FeedStore::new();
        store.prepend(post(1, 0));
        assert!(!store.patch_by_id(PostId(9), PostPatch::body("x")));
        assert!(store.remove_by_id(PostId(9)).is_none());
        assert!(store.patch_by_id(PostId(1), PostPatch::body("x")));
        assert_eq!(store.get(PostId(1)).unwrap().body, "x");
        assert!(store.remove_by_id(PostId(1)).is_some());
        assert!(store.is_empty());
    }

    #[test]
    fn test_reload_keeps_exhaustion() {
        let mut store = FeedStore::new();
        store.append_page(vec![post(2, 20)], 4);
        assert!(store.is_exhausted());
        store.reload(vec![post(3, 30), post(2, 20), post(3, 30)]);
        assert_eq!(ids(&store), vec![3, 2]);
        assert!(store.is_exhausted());
    }

    #[test]
    fn test_append_page_skips_held_ids() {
        let mut store = FeedStore::new();
        store.append_page(vec![post(4, 40), post(3, 30)], 2);
        store.prepend(post(9, 90));
        let appended = store.append_page(vec![post(3, 30), post(2, 20)], 2);
        assert_eq!(appended, 1);
        assert_eq!(ids(&store), vec![9, 4, 3, 2]);
        assert!(!store.is_exhausted());
        store.append_page(vec![post(1, 10)], 2);
        assert!(store.is_exhausted());
    }

    #[test]
    fn test_replay_of_change_sequence() {
        // Applying INSERT/UPDATE/DELETE in delivery order leaves each
        // surviving post equal to its latest version and drops deleted ids.
        let mut store = FeedStore::new();
        store.prepend(post(1, 0));
        store.prepend(post(2, 0));
        store.patch_by_id(PostId(1), PostPatch::body("v2"));
        store.prepend(post(3, 0));
        store.remove_by_id(PostId(2));
        store.patch_by_id(PostId(2), PostPatch::body("ghost"));
        store.patch_by_id(PostId(1), PostPatch::body("v3"));

        assert_eq!(ids(&store), vec![3, 1]);
        assert_eq!(store.get(PostId(1)).unwrap().body, "v3");
        assert!(!store.contains(PostId(2)));
    }
}
