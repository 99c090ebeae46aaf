// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

//! In-process storage engine with the same view layout and write protocol as
//! the Postgres engine. The fan-out batch is one write-lock scope over all
//! views; counters live behind a separate lock and are adjusted afterwards.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use tracing::{debug, warn};

use super::pagination::{finish_page, Page, PageCursor, PageRequest};
use super::{check_post_author, require_keys, SocialStore, StoreError, StoreResult};
use crate::models::{
    BlobRef, Follow, FollowCounts, Image, Like, Post, PostInteractionCounts, Profile,
    ProfileCounts,
};

/// `(partition key, created_at, uri)` clustering key of a list view
type ViewKey = (String, DateTime<Utc>, String);

#[derive(Default)]
struct Views {
    profiles: HashMap<String, Profile>,

    posts_by_uri: HashMap<String, Post>,
    posts_by_actor: BTreeMap<ViewKey, Post>,
    images_by_post: BTreeMap<(String, i32), Image>,

    likes_by_subject: BTreeMap<ViewKey, Like>,
    likes_by_actor: BTreeMap<ViewKey, Like>,
    likes_by_uri: HashMap<String, Like>,
    likes_by_actor_subject: HashMap<(String, String), Like>,

    follows_by_subject: BTreeMap<ViewKey, Follow>,
    follows_by_actor: BTreeMap<ViewKey, Follow>,
    follows_by_uri: HashMap<String, Follow>,
    follows_by_actor_subject: HashMap<(String, String), Follow>,

    blob_refs: HashMap<(String, String), BlobRef>,
}

#[derive(Default)]
struct Counters {
    follows: HashMap<String, FollowCounts>,
    profiles: HashMap<String, ProfileCounts>,
    posts: HashMap<String, PostInteractionCounts>,
}

fn view_key(partition: &str, created_at: DateTime<Utc>, uri: &str) -> ViewKey {
    (partition.to_string(), created_at, uri.to_string())
}

/// Rows of one partition in `(created_at DESC, uri DESC)` order, strictly
/// after `cursor`, at most `take` of them.
fn page_desc<T: Clone>(
    view: &BTreeMap<ViewKey, T>,
    partition: &str,
    cursor: Option<&PageCursor>,
    take: usize,
) -> Vec<T> {
    let (lower, end) = partition_bounds(partition);
    let upper = match cursor {
        Some(c) => Bound::Excluded((partition.to_string(), c.created_at, c.uri.clone())),
        None => end,
    };
    view.range((lower, upper))
        .rev()
        .take(take)
        .map(|(_, row)| row.clone())
        .collect()
}

/// Every key of one partition
fn partition_bounds(partition: &str) -> (Bound<ViewKey>, Bound<ViewKey>) {
    (
        Bound::Included((partition.to_string(), DateTime::<Utc>::MIN_UTC, String::new())),
        // First key of the next partition
        Bound::Excluded((format!("{}\0", partition), DateTime::<Utc>::MIN_UTC, String::new())),
    )
}

/// Counters never go below zero, even when replays remove rows twice
fn bump(value: &mut i64, delta: i64) {
    *value = (*value + delta).max(0);
}

fn select_counts<T: Copy>(counters: &HashMap<String, T>, keys: &[String]) -> HashMap<String, T> {
    keys.iter()
        .filter_map(|key| counters.get(key).map(|value| (key.clone(), *value)))
        .collect()
}

impl Views {
    fn images_of(&self, post_uri: &str) -> Vec<Image> {
        self.images_by_post
            .range((post_uri.to_string(), i32::MIN)..=(post_uri.to_string(), i32::MAX))
            .map(|(_, image)| image.clone())
            .collect()
    }

    fn with_images(&self, mut post: Post) -> Post {
        post.images = self.images_of(&post.uri);
        post
    }

    fn insert_post(&mut self, post: &Post) {
        let mut row = post.clone();
        row.images = Vec::new();
        for (index, image) in post.images.iter().enumerate() {
            self.images_by_post
                .insert((post.uri.clone(), index as i32), image.clone());
        }
        self.posts_by_actor.insert(
            view_key(&post.author_did, post.created_at, &post.uri),
            row.clone(),
        );
        self.posts_by_uri.insert(post.uri.clone(), row);
    }

    fn remove_post(&mut self, post: &Post) {
        self.posts_by_uri.remove(&post.uri);
        self.posts_by_actor
            .remove(&view_key(&post.author_did, post.created_at, &post.uri));
        let indexes: Vec<(String, i32)> = self
            .images_by_post
            .range((post.uri.clone(), i32::MIN)..=(post.uri.clone(), i32::MAX))
            .map(|(key, _)| key.clone())
            .collect();
        for key in indexes {
            self.images_by_post.remove(&key);
        }
    }

    fn insert_like(&mut self, like: &Like) {
        self.likes_by_subject.insert(
            view_key(&like.subject_uri, like.created_at, &like.uri),
            like.clone(),
        );
        self.likes_by_actor.insert(
            view_key(&like.author_did, like.created_at, &like.uri),
            like.clone(),
        );
        self.likes_by_uri.insert(like.uri.clone(), like.clone());
        self.likes_by_actor_subject.insert(
            (like.author_did.clone(), like.subject_uri.clone()),
            like.clone(),
        );
    }

    fn remove_like(&mut self, like: &Like) {
        self.likes_by_subject
            .remove(&view_key(&like.subject_uri, like.created_at, &like.uri));
        self.likes_by_actor
            .remove(&view_key(&like.author_did, like.created_at, &like.uri));
        self.likes_by_uri.remove(&like.uri);

        // The pair may already point at a newer like with another uri
        let key = (like.author_did.clone(), like.subject_uri.clone());
        if self.likes_by_actor_subject.get(&key).is_some_and(|l| l.uri == like.uri) {
            self.likes_by_actor_subject.remove(&key);
            let survivor = self
                .likes_by_actor
                .range(partition_bounds(&like.author_did))
                .rev()
                .map(|(_, l)| l)
                .find(|l| l.subject_uri == like.subject_uri)
                .cloned();
            if let Some(survivor) = survivor {
                self.likes_by_actor_subject.insert(key, survivor);
            }
        }
    }

    fn insert_follow(&mut self, follow: &Follow) {
        self.follows_by_subject.insert(
            view_key(&follow.subject_did, follow.created_at, &follow.uri),
            follow.clone(),
        );
        self.follows_by_actor.insert(
            view_key(&follow.author_did, follow.created_at, &follow.uri),
            follow.clone(),
        );
        self.follows_by_uri.insert(follow.uri.clone(), follow.clone());
        self.follows_by_actor_subject.insert(
            (follow.author_did.clone(), follow.subject_did.clone()),
            follow.clone(),
        );
    }

    fn remove_follow(&mut self, follow: &Follow) {
        self.follows_by_subject
            .remove(&view_key(&follow.subject_did, follow.created_at, &follow.uri));
        self.follows_by_actor
            .remove(&view_key(&follow.author_did, follow.created_at, &follow.uri));
        self.follows_by_uri.remove(&follow.uri);

        let key = (follow.author_did.clone(), follow.subject_did.clone());
        if self.follows_by_actor_subject.get(&key).is_some_and(|f| f.uri == follow.uri) {
            self.follows_by_actor_subject.remove(&key);
            let survivor = self
                .follows_by_actor
                .range(partition_bounds(&follow.author_did))
                .rev()
                .map(|(_, f)| f)
                .find(|f| f.subject_did == follow.subject_did)
                .cloned();
            if let Some(survivor) = survivor {
                self.follows_by_actor_subject.insert(key, survivor);
            }
        }
    }
}

/// In-memory storage engine
#[derive(Default)]
pub struct MemoryStore {
    views: RwLock<Views>,
    counters: Mutex<Counters>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows in each like view, in `(by subject, by actor, by uri,
    /// by actor+subject)` order
    pub fn like_view_sizes(&self) -> (usize, usize, usize, usize) {
        let views = self.views.read();
        (
            views.likes_by_subject.len(),
            views.likes_by_actor.len(),
            views.likes_by_uri.len(),
            views.likes_by_actor_subject.len(),
        )
    }

    /// Number of rows in each follow view, same order as [`Self::like_view_sizes`]
    pub fn follow_view_sizes(&self) -> (usize, usize, usize, usize) {
        let views = self.views.read();
        (
            views.follows_by_subject.len(),
            views.follows_by_actor.len(),
            views.follows_by_uri.len(),
            views.follows_by_actor_subject.len(),
        )
    }

    fn adjust_follow_counts(&self, author: &str, subject: &str, delta: i64) {
        let mut counters = self.counters.lock();
        bump(&mut counters.follows.entry(author.to_string()).or_default().following, delta);
        bump(&mut counters.follows.entry(subject.to_string()).or_default().followers, delta);
    }

    fn adjust_post_counts(&self, post: &Post, delta: i64) {
        let mut counters = self.counters.lock();
        bump(
            &mut counters.profiles.entry(post.author_did.clone()).or_default().posts,
            delta,
        );
        if let Some(parent) = &post.reply_parent_uri {
            bump(&mut counters.posts.entry(parent.clone()).or_default().replies, delta);
        }
    }

    fn adjust_like_counts(&self, subject_uri: &str, delta: i64) {
        let mut counters = self.counters.lock();
        bump(&mut counters.posts.entry(subject_uri.to_string()).or_default().likes, delta);
    }
}

#[async_trait]
impl SocialStore for MemoryStore {
    async fn create_profile(&self, mut profile: Profile) -> StoreResult<()> {
        let now = Utc::now();
        profile.indexed_at = now;
        profile.updated_at = now;
        self.views.write().profiles.insert(profile.did.clone(), profile);
        Ok(())
    }

    async fn update_profile(&self, profile: Profile) -> StoreResult<()> {
        let now = Utc::now();
        let mut views = self.views.write();
        match views.profiles.get_mut(&profile.did) {
            Some(existing) => {
                existing.display_name = profile.display_name;
                existing.description = profile.description;
                existing.pronouns = profile.pronouns;
                existing.avatar = profile.avatar;
                existing.updated_at = now;
            }
            None => {
                debug!("Profile {} not indexed yet, inserting on update", profile.did);
                let mut profile = profile;
                profile.indexed_at = now;
                profile.updated_at = now;
                views.profiles.insert(profile.did.clone(), profile);
            }
        }
        Ok(())
    }

    async fn delete_profile(&self, did: &str) -> StoreResult<()> {
        match self.views.write().profiles.remove(did) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound),
        }
    }

    async fn get_profile(&self, did: &str) -> StoreResult<Profile> {
        self.views
            .read()
            .profiles
            .get(did)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn get_profiles(&self, dids: &[String]) -> StoreResult<Vec<Profile>> {
        let views = self.views.read();
        Ok(dids
            .iter()
            .filter_map(|did| views.profiles.get(did).cloned())
            .collect())
    }

    async fn get_profile_counts(
        &self,
        dids: &[String],
    ) -> StoreResult<HashMap<String, ProfileCounts>> {
        Ok(select_counts(&self.counters.lock().profiles, dids))
    }

    async fn create_post(&self, mut post: Post) -> StoreResult<()> {
        check_post_author(&mut post)?;
        post.indexed_at = Utc::now();

        let previous = {
            let mut views = self.views.write();
            let previous = views.posts_by_uri.get(&post.uri).cloned();
            if let Some(previous) = &previous {
                views.remove_post(previous);
            }
            views.insert_post(&post);
            previous
        };

        // A replay moves the counts from the old row's keys to the new ones
        if let Some(previous) = &previous {
            if previous.reply_parent_uri == post.reply_parent_uri {
                debug!("Post {} already indexed, counters unchanged", post.uri);
                return Ok(());
            }
            self.adjust_post_counts(previous, -1);
        }
        self.adjust_post_counts(&post, 1);
        Ok(())
    }

    async fn delete_post(&self, uri: &str) -> StoreResult<()> {
        let removed = {
            let mut views = self.views.write();
            let post = views.posts_by_uri.get(uri).cloned();
            if let Some(post) = &post {
                views.remove_post(post);
            }
            post
        };

        match removed {
            Some(post) => {
                self.adjust_post_counts(&post, -1);
                Ok(())
            }
            None => {
                warn!("Post not found for delete: {}", uri);
                Err(StoreError::NotFound)
            }
        }
    }

    async fn get_posts(&self, uris: &[String]) -> StoreResult<Vec<Post>> {
        require_keys(uris, "URI")?;
        let views = self.views.read();
        Ok(uris
            .iter()
            .filter_map(|uri| views.posts_by_uri.get(uri).cloned())
            .map(|post| views.with_images(post))
            .collect())
    }

    async fn get_posts_by_actor(&self, did: &str, page: PageRequest) -> StoreResult<Page<Post>> {
        let (limit, cursor) = page.resolve()?;
        let views = self.views.read();
        let rows = page_desc(&views.posts_by_actor, did, cursor.as_ref(), limit + 1)
            .into_iter()
            .map(|post| views.with_images(post))
            .collect();
        Ok(finish_page(rows, limit, |p: &Post| (p.created_at, p.uri.clone())))
    }

    async fn get_posts_interaction_counts(
        &self,
        uris: &[String],
    ) -> StoreResult<HashMap<String, PostInteractionCounts>> {
        Ok(select_counts(&self.counters.lock().posts, uris))
    }

    async fn create_like(&self, mut like: Like) -> StoreResult<()> {
        like.indexed_at = Utc::now();
        let previous = {
            let mut views = self.views.write();
            let previous = views.likes_by_uri.get(&like.uri).cloned();
            if let Some(previous) = &previous {
                views.remove_like(previous);
            }
            views.insert_like(&like);
            previous
        };

        if let Some(previous) = &previous {
            if previous.subject_uri == like.subject_uri {
                return Ok(());
            }
            self.adjust_like_counts(&previous.subject_uri, -1);
        }
        self.adjust_like_counts(&like.subject_uri, 1);
        Ok(())
    }

    async fn delete_like(&self, uri: &str) -> StoreResult<()> {
        let removed = {
            let mut views = self.views.write();
            let like = views.likes_by_uri.get(uri).cloned();
            if let Some(like) = &like {
                views.remove_like(like);
            }
            like
        };

        match removed {
            Some(like) => {
                self.adjust_like_counts(&like.subject_uri, -1);
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn get_likes_by_subject(
        &self,
        subject_uri: &str,
        page: PageRequest,
    ) -> StoreResult<Page<Like>> {
        let (limit, cursor) = page.resolve()?;
        let views = self.views.read();
        let rows = page_desc(&views.likes_by_subject, subject_uri, cursor.as_ref(), limit + 1);
        Ok(finish_page(rows, limit, |l: &Like| (l.created_at, l.uri.clone())))
    }

    async fn get_like_for_author_subject(
        &self,
        author_did: &str,
        subject_uri: &str,
    ) -> StoreResult<Option<Like>> {
        Ok(self
            .views
            .read()
            .likes_by_actor_subject
            .get(&(author_did.to_string(), subject_uri.to_string()))
            .cloned())
    }

    async fn create_follow(&self, mut follow: Follow) -> StoreResult<()> {
        follow.indexed_at = Utc::now();
        let previous = {
            let mut views = self.views.write();
            let previous = views.follows_by_uri.get(&follow.uri).cloned();
            if let Some(previous) = &previous {
                views.remove_follow(previous);
            }
            views.insert_follow(&follow);
            previous
        };

        if let Some(previous) = &previous {
            if previous.subject_did == follow.subject_did {
                return Ok(());
            }
            self.adjust_follow_counts(&previous.author_did, &previous.subject_did, -1);
        }
        self.adjust_follow_counts(&follow.author_did, &follow.subject_did, 1);
        Ok(())
    }

    async fn delete_follow(&self, uri: &str) -> StoreResult<()> {
        let removed = {
            let mut views = self.views.write();
            let follow = views.follows_by_uri.get(uri).cloned();
            if let Some(follow) = &follow {
                views.remove_follow(follow);
            }
            follow
        };

        match removed {
            Some(follow) => {
                self.adjust_follow_counts(&follow.author_did, &follow.subject_did, -1);
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn get_follows_by_actor(
        &self,
        did: &str,
        page: PageRequest,
    ) -> StoreResult<Page<Follow>> {
        let (limit, cursor) = page.resolve()?;
        let views = self.views.read();
        let rows = page_desc(&views.follows_by_actor, did, cursor.as_ref(), limit + 1);
        Ok(finish_page(rows, limit, |f: &Follow| (f.created_at, f.uri.clone())))
    }

    async fn get_followers_by_actor(
        &self,
        did: &str,
        page: PageRequest,
    ) -> StoreResult<Page<Follow>> {
        let (limit, cursor) = page.resolve()?;
        let views = self.views.read();
        let rows = page_desc(&views.follows_by_subject, did, cursor.as_ref(), limit + 1);
        Ok(finish_page(rows, limit, |f: &Follow| (f.created_at, f.uri.clone())))
    }

    async fn get_follow_for_author_subject(
        &self,
        author_did: &str,
        subject_did: &str,
    ) -> StoreResult<Option<Follow>> {
        Ok(self
            .views
            .read()
            .follows_by_actor_subject
            .get(&(author_did.to_string(), subject_did.to_string()))
            .cloned())
    }

    async fn get_follow_counts(&self, dids: &[String]) -> StoreResult<HashMap<String, FollowCounts>> {
        Ok(select_counts(&self.counters.lock().follows, dids))
    }

    async fn create_blob_ref(&self, mut blob_ref: BlobRef) -> StoreResult<()> {
        blob_ref.updated_at = Utc::now();
        // A racing tracker may have created the row first; keep its takedown state
        self.views
            .write()
            .blob_refs
            .entry((blob_ref.did.clone(), blob_ref.cid.clone()))
            .or_insert(blob_ref);
        Ok(())
    }

    async fn update_blob_ref(&self, blob_ref: BlobRef) -> StoreResult<()> {
        let mut views = self.views.write();
        let existing = views
            .blob_refs
            .get_mut(&(blob_ref.did.clone(), blob_ref.cid.clone()))
            .ok_or(StoreError::NotFound)?;
        existing.processed_at = blob_ref.processed_at;
        existing.updated_at = Utc::now();
        existing.taken_down = blob_ref.taken_down;
        existing.takedown_reason = blob_ref.takedown_reason;
        existing.taken_down_at = blob_ref.taken_down_at;
        existing.tags = blob_ref.tags;
        Ok(())
    }

    async fn get_blob_ref(&self, did: &str, cid: &str) -> StoreResult<BlobRef> {
        self.views
            .read()
            .blob_refs
            .get(&(did.to_string(), cid.to_string()))
            .cloned()
            .ok_or(StoreError::NotFound)
    }
}
