// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

//! Postgres storage engine.
//!
//! The fan-out batch for a record runs inside one transaction. Counter deltas
//! are upserts issued after the transaction commits.

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::upsert::excluded;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use scoped_futures::ScopedFutureExt;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::pagination::{finish_page, Page, PageRequest};
use super::{check_post_author, require_keys, SocialStore, StoreError, StoreResult};
use crate::db::{Database, DbConnection};
use crate::models::{
    BlobRef, Follow, FollowCounts, Image, ImageRow, Like, Post, PostInteractionCounts, PostRow,
    Profile, ProfileCounts,
};
use crate::schema::{
    blob_refs, follow_counts, follows_by_actor, follows_by_actor_subject, follows_by_subject,
    follows_by_uri, images_by_post, likes_by_actor, likes_by_actor_subject, likes_by_subject,
    likes_by_uri, post_interaction_counts, posts_by_actor, posts_by_uri, profile_counts, profiles,
};

sql_function! {
    /// Postgres `GREATEST`, used to keep counters from going below zero
    fn greatest(a: diesel::sql_types::BigInt, b: diesel::sql_types::BigInt) -> diesel::sql_types::BigInt;
}

/// Column assignments of a like row for any of the like views
macro_rules! like_values {
    ($table:ident, $like:expr) => {
        (
            $table::uri.eq(&$like.uri),
            $table::cid.eq(&$like.cid),
            $table::subject_uri.eq(&$like.subject_uri),
            $table::subject_cid.eq(&$like.subject_cid),
            $table::author_did.eq(&$like.author_did),
            $table::created_at.eq($like.created_at),
            $table::indexed_at.eq($like.indexed_at),
        )
    };
}

/// Column assignments of a follow row for any of the follow views
macro_rules! follow_values {
    ($table:ident, $follow:expr) => {
        (
            $table::uri.eq(&$follow.uri),
            $table::cid.eq(&$follow.cid),
            $table::subject_did.eq(&$follow.subject_did),
            $table::author_did.eq(&$follow.author_did),
            $table::created_at.eq($follow.created_at),
            $table::indexed_at.eq($follow.indexed_at),
        )
    };
}

macro_rules! post_values {
    ($table:ident, $post:expr) => {
        (
            $table::uri.eq(&$post.uri),
            $table::cid.eq(&$post.cid),
            $table::author_did.eq(&$post.author_did),
            $table::caption.eq(&$post.caption),
            $table::facets.eq(&$post.facets),
            $table::reply_root_uri.eq(&$post.reply_root_uri),
            $table::reply_parent_uri.eq(&$post.reply_parent_uri),
            $table::created_at.eq($post.created_at),
            $table::indexed_at.eq($post.indexed_at),
        )
    };
}

/// Keyset page over one partition of a `(partition, created_at, uri)` view:
/// `(created_at DESC, uri DESC)` order, strict `(created_at, uri) < cursor`,
/// `limit + 1` rows.
macro_rules! keyset_page {
    ($conn:expr, $table:ident, $partition:ident, $key:expr, $cursor:expr, $take:expr, $row:ty) => {{
        let mut query = $table::table
            .filter($table::$partition.eq($key))
            .into_boxed();
        if let Some(cursor) = $cursor {
            query = query.filter(
                $table::created_at.lt(cursor.created_at).or($table::created_at
                    .eq(cursor.created_at)
                    .and($table::uri.lt(cursor.uri.clone()))),
            );
        }
        query
            .order(($table::created_at.desc(), $table::uri.desc()))
            .limit($take as i64)
            .load::<$row>($conn)
            .await
    }};
}

/// Postgres-backed storage engine
pub struct PgStore {
    db: Arc<Database>,
}

impl PgStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    async fn get_connection(&self) -> StoreResult<DbConnection> {
        self.db.get_connection().await.map_err(|e| {
            error!("Failed to get database connection: {}", e);
            StoreError::backend(e)
        })
    }
}

async fn insert_like_rows(conn: &mut AsyncPgConnection, like: &Like) -> QueryResult<()> {
    diesel::insert_into(likes_by_subject::table)
        .values(like_values!(likes_by_subject, like))
        .on_conflict_do_nothing()
        .execute(conn)
        .await?;
    diesel::insert_into(likes_by_actor::table)
        .values(like_values!(likes_by_actor, like))
        .on_conflict_do_nothing()
        .execute(conn)
        .await?;
    diesel::insert_into(likes_by_uri::table)
        .values(like_values!(likes_by_uri, like))
        .on_conflict_do_nothing()
        .execute(conn)
        .await?;
    diesel::insert_into(likes_by_actor_subject::table)
        .values(like_values!(likes_by_actor_subject, like))
        .on_conflict((likes_by_actor_subject::author_did, likes_by_actor_subject::subject_uri))
        .do_update()
        .set(like_values!(likes_by_actor_subject, like))
        .execute(conn)
        .await?;
    Ok(())
}

async fn delete_like_rows(conn: &mut AsyncPgConnection, like: &Like) -> QueryResult<()> {
    diesel::delete(
        likes_by_subject::table
            .filter(likes_by_subject::subject_uri.eq(&like.subject_uri))
            .filter(likes_by_subject::created_at.eq(like.created_at))
            .filter(likes_by_subject::uri.eq(&like.uri)),
    )
    .execute(conn)
    .await?;
    diesel::delete(
        likes_by_actor::table
            .filter(likes_by_actor::author_did.eq(&like.author_did))
            .filter(likes_by_actor::created_at.eq(like.created_at))
            .filter(likes_by_actor::uri.eq(&like.uri)),
    )
    .execute(conn)
    .await?;
    diesel::delete(likes_by_uri::table.filter(likes_by_uri::uri.eq(&like.uri)))
        .execute(conn)
        .await?;
    let cleared = diesel::delete(
        likes_by_actor_subject::table
            .filter(likes_by_actor_subject::author_did.eq(&like.author_did))
            .filter(likes_by_actor_subject::subject_uri.eq(&like.subject_uri))
            .filter(likes_by_actor_subject::uri.eq(&like.uri)),
    )
    .execute(conn)
    .await?;
    if cleared > 0 {
        let survivor = likes_by_actor::table
            .filter(likes_by_actor::author_did.eq(&like.author_did))
            .filter(likes_by_actor::subject_uri.eq(&like.subject_uri))
            .order((likes_by_actor::created_at.desc(), likes_by_actor::uri.desc()))
            .first::<Like>(conn)
            .await
            .optional()?;
        if let Some(survivor) = survivor {
            diesel::insert_into(likes_by_actor_subject::table)
                .values(like_values!(likes_by_actor_subject, survivor))
                .on_conflict_do_nothing()
                .execute(conn)
                .await?;
        }
    }
    Ok(())
}

async fn insert_follow_rows(conn: &mut AsyncPgConnection, follow: &Follow) -> QueryResult<()> {
    diesel::insert_into(follows_by_subject::table)
        .values(follow_values!(follows_by_subject, follow))
        .on_conflict_do_nothing()
        .execute(conn)
        .await?;
    diesel::insert_into(follows_by_actor::table)
        .values(follow_values!(follows_by_actor, follow))
        .on_conflict_do_nothing()
        .execute(conn)
        .await?;
    diesel::insert_into(follows_by_uri::table)
        .values(follow_values!(follows_by_uri, follow))
        .on_conflict_do_nothing()
        .execute(conn)
        .await?;
    diesel::insert_into(follows_by_actor_subject::table)
        .values(follow_values!(follows_by_actor_subject, follow))
        .on_conflict((
            follows_by_actor_subject::author_did,
            follows_by_actor_subject::subject_did,
        ))
        .do_update()
        .set(follow_values!(follows_by_actor_subject, follow))
        .execute(conn)
        .await?;
    Ok(())
}

async fn delete_follow_rows(conn: &mut AsyncPgConnection, follow: &Follow) -> QueryResult<()> {
    diesel::delete(
        follows_by_subject::table
            .filter(follows_by_subject::subject_did.eq(&follow.subject_did))
            .filter(follows_by_subject::created_at.eq(follow.created_at))
            .filter(follows_by_subject::uri.eq(&follow.uri)),
    )
    .execute(conn)
    .await?;
    diesel::delete(
        follows_by_actor::table
            .filter(follows_by_actor::author_did.eq(&follow.author_did))
            .filter(follows_by_actor::created_at.eq(follow.created_at))
            .filter(follows_by_actor::uri.eq(&follow.uri)),
    )
    .execute(conn)
    .await?;
    diesel::delete(follows_by_uri::table.filter(follows_by_uri::uri.eq(&follow.uri)))
        .execute(conn)
        .await?;
    let cleared = diesel::delete(
        follows_by_actor_subject::table
            .filter(follows_by_actor_subject::author_did.eq(&follow.author_did))
            .filter(follows_by_actor_subject::subject_did.eq(&follow.subject_did))
            .filter(follows_by_actor_subject::uri.eq(&follow.uri)),
    )
    .execute(conn)
    .await?;
    if cleared > 0 {
        let survivor = follows_by_actor::table
            .filter(follows_by_actor::author_did.eq(&follow.author_did))
            .filter(follows_by_actor::subject_did.eq(&follow.subject_did))
            .order((follows_by_actor::created_at.desc(), follows_by_actor::uri.desc()))
            .first::<Follow>(conn)
            .await
            .optional()?;
        if let Some(survivor) = survivor {
            diesel::insert_into(follows_by_actor_subject::table)
                .values(follow_values!(follows_by_actor_subject, survivor))
                .on_conflict_do_nothing()
                .execute(conn)
                .await?;
        }
    }
    Ok(())
}

async fn insert_post_rows(conn: &mut AsyncPgConnection, post: &Post) -> QueryResult<()> {
    diesel::insert_into(posts_by_uri::table)
        .values(post_values!(posts_by_uri, post))
        .on_conflict_do_nothing()
        .execute(conn)
        .await?;
    diesel::insert_into(posts_by_actor::table)
        .values(post_values!(posts_by_actor, post))
        .on_conflict_do_nothing()
        .execute(conn)
        .await?;
    let images = ImageRow::rows_for(post);
    if !images.is_empty() {
        diesel::insert_into(images_by_post::table)
            .values(&images)
            .on_conflict_do_nothing()
            .execute(conn)
            .await?;
    }
    Ok(())
}

async fn delete_post_rows(conn: &mut AsyncPgConnection, post: &PostRow) -> QueryResult<()> {
    diesel::delete(posts_by_uri::table.filter(posts_by_uri::uri.eq(&post.uri)))
        .execute(conn)
        .await?;
    diesel::delete(
        posts_by_actor::table
            .filter(posts_by_actor::author_did.eq(&post.author_did))
            .filter(posts_by_actor::created_at.eq(post.created_at))
            .filter(posts_by_actor::uri.eq(&post.uri)),
    )
    .execute(conn)
    .await?;
    diesel::delete(images_by_post::table.filter(images_by_post::post_uri.eq(&post.uri)))
        .execute(conn)
        .await?;
    Ok(())
}

async fn adjust_follow_counts(
    conn: &mut AsyncPgConnection,
    author_did: &str,
    subject_did: &str,
    delta: i64,
) -> QueryResult<()> {
    diesel::insert_into(follow_counts::table)
        .values((
            follow_counts::did.eq(author_did),
            follow_counts::following_count.eq(delta.max(0)),
            follow_counts::followers_count.eq(0i64),
        ))
        .on_conflict(follow_counts::did)
        .do_update()
        .set(
            follow_counts::following_count
                .eq(greatest(follow_counts::following_count + delta, 0i64)),
        )
        .execute(conn)
        .await?;
    diesel::insert_into(follow_counts::table)
        .values((
            follow_counts::did.eq(subject_did),
            follow_counts::following_count.eq(0i64),
            follow_counts::followers_count.eq(delta.max(0)),
        ))
        .on_conflict(follow_counts::did)
        .do_update()
        .set(
            follow_counts::followers_count
                .eq(greatest(follow_counts::followers_count + delta, 0i64)),
        )
        .execute(conn)
        .await?;
    Ok(())
}

async fn adjust_like_count(
    conn: &mut AsyncPgConnection,
    subject_uri: &str,
    delta: i64,
) -> QueryResult<()> {
    diesel::insert_into(post_interaction_counts::table)
        .values((
            post_interaction_counts::post_uri.eq(subject_uri),
            post_interaction_counts::like_count.eq(delta.max(0)),
            post_interaction_counts::reply_count.eq(0i64),
        ))
        .on_conflict(post_interaction_counts::post_uri)
        .do_update()
        .set(
            post_interaction_counts::like_count
                .eq(greatest(post_interaction_counts::like_count + delta, 0i64)),
        )
        .execute(conn)
        .await?;
    Ok(())
}

async fn adjust_post_counts(
    conn: &mut AsyncPgConnection,
    author_did: &str,
    reply_parent_uri: Option<&str>,
    delta: i64,
) -> QueryResult<()> {
    diesel::insert_into(profile_counts::table)
        .values((
            profile_counts::did.eq(author_did),
            profile_counts::post_count.eq(delta.max(0)),
        ))
        .on_conflict(profile_counts::did)
        .do_update()
        .set(profile_counts::post_count.eq(greatest(profile_counts::post_count + delta, 0i64)))
        .execute(conn)
        .await?;
    if let Some(parent) = reply_parent_uri {
        diesel::insert_into(post_interaction_counts::table)
            .values((
                post_interaction_counts::post_uri.eq(parent),
                post_interaction_counts::like_count.eq(0i64),
                post_interaction_counts::reply_count.eq(delta.max(0)),
            ))
            .on_conflict(post_interaction_counts::post_uri)
            .do_update()
            .set(
                post_interaction_counts::reply_count
                    .eq(greatest(post_interaction_counts::reply_count + delta, 0i64)),
            )
            .execute(conn)
            .await?;
    }
    Ok(())
}

/// Attach ordered images to post rows
async fn with_images(conn: &mut AsyncPgConnection, rows: Vec<PostRow>) -> QueryResult<Vec<Post>> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    let uris: Vec<String> = rows.iter().map(|row| row.uri.clone()).collect();
    let images = images_by_post::table
        .filter(images_by_post::post_uri.eq_any(uris))
        .order((images_by_post::post_uri.asc(), images_by_post::image_index.asc()))
        .load::<ImageRow>(conn)
        .await?;

    let mut by_post: HashMap<String, Vec<Image>> = HashMap::new();
    for image in images {
        by_post
            .entry(image.post_uri.clone())
            .or_default()
            .push(Image::from(image));
    }
    Ok(rows
        .into_iter()
        .map(|row| {
            let images = by_post.remove(&row.uri).unwrap_or_default();
            row.into_post(images)
        })
        .collect())
}

#[async_trait]
impl SocialStore for PgStore {
    async fn create_profile(&self, mut profile: Profile) -> StoreResult<()> {
        let now = Utc::now();
        profile.indexed_at = now;
        profile.updated_at = now;

        let mut conn = self.get_connection().await?;
        diesel::insert_into(profiles::table)
            .values(&profile)
            .on_conflict(profiles::did)
            .do_update()
            .set(&profile)
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn update_profile(&self, mut profile: Profile) -> StoreResult<()> {
        let now = Utc::now();
        profile.indexed_at = now;
        profile.updated_at = now;

        let mut conn = self.get_connection().await?;
        diesel::insert_into(profiles::table)
            .values(&profile)
            .on_conflict(profiles::did)
            .do_update()
            .set((
                profiles::display_name.eq(excluded(profiles::display_name)),
                profiles::description.eq(excluded(profiles::description)),
                profiles::pronouns.eq(excluded(profiles::pronouns)),
                profiles::avatar.eq(excluded(profiles::avatar)),
                profiles::updated_at.eq(now),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete_profile(&self, did: &str) -> StoreResult<()> {
        let mut conn = self.get_connection().await?;
        let deleted = diesel::delete(profiles::table.filter(profiles::did.eq(did)))
            .execute(&mut conn)
            .await?;
        if deleted == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn get_profile(&self, did: &str) -> StoreResult<Profile> {
        let mut conn = self.get_connection().await?;
        let profile = profiles::table
            .filter(profiles::did.eq(did))
            .select(Profile::as_select())
            .first(&mut conn)
            .await?;
        Ok(profile)
    }

    async fn get_profiles(&self, dids: &[String]) -> StoreResult<Vec<Profile>> {
        if dids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.get_connection().await?;
        let profiles = profiles::table
            .filter(profiles::did.eq_any(dids))
            .select(Profile::as_select())
            .load(&mut conn)
            .await?;
        Ok(profiles)
    }

    async fn get_profile_counts(
        &self,
        dids: &[String],
    ) -> StoreResult<HashMap<String, ProfileCounts>> {
        if dids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = self.get_connection().await?;
        let rows = profile_counts::table
            .filter(profile_counts::did.eq_any(dids))
            .load::<(String, i64)>(&mut conn)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(did, posts)| (did, ProfileCounts { posts }))
            .collect())
    }

    async fn create_post(&self, mut post: Post) -> StoreResult<()> {
        check_post_author(&mut post)?;
        post.indexed_at = Utc::now();

        let mut conn = self.get_connection().await?;
        let conn: &mut AsyncPgConnection = &mut conn;
        let post_ref = &post;
        let previous = conn
            .transaction::<Option<PostRow>, StoreError, _>(|conn| {
                async move {
                    let previous = posts_by_uri::table
                        .filter(posts_by_uri::uri.eq(&post_ref.uri))
                        .first::<PostRow>(conn)
                        .await
                        .optional()?;
                    if let Some(previous) = &previous {
                        delete_post_rows(conn, previous).await?;
                    }
                    insert_post_rows(conn, post_ref).await?;
                    Ok(previous)
                }
                .scope_boxed()
            })
            .await?;

        // A replay moves the counts from the old row's keys to the new ones
        if let Some(previous) = &previous {
            if previous.reply_parent_uri == post.reply_parent_uri {
                debug!("Post {} already indexed, counters unchanged", post.uri);
                return Ok(());
            }
            adjust_post_counts(
                conn,
                &previous.author_did,
                previous.reply_parent_uri.as_deref(),
                -1,
            )
            .await?;
        }
        adjust_post_counts(conn, &post.author_did, post.reply_parent_uri.as_deref(), 1).await?;
        Ok(())
    }

    async fn delete_post(&self, uri: &str) -> StoreResult<()> {
        let mut conn = self.get_connection().await?;
        let conn: &mut AsyncPgConnection = &mut conn;
        let removed = conn
            .transaction::<Option<PostRow>, StoreError, _>(|conn| {
                async move {
                    let post = posts_by_uri::table
                        .filter(posts_by_uri::uri.eq(uri))
                        .first::<PostRow>(conn)
                        .await
                        .optional()?;
                    if let Some(post) = &post {
                        delete_post_rows(conn, post).await?;
                    }
                    Ok(post)
                }
                .scope_boxed()
            })
            .await?;

        let post = removed.ok_or_else(|| {
            warn!("Post not found for delete: {}", uri);
            StoreError::NotFound
        })?;
        adjust_post_counts(conn, &post.author_did, post.reply_parent_uri.as_deref(), -1).await?;
        Ok(())
    }

    async fn get_posts(&self, uris: &[String]) -> StoreResult<Vec<Post>> {
        require_keys(uris, "URI")?;
        let mut conn = self.get_connection().await?;
        let rows = posts_by_uri::table
            .filter(posts_by_uri::uri.eq_any(uris))
            .load::<PostRow>(&mut conn)
            .await?;
        let mut by_uri: HashMap<String, Post> = with_images(&mut conn, rows)
            .await?
            .into_iter()
            .map(|post| (post.uri.clone(), post))
            .collect();
        Ok(uris.iter().filter_map(|uri| by_uri.remove(uri)).collect())
    }

    async fn get_posts_by_actor(&self, did: &str, page: PageRequest) -> StoreResult<Page<Post>> {
        let (limit, cursor) = page.resolve()?;
        let mut conn = self.get_connection().await?;
        let rows = keyset_page!(
            &mut conn,
            posts_by_actor,
            author_did,
            did,
            cursor.as_ref(),
            limit + 1,
            PostRow
        )?;
        let posts = with_images(&mut conn, rows).await?;
        Ok(finish_page(posts, limit, |p: &Post| (p.created_at, p.uri.clone())))
    }

    async fn get_posts_interaction_counts(
        &self,
        uris: &[String],
    ) -> StoreResult<HashMap<String, PostInteractionCounts>> {
        if uris.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = self.get_connection().await?;
        let rows = post_interaction_counts::table
            .filter(post_interaction_counts::post_uri.eq_any(uris))
            .load::<(String, i64, i64)>(&mut conn)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(uri, likes, replies)| (uri, PostInteractionCounts { likes, replies }))
            .collect())
    }

    async fn create_like(&self, mut like: Like) -> StoreResult<()> {
        like.indexed_at = Utc::now();

        let mut conn = self.get_connection().await?;
        let conn: &mut AsyncPgConnection = &mut conn;
        let like_ref = &like;
        let previous = conn
            .transaction::<Option<Like>, StoreError, _>(|conn| {
                async move {
                    let previous = likes_by_uri::table
                        .filter(likes_by_uri::uri.eq(&like_ref.uri))
                        .first::<Like>(conn)
                        .await
                        .optional()?;
                    if let Some(previous) = &previous {
                        delete_like_rows(conn, previous).await?;
                    }
                    insert_like_rows(conn, like_ref).await?;
                    Ok(previous)
                }
                .scope_boxed()
            })
            .await?;

        if let Some(previous) = &previous {
            if previous.subject_uri == like.subject_uri {
                return Ok(());
            }
            adjust_like_count(conn, &previous.subject_uri, -1).await?;
        }
        adjust_like_count(conn, &like.subject_uri, 1).await?;
        Ok(())
    }

    async fn delete_like(&self, uri: &str) -> StoreResult<()> {
        let mut conn = self.get_connection().await?;
        let conn: &mut AsyncPgConnection = &mut conn;
        let removed = conn
            .transaction::<Option<Like>, StoreError, _>(|conn| {
                async move {
                    let like = likes_by_uri::table
                        .filter(likes_by_uri::uri.eq(uri))
                        .first::<Like>(conn)
                        .await
                        .optional()?;
                    if let Some(like) = &like {
                        delete_like_rows(conn, like).await?;
                    }
                    Ok(like)
                }
                .scope_boxed()
            })
            .await?;

        let like = removed.ok_or(StoreError::NotFound)?;
        adjust_like_count(conn, &like.subject_uri, -1).await?;
        Ok(())
    }

    async fn get_likes_by_subject(
        &self,
        subject_uri: &str,
        page: PageRequest,
    ) -> StoreResult<Page<Like>> {
        let (limit, cursor) = page.resolve()?;
        let mut conn = self.get_connection().await?;
        let rows = keyset_page!(
            &mut conn,
            likes_by_subject,
            subject_uri,
            subject_uri,
            cursor.as_ref(),
            limit + 1,
            Like
        )?;
        Ok(finish_page(rows, limit, |l: &Like| (l.created_at, l.uri.clone())))
    }

    async fn get_like_for_author_subject(
        &self,
        author_did: &str,
        subject_uri: &str,
    ) -> StoreResult<Option<Like>> {
        let mut conn = self.get_connection().await?;
        let like = likes_by_actor_subject::table
            .filter(likes_by_actor_subject::author_did.eq(author_did))
            .filter(likes_by_actor_subject::subject_uri.eq(subject_uri))
            .first::<Like>(&mut conn)
            .await
            .optional()?;
        Ok(like)
    }

    async fn create_follow(&self, mut follow: Follow) -> StoreResult<()> {
        follow.indexed_at = Utc::now();

        let mut conn = self.get_connection().await?;
        let conn: &mut AsyncPgConnection = &mut conn;
        let follow_ref = &follow;
        let previous = conn
            .transaction::<Option<Follow>, StoreError, _>(|conn| {
                async move {
                    let previous = follows_by_uri::table
                        .filter(follows_by_uri::uri.eq(&follow_ref.uri))
                        .first::<Follow>(conn)
                        .await
                        .optional()?;
                    if let Some(previous) = &previous {
                        delete_follow_rows(conn, previous).await?;
                    }
                    insert_follow_rows(conn, follow_ref).await?;
                    Ok(previous)
                }
                .scope_boxed()
            })
            .await?;

        if let Some(previous) = &previous {
            if previous.subject_did == follow.subject_did {
                return Ok(());
            }
            adjust_follow_counts(conn, &previous.author_did, &previous.subject_did, -1).await?;
        }
        adjust_follow_counts(conn, &follow.author_did, &follow.subject_did, 1).await?;
        Ok(())
    }

    async fn delete_follow(&self, uri: &str) -> StoreResult<()> {
        let mut conn = self.get_connection().await?;
        let conn: &mut AsyncPgConnection = &mut conn;
        let removed = conn
            .transaction::<Option<Follow>, StoreError, _>(|conn| {
                async move {
                    let follow = follows_by_uri::table
                        .filter(follows_by_uri::uri.eq(uri))
                        .first::<Follow>(conn)
                        .await
                        .optional()?;
                    if let Some(follow) = &follow {
                        delete_follow_rows(conn, follow).await?;
                    }
                    Ok(follow)
                }
                .scope_boxed()
            })
            .await?;

        let follow = removed.ok_or(StoreError::NotFound)?;
        adjust_follow_counts(conn, &follow.author_did, &follow.subject_did, -1).await?;
        Ok(())
    }

    async fn get_follows_by_actor(
        &self,
        did: &str,
        page: PageRequest,
    ) -> StoreResult<Page<Follow>> {
        let (limit, cursor) = page.resolve()?;
        let mut conn = self.get_connection().await?;
        let rows = keyset_page!(
            &mut conn,
            follows_by_actor,
            author_did,
            did,
            cursor.as_ref(),
            limit + 1,
            Follow
        )?;
        Ok(finish_page(rows, limit, |f: &Follow| (f.created_at, f.uri.clone())))
    }

    async fn get_followers_by_actor(
        &self,
        did: &str,
        page: PageRequest,
    ) -> StoreResult<Page<Follow>> {
        let (limit, cursor) = page.resolve()?;
        let mut conn = self.get_connection().await?;
        let rows = keyset_page!(
            &mut conn,
            follows_by_subject,
            subject_did,
            did,
            cursor.as_ref(),
            limit + 1,
            Follow
        )?;
        Ok(finish_page(rows, limit, |f: &Follow| (f.created_at, f.uri.clone())))
    }

    async fn get_follow_for_author_subject(
        &self,
        author_did: &str,
        subject_did: &str,
    ) -> StoreResult<Option<Follow>> {
        let mut conn = self.get_connection().await?;
        let follow = follows_by_actor_subject::table
            .filter(follows_by_actor_subject::author_did.eq(author_did))
            .filter(follows_by_actor_subject::subject_did.eq(subject_did))
            .first::<Follow>(&mut conn)
            .await
            .optional()?;
        Ok(follow)
    }

    async fn get_follow_counts(&self, dids: &[String]) -> StoreResult<HashMap<String, FollowCounts>> {
        if dids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = self.get_connection().await?;
        let rows = follow_counts::table
            .filter(follow_counts::did.eq_any(dids))
            .load::<(String, i64, i64)>(&mut conn)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(did, following, followers)| (did, FollowCounts { following, followers }))
            .collect())
    }

    async fn create_blob_ref(&self, mut blob_ref: BlobRef) -> StoreResult<()> {
        blob_ref.updated_at = Utc::now();
        let mut conn = self.get_connection().await?;
        diesel::insert_into(blob_refs::table)
            .values(&blob_ref)
            .on_conflict((blob_refs::did, blob_refs::cid))
            .do_nothing()
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn update_blob_ref(&self, blob_ref: BlobRef) -> StoreResult<()> {
        let mut conn = self.get_connection().await?;
        let updated = diesel::update(
            blob_refs::table
                .filter(blob_refs::did.eq(&blob_ref.did))
                .filter(blob_refs::cid.eq(&blob_ref.cid)),
        )
        .set((
            blob_refs::processed_at.eq(blob_ref.processed_at),
            blob_refs::updated_at.eq(Utc::now()),
            blob_refs::taken_down.eq(blob_ref.taken_down),
            blob_refs::takedown_reason.eq(&blob_ref.takedown_reason),
            blob_refs::taken_down_at.eq(blob_ref.taken_down_at),
            blob_refs::tags.eq(&blob_ref.tags),
        ))
        .execute(&mut conn)
        .await?;
        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn get_blob_ref(&self, did: &str, cid: &str) -> StoreResult<BlobRef> {
        let mut conn = self.get_connection().await?;
        let blob_ref = blob_refs::table
            .filter(blob_refs::did.eq(did))
            .filter(blob_refs::cid.eq(cid))
            .select(BlobRef::as_select())
            .first(&mut conn)
            .await?;
        Ok(blob_ref)
    }
}
