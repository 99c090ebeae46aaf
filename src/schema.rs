// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

// Import diesel table macros
use diesel::allow_tables_to_appear_in_same_query;
use diesel::table;

table! {
    profiles (did) {
        did -> Text,
        display_name -> Nullable<Text>,
        description -> Nullable<Text>,
        pronouns -> Nullable<Text>,
        avatar -> Nullable<Text>,
        created_at -> Timestamptz,
        indexed_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

// Post views share one column layout so a single Queryable row type loads
// from either of them.
table! {
    posts_by_uri (uri) {
        uri -> Text,
        cid -> Text,
        author_did -> Text,
        caption -> Nullable<Text>,
        facets -> Nullable<Bytea>,
        reply_root_uri -> Nullable<Text>,
        reply_parent_uri -> Nullable<Text>,
        created_at -> Timestamptz,
        indexed_at -> Timestamptz,
    }
}

table! {
    posts_by_actor (author_did, created_at, uri) {
        uri -> Text,
        cid -> Text,
        author_did -> Text,
        caption -> Nullable<Text>,
        facets -> Nullable<Bytea>,
        reply_root_uri -> Nullable<Text>,
        reply_parent_uri -> Nullable<Text>,
        created_at -> Timestamptz,
        indexed_at -> Timestamptz,
    }
}

table! {
    images_by_post (post_uri, image_index) {
        post_uri -> Text,
        image_index -> Integer,
        cid -> Text,
        alt -> Nullable<Text>,
        width -> Nullable<BigInt>,
        height -> Nullable<BigInt>,
        size -> Nullable<BigInt>,
        mime -> Nullable<Text>,
    }
}

// Like views
table! {
    likes_by_subject (subject_uri, created_at, uri) {
        uri -> Text,
        cid -> Text,
        subject_uri -> Text,
        subject_cid -> Text,
        author_did -> Text,
        created_at -> Timestamptz,
        indexed_at -> Timestamptz,
    }
}

table! {
    likes_by_actor (author_did, created_at, uri) {
        uri -> Text,
        cid -> Text,
        subject_uri -> Text,
        subject_cid -> Text,
        author_did -> Text,
        created_at -> Timestamptz,
        indexed_at -> Timestamptz,
    }
}

table! {
    likes_by_uri (uri) {
        uri -> Text,
        cid -> Text,
        subject_uri -> Text,
        subject_cid -> Text,
        author_did -> Text,
        created_at -> Timestamptz,
        indexed_at -> Timestamptz,
    }
}

table! {
    likes_by_actor_subject (author_did, subject_uri) {
        uri -> Text,
        cid -> Text,
        subject_uri -> Text,
        subject_cid -> Text,
        author_did -> Text,
        created_at -> Timestamptz,
        indexed_at -> Timestamptz,
    }
}

// Follow views
table! {
    follows_by_subject (subject_did, created_at, uri) {
        uri -> Text,
        cid -> Text,
        subject_did -> Text,
        author_did -> Text,
        created_at -> Timestamptz,
        indexed_at -> Timestamptz,
    }
}

table! {
    follows_by_actor (author_did, created_at, uri) {
        uri -> Text,
        cid -> Text,
        subject_did -> Text,
        author_did -> Text,
        created_at -> Timestamptz,
        indexed_at -> Timestamptz,
    }
}

table! {
    follows_by_uri (uri) {
        uri -> Text,
        cid -> Text,
        subject_did -> Text,
        author_did -> Text,
        created_at -> Timestamptz,
        indexed_at -> Timestamptz,
    }
}

table! {
    follows_by_actor_subject (author_did, subject_did) {
        uri -> Text,
        cid -> Text,
        subject_did -> Text,
        author_did -> Text,
        created_at -> Timestamptz,
        indexed_at -> Timestamptz,
    }
}

table! {
    blob_refs (did, cid) {
        did -> Text,
        cid -> Text,
        first_seen_at -> Timestamptz,
        processed_at -> Nullable<Timestamptz>,
        updated_at -> Timestamptz,
        taken_down -> Bool,
        takedown_reason -> Nullable<Text>,
        taken_down_at -> Nullable<Timestamptz>,
        tags -> Array<Text>,
    }
}

// Counters
table! {
    follow_counts (did) {
        did -> Text,
        following_count -> BigInt,
        followers_count -> BigInt,
    }
}

table! {
    profile_counts (did) {
        did -> Text,
        post_count -> BigInt,
    }
}

table! {
    post_interaction_counts (post_uri) {
        post_uri -> Text,
        like_count -> BigInt,
        reply_count -> BigInt,
    }
}

// Relay log
table! {
    relay_partitions (topic, partition_id) {
        topic -> Text,
        partition_id -> Integer,
        next_offset -> BigInt,
    }
}

table! {
    relay_log (topic, partition_id, log_offset) {
        topic -> Text,
        partition_id -> Integer,
        log_offset -> BigInt,
        record_key -> Text,
        payload -> Bytea,
        appended_at -> Timestamptz,
    }
}

table! {
    relay_offsets (consumer_group, topic, partition_id) {
        consumer_group -> Text,
        topic -> Text,
        partition_id -> Integer,
        next_offset -> BigInt,
        updated_at -> Timestamptz,
    }
}

allow_tables_to_appear_in_same_query!(
    profiles,
    posts_by_uri,
    posts_by_actor,
    images_by_post,
    likes_by_subject,
    likes_by_actor,
    likes_by_uri,
    likes_by_actor_subject,
    follows_by_subject,
    follows_by_actor,
    follows_by_uri,
    follows_by_actor_subject,
    blob_refs,
    follow_counts,
    profile_counts,
    post_interaction_counts,
    relay_partitions,
    relay_log,
    relay_offsets,
);
