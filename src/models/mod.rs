// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

pub mod blob_ref;
pub mod counts;
pub mod encoding;
pub mod follow;
pub mod like;
pub mod post;
pub mod profile;

pub use blob_ref::BlobRef;
pub use counts::{FollowCounts, PostInteractionCounts, ProfileCounts};
pub use follow::Follow;
pub use like::Like;
pub use post::{Image, ImageRow, Post, PostRow};
pub use profile::Profile;
