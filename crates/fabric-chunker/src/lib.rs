// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fabric Chunker - spherical partitioning geometry
//!
//! The sky is cut into latitude stripes of equal height, every stripe is
//! cut into chunks of equal longitude width, and each chunk is further cut
//! into sub-chunks along sub-stripes. The number of chunks in a stripe is
//! chosen so that chunks stay roughly square as they approach the poles.
//!
//! ```text
//!   stripe 0 ┌────────┬────────┬────────┐  chunk ids: stripe * 2 * numStripes + chunk
//!            │ ss 0   │        │        │
//!            │ ss 1   │        │        │  sub-chunk ids are relative to their chunk
//!   stripe 1 ├──────┬─┴────┬───┴──┬─────┤
//!            └──────┴──────┴──────┴─────┘
//! ```
//!
//! Rows close to a sub-chunk boundary are also copied into the "overlap"
//! of the neighbouring sub-chunks so that proximity joins never need to
//! look outside a single chunk. [`Chunker::locate_with_overlap`] reports
//! those extra memberships.
//!
//! The partitioning is a pure function of `(overlap, num_stripes,
//! num_sub_stripes_per_stripe)` so the loader and the query side always
//! agree on where a row lives.

pub mod chunker;
pub mod error;
pub mod geometry;
pub mod hash;

pub use chunker::{ChunkLocation, Chunker};
pub use error::{ChunkerError, Result};
pub use geometry::{SphericalBox, max_alpha, segments};
pub use hash::hash;
