// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mapping between sky positions and chunk/sub-chunk identifiers.

use serde::{Deserialize, Serialize};

use crate::error::{ChunkerError, Result};
use crate::geometry::{SphericalBox, clamp_lat, clamp_lon, max_alpha, segments};
use crate::hash::hash;

/// Where a position lives: its chunk, its sub-chunk within that chunk and
/// whether the membership is an overlap copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkLocation {
    pub chunk_id: i32,
    pub sub_chunk_id: i32,
    pub overlap: bool,
}

/// Partitions the sphere into chunks and sub-chunks.
///
/// All lookups are O(1) table arithmetic; the tables are computed once in
/// [`Chunker::new`].
#[derive(Debug, Clone)]
pub struct Chunker {
    overlap: f64,
    num_stripes: i32,
    num_sub_stripes_per_stripe: i32,
    sub_stripe_height: f64,
    max_sub_chunks_per_sub_stripe_chunk: i32,
    /// Indexed by stripe.
    num_chunks_per_stripe: Vec<i32>,
    /// Indexed by sub-stripe.
    num_sub_chunks_per_chunk: Vec<i32>,
    /// Indexed by sub-stripe.
    sub_chunk_width: Vec<f64>,
    /// Overlap half-width in longitude, indexed by sub-stripe.
    alpha: Vec<f64>,
}

impl Chunker {
    /// Build the partitioning tables.
    ///
    /// `overlap` is in degrees and must lie in `[0, 10]`. Fails when the
    /// overlap does not fit inside a sub-stripe or a sub-chunk.
    pub fn new(overlap: f64, num_stripes: i32, num_sub_stripes_per_stripe: i32) -> Result<Self> {
        if num_stripes < 1 || num_sub_stripes_per_stripe < 1 {
            return Err(ChunkerError::Configuration(format!(
                "number of stripes ({num_stripes}) and sub-stripes per stripe \
                 ({num_sub_stripes_per_stripe}) must be positive"
            )));
        }
        if !(0.0..=10.0).contains(&overlap) {
            return Err(ChunkerError::Configuration(format!(
                "overlap {overlap} must be in [0, 10] degrees"
            )));
        }
        let num_sub_stripes = num_stripes * num_sub_stripes_per_stripe;
        let stripe_height = 180.0 / f64::from(num_stripes);
        let sub_stripe_height = 180.0 / f64::from(num_sub_stripes);
        if sub_stripe_height < overlap {
            return Err(ChunkerError::Configuration(format!(
                "overlap {overlap} exceeds the sub-stripe height {sub_stripe_height}"
            )));
        }

        let mut num_chunks_per_stripe = Vec::with_capacity(num_stripes as usize);
        let mut num_sub_chunks_per_chunk = Vec::with_capacity(num_sub_stripes as usize);
        let mut sub_chunk_width = Vec::with_capacity(num_sub_stripes as usize);
        let mut alpha = Vec::with_capacity(num_sub_stripes as usize);
        let mut max_sub_chunks = 0;

        for stripe in 0..num_stripes {
            let lat_min = f64::from(stripe) * stripe_height - 90.0;
            let lat_max = f64::from(stripe + 1) * stripe_height - 90.0;
            let nc = segments(lat_min, lat_max, stripe_height);
            num_chunks_per_stripe.push(nc);

            for i in 0..num_sub_stripes_per_stripe {
                let ss = stripe * num_sub_stripes_per_stripe + i;
                let ss_lat_min = f64::from(ss) * sub_stripe_height - 90.0;
                let ss_lat_max = f64::from(ss + 1) * sub_stripe_height - 90.0;
                let nsc = (segments(ss_lat_min, ss_lat_max, sub_stripe_height) / nc).max(1);
                max_sub_chunks = max_sub_chunks.max(nsc);
                num_sub_chunks_per_chunk.push(nsc);

                let width = 360.0 / f64::from(nsc * nc);
                sub_chunk_width.push(width);

                let a = max_alpha(overlap, ss_lat_min.abs().max(ss_lat_max.abs()))?;
                if a > width {
                    return Err(ChunkerError::Configuration(format!(
                        "overlap half-width {a} exceeds the sub-chunk width {width} \
                         in sub-stripe {ss}"
                    )));
                }
                alpha.push(a);
            }
        }

        Ok(Self {
            overlap,
            num_stripes,
            num_sub_stripes_per_stripe,
            sub_stripe_height,
            max_sub_chunks_per_sub_stripe_chunk: max_sub_chunks,
            num_chunks_per_stripe,
            num_sub_chunks_per_chunk,
            sub_chunk_width,
            alpha,
        })
    }

    pub fn overlap(&self) -> f64 {
        self.overlap
    }

    pub fn num_stripes(&self) -> i32 {
        self.num_stripes
    }

    pub fn num_sub_stripes_per_stripe(&self) -> i32 {
        self.num_sub_stripes_per_stripe
    }

    pub fn max_sub_chunks_per_sub_stripe_chunk(&self) -> i32 {
        self.max_sub_chunks_per_sub_stripe_chunk
    }

    /// Number of chunks in the given stripe.
    pub fn num_chunks_in_stripe(&self, stripe: i32) -> Option<i32> {
        self.num_chunks_per_stripe.get(usize::try_from(stripe).ok()?).copied()
    }

    /// Stripe of a chunk id.
    pub fn stripe_of(&self, chunk_id: i32) -> i32 {
        chunk_id / (2 * self.num_stripes)
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    /// Primary location of a position, ignoring overlap.
    ///
    /// Latitude +90 and longitude 360 fall into the last sub-stripe and
    /// sub-chunk rather than past the end of the tables.
    pub fn locate(&self, lon: f64, lat: f64) -> ChunkLocation {
        let sub_stripe = self.sub_stripe_of(lat);
        let stripe = sub_stripe / self.num_sub_stripes_per_stripe;
        let sub_chunk = self.sub_chunk_of(lon, sub_stripe);
        let chunk = sub_chunk / self.num_sub_chunks_per_chunk[sub_stripe as usize];
        ChunkLocation {
            chunk_id: self.chunk_id(stripe, chunk),
            sub_chunk_id: self.sub_chunk_id(stripe, sub_stripe, chunk, sub_chunk),
            overlap: false,
        }
    }

    /// Append the primary location and every overlap location of a position.
    ///
    /// When `chunk_filter` is set only locations inside that chunk are
    /// appended. With a zero overlap only the primary location is produced.
    pub fn locate_with_overlap(
        &self,
        lon: f64,
        lat: f64,
        chunk_filter: Option<i32>,
        locations: &mut Vec<ChunkLocation>,
    ) {
        let keep = |chunk_id: i32| chunk_filter.is_none_or(|id| id == chunk_id);

        let primary = self.locate(lon, lat);
        if keep(primary.chunk_id) {
            locations.push(primary);
        }
        if self.overlap == 0.0 {
            return;
        }

        let sub_stripe = self.sub_stripe_of(lat);
        let stripe = sub_stripe / self.num_sub_stripes_per_stripe;
        let sub_chunk = self.sub_chunk_of(lon, sub_stripe);
        let ss = sub_stripe as usize;

        let lat_min = f64::from(sub_stripe) * self.sub_stripe_height - 90.0;
        let lat_max = f64::from(sub_stripe + 1) * self.sub_stripe_height - 90.0;
        if sub_stripe > 0 && lat < lat_min + self.overlap {
            let below = sub_stripe - 1;
            self.up_down_overlap(
                lon,
                chunk_filter,
                below / self.num_sub_stripes_per_stripe,
                below,
                locations,
            );
        }
        if sub_stripe < self.num_sub_stripes() - 1 && lat >= lat_max - self.overlap {
            let above = sub_stripe + 1;
            self.up_down_overlap(
                lon,
                chunk_filter,
                above / self.num_sub_stripes_per_stripe,
                above,
                locations,
            );
        }

        let num_chunks = self.num_chunks_per_stripe[stripe as usize];
        let per_chunk = self.num_sub_chunks_per_chunk[ss];
        let num_sub_chunks = num_chunks * per_chunk;
        let width = self.sub_chunk_width[ss];
        let alpha = self.alpha[ss];
        let lon_min = f64::from(sub_chunk) * width;
        let lon_max = clamp_lon(f64::from(sub_chunk + 1) * width);

        if lon < lon_min + alpha {
            let (chunk, neighbour) = if sub_chunk == 0 {
                (num_chunks - 1, num_sub_chunks - 1)
            } else {
                ((sub_chunk - 1) / per_chunk, sub_chunk - 1)
            };
            self.push_overlap(stripe, sub_stripe, chunk, neighbour, chunk_filter, locations);
        }
        if lon > lon_max - alpha {
            let (chunk, neighbour) = if sub_chunk == num_sub_chunks - 1 {
                (0, 0)
            } else {
                ((sub_chunk + 1) / per_chunk, sub_chunk + 1)
            };
            self.push_overlap(stripe, sub_stripe, chunk, neighbour, chunk_filter, locations);
        }
    }

    /// Chunks assigned to `node` out of `num_nodes` whose bounds intersect
    /// `region`. Ownership is `hash(chunk_id) % num_nodes`.
    pub fn chunks_in(&self, region: &SphericalBox, node: u32, num_nodes: u32) -> Result<Vec<i32>> {
        if num_nodes == 0 {
            return Err(ChunkerError::InvalidArgument(
                "there must be at least one node to assign chunks to".to_string(),
            ));
        }
        if node >= num_nodes {
            return Err(ChunkerError::InvalidArgument(format!(
                "node {node} is out of range for {num_nodes} nodes"
            )));
        }
        let mut chunks = Vec::new();
        if region.is_empty() {
            return Ok(chunks);
        }
        let min_stripe = self.sub_stripe_of(region.lat_min()) / self.num_sub_stripes_per_stripe;
        let max_stripe = self.sub_stripe_of(region.lat_max()) / self.num_sub_stripes_per_stripe;
        for stripe in min_stripe..=max_stripe {
            for chunk in 0..self.num_chunks_per_stripe[stripe as usize] {
                let chunk_id = self.chunk_id(stripe, chunk);
                if hash(chunk_id as u32) % num_nodes != node {
                    continue;
                }
                if region.intersects(&self.chunk_bounds(chunk_id)?) {
                    chunks.push(chunk_id);
                }
            }
        }
        Ok(chunks)
    }

    // ========================================================================
    // Bounds and enumeration
    // ========================================================================

    /// Longitude/latitude box covered by a chunk (without overlap).
    pub fn chunk_bounds(&self, chunk_id: i32) -> Result<SphericalBox> {
        let (stripe, chunk) = self.decode_chunk(chunk_id)?;
        let width = 360.0 / f64::from(self.num_chunks_per_stripe[stripe as usize]);
        let lon_min = f64::from(chunk) * width;
        let lon_max = clamp_lon(f64::from(chunk + 1) * width);
        let stripe_height = f64::from(self.num_sub_stripes_per_stripe) * self.sub_stripe_height;
        let lat_min = clamp_lat(f64::from(stripe) * stripe_height - 90.0);
        let lat_max = clamp_lat(f64::from(stripe + 1) * stripe_height - 90.0);
        SphericalBox::new(lon_min, lon_max, lat_min, lat_max)
    }

    /// Longitude/latitude box covered by a sub-chunk (without overlap).
    pub fn sub_chunk_bounds(&self, chunk_id: i32, sub_chunk_id: i32) -> Result<SphericalBox> {
        let (stripe, chunk) = self.decode_chunk(chunk_id)?;
        let max_sc = self.max_sub_chunks_per_sub_stripe_chunk;
        if sub_chunk_id < 0 || sub_chunk_id / max_sc >= self.num_sub_stripes_per_stripe {
            return Err(ChunkerError::InvalidArgument(format!(
                "invalid sub-chunk id {sub_chunk_id} for chunk {chunk_id}"
            )));
        }
        let sub_stripe = stripe * self.num_sub_stripes_per_stripe + sub_chunk_id / max_sc;
        let ss = sub_stripe as usize;
        if sub_chunk_id % max_sc >= self.num_sub_chunks_per_chunk[ss] {
            return Err(ChunkerError::InvalidArgument(format!(
                "invalid sub-chunk id {sub_chunk_id} for chunk {chunk_id}"
            )));
        }
        let sub_chunk = chunk * self.num_sub_chunks_per_chunk[ss] + sub_chunk_id % max_sc;
        let width = self.sub_chunk_width[ss];
        let lon_min = f64::from(sub_chunk) * width;
        let lon_max = clamp_lon(f64::from(sub_chunk + 1) * width);
        let lat_min = clamp_lat(f64::from(sub_stripe) * self.sub_stripe_height - 90.0);
        let lat_max = clamp_lat(f64::from(sub_stripe + 1) * self.sub_stripe_height - 90.0);
        SphericalBox::new(lon_min, lon_max, lat_min, lat_max)
    }

    /// Every chunk id on the sphere, ordered by stripe then chunk.
    pub fn all_chunks(&self) -> Vec<i32> {
        let mut chunks = Vec::new();
        for stripe in 0..self.num_stripes {
            for chunk in 0..self.num_chunks_per_stripe[stripe as usize] {
                chunks.push(self.chunk_id(stripe, chunk));
            }
        }
        chunks
    }

    /// Every sub-chunk id of a chunk.
    pub fn all_sub_chunks(&self, chunk_id: i32) -> Result<Vec<i32>> {
        let (stripe, _) = self.decode_chunk(chunk_id)?;
        let mut sub_chunks = Vec::new();
        for i in 0..self.num_sub_stripes_per_stripe {
            let ss = (stripe * self.num_sub_stripes_per_stripe + i) as usize;
            for sc in 0..self.num_sub_chunks_per_chunk[ss] {
                sub_chunks.push(i * self.max_sub_chunks_per_sub_stripe_chunk + sc);
            }
        }
        Ok(sub_chunks)
    }

    /// True if `chunk_id` names an existing chunk.
    pub fn valid(&self, chunk_id: i32) -> bool {
        self.decode_chunk(chunk_id).is_ok()
    }

    // ========================================================================
    // Internal arithmetic
    // ========================================================================

    fn num_sub_stripes(&self) -> i32 {
        self.num_stripes * self.num_sub_stripes_per_stripe
    }

    fn chunk_id(&self, stripe: i32, chunk: i32) -> i32 {
        stripe * 2 * self.num_stripes + chunk
    }

    fn sub_chunk_id(&self, stripe: i32, sub_stripe: i32, chunk: i32, sub_chunk: i32) -> i32 {
        (sub_stripe - stripe * self.num_sub_stripes_per_stripe)
            * self.max_sub_chunks_per_sub_stripe_chunk
            + (sub_chunk - chunk * self.num_sub_chunks_per_chunk[sub_stripe as usize])
    }

    fn decode_chunk(&self, chunk_id: i32) -> Result<(i32, i32)> {
        let stripe = self.stripe_of(chunk_id);
        let chunk = chunk_id - stripe * 2 * self.num_stripes;
        if chunk_id < 0
            || stripe >= self.num_stripes
            || chunk >= self.num_chunks_per_stripe[stripe as usize]
        {
            return Err(ChunkerError::InvalidArgument(format!(
                "invalid chunk id {chunk_id}"
            )));
        }
        Ok((stripe, chunk))
    }

    fn sub_stripe_of(&self, lat: f64) -> i32 {
        let ss = ((clamp_lat(lat) + 90.0) / self.sub_stripe_height).floor() as i32;
        ss.clamp(0, self.num_sub_stripes() - 1)
    }

    fn sub_chunk_of(&self, lon: f64, sub_stripe: i32) -> i32 {
        let ss = sub_stripe as usize;
        let sc = (lon / self.sub_chunk_width[ss]).floor() as i32;
        let stripe = (sub_stripe / self.num_sub_stripes_per_stripe) as usize;
        let num_sub_chunks = self.num_sub_chunks_per_chunk[ss] * self.num_chunks_per_stripe[stripe];
        sc.clamp(0, num_sub_chunks - 1)
    }

    fn push_overlap(
        &self,
        stripe: i32,
        sub_stripe: i32,
        chunk: i32,
        sub_chunk: i32,
        chunk_filter: Option<i32>,
        locations: &mut Vec<ChunkLocation>,
    ) {
        let chunk_id = self.chunk_id(stripe, chunk);
        if chunk_filter.is_none_or(|id| id == chunk_id) {
            locations.push(ChunkLocation {
                chunk_id,
                sub_chunk_id: self.sub_chunk_id(stripe, sub_stripe, chunk, sub_chunk),
                overlap: true,
            });
        }
    }

    /// Overlap memberships of a position in the sub-stripe directly above
    /// or below its own.
    fn up_down_overlap(
        &self,
        lon: f64,
        chunk_filter: Option<i32>,
        stripe: i32,
        sub_stripe: i32,
        locations: &mut Vec<ChunkLocation>,
    ) {
        let ss = sub_stripe as usize;
        let per_chunk = self.num_sub_chunks_per_chunk[ss];
        let num_sub_chunks = self.num_chunks_per_stripe[stripe as usize] * per_chunk;
        let width = self.sub_chunk_width[ss];
        let alpha = self.alpha[ss];

        let mut min_sc = ((lon - alpha) / width).floor() as i32;
        let mut max_sc = ((lon + alpha) / width).floor() as i32;
        if min_sc < 0 {
            min_sc += num_sub_chunks;
        }
        if max_sc >= num_sub_chunks {
            max_sc -= num_sub_chunks;
        }
        if min_sc > max_sc {
            // The range crosses the 0/360 seam.
            for sc in min_sc..num_sub_chunks {
                self.push_overlap(stripe, sub_stripe, sc / per_chunk, sc, chunk_filter, locations);
            }
            min_sc = 0;
        }
        for sc in min_sc..=max_sc {
            self.push_overlap(stripe, sub_stripe, sc / per_chunk, sc, chunk_filter, locations);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_parameters() {
        assert!(matches!(
            Chunker::new(0.0, 0, 1),
            Err(ChunkerError::Configuration(_))
        ));
        assert!(matches!(
            Chunker::new(0.0, 1, 0),
            Err(ChunkerError::Configuration(_))
        ));
        assert!(Chunker::new(-0.1, 18, 10).is_err());
        assert!(Chunker::new(10.5, 18, 10).is_err());
        // Sub-stripes of one degree cannot hold a two degree overlap.
        assert!(Chunker::new(2.0, 18, 10).is_err());
    }

    #[test]
    fn test_chunk_id_arithmetic() {
        let chunker = Chunker::new(0.0, 18, 10).unwrap();
        assert_eq!(chunker.chunk_id(0, 0), 0);
        assert_eq!(chunker.chunk_id(1, 3), 39);
        assert_eq!(chunker.stripe_of(39), 1);
        assert!(chunker.valid(0));
        assert!(!chunker.valid(-1));
        assert!(!chunker.valid(18 * 36));
    }

    #[test]
    fn test_poles_have_single_chunk() {
        let chunker = Chunker::new(0.01, 18, 10).unwrap();
        assert_eq!(chunker.num_chunks_in_stripe(0), Some(1));
        assert_eq!(chunker.num_chunks_in_stripe(17), Some(1));
        assert!(chunker.num_chunks_in_stripe(9).unwrap() > 30);
        assert_eq!(chunker.num_chunks_in_stripe(18), None);
    }

    #[test]
    fn test_locate_clamps_edges() {
        let chunker = Chunker::new(0.0, 18, 10).unwrap();
        let north = chunker.locate(360.0, 90.0);
        assert!(chunker.valid(north.chunk_id));
        assert_eq!(chunker.stripe_of(north.chunk_id), 17);

        let last = chunker.locate(360.0, 0.5);
        let before = chunker.locate(359.9999, 0.5);
        assert_eq!(last, before);
    }

    #[test]
    fn test_zero_overlap_yields_primary_only() {
        let chunker = Chunker::new(0.0, 18, 10).unwrap();
        let mut locs = Vec::new();
        chunker.locate_with_overlap(0.0, 0.0, None, &mut locs);
        assert_eq!(locs, vec![chunker.locate(0.0, 0.0)]);
    }

    #[test]
    fn test_filter_drops_other_chunks() {
        let chunker = Chunker::new(0.1, 18, 10).unwrap();
        let home = chunker.locate(0.05, 0.5);
        let mut locs = Vec::new();
        chunker.locate_with_overlap(0.05, 0.5, Some(home.chunk_id), &mut locs);
        assert!(locs.iter().all(|l| l.chunk_id == home.chunk_id));
        assert_eq!(locs[0], home);

        let mut none = Vec::new();
        chunker.locate_with_overlap(0.05, 0.5, Some(i32::MAX), &mut none);
        assert!(none.is_empty());
    }

    #[test]
    fn test_sub_chunk_bounds_contain_located_points() {
        let chunker = Chunker::new(0.0, 18, 10).unwrap();
        for (lon, lat) in [(12.3, 45.6), (200.0, -33.3), (359.5, 0.25), (0.0, -89.9)] {
            let loc = chunker.locate(lon, lat);
            let bounds = chunker.sub_chunk_bounds(loc.chunk_id, loc.sub_chunk_id).unwrap();
            assert!(bounds.contains(lon, lat), "{lon},{lat} not in {bounds:?}");
        }
    }

    #[test]
    fn test_all_sub_chunks_are_valid_bounds() {
        let chunker = Chunker::new(0.0, 18, 10).unwrap();
        let chunk_id = chunker.locate(30.0, 20.0).chunk_id;
        let subs = chunker.all_sub_chunks(chunk_id).unwrap();
        assert!(!subs.is_empty());
        for sc in subs {
            assert!(chunker.sub_chunk_bounds(chunk_id, sc).is_ok());
        }
        assert!(chunker.all_sub_chunks(-5).is_err());
    }
}
