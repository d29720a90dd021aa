// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Spherical geometry helpers: longitude/latitude clamping, segment counts,
//! overlap half-widths and the lon/lat box used for region queries.

use serde::{Deserialize, Serialize};

use crate::error::{ChunkerError, Result};

/// One arcsecond in degrees.
pub const EPSILON_DEG: f64 = 1.0 / 3600.0;

/// Clamp a latitude to `[-90, 90]`.
pub fn clamp_lat(lat: f64) -> f64 {
    lat.clamp(-90.0, 90.0)
}

/// Clamp a longitude to `[0, 360]`.
pub fn clamp_lon(lon: f64) -> f64 {
    lon.clamp(0.0, 360.0)
}

/// Range-reduce a longitude to `[0, 360)`. Values already inside `[0, 360]`
/// are returned unchanged so that a box ending exactly at 360 does not wrap.
pub fn reduce_lon(lon: f64) -> f64 {
    if (0.0..=360.0).contains(&lon) {
        return lon;
    }
    let reduced = lon.rem_euclid(360.0);
    if reduced == 360.0 { 0.0 } else { reduced }
}

/// Number of equal-width longitude segments for the latitude band
/// `[lat_min, lat_max]` such that two points closer than `width` degrees are
/// never placed in non-adjacent segments.
pub fn segments(lat_min: f64, lat_max: f64, width: f64) -> i32 {
    let lat = lat_min.abs().max(lat_max.abs());
    if lat > 90.0 - EPSILON_DEG || width >= 180.0 {
        return 1;
    }
    let width = width.max(EPSILON_DEG);
    let cw = width.to_radians().cos();
    let sl = lat.to_radians().sin();
    let cl = lat.to_radians().cos();
    let x = cw - sl * sl;
    let u = cl * cl;
    let y = (u * u - x * x).abs().sqrt();
    (360.0 / y.atan2(x).to_degrees().abs()).floor() as i32
}

/// Longitude half-width of a circle of `radius` degrees centred at latitude
/// `center_lat`. Returns 180 when the circle reaches a pole.
pub fn max_alpha(radius: f64, center_lat: f64) -> Result<f64> {
    if !(0.0..=90.0).contains(&radius) {
        return Err(ChunkerError::InvalidArgument(format!(
            "radius {radius} must be in [0, 90] degrees"
        )));
    }
    if radius == 0.0 {
        return Ok(0.0);
    }
    let lat = clamp_lat(center_lat);
    if lat.abs() + radius > 90.0 - EPSILON_DEG {
        return Ok(180.0);
    }
    let r = radius.to_radians();
    let lat = lat.to_radians();
    let y = r.sin();
    let x = ((lat - r).cos() * (lat + r).cos()).abs().sqrt();
    Ok((y / x).atan().abs().to_degrees())
}

/// A longitude/latitude box. The longitude range may wrap across 0/360, in
/// which case `lon_max < lon_min`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SphericalBox {
    lon_min: f64,
    lon_max: f64,
    lat_min: f64,
    lat_max: f64,
}

impl SphericalBox {
    pub fn new(lon_min: f64, lon_max: f64, lat_min: f64, lat_max: f64) -> Result<Self> {
        if lat_min > lat_max {
            return Err(ChunkerError::InvalidArgument(format!(
                "latitude minimum {lat_min} is greater than maximum {lat_max}"
            )));
        }
        if lon_max < lon_min && (lon_max < 0.0 || lon_min > 360.0) {
            return Err(ChunkerError::InvalidArgument(format!(
                "longitude minimum {lon_min} is greater than maximum {lon_max}"
            )));
        }
        let (lon_min, lon_max) = if lon_max - lon_min >= 360.0 {
            (0.0, 360.0)
        } else {
            (reduce_lon(lon_min), reduce_lon(lon_max))
        };
        Ok(Self {
            lon_min,
            lon_max,
            lat_min: clamp_lat(lat_min),
            lat_max: clamp_lat(lat_max),
        })
    }

    /// The whole sphere.
    pub fn full() -> Self {
        Self {
            lon_min: 0.0,
            lon_max: 360.0,
            lat_min: -90.0,
            lat_max: 90.0,
        }
    }

    pub fn lon_min(&self) -> f64 {
        self.lon_min
    }

    pub fn lon_max(&self) -> f64 {
        self.lon_max
    }

    pub fn lat_min(&self) -> f64 {
        self.lat_min
    }

    pub fn lat_max(&self) -> f64 {
        self.lat_max
    }

    pub fn is_empty(&self) -> bool {
        self.lat_min > self.lat_max
    }

    pub fn is_full(&self) -> bool {
        self.lat_min == -90.0 && self.lat_max == 90.0 && self.lon_min == 0.0 && self.lon_max == 360.0
    }

    /// True if the longitude range crosses the 0/360 seam.
    pub fn wraps(&self) -> bool {
        self.lon_max < self.lon_min
    }

    /// Width of the longitude range in degrees.
    pub fn lon_extent(&self) -> f64 {
        if self.wraps() {
            360.0 - self.lon_min + self.lon_max
        } else {
            self.lon_max - self.lon_min
        }
    }

    /// Area in square degrees.
    pub fn area(&self) -> f64 {
        let rad2_to_deg2 = (180.0 / std::f64::consts::PI).powi(2);
        self.lon_extent().to_radians()
            * (self.lat_max.to_radians().sin() - self.lat_min.to_radians().sin())
            * rad2_to_deg2
    }

    /// Grow the box by `radius` degrees in every direction.
    pub fn expand(&mut self, radius: f64) -> Result<()> {
        if radius < 0.0 {
            return Err(ChunkerError::InvalidArgument(format!(
                "negative expansion radius {radius}"
            )));
        }
        let alpha = max_alpha(radius.min(90.0), self.lat_min.abs().max(self.lat_max.abs()))?;
        if self.lon_extent() + 2.0 * alpha >= 360.0 {
            self.lon_min = 0.0;
            self.lon_max = 360.0;
        } else {
            self.lon_min -= alpha;
            if self.lon_min < 0.0 {
                self.lon_min += 360.0;
            }
            self.lon_max += alpha;
            if self.lon_max > 360.0 {
                self.lon_max -= 360.0;
            }
        }
        self.lat_min = clamp_lat(self.lat_min - radius);
        self.lat_max = clamp_lat(self.lat_max + radius);
        Ok(())
    }

    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        if lat < self.lat_min || lat > self.lat_max {
            return false;
        }
        if self.wraps() {
            lon >= self.lon_min || lon <= self.lon_max
        } else {
            lon >= self.lon_min && lon <= self.lon_max
        }
    }

    pub fn intersects(&self, other: &SphericalBox) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        if self.lat_min > other.lat_max || self.lat_max < other.lat_min {
            return false;
        }
        match (self.wraps(), other.wraps()) {
            (true, true) => true,
            (true, false) => other.lon_min <= self.lon_max || other.lon_max >= self.lon_min,
            (false, true) => self.lon_min <= other.lon_max || self.lon_max >= other.lon_min,
            (false, false) => self.lon_min <= other.lon_max && self.lon_max >= other.lon_min,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segments_near_pole_is_one() {
        assert_eq!(segments(89.99999, 90.0, 1.0), 1);
        assert_eq!(segments(-90.0, -89.99999, 1.0), 1);
    }

    #[test]
    fn test_segments_wide_band_is_one() {
        assert_eq!(segments(-10.0, 10.0, 180.0), 1);
        assert_eq!(segments(-10.0, 10.0, 250.0), 1);
    }

    #[test]
    fn test_segments_equator() {
        // At the equator a width of w degrees yields about 360/w segments.
        assert!((359..=360).contains(&segments(0.0, 0.0, 1.0)));
        assert!((35..=36).contains(&segments(-1.0, 0.0, 10.0)));
    }

    #[test]
    fn test_segments_shrink_towards_poles() {
        let equator = segments(0.0, 10.0, 10.0);
        let polar = segments(70.0, 80.0, 10.0);
        assert!(polar < equator);
        assert!(polar >= 1);
    }

    #[test]
    fn test_max_alpha() {
        assert_eq!(max_alpha(0.0, 45.0).unwrap(), 0.0);
        assert_eq!(max_alpha(1.0, 89.5).unwrap(), 180.0);
        let a = max_alpha(1.0, 0.0).unwrap();
        assert!((a - 1.0).abs() < 1e-3);
        assert!(max_alpha(1.0, 60.0).unwrap() > 1.9);
        assert!(max_alpha(-1.0, 0.0).is_err());
    }

    #[test]
    fn test_box_validation() {
        assert!(SphericalBox::new(0.0, 10.0, 5.0, -5.0).is_err());
        assert!(SphericalBox::new(10.0, -5.0, 0.0, 1.0).is_err());
        // Wrapping box is allowed when both ends are in range.
        let b = SphericalBox::new(350.0, 10.0, -1.0, 1.0).unwrap();
        assert!(b.wraps());
        assert_eq!(b.lon_extent(), 20.0);
    }

    #[test]
    fn test_box_full_and_reduced() {
        let b = SphericalBox::new(-10.0, 400.0, -100.0, 100.0).unwrap();
        assert!(b.is_full());
        let b = SphericalBox::new(-10.0, 10.0, 0.0, 1.0).unwrap();
        assert!(b.wraps());
        assert_eq!(b.lon_min(), 350.0);
        let b = SphericalBox::new(350.0, 360.0, 0.0, 1.0).unwrap();
        assert!(!b.wraps());
    }

    #[test]
    fn test_box_contains_and_intersects() {
        let seam = SphericalBox::new(355.0, 5.0, -1.0, 1.0).unwrap();
        assert!(seam.contains(359.0, 0.0));
        assert!(seam.contains(1.0, 0.0));
        assert!(!seam.contains(180.0, 0.0));
        assert!(!seam.contains(1.0, 2.0));

        let left = SphericalBox::new(0.0, 2.0, 0.0, 1.0).unwrap();
        let far = SphericalBox::new(100.0, 120.0, 0.0, 1.0).unwrap();
        let north = SphericalBox::new(0.0, 2.0, 10.0, 11.0).unwrap();
        assert!(seam.intersects(&left));
        assert!(left.intersects(&seam));
        assert!(!seam.intersects(&far));
        assert!(!left.intersects(&north));
        assert!(seam.intersects(&SphericalBox::new(350.0, 1.0, 0.0, 0.5).unwrap()));
    }

    #[test]
    fn test_box_expand() {
        let mut b = SphericalBox::new(10.0, 20.0, 0.0, 1.0).unwrap();
        b.expand(1.0).unwrap();
        assert!(b.lon_min() < 10.0 && b.lon_min() > 8.9);
        assert!(b.lon_max() > 20.0 && b.lon_max() < 21.1);
        assert_eq!(b.lat_min(), -1.0);

        let mut seam = SphericalBox::new(0.5, 1.0, 0.0, 1.0).unwrap();
        seam.expand(1.0).unwrap();
        assert!(seam.wraps());

        let mut polar = SphericalBox::new(10.0, 20.0, 88.0, 89.5).unwrap();
        polar.expand(1.0).unwrap();
        assert_eq!(polar.lon_extent(), 360.0);
        assert_eq!(polar.lat_max(), 90.0);

        assert!(b.expand(-1.0).is_err());
    }

    #[test]
    fn test_box_area() {
        let full = SphericalBox::full();
        assert!((full.area() - 41_252.96).abs() < 0.1);
    }
}
