//! Containment tests for geofence, beacon, and place geometries.
//!
//! Distances use the haversine formula on a spherical earth (mean radius
//! 6,371,008.8 m), which stays accurate from tens of meters up to tens of
//! kilometers, the range geofences live in.
//!
//! # Example
//!
//! ```
//! use waypost_types::Coordinate;
//! use waypost_types::geometry::{point_in_circle, point_in_polygon};
//!
//! let center = Coordinate::new(0.0, 0.0);
//! assert!(point_in_circle(&center, &center, 100.0));
//!
//! let square = [
//!     Coordinate::new(-1.0, -1.0),
//!     Coordinate::new(-1.0, 1.0),
//!     Coordinate::new(1.0, 1.0),
//!     Coordinate::new(1.0, -1.0),
//! ];
//! assert!(point_in_polygon(&center, &square));
//! ```

use geo::{Distance, Haversine, Point};

use crate::types::Coordinate;

/// Minimum number of vertices a ring needs to enclose any area.
pub const MIN_RING_POINTS: usize = 3;

/// Great-circle distance between two coordinates in meters.
#[must_use]
pub fn haversine_distance(a: &Coordinate, b: &Coordinate) -> f64 {
    // geo points are (x, y) = (longitude, latitude)
    let pa = Point::new(a.longitude, a.latitude);
    let pb = Point::new(b.longitude, b.latitude);
    Haversine::distance(pa, pb)
}

/// Returns `true` if `point` lies within `radius_m` meters of `center`.
///
/// The boundary counts as inside. A negative or non-finite radius never
/// contains anything.
#[must_use]
pub fn point_in_circle(point: &Coordinate, center: &Coordinate, radius_m: f64) -> bool {
    if !radius_m.is_finite() || radius_m < 0.0 {
        return false;
    }
    haversine_distance(point, center) <= radius_m
}

/// Even-odd ray-casting test over an implicitly closed ring.
///
/// The ring is treated as planar in (longitude, latitude) space, which is
/// exact enough for geofence-sized polygons away from the antimeridian.
/// Rings with fewer than [`MIN_RING_POINTS`] vertices always return `false`.
#[must_use]
pub fn point_in_polygon(point: &Coordinate, ring: &[Coordinate]) -> bool {
    if ring.len() < MIN_RING_POINTS {
        return false;
    }

    let x = point.longitude;
    let y = point.latitude;
    let mut inside = false;
    let mut j = ring.len() - 1;

    for i in 0..ring.len() {
        let (xi, yi) = (ring[i].longitude, ring[i].latitude);
        let (xj, yj) = (ring[j].longitude, ring[j].latitude);

        // Edge straddles the horizontal ray through the point
        if (yi > y) != (yj > y) {
            let x_cross = (xj - xi) * (y - yi) / (yj - yi) + xi;
            if x < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }

    inside
}
