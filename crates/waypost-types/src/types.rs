//! Core types for location fixes, nearby records, and membership.

use core::fmt;
use std::collections::{BTreeMap, BTreeSet};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{ValidationError, ValidationResult};
use crate::geometry;

/// Default proximity radius for beacons without an explicit radius, in meters.
pub const DEFAULT_BEACON_RADIUS: f64 = 100.0;

/// Default proximity radius for places without an explicit radius, in meters.
pub const DEFAULT_PLACE_RADIUS: f64 = 50.0;

/// Free-form key-value metadata attached to records and devices.
pub type Metadata = BTreeMap<String, String>;

/// A WGS84 latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Coordinate {
    /// Latitude in degrees, -90 to 90.
    pub latitude: f64,
    /// Longitude in degrees, -180 to 180.
    pub longitude: f64,
}

impl Coordinate {
    /// Create a coordinate from latitude and longitude in degrees.
    #[must_use]
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Returns `true` if both components are finite and in range.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    /// Validate the coordinate.
    pub fn validate(&self) -> ValidationResult<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(ValidationError::InvalidCoordinate {
                latitude: self.latitude,
                longitude: self.longitude,
            })
        }
    }

    /// Haversine distance to another coordinate in meters.
    #[must_use]
    pub fn distance_to(&self, other: &Coordinate) -> f64 {
        geometry::haversine_distance(self, other)
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.6}, {:.6})", self.latitude, self.longitude)
    }
}

/// Where a location fix came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[non_exhaustive]
pub enum FixSource {
    /// Explicit foreground request.
    ForegroundPoll,
    /// Periodic background location update.
    #[default]
    BackgroundUpdate,
    /// Platform visit (arrival/departure) event.
    Visit,
    /// Location supplied manually by the host application.
    Manual,
    /// Synthetic location used for testing and simulation.
    Mock,
}

impl fmt::Display for FixSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FixSource::ForegroundPoll => "foreground_poll",
            FixSource::BackgroundUpdate => "background_update",
            FixSource::Visit => "visit",
            FixSource::Manual => "manual",
            FixSource::Mock => "mock",
        };
        f.write_str(s)
    }
}

/// A single timestamped location observation.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LocationFix {
    /// When the fix was taken.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub timestamp: OffsetDateTime,
    /// Position of the device.
    pub coordinate: Coordinate,
    /// Horizontal accuracy radius in meters.
    pub horizontal_accuracy: f64,
    /// Which sensor path delivered the fix.
    #[cfg_attr(feature = "serde", serde(default))]
    pub source: FixSource,
}

impl LocationFix {
    /// Create a fix taken now.
    pub fn new(coordinate: Coordinate, horizontal_accuracy: f64, source: FixSource) -> Self {
        Self {
            timestamp: OffsetDateTime::now_utc(),
            coordinate,
            horizontal_accuracy,
            source,
        }
    }

    /// Create a fix with an explicit timestamp.
    pub fn at(
        timestamp: OffsetDateTime,
        coordinate: Coordinate,
        horizontal_accuracy: f64,
        source: FixSource,
    ) -> Self {
        Self {
            timestamp,
            coordinate,
            horizontal_accuracy,
            source,
        }
    }

    /// Validate coordinate range and accuracy.
    pub fn validate(&self) -> ValidationResult<()> {
        self.coordinate.validate()?;
        if !self.horizontal_accuracy.is_finite() || self.horizontal_accuracy < 0.0 {
            return Err(ValidationError::InvalidAccuracy(self.horizontal_accuracy));
        }
        Ok(())
    }
}

/// Shape of a geofence.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", rename_all = "snake_case"))]
pub enum Geometry {
    /// Circle around `center` with `radius` meters.
    Circle {
        /// Center of the circle.
        center: Coordinate,
        /// Radius in meters.
        radius: f64,
    },
    /// Ordered, implicitly closed ring of vertices.
    Polygon {
        /// Vertices of the ring.
        ring: Vec<Coordinate>,
    },
}

impl Geometry {
    /// Returns `true` if `point` lies inside this geometry.
    #[must_use]
    pub fn contains(&self, point: &Coordinate) -> bool {
        match self {
            Geometry::Circle { center, radius } => {
                geometry::point_in_circle(point, center, *radius)
            }
            Geometry::Polygon { ring } => geometry::point_in_polygon(point, ring),
        }
    }

    /// Short name of the geometry kind, used in logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Geometry::Circle { .. } => "circle",
            Geometry::Polygon { .. } => "polygon",
        }
    }
}

/// A geofence pushed by the server.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GeofenceRecord {
    /// Stable server identifier.
    pub id: String,
    /// Optional grouping tag.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub tag: Option<String>,
    /// Optional identifier in the host application's system.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub external_id: Option<String>,
    /// Arbitrary metadata.
    #[cfg_attr(feature = "serde", serde(default))]
    pub metadata: Metadata,
    /// Circle or polygon.
    pub geometry: Geometry,
}

impl GeofenceRecord {
    /// Create a circular geofence.
    pub fn circle(id: impl Into<String>, center: Coordinate, radius: f64) -> Self {
        Self {
            id: id.into(),
            tag: None,
            external_id: None,
            metadata: Metadata::new(),
            geometry: Geometry::Circle { center, radius },
        }
    }

    /// Create a polygon geofence.
    pub fn polygon(id: impl Into<String>, ring: Vec<Coordinate>) -> Self {
        Self {
            id: id.into(),
            tag: None,
            external_id: None,
            metadata: Metadata::new(),
            geometry: Geometry::Polygon { ring },
        }
    }

    /// Set the tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Set the external ID.
    #[must_use]
    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    /// Check that the geometry can be evaluated.
    ///
    /// Degenerate polygons are still classified (they never contain a
    /// point), so this is advisory and used for diagnostics only.
    pub fn validate(&self) -> ValidationResult<()> {
        match &self.geometry {
            Geometry::Circle { center, radius } => {
                center.validate()?;
                if !radius.is_finite() || *radius < 0.0 {
                    return Err(ValidationError::invalid_geometry(
                        &self.id,
                        format!("radius {radius} is not a non-negative number"),
                    ));
                }
            }
            Geometry::Polygon { ring } => {
                if ring.len() < geometry::MIN_RING_POINTS {
                    return Err(ValidationError::invalid_geometry(
                        &self.id,
                        format!("ring has {} points", ring.len()),
                    ));
                }
                for vertex in ring {
                    vertex.validate()?;
                }
            }
        }
        Ok(())
    }
}

/// A Bluetooth beacon pushed by the server.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BeaconRecord {
    /// Stable server identifier.
    pub id: String,
    /// Optional grouping tag.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub tag: Option<String>,
    /// Optional identifier in the host application's system.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub external_id: Option<String>,
    /// Arbitrary metadata.
    #[cfg_attr(feature = "serde", serde(default))]
    pub metadata: Metadata,
    /// Proximity UUID used for platform region monitoring.
    pub uuid: Uuid,
    /// iBeacon major value.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub major: Option<u16>,
    /// iBeacon minor value.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub minor: Option<u16>,
    /// Installed location of the beacon.
    pub coordinate: Coordinate,
    /// Proximity radius in meters.
    #[cfg_attr(feature = "serde", serde(default = "default_beacon_radius"))]
    pub radius: f64,
}

impl BeaconRecord {
    /// Create a beacon with the default proximity radius.
    pub fn new(id: impl Into<String>, uuid: Uuid, coordinate: Coordinate) -> Self {
        Self {
            id: id.into(),
            tag: None,
            external_id: None,
            metadata: Metadata::new(),
            uuid,
            major: None,
            minor: None,
            coordinate,
            radius: DEFAULT_BEACON_RADIUS,
        }
    }

    /// Set major and minor identifiers.
    #[must_use]
    pub fn with_major_minor(mut self, major: u16, minor: u16) -> Self {
        self.major = Some(major);
        self.minor = Some(minor);
        self
    }

    /// Set the proximity radius in meters.
    #[must_use]
    pub fn with_radius(mut self, radius: f64) -> Self {
        self.radius = radius;
        self
    }

    /// Returns `true` if `point` is within the beacon's proximity radius.
    #[must_use]
    pub fn contains(&self, point: &Coordinate) -> bool {
        geometry::point_in_circle(point, &self.coordinate, self.radius)
    }
}

/// A point of interest pushed by the server.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PlaceRecord {
    /// Stable server identifier.
    pub id: String,
    /// Display name.
    #[cfg_attr(feature = "serde", serde(default))]
    pub name: String,
    /// Optional grouping tag.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub tag: Option<String>,
    /// Optional identifier in the host application's system.
    #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
    pub external_id: Option<String>,
    /// Arbitrary metadata.
    #[cfg_attr(feature = "serde", serde(default))]
    pub metadata: Metadata,
    /// Location of the place.
    pub coordinate: Coordinate,
    /// Proximity radius in meters.
    #[cfg_attr(feature = "serde", serde(default = "default_place_radius"))]
    pub radius: f64,
}

impl PlaceRecord {
    /// Create a place with the default proximity radius.
    pub fn new(id: impl Into<String>, name: impl Into<String>, coordinate: Coordinate) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tag: None,
            external_id: None,
            metadata: Metadata::new(),
            coordinate,
            radius: DEFAULT_PLACE_RADIUS,
        }
    }

    /// Set the proximity radius in meters.
    #[must_use]
    pub fn with_radius(mut self, radius: f64) -> Self {
        self.radius = radius;
        self
    }

    /// Returns `true` if `point` is within the place's proximity radius.
    #[must_use]
    pub fn contains(&self, point: &Coordinate) -> bool {
        geometry::point_in_circle(point, &self.coordinate, self.radius)
    }
}

#[cfg(feature = "serde")]
fn default_beacon_radius() -> f64 {
    DEFAULT_BEACON_RADIUS
}

#[cfg(feature = "serde")]
fn default_place_radius() -> f64 {
    DEFAULT_PLACE_RADIUS
}

/// Circle within which the nearby cache is authoritative.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SyncedRegion {
    /// Center of the region, usually the fix that triggered the last sync.
    pub center: Coordinate,
    /// Radius in meters.
    pub radius: f64,
}

impl SyncedRegion {
    /// Create a synced region.
    #[must_use]
    pub const fn new(center: Coordinate, radius: f64) -> Self {
        Self { center, radius }
    }

    /// Returns `true` if `point` lies inside the region (boundary inclusive).
    #[must_use]
    pub fn contains(&self, point: &Coordinate) -> bool {
        geometry::point_in_circle(point, &self.center, self.radius)
    }
}

/// The three kinds of records the device can be inside.
///
/// Ordering (geofence, beacon, place) is used as the tie-breaker when
/// events for equal identifiers are sorted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum RecordKind {
    /// A geofence.
    Geofence,
    /// A beacon.
    Beacon,
    /// A place.
    Place,
}

impl RecordKind {
    /// All record kinds in tie-break order.
    pub const ALL: [RecordKind; 3] = [RecordKind::Geofence, RecordKind::Beacon, RecordKind::Place];
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Geofence => f.write_str("geofence"),
            RecordKind::Beacon => f.write_str("beacon"),
            RecordKind::Place => f.write_str("place"),
        }
    }
}

/// Sets of record IDs the device is considered inside.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Membership {
    /// Geofence IDs.
    pub geofences: BTreeSet<String>,
    /// Beacon IDs.
    pub beacons: BTreeSet<String>,
    /// Place IDs.
    pub places: BTreeSet<String>,
}

impl Membership {
    /// Create an empty membership.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the device is inside nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.geofences.is_empty() && self.beacons.is_empty() && self.places.is_empty()
    }

    /// IDs for one record kind.
    #[must_use]
    pub fn ids(&self, kind: RecordKind) -> &BTreeSet<String> {
        match kind {
            RecordKind::Geofence => &self.geofences,
            RecordKind::Beacon => &self.beacons,
            RecordKind::Place => &self.places,
        }
    }

    /// Mutable IDs for one record kind.
    pub fn ids_mut(&mut self, kind: RecordKind) -> &mut BTreeSet<String> {
        match kind {
            RecordKind::Geofence => &mut self.geofences,
            RecordKind::Beacon => &mut self.beacons,
            RecordKind::Place => &mut self.places,
        }
    }

    /// Builder-style helper that adds one ID.
    #[must_use]
    pub fn with(mut self, kind: RecordKind, id: impl Into<String>) -> Self {
        self.ids_mut(kind).insert(id.into());
        self
    }
}

/// Direction of a membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Transition {
    /// The device entered the record.
    Entered,
    /// The device exited the record.
    Exited,
}

/// An entry or exit derived by diffing membership.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TrackEvent {
    /// Entered or exited.
    pub transition: Transition,
    /// Which kind of record.
    pub kind: RecordKind,
    /// Record identifier.
    pub id: String,
}

impl TrackEvent {
    /// Create an entry event.
    pub fn entered(kind: RecordKind, id: impl Into<String>) -> Self {
        Self {
            transition: Transition::Entered,
            kind,
            id: id.into(),
        }
    }

    /// Create an exit event.
    pub fn exited(kind: RecordKind, id: impl Into<String>) -> Self {
        Self {
            transition: Transition::Exited,
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for TrackEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self.transition {
            Transition::Entered => "entered",
            Transition::Exited => "exited",
        };
        write!(f, "{} {} {}", verb, self.kind, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinate_validation() {
        assert!(Coordinate::new(0.0, 0.0).is_valid());
        assert!(Coordinate::new(90.0, -180.0).is_valid());
        assert!(!Coordinate::new(90.1, 0.0).is_valid());
        assert!(!Coordinate::new(0.0, 180.5).is_valid());
        assert!(!Coordinate::new(f64::NAN, 0.0).is_valid());
        assert!(Coordinate::new(f64::INFINITY, 0.0).validate().is_err());
    }

    #[test]
    fn test_fix_validation() {
        let fix = LocationFix::new(Coordinate::new(1.0, 2.0), 10.0, FixSource::Manual);
        assert!(fix.validate().is_ok());

        let fix = LocationFix::new(Coordinate::new(1.0, 2.0), -1.0, FixSource::Manual);
        assert_eq!(
            fix.validate().unwrap_err(),
            ValidationError::InvalidAccuracy(-1.0)
        );
    }

    #[test]
    fn test_geometry_dispatch() {
        let origin = Coordinate::new(0.0, 0.0);
        let circle = GeofenceRecord::circle("c", origin, 100.0);
        assert!(circle.geometry.contains(&origin));
        assert_eq!(circle.geometry.kind(), "circle");

        let poly = GeofenceRecord::polygon(
            "p",
            vec![
                Coordinate::new(-0.01, -0.01),
                Coordinate::new(-0.01, 0.01),
                Coordinate::new(0.01, 0.01),
                Coordinate::new(0.01, -0.01),
            ],
        );
        assert!(poly.geometry.contains(&origin));
        assert!(!poly.geometry.contains(&Coordinate::new(1.0, 1.0)));
        assert_eq!(poly.geometry.kind(), "polygon");
    }

    #[test]
    fn test_geofence_validate_degenerate_polygon() {
        let fence = GeofenceRecord::polygon("p", vec![Coordinate::new(0.0, 0.0)]);
        let err = fence.validate().unwrap_err();
        assert!(err.to_string().contains("1 points"));
    }

    #[test]
    fn test_beacon_and_place_proximity() {
        let origin = Coordinate::new(0.0, 0.0);
        let beacon = BeaconRecord::new("b", Uuid::nil(), origin).with_major_minor(1, 2);
        assert!(beacon.contains(&Coordinate::new(0.0005, 0.0)));
        assert!(!beacon.contains(&Coordinate::new(0.01, 0.0)));

        let place = PlaceRecord::new("p", "Cafe", origin).with_radius(10.0);
        assert!(place.contains(&origin));
        assert!(!place.contains(&Coordinate::new(0.001, 0.0)));
    }

    #[test]
    fn test_membership_helpers() {
        let m = Membership::new()
            .with(RecordKind::Geofence, "g1")
            .with(RecordKind::Place, "p1");
        assert!(!m.is_empty());
        assert!(m.ids(RecordKind::Geofence).contains("g1"));
        assert!(m.ids(RecordKind::Beacon).is_empty());
        assert!(Membership::new().is_empty());
    }

    #[test]
    fn test_event_display() {
        let e = TrackEvent::entered(RecordKind::Geofence, "home");
        assert_eq!(e.to_string(), "entered geofence home");
        let e = TrackEvent::exited(RecordKind::Beacon, "door");
        assert_eq!(e.to_string(), "exited beacon door");
    }

    #[test]
    fn test_record_kind_order() {
        assert!(RecordKind::Geofence < RecordKind::Beacon);
        assert!(RecordKind::Beacon < RecordKind::Place);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_geofence_serde_defaults() {
        let json = r#"{
            "id": "fence-1",
            "geometry": {"type": "circle", "center": {"latitude": 1.0, "longitude": 2.0}, "radius": 50.0}
        }"#;
        let fence: GeofenceRecord = serde_json::from_str(json).unwrap();
        assert_eq!(fence.id, "fence-1");
        assert!(fence.tag.is_none());
        assert!(fence.metadata.is_empty());
        assert!(matches!(fence.geometry, Geometry::Circle { radius, .. } if radius == 50.0));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_beacon_serde_default_radius() {
        let json = r#"{
            "id": "b1",
            "uuid": "00000000-0000-0000-0000-000000000000",
            "coordinate": {"latitude": 0.0, "longitude": 0.0}
        }"#;
        let beacon: BeaconRecord = serde_json::from_str(json).unwrap();
        assert_eq!(beacon.radius, DEFAULT_BEACON_RADIUS);
    }
}
