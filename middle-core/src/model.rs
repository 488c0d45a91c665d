//! Primitive records handled by the middle layer.
//!
//! Points, ways and relations each live in their own id space. Member
//! sequences are stored and returned in caller order.

use std::collections::BTreeMap;
use std::fmt;

use geo::Coord;
use serde::{Deserialize, Serialize};

/// Identifier of a point, way or relation within its own id space.
pub type PrimitiveId = i64;

/// Opaque key/value tag payload attached to a primitive.
pub type Tags = BTreeMap<String, String>;

/// Fixed-point scale: one unit is 1e-7 degrees.
const COORDINATE_PRECISION: f64 = 10_000_000.0;
const UNSET: i32 = i32::MAX;

/// A packed longitude/latitude pair at 1e-7 degree precision.
///
/// The value `(i32::MAX, i32::MAX)` is reserved as the "unset" sentinel used
/// by dense cache storage to mark empty slots.
///
/// # Examples
/// ```
/// use middle_core::Coordinate;
///
/// let coordinate = Coordinate::from_degrees(13.377_704, 52.516_275).expect("valid");
/// assert_eq!(coordinate.x(), 133_777_040);
/// assert!((coordinate.lat() - 52.516_275).abs() < 1e-7);
/// assert!(Coordinate::UNSET.is_unset());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinate {
    x: i32,
    y: i32,
}

impl Coordinate {
    /// Sentinel for "no coordinate stored".
    pub const UNSET: Self = Self { x: UNSET, y: UNSET };

    /// Build a coordinate from raw fixed-point components.
    ///
    /// Returns `None` for the sentinel pair and for values outside the valid
    /// WGS84 range.
    pub const fn from_fixed(x: i32, y: i32) -> Option<Self> {
        if x < -1_800_000_000 || x > 1_800_000_000 || y < -900_000_000 || y > 900_000_000 {
            return None;
        }
        Some(Self { x, y })
    }

    /// Convert degrees to a packed coordinate, rounding to the nearest unit.
    ///
    /// Non-finite input and positions outside `[-180, 180] x [-90, 90]` yield
    /// `None`.
    #[expect(
        clippy::float_arithmetic,
        clippy::cast_possible_truncation,
        reason = "fixed-point conversion of range-checked degrees"
    )]
    pub fn from_degrees(lon: f64, lat: f64) -> Option<Self> {
        let valid = lon.is_finite()
            && lat.is_finite()
            && (-180.0..=180.0).contains(&lon)
            && (-90.0..=90.0).contains(&lat);
        if !valid {
            return None;
        }
        let x = (lon * COORDINATE_PRECISION).round() as i32;
        let y = (lat * COORDINATE_PRECISION).round() as i32;
        Self::from_fixed(x, y)
    }

    /// Raw fixed-point longitude.
    pub const fn x(self) -> i32 {
        self.x
    }

    /// Raw fixed-point latitude.
    pub const fn y(self) -> i32 {
        self.y
    }

    /// Longitude in degrees.
    #[expect(clippy::float_arithmetic, reason = "fixed-point to degrees")]
    pub fn lon(self) -> f64 {
        f64::from(self.x) / COORDINATE_PRECISION
    }

    /// Latitude in degrees.
    #[expect(clippy::float_arithmetic, reason = "fixed-point to degrees")]
    pub fn lat(self) -> f64 {
        f64::from(self.y) / COORDINATE_PRECISION
    }

    /// Whether this is the unset sentinel.
    pub const fn is_unset(self) -> bool {
        self.x == UNSET && self.y == UNSET
    }

    /// Convert into a `geo` coordinate with `x = longitude`, `y = latitude`.
    pub fn to_geo(self) -> Coord<f64> {
        Coord {
            x: self.lon(),
            y: self.lat(),
        }
    }
}

impl fmt::Debug for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unset() {
            return f.write_str("Coordinate(unset)");
        }
        write!(f, "Coordinate({:.7}, {:.7})", self.lon(), self.lat())
    }
}

/// Optional authorship metadata carried alongside a primitive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    /// Object version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i32>,
    /// Last-edit timestamp as an ISO 8601 string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Changeset that produced this version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changeset: Option<i64>,
    /// Numeric user id of the last editor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<i32>,
    /// Display name of the last editor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// A point with its location.
#[derive(Debug, Clone, PartialEq)]
pub struct PointRecord {
    /// Point identifier.
    pub id: PrimitiveId,
    /// Location of the point.
    pub location: Coordinate,
    /// Tag payload.
    pub tags: Tags,
    /// Optional attribute payload.
    pub attributes: Option<Attributes>,
}

impl PointRecord {
    /// Convenience constructor for an untagged point.
    pub const fn new(id: PrimitiveId, location: Coordinate) -> Self {
        Self {
            id,
            location,
            tags: Tags::new(),
            attributes: None,
        }
    }
}

/// An ordered path of point references.
#[derive(Debug, Clone, PartialEq)]
pub struct WayRecord {
    /// Way identifier.
    pub id: PrimitiveId,
    /// Point ids in path order.
    pub nodes: Vec<PrimitiveId>,
    /// Tag payload.
    pub tags: Tags,
    /// Optional attribute payload.
    pub attributes: Option<Attributes>,
}

impl WayRecord {
    /// Convenience constructor for an untagged way.
    pub const fn new(id: PrimitiveId, nodes: Vec<PrimitiveId>) -> Self {
        Self {
            id,
            nodes,
            tags: Tags::new(),
            attributes: None,
        }
    }
}

/// Kind of primitive a relation member refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MemberKind {
    /// A point member.
    #[serde(rename = "n")]
    Point,
    /// A way member.
    #[serde(rename = "w")]
    Way,
    /// A relation member.
    #[serde(rename = "r")]
    Relation,
}

impl MemberKind {
    /// Single-letter code used in the persisted member list.
    pub const fn code(self) -> &'static str {
        match self {
            Self::Point => "n",
            Self::Way => "w",
            Self::Relation => "r",
        }
    }
}

/// One typed, roled member of a relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Kind of the referenced primitive.
    #[serde(rename = "type")]
    pub kind: MemberKind,
    /// Identifier in the member kind's id space.
    #[serde(rename = "ref")]
    pub id: PrimitiveId,
    /// Role string, possibly empty.
    pub role: String,
}

impl Member {
    /// Build a member entry.
    pub fn new(kind: MemberKind, id: PrimitiveId, role: impl Into<String>) -> Self {
        Self {
            kind,
            id,
            role: role.into(),
        }
    }
}

/// An ordered set of typed, roled members.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationRecord {
    /// Relation identifier.
    pub id: PrimitiveId,
    /// Members in caller order.
    pub members: Vec<Member>,
    /// Tag payload.
    pub tags: Tags,
    /// Optional attribute payload.
    pub attributes: Option<Attributes>,
}

impl RelationRecord {
    /// Convenience constructor for an untagged relation.
    pub const fn new(id: PrimitiveId, members: Vec<Member>) -> Self {
        Self {
            id,
            members,
            tags: Tags::new(),
            attributes: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0.0, 0.0)]
    #[case(180.0, 90.0)]
    #[case(-180.0, -90.0)]
    #[case(13.377_704_1, 52.516_275_3)]
    fn converts_degrees_without_drift(#[case] lon: f64, #[case] lat: f64) {
        let coordinate = Coordinate::from_degrees(lon, lat).expect("valid coordinate");
        assert!((coordinate.lon() - lon).abs() <= 0.5e-7);
        assert!((coordinate.lat() - lat).abs() <= 0.5e-7);
        assert!(!coordinate.is_unset());
    }

    #[rstest]
    #[case(f64::NAN, 0.0)]
    #[case(0.0, f64::INFINITY)]
    #[case(180.5, 0.0)]
    #[case(0.0, -90.5)]
    fn rejects_invalid_degrees(#[case] lon: f64, #[case] lat: f64) {
        assert_eq!(Coordinate::from_degrees(lon, lat), None);
    }

    #[rstest]
    fn sentinel_is_not_a_valid_fixed_coordinate() {
        assert_eq!(Coordinate::from_fixed(i32::MAX, i32::MAX), None);
        assert!(Coordinate::UNSET.is_unset());
    }

    #[rstest]
    fn member_serialises_with_short_codes() {
        let member = Member::new(MemberKind::Way, 12, "outer");
        let json = serde_json::to_string(&member).expect("serialise member");
        assert_eq!(json, r#"{"type":"w","ref":12,"role":"outer"}"#);
    }
}
