//! Plain value types shared by every engine component.

use std::fmt;

use chrono::{DateTime, Utc};
use geo::{Coord, Intersects, LineString, Point, Polygon, Rect};
use serde::{Deserialize, Serialize};

pub type Timestamp = DateTime<Utc>;

/// A WGS84 coordinate. Field order follows the front end (`{lat, lng}`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
}

impl Location {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    /// `geo` works in (x = lng, y = lat).
    pub fn to_point(self) -> Point<f64> {
        Point::new(self.lng, self.lat)
    }

    pub fn to_coord(self) -> Coord<f64> {
        Coord {
            x: self.lng,
            y: self.lat,
        }
    }

    pub fn from_point(point: Point<f64>) -> Self {
        Self::new(point.y(), point.x())
    }
}

/// Stable category identifier (`theft`, `accident`, ...). Display metadata
/// such as icons and colors belongs to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CategoryId(String);

impl CategoryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CategoryId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for CategoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rectangular or polygonal query area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Region {
    BoundingBox { min: Location, max: Location },
    Polygon { exterior: Vec<Location> },
}

impl Region {
    pub fn bbox(min: Location, max: Location) -> Self {
        Self::BoundingBox { min, max }
    }

    pub fn to_polygon(&self) -> Polygon<f64> {
        match self {
            Self::BoundingBox { min, max } => Rect::new(min.to_coord(), max.to_coord()).to_polygon(),
            Self::Polygon { exterior } => Polygon::new(
                LineString::from(exterior.iter().map(|l| l.to_coord()).collect::<Vec<_>>()),
                vec![],
            ),
        }
    }

    /// Boundary points count as inside.
    pub fn contains(&self, location: Location) -> bool {
        self.prepare().contains(location)
    }

    /// Builds the containment test once, for callers testing many points.
    pub fn prepare(&self) -> PreparedRegion {
        match self {
            Self::BoundingBox { min, max } => PreparedRegion::Rect {
                lat: (min.lat.min(max.lat), min.lat.max(max.lat)),
                lng: (min.lng.min(max.lng), min.lng.max(max.lng)),
            },
            Self::Polygon { .. } => PreparedRegion::Polygon(self.to_polygon()),
        }
    }

    pub fn is_valid(&self) -> bool {
        match self {
            Self::BoundingBox { min, max } => min.is_valid() && max.is_valid(),
            Self::Polygon { exterior } => {
                exterior.len() >= 3 && exterior.iter().all(Location::is_valid)
            }
        }
    }
}

/// A [`Region`] ready for repeated point-in-region tests.
#[derive(Debug, Clone, PartialEq)]
pub enum PreparedRegion {
    Rect { lat: (f64, f64), lng: (f64, f64) },
    Polygon(Polygon<f64>),
}

impl PreparedRegion {
    pub fn contains(&self, location: Location) -> bool {
        match self {
            Self::Rect { lat, lng } => {
                (lat.0..=lat.1).contains(&location.lat) && (lng.0..=lng.1).contains(&location.lng)
            }
            Self::Polygon(polygon) => polygon.intersects(&location.to_point()),
        }
    }
}
