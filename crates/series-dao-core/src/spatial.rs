use std::f64::consts::{FRAC_PI_2, FRAC_PI_4};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::QueryError;

/// Semi-major axis of the spherical mercator projection, in metres.
const MERCATOR_RADIUS: f64 = 6_378_137.0;
/// Latitude beyond which spherical mercator is undefined.
const MERCATOR_MAX_LATITUDE: f64 = 85.051_128_779_806_59;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Coordinate reference systems understood by [`EpsgTransform`].
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash)]
pub enum Crs {
    /// EPSG:4326. Authority axis order is latitude/longitude.
    #[default]
    Wgs84,
    /// CRS:84. Longitude/latitude.
    Crs84,
    /// EPSG:3857 (also known as EPSG:900913).
    WebMercator,
}

impl Crs {
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::Wgs84 => "EPSG:4326",
            Self::Crs84 => "CRS:84",
            Self::WebMercator => "EPSG:3857",
        }
    }

    /// Accepts `EPSG:<n>`, `CRS:84`, OGC URNs and `opengis.net` URIs.
    ///
    /// # Errors
    /// Returns [`QueryError::SpatialTransform`] for unsupported reference systems.
    pub fn parse(value: &str) -> Result<Self, QueryError> {
        let normalized = value.trim().to_ascii_uppercase();
        let code = if let Some(rest) = normalized.strip_prefix("URN:OGC:DEF:CRS:") {
            rest.replace("::", ":")
        } else if let Some(index) = normalized.find("/DEF/CRS/") {
            let mut parts = normalized[index + "/DEF/CRS/".len()..].split('/');
            let authority = parts.next().unwrap_or_default();
            let _version = parts.next();
            let number = parts.next().unwrap_or_default();
            format!("{authority}:{number}")
        } else {
            normalized
        };

        match code.as_str() {
            "EPSG:4326" => Ok(Self::Wgs84),
            "CRS:84" | "OGC:CRS84" | "OGC:1.3:CRS84" => Ok(Self::Crs84),
            "EPSG:3857" | "EPSG:900913" => Ok(Self::WebMercator),
            _ => Err(QueryError::SpatialTransform(format!(
                "unsupported coordinate reference system: {value}"
            ))),
        }
    }
}

impl Display for Crs {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Axis-aligned rectangle in a single reference system.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Envelope {
    #[must_use]
    pub fn from_corners(a: Point, b: Point) -> Self {
        Self {
            min_x: a.x.min(b.x),
            min_y: a.y.min(b.y),
            max_x: a.x.max(b.x),
            max_y: a.y.max(b.y),
        }
    }

    #[must_use]
    pub fn from_point(point: Point) -> Self {
        Self::from_corners(point, point)
    }

    /// Boundary contact counts as intersection.
    #[must_use]
    pub fn intersects(&self, other: &Envelope) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }
}

pub trait CoordinateTransform {
    /// # Errors
    /// Returns [`QueryError::SpatialTransform`] when the point cannot be expressed in `target`.
    fn transform(&self, point: Point, source: Crs, target: Crs) -> Result<Point, QueryError>;
}

/// Deterministic transform between the supported reference systems.
///
/// With `forced_xy` (the default) every geographic input is read as longitude/latitude
/// regardless of the authority axis order.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct EpsgTransform {
    pub forced_xy: bool,
}

impl Default for EpsgTransform {
    fn default() -> Self {
        Self { forced_xy: true }
    }
}

impl EpsgTransform {
    fn to_lon_lat(self, point: Point, crs: Crs) -> Result<(f64, f64), QueryError> {
        let (lon, lat) = match crs {
            Crs::Wgs84 if !self.forced_xy => (point.y, point.x),
            Crs::Wgs84 | Crs::Crs84 => (point.x, point.y),
            Crs::WebMercator => {
                let lon = (point.x / MERCATOR_RADIUS).to_degrees();
                let lat = (2.0 * (point.y / MERCATOR_RADIUS).exp().atan() - FRAC_PI_2).to_degrees();
                (lon, lat)
            }
        };
        check_geographic(lon, lat, crs)?;
        Ok((lon, lat))
    }

    fn from_lon_lat(self, lon: f64, lat: f64, crs: Crs) -> Result<Point, QueryError> {
        match crs {
            Crs::Wgs84 if !self.forced_xy => Ok(Point::new(lat, lon)),
            Crs::Wgs84 | Crs::Crs84 => Ok(Point::new(lon, lat)),
            Crs::WebMercator => {
                if lat.abs() > MERCATOR_MAX_LATITUDE {
                    return Err(QueryError::SpatialTransform(format!(
                        "latitude {lat} outside the {crs} domain"
                    )));
                }
                let x = MERCATOR_RADIUS * lon.to_radians();
                let y = MERCATOR_RADIUS * (FRAC_PI_4 + lat.to_radians() / 2.0).tan().ln();
                Ok(Point::new(x, y))
            }
        }
    }
}

impl CoordinateTransform for EpsgTransform {
    fn transform(&self, point: Point, source: Crs, target: Crs) -> Result<Point, QueryError> {
        if !point.is_finite() {
            return Err(QueryError::SpatialTransform(format!(
                "non-finite coordinate ({}, {}) in {source}",
                point.x, point.y
            )));
        }
        let (lon, lat) = self.to_lon_lat(point, source)?;
        let projected = self.from_lon_lat(lon, lat, target)?;
        if projected.is_finite() {
            Ok(projected)
        } else {
            Err(QueryError::SpatialTransform(format!(
                "transform from {source} to {target} produced a non-finite coordinate"
            )))
        }
    }
}

fn check_geographic(lon: f64, lat: f64, crs: Crs) -> Result<(), QueryError> {
    if !lon.is_finite() || !lat.is_finite() || lon.abs() > 180.0 || lat.abs() > 90.0 {
        return Err(QueryError::SpatialTransform(format!(
            "coordinate ({lon}, {lat}) outside the {crs} domain"
        )));
    }
    Ok(())
}
