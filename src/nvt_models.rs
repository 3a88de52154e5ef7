// Data model for the NVT live vehicle service
//
// Static reference data comes from a GTFS archive (routes.txt, trips.txt,
// shapes.txt); live positions come from a GTFS-RT VehiclePositions feed.
use crate::nvt_config::Config;
use crate::nvt_geometry::RouteGeometryIndex;
use chrono::{DateTime, Utc};
use geo_types::{Coord, LineString};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};
use tokio::time::Instant;

// ============================================================================
// Route reference data
// ============================================================================

/// A `#rrggbb` colour as published in routes.txt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RgbHex {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl RgbHex {
    pub const DEFAULT_LINE: RgbHex = RgbHex { r: 0x33, g: 0x88, b: 0xff };
    pub const DEFAULT_TEXT: RgbHex = RgbHex { r: 0, g: 0, b: 0 };

    /// Accepts `rrggbb` with or without a leading `#`.
    pub fn parse(value: &str) -> Option<RgbHex> {
        let hex = value.trim();
        let hex = hex.strip_prefix('#').unwrap_or(hex);
        if hex.len() != 6 || !hex.is_ascii() {
            return None;
        }
        let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
        let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
        let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
        Some(RgbHex { r, g, b })
    }

    pub fn parse_or(value: Option<&str>, fallback: RgbHex) -> RgbHex {
        value.and_then(Self::parse).unwrap_or(fallback)
    }

    /// Relative luminance in `[0, 1]`, used to pick readable label text.
    pub fn luminance(&self) -> f32 {
        (0.299 * self.r as f32 + 0.587 * self.g as f32 + 0.114 * self.b as f32) / 255.0
    }
}

impl std::fmt::Display for RgbHex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl Serialize for RgbHex {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteRecord {
    pub route_id: String,
    pub short_name: String,
    pub long_name: String,
    pub color: RgbHex,
    pub text_color: RgbHex,
}

impl RouteRecord {
    /// Public label: the short name, or the id when the short name is blank.
    pub fn label(&self) -> &str {
        if self.short_name.is_empty() {
            &self.route_id
        } else {
            &self.short_name
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShapePoint {
    pub sequence: u32,
    pub lat: f64,
    pub lon: f64,
}

/// An ordered path with at least two points. Coordinates are stored
/// `x = lon`, `y = lat`.
#[derive(Debug, Clone, PartialEq)]
pub struct Polyline(LineString<f64>);

impl Polyline {
    /// Returns `None` for degenerate input (fewer than two points).
    pub fn from_lat_lon(points: impl IntoIterator<Item = (f64, f64)>) -> Option<Polyline> {
        let coords: Vec<Coord<f64>> = points
            .into_iter()
            .map(|(lat, lon)| Coord { x: lon, y: lat })
            .collect();
        if coords.len() < 2 {
            return None;
        }
        Some(Polyline(LineString::new(coords)))
    }

    pub fn line_string(&self) -> &LineString<f64> {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.0.is_empty()
    }

    /// Points as `(lat, lon)` pairs.
    pub fn points(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.0.coords().map(|c| (c.y, c.x))
    }
}

/// route_id -> polylines, ordered by route id.
pub type RouteGeometry = BTreeMap<String, Vec<Polyline>>;

// ============================================================================
// Static dataset snapshot
// ============================================================================

/// Immutable snapshot of the static reference data. Refreshes replace the
/// whole snapshot; nothing mutates one after it is built.
#[derive(Debug)]
pub struct StaticDataset {
    pub routes: Vec<RouteRecord>,
    pub trip_to_route: HashMap<String, String>,
    pub geometry: RouteGeometry,
    /// Name of the source the archive came from.
    pub origin: String,
    pub loaded_at: Instant,
    pub loaded_at_utc: DateTime<Utc>,
    route_index: HashMap<String, usize>,
    reference_latitude: f64,
    geometry_index: OnceLock<RouteGeometryIndex>,
}

impl StaticDataset {
    pub fn new(
        routes: Vec<RouteRecord>,
        trip_to_route: HashMap<String, String>,
        geometry: RouteGeometry,
        origin: impl Into<String>,
    ) -> Self {
        let route_index = routes
            .iter()
            .enumerate()
            .map(|(i, r)| (r.route_id.clone(), i))
            .collect();
        StaticDataset {
            routes,
            trip_to_route,
            geometry,
            origin: origin.into(),
            loaded_at: Instant::now(),
            loaded_at_utc: Utc::now(),
            route_index,
            reference_latitude: Config::REFERENCE_LATITUDE,
            geometry_index: OnceLock::new(),
        }
    }

    /// Sets the latitude the geometry index projects around. Any index built
    /// for the previous latitude is dropped.
    pub fn with_reference_latitude(mut self, reference_latitude: f64) -> Self {
        self.reference_latitude = reference_latitude;
        self.geometry_index = OnceLock::new();
        self
    }

    pub fn reference_latitude(&self) -> f64 {
        self.reference_latitude
    }

    pub fn route(&self, route_id: &str) -> Option<&RouteRecord> {
        self.route_index.get(route_id).map(|&i| &self.routes[i])
    }

    pub fn route_for_trip(&self, trip_id: &str) -> Option<&str> {
        self.trip_to_route.get(trip_id).map(String::as_str)
    }

    /// Display label for a route id, falling back to the id itself.
    pub fn line_label<'a>(&'a self, route_id: &'a str) -> &'a str {
        self.route(route_id).map(RouteRecord::label).unwrap_or(route_id)
    }

    pub fn age(&self) -> std::time::Duration {
        self.loaded_at.elapsed()
    }

    pub fn polyline_count(&self) -> usize {
        self.geometry.values().map(Vec::len).sum()
    }

    /// Nearest-segment index over this snapshot's geometry, built on first use
    /// around [`Self::reference_latitude`]. It lives and dies with the snapshot.
    pub fn geometry_index(&self) -> &RouteGeometryIndex {
        self.geometry_index
            .get_or_init(|| RouteGeometryIndex::build(self, self.reference_latitude))
    }
}

// ============================================================================
// Vehicles
// ============================================================================

/// One decoded, validated feed entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleFix {
    pub id: String,
    pub lat: f64,
    pub lon: f64,
    /// Degrees in `[0, 360)`, 0 when the feed omits it.
    pub bearing: f64,
    pub speed_mps: Option<f64>,
    pub trip_id: Option<String>,
    pub route_id_raw: Option<String>,
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedVehicle {
    #[serde(flatten)]
    pub fix: VehicleFix,
    /// Route id the fix resolved to, if any.
    pub route_id: Option<String>,
    /// Public short name, or `"unknown"`.
    pub route: String,
}

impl ResolvedVehicle {
    pub const UNKNOWN_ROUTE: &'static str = "unknown";

    pub fn id(&self) -> &str {
        &self.fix.id
    }
}

/// A resolved vehicle positioned for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnappedVehicle {
    pub id: String,
    pub route: String,
    pub route_id: Option<String>,
    pub trip_id: Option<String>,
    /// Display position: the snapped point, or the raw fix when not snapped.
    pub lat: f64,
    pub lon: f64,
    pub raw_lat: f64,
    pub raw_lon: f64,
    pub bearing: f64,
    pub speed_mps: Option<f64>,
    pub timestamp: Option<i64>,
    pub snapped_to_line: Option<String>,
    pub snapped: bool,
    pub snap_distance_meters: Option<f64>,
}

/// Single-slot cache of the last resolved feed. Replaced whole, never patched.
#[derive(Debug, Clone)]
pub struct ResolutionCache {
    pub vehicles: Arc<Vec<ResolvedVehicle>>,
    pub fetched_at: Instant,
    pub fetched_at_utc: DateTime<Utc>,
    pub origin: String,
}

impl ResolutionCache {
    pub fn new(vehicles: Vec<ResolvedVehicle>, origin: impl Into<String>) -> Self {
        ResolutionCache {
            vehicles: Arc::new(vehicles),
            fetched_at: Instant::now(),
            fetched_at_utc: Utc::now(),
            origin: origin.into(),
        }
    }

    pub fn age(&self) -> std::time::Duration {
        self.fetched_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvt_geometry::PlanarFrame;

    #[test]
    fn rgb_hex_accepts_optional_hash() {
        assert_eq!(RgbHex::parse("ff0000"), Some(RgbHex { r: 255, g: 0, b: 0 }));
        assert_eq!(RgbHex::parse("#00FF7f"), Some(RgbHex { r: 0, g: 255, b: 127 }));
        assert_eq!(RgbHex::parse("fff"), None);
        assert_eq!(RgbHex::parse("zzzzzz"), None);
        assert_eq!(RgbHex::parse_or(Some(""), RgbHex::DEFAULT_LINE).to_string(), "#3388ff");
        assert_eq!(RgbHex::parse_or(None, RgbHex::DEFAULT_TEXT).to_string(), "#000000");
    }

    #[test]
    fn polyline_rejects_single_point() {
        assert!(Polyline::from_lat_lon([(62.39, 17.30)]).is_none());
        let line = Polyline::from_lat_lon([(62.39, 17.30), (62.40, 17.31)]).unwrap();
        assert_eq!(line.len(), 2);
        assert_eq!(line.points().next(), Some((62.39, 17.30)));
    }

    #[test]
    fn line_label_prefers_short_name() {
        let dataset = StaticDataset::new(
            vec![
                RouteRecord {
                    route_id: "R9".to_string(),
                    short_name: "84".to_string(),
                    long_name: "Sundsvall - Timrå".to_string(),
                    color: RgbHex::DEFAULT_LINE,
                    text_color: RgbHex::DEFAULT_TEXT,
                },
                RouteRecord {
                    route_id: "R10".to_string(),
                    short_name: String::new(),
                    long_name: String::new(),
                    color: RgbHex::DEFAULT_LINE,
                    text_color: RgbHex::DEFAULT_TEXT,
                },
            ],
            HashMap::new(),
            RouteGeometry::new(),
            "test",
        );
        assert_eq!(dataset.line_label("R9"), "84");
        assert_eq!(dataset.line_label("R10"), "R10");
        assert_eq!(dataset.line_label("nope"), "nope");
    }

    #[test]
    fn geometry_index_follows_dataset_latitude() {
        let mut geometry = RouteGeometry::new();
        geometry.insert(
            "R2".to_string(),
            vec![Polyline::from_lat_lon([(62.390, 17.300), (62.392, 17.305)]).unwrap()],
        );
        let dataset = StaticDataset::new(Vec::new(), HashMap::new(), geometry, "test");
        assert_eq!(dataset.reference_latitude(), Config::REFERENCE_LATITUDE);
        assert_eq!(
            dataset.geometry_index().frame(),
            PlanarFrame::new(Config::REFERENCE_LATITUDE)
        );

        let equator = dataset.with_reference_latitude(0.0);
        assert_eq!(equator.geometry_index().frame(), PlanarFrame::new(0.0));
        assert!(std::ptr::eq(equator.geometry_index(), equator.geometry_index()));
    }

    #[test]
    fn resolved_vehicle_serializes_flat() {
        let vehicle = ResolvedVehicle {
            fix: VehicleFix {
                id: "v1".to_string(),
                lat: 62.0,
                lon: 17.0,
                bearing: 90.0,
                speed_mps: None,
                trip_id: None,
                route_id_raw: Some("R9".to_string()),
                timestamp: None,
            },
            route_id: Some("R9".to_string()),
            route: "84".to_string(),
        };
        let json = serde_json::to_value(&vehicle).unwrap();
        assert_eq!(json["id"], "v1");
        assert_eq!(json["route"], "84");
        assert_eq!(json["lat"], 62.0);
        assert_eq!(json["bearing"], 90.0);
    }
}
