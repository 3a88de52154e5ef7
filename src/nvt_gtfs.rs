// GTFS static archive reading: routes.txt, trips.txt and shapes.txt
use crate::nvt_error::{NVTError, Result};
use crate::nvt_models::{Polyline, RgbHex, RouteGeometry, RouteRecord, ShapePoint, StaticDataset};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::{Cursor, Read, Seek};
use zip::ZipArchive;

pub const ROUTES: &str = "routes.txt";
pub const TRIPS: &str = "trips.txt";
pub const SHAPES: &str = "shapes.txt";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RouteRow {
    pub route_id: Option<String>,
    pub route_short_name: Option<String>,
    pub route_long_name: Option<String>,
    pub route_color: Option<String>,
    pub route_text_color: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TripRow {
    pub route_id: Option<String>,
    pub trip_id: Option<String>,
    pub shape_id: Option<String>,
}

/// Kept as text; numeric columns are validated while grouping.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ShapeRow {
    pub shape_id: Option<String>,
    pub shape_pt_sequence: Option<String>,
    pub shape_pt_lat: Option<String>,
    pub shape_pt_lon: Option<String>,
}

/// The three tables the service needs, already typed.
#[derive(Debug, Default)]
pub struct GtfsTables {
    pub routes: Vec<RouteRow>,
    pub trips: Vec<TripRow>,
    pub shapes: Vec<ShapeRow>,
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn read_entry<R: Read + Seek>(archive: &mut ZipArchive<R>, name: &str) -> Result<Vec<u8>> {
    // Some publishers nest the tables in a folder.
    let entry_name = if archive.file_names().any(|n| n == name) {
        name.to_string()
    } else {
        archive
            .file_names()
            .find(|n| n.rsplit('/').next() == Some(name))
            .map(str::to_string)
            .ok_or_else(|| NVTError::MissingResource {
                resource: name.to_string(),
            })?
    };

    let mut file = archive
        .by_name(&entry_name)
        .map_err(|e| NVTError::ParseError(format!("Failed to open {}: {}", name, e)))?;
    let mut contents = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut contents)
        .map_err(|e| NVTError::ParseError(format!("Failed to read {}: {}", name, e)))?;
    Ok(contents)
}

/// Deserializes every well-formed row, skipping (and counting) the rest.
pub fn parse_table<T: DeserializeOwned>(name: &str, contents: &[u8]) -> Vec<T> {
    let contents = contents.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(contents);
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(contents);

    let mut skipped = 0usize;
    let rows: Vec<T> = rdr
        .deserialize()
        .filter_map(|result| match result {
            Ok(row) => Some(row),
            Err(e) => {
                if skipped == 0 {
                    log::warn!("Skipping invalid record in {}: {}", name, e);
                }
                skipped += 1;
                None
            }
        })
        .collect();

    if skipped > 0 {
        log::warn!("Skipped {} invalid records in {}", skipped, name);
    }
    rows
}

pub fn read_archive(bytes: &[u8]) -> Result<GtfsTables> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| NVTError::ParseError(format!("Failed to open GTFS zip archive: {}", e)))?;

    let routes = read_entry(&mut archive, ROUTES)?;
    let trips = read_entry(&mut archive, TRIPS)?;
    let shapes = read_entry(&mut archive, SHAPES)?;

    Ok(GtfsTables {
        routes: parse_table(ROUTES, &routes),
        trips: parse_table(TRIPS, &trips),
        shapes: parse_table(SHAPES, &shapes),
    })
}

pub fn build_routes(rows: &[RouteRow]) -> Vec<RouteRecord> {
    let mut seen = HashSet::new();
    rows.iter()
        .filter_map(|row| {
            let route_id = present(&row.route_id)?;
            if !seen.insert(route_id.to_string()) {
                log::debug!("Duplicate route_id {} ignored", route_id);
                return None;
            }
            Some(RouteRecord {
                route_id: route_id.to_string(),
                short_name: present(&row.route_short_name).unwrap_or("").to_string(),
                long_name: present(&row.route_long_name).unwrap_or("").to_string(),
                color: RgbHex::parse_or(present(&row.route_color), RgbHex::DEFAULT_LINE),
                text_color: RgbHex::parse_or(present(&row.route_text_color), RgbHex::DEFAULT_TEXT),
            })
        })
        .collect()
}

/// trip_id -> route_id. Rows missing either id are skipped; the last row for
/// a trip wins.
pub fn build_trip_bindings(rows: &[TripRow]) -> HashMap<String, String> {
    let mut bindings = HashMap::with_capacity(rows.len());
    for row in rows {
        if let (Some(trip_id), Some(route_id)) = (present(&row.trip_id), present(&row.route_id)) {
            bindings.insert(trip_id.to_string(), route_id.to_string());
        }
    }
    bindings
}

/// shape_id -> points ordered by sequence.
pub fn group_shape_points(rows: &[ShapeRow]) -> HashMap<String, Vec<ShapePoint>> {
    let mut shapes: HashMap<String, Vec<ShapePoint>> = HashMap::new();
    let mut invalid = 0usize;

    for row in rows {
        let point = (|| {
            let shape_id = present(&row.shape_id)?;
            let sequence = present(&row.shape_pt_sequence)?.parse::<u32>().ok()?;
            let lat = present(&row.shape_pt_lat)?.parse::<f64>().ok()?;
            let lon = present(&row.shape_pt_lon)?.parse::<f64>().ok()?;
            (lat.is_finite() && lon.is_finite()).then_some((shape_id, ShapePoint { sequence, lat, lon }))
        })();

        match point {
            Some((shape_id, point)) => shapes.entry(shape_id.to_string()).or_default().push(point),
            None => invalid += 1,
        }
    }

    if invalid > 0 {
        log::warn!("Skipped {} incomplete shape points", invalid);
    }

    for points in shapes.values_mut() {
        points.sort_by_key(|p| p.sequence);
    }
    shapes
}

/// route_id -> polylines of every shape its trips use. Shapes with fewer
/// than two points are dropped, as are routes left with no polyline.
pub fn build_geometry(trips: &[TripRow], shapes: &HashMap<String, Vec<ShapePoint>>) -> RouteGeometry {
    let mut route_shapes: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for trip in trips {
        if let (Some(route_id), Some(shape_id)) = (present(&trip.route_id), present(&trip.shape_id)) {
            route_shapes.entry(route_id).or_default().insert(shape_id);
        }
    }

    let mut geometry = RouteGeometry::new();
    for (route_id, shape_ids) in route_shapes {
        let polylines: Vec<Polyline> = shape_ids
            .into_iter()
            .filter_map(|shape_id| shapes.get(shape_id))
            .filter_map(|points| Polyline::from_lat_lon(points.iter().map(|p| (p.lat, p.lon))))
            .collect();
        if !polylines.is_empty() {
            geometry.insert(route_id.to_string(), polylines);
        }
    }
    geometry
}

pub fn build_dataset(tables: &GtfsTables, origin: &str) -> StaticDataset {
    let routes = build_routes(&tables.routes);
    let trip_to_route = build_trip_bindings(&tables.trips);
    let shape_points = group_shape_points(&tables.shapes);
    let geometry = build_geometry(&tables.trips, &shape_points);

    let dataset = StaticDataset::new(routes, trip_to_route, geometry, origin);
    log::info!(
        "Static dataset from {}: {} routes, {} trips, {} shapes, {} polylines on {} routes",
        origin,
        dataset.routes.len(),
        dataset.trip_to_route.len(),
        shape_points.len(),
        dataset.polyline_count(),
        dataset.geometry.len()
    );
    dataset
}

/// Reads an archive payload into a dataset snapshot.
pub fn load_archive(bytes: &[u8], origin: &str) -> Result<StaticDataset> {
    log::info!("Extracting static archive from {} ({} KB)", origin, bytes.len() / 1024);
    let tables = read_archive(bytes)?;
    Ok(build_dataset(&tables, origin))
}
