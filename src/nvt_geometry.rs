// Nearest-segment search over route geometry
//
// Positions are projected to a local equirectangular plane (meters) scaled at
// a fixed reference latitude. Good enough inside a single metropolitan area.
use crate::nvt_models::StaticDataset;
use geo::BoundingRect;
use geo_types::{Coord, LineString, Rect};

pub const METERS_PER_DEG_LAT: f64 = 111_320.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlanarFrame {
    meters_per_deg_lat: f64,
    meters_per_deg_lon: f64,
}

impl PlanarFrame {
    pub fn new(reference_latitude: f64) -> Self {
        PlanarFrame {
            meters_per_deg_lat: METERS_PER_DEG_LAT,
            meters_per_deg_lon: METERS_PER_DEG_LAT * reference_latitude.to_radians().cos(),
        }
    }

    pub fn to_xy(&self, lat: f64, lon: f64) -> Coord<f64> {
        Coord {
            x: lon * self.meters_per_deg_lon,
            y: lat * self.meters_per_deg_lat,
        }
    }

    pub fn to_lat_lon(&self, p: Coord<f64>) -> (f64, f64) {
        (p.y / self.meters_per_deg_lat, p.x / self.meters_per_deg_lon)
    }
}

/// Closest point on segment `a -> b` to `p`, with its squared distance.
pub fn project_on_segment(p: Coord<f64>, a: Coord<f64>, b: Coord<f64>) -> (Coord<f64>, f64) {
    let ab = b - a;
    let ap = p - a;
    let ab2 = ab.x * ab.x + ab.y * ab.y;
    if ab2 == 0.0 {
        return (a, ap.x * ap.x + ap.y * ap.y);
    }

    let t = ((ap.x * ab.x + ap.y * ab.y) / ab2).clamp(0.0, 1.0);
    let q = Coord {
        x: a.x + t * ab.x,
        y: a.y + t * ab.y,
    };
    let d = p - q;
    (q, d.x * d.x + d.y * d.y)
}

fn rect_distance2(rect: &Rect<f64>, p: Coord<f64>) -> f64 {
    let (min, max) = (rect.min(), rect.max());
    let dx = (min.x - p.x).max(0.0).max(p.x - max.x);
    let dy = (min.y - p.y).max(0.0).max(p.y - max.y);
    dx * dx + dy * dy
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentMatch {
    pub route_id: String,
    /// Short name of the matched route, or its id when it has none.
    pub line: String,
    pub lat: f64,
    pub lon: f64,
    pub distance_meters: f64,
}

#[derive(Debug)]
struct IndexedPolyline {
    route: usize,
    points: LineString<f64>,
    bounds: Rect<f64>,
}

/// Planar copy of a dataset's geometry, ready for repeated queries.
#[derive(Debug)]
pub struct RouteGeometryIndex {
    frame: PlanarFrame,
    routes: Vec<(String, String)>,
    polylines: Vec<IndexedPolyline>,
}

impl RouteGeometryIndex {
    pub fn build(dataset: &StaticDataset, reference_latitude: f64) -> Self {
        let frame = PlanarFrame::new(reference_latitude);
        let mut routes = Vec::with_capacity(dataset.geometry.len());
        let mut polylines = Vec::new();

        for (route_id, lines) in &dataset.geometry {
            let route = routes.len();
            routes.push((route_id.clone(), dataset.line_label(route_id).to_string()));

            for line in lines {
                let points: LineString<f64> = line
                    .points()
                    .map(|(lat, lon)| frame.to_xy(lat, lon))
                    .collect();
                if let Some(bounds) = points.bounding_rect() {
                    polylines.push(IndexedPolyline { route, points, bounds });
                }
            }
        }

        log::debug!(
            "Built geometry index: {} routes, {} polylines",
            routes.len(),
            polylines.len()
        );

        RouteGeometryIndex { frame, routes, polylines }
    }

    pub fn frame(&self) -> PlanarFrame {
        self.frame
    }

    pub fn is_empty(&self) -> bool {
        self.polylines.is_empty()
    }

    /// Minimum over every segment of every polyline. On equal distances the
    /// first segment visited wins.
    pub fn nearest_segment(&self, lat: f64, lon: f64) -> Option<SegmentMatch> {
        let p = self.frame.to_xy(lat, lon);
        let mut best: Option<(usize, Coord<f64>, f64)> = None;

        for polyline in &self.polylines {
            if let Some((_, _, best_d2)) = best {
                // Nothing inside this box can beat the current best.
                if rect_distance2(&polyline.bounds, p) >= best_d2 {
                    continue;
                }
            }
            for segment in polyline.points.lines() {
                let (q, d2) = project_on_segment(p, segment.start, segment.end);
                if best.is_none_or(|(_, _, best_d2)| d2 < best_d2) {
                    best = Some((polyline.route, q, d2));
                }
            }
        }

        best.map(|(route, q, d2)| {
            let (lat, lon) = self.frame.to_lat_lon(q);
            let (route_id, line) = &self.routes[route];
            SegmentMatch {
                route_id: route_id.clone(),
                line: line.clone(),
                lat,
                lon,
                distance_meters: d2.sqrt(),
            }
        })
    }
}

/// Convenience over [`StaticDataset::geometry_index`].
pub fn nearest_segment(lat: f64, lon: f64, dataset: &StaticDataset) -> Option<SegmentMatch> {
    dataset.geometry_index().nearest_segment(lat, lon)
}
