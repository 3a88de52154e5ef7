// Snapping engine: pull noisy GPS fixes onto the nearest route polyline
use crate::nvt_geometry::RouteGeometryIndex;
use crate::nvt_models::{ResolvedVehicle, SnappedVehicle, VehicleFix};

#[derive(Debug, Clone, PartialEq)]
pub struct SnapResult {
    pub lat: f64,
    pub lon: f64,
    pub snapped_to_line: Option<String>,
    pub snapped: bool,
    pub distance_meters: Option<f64>,
}

impl SnapResult {
    fn unsnapped(lat: f64, lon: f64) -> Self {
        SnapResult {
            lat,
            lon,
            snapped_to_line: None,
            snapped: false,
            distance_meters: None,
        }
    }
}

/// Projects the fix onto the nearest segment when it lies within
/// `threshold_meters`, otherwise hands its position back untouched.
pub fn snap(fix: &VehicleFix, index: &RouteGeometryIndex, threshold_meters: f64) -> SnapResult {
    match index.nearest_segment(fix.lat, fix.lon) {
        Some(m) if m.distance_meters <= threshold_meters => SnapResult {
            lat: m.lat,
            lon: m.lon,
            snapped_to_line: Some(m.line),
            snapped: true,
            distance_meters: Some(m.distance_meters),
        },
        _ => SnapResult::unsnapped(fix.lat, fix.lon),
    }
}

pub fn snap_vehicle(
    vehicle: &ResolvedVehicle,
    index: Option<&RouteGeometryIndex>,
    threshold_meters: f64,
) -> SnappedVehicle {
    let fix = &vehicle.fix;
    let result = match index {
        Some(index) => snap(fix, index, threshold_meters),
        None => SnapResult::unsnapped(fix.lat, fix.lon),
    };

    SnappedVehicle {
        id: fix.id.clone(),
        route: vehicle.route.clone(),
        route_id: vehicle.route_id.clone(),
        trip_id: fix.trip_id.clone(),
        lat: result.lat,
        lon: result.lon,
        raw_lat: fix.lat,
        raw_lon: fix.lon,
        bearing: fix.bearing,
        speed_mps: fix.speed_mps,
        timestamp: fix.timestamp,
        snapped_to_line: result.snapped_to_line,
        snapped: result.snapped,
        snap_distance_meters: result.distance_meters,
    }
}

pub fn snap_all(
    vehicles: &[ResolvedVehicle],
    index: Option<&RouteGeometryIndex>,
    threshold_meters: f64,
) -> Vec<SnappedVehicle> {
    let snapped: Vec<SnappedVehicle> = vehicles
        .iter()
        .map(|v| snap_vehicle(v, index, threshold_meters))
        .collect();
    log::debug!(
        "Snapped {}/{} vehicles",
        snapped.iter().filter(|v| v.snapped).count(),
        snapped.len()
    );
    snapped
}
