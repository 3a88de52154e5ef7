// GTFS-RT VehiclePositions decoding
use crate::nvt_error::{NVTError, Result};
use crate::nvt_models::VehicleFix;
use gtfs_rt::FeedMessage;
use prost::Message;

#[derive(Debug, Clone, Default)]
pub struct DecodedFeed {
    pub fixes: Vec<VehicleFix>,
    pub header_timestamp: Option<u64>,
    /// Entities without a usable position.
    pub skipped: usize,
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty()).map(str::to_string)
}

/// `(0, 0)` is what receivers without a GPS lock report; it counts as absent.
fn valid_position(lat: f64, lon: f64) -> bool {
    lat.is_finite()
        && lon.is_finite()
        && (-90.0..=90.0).contains(&lat)
        && (-180.0..=180.0).contains(&lon)
        && !(lat == 0.0 && lon == 0.0)
}

/// Into `[0, 360)`; missing or non-finite becomes 0.
pub fn normalize_bearing(bearing: Option<f32>) -> f64 {
    match bearing.map(f64::from) {
        Some(b) if b.is_finite() => {
            let b = b.rem_euclid(360.0);
            // rem_euclid can round up to exactly 360 for tiny negatives.
            if b >= 360.0 { 0.0 } else { b }
        }
        _ => 0.0,
    }
}

pub fn decode_feed(bytes: &[u8], upstream: &str) -> Result<DecodedFeed> {
    let feed = FeedMessage::decode(bytes).map_err(|e| NVTError::DecodeError {
        upstream: upstream.to_string(),
        message: e.to_string(),
    })?;

    let header_timestamp = feed.header.timestamp;
    let mut skipped = 0usize;

    let fixes: Vec<VehicleFix> = feed
        .entity
        .into_iter()
        .filter_map(|entity| {
            let vehicle = entity.vehicle?;
            let fix = vehicle.position.as_ref().and_then(|position| {
                let lat = position.latitude as f64;
                let lon = position.longitude as f64;
                if !valid_position(lat, lon) {
                    return None;
                }

                let id = non_empty(Some(&entity.id))
                    .or_else(|| non_empty(vehicle.vehicle.as_ref().and_then(|v| v.id.as_ref())))?;
                let trip = vehicle.trip.as_ref();

                Some(VehicleFix {
                    id,
                    lat,
                    lon,
                    bearing: normalize_bearing(position.bearing),
                    speed_mps: position
                        .speed
                        .map(f64::from)
                        .filter(|s| s.is_finite() && *s >= 0.0),
                    trip_id: non_empty(trip.and_then(|t| t.trip_id.as_ref())),
                    route_id_raw: non_empty(trip.and_then(|t| t.route_id.as_ref())),
                    timestamp: vehicle.timestamp.map(|ts| ts as i64),
                })
            });
            if fix.is_none() {
                skipped += 1;
            }
            fix
        })
        .collect();

    log::debug!(
        "Decoded {} vehicle positions from {} ({} skipped)",
        fixes.len(),
        upstream,
        skipped
    );

    Ok(DecodedFeed {
        fixes,
        header_timestamp,
        skipped,
    })
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use gtfs_rt::{FeedEntity, FeedHeader, Position, VehiclePosition};

    #[test]
    fn decodes_positions_and_trip_references() {
        let bytes = encode_feed(&[
            Entity {
                id: "bus-1",
                position: Some((62.392, 17.305)),
                trip_id: Some("T1"),
                route_id: None,
            },
            Entity {
                id: "bus-2",
                position: Some((62.40, 17.31)),
                trip_id: Some("T2"),
                route_id: Some("R2"),
            },
        ]);
        let decoded = decode_feed(&bytes, "test").unwrap();

        assert_eq!(decoded.fixes.len(), 2);
        assert_eq!(decoded.header_timestamp, Some(1_760_000_000));
        let first = &decoded.fixes[0];
        assert_eq!(first.id, "bus-1");
        assert!((first.lat - 62.392).abs() < 1e-5);
        assert_eq!(first.trip_id.as_deref(), Some("T1"));
        assert_eq!(first.route_id_raw, None);
        assert_eq!(first.bearing, 0.0);
        assert_eq!(first.speed_mps, None);
        assert_eq!(decoded.fixes[1].route_id_raw.as_deref(), Some("R2"));
    }

    #[test]
    fn entities_without_position_are_skipped() {
        let bytes = encode_feed(&[
            Entity {
                id: "ghost",
                position: None,
                trip_id: Some("T1"),
                route_id: None,
            },
            entity("nan", f32::NAN, 17.0),
            entity("off-planet", 123.0, 17.0),
            entity("ok", 62.39, 17.30),
        ]);
        let decoded = decode_feed(&bytes, "test").unwrap();

        assert_eq!(decoded.fixes.len(), 1);
        assert_eq!(decoded.fixes[0].id, "ok");
        assert_eq!(decoded.skipped, 3);
    }

    #[test]
    fn null_island_fix_counts_as_missing_position() {
        let bytes = encode_feed(&[
            entity("no-lock", 0.0, 0.0),
            entity("equator", 0.0, 17.30),
            entity("meridian", 62.39, 0.0),
        ]);
        let decoded = decode_feed(&bytes, "test").unwrap();

        let ids: Vec<_> = decoded.fixes.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["equator", "meridian"]);
        assert_eq!(decoded.skipped, 1);
    }

    #[test]
    fn bearing_and_speed_are_validated() {
        let feed = gtfs_rt::FeedMessage {
            header: FeedHeader {
                gtfs_realtime_version: "2.0".to_string(),
                ..Default::default()
            },
            entity: vec![FeedEntity {
                id: "v".to_string(),
                vehicle: Some(VehiclePosition {
                    position: Some(Position {
                        latitude: 62.39,
                        longitude: 17.30,
                        bearing: Some(-90.0),
                        speed: Some(8.5),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        };
        let decoded = decode_feed(&feed.encode_to_vec(), "test").unwrap();
        let fix = &decoded.fixes[0];
        assert_eq!(fix.bearing, 270.0);
        assert_eq!(fix.speed_mps, Some(8.5));
        assert_eq!(fix.timestamp, None);
    }

    #[test]
    fn normalize_bearing_wraps_into_range() {
        assert_eq!(normalize_bearing(None), 0.0);
        assert_eq!(normalize_bearing(Some(360.0)), 0.0);
        assert_eq!(normalize_bearing(Some(725.0)), 5.0);
        assert_eq!(normalize_bearing(Some(f32::INFINITY)), 0.0);
    }

    #[test]
    fn garbage_payload_is_a_decode_error() {
        let err = decode_feed(b"\xff\xff\xff\xff not protobuf", "regional-rt").unwrap_err();
        assert!(matches!(err, NVTError::DecodeError { ref upstream, .. } if upstream == "regional-rt"));
    }
}
