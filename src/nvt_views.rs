// Views for the NVT live vehicle tracker
use crate::nvt_config::Config;
use crate::nvt_models::{RgbHex, SnappedVehicle, StaticDataset};
use chrono::{TimeZone, Utc};
use chrono_tz::Europe::Stockholm;
use geojson::{Feature, FeatureCollection, Geometry, JsonObject, Value};
use serde_json::json;
use std::collections::BTreeMap;
use std::io::{self, Write};

pub struct NVTViews;

impl NVTViews {
    pub fn show_welcome_screen(config: &Config) {
        println!("\n{}", "═".repeat(70));
        println!("  ╔═══════════════════════════════════════════════════════════╗");
        println!("  ║            🚌 NVT LIVE - SUNDSVALL VEHICLE MAP            ║");
        println!("  ║                 Real-Time Position Tracker                ║");
        println!("  ╚═══════════════════════════════════════════════════════════╝");
        println!("{}", "═".repeat(70));
        println!(
            "\n  🚏 Monitored lines: {}",
            config.monitored_lines.iter().cloned().collect::<Vec<_>>().join(", ")
        );
        println!(
            "  📡 Feed sources: {}",
            config
                .realtime_sources
                .iter()
                .map(|s| s.name.as_str())
                .collect::<Vec<_>>()
                .join(" → ")
        );
        println!("  🧲 Snapping within {:.0} m of a route", config.snap_threshold_meters);
        println!("\n  🌐 Data source: Trafiklab / Samtrafiken open data");
        println!("     https://www.trafiklab.se/");
        println!("\n{}", "═".repeat(70));
    }

    pub fn show_update_header(update: u32, vehicle_count: usize, dataset: Option<&StaticDataset>) {
        let now = Utc::now().with_timezone(&Stockholm);

        println!("\n{}", "═".repeat(70));
        println!("🔄 LIVE VEHICLES - Update #{}", update);
        println!("📅 {}", now.format("%A, %B %d, %Y at %H:%M:%S %Z"));
        match dataset {
            Some(ds) => println!(
                "📊 {} vehicles tracked | 🗺️  {} routes, {} shapes (from {})",
                vehicle_count,
                ds.routes.len(),
                ds.polyline_count(),
                ds.origin
            ),
            None => println!(
                "📊 {} vehicles tracked | ⚠️  route data unavailable, positions are raw GPS",
                vehicle_count
            ),
        }
        println!("{}", "═".repeat(70));
    }

    pub fn show_vehicles(vehicles: &[SnappedVehicle], dataset: Option<&StaticDataset>) {
        println!("{}", Self::render_vehicles(vehicles, dataset));
    }

    /// The vehicle table, grouped by line.
    pub fn render_vehicles(vehicles: &[SnappedVehicle], dataset: Option<&StaticDataset>) -> String {
        if vehicles.is_empty() {
            return format!(
                "\n⚠️  No vehicles on the monitored lines right now\n\n📋 Possible reasons:\n  \
                 • Service may not be operating at this time\n  \
                 • Vehicles have not reported a position yet\n{}",
                "─".repeat(70)
            );
        }

        let mut by_line: BTreeMap<(u32, &str), Vec<&SnappedVehicle>> = BTreeMap::new();
        for vehicle in vehicles {
            by_line.entry(line_order(&vehicle.route)).or_default().push(vehicle);
        }

        let mut out = Vec::new();
        for ((_, route), mut group) in by_line {
            group.sort_by(|a, b| a.id.cmp(&b.id));
            let color = route_color(group[0].route_id.as_deref(), dataset);
            let long_name = group[0]
                .route_id
                .as_deref()
                .and_then(|id| dataset?.route(id))
                .map(|r| r.long_name.as_str())
                .unwrap_or("");

            out.push(format!(
                "\n  {} {} ({} vehicle{})",
                Self::colorize_line(route, color),
                long_name,
                group.len(),
                if group.len() == 1 { "" } else { "s" }
            ));
            for vehicle in group {
                out.push(Self::render_vehicle_row(vehicle));
            }
        }
        out.push("─".repeat(70));
        out.join("\n")
    }

    fn render_vehicle_row(vehicle: &SnappedVehicle) -> String {
        let position = match (vehicle.snapped, vehicle.snap_distance_meters) {
            (true, Some(d)) => format!(
                "🧲 ({:.5}, {:.5}) on line {} ({:.1} m)",
                vehicle.lat,
                vehicle.lon,
                vehicle.snapped_to_line.as_deref().unwrap_or("?"),
                d
            ),
            _ => format!("📡 ({:.5}, {:.5}) raw GPS", vehicle.lat, vehicle.lon),
        };
        let speed = match vehicle.speed_mps {
            Some(mps) => format!("{:>3.0} km/h", mps * 3.6),
            None => "  - km/h".to_string(),
        };
        let seen = vehicle
            .timestamp
            .map(Self::format_timestamp)
            .unwrap_or_else(|| "--:--:--".to_string());

        format!(
            "     🚌 {:<16} {}  {} {:<2}  ⏰ {}",
            vehicle.id,
            position,
            speed,
            compass_point(vehicle.bearing),
            seen
        )
    }

    /// Route list for the `routes` command.
    pub fn routes_json(dataset: &StaticDataset) -> serde_json::Value {
        let routes: Vec<serde_json::Value> = dataset
            .routes
            .iter()
            .map(|r| {
                json!({
                    "route_id": r.route_id,
                    "short_name": r.short_name,
                    "long_name": r.long_name,
                    "color": r.color.to_string(),
                    "text_color": r.text_color.to_string(),
                })
            })
            .collect();
        serde_json::Value::Array(routes)
    }

    /// One MultiLineString feature per route that has geometry, coordinates
    /// as `[lon, lat]`.
    pub fn shapes_geojson(dataset: &StaticDataset) -> FeatureCollection {
        let features = dataset
            .routes
            .iter()
            .filter_map(|route| {
                let lines = dataset.geometry.get(&route.route_id)?;
                let coordinates: Vec<Vec<Vec<f64>>> = lines
                    .iter()
                    .map(|line| line.points().map(|(lat, lon)| vec![lon, lat]).collect())
                    .collect();

                let mut properties = JsonObject::new();
                properties.insert("route_id".to_string(), json!(route.route_id));
                properties.insert("short_name".to_string(), json!(route.short_name));
                properties.insert("long_name".to_string(), json!(route.long_name));
                properties.insert("color".to_string(), json!(route.color.to_string()));
                properties.insert("text_color".to_string(), json!(route.text_color.to_string()));

                Some(Feature {
                    bbox: None,
                    geometry: Some(Geometry::new(Value::MultiLineString(coordinates))),
                    id: None,
                    properties: Some(properties),
                    foreign_members: None,
                })
            })
            .collect();

        FeatureCollection {
            bbox: None,
            features,
            foreign_members: None,
        }
    }

    pub fn network_error(error: &str) {
        eprintln!("\n{}", "═".repeat(60));
        eprintln!("❌ NETWORK ERROR");
        eprintln!("{}", "═".repeat(60));
        eprintln!("\n{}", error);
        eprintln!("\n💡 Troubleshooting:");
        eprintln!("  • Check your internet connection");
        eprintln!("  • Check that NVT_API_KEY holds a valid Trafiklab key");
        eprintln!("  • The Samtrafiken open data API might be temporarily unavailable");
        eprintln!("  • Visit https://www.trafiklab.se/ for service status");
        eprintln!("\n{}", "═".repeat(60));
    }

    pub fn show_next_update(seconds: u64) {
        println!("\n⏱️  Next update in {} seconds (Ctrl+C to exit)", seconds);
    }

    pub fn clear_screen() {
        print!("\x1B[2J\x1B[1;1H");
        let _ = io::stdout().flush();
    }

    /// Line code on its route colour, with black or white text for contrast.
    pub fn colorize_line(code: &str, color: RgbHex) -> String {
        let text_color = if color.luminance() > 0.5 { "30" } else { "97" };
        format!(
            "\x1b[48;2;{};{};{}m\x1b[{}m {} \x1b[0m",
            color.r, color.g, color.b, text_color, code
        )
    }

    /// HH:MM:SS in Sundsvall local time.
    pub fn format_timestamp(timestamp: i64) -> String {
        match Utc.timestamp_opt(timestamp, 0).single() {
            Some(dt) => dt.with_timezone(&Stockholm).format("%H:%M:%S").to_string(),
            None => "??:??:??".to_string(),
        }
    }
}

fn route_color(route_id: Option<&str>, dataset: Option<&StaticDataset>) -> RgbHex {
    route_id
        .and_then(|id| dataset?.route(id))
        .map(|r| r.color)
        .unwrap_or(RgbHex::DEFAULT_LINE)
}

/// Numeric lines first, in numeric order.
fn line_order(route: &str) -> (u32, &str) {
    (route.parse().unwrap_or(u32::MAX), route)
}

fn compass_point(bearing: f64) -> &'static str {
    const POINTS: [&str; 8] = ["N", "NE", "E", "SE", "S", "SW", "W", "NW"];
    let sector = ((bearing.rem_euclid(360.0) + 22.5) / 45.0) as usize % 8;
    POINTS[sector]
}
