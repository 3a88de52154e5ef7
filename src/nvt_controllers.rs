// Controllers for the NVT live vehicle tracker
use crate::nvt_config::Config;
use crate::nvt_error::Result;
use crate::nvt_models::{SnappedVehicle, StaticDataset};
use crate::nvt_pipeline::VehiclePipeline;
use crate::nvt_snapping;
use crate::nvt_static_store::StaticStore;
use crate::nvt_upstream::Upstream;
use crate::nvt_views::NVTViews;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Wires the static store, the feed pipeline and the snapping engine
/// together behind one call.
pub struct Tracker<U> {
    config: Config,
    statics: Arc<StaticStore<U>>,
    pipeline: VehiclePipeline<U>,
}

impl<U: Upstream> Tracker<U> {
    pub fn new(config: Config, upstream: Arc<U>) -> Self {
        let statics = Arc::new(StaticStore::new(Arc::clone(&upstream), &config));
        let pipeline = VehiclePipeline::new(upstream, Arc::clone(&statics), &config);
        Tracker {
            config,
            statics,
            pipeline,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pipeline(&self) -> &VehiclePipeline<U> {
        &self.pipeline
    }

    /// Static data for display; the last good snapshot is fine here.
    pub async fn dataset(&self) -> Option<Arc<StaticDataset>> {
        match self.statics.get().await {
            Ok(ds) => Some(ds),
            Err(e) => {
                log::debug!("No static dataset for display: {}", e);
                None
            }
        }
    }

    /// Polls the feed and snaps every vehicle onto its nearest route. Without
    /// static data, vehicles come back unsnapped.
    pub async fn snapshot(&self) -> Result<Vec<SnappedVehicle>> {
        let vehicles = self.pipeline.poll().await?;
        let dataset = self.dataset().await;
        let index = dataset.as_deref().map(StaticDataset::geometry_index);
        Ok(nvt_snapping::snap_all(
            &vehicles,
            index,
            self.config.snap_threshold_meters,
        ))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchStats {
    pub updates: u32,
    pub failed: u32,
}

pub struct NVTControllers;

impl NVTControllers {
    /// Live display loop. Poll errors are reported and the loop carries on;
    /// `max_updates` of `None` runs until the process is stopped.
    pub async fn watch<U: Upstream>(
        tracker: &Tracker<U>,
        interval: Duration,
        max_updates: Option<u32>,
    ) -> WatchStats {
        NVTViews::show_welcome_screen(tracker.config());
        println!("\n🔄 Loading Sundsvall route data...");
        println!("   Please wait, the first load may take a moment...");

        let mut stats = WatchStats::default();
        loop {
            stats.updates += 1;

            match tracker.snapshot().await {
                Ok(vehicles) => {
                    let dataset = tracker.dataset().await;
                    NVTViews::clear_screen();
                    NVTViews::show_update_header(stats.updates, vehicles.len(), dataset.as_deref());
                    NVTViews::show_vehicles(&vehicles, dataset.as_deref());
                }
                Err(e) => {
                    stats.failed += 1;
                    log::error!("Update #{} failed: {}", stats.updates, e);
                    NVTViews::network_error(&e.to_string());
                    println!("   Will retry next cycle...");
                }
            }

            if max_updates.is_some_and(|max| stats.updates >= max) {
                return stats;
            }
            NVTViews::show_next_update(interval.as_secs());
            tokio::time::sleep(interval).await;
        }
    }

    /// One snapshot as JSON, for scripting.
    pub async fn once_json<U: Upstream>(tracker: &Tracker<U>) -> Result<serde_json::Value> {
        let vehicles = tracker.snapshot().await?;
        let feed = tracker.pipeline().cached();
        Ok(json!({
            "generated_at": Utc::now().to_rfc3339(),
            "feed_origin": feed.as_ref().map(|c| c.origin.clone()),
            "feed_fetched_at": feed.as_ref().map(|c| c.fetched_at_utc.to_rfc3339()),
            "vehicles": vehicles,
        }))
    }

    pub async fn routes_json<U: Upstream>(tracker: &Tracker<U>) -> Result<serde_json::Value> {
        let dataset = tracker.statics.get().await?;
        Ok(NVTViews::routes_json(&dataset))
    }

    pub async fn shapes_geojson<U: Upstream>(tracker: &Tracker<U>) -> Result<geojson::FeatureCollection> {
        let dataset = tracker.statics.get().await?;
        Ok(NVTViews::shapes_geojson(&dataset))
    }
}
