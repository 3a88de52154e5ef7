// Feed ingestion and route resolution
//
// poll() -> cached list of vehicles on monitored lines. The upstream feed is
// hit at most once per cache TTL, however often poll() is called.
use crate::nvt_config::{Config, DecodeFailurePolicy, Source};
use crate::nvt_error::{NVTError, Result};
use crate::nvt_feed::{self, DecodedFeed};
use crate::nvt_models::{ResolutionCache, ResolvedVehicle, StaticDataset, VehicleFix};
use crate::nvt_single_flight::SingleFlight;
use crate::nvt_static_store::StaticStore;
use crate::nvt_upstream::{first_success, Upstream};
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;

/// Resolves a fix to its route. The route id embedded in the feed wins over
/// the trip binding; the id is then mapped to its public short name.
pub fn resolve(fix: &VehicleFix, dataset: Option<&StaticDataset>) -> ResolvedVehicle {
    let route_id = fix.route_id_raw.clone().or_else(|| {
        let trip_id = fix.trip_id.as_deref()?;
        dataset?.route_for_trip(trip_id).map(str::to_string)
    });

    let route = match (&route_id, dataset) {
        (Some(id), Some(ds)) => ds.line_label(id).to_string(),
        (Some(id), None) => id.clone(),
        (None, _) => ResolvedVehicle::UNKNOWN_ROUTE.to_string(),
    };

    ResolvedVehicle {
        fix: fix.clone(),
        route_id,
        route,
    }
}

/// Resolves, filters to the monitored lines and drops repeated ids (first
/// occurrence kept).
pub fn resolve_all(
    fixes: &[VehicleFix],
    dataset: Option<&StaticDataset>,
    monitored: &BTreeSet<String>,
) -> Vec<ResolvedVehicle> {
    let mut seen = HashSet::with_capacity(fixes.len());
    fixes
        .iter()
        .map(|fix| resolve(fix, dataset))
        .filter(|v| v.route != ResolvedVehicle::UNKNOWN_ROUTE && monitored.contains(&v.route))
        .filter(|v| seen.insert(v.fix.id.clone()))
        .collect()
}

#[derive(Default)]
struct PipelineState {
    cache: Option<Arc<ResolutionCache>>,
    /// Last failed refresh; polls inside the cache TTL replay it.
    last_failure: Option<(Instant, NVTError)>,
}

struct PipelineInner<U> {
    upstream: Arc<U>,
    statics: Arc<StaticStore<U>>,
    sources: Vec<Source>,
    cache_ttl: Duration,
    monitored: BTreeSet<String>,
    decode_failure_policy: DecodeFailurePolicy,
    state: RwLock<PipelineState>,
}

impl<U: Upstream> PipelineInner<U> {
    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, PipelineState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, PipelineState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cached(&self) -> Option<Arc<ResolutionCache>> {
        self.read_state().cache.clone()
    }

    fn fresh(&self) -> Option<Arc<ResolutionCache>> {
        self.cached().filter(|c| c.age() < self.cache_ttl)
    }

    fn recent_failure(&self) -> Option<NVTError> {
        match &self.read_state().last_failure {
            Some((at, e)) if at.elapsed() < self.cache_ttl => Some(e.clone()),
            _ => None,
        }
    }

    /// Outcome of a poll that has no new feed: the previous snapshot when the
    /// decode policy allows it, the error otherwise.
    fn on_failure(&self, e: NVTError) -> Result<Arc<ResolutionCache>> {
        if !matches!(e, NVTError::DecodeError { .. }) {
            return Err(e);
        }
        match (self.decode_failure_policy, self.cached()) {
            (DecodeFailurePolicy::ServeStale, Some(previous)) => {
                log::warn!(
                    "{}; serving vehicles fetched {}s ago",
                    e,
                    previous.age().as_secs()
                );
                Ok(previous)
            }
            _ => Err(e),
        }
    }

    async fn fetch_feed(&self) -> Result<(String, DecodedFeed)> {
        let outcome = first_success(self.upstream.as_ref(), &self.sources, |source, body| {
            std::future::ready(nvt_feed::decode_feed(&body, &source.name))
        })
        .await;

        outcome.map_err(|failures| {
            let decode_error = failures
                .iter()
                .rev()
                .find(|e| matches!(e, NVTError::DecodeError { .. }));
            match decode_error {
                Some(e) => e.clone(),
                None => NVTError::FeedUnavailable {
                    attempts: failures.iter().map(NVTError::attempt_summary).collect(),
                },
            }
        })
    }

    async fn refresh(self: Arc<Self>) -> Result<Arc<ResolutionCache>> {
        if let Some(cache) = self.fresh() {
            return Ok(cache);
        }
        if let Some(e) = self.recent_failure() {
            return self.on_failure(e);
        }

        let dataset = match self.statics.get().await {
            Ok(ds) => Some(ds),
            Err(e) => {
                log::warn!("Resolving without static data: {}", e);
                None
            }
        };

        let (origin, feed) = match self.fetch_feed().await {
            Ok(fetched) => fetched,
            Err(e) => {
                self.write_state().last_failure = Some((Instant::now(), e.clone()));
                return self.on_failure(e);
            }
        };

        let vehicles = resolve_all(&feed.fixes, dataset.as_deref(), &self.monitored);
        log::debug!(
            "Feed from {}: {} positions, {} on monitored lines",
            origin,
            feed.fixes.len(),
            vehicles.len()
        );

        let cache = Arc::new(ResolutionCache::new(vehicles, origin));
        let mut state = self.write_state();
        state.cache = Some(Arc::clone(&cache));
        state.last_failure = None;
        Ok(cache)
    }
}

pub struct VehiclePipeline<U> {
    inner: Arc<PipelineInner<U>>,
    flight: SingleFlight<Arc<ResolutionCache>>,
}

impl<U: Upstream> VehiclePipeline<U> {
    pub fn new(upstream: Arc<U>, statics: Arc<StaticStore<U>>, config: &Config) -> Self {
        VehiclePipeline {
            inner: Arc::new(PipelineInner {
                upstream,
                statics,
                sources: config.realtime_sources.clone(),
                cache_ttl: config.cache_ttl,
                monitored: config.monitored_lines.clone(),
                decode_failure_policy: config.decode_failure_policy,
                state: RwLock::new(PipelineState::default()),
            }),
            flight: SingleFlight::new(),
        }
    }

    pub fn statics(&self) -> &Arc<StaticStore<U>> {
        &self.inner.statics
    }

    /// Last resolution snapshot, whatever its age.
    pub fn cached(&self) -> Option<Arc<ResolutionCache>> {
        self.inner.cached()
    }

    pub async fn poll_snapshot(&self) -> Result<Arc<ResolutionCache>> {
        if let Some(cache) = self.inner.fresh() {
            log::debug!("Serving {} cached vehicles", cache.vehicles.len());
            return Ok(cache);
        }
        if let Some(e) = self.inner.recent_failure() {
            log::debug!("Feed failed under {}s ago, not refetching", self.inner.cache_ttl.as_secs());
            return self.inner.on_failure(e);
        }
        let inner = Arc::clone(&self.inner);
        self.flight.run(move || inner.refresh()).await
    }

    pub async fn poll(&self) -> Result<Arc<Vec<ResolvedVehicle>>> {
        Ok(Arc::clone(&self.poll_snapshot().await?.vehicles))
    }
}
