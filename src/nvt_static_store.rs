// Static reference store: cached GTFS snapshot with single-flight reloads
use crate::nvt_config::{Config, Source};
use crate::nvt_error::{NVTError, Result};
use crate::nvt_gtfs;
use crate::nvt_models::StaticDataset;
use crate::nvt_single_flight::SingleFlight;
use crate::nvt_upstream::{first_success, Upstream};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Default)]
struct StoreState {
    current: Option<Arc<StaticDataset>>,
    last_failure: Option<(Instant, NVTError)>,
}

struct StoreInner<U> {
    upstream: Arc<U>,
    sources: Vec<Source>,
    ttl: Duration,
    retry_interval: Duration,
    reference_latitude: f64,
    state: RwLock<StoreState>,
}

impl<U: Upstream> StoreInner<U> {
    fn current(&self) -> Option<Arc<StaticDataset>> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .current
            .clone()
    }

    fn fresh(&self) -> Option<Arc<StaticDataset>> {
        self.current().filter(|ds| ds.age() < self.ttl)
    }

    /// A failure recorded less than `retry_interval` ago.
    fn recent_failure(&self) -> Option<NVTError> {
        let state = self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        state
            .last_failure
            .as_ref()
            .filter(|(at, _)| at.elapsed() < self.retry_interval)
            .map(|(_, e)| e.clone())
    }

    async fn reload(self: Arc<Self>) -> Result<Arc<StaticDataset>> {
        // A flight that finished just before this one started may already
        // have done the work.
        if let Some(ds) = self.fresh() {
            return Ok(ds);
        }

        log::info!("Reloading static dataset ({} sources)", self.sources.len());
        let reference_latitude = self.reference_latitude;
        let outcome = first_success(self.upstream.as_ref(), &self.sources, |source, body| {
            let origin = source.name.clone();
            async move {
                tokio::task::spawn_blocking(move || -> Result<StaticDataset> {
                    let dataset = nvt_gtfs::load_archive(&body, &origin)?
                        .with_reference_latitude(reference_latitude);
                    dataset.geometry_index();
                    Ok(dataset)
                })
                .await
                .unwrap_or_else(|e| {
                    Err(NVTError::Internal(format!("archive parsing task failed: {}", e)))
                })
            }
        })
        .await;

        let mut state = self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        match outcome {
            Ok((_, mut dataset)) => {
                // Age counts from publication, not from when parsing began.
                dataset.loaded_at = Instant::now();
                let dataset = Arc::new(dataset);
                state.current = Some(Arc::clone(&dataset));
                state.last_failure = None;
                Ok(dataset)
            }
            Err(failures) => {
                let err = NVTError::StaticDatasetUnavailable {
                    attempts: failures.iter().map(NVTError::attempt_summary).collect(),
                };
                log::error!("{}", err);
                state.last_failure = Some((Instant::now(), err.clone()));
                Err(err)
            }
        }
    }
}

/// Hands out the current [`StaticDataset`], reloading it when it is older
/// than the TTL. A failed reload never replaces a good snapshot.
pub struct StaticStore<U> {
    inner: Arc<StoreInner<U>>,
    flight: SingleFlight<Arc<StaticDataset>>,
}

impl<U: Upstream> StaticStore<U> {
    pub fn new(upstream: Arc<U>, config: &Config) -> Self {
        StaticStore {
            inner: Arc::new(StoreInner {
                upstream,
                sources: config
                    .static_sources
                    .iter()
                    .map(|s| s.clone().with_timeout(config.static_fetch_timeout))
                    .collect(),
                ttl: config.static_ttl,
                retry_interval: config.static_retry_interval,
                reference_latitude: config.reference_latitude,
                state: RwLock::new(StoreState::default()),
            }),
            flight: SingleFlight::new(),
        }
    }

    /// Last successfully loaded snapshot, whatever its age.
    pub fn current(&self) -> Option<Arc<StaticDataset>> {
        self.inner.current()
    }

    pub async fn get(&self) -> Result<Arc<StaticDataset>> {
        if let Some(ds) = self.inner.fresh() {
            return Ok(ds);
        }

        if let Some(err) = self.inner.recent_failure() {
            return match self.inner.current() {
                Some(stale) => {
                    log::debug!("Static reload backing off, serving snapshot from {}", stale.origin);
                    Ok(stale)
                }
                None => Err(err),
            };
        }

        let inner = Arc::clone(&self.inner);
        match self.flight.run(move || inner.reload()).await {
            Ok(ds) => Ok(ds),
            Err(err) => match self.inner.current() {
                Some(stale) => {
                    log::warn!(
                        "Keeping static dataset from {} loaded at {} ({})",
                        stale.origin,
                        stale.loaded_at_utc.format("%Y-%m-%d %H:%M:%S UTC"),
                        err
                    );
                    Ok(stale)
                }
                None => Err(err),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvt_gtfs::testing::sample_archive;
    use crate::nvt_upstream::testing::{sources, MemoryUpstream};

    fn config(retry: Duration) -> Config {
        Config {
            static_sources: sources(&["sweden3", "regional"]),
            static_ttl: Duration::from_secs(12 * 3600),
            static_retry_interval: retry,
            ..Config::default()
        }
    }

    fn store(upstream: &Arc<MemoryUpstream>, retry: Duration) -> StaticStore<MemoryUpstream> {
        StaticStore::new(Arc::clone(upstream), &config(retry))
    }

    #[tokio::test(start_paused = true)]
    async fn first_load_fails_when_every_source_fails() {
        let upstream = Arc::new(MemoryUpstream::default());
        upstream.fail("sweden3", 500);
        upstream.fail("regional", 404);

        let err = store(&upstream, Duration::ZERO).get().await.unwrap_err();
        match err {
            NVTError::StaticDatasetUnavailable { attempts } => {
                assert_eq!(attempts, vec!["sweden3: HTTP 500", "regional: HTTP 404"]);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn regional_archive_is_used_when_national_fails() {
        let upstream = Arc::new(MemoryUpstream::default());
        upstream.fail("sweden3", 503);
        upstream.serve("regional", sample_archive());

        let ds = store(&upstream, Duration::ZERO).get().await.unwrap();
        assert_eq!(ds.origin, "regional");
        assert_eq!(ds.route("R9").unwrap().short_name, "84");
    }

    #[tokio::test(start_paused = true)]
    async fn archive_missing_a_table_falls_through() {
        let upstream = Arc::new(MemoryUpstream::default());
        upstream.serve(
            "sweden3",
            crate::nvt_gtfs::testing::zip_files(&[("routes.txt", "route_id\nR1\n")]),
        );
        upstream.serve("regional", sample_archive());

        let ds = store(&upstream, Duration::ZERO).get().await.unwrap();
        assert_eq!(ds.origin, "regional");
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_dataset_is_served_from_cache() {
        let upstream = Arc::new(MemoryUpstream::default());
        upstream.serve("sweden3", sample_archive());
        let store = store(&upstream, Duration::ZERO);

        let first = store.get().await.unwrap();
        tokio::time::advance(Duration::from_secs(11 * 3600)).await;
        let second = store.get().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(upstream.total_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_keeps_previous_snapshot() {
        let upstream = Arc::new(MemoryUpstream::default());
        upstream.serve("sweden3", sample_archive());
        let store = store(&upstream, Duration::ZERO);
        let original = store.get().await.unwrap();

        upstream.fail("sweden3", 500);
        upstream.fail("regional", 500);
        tokio::time::advance(Duration::from_secs(13 * 3600)).await;

        let served = store.get().await.unwrap();
        assert!(Arc::ptr_eq(&original, &served));
        assert_eq!(upstream.calls("sweden3"), 2);
        assert_eq!(upstream.calls("regional"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_dataset_is_replaced_after_ttl() {
        let upstream = Arc::new(MemoryUpstream::default());
        upstream.serve("sweden3", sample_archive());
        let store = store(&upstream, Duration::ZERO);
        let original = store.get().await.unwrap();

        tokio::time::advance(Duration::from_secs(12 * 3600)).await;
        let reloaded = store.get().await.unwrap();

        assert!(!Arc::ptr_eq(&original, &reloaded));
        assert_eq!(upstream.calls("sweden3"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_stale_callers_trigger_one_reload() {
        let upstream = Arc::new(MemoryUpstream::with_delay(Duration::from_millis(200)));
        upstream.serve("sweden3", sample_archive());
        let store = Arc::new(store(&upstream, Duration::ZERO));

        let callers: Vec<_> = (0..6)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.get().await })
            })
            .collect();

        let mut loaded = Vec::new();
        for caller in callers {
            loaded.push(caller.await.unwrap().unwrap());
        }
        assert_eq!(upstream.calls("sweden3"), 1);
        assert!(loaded.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reload_backs_off_before_retrying() {
        let upstream = Arc::new(MemoryUpstream::default());
        upstream.fail("sweden3", 500);
        upstream.fail("regional", 500);
        let store = store(&upstream, Duration::from_secs(60));

        assert!(store.get().await.is_err());
        assert!(matches!(
            store.get().await,
            Err(NVTError::StaticDatasetUnavailable { .. })
        ));
        assert_eq!(upstream.calls("sweden3"), 1);

        upstream.serve("sweden3", sample_archive());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(store.get().await.is_ok());
        assert_eq!(upstream.calls("sweden3"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn archive_downloads_use_static_timeout() {
        let upstream = Arc::new(MemoryUpstream::default());
        let config = Config {
            fetch_timeout: Duration::from_secs(10),
            static_fetch_timeout: Duration::from_secs(90),
            ..config(Duration::ZERO)
        };
        let store = StaticStore::new(upstream, &config);

        let names: Vec<_> = store.inner.sources.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["sweden3", "regional"]);
        assert!(store
            .inner
            .sources
            .iter()
            .all(|s| s.timeout == Some(Duration::from_secs(90))));
    }

    #[tokio::test(start_paused = true)]
    async fn loaded_dataset_projects_at_configured_latitude() {
        let upstream = Arc::new(MemoryUpstream::default());
        upstream.serve("sweden3", sample_archive());
        let config = Config {
            reference_latitude: 45.0,
            ..config(Duration::ZERO)
        };

        let ds = StaticStore::new(upstream, &config).get().await.unwrap();
        assert_eq!(ds.reference_latitude(), 45.0);
        assert_eq!(
            ds.geometry_index().frame(),
            crate::nvt_geometry::PlanarFrame::new(45.0)
        );
    }
}
