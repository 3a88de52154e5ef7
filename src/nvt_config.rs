// Configuration for the NVT live vehicle service
//
// Upstream endpoints (Trafiklab / Samtrafiken open data):
// - GTFS Sweden 3 static:  https://opendata.samtrafiken.se/gtfs-sweden/sweden.zip
// - GTFS Regional static:  https://opendata.samtrafiken.se/gtfs/{operator}/{operator}.zip
// - GTFS-RT Sweden 3:      https://opendata.samtrafiken.se/gtfs-rt-sweden/{operator}/VehiclePositionsSweden.pb
// - GTFS-RT Regional:      https://opendata.samtrafiken.se/gtfs-rt/{operator}/VehiclePositions.pb
use crate::nvt_error::{NVTError, Result};
use clap::Args;
use std::collections::BTreeSet;
use std::time::Duration;

/// A named upstream endpoint. Sources are always tried in list order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub name: String,
    pub url: String,
    /// Overrides the client-wide fetch timeout for this source.
    pub timeout: Option<Duration>,
}

impl Source {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Source {
            name: name.into(),
            url: url.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl std::str::FromStr for Source {
    type Err = String;

    /// Parses `name=url`; a bare URL gets its host as the name.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if let Some((name, url)) = s.split_once('=') {
            if !name.is_empty() && !name.contains('/') && !url.is_empty() {
                return Ok(Source::new(name.trim(), url.trim()));
            }
        }
        let url = s.trim();
        if url.is_empty() {
            return Err("empty source".to_string());
        }
        let host = url
            .split("://")
            .nth(1)
            .and_then(|rest| rest.split('/').next())
            .unwrap_or(url);
        Ok(Source::new(host, url))
    }
}

/// What `poll()` does when the only usable feed payload fails to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum DecodeFailurePolicy {
    /// Surface the decode error to the caller.
    Fail,
    /// Hand back the previous resolution snapshot, if there is one.
    ServeStale,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Route short names this service reports on.
    pub monitored_lines: BTreeSet<String>,
    pub static_ttl: Duration,
    pub static_retry_interval: Duration,
    pub cache_ttl: Duration,
    pub snap_threshold_meters: f64,
    /// Real-time feed fetches.
    pub fetch_timeout: Duration,
    /// Static archive downloads; the national archive is large.
    pub static_fetch_timeout: Duration,
    /// Latitude used for the longitude scale of the planar projection.
    pub reference_latitude: f64,
    pub static_sources: Vec<Source>,
    pub realtime_sources: Vec<Source>,
    pub decode_failure_policy: DecodeFailurePolicy,
}

impl Config {
    pub const STATIC_TTL_SECS: u64 = 12 * 60 * 60;
    pub const STATIC_RETRY_SECS: u64 = 60;
    pub const CACHE_TTL_SECS: u64 = 7;
    pub const SNAP_THRESHOLD_METERS: f64 = 80.0;
    pub const FETCH_TIMEOUT_SECS: u64 = 10;
    pub const STATIC_FETCH_TIMEOUT_SECS: u64 = 60;
    /// Sundsvall.
    pub const REFERENCE_LATITUDE: f64 = 62.39;
    pub const DEFAULT_OPERATOR: &'static str = "dintur";
    pub const DEFAULT_LINES: &'static [&'static str] = &[
        "1", "2", "3", "4", "5", "6", "7", "8", "9", "10", "11", "12", "14", "15",
    ];

    /// National archive first, regional archive as fallback.
    pub fn default_static_sources(operator: &str, api_key: &str) -> Vec<Source> {
        vec![
            Source::new(
                "sweden3",
                format!("https://opendata.samtrafiken.se/gtfs-sweden/sweden.zip?key={}", api_key),
            ),
            Source::new(
                "regional",
                format!(
                    "https://opendata.samtrafiken.se/gtfs/{op}/{op}.zip?key={key}",
                    op = operator,
                    key = api_key
                ),
            ),
        ]
    }

    pub fn default_realtime_sources(operator: &str, api_key: &str) -> Vec<Source> {
        vec![
            Source::new(
                "sweden3-rt",
                format!(
                    "https://opendata.samtrafiken.se/gtfs-rt-sweden/{}/VehiclePositionsSweden.pb?key={}",
                    operator, api_key
                ),
            ),
            Source::new(
                "regional-rt",
                format!(
                    "https://opendata.samtrafiken.se/gtfs-rt/{}/VehiclePositions.pb?key={}",
                    operator, api_key
                ),
            ),
        ]
    }

    pub fn is_monitored(&self, short_name: &str) -> bool {
        self.monitored_lines.contains(short_name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.monitored_lines.is_empty() {
            return Err(NVTError::Config("monitored line set is empty".to_string()));
        }
        if self.static_sources.is_empty() {
            return Err(NVTError::Config("no static dataset sources configured".to_string()));
        }
        if self.realtime_sources.is_empty() {
            return Err(NVTError::Config("no real-time feed sources configured".to_string()));
        }
        if !(self.snap_threshold_meters.is_finite() && self.snap_threshold_meters > 0.0) {
            return Err(NVTError::Config(format!(
                "snap threshold must be positive, got {}",
                self.snap_threshold_meters
            )));
        }
        if self.fetch_timeout.is_zero() || self.static_fetch_timeout.is_zero() {
            return Err(NVTError::Config("fetch timeouts must be positive".to_string()));
        }
        if !(-89.0..=89.0).contains(&self.reference_latitude) {
            return Err(NVTError::Config(format!(
                "reference latitude out of range: {}",
                self.reference_latitude
            )));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            monitored_lines: Self::DEFAULT_LINES.iter().map(|l| l.to_string()).collect(),
            static_ttl: Duration::from_secs(Self::STATIC_TTL_SECS),
            static_retry_interval: Duration::from_secs(Self::STATIC_RETRY_SECS),
            cache_ttl: Duration::from_secs(Self::CACHE_TTL_SECS),
            snap_threshold_meters: Self::SNAP_THRESHOLD_METERS,
            fetch_timeout: Duration::from_secs(Self::FETCH_TIMEOUT_SECS),
            static_fetch_timeout: Duration::from_secs(Self::STATIC_FETCH_TIMEOUT_SECS),
            reference_latitude: Self::REFERENCE_LATITUDE,
            static_sources: Self::default_static_sources(Self::DEFAULT_OPERATOR, ""),
            realtime_sources: Self::default_realtime_sources(Self::DEFAULT_OPERATOR, ""),
            decode_failure_policy: DecodeFailurePolicy::ServeStale,
        }
    }
}

/// Command-line / environment surface for [`Config`].
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Trafiklab API key used in the default source URLs
    #[arg(long, env = "NVT_API_KEY", default_value = "", hide_env_values = true)]
    pub api_key: String,

    /// Operator code for the regional feeds
    #[arg(long, env = "NVT_OPERATOR", default_value = Config::DEFAULT_OPERATOR)]
    pub operator: String,

    /// Comma separated route short names to report on
    #[arg(long, env = "NVT_MONITORED_LINES", value_delimiter = ',')]
    pub lines: Vec<String>,

    /// Static dataset source as name=url, repeat in priority order
    #[arg(long = "static-url", env = "NVT_STATIC_URLS", value_delimiter = ' ')]
    pub static_urls: Vec<Source>,

    /// Real-time feed source as name=url, repeat in priority order
    #[arg(long = "realtime-url", env = "NVT_REALTIME_URLS", value_delimiter = ' ')]
    pub realtime_urls: Vec<Source>,

    /// Static dataset time-to-live in seconds
    #[arg(long, env = "NVT_STATIC_TTL", default_value_t = Config::STATIC_TTL_SECS)]
    pub static_ttl: u64,

    /// Minimum seconds between failed static reload attempts
    #[arg(long, env = "NVT_STATIC_RETRY", default_value_t = Config::STATIC_RETRY_SECS)]
    pub static_retry: u64,

    /// Resolution cache time-to-live in seconds
    #[arg(long, env = "NVT_CACHE_TTL", default_value_t = Config::CACHE_TTL_SECS)]
    pub cache_ttl: u64,

    /// Maximum snapping distance in meters
    #[arg(long, env = "NVT_SNAP_THRESHOLD", default_value_t = Config::SNAP_THRESHOLD_METERS)]
    pub snap_threshold: f64,

    /// Real-time feed fetch timeout in seconds
    #[arg(long, env = "NVT_FETCH_TIMEOUT", default_value_t = Config::FETCH_TIMEOUT_SECS)]
    pub fetch_timeout: u64,

    /// Static archive download timeout in seconds
    #[arg(long, env = "NVT_STATIC_FETCH_TIMEOUT", default_value_t = Config::STATIC_FETCH_TIMEOUT_SECS)]
    pub static_fetch_timeout: u64,

    /// Latitude for the planar projection's longitude scale
    #[arg(long, env = "NVT_REFERENCE_LATITUDE", default_value_t = Config::REFERENCE_LATITUDE)]
    pub reference_latitude: f64,

    /// Behaviour when the live feed cannot be decoded
    #[arg(long, env = "NVT_ON_DECODE_ERROR", value_enum, default_value_t = DecodeFailurePolicy::ServeStale)]
    pub on_decode_error: DecodeFailurePolicy,
}

impl ConfigArgs {
    pub fn into_config(self) -> Result<Config> {
        let defaults = Config::default();

        let monitored_lines: BTreeSet<String> = if self.lines.is_empty() {
            defaults.monitored_lines
        } else {
            self.lines
                .iter()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .collect()
        };

        let static_sources = if self.static_urls.is_empty() {
            Config::default_static_sources(&self.operator, &self.api_key)
        } else {
            self.static_urls
        };
        let realtime_sources = if self.realtime_urls.is_empty() {
            Config::default_realtime_sources(&self.operator, &self.api_key)
        } else {
            self.realtime_urls
        };

        let config = Config {
            monitored_lines,
            static_ttl: Duration::from_secs(self.static_ttl),
            static_retry_interval: Duration::from_secs(self.static_retry),
            cache_ttl: Duration::from_secs(self.cache_ttl),
            snap_threshold_meters: self.snap_threshold,
            fetch_timeout: Duration::from_secs(self.fetch_timeout),
            static_fetch_timeout: Duration::from_secs(self.static_fetch_timeout),
            reference_latitude: self.reference_latitude,
            static_sources,
            realtime_sources,
            decode_failure_policy: self.on_decode_error,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        config: ConfigArgs,
    }

    #[test]
    fn source_parses_named_and_bare_urls() {
        let named: Source = "primary=https://example.org/feed.pb".parse().unwrap();
        assert_eq!(named, Source::new("primary", "https://example.org/feed.pb"));

        let bare: Source = "https://example.org/feed.pb?key=abc".parse().unwrap();
        assert_eq!(bare.name, "example.org");
        assert_eq!(bare.url, "https://example.org/feed.pb?key=abc");
    }

    #[test]
    fn defaults_try_national_before_regional() {
        let config = Config::default();
        assert_eq!(config.static_sources[0].name, "sweden3");
        assert_eq!(config.static_sources[1].name, "regional");
        assert_eq!(config.realtime_sources[0].name, "sweden3-rt");
        assert_eq!(config.cache_ttl, Duration::from_secs(7));
        assert_eq!(config.static_ttl, Duration::from_secs(43_200));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn static_downloads_get_their_own_timeout() {
        let config = Config::default();
        assert_eq!(config.fetch_timeout, Duration::from_secs(10));
        assert_eq!(config.static_fetch_timeout, Duration::from_secs(60));

        let cli = TestCli::try_parse_from(["nvt", "--static-fetch-timeout", "120"]).unwrap();
        let config = cli.config.into_config().unwrap();
        assert_eq!(config.static_fetch_timeout, Duration::from_secs(120));
        assert_eq!(config.fetch_timeout, Duration::from_secs(10));

        let zero = Config {
            static_fetch_timeout: Duration::ZERO,
            ..Config::default()
        };
        assert!(matches!(zero.validate(), Err(NVTError::Config(_))));
    }

    #[test]
    fn args_override_lines_and_sources_in_order() {
        let cli = TestCli::try_parse_from([
            "nvt",
            "--lines",
            "2,84",
            "--realtime-url",
            "b=https://b.example/rt.pb",
            "--realtime-url",
            "a=https://a.example/rt.pb",
            "--snap-threshold",
            "50",
        ])
        .unwrap();
        let config = cli.config.into_config().unwrap();

        assert!(config.is_monitored("84"));
        assert!(!config.is_monitored("1"));
        assert_eq!(config.realtime_sources[0].name, "b");
        assert_eq!(config.realtime_sources[1].name, "a");
        assert_eq!(config.snap_threshold_meters, 50.0);
    }

    #[test]
    fn operator_and_key_flow_into_default_urls() {
        let cli = TestCli::try_parse_from(["nvt", "--operator", "ul", "--api-key", "k1"]).unwrap();
        let config = cli.config.into_config().unwrap();
        assert_eq!(
            config.static_sources[1].url,
            "https://opendata.samtrafiken.se/gtfs/ul/ul.zip?key=k1"
        );
    }

    #[test]
    fn validate_rejects_bad_threshold() {
        let config = Config {
            snap_threshold_meters: 0.0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(NVTError::Config(_))));
    }
}
