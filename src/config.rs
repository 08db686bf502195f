use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;

use crate::aggregation::AggregationInterval;
use crate::dimension::{AcademicTerm, Calendar, DEFAULT_MAX_EXTENSION_DAYS};
use crate::lock::{LockConfig, ServerIdentity};

/// Top-level configuration for an eventagg node.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Owner name for every lock this node takes. Generated when empty.
    #[serde(default)]
    pub server_id: String,

    /// Backing store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Cluster mutex configuration.
    #[serde(default)]
    pub lock: LockSettings,

    /// Aggregation run configuration.
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// Date/time dimension population.
    #[serde(default)]
    pub dimensions: DimensionsConfig,

    /// Raw event and session retention.
    #[serde(default)]
    pub purge: PurgeConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Which store implementation backs the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Shared SQLite database file. Required for more than one node.
    #[default]
    Sqlite,
    /// Process-local state, lost on exit.
    Memory,
}

/// Backing store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Database file shared by all nodes. Default: "eventagg.db".
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// How long a statement waits on a locked database. Default: 5s.
    #[serde(default = "default_busy_timeout", with = "humantime_serde")]
    pub busy_timeout: Duration,

    /// Apply pending migrations on open. Default: true.
    #[serde(default = "default_true")]
    pub auto_migrate: bool,
}

/// Cluster mutex configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LockSettings {
    /// Mutex lease length. Default: 5m.
    #[serde(default = "default_lock_ttl", with = "humantime_serde")]
    pub ttl: Duration,

    /// Extend held mutexes this often while work runs. Disabled when unset.
    #[serde(default, with = "humantime_serde")]
    pub renew_interval: Option<Duration>,
}

/// Aggregation run configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    /// Time between aggregation runs. Default: 1m.
    #[serde(default = "default_aggregation_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Bucket granularities to maintain. Default: [hour, day, month].
    #[serde(default = "default_intervals")]
    pub intervals: Vec<AggregationInterval>,

    /// Group names aggregated individually, in addition to all users.
    #[serde(default)]
    pub groups: Vec<String>,

    /// Raw events read per batch. Default: 1000.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Upper bound on batches per run. Default: 100.
    #[serde(default = "default_max_batches_per_run")]
    pub max_batches_per_run: usize,

    /// Wall-clock budget per run; no new batch starts after it. Default: 1m.
    #[serde(default = "default_run_budget", with = "humantime_serde")]
    pub run_budget: Duration,

    /// How long after its end a bucket stays open for stragglers. Default: 0s.
    #[serde(default = "default_close_delay", with = "humantime_serde")]
    pub close_delay: Duration,

    /// Open accumulator cap before earliest buckets are closed early.
    #[serde(default)]
    pub max_open: Option<usize>,
}

/// Date/time dimension population.
#[derive(Debug, Clone, Deserialize)]
pub struct DimensionsConfig {
    /// Time between population runs. Default: 1h.
    #[serde(default = "default_populate_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// First date to populate. Defaults to the first date ever needed.
    #[serde(default)]
    pub horizon_start: Option<NaiveDate>,

    /// How far past now the date dimension is kept populated. Default: 30 days.
    #[serde(default = "default_populate_lookahead", with = "humantime_serde")]
    pub lookahead: Duration,

    /// Furthest an event timestamp may reach outside the populated dates
    /// before the event is recorded as unaggregatable. Default: 366 days.
    #[serde(default = "default_max_extension", with = "humantime_serde")]
    pub max_extension: Duration,

    /// Academic terms for the academic_term interval.
    #[serde(default)]
    pub terms: Vec<AcademicTerm>,
}

/// Raw event and session retention.
#[derive(Debug, Clone, Deserialize)]
pub struct PurgeConfig {
    /// Time between purge runs. Default: 1h.
    #[serde(default = "default_purge_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Processed raw events older than this are deleted. Default: 30 days.
    #[serde(default = "default_event_retention", with = "humantime_serde")]
    pub event_retention: Duration,

    /// Sessions idle longer than this are deleted. Default: 1 day.
    #[serde(default = "default_session_ttl", with = "humantime_serde")]
    pub session_ttl: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics and /healthz. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address for the health server. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_store_path() -> PathBuf {
    PathBuf::from("eventagg.db")
}

fn default_busy_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_lock_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_aggregation_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_intervals() -> Vec<AggregationInterval> {
    vec![
        AggregationInterval::Hour,
        AggregationInterval::Day,
        AggregationInterval::Month,
    ]
}

fn default_batch_size() -> usize {
    1000
}

fn default_max_batches_per_run() -> usize {
    100
}

fn default_run_budget() -> Duration {
    Duration::from_secs(60)
}

fn default_close_delay() -> Duration {
    Duration::ZERO
}

fn default_populate_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_populate_lookahead() -> Duration {
    Duration::from_secs(30 * 86_400)
}

fn default_max_extension() -> Duration {
    Duration::from_secs(DEFAULT_MAX_EXTENSION_DAYS as u64 * 86_400)
}

fn default_purge_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_event_retention() -> Duration {
    Duration::from_secs(30 * 86_400)
}

fn default_session_ttl() -> Duration {
    Duration::from_secs(86_400)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            server_id: String::new(),
            store: StoreConfig::default(),
            lock: LockSettings::default(),
            aggregation: AggregationConfig::default(),
            dimensions: DimensionsConfig::default(),
            purge: PurgeConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
            busy_timeout: default_busy_timeout(),
            auto_migrate: true,
        }
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            ttl: default_lock_ttl(),
            renew_interval: None,
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            interval: default_aggregation_interval(),
            intervals: default_intervals(),
            groups: Vec::new(),
            batch_size: default_batch_size(),
            max_batches_per_run: default_max_batches_per_run(),
            run_budget: default_run_budget(),
            close_delay: default_close_delay(),
            max_open: None,
        }
    }
}

impl Default for DimensionsConfig {
    fn default() -> Self {
        Self {
            interval: default_populate_interval(),
            horizon_start: None,
            lookahead: default_populate_lookahead(),
            max_extension: default_max_extension(),
            terms: Vec::new(),
        }
    }
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            interval: default_purge_interval(),
            event_retention: default_event_retention(),
            session_ttl: default_session_ttl(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file and validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.store.backend == StoreBackend::Sqlite && self.store.path.as_os_str().is_empty() {
            bail!("store.path is required for the sqlite backend");
        }

        if self.lock.ttl.is_zero() {
            bail!("lock.ttl must be positive");
        }

        match self.lock.renew_interval {
            Some(renew) if renew.is_zero() => bail!("lock.renew_interval must be positive"),
            Some(renew) if renew >= self.lock.ttl => bail!(
                "lock.renew_interval {:?} must be shorter than lock.ttl {:?}",
                renew,
                self.lock.ttl
            ),
            Some(_) => {}
            None => {
                if self.lock.ttl <= self.aggregation.run_budget {
                    bail!(
                        "lock.ttl {:?} must exceed aggregation.run_budget {:?} unless lock.renew_interval is set",
                        self.lock.ttl,
                        self.aggregation.run_budget
                    );
                }
            }
        }

        let agg = &self.aggregation;
        if agg.interval.is_zero() {
            bail!("aggregation.interval must be positive");
        }
        if agg.batch_size == 0 {
            bail!("aggregation.batch_size must be positive");
        }
        if agg.max_batches_per_run == 0 {
            bail!("aggregation.max_batches_per_run must be positive");
        }
        if agg.run_budget.is_zero() {
            bail!("aggregation.run_budget must be positive");
        }
        if agg.max_open == Some(0) {
            bail!("aggregation.max_open must be positive when set");
        }
        if agg.intervals.is_empty() {
            bail!("aggregation.intervals must not be empty");
        }

        let mut seen = HashSet::with_capacity(agg.intervals.len());
        for interval in &agg.intervals {
            if !seen.insert(*interval) {
                bail!("aggregation interval listed twice: {interval}");
            }
        }

        for group in &agg.groups {
            if group.trim().is_empty() {
                bail!("aggregation.groups must not contain empty names");
            }
        }

        if self.dimensions.interval.is_zero() {
            bail!("dimensions.interval must be positive");
        }
        if self.dimensions.max_extension < Duration::from_secs(86_400) {
            bail!("dimensions.max_extension must be at least one day");
        }

        self.validate_terms()?;

        if agg.intervals.contains(&AggregationInterval::AcademicTerm)
            && self.dimensions.terms.is_empty()
        {
            bail!("the academic_term interval requires dimensions.terms");
        }

        if self.purge.interval.is_zero() {
            bail!("purge.interval must be positive");
        }
        if self.purge.event_retention.is_zero() {
            bail!("purge.event_retention must be positive");
        }
        if self.purge.session_ttl.is_zero() {
            bail!("purge.session_ttl must be positive");
        }

        Ok(())
    }

    fn validate_terms(&self) -> Result<()> {
        let mut names = HashSet::with_capacity(self.dimensions.terms.len());
        for term in &self.dimensions.terms {
            if term.name.is_empty() {
                bail!("dimensions.terms entries require a name");
            }
            if term.start > term.end {
                bail!("academic term {} starts after it ends", term.name);
            }
            if !names.insert(term.name.as_str()) {
                bail!("academic term {} defined twice", term.name);
            }
        }

        let mut sorted: Vec<&AcademicTerm> = self.dimensions.terms.iter().collect();
        sorted.sort_by_key(|t| t.start);
        for pair in sorted.windows(2) {
            if pair[1].start <= pair[0].end {
                bail!(
                    "academic terms {} and {} overlap",
                    pair[0].name,
                    pair[1].name
                );
            }
        }

        Ok(())
    }

    /// Node identity from `server_id`, or a generated one.
    pub fn identity(&self) -> ServerIdentity {
        if self.server_id.is_empty() {
            ServerIdentity::generate()
        } else {
            ServerIdentity::new(self.server_id.clone())
        }
    }

    pub fn calendar(&self) -> Calendar {
        Calendar::new(self.dimensions.terms.clone())
    }

    /// `dimensions.max_extension` in whole days.
    pub fn max_extension(&self) -> chrono::Duration {
        chrono::Duration::days((self.dimensions.max_extension.as_secs() / 86_400) as i64)
    }

    pub fn lock_config(&self) -> LockConfig {
        LockConfig {
            ttl: self.lock.ttl,
            renew_interval: self.lock.renew_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).expect("parsing yaml")
    }

    #[test]
    fn test_default_config_values() {
        let cfg = parse("{}");

        assert_eq!(cfg.log_level, "info");
        assert!(cfg.server_id.is_empty());
        assert_eq!(cfg.store.backend, StoreBackend::Sqlite);
        assert_eq!(cfg.store.path, PathBuf::from("eventagg.db"));
        assert_eq!(cfg.store.busy_timeout, Duration::from_secs(5));
        assert!(cfg.store.auto_migrate);
        assert_eq!(cfg.lock.ttl, Duration::from_secs(300));
        assert!(cfg.lock.renew_interval.is_none());
        assert_eq!(cfg.aggregation.batch_size, 1000);
        assert_eq!(cfg.aggregation.close_delay, Duration::ZERO);
        assert_eq!(
            cfg.aggregation.intervals,
            vec![
                AggregationInterval::Hour,
                AggregationInterval::Day,
                AggregationInterval::Month
            ]
        );
        assert_eq!(cfg.health.addr, ":9090");
        assert_eq!(cfg.max_extension(), chrono::Duration::days(366));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_full_config_parses() {
        let cfg = parse(
            r#"
log_level: debug
server_id: node-a
store:
  backend: memory
  busy_timeout: 250ms
lock:
  ttl: 30s
  renew_interval: 10s
aggregation:
  interval: 15s
  intervals: [five_minute, hour, academic_term]
  groups: [students, staff]
  batch_size: 50
  run_budget: 2m
  close_delay: 5m
  max_open: 10000
dimensions:
  horizon_start: 2024-01-01
  lookahead: 7days
  max_extension: 90days
  terms:
    - name: spring-2024
      start: 2024-01-15
      end: 2024-05-10
purge:
  event_retention: 14days
  session_ttl: 12h
health:
  addr: "127.0.0.1:9191"
"#,
        );

        assert_eq!(cfg.store.backend, StoreBackend::Memory);
        assert_eq!(cfg.store.busy_timeout, Duration::from_millis(250));
        assert_eq!(cfg.lock.renew_interval, Some(Duration::from_secs(10)));
        assert_eq!(cfg.aggregation.close_delay, Duration::from_secs(300));
        assert_eq!(cfg.aggregation.max_open, Some(10_000));
        assert_eq!(
            cfg.dimensions.horizon_start,
            NaiveDate::from_ymd_opt(2024, 1, 1)
        );
        assert_eq!(cfg.dimensions.lookahead, Duration::from_secs(7 * 86_400));
        assert_eq!(cfg.max_extension(), chrono::Duration::days(90));
        assert_eq!(cfg.purge.session_ttl, Duration::from_secs(12 * 3600));
        assert_eq!(cfg.identity().as_str(), "node-a");
        assert!(cfg.calendar().term_named("spring-2024").is_some());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_generated_identity_when_unset() {
        let cfg = Config::default();
        assert!(!cfg.identity().as_str().is_empty());
    }

    #[test]
    fn test_validation_ttl_must_exceed_budget_without_renewal() {
        let mut cfg = Config::default();
        cfg.lock.ttl = Duration::from_secs(30);
        cfg.aggregation.run_budget = Duration::from_secs(60);

        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("must exceed aggregation.run_budget"));

        cfg.lock.renew_interval = Some(Duration::from_secs(10));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validation_renew_interval_shorter_than_ttl() {
        let mut cfg = Config::default();
        cfg.lock.renew_interval = Some(cfg.lock.ttl);

        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("must be shorter than lock.ttl"));
    }

    #[test]
    fn test_validation_empty_intervals() {
        let mut cfg = Config::default();
        cfg.aggregation.intervals.clear();

        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("intervals must not be empty"));
    }

    #[test]
    fn test_validation_duplicate_interval() {
        let mut cfg = Config::default();
        cfg.aggregation.intervals.push(AggregationInterval::Hour);

        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("listed twice: hour"));
    }

    #[test]
    fn test_validation_zero_batch_size() {
        let mut cfg = Config::default();
        cfg.aggregation.batch_size = 0;

        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("batch_size must be positive"));
    }

    #[test]
    fn test_validation_overlapping_terms() {
        let mut cfg = Config::default();
        let d = |m, day| NaiveDate::from_ymd_opt(2024, m, day).unwrap();
        cfg.dimensions.terms = vec![
            AcademicTerm {
                name: "spring".to_string(),
                start: d(1, 15),
                end: d(5, 10),
            },
            AcademicTerm {
                name: "summer".to_string(),
                start: d(5, 10),
                end: d(8, 1),
            },
        ];

        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn test_validation_inverted_term() {
        let mut cfg = Config::default();
        cfg.dimensions.terms = vec![AcademicTerm {
            name: "fall".to_string(),
            start: NaiveDate::from_ymd_opt(2024, 12, 20).unwrap(),
            end: NaiveDate::from_ymd_opt(2024, 9, 1).unwrap(),
        }];

        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("starts after it ends"));
    }

    #[test]
    fn test_validation_academic_term_needs_terms() {
        let mut cfg = Config::default();
        cfg.aggregation
            .intervals
            .push(AggregationInterval::AcademicTerm);

        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("requires dimensions.terms"));
    }

    #[test]
    fn test_validation_max_extension_at_least_a_day() {
        let mut cfg = Config::default();
        cfg.dimensions.max_extension = Duration::from_secs(3600);

        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("max_extension"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eventagg.yaml");
        std::fs::write(&path, "server_id: node-b\naggregation:\n  batch_size: 10\n").unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.server_id, "node-b");
        assert_eq!(cfg.aggregation.batch_size, 10);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eventagg.yaml");
        std::fs::write(&path, "aggregation:\n  intervals: []\n").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("intervals must not be empty"));
    }
}
