//! Engine configuration.
//!
//! Values come from [`EngineConfig::default`], the builder setters on
//! [`EngineBuilder`](crate::EngineBuilder), or `EVENTFOLD_*` environment
//! variables via [`EngineConfig::from_env`].

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default number of events between two snapshots of a stream.
pub const DEFAULT_SNAPSHOT_FREQUENCY: u64 = 100;

/// Default limit on saga-triggered command recursion.
pub const DEFAULT_MAX_CASCADE_DEPTH: u32 = 16;

/// Runtime configuration for an [`Engine`](crate::Engine).
///
/// # Examples
///
/// ```
/// use eventfold_cqrs::EngineConfig;
///
/// let config = EngineConfig {
///     snapshot_frequency: 10,
///     ..EngineConfig::new("/tmp/my-app")
/// };
/// assert_eq!(config.max_cascade_depth, 16);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory for event logs, snapshots and checkpoints.
    pub base_dir: PathBuf,

    /// Snapshot a stream once it is this many events past its last
    /// snapshot. `0` disables snapshots.
    ///
    /// Default: 100.
    pub snapshot_frequency: u64,

    /// Deepest saga cascade a command may sit at. Root commands are at
    /// depth 0.
    ///
    /// Default: 16.
    pub max_cascade_depth: u32,

    /// Events older than this become eligible for compaction once a
    /// snapshot covers them. `None` disables retention.
    pub max_event_age: Option<Duration>,

    /// How often the background retention task runs.
    ///
    /// Default: 60 seconds.
    pub retention_interval: Duration,

    /// Buffered faults per subscriber before lagging receivers drop some.
    ///
    /// Default: 256.
    pub fault_channel_capacity: usize,
}

impl EngineConfig {
    /// Default configuration rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            snapshot_frequency: DEFAULT_SNAPSHOT_FREQUENCY,
            max_cascade_depth: DEFAULT_MAX_CASCADE_DEPTH,
            max_event_age: None,
            retention_interval: Duration::from_secs(60),
            fault_channel_capacity: 256,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// | Variable | Field | Default |
    /// |---|---|---|
    /// | `EVENTFOLD_DATA_DIR` | `base_dir` | required |
    /// | `EVENTFOLD_SNAPSHOT_FREQUENCY` | `snapshot_frequency` | 100 |
    /// | `EVENTFOLD_MAX_CASCADE_DEPTH` | `max_cascade_depth` | 16 |
    /// | `EVENTFOLD_MAX_EVENT_AGE_SECS` | `max_event_age` | unset |
    /// | `EVENTFOLD_RETENTION_INTERVAL_SECS` | `retention_interval` | 60 |
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingEnv`] when `EVENTFOLD_DATA_DIR` is not
    /// set and [`ConfigError::InvalidValue`] when a number does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_dir = env::var("EVENTFOLD_DATA_DIR")
            .map_err(|_| ConfigError::MissingEnv("EVENTFOLD_DATA_DIR"))?;
        let mut config = Self::new(base_dir);

        if let Some(n) = parse_env::<u64>("EVENTFOLD_SNAPSHOT_FREQUENCY")? {
            config.snapshot_frequency = n;
        }
        if let Some(n) = parse_env::<u32>("EVENTFOLD_MAX_CASCADE_DEPTH")? {
            config.max_cascade_depth = n;
        }
        if let Some(secs) = parse_env::<u64>("EVENTFOLD_MAX_EVENT_AGE_SECS")? {
            config.max_event_age = Some(Duration::from_secs(secs));
        }
        if let Some(secs) = parse_env::<u64>("EVENTFOLD_RETENTION_INTERVAL_SECS")? {
            config.retention_interval = Duration::from_secs(secs);
        }
        Ok(config)
    }

    /// Reject combinations that would break replay correctness.
    ///
    /// Retention only ever drops events a snapshot already covers, so it
    /// cannot run with snapshots disabled.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::RetentionWithoutSnapshots`] or
    /// [`ConfigError::InvalidValue`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_event_age.is_some() && self.snapshot_frequency == 0 {
            return Err(ConfigError::RetentionWithoutSnapshots);
        }
        if self.retention_interval.is_zero() {
            return Err(ConfigError::InvalidValue("retention_interval"));
        }
        if self.fault_channel_capacity == 0 {
            return Err(ConfigError::InvalidValue("fault_channel_capacity"));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(name)),
        Err(_) => Ok(None),
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("invalid value for {0}")]
    InvalidValue(&'static str),

    #[error("retention requires snapshots: max_event_age is set but snapshot_frequency is 0")]
    RetentionWithoutSnapshots,

    #[error("{kind} `{name}` is registered twice")]
    Duplicate { kind: &'static str, name: String },

    #[error("retention is not configured: set max_event_age")]
    RetentionDisabled,
}
