//! Control-plane configuration.
//!
//! Configuration is a plain value passed to every constructor and serialized
//! into each supervised child. `from_env` helpers exist for binaries; library
//! code never reads the environment on its own.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::defaults;
use crate::{Error, Result};

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| !matches!(v.trim().to_lowercase().as_str(), "" | "0" | "false" | "no"))
}

/// Derive the default Unix socket path for a working directory.
///
/// Distinct working directories get distinct sockets so several installs on
/// one host do not collide.
pub fn default_rpc_socket_path(cwd: &Path) -> PathBuf {
    let root = cwd.canonicalize().unwrap_or_else(|_| cwd.to_path_buf());
    let digest = Sha256::digest(root.to_string_lossy().as_bytes());
    let short = &hex::encode(digest)[..8];
    std::env::temp_dir().join(format!("{}_{}.sock", defaults::RPC_SOCKET_PREFIX, short))
}

// =============================================================================
// DATABASE
// =============================================================================

/// Persistence settings for the owning process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Dataset file. In-memory when unset.
    pub db_path: Option<PathBuf>,
    pub retention_days: u32,
    /// Delete the dataset file before opening it.
    pub purge_db: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            retention_days: defaults::RETENTION_DAYS,
            purge_db: false,
        }
    }
}

impl DatabaseConfig {
    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            db_path: std::env::var("TASKROOT_DB_PATH").ok().map(PathBuf::from),
            retention_days: env_parse("TASKROOT_RETENTION_DAYS").unwrap_or(base.retention_days),
            purge_db: env_flag("TASKROOT_PURGE_DB").unwrap_or(base.purge_db),
        }
    }
}

// =============================================================================
// RPC
// =============================================================================

/// Socket family used by the RPC transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcTransport {
    Unix,
    Tcp,
}

impl Default for RpcTransport {
    fn default() -> Self {
        if cfg!(unix) {
            Self::Unix
        } else {
            Self::Tcp
        }
    }
}

impl FromStr for RpcTransport {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unix" => Ok(Self::Unix),
            "tcp" => Ok(Self::Tcp),
            _ => Err(format!("Invalid RPC transport: {}", s)),
        }
    }
}

/// Resolved address an RPC server binds or a client connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcEndpoint {
    Unix(PathBuf),
    Tcp { host: String, port: u16 },
}

impl std::fmt::Display for RpcEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp { host, port } => write!(f, "tcp:{}:{}", host, port),
        }
    }
}

/// Transport, auth and limit settings shared by the RPC server and clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub host: String,
    pub port: u16,
    /// Unix socket path. Derived from the working directory when unset.
    pub socket_path: Option<PathBuf>,
    pub transport: RpcTransport,
    /// Shared secret. Empty or unset disables authentication.
    pub auth_key: Option<String>,
    pub max_message_bytes: usize,
    pub max_inflight: usize,
    pub timeout_seconds: f64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            host: defaults::RPC_HOST.to_string(),
            port: defaults::RPC_PORT,
            socket_path: None,
            transport: RpcTransport::default(),
            auth_key: None,
            max_message_bytes: defaults::RPC_MAX_MESSAGE_BYTES,
            max_inflight: defaults::RPC_MAX_INFLIGHT,
            timeout_seconds: defaults::RPC_TIMEOUT_SECS,
        }
    }
}

impl RpcConfig {
    /// TCP endpoint at `host:port`.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            transport: RpcTransport::Tcp,
            ..Self::default()
        }
    }

    /// Unix socket endpoint at `path`.
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: Some(path.into()),
            transport: RpcTransport::Unix,
            ..Self::default()
        }
    }

    pub fn with_auth_key(mut self, key: impl Into<String>) -> Self {
        self.auth_key = Some(key.into());
        self
    }

    pub fn with_max_message_bytes(mut self, max: usize) -> Self {
        self.max_message_bytes = max;
        self
    }

    pub fn with_max_inflight(mut self, max: usize) -> Self {
        self.max_inflight = max;
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: f64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// The configured secret, treating an empty string as none.
    pub fn auth_token(&self) -> Option<&str> {
        self.auth_key.as_deref().filter(|k| !k.is_empty())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_seconds)
    }

    /// Resolve where to bind or connect.
    pub fn endpoint(&self) -> Result<RpcEndpoint> {
        match self.transport {
            RpcTransport::Tcp => Ok(RpcEndpoint::Tcp {
                host: self.host.clone(),
                port: self.port,
            }),
            RpcTransport::Unix => {
                let path = match &self.socket_path {
                    Some(path) => path.clone(),
                    None => default_rpc_socket_path(&std::env::current_dir()?),
                };
                Ok(RpcEndpoint::Unix(path))
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_message_bytes == 0 {
            return Err(Error::Config("rpc.max_message_bytes must be > 0".into()));
        }
        if self.max_message_bytes > u32::MAX as usize {
            return Err(Error::Config(
                "rpc.max_message_bytes must fit a u32 length prefix".into(),
            ));
        }
        if self.max_inflight == 0 {
            return Err(Error::Config("rpc.max_inflight must be > 0".into()));
        }
        if !self.timeout_seconds.is_finite() || self.timeout_seconds <= 0.0 {
            return Err(Error::Config("rpc.timeout_seconds must be > 0".into()));
        }
        if self.transport == RpcTransport::Tcp && self.port == 0 {
            return Err(Error::Config("rpc.port must be in 1..=65535".into()));
        }
        if self.transport == RpcTransport::Unix && cfg!(not(unix)) {
            return Err(Error::Config(
                "unix socket transport is not available on this platform".into(),
            ));
        }
        Ok(())
    }

    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            host: std::env::var("TASKROOT_RPC_HOST").unwrap_or(base.host),
            port: env_parse("TASKROOT_RPC_PORT").unwrap_or(base.port),
            socket_path: std::env::var("TASKROOT_RPC_SOCKET").ok().map(PathBuf::from),
            transport: env_parse("TASKROOT_RPC_TRANSPORT").unwrap_or(base.transport),
            auth_key: std::env::var("TASKROOT_RPC_AUTH_KEY").ok(),
            max_message_bytes: env_parse("TASKROOT_RPC_MAX_MESSAGE_BYTES")
                .unwrap_or(base.max_message_bytes),
            max_inflight: env_parse("TASKROOT_RPC_MAX_INFLIGHT").unwrap_or(base.max_inflight),
            timeout_seconds: env_parse("TASKROOT_RPC_TIMEOUT_SECONDS")
                .unwrap_or(base.timeout_seconds),
        }
    }
}

// =============================================================================
// BEAT
// =============================================================================

/// Scheduler settings. Present only when the scheduler component is enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeatConfig {
    /// Application identity; the scheduler only sees schedules of this app.
    pub app: String,
    /// Reload schedule rows this often. Never when unset.
    #[serde(default)]
    pub db_refresh_seconds: Option<f64>,
    #[serde(default = "default_sync_every")]
    pub sync_every_seconds: f64,
}

fn default_sync_every() -> f64 {
    defaults::BEAT_SYNC_EVERY_SECS
}

impl BeatConfig {
    pub fn new(app: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            db_refresh_seconds: None,
            sync_every_seconds: defaults::BEAT_SYNC_EVERY_SECS,
        }
    }

    pub fn with_db_refresh_seconds(mut self, seconds: f64) -> Self {
        self.db_refresh_seconds = Some(seconds);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.app.trim().is_empty() {
            return Err(Error::Config("beat.app must not be empty".into()));
        }
        if let Some(refresh) = self.db_refresh_seconds {
            if !refresh.is_finite() || refresh <= 0.0 {
                return Err(Error::Config("beat.db_refresh_seconds must be > 0".into()));
            }
        }
        if !self.sync_every_seconds.is_finite() || self.sync_every_seconds <= 0.0 {
            return Err(Error::Config("beat.sync_every_seconds must be > 0".into()));
        }
        Ok(())
    }

    /// `None` unless `TASKROOT_BEAT_APP` is set.
    pub fn from_env() -> Option<Self> {
        let app = std::env::var("TASKROOT_BEAT_APP").ok()?;
        let mut config = Self::new(app);
        config.db_refresh_seconds = env_parse("TASKROOT_BEAT_REFRESH_SECONDS");
        if let Some(sync) = env_parse("TASKROOT_BEAT_SYNC_SECONDS") {
            config.sync_every_seconds = sync;
        }
        Some(config)
    }
}

// =============================================================================
// EXPORTER
// =============================================================================

/// Metrics exporter settings. Present only when the exporter is enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExporterConfig {
    pub stats_interval_seconds: f64,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            stats_interval_seconds: defaults::EXPORTER_STATS_INTERVAL_SECS,
        }
    }
}

impl ExporterConfig {
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs_f64(self.stats_interval_seconds)
    }

    /// `None` unless `TASKROOT_EXPORTER_ENABLED` is truthy.
    pub fn from_env() -> Option<Self> {
        if !env_flag("TASKROOT_EXPORTER_ENABLED").unwrap_or(false) {
            return None;
        }
        let base = Self::default();
        Some(Self {
            stats_interval_seconds: env_parse("TASKROOT_EXPORTER_INTERVAL_SECONDS")
                .unwrap_or(base.stats_interval_seconds),
        })
    }
}

// =============================================================================
// SUPERVISOR
// =============================================================================

/// One supervised child process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub name: String,
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Overrides the supervisor-wide grace period.
    #[serde(default)]
    pub grace_period_seconds: Option<f64>,
}

impl ComponentSpec {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            grace_period_seconds: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period_seconds = Some(grace.as_secs_f64());
        self
    }
}

/// Process supervision settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub grace_period_seconds: f64,
    /// Capacity of the aggregated log channel.
    pub event_queue_maxsize: usize,
    /// Extra components started alongside the built-in ones.
    pub components: Vec<ComponentSpec>,
    /// Directory for one daily-rotated log file per component.
    pub log_dir: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace_period_seconds: defaults::CHILD_GRACE_PERIOD_SECS,
            event_queue_maxsize: defaults::EVENT_QUEUE_MAXSIZE,
            components: Vec::new(),
            log_dir: None,
        }
    }
}

impl SupervisorConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs_f64(self.grace_period_seconds)
    }

    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(log_dir.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.grace_period_seconds.is_finite() || self.grace_period_seconds < 0.0 {
            return Err(Error::Config(
                "supervisor.grace_period_seconds must be >= 0".into(),
            ));
        }
        if self.event_queue_maxsize == 0 || self.event_queue_maxsize > defaults::EVENT_QUEUE_MAXSIZE
        {
            return Err(Error::Config(format!(
                "supervisor.event_queue_maxsize must be in 1..={}",
                defaults::EVENT_QUEUE_MAXSIZE
            )));
        }
        let mut names = std::collections::HashSet::new();
        for component in &self.components {
            if !names.insert(component.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate component name: {}",
                    component.name
                )));
            }
        }
        Ok(())
    }

    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            grace_period_seconds: env_parse("TASKROOT_GRACE_PERIOD_SECONDS")
                .unwrap_or(base.grace_period_seconds),
            event_queue_maxsize: env_parse("TASKROOT_EVENT_QUEUE_MAXSIZE")
                .unwrap_or(base.event_queue_maxsize),
            components: base.components,
            log_dir: std::env::var("TASKROOT_LOG_DIR").ok().map(PathBuf::from),
        }
    }
}

// =============================================================================
// TOP LEVEL
// =============================================================================

/// Everything the control plane needs, threaded explicitly to each part.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    pub database: DatabaseConfig,
    pub rpc: RpcConfig,
    pub beat: Option<BeatConfig>,
    pub exporter: Option<ExporterConfig>,
    pub supervisor: SupervisorConfig,
}

impl ControlPlaneConfig {
    pub fn with_database(mut self, database: DatabaseConfig) -> Self {
        self.database = database;
        self
    }

    pub fn with_rpc(mut self, rpc: RpcConfig) -> Self {
        self.rpc = rpc;
        self
    }

    pub fn with_beat(mut self, beat: BeatConfig) -> Self {
        self.beat = Some(beat);
        self
    }

    pub fn with_exporter(mut self, exporter: ExporterConfig) -> Self {
        self.exporter = Some(exporter);
        self
    }

    pub fn with_supervisor(mut self, supervisor: SupervisorConfig) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.rpc.validate()?;
        if let Some(beat) = &self.beat {
            beat.validate()?;
        }
        if let Some(exporter) = &self.exporter {
            if !exporter.stats_interval_seconds.is_finite()
                || exporter.stats_interval_seconds <= 0.0
            {
                return Err(Error::Config(
                    "exporter.stats_interval_seconds must be > 0".into(),
                ));
            }
        }
        self.supervisor.validate()
    }

    /// Build from `TASKROOT_*` environment variables. Call `dotenvy::dotenv()`
    /// first to pick up a `.env` file.
    pub fn from_env() -> Self {
        Self {
            database: DatabaseConfig::from_env(),
            rpc: RpcConfig::from_env(),
            beat: BeatConfig::from_env(),
            exporter: ExporterConfig::from_env(),
            supervisor: SupervisorConfig::from_env(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
