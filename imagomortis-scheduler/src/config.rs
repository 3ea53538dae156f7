//! Scheduler configuration
//!
//! Defines all configurable parameters for the scheduler: polling
//! intervals, the ephemeral job template, the shared volume layout, and
//! database and Kubernetes connection settings.
//!
//! The configuration is read once at startup and handed to each component
//! constructor; nothing below `main` reads the environment.

use std::path::PathBuf;
use std::time::Duration;

/// Output format of the tracing subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human readable, for local development
    Pretty,
    /// One JSON record per line
    Json,
}

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// How long to sleep when no work is available
    pub poll_interval: Duration,

    /// How long to sleep after a failed claim attempt
    pub error_delay: Duration,

    /// Namespace the ephemeral jobs are created in
    pub namespace: String,

    /// Container image of the image task worker
    pub task_image: String,

    /// `imagePullPolicy` of the worker container
    pub image_pull_policy: String,

    /// Name of the worker container inside the job's pod
    pub container_name: String,

    /// Shared volume as mounted in the scheduler
    pub shared_volume_path: PathBuf,

    /// Shared volume as mounted in each job
    pub job_mount_path: String,

    /// PersistentVolumeClaim backing the shared volume
    pub shared_volume_claim: String,

    /// `ttlSecondsAfterFinished` so the platform removes jobs we failed to delete
    pub job_ttl_seconds: u32,

    /// Interval between job status checks
    pub job_poll_interval: Duration,

    /// How long to look for the job's pod before giving up on progress
    pub pod_lookup_timeout: Duration,

    /// How long to wait for the worker container before streaming anyway
    pub container_ready_timeout: Duration,

    /// Number of existing log lines to replay when attaching
    pub log_tail_lines: u32,

    /// Bound on waiting for the progress streamer to stop
    pub stream_join_timeout: Duration,

    /// Explicit Kubernetes API URL (e.g. a `kubectl proxy`)
    pub kube_api_url: Option<String>,

    /// Log output format
    pub log_format: LogFormat,

    pub database: DatabaseConfig,
}

/// Postgres connection settings
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Full connection URL; overrides the individual fields when set
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 5432,
            name: "imagomortis".to_string(),
            user: "postgres".to_string(),
            password: "postgres".to_string(),
            max_connections: 5,
        }
    }
}

/// Upper bound for every interval and timeout, so deadlines never overflow
const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

impl Config {
    /// Creates configuration from environment variables
    ///
    /// Expected environment variables (all optional):
    /// - SCHEDULER_POLL_INTERVAL, SCHEDULER_ERROR_DELAY (seconds, default: 5)
    /// - SCHEDULER_NAMESPACE (default: imagomortis)
    /// - SCHEDULER_IMAGE_TASK_IMAGE (default: imagomortis/imagetask:latest)
    /// - SCHEDULER_IMAGE_PULL_POLICY (default: IfNotPresent)
    /// - SCHEDULER_SHARED_VOLUME_PATH (default: /app/shared)
    /// - SCHEDULER_JOB_MOUNT_PATH (default: /app/shared)
    /// - SCHEDULER_SHARED_VOLUME_CLAIM (default: scheduler-shared-pvc)
    /// - SCHEDULER_JOB_TTL_SECONDS (default: 300)
    /// - SCHEDULER_JOB_POLL_INTERVAL (seconds, default: 2)
    /// - SCHEDULER_POD_LOOKUP_TIMEOUT (seconds, default: 30)
    /// - SCHEDULER_CONTAINER_READY_TIMEOUT (seconds, default: 60)
    /// - SCHEDULER_LOG_TAIL_LINES (default: 10)
    /// - SCHEDULER_STREAM_JOIN_TIMEOUT (seconds, default: 5)
    /// - SCHEDULER_KUBE_API_URL
    /// - LOG_FORMAT (`json` or `pretty`, default: pretty)
    /// - DATABASE_URL, or SCHEDULER_DB_{HOST,PORT,NAME,USER,PASSWORD}
    ///   falling back to POSTGRES_{HOST,PORT,DB,USER,PASSWORD}
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let secs = |key: &str, default: Duration| {
            lookup(key)
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        // SCHEDULER_DB_* wins over the POSTGRES_* names shared with other services
        let db_var = |scheduler_key: &str, shared_key: &str| {
            lookup(scheduler_key).or_else(|| lookup(shared_key))
        };

        let db_defaults = DatabaseConfig::default();
        let database = DatabaseConfig {
            url: lookup("DATABASE_URL"),
            host: db_var("SCHEDULER_DB_HOST", "POSTGRES_HOST").unwrap_or(db_defaults.host),
            port: db_var("SCHEDULER_DB_PORT", "POSTGRES_PORT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(db_defaults.port),
            name: db_var("SCHEDULER_DB_NAME", "POSTGRES_DB").unwrap_or(db_defaults.name),
            user: db_var("SCHEDULER_DB_USER", "POSTGRES_USER").unwrap_or(db_defaults.user),
            password: db_var("SCHEDULER_DB_PASSWORD", "POSTGRES_PASSWORD")
                .unwrap_or(db_defaults.password),
            max_connections: lookup("SCHEDULER_DB_MAX_CONNECTIONS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(db_defaults.max_connections),
        };

        let log_format = match lookup("LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        Self {
            poll_interval: secs("SCHEDULER_POLL_INTERVAL", defaults.poll_interval),
            error_delay: secs("SCHEDULER_ERROR_DELAY", defaults.error_delay),
            namespace: string("SCHEDULER_NAMESPACE", &defaults.namespace),
            task_image: string("SCHEDULER_IMAGE_TASK_IMAGE", &defaults.task_image),
            image_pull_policy: string("SCHEDULER_IMAGE_PULL_POLICY", &defaults.image_pull_policy),
            container_name: defaults.container_name,
            shared_volume_path: lookup("SCHEDULER_SHARED_VOLUME_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.shared_volume_path),
            job_mount_path: string("SCHEDULER_JOB_MOUNT_PATH", &defaults.job_mount_path),
            shared_volume_claim: string("SCHEDULER_SHARED_VOLUME_CLAIM", &defaults.shared_volume_claim),
            job_ttl_seconds: lookup("SCHEDULER_JOB_TTL_SECONDS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.job_ttl_seconds),
            job_poll_interval: secs("SCHEDULER_JOB_POLL_INTERVAL", defaults.job_poll_interval),
            pod_lookup_timeout: secs("SCHEDULER_POD_LOOKUP_TIMEOUT", defaults.pod_lookup_timeout),
            container_ready_timeout: secs(
                "SCHEDULER_CONTAINER_READY_TIMEOUT",
                defaults.container_ready_timeout,
            ),
            log_tail_lines: lookup("SCHEDULER_LOG_TAIL_LINES")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.log_tail_lines),
            stream_join_timeout: secs("SCHEDULER_STREAM_JOIN_TIMEOUT", defaults.stream_join_timeout),
            kube_api_url: lookup("SCHEDULER_KUBE_API_URL").filter(|s| !s.is_empty()),
            log_format,
            database,
        }
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval.is_zero() {
            anyhow::bail!("poll_interval must be greater than 0");
        }

        if self.job_poll_interval.is_zero() {
            anyhow::bail!("job_poll_interval must be greater than 0");
        }

        if self.namespace.is_empty() {
            anyhow::bail!("namespace cannot be empty");
        }

        if self.task_image.is_empty() {
            anyhow::bail!("task_image cannot be empty");
        }

        if !matches!(
            self.image_pull_policy.as_str(),
            "Always" | "IfNotPresent" | "Never"
        ) {
            anyhow::bail!(
                "image_pull_policy must be Always, IfNotPresent or Never (got {})",
                self.image_pull_policy
            );
        }

        if !self.job_mount_path.starts_with('/') {
            anyhow::bail!("job_mount_path must be an absolute path");
        }

        for (name, value) in [
            ("poll_interval", self.poll_interval),
            ("error_delay", self.error_delay),
            ("job_poll_interval", self.job_poll_interval),
            ("pod_lookup_timeout", self.pod_lookup_timeout),
            ("container_ready_timeout", self.container_ready_timeout),
            ("stream_join_timeout", self.stream_join_timeout),
        ] {
            if value > MAX_DURATION {
                anyhow::bail!("{} must be at most {}s", name, MAX_DURATION.as_secs());
            }
        }

        if let Some(url) = &self.kube_api_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("kube_api_url must start with http:// or https://");
            }
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            error_delay: Duration::from_secs(5),
            namespace: "imagomortis".to_string(),
            task_image: "imagomortis/imagetask:latest".to_string(),
            image_pull_policy: "IfNotPresent".to_string(),
            container_name: "imagetask".to_string(),
            shared_volume_path: PathBuf::from("/app/shared"),
            job_mount_path: "/app/shared".to_string(),
            shared_volume_claim: "scheduler-shared-pvc".to_string(),
            job_ttl_seconds: 300,
            job_poll_interval: Duration::from_secs(2),
            pod_lookup_timeout: Duration::from_secs(30),
            container_ready_timeout: Duration::from_secs(60),
            log_tail_lines: 10,
            stream_join_timeout: Duration::from_secs(5),
            kube_api_url: None,
            log_format: LogFormat::Pretty,
            database: DatabaseConfig::default(),
        }
    }
}
