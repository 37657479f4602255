//! Configuration file management (spec §6.1/§9).
//!
//! A TOML document at `$XDG_CONFIG_HOME/mahabharatha/config.toml` (falling
//! back to `~/.config/mahabharatha`), resolved against a fixed chain: CLI
//! flag > environment variable (`MAHA_<SECTION>_<FIELD>`) > config file >
//! built-in default.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::merge::GateConfig;
use crate::scheduler::SchedulerConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub workers: WorkersSection,
    pub backend: Option<String>,
    #[serde(default)]
    pub gates: Vec<GateConfig>,
    #[serde(default)]
    pub improvement_loops: ImprovementLoopsSection,
    #[serde(default)]
    pub verification: VerificationSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkersSection {
    pub max_concurrent: Option<usize>,
    pub spawn_retry_attempts: Option<u32>,
    pub spawn_backoff_strategy: Option<String>,
    pub spawn_backoff_base_seconds: Option<u64>,
    pub spawn_backoff_max_seconds: Option<u64>,
    pub task_stale_timeout_seconds: Option<u64>,
    pub heartbeat_interval_seconds: Option<u64>,
    pub heartbeat_stale_threshold_seconds: Option<u64>,
    pub auto_respawn: Option<bool>,
    pub max_respawn_attempts: Option<u32>,
}

impl Default for WorkersSection {
    fn default() -> Self {
        Self {
            max_concurrent: None,
            spawn_retry_attempts: None,
            spawn_backoff_strategy: None,
            spawn_backoff_base_seconds: None,
            spawn_backoff_max_seconds: None,
            task_stale_timeout_seconds: None,
            heartbeat_interval_seconds: None,
            heartbeat_stale_threshold_seconds: None,
            auto_respawn: None,
            max_respawn_attempts: None,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ImprovementLoopsSection {
    pub max_iterations: Option<u32>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct VerificationSection {
    pub staleness_threshold_seconds: Option<u64>,
}

/// Which worker backend is active for a run (spec §4.3). Mirrors the
/// top-level `backend` config key; the cooperative backend is the default
/// since it needs no external runtime to exercise the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Cooperative,
    Process,
    Container,
}

impl Default for BackendKind {
    fn default() -> Self {
        Self::Cooperative
    }
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cooperative" => Ok(Self::Cooperative),
            "process" => Ok(Self::Process),
            "container" => Ok(Self::Container),
            other => bail!("unknown backend {other:?}, expected cooperative, process, or container"),
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the mahabharatha config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/mahabharatha` or
/// `~/.config/mahabharatha`. Intentionally ignores the platform-specific
/// `dirs::config_dir()` (which returns `~/Library/Application Support` on
/// macOS); the XDG path is fixed across platforms.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("mahabharatha");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("mahabharatha")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Load and parse the config file. Returns `Ok(None)` if it does not exist
/// rather than an error -- an unconfigured run still resolves to defaults.
pub fn load_config() -> Result<Option<ConfigFile>> {
    let path = config_path();
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(Some(config))
}

// -----------------------------------------------------------------------
// CLI overrides and resolution
// -----------------------------------------------------------------------

/// The subset of config fields exposed as flags on the `run` verb.
/// Anything `None` here falls through to the env var / file / default
/// chain.
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub max_concurrent: Option<usize>,
    pub backend: Option<String>,
}

fn env_var(section: &str, field: &str) -> Option<String> {
    std::env::var(format!("MAHA_{section}_{field}")).ok()
}

fn resolve_u64(section: &str, field: &str, file_value: Option<u64>, default: u64) -> Result<u64> {
    if let Some(raw) = env_var(section, field) {
        return raw
            .parse()
            .with_context(|| format!("MAHA_{section}_{field} is not a valid integer"));
    }
    Ok(file_value.unwrap_or(default))
}

fn resolve_u32(section: &str, field: &str, file_value: Option<u32>, default: u32) -> Result<u32> {
    if let Some(raw) = env_var(section, field) {
        return raw
            .parse()
            .with_context(|| format!("MAHA_{section}_{field} is not a valid integer"));
    }
    Ok(file_value.unwrap_or(default))
}

fn resolve_bool(section: &str, field: &str, file_value: Option<bool>, default: bool) -> Result<bool> {
    if let Some(raw) = env_var(section, field) {
        return match raw.as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => bail!("MAHA_{section}_{field} is not a valid boolean: {other:?}"),
        };
    }
    Ok(file_value.unwrap_or(default))
}

/// Fully resolved configuration, ready for use by the orchestrator.
#[derive(Debug)]
pub struct MahaConfig {
    pub scheduler: SchedulerConfig,
    pub backend: BackendKind,
    pub gates: Vec<GateConfig>,
    pub improvement_loop_max_iterations: u32,
    pub verification_staleness_threshold: Duration,
}

impl MahaConfig {
    /// Resolve configuration using the chain: CLI flag > env var
    /// (`MAHA_<SECTION>_<FIELD>`) > config file > built-in default (spec §9).
    pub fn resolve(cli: &CliOverrides) -> Result<Self> {
        let file = load_config()?;
        let workers = file.as_ref().map(|f| &f.workers);
        let defaults = SchedulerConfig::default();

        let max_concurrent = if let Some(v) = cli.max_concurrent {
            v
        } else if let Some(raw) = env_var("WORKERS", "MAX_CONCURRENT") {
            raw.parse().context("MAHA_WORKERS_MAX_CONCURRENT is not a valid integer")?
        } else {
            workers
                .and_then(|w| w.max_concurrent)
                .unwrap_or(defaults.max_concurrent)
        };

        let spawn_retry_attempts = resolve_u32(
            "WORKERS",
            "SPAWN_RETRY_ATTEMPTS",
            workers.and_then(|w| w.spawn_retry_attempts),
            defaults.spawn_retry.max_attempts,
        )?;
        let spawn_backoff_base_seconds = resolve_u64(
            "WORKERS",
            "SPAWN_BACKOFF_BASE_SECONDS",
            workers.and_then(|w| w.spawn_backoff_base_seconds),
            defaults.spawn_retry.backoff_base_seconds,
        )?;
        let spawn_backoff_max_seconds = resolve_u64(
            "WORKERS",
            "SPAWN_BACKOFF_MAX_SECONDS",
            workers.and_then(|w| w.spawn_backoff_max_seconds),
            defaults.spawn_retry.backoff_max_seconds,
        )?;

        let task_stale_timeout_seconds = resolve_u64(
            "WORKERS",
            "TASK_STALE_TIMEOUT_SECONDS",
            workers.and_then(|w| w.task_stale_timeout_seconds),
            defaults.task_stale_timeout.as_secs(),
        )?;
        let heartbeat_stale_threshold_seconds = resolve_u64(
            "WORKERS",
            "HEARTBEAT_STALE_THRESHOLD_SECONDS",
            workers.and_then(|w| w.heartbeat_stale_threshold_seconds),
            defaults.heartbeat_stale_threshold.as_secs(),
        )?;

        let auto_respawn = resolve_bool(
            "WORKERS",
            "AUTO_RESPAWN",
            workers.and_then(|w| w.auto_respawn),
            defaults.auto_respawn,
        )?;
        let max_respawn_attempts = resolve_u32(
            "WORKERS",
            "MAX_RESPAWN_ATTEMPTS",
            workers.and_then(|w| w.max_respawn_attempts),
            defaults.max_respawn_attempts,
        )?;

        let backend_raw = if let Some(b) = &cli.backend {
            b.clone()
        } else if let Ok(b) = std::env::var("MAHA_BACKEND") {
            b
        } else {
            file.as_ref()
                .and_then(|f| f.backend.clone())
                .unwrap_or_else(|| "cooperative".to_string())
        };
        let backend = BackendKind::from_str(&backend_raw)?;

        let gates = file.as_ref().map(|f| f.gates.clone()).unwrap_or_default();

        let improvement_loop_max_iterations = resolve_u32(
            "IMPROVEMENT_LOOPS",
            "MAX_ITERATIONS",
            file.as_ref().and_then(|f| f.improvement_loops.max_iterations),
            1,
        )?;

        let verification_staleness_threshold_seconds = resolve_u64(
            "VERIFICATION",
            "STALENESS_THRESHOLD_SECONDS",
            file.as_ref().and_then(|f| f.verification.staleness_threshold_seconds),
            1800,
        )?;

        let scheduler = SchedulerConfig {
            max_concurrent,
            spawn_retry: crate::backend::SpawnRetryPolicy {
                max_attempts: spawn_retry_attempts,
                backoff_base_seconds: spawn_backoff_base_seconds,
                backoff_max_seconds: spawn_backoff_max_seconds,
            },
            task_stale_timeout: Duration::from_secs(task_stale_timeout_seconds),
            heartbeat_stale_threshold: Duration::from_secs(heartbeat_stale_threshold_seconds),
            auto_respawn,
            max_respawn_attempts,
            ..defaults
        };

        Ok(Self {
            scheduler,
            backend,
            gates,
            improvement_loop_max_iterations,
            verification_staleness_threshold: Duration::from_secs(
                verification_staleness_threshold_seconds,
            ),
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_clean_env<T>(f: impl FnOnce() -> T) -> T {
        let _guard = ENV_LOCK.lock().unwrap();
        for var in [
            "MAHA_WORKERS_MAX_CONCURRENT",
            "MAHA_BACKEND",
            "MAHA_WORKERS_AUTO_RESPAWN",
            "XDG_CONFIG_HOME",
        ] {
            unsafe { std::env::remove_var(var) };
        }
        let tmp = tempfile::TempDir::new().unwrap();
        unsafe { std::env::set_var("XDG_CONFIG_HOME", tmp.path()) };
        let result = f();
        unsafe { std::env::remove_var("XDG_CONFIG_HOME") };
        result
    }

    #[test]
    fn resolve_uses_defaults_when_nothing_set() {
        with_clean_env(|| {
            let config = MahaConfig::resolve(&CliOverrides::default()).unwrap();
            assert_eq!(config.scheduler.max_concurrent, SchedulerConfig::default().max_concurrent);
            assert_eq!(config.backend, BackendKind::Cooperative);
            assert!(config.gates.is_empty());
            assert_eq!(config.improvement_loop_max_iterations, 1);
            assert_eq!(config.verification_staleness_threshold, Duration::from_secs(1800));
        });
    }

    #[test]
    fn improvement_loop_and_verification_staleness_resolve_from_env() {
        with_clean_env(|| {
            unsafe { std::env::set_var("MAHA_IMPROVEMENT_LOOPS_MAX_ITERATIONS", "3") };
            unsafe { std::env::set_var("MAHA_VERIFICATION_STALENESS_THRESHOLD_SECONDS", "60") };
            let config = MahaConfig::resolve(&CliOverrides::default()).unwrap();
            assert_eq!(config.improvement_loop_max_iterations, 3);
            assert_eq!(config.verification_staleness_threshold, Duration::from_secs(60));
            unsafe { std::env::remove_var("MAHA_IMPROVEMENT_LOOPS_MAX_ITERATIONS") };
            unsafe { std::env::remove_var("MAHA_VERIFICATION_STALENESS_THRESHOLD_SECONDS") };
        });
    }

    #[test]
    fn cli_flag_overrides_env_and_default() {
        with_clean_env(|| {
            unsafe { std::env::set_var("MAHA_WORKERS_MAX_CONCURRENT", "9") };
            let overrides = CliOverrides {
                max_concurrent: Some(2),
                backend: None,
            };
            let config = MahaConfig::resolve(&overrides).unwrap();
            assert_eq!(config.scheduler.max_concurrent, 2);
            unsafe { std::env::remove_var("MAHA_WORKERS_MAX_CONCURRENT") };
        });
    }

    #[test]
    fn env_var_overrides_default_when_no_cli_flag() {
        with_clean_env(|| {
            unsafe { std::env::set_var("MAHA_WORKERS_MAX_CONCURRENT", "7") };
            let config = MahaConfig::resolve(&CliOverrides::default()).unwrap();
            assert_eq!(config.scheduler.max_concurrent, 7);
            unsafe { std::env::remove_var("MAHA_WORKERS_MAX_CONCURRENT") };
        });
    }

    #[test]
    fn unknown_backend_name_errors() {
        with_clean_env(|| {
            let overrides = CliOverrides {
                max_concurrent: None,
                backend: Some("quantum".to_string()),
            };
            let result = MahaConfig::resolve(&overrides);
            assert!(result.is_err());
        });
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        with_clean_env(|| {
            let path = config_path();
            assert!(path.ends_with("mahabharatha/config.toml"), "unexpected path: {}", path.display());
        });
    }
}
