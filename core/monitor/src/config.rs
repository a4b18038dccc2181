//! Monitor configuration.
//!
//! Read from `config.toml` in the state directory (or an explicit `--config`
//! path). Every section is optional; a missing default file means defaults.
//! CLI flags are applied on top by `main`.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detector::StepStartPolicy;
use crate::interval::{
    PollInterval, DEFAULT_BASE_SECS, DEFAULT_EMPTY_POLLS_PER_STEP, DEFAULT_MAX_SECS,
    DEFAULT_STEP_SECS,
};

pub const STATE_DIR_NAME: &str = ".civiewer";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const DEFAULT_API_URL: &str = "https://api.github.com";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Home directory not found; pass --state-dir")]
    HomeNotFound,

    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorConfig {
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollingConfig {
    pub base_interval_secs: u64,
    pub interval_step_secs: u64,
    pub max_interval_secs: u64,
    pub empty_polls_per_step: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            base_interval_secs: DEFAULT_BASE_SECS,
            interval_step_secs: DEFAULT_STEP_SECS,
            max_interval_secs: DEFAULT_MAX_SECS,
            empty_polls_per_step: DEFAULT_EMPTY_POLLS_PER_STEP,
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> PollInterval {
        PollInterval::new(
            Duration::from_secs(self.base_interval_secs),
            Duration::from_secs(self.interval_step_secs),
            Duration::from_secs(self.max_interval_secs),
            self.empty_polls_per_step,
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetectionConfig {
    pub step_started: StepStartPolicy,
    /// Print the first-run baseline as events instead of recording it quietly.
    pub announce_existing: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GithubConfig {
    pub api_url: String,
    pub max_attempts: u32,
    pub initial_retry_delay_ms: u64,
    pub per_page: u32,
    pub request_timeout_secs: u64,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            max_attempts: 3,
            initial_retry_delay_ms: 1_000,
            per_page: 100,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub state_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub file: Option<PathBuf>,
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let polling = &self.polling;
        if polling.base_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "polling.base_interval_secs must be greater than zero".to_string(),
            ));
        }
        if polling.max_interval_secs < polling.base_interval_secs {
            return Err(ConfigError::Invalid(format!(
                "polling.max_interval_secs ({}) must be at least base_interval_secs ({})",
                polling.max_interval_secs, polling.base_interval_secs
            )));
        }
        if polling.empty_polls_per_step == 0 {
            return Err(ConfigError::Invalid(
                "polling.empty_polls_per_step must be at least 1".to_string(),
            ));
        }

        let github = &self.github;
        if github.api_url.trim().is_empty() {
            return Err(ConfigError::Invalid("github.api_url is required".to_string()));
        }
        if github.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "github.max_attempts must be at least 1".to_string(),
            ));
        }
        if !(1..=100).contains(&github.per_page) {
            return Err(ConfigError::Invalid(format!(
                "github.per_page must be between 1 and 100, got {}",
                github.per_page
            )));
        }
        Ok(())
    }

    /// State directory from config, else `$HOME/.civiewer`.
    pub fn state_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.storage.state_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_state_dir(),
        }
    }
}

pub fn default_state_dir() -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
    Ok(home.join(STATE_DIR_NAME))
}

/// Loads `explicit` if given (it must exist), otherwise `config.toml` inside
/// `state_dir` when present, otherwise defaults.
pub fn load_config(explicit: Option<&Path>, state_dir: &Path) -> Result<MonitorConfig, ConfigError> {
    let config_path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let path = state_dir.join(CONFIG_FILE_NAME);
            if !path.exists() {
                return Ok(MonitorConfig::default());
            }
            path
        }
    };

    let content = fs_err::read_to_string(&config_path).map_err(|source| ConfigError::Read {
        path: config_path.clone(),
        source,
    })?;
    let config = toml::from_str::<MonitorConfig>(&content).map_err(|source| ConfigError::Parse {
        path: config_path.clone(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_file_missing() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let config = load_config(None, temp_dir.path()).expect("load config");
        assert_eq!(config.polling.base_interval_secs, 30);
        assert_eq!(config.polling.interval_step_secs, 10);
        assert_eq!(config.polling.max_interval_secs, 120);
        assert_eq!(config.detection.step_started, StepStartPolicy::Discovery);
        assert!(!config.detection.announce_existing);
        assert_eq!(config.github.api_url, DEFAULT_API_URL);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("missing.toml");
        let err = load_config(Some(&path), temp_dir.path()).expect_err("missing file");
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn parses_partial_file_from_state_dir() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        fs_err::write(
            temp_dir.path().join(CONFIG_FILE_NAME),
            r#"
[polling]
base_interval_secs = 15
max_interval_secs = 60

[detection]
step_started = "transition"
announce_existing = true

[github]
api_url = "http://127.0.0.1:9999"
max_attempts = 5
"#,
        )
        .expect("write config");

        let config = load_config(None, temp_dir.path()).expect("load config");
        assert_eq!(config.polling.base_interval_secs, 15);
        assert_eq!(config.polling.interval_step_secs, 10);
        assert_eq!(config.polling.max_interval_secs, 60);
        assert_eq!(config.detection.step_started, StepStartPolicy::Transition);
        assert!(config.detection.announce_existing);
        assert_eq!(config.github.api_url, "http://127.0.0.1:9999");
        assert_eq!(config.github.max_attempts, 5);
        assert_eq!(config.github.per_page, 100);
        assert_eq!(config.polling.interval().current(), Duration::from_secs(15));
    }

    #[test]
    fn rejects_unknown_keys() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("typo.toml");
        fs_err::write(&path, "[polling]\nbase_interval = 5\n").expect("write config");
        let err = load_config(Some(&path), temp_dir.path()).expect_err("unknown key");
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn rejects_inverted_interval_bounds() {
        let mut config = MonitorConfig::default();
        config.polling.base_interval_secs = 60;
        config.polling.max_interval_secs = 30;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = MonitorConfig::default();
        config.github.per_page = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn explicit_state_dir_wins() {
        let mut config = MonitorConfig::default();
        config.storage.state_dir = Some(PathBuf::from("/tmp/civiewer-test"));
        assert_eq!(
            config.state_dir().expect("state dir"),
            PathBuf::from("/tmp/civiewer-test")
        );
    }
}
