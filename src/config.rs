use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf};

use crate::cluster::election::DEFAULT_ELECTOR_SHIFT;
use crate::error::SchedError;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterConfig {
    #[serde(default = "default_elector_shift")]
    pub elector_shift: i64,
    #[serde(default = "default_buddy_backup_root")]
    pub buddy_backup_root: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Namespace of the scheduler's timers in the replicated store
    #[serde(default = "default_scheduler_name")]
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    /// Upper bound on locally armed tasks, 0 for unbounded
    #[serde(default)]
    pub max_armed_tasks: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub console: bool,
    #[serde(default = "default_max_log_files")]
    pub max_log_files: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            elector_shift: default_elector_shift(),
            buddy_backup_root: default_buddy_backup_root(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: default_scheduler_name(),
            priority: 0,
            max_armed_tasks: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: None,
            console: default_true(),
            max_log_files: default_max_log_files(),
        }
    }
}

fn default_elector_shift() -> i64 {
    DEFAULT_ELECTOR_SHIFT
}

fn default_buddy_backup_root() -> String {
    "/_BUDDY_BACKUP_".to_string()
}

fn default_scheduler_name() -> String {
    "timers".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_log_files() -> usize {
    7
}

impl Config {
    pub fn load() -> Result<Self, SchedError> {
        let config_paths = [
            PathBuf::from("ftsched.yml"),
            dirs::config_dir()
                .map(|p| p.join("ftsched/ftsched.yml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/ftsched/ftsched.yml"),
        ];

        for path in &config_paths {
            if path.is_file() {
                return Self::load_from_file(path);
            }
        }

        Ok(Self::default())
    }

    pub fn load_from_file(path: &Path) -> Result<Self, SchedError> {
        let content = fs::read_to_string(path)
            .map_err(|e| SchedError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_yaml::from_str(&content)
            .map_err(|e| SchedError::Config(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SchedError> {
        if self.scheduler.name.is_empty() || self.scheduler.name.contains('/') {
            return Err(SchedError::Config(format!(
                "Scheduler name must be a single non-empty path element: {:?}",
                self.scheduler.name
            )));
        }
        if !self.cluster.buddy_backup_root.starts_with('/') {
            return Err(SchedError::Config(format!(
                "Buddy backup root must be an absolute path: {}",
                self.cluster.buddy_backup_root
            )));
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<(), SchedError> {
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| SchedError::Config(format!("Failed to serialize config: {}", e)))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| SchedError::Config(format!("Failed to create config directory: {}", e)))?;
        }

        // Write atomically using a temporary file
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, yaml)
            .map_err(|e| SchedError::Config(format!("Failed to write config: {}", e)))?;

        fs::rename(&temp_path, path)
            .map_err(|e| SchedError::Config(format!("Failed to save config: {}", e)))?;

        Ok(())
    }
}
