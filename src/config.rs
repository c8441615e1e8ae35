use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisposalMode {
    Backup,
    Trash,
    Delete,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub watch_dir: PathBuf,
    pub output_dir: PathBuf,
    pub tool_path: PathBuf,
    pub tool_format: String,
    pub tool_device: String,
    pub tool_extra_args: Vec<String>,
    pub subtitle_extension: String,
    pub video_extensions: Vec<String>,
    pub poll_interval_secs: u64,
    pub disposal_mode: DisposalMode,
    pub backup_dir_name: String,
    pub disposal_attempts: u32,
    pub disposal_retry_delay_ms: u64,
    pub capability_tier: String,
    pub detect_capability: bool,
    pub tier_ceilings: BTreeMap<String, usize>,
    pub stale_timeout_secs: u64,
    pub stuck_timeout_secs: u64,
    pub failure_timeout_secs: u64,
    pub settle_interval_ms: u64,
    pub min_artifact_bytes: u64,
    pub max_attempts: Option<u32>,
    pub ledger_path: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub wake_on_change: bool,
}

impl Default for Config {
    fn default() -> Self {
        let video_extensions = ["mp4", "avi", "mkv", "mov", "wmv", "flv", "m4v", "webm"]
            .iter()
            .map(|ext| ext.to_string())
            .collect();
        let tier_ceilings = [
            ("integrated", 1),
            ("entry", 2),
            ("midrange", 4),
            ("high_end", 6),
            ("professional", 8),
        ]
        .iter()
        .map(|(tier, max)| (tier.to_string(), *max))
        .collect();
        Self {
            watch_dir: PathBuf::from("downloads"),
            output_dir: PathBuf::from("subtitles"),
            tool_path: PathBuf::from("infer"),
            tool_format: "srt".to_string(),
            tool_device: "cuda".to_string(),
            tool_extra_args: Vec::new(),
            subtitle_extension: "srt".to_string(),
            video_extensions,
            poll_interval_secs: 10,
            disposal_mode: DisposalMode::Backup,
            backup_dir_name: "processed_backup".to_string(),
            disposal_attempts: 3,
            disposal_retry_delay_ms: 5_000,
            capability_tier: "entry".to_string(),
            detect_capability: true,
            tier_ceilings,
            stale_timeout_secs: 2 * 60 * 60,
            stuck_timeout_secs: 2 * 60 * 60,
            failure_timeout_secs: 30 * 60,
            settle_interval_ms: 2_000,
            min_artifact_bytes: 100,
            max_attempts: None,
            ledger_path: None,
            log_file: None,
            wake_on_change: true,
        }
    }
}

impl Config {
    /// Never below one second, so a zero setting cannot spin the loop.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs)
    }

    pub fn stuck_timeout(&self) -> Duration {
        Duration::from_secs(self.stuck_timeout_secs)
    }

    pub fn failure_timeout(&self) -> Duration {
        Duration::from_secs(self.failure_timeout_secs)
    }

    pub fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_interval_ms)
    }

    pub fn disposal_retry_delay(&self) -> Duration {
        Duration::from_millis(self.disposal_retry_delay_ms)
    }

    pub fn resolved_ledger_path(&self) -> Result<PathBuf> {
        match &self.ledger_path {
            Some(path) => Ok(path.clone()),
            None => Ok(default_data_dir()?.join("ledger.json")),
        }
    }

    /// Problems that keep ticks from doing useful work. None of them stop the loop.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if !self.watch_dir.is_dir() {
            issues.push(format!("watch dir does not exist: {}", self.watch_dir.display()));
        }
        if !self.output_dir.is_dir() {
            issues.push(format!(
                "output dir does not exist: {}",
                self.output_dir.display()
            ));
        }
        if !self.tool_path.exists() {
            issues.push(format!(
                "subtitle tool does not exist: {}",
                self.tool_path.display()
            ));
        }
        if self.video_extensions.is_empty() {
            issues.push("no video extensions configured".to_string());
        }
        if !self.tier_ceilings.contains_key(&self.capability_tier) {
            issues.push(format!(
                "capability tier '{}' has no ceiling entry",
                self.capability_tier
            ));
        }
        if self.poll_interval_secs == 0 {
            issues.push("poll interval is zero".to_string());
        }
        issues
    }
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new() -> Result<Self> {
        let base = BaseDirs::new().context("unable to resolve home directory")?;
        let path = base.home_dir().join(".config").join("subwatch.yaml");
        Ok(Self { path })
    }

    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn load(&self) -> Result<Config> {
        if !self.path.exists() {
            return Ok(Config::default());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read config {}", self.path.display()))?;
        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("parse config {}", self.path.display()))?;
        Ok(config)
    }

    pub fn save(&self, config: &Config) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create config dir {}", parent.display()))?;
        }
        let contents = serde_yaml::to_string(config)?;
        fs::write(&self.path, contents)
            .with_context(|| format!("write config {}", self.path.display()))?;
        Ok(())
    }
}

pub fn default_data_dir() -> Result<PathBuf> {
    let proj =
        directories::ProjectDirs::from("com", "subwatch", "subwatch").context("resolve data dir")?;
    Ok(proj.data_dir().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn config_roundtrip() -> Result<()> {
        let dir = tempdir()?;
        let store = ConfigStore::at(dir.path().join("subwatch.yaml"));
        let mut cfg = Config::default();
        cfg.watch_dir = PathBuf::from("input");
        cfg.output_dir = PathBuf::from("output");
        cfg.disposal_mode = DisposalMode::Trash;
        cfg.capability_tier = "high_end".to_string();
        cfg.max_attempts = Some(5);
        cfg.tool_extra_args = vec!["--language=ja".to_string()];
        store.save(&cfg)?;
        let loaded = store.load()?;
        assert_eq!(loaded.watch_dir, cfg.watch_dir);
        assert_eq!(loaded.output_dir, cfg.output_dir);
        assert_eq!(loaded.disposal_mode, DisposalMode::Trash);
        assert_eq!(loaded.capability_tier, "high_end");
        assert_eq!(loaded.max_attempts, Some(5));
        assert_eq!(loaded.tool_extra_args, cfg.tool_extra_args);
        assert_eq!(loaded.tier_ceilings, cfg.tier_ceilings);
        Ok(())
    }

    #[test]
    fn partial_file_uses_defaults() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("subwatch.yaml");
        fs::write(&path, "watch_dir: /data/in\ndisposal_mode: delete\n")?;
        let loaded = ConfigStore::at(path).load()?;
        assert_eq!(loaded.watch_dir, PathBuf::from("/data/in"));
        assert_eq!(loaded.disposal_mode, DisposalMode::Delete);
        assert_eq!(loaded.poll_interval_secs, 10);
        assert_eq!(loaded.failure_timeout(), Duration::from_secs(1800));
        assert_eq!(loaded.tier_ceilings.get("entry"), Some(&2));
        Ok(())
    }

    #[test]
    fn missing_file_yields_defaults() -> Result<()> {
        let dir = tempdir()?;
        let loaded = ConfigStore::at(dir.path().join("absent.yaml")).load()?;
        assert_eq!(loaded.subtitle_extension, "srt");
        assert!(loaded.wake_on_change);
        Ok(())
    }

    #[test]
    fn zero_poll_interval_is_clamped() {
        let mut cfg = Config::default();
        cfg.poll_interval_secs = 0;
        assert_eq!(cfg.poll_interval(), Duration::from_secs(1));
        assert!(cfg.validate().iter().any(|i| i.contains("poll interval")));
    }

    #[test]
    fn validate_reports_missing_paths() -> Result<()> {
        let dir = tempdir()?;
        let mut cfg = Config::default();
        cfg.watch_dir = dir.path().join("nope");
        cfg.output_dir = dir.path().to_path_buf();
        cfg.tool_path = dir.path().join("tool");
        cfg.capability_tier = "quantum".to_string();
        let issues = cfg.validate();
        assert!(issues.iter().any(|i| i.starts_with("watch dir")));
        assert!(!issues.iter().any(|i| i.starts_with("output dir")));
        assert!(issues.iter().any(|i| i.starts_with("subtitle tool")));
        assert!(issues.iter().any(|i| i.contains("quantum")));
        Ok(())
    }
}
