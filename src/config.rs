// src/config.rs
//! Pipeline configuration: one TOML file, read once at startup.
//!
//! Lookup order:
//! 1) `$PIPELINE_CONFIG_PATH` (must exist when set)
//! 2) `config/pipeline.toml`
//! 3) built-in defaults
//!
//! Every field has a default, so an empty file is a valid config.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

use crate::export::{ExportSettings, RetentionPolicy, WarmFormat};
use crate::quota::{QuotaPeriod, QuotaSpec};
use crate::record::SourceKind;
use crate::worker::WorkerOptions;

pub const ENV_PATH: &str = "PIPELINE_CONFIG_PATH";
pub const DEFAULT_PATH: &str = "config/pipeline.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub store: StoreConfig,
    pub export: ExportConfig,
    pub archive: ArchiveConfig,
    pub quota: QuotaConfig,
    pub api: ApiConfig,
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON-Lines snapshot; unset keeps the hot store in memory only.
    pub snapshot_path: Option<PathBuf>,
    pub slim_mode: bool,
    /// Fraction of `export.max_keep` each source may occupy.
    pub source_shares: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub enabled: bool,
    pub dir: PathBuf,
    pub format: WarmFormat,
    pub queue_threshold: usize,
    pub memory_threshold_mb: u64,
    pub time_interval_minutes: u64,
    pub max_keep: usize,
    pub batch_size: usize,
    pub check_interval_secs: u64,
    pub export_on_append: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("exports"),
            format: WarmFormat::Json,
            queue_threshold: 1000,
            memory_threshold_mb: 50,
            time_interval_minutes: 30,
            max_keep: 500,
            batch_size: 1000,
            check_interval_secs: 60,
            export_on_append: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub enabled: bool,
    pub retention_days: u32,
    pub archive_retention_days: Option<u32>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: 7,
            archive_retention_days: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Ledger snapshot; unset means usage resets on restart.
    pub state_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen: Option<SocketAddr>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub name: String,
    pub enabled: bool,
    pub interval_secs: u64,
    /// Unset = unbounded.
    pub capacity: Option<u64>,
    pub period: QuotaPeriod,
    pub units_per_fetch: u64,
    pub feeds: Vec<FeedConfig>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: true,
            interval_secs: 900,
            capacity: None,
            period: QuotaPeriod::Daily,
            units_per_fetch: 1,
            feeds: Vec::new(),
        }
    }
}

impl SourceConfig {
    pub fn kind(&self) -> Result<SourceKind> {
        self.name
            .parse()
            .with_context(|| format!("source `{}`", self.name))
    }

    pub fn quota_spec(&self) -> QuotaSpec {
        QuotaSpec {
            capacity: self.capacity,
            period: self.period,
            units_per_fetch: self.units_per_fetch,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FeedConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub category: Option<String>,
}

impl PipelineConfig {
    /// Load from an explicit path and validate.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let cfg = Self::parse(&content).with_context(|| format!("parsing {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Env var, then `config/pipeline.toml`, then defaults.
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            }
            return Err(anyhow!("{ENV_PATH} points to non-existent path"));
        }
        let default = PathBuf::from(DEFAULT_PATH);
        if default.exists() {
            return Self::load_from(&default);
        }
        Ok(Self::default())
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn validate(&self) -> Result<()> {
        let e = &self.export;
        if e.max_keep == 0 {
            bail!("export.max_keep must be > 0");
        }
        if e.batch_size == 0 {
            bail!("export.batch_size must be > 0");
        }
        if e.check_interval_secs == 0 {
            bail!("export.check_interval_secs must be > 0");
        }
        if self.archive.retention_days == 0 {
            bail!("archive.retention_days must be > 0");
        }

        let mut seen = BTreeSet::new();
        for s in &self.sources {
            let kind = s.kind()?;
            if !seen.insert(kind) {
                bail!("source `{}` is configured twice", s.name);
            }
            if s.interval_secs == 0 {
                bail!("source `{}`: interval_secs must be > 0", s.name);
            }
            if s.units_per_fetch == 0 {
                bail!("source `{}`: units_per_fetch must be > 0", s.name);
            }
        }

        for (name, share) in &self.store.source_shares {
            name.parse::<SourceKind>()
                .with_context(|| format!("store.source_shares.{name}"))?;
            if !(*share > 0.0 && *share <= 1.0) {
                bail!("store.source_shares.{name} must be in (0, 1], got {share}");
            }
        }
        Ok(())
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn export_settings(&self) -> ExportSettings {
        let e = &self.export;
        ExportSettings {
            dir: e.dir.clone(),
            format: e.format,
            queue_threshold: e.queue_threshold,
            memory_threshold_bytes: e.memory_threshold_mb.saturating_mul(1024 * 1024),
            time_interval: Duration::from_secs(e.time_interval_minutes.saturating_mul(60)),
            max_keep: e.max_keep,
            batch_size: e.batch_size,
            check_interval: Duration::from_secs(e.check_interval_secs),
            retention: RetentionPolicy {
                retention_days: self.archive.retention_days,
                archive_enabled: self.archive.enabled,
                archive_retention_days: self.archive.archive_retention_days,
            },
        }
    }

    /// Slim mode plus the source's share of `max_keep`, if one is set.
    pub fn worker_options(&self, kind: SourceKind) -> WorkerOptions {
        let share_limit = self
            .store
            .source_shares
            .iter()
            .find(|(name, _)| name.parse::<SourceKind>().ok() == Some(kind))
            .map(|(_, f)| (self.export.max_keep as f64 * f).floor() as usize);
        WorkerOptions {
            slim_mode: self.store.slim_mode,
            share_limit,
        }
    }
}
