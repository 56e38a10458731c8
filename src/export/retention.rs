// src/export/retention.rs
//! Retention: warm files past the cutoff are archived (gzip under
//! `archive/`) or deleted. Archives are only removed by the explicit cold
//! sweep. A failure on one file is logged and skipped; the sweep goes on.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use metrics::counter;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::warm::{list_warm_files, Manifest, WarmFileMeta, WarmFormat, WARM_PREFIX};

pub const ARCHIVE_DIR: &str = "archive";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub retention_days: u32,
    pub archive_enabled: bool,
    /// Cold archives older than this are deleted; `None` keeps them forever.
    pub archive_retention_days: Option<u32>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            retention_days: 7,
            archive_enabled: true,
            archive_retention_days: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub archived: usize,
    pub deleted: usize,
    pub failed: usize,
    pub bytes_freed: u64,
    pub cold_deleted: usize,
    /// Half-written `.data_*.tmp` files left by an interrupted write.
    pub temps_removed: usize,
}

pub fn archive_dir(export_dir: &Path) -> PathBuf {
    export_dir.join(ARCHIVE_DIR)
}

/// Retire every warm file created before `now - retention_days`, then run
/// the cold sweep if one is configured.
pub fn sweep(export_dir: &Path, policy: &RetentionPolicy, now: DateTime<Utc>) -> Result<SweepReport> {
    let cutoff = now - ChronoDuration::days(i64::from(policy.retention_days));
    let mut report = SweepReport {
        temps_removed: remove_stale_temps(export_dir),
        ..Default::default()
    };
    let mut manifest = Manifest::load(export_dir);
    let files = list_warm_files(export_dir, &manifest)?;
    let mut archive_manifest = policy
        .archive_enabled
        .then(|| Manifest::load(&archive_dir(export_dir)));

    for meta in files.iter().filter(|m| m.created_at < cutoff) {
        let outcome = match archive_manifest.as_mut() {
            Some(am) => archive_one(export_dir, meta).map(|archived| {
                am.upsert(archived);
                true
            }),
            None => delete_one(export_dir, meta).map(|_| false),
        };
        match outcome {
            Ok(archived) => {
                manifest.remove(&meta.file_name);
                report.bytes_freed += meta.bytes;
                if archived {
                    report.archived += 1;
                } else {
                    report.deleted += 1;
                }
            }
            Err(e) => {
                report.failed += 1;
                warn!(file = %meta.file_name, error = ?e, "retention: skipping file");
            }
        }
    }

    // Drop entries whose files vanished outside the sweep.
    manifest
        .files
        .retain(|m| export_dir.join(&m.file_name).exists());
    if let Err(e) = manifest.save(export_dir) {
        warn!(error = ?e, "retention: manifest update failed");
    }
    if let Some(am) = archive_manifest {
        if let Err(e) = am.save(&archive_dir(export_dir)) {
            warn!(error = ?e, "retention: archive manifest update failed");
        }
    }

    if let Some(days) = policy.archive_retention_days {
        match sweep_archive(export_dir, days, now) {
            Ok((deleted, failed)) => {
                report.cold_deleted = deleted;
                report.failed += failed;
            }
            Err(e) => warn!(error = ?e, "cold archive sweep failed"),
        }
    }

    counter!("retention_archived_total").increment(report.archived as u64);
    counter!("retention_deleted_total").increment((report.deleted + report.cold_deleted) as u64);
    counter!("retention_failures_total").increment(report.failed as u64);
    info!(
        target: "pipeline",
        archived = report.archived,
        deleted = report.deleted,
        cold_deleted = report.cold_deleted,
        failed = report.failed,
        temps_removed = report.temps_removed,
        bytes_freed = report.bytes_freed,
        "retention sweep completed"
    );
    Ok(report)
}

/// Sweeps run inside the exporter cycle, so no warm write is in flight and
/// any dot-prefixed warm temp file is debris from a crash.
fn remove_stale_temps(export_dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(export_dir) else {
        return 0;
    };
    let prefix = format!(".{WARM_PREFIX}");
    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(&prefix) || !name.ends_with(".tmp") {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => {
                removed += 1;
                debug!(file = %name, "removed stale warm temp file");
            }
            Err(e) => warn!(file = %name, error = %e, "could not remove stale warm temp file"),
        }
    }
    removed
}

fn delete_one(export_dir: &Path, meta: &WarmFileMeta) -> Result<()> {
    let path = export_dir.join(&meta.file_name);
    fs::remove_file(&path).with_context(|| format!("deleting {}", path.display()))?;
    debug!(file = %meta.file_name, "warm file deleted");
    Ok(())
}

/// Compress one warm file into the archive and remove the original.
/// Returns the archive's metadata, keyed by the original export time.
fn archive_one(export_dir: &Path, meta: &WarmFileMeta) -> Result<WarmFileMeta> {
    let src = export_dir.join(&meta.file_name);
    let dir = archive_dir(export_dir);
    fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

    let target_name = if meta.format.is_compressed() {
        meta.file_name.clone()
    } else {
        format!("{}.gz", meta.file_name)
    };
    let target = dir.join(&target_name);

    if target.exists() {
        debug!(file = %meta.file_name, "archive already present; keeping it");
        fs::remove_file(&src).with_context(|| format!("deleting {}", src.display()))?;
    } else if meta.format.is_compressed() {
        fs::rename(&src, &target)
            .with_context(|| format!("moving {} -> {}", src.display(), target.display()))?;
    } else {
        gzip_into(&src, &target)?;
        fs::remove_file(&src).with_context(|| format!("deleting {}", src.display()))?;
    }

    let bytes = fs::metadata(&target).map(|m| m.len()).unwrap_or(0);
    debug!(file = %meta.file_name, archive = %target_name, bytes, "warm file archived");
    Ok(WarmFileMeta {
        file_name: target_name,
        created_at: meta.created_at,
        record_count: meta.record_count,
        format: meta.format,
        bytes,
    })
}

fn gzip_into(src: &Path, target: &Path) -> Result<()> {
    let tmp = target.with_extension("gz.tmp");
    let result = (|| -> Result<()> {
        let mut input = BufReader::new(
            File::open(src).with_context(|| format!("opening {}", src.display()))?,
        );
        let out = File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
        let mut enc = GzEncoder::new(BufWriter::new(out), Compression::best());
        io::copy(&mut input, &mut enc).context("compressing warm file")?;
        let out = enc
            .finish()
            .context("finishing gzip stream")?
            .into_inner()
            .map_err(|e| e.into_error())?;
        out.sync_all()?;
        fs::rename(&tmp, target)
            .with_context(|| format!("renaming {} -> {}", tmp.display(), target.display()))?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Delete cold archives whose original export is older than `days`.
/// Archives the manifest does not know about are aged by mtime.
/// Returns `(deleted, failed)`.
pub fn sweep_archive(export_dir: &Path, days: u32, now: DateTime<Utc>) -> Result<(usize, usize)> {
    let dir = archive_dir(export_dir);
    let cutoff = now - ChronoDuration::days(i64::from(days));
    let mut manifest = Manifest::load(&dir);

    let entries = match fs::read_dir(&dir) {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((0, 0)),
        Err(e) => return Err(e).with_context(|| format!("listing {}", dir.display())),
    };

    let (mut deleted, mut failed) = (0, 0);
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(WARM_PREFIX)
            || name.ends_with(".tmp")
            || WarmFormat::from_file_name(name.trim_end_matches(".gz")).is_none()
        {
            continue;
        }
        let created_at = match manifest.get(&name) {
            Some(m) => m.created_at,
            None => match entry.metadata().and_then(|m| m.modified()) {
                Ok(t) => DateTime::<Utc>::from(t),
                Err(_) => continue,
            },
        };
        if created_at >= cutoff {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => {
                manifest.remove(&name);
                deleted += 1;
            }
            Err(e) => {
                failed += 1;
                warn!(file = %name, error = %e, "cold sweep: skipping archive");
            }
        }
    }
    if deleted > 0 {
        if let Err(e) = manifest.save(&dir) {
            warn!(error = ?e, "cold sweep: archive manifest update failed");
        }
    }
    Ok((deleted, failed))
}
