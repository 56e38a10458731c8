// src/export/warm.rs
//! Warm files: one immutable batch file per export.
//!
//! Files are written to a temp name, flushed to disk, then renamed into
//! place. Their creation time, format and record count go into a sidecar
//! `manifest.json`, so age is never derived from file names.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::record::{Record, Scalar};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const WARM_PREFIX: &str = "data_";
const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmFormat {
    #[default]
    Json,
    JsonGz,
    Csv,
}

impl WarmFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            WarmFormat::Json => "json",
            WarmFormat::JsonGz => "json.gz",
            WarmFormat::Csv => "csv",
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            WarmFormat::Json => "json",
            WarmFormat::JsonGz => "json_gz",
            WarmFormat::Csv => "csv",
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, WarmFormat::JsonGz)
    }

    /// Guess from a file name; used for files missing from the manifest.
    pub fn from_file_name(name: &str) -> Option<Self> {
        if name.ends_with(".json.gz") {
            Some(WarmFormat::JsonGz)
        } else if name.ends_with(".json") {
            Some(WarmFormat::Json)
        } else if name.ends_with(".csv") {
            Some(WarmFormat::Csv)
        } else {
            None
        }
    }
}

impl FromStr for WarmFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(WarmFormat::Json),
            "json_gz" | "json.gz" | "jsongz" => Ok(WarmFormat::JsonGz),
            "csv" | "columnar" => Ok(WarmFormat::Csv),
            other => bail!("unsupported warm format `{other}`"),
        }
    }
}

/// One exported record as it appears in a warm file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmEntry {
    pub merge_key: String,
    #[serde(flatten)]
    pub record: Record,
}

impl From<&Record> for WarmEntry {
    fn from(r: &Record) -> Self {
        Self {
            merge_key: r.merge_key(),
            record: r.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmFileMeta {
    pub file_name: String,
    pub created_at: DateTime<Utc>,
    pub record_count: usize,
    pub format: WarmFormat,
    pub bytes: u64,
}

// ------------------------------------------------------------
// Writer
// ------------------------------------------------------------

enum Sink {
    Json {
        w: BufWriter<File>,
        first: bool,
    },
    JsonGz {
        w: GzEncoder<BufWriter<File>>,
        first: bool,
    },
    Csv {
        w: csv::Writer<BufWriter<File>>,
        columns: Vec<String>,
    },
}

/// Streams batches into a temp file; [`WarmWriter::finish`] makes it durable
/// and visible. Dropping an unfinished writer removes the temp file.
pub struct WarmWriter {
    dir: PathBuf,
    tmp_path: PathBuf,
    format: WarmFormat,
    created_at: DateTime<Utc>,
    sink: Option<Sink>,
    count: usize,
}

impl WarmWriter {
    /// `columns` is the payload key set for CSV output (ignored otherwise).
    pub fn create(
        dir: &Path,
        format: WarmFormat,
        created_at: DateTime<Utc>,
        columns: Vec<String>,
    ) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating export dir {}", dir.display()))?;
        let tmp_path = dir.join(format!(
            ".{}{}{}",
            WARM_PREFIX,
            created_at.format("%Y%m%d_%H%M%S_%6f"),
            TMP_SUFFIX
        ));
        let file = File::create(&tmp_path)
            .with_context(|| format!("creating warm temp file {}", tmp_path.display()))?;
        let buf = BufWriter::new(file);
        let export_time = created_at.to_rfc3339();

        let sink = match format {
            WarmFormat::Json => {
                let mut w = buf;
                write!(w, "{{\"export_time\":\"{export_time}\",\"records\":[")?;
                Sink::Json { w, first: true }
            }
            WarmFormat::JsonGz => {
                let mut w = GzEncoder::new(buf, Compression::default());
                write!(w, "{{\"export_time\":\"{export_time}\",\"records\":[")?;
                Sink::JsonGz { w, first: true }
            }
            WarmFormat::Csv => {
                let mut w = csv::Writer::from_writer(buf);
                let mut header = vec![
                    "merge_key".to_string(),
                    "source".to_string(),
                    "fetched_at".to_string(),
                ];
                header.extend(columns.iter().cloned());
                w.write_record(&header).context("writing csv header")?;
                Sink::Csv { w, columns }
            }
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            tmp_path,
            format,
            created_at,
            sink: Some(sink),
            count: 0,
        })
    }

    pub fn write_batch(&mut self, batch: &[Record]) -> Result<()> {
        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| anyhow!("warm writer already finished"))?;
        match sink {
            Sink::Json { w, first } => write_json_entries(w, first, batch)?,
            Sink::JsonGz { w, first } => write_json_entries(w, first, batch)?,
            Sink::Csv { w, columns } => {
                for r in batch {
                    let mut row = Vec::with_capacity(columns.len() + 3);
                    row.push(r.merge_key());
                    row.push(r.source.to_string());
                    row.push(r.fetched_at.to_rfc3339());
                    for c in columns.iter() {
                        row.push(r.payload.get(c).map(Scalar::to_cell).unwrap_or_default());
                    }
                    w.write_record(&row).context("writing csv row")?;
                }
            }
        }
        self.count += batch.len();
        Ok(())
    }

    /// Close the envelope, fsync, and rename to the final name.
    pub fn finish(mut self) -> Result<WarmFileMeta> {
        let sink = self
            .sink
            .take()
            .ok_or_else(|| anyhow!("warm writer already finished"))?;
        let count = self.count;
        let file = match sink {
            Sink::Json { mut w, .. } => {
                write!(w, "\n],\"count\":{count}}}\n")?;
                w.into_inner().map_err(|e| e.into_error())?
            }
            Sink::JsonGz { mut w, .. } => {
                write!(w, "\n],\"count\":{count}}}\n")?;
                let buf = w.finish().context("finishing gzip stream")?;
                buf.into_inner().map_err(|e| e.into_error())?
            }
            Sink::Csv { w, .. } => {
                let buf = w
                    .into_inner()
                    .map_err(|e| anyhow!("flushing csv writer: {}", e.error()))?;
                buf.into_inner().map_err(|e| e.into_error())?
            }
        };
        file.sync_all().context("syncing warm file")?;
        drop(file);

        let final_path = unique_path(
            &self.dir,
            &format!(
                "{}{}_{}",
                WARM_PREFIX,
                self.created_at.format("%Y%m%d_%H%M%S"),
                count
            ),
            self.format.extension(),
        );
        fs::rename(&self.tmp_path, &final_path).with_context(|| {
            format!(
                "renaming {} -> {}",
                self.tmp_path.display(),
                final_path.display()
            )
        })?;
        sync_dir(&self.dir);

        let bytes = fs::metadata(&final_path).map(|m| m.len()).unwrap_or(0);
        let file_name = final_path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        debug!(file = %file_name, count, "warm file written");
        Ok(WarmFileMeta {
            file_name,
            created_at: self.created_at,
            record_count: count,
            format: self.format,
            bytes,
        })
    }
}

impl Drop for WarmWriter {
    fn drop(&mut self) {
        if self.sink.is_some() {
            self.sink = None;
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

fn write_json_entries<W: Write>(w: &mut W, first: &mut bool, batch: &[Record]) -> Result<()> {
    for r in batch {
        if *first {
            w.write_all(b"\n")?;
            *first = false;
        } else {
            w.write_all(b",\n")?;
        }
        serde_json::to_writer(&mut *w, &WarmEntry::from(r)).context("serializing warm entry")?;
    }
    Ok(())
}

fn unique_path(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    let mut candidate = dir.join(format!("{stem}.{ext}"));
    let mut n = 1;
    while candidate.exists() {
        candidate = dir.join(format!("{stem}-{n}.{ext}"));
        n += 1;
    }
    candidate
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

/// Sorted union of payload keys across records (CSV columns).
pub fn collect_columns<'a>(records: impl IntoIterator<Item = &'a Record>, into: &mut BTreeSet<String>) {
    for r in records {
        for k in r.payload.keys() {
            if !into.contains(k) {
                into.insert(k.clone());
            }
        }
    }
}

// ------------------------------------------------------------
// Reader
// ------------------------------------------------------------

#[derive(Deserialize)]
struct Envelope {
    records: Vec<WarmEntry>,
}

/// Decode a warm (or archived) file back into entries. CSV cells come back
/// as text; empty cells are omitted.
pub fn read_warm_file(path: &Path) -> Result<Vec<WarmEntry>> {
    let file_name = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    // Archived csv is `<name>.csv.gz`; archived json is `<name>.json.gz`.
    let name = match file_name.strip_suffix(".gz") {
        Some(base) if !base.ends_with(".json") => base.to_string(),
        _ => file_name.clone(),
    };
    let gzipped = file_name.ends_with(".gz");
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader: Box<dyn Read> = if gzipped {
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };

    let format = WarmFormat::from_file_name(&name)
        .ok_or_else(|| anyhow!("unrecognized warm file {}", path.display()))?;
    match format {
        WarmFormat::Json | WarmFormat::JsonGz => {
            let env: Envelope = serde_json::from_reader(reader)
                .with_context(|| format!("decoding {}", path.display()))?;
            Ok(env.records)
        }
        WarmFormat::Csv => read_csv_entries(reader),
    }
}

fn read_csv_entries(reader: Box<dyn Read>) -> Result<Vec<WarmEntry>> {
    let mut rdr = csv::Reader::from_reader(reader);
    let headers = rdr.headers().context("reading csv header")?.clone();
    let mut out = Vec::new();
    for row in rdr.records() {
        let row = row.context("reading csv row")?;
        let mut payload = BTreeMap::new();
        for (h, v) in headers.iter().zip(row.iter()).skip(3) {
            if !v.is_empty() {
                payload.insert(h.to_string(), Scalar::Text(v.to_string()));
            }
        }
        let source = row.get(1).unwrap_or_default().parse()?;
        let fetched_at = DateTime::parse_from_rfc3339(row.get(2).unwrap_or_default())
            .context("parsing fetched_at")?
            .with_timezone(&Utc);
        out.push(WarmEntry {
            merge_key: row.get(0).unwrap_or_default().to_string(),
            record: Record::at(source, fetched_at, payload),
        });
    }
    Ok(out)
}

// ------------------------------------------------------------
// Manifest
// ------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub files: Vec<WarmFileMeta>,
}

impl Manifest {
    /// Missing manifest → empty; corrupt manifest → empty with a warning
    /// (ages then fall back to file mtimes).
    pub fn load(dir: &Path) -> Self {
        let path = dir.join(MANIFEST_FILE);
        match fs::read_to_string(&path) {
            Ok(s) => serde_json::from_str(&s).unwrap_or_else(|e| {
                warn!(error = %e, path = %path.display(), "manifest unreadable; falling back to mtimes");
                Self::default()
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                warn!(error = %e, path = %path.display(), "manifest unreadable; falling back to mtimes");
                Self::default()
            }
        }
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let path = dir.join(MANIFEST_FILE);
        let tmp = dir.join(format!("{MANIFEST_FILE}{TMP_SUFFIX}"));
        let s = serde_json::to_string_pretty(self)?;
        let mut f = File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
        f.write_all(s.as_bytes())?;
        f.sync_all()?;
        fs::rename(&tmp, &path).with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }

    pub fn get(&self, file_name: &str) -> Option<&WarmFileMeta> {
        self.files.iter().find(|m| m.file_name == file_name)
    }

    pub fn upsert(&mut self, meta: WarmFileMeta) {
        self.files.retain(|m| m.file_name != meta.file_name);
        self.files.push(meta);
        self.files.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.file_name.cmp(&b.file_name))
        });
    }

    pub fn remove(&mut self, file_name: &str) -> bool {
        let before = self.files.len();
        self.files.retain(|m| m.file_name != file_name);
        self.files.len() != before
    }
}

/// Every warm file in `dir`: manifest entries plus any `data_*` file the
/// manifest does not know about (aged by mtime). Manifest entries whose file
/// is gone are omitted.
pub fn list_warm_files(dir: &Path, manifest: &Manifest) -> Result<Vec<WarmFileMeta>> {
    let mut out: Vec<WarmFileMeta> = Vec::new();
    let mut seen = BTreeSet::new();

    for m in &manifest.files {
        if dir.join(&m.file_name).exists() {
            seen.insert(m.file_name.clone());
            out.push(m.clone());
        }
    }

    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e).with_context(|| format!("listing {}", dir.display())),
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(WARM_PREFIX) || seen.contains(&name) {
            continue;
        }
        let Some(format) = WarmFormat::from_file_name(&name) else {
            continue;
        };
        let Ok(md) = entry.metadata() else { continue };
        if !md.is_file() {
            continue;
        }
        let created_at = md
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        out.push(WarmFileMeta {
            file_name: name,
            created_at,
            record_count: 0,
            format,
            bytes: md.len(),
        });
    }
    out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(out)
}

/// Export statistics over the warm tier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WarmInventory {
    pub total_files: usize,
    pub total_bytes: u64,
    pub total_records: usize,
    pub by_format: BTreeMap<String, usize>,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

pub fn warm_inventory(dir: &Path) -> Result<WarmInventory> {
    let manifest = Manifest::load(dir);
    let files = list_warm_files(dir, &manifest)?;
    let mut inv = WarmInventory::default();
    for f in &files {
        inv.total_files += 1;
        inv.total_bytes += f.bytes;
        inv.total_records += f.record_count;
        *inv.by_format.entry(f.format.tag().to_string()).or_insert(0) += 1;
        inv.oldest = Some(inv.oldest.map_or(f.created_at, |o| o.min(f.created_at)));
        inv.newest = Some(inv.newest.map_or(f.created_at, |n| n.max(f.created_at)));
    }
    Ok(inv)
}
