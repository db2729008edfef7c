//! Capture log: one JSON line per classified request, written to an
//! append-only file with size-based rotation and optionally mirrored to the
//! tracing output.

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use crate::request::IncomingRequest;
use crate::scoring::Classification;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationConfig {
    pub max_bytes: Option<u64>,
    pub keep: usize,
    pub compress: bool,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_bytes: None,
            keep: 1,
            compress: false,
        }
    }
}

/// Size-based rotating writer.  Backups are `<path>.1` .. `<path>.<keep>`,
/// newest first, each with a `.gz` suffix when compression is on.
pub struct RotatingWriter {
    path: PathBuf,
    file: fs::File,
    rotation: RotationConfig,
}

impl RotatingWriter {
    pub fn open(path: &str, rotation: RotationConfig) -> std::io::Result<Self> {
        let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: PathBuf::from(path),
            file,
            rotation,
        })
    }

    pub fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        if let Some(limit) = self.rotation.max_bytes {
            if self.current_size().is_some_and(|len| len >= limit) {
                self.rotate();
            }
        }
        writeln!(self.file, "{}", line)
    }

    pub fn current_size(&self) -> Option<u64> {
        self.path.metadata().ok().map(|m| m.len())
    }

    fn backup_path(&self, idx: usize) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{idx}"));
        PathBuf::from(name)
    }

    /// Final name of backup `idx`: `.gz` appended when compressing.
    fn stored_backup_path(&self, idx: usize) -> PathBuf {
        let mut name = self.backup_path(idx).into_os_string();
        if self.rotation.compress {
            name.push(".gz");
        }
        PathBuf::from(name)
    }

    fn rotate(&mut self) {
        if self.rotation.keep > 0 {
            for idx in (2..=self.rotation.keep).rev() {
                let older = self.stored_backup_path(idx - 1);
                if older.exists() {
                    let _ = fs::rename(&older, self.stored_backup_path(idx));
                }
            }
            let _ = fs::rename(&self.path, self.backup_path(1));
            if self.rotation.compress {
                self.compress_latest_backup();
            }
        }
        match fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
        {
            Ok(file) => self.file = file,
            Err(err) => tracing::warn!(error = %err, path = %self.path.display(), "failed to reopen capture log"),
        }
    }

    fn compress_latest_backup(&self) {
        let rotated = self.backup_path(1);
        let Ok(data) = fs::read(&rotated) else {
            return;
        };
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        if gz.write_all(&data).is_ok() {
            if let Ok(buf) = gz.finish() {
                if fs::write(self.stored_backup_path(1), buf).is_ok() {
                    let _ = fs::remove_file(&rotated);
                }
            }
        }
    }
}

/// One capture log record.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRecord<'a> {
    pub schema_version: u32,
    pub ts: String,
    pub actor: &'a str,
    pub method: &'a str,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub threat_level: u8,
    pub acceptable: bool,
    pub mode: &'a str,
    pub sub_scores: &'a [(&'static str, u8)],
    pub short_circuit: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_error: Option<String>,
}

impl<'a> CaptureRecord<'a> {
    pub fn new(req: &'a IncomingRequest, classification: &'a Classification, mode: &'a str) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            ts: req.timestamp.to_rfc3339(),
            actor: &req.address,
            method: req.method.as_str(),
            path: &req.path,
            query: req.query_string.as_deref(),
            threat_level: classification.threat_level,
            acceptable: req.is_acceptable(),
            mode,
            sub_scores: &classification.sub_scores,
            short_circuit: classification.short_circuit,
            record_error: None,
        }
    }
}

#[derive(Clone, Default)]
pub struct CaptureSink {
    writer: Option<Arc<Mutex<RotatingWriter>>>,
    log_stdout: bool,
    log_sample_n: Option<u64>,
    sample_counter: Arc<AtomicU64>,
    lines_total: Arc<AtomicU64>,
    write_errors_total: Arc<AtomicU64>,
    file_size_bytes: Arc<AtomicU64>,
}

impl CaptureSink {
    pub fn new(writer: Option<RotatingWriter>, log_stdout: bool, log_sample_n: Option<u64>) -> Self {
        Self {
            writer: writer.map(|w| Arc::new(Mutex::new(w))),
            log_stdout,
            log_sample_n: log_sample_n.filter(|n| *n > 1),
            ..Self::default()
        }
    }

    /// Open `path` if given.  An unopenable file disables the capture log
    /// with a warning rather than failing startup.
    pub fn open(
        path: Option<&str>,
        rotation: RotationConfig,
        log_stdout: bool,
        log_sample_n: Option<u64>,
    ) -> Self {
        let writer = match path {
            Some(path) => match RotatingWriter::open(path, rotation) {
                Ok(w) => Some(w),
                Err(err) => {
                    tracing::warn!(path = %path, error = %err, "failed to open LOG_FILE; capture log disabled");
                    None
                }
            },
            None => {
                tracing::debug!("capture log disabled: LOG_FILE not set");
                None
            }
        };
        Self::new(writer, log_stdout, log_sample_n)
    }

    pub fn emit_capture(&self, record: &CaptureRecord<'_>) {
        let wrote = match serde_json::to_string(record) {
            Ok(line) => self.write_line(&line),
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode capture record");
                self.write_errors_total.fetch_add(1, Ordering::Relaxed);
                false
            }
        };
        if (wrote || self.writer.is_none()) && self.should_log_stdout() {
            tracing::info!(
                target: "capture",
                actor = record.actor,
                method = record.method,
                path = record.path,
                threat_level = record.threat_level,
                mode = record.mode,
                short_circuit = ?record.short_circuit,
                record_error = ?record.record_error,
                "request captured"
            );
        }
    }

    pub fn lines_total(&self) -> u64 {
        self.lines_total.load(Ordering::Relaxed)
    }

    pub fn write_errors_total(&self) -> u64 {
        self.write_errors_total.load(Ordering::Relaxed)
    }

    pub fn file_size_bytes(&self) -> u64 {
        self.file_size_bytes.load(Ordering::Relaxed)
    }

    fn write_line(&self, line: &str) -> bool {
        let Some(target) = self.writer.as_ref() else {
            return false;
        };
        let Ok(mut guard) = target.lock() else {
            return false;
        };
        match guard.write_line(line) {
            Ok(()) => {
                self.lines_total.fetch_add(1, Ordering::Relaxed);
                if let Some(sz) = guard.current_size() {
                    self.file_size_bytes.store(sz, Ordering::Relaxed);
                }
                true
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to write capture line");
                self.write_errors_total.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    fn should_log_stdout(&self) -> bool {
        if !self.log_stdout {
            return false;
        }
        match self.log_sample_n {
            Some(n) => self.sample_counter.fetch_add(1, Ordering::Relaxed) % n == 0,
            None => true,
        }
    }
}
