//! Per-enqueue job state, filename generation and data sharding.
//!
//! A job filename is
//! `<priority:02>.<yyyymmddHHMMSSffffff>.<encoded id>[.<pid>.<salt>]`, so a
//! plain directory listing sorts by priority, then time. The data file for a
//! job lives at `data/<lvl1>/<lvl2>/<stem>`, where `lvl1`/`lvl2` are the last
//! two characters of the filename and `stem` is everything before them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::encode::{encoded_id, is_safe_char};
use crate::error::{Error, Result};

pub const DEFAULT_PRIORITY: u8 = 50;
pub const MAX_PRIORITY: u8 = 99;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Caller-supplied settings for one enqueue call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Extra `key: value` lines written to the control file.
    pub metadata: BTreeMap<String, String>,

    /// 0 sorts first. Values above 99 are clamped, not rejected.
    pub priority: u8,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            metadata: BTreeMap::new(),
            priority: DEFAULT_PRIORITY,
        }
    }
}

impl Options {
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Priority as it appears in filenames.
    pub fn effective_priority(&self) -> u8 {
        self.priority.min(MAX_PRIORITY)
    }
}

// ---------------------------------------------------------------------------
// Origin
// ---------------------------------------------------------------------------

/// Identity of the producing process: feeds the filename disambiguator and
/// the control file's `QSHN` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub hostname: String,
    pub pid: u32,
}

impl Origin {
    pub fn new(hostname: impl Into<String>, pid: u32) -> Self {
        Self {
            hostname: hostname.into(),
            pid,
        }
    }

    /// Resolve the local hostname and current process ID.
    pub fn detect() -> Result<Self> {
        let hostname = hostname::get()
            .map_err(Error::Hostname)?
            .into_string()
            .map_err(|raw| {
                Error::Hostname(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("hostname is not valid UTF-8: {raw:?}"),
                ))
            })?;
        Ok(Self::new(hostname, std::process::id()))
    }

    /// Stable token for this host/process pair.
    pub fn encoded_id(&self) -> String {
        encoded_id(&format!("{}{}", self.hostname, self.pid))
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// Transaction state for a single enqueue call.
///
/// Records every path created on disk so far. Unless [`Job::commit`] is
/// called, dropping the job removes those paths, newest first, ignoring
/// errors. Early returns on any failure path therefore clean up.
#[derive(Debug)]
pub struct Job<'a> {
    pub(crate) ts: DateTime<Utc>,
    pub(crate) options: &'a Options,
    pub(crate) origin: Origin,
    pub(crate) size: u64,
    pub(crate) tmp_data: Option<PathBuf>,
    pub(crate) data: Option<PathBuf>,
    pub(crate) tmp_ctrl: Option<PathBuf>,
    committed: bool,
}

impl<'a> Job<'a> {
    pub fn new(options: &'a Options, origin: Origin, ts: DateTime<Utc>) -> Self {
        Self {
            ts,
            options,
            origin,
            size: 0,
            tmp_data: None,
            data: None,
            tmp_ctrl: None,
            committed: false,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.ts
    }

    /// Owned naming inputs of this job.
    pub fn name(&self) -> JobName {
        JobName {
            base: format!(
                "{:02}.{}.{}",
                self.options.effective_priority(),
                self.ts.format("%Y%m%d%H%M%S%6f"),
                self.origin.encoded_id(),
            ),
            pid: self.origin.pid,
        }
    }

    /// Generate a job filename. With `salted`, a `.<pid>.<0..=65535>` suffix
    /// is appended to step around a name collision.
    pub fn filename(&self, salted: bool) -> String {
        let name = self.name();
        if salted { name.salted() } else { name.base }
    }

    /// Keep everything created so far.
    pub(crate) fn commit(mut self) {
        self.committed = true;
    }

    fn cleanup(&mut self) {
        for path in [self.tmp_ctrl.take(), self.data.take(), self.tmp_data.take()]
            .into_iter()
            .flatten()
        {
            let _ = std::fs::remove_file(&path);
        }
    }
}

impl Drop for Job<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.cleanup();
        }
    }
}

/// Filename generator detached from the job's borrowed state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobName {
    base: String,
    pid: u32,
}

impl JobName {
    /// The unsalted filename.
    pub fn plain(&self) -> &str {
        &self.base
    }

    /// A fresh salted variant of the filename.
    pub fn salted(&self) -> String {
        let salt: u16 = rand::random();
        format!("{}.{}.{}", self.base, self.pid, salt)
    }
}

// ---------------------------------------------------------------------------
// Sharding
// ---------------------------------------------------------------------------

/// A job filename split into its two shard directories and remaining stem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shard<'a> {
    pub lvl1: &'a str,
    pub lvl2: &'a str,
    pub stem: &'a str,
}

impl Shard<'_> {
    /// `<lvl1>/<lvl2>/<stem>`, relative to the data directory.
    pub fn relative_path(&self) -> PathBuf {
        Path::new(self.lvl1).join(self.lvl2).join(self.stem)
    }
}

/// Peel the last two characters off `name` as shard directories.
///
/// Names that do not end in two safe characters shard to `0/0/<name>`.
pub fn shard(name: &str) -> Shard<'_> {
    let mut tail = name.char_indices().rev();
    if let (Some((i2, c2)), Some((i1, c1))) = (tail.next(), tail.next()) {
        if is_safe_char(c1) && is_safe_char(c2) {
            return Shard {
                lvl1: &name[i1..i2],
                lvl2: &name[i2..],
                stem: &name[..i1],
            };
        }
    }
    Shard {
        lvl1: "0",
        lvl2: "0",
        stem: name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 17, 4, 5).unwrap() + chrono::Duration::microseconds(42)
    }

    fn origin() -> Origin {
        Origin::new("vox", 12345)
    }

    #[test]
    fn default_options() {
        let opts = Options::default();
        assert_eq!(opts.priority, 50);
        assert!(opts.metadata.is_empty());
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let opts: Options = serde_json::from_str(r#"{"metadata": {"foo": "abc"}}"#).unwrap();
        assert_eq!(opts.priority, DEFAULT_PRIORITY);
        assert_eq!(opts.metadata["foo"], "abc");

        let opts: Options = serde_json::from_str(r#"{"priority": 7}"#).unwrap();
        assert_eq!(opts, Options::default().priority(7));
    }

    #[test]
    fn filename_has_priority_timestamp_and_id() {
        let opts = Options::default().priority(7);
        let job = Job::new(&opts, origin(), fixed_ts());

        let name = job.filename(false);
        assert_eq!(name, "07.20240309170405000042.DNjA");
    }

    #[test]
    fn priority_above_99_is_clamped_without_touching_options() {
        let opts = Options::default().priority(200);
        let job = Job::new(&opts, origin(), fixed_ts());

        assert!(job.filename(false).starts_with("99."));
        assert_eq!(opts.priority, 200);
    }

    #[test]
    fn timestamp_field_is_twenty_digits() {
        let opts = Options::default();
        let job = Job::new(&opts, origin(), Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());

        let name = job.filename(false);
        let ts = name.split('.').nth(1).unwrap();
        assert_eq!(ts.len(), 20);
        assert!(ts.bytes().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn salted_filename_appends_pid_and_salt() {
        let opts = Options::default();
        let job = Job::new(&opts, origin(), fixed_ts());

        let name = job.filename(true);
        let parts: Vec<_> = name.split('.').collect();
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[3], "12345");
        assert!(parts[4].parse::<u16>().is_ok());
        assert!(name.starts_with(&job.filename(false)));
    }

    #[test]
    fn filenames_sort_by_priority_then_time() {
        let urgent = Options::default().priority(1);
        let normal = Options::default();
        let early = Job::new(&normal, origin(), fixed_ts()).filename(false);
        let late = Job::new(&normal, origin(), fixed_ts() + chrono::Duration::hours(1)).filename(false);
        let first = Job::new(&urgent, origin(), fixed_ts() + chrono::Duration::days(1)).filename(false);

        let mut names = vec![late.clone(), early.clone(), first.clone()];
        names.sort();
        assert_eq!(names, vec![first, early, late]);
    }

    #[test]
    fn shard_splits_last_two_characters() {
        let s = shard("50.20240309170405000042.DNjA");
        assert_eq!(s.lvl1, "j");
        assert_eq!(s.lvl2, "A");
        assert_eq!(s.stem, "50.20240309170405000042.DN");
        assert_eq!(s.relative_path(), Path::new("j/A/50.20240309170405000042.DN"));
    }

    #[test]
    fn shard_of_salted_name_uses_salt_digits() {
        let s = shard("50.20240309170405000042.DNjA.12345.678");
        assert_eq!((s.lvl1, s.lvl2), ("7", "8"));
        assert_eq!(s.stem, "50.20240309170405000042.DNjA.12345.6");
    }

    #[test]
    fn shard_defaults_to_zero_for_short_or_unsafe_tails() {
        for name in ["", "x", "ab.", "a.b"] {
            let s = shard(name);
            assert_eq!((s.lvl1, s.lvl2, s.stem), ("0", "0", name));
        }
    }

    #[test]
    fn shard_round_trips_generated_names() {
        let opts = Options::default();
        let job = Job::new(&opts, origin(), fixed_ts());
        for salted in [false, true] {
            let name = job.filename(salted);
            let s = shard(&name);
            assert_eq!(s.stem.len(), name.len() - 2);
            assert_eq!(format!("{}{}{}", s.stem, s.lvl1, s.lvl2), name);
        }
    }

    #[test]
    fn dropping_uncommitted_job_removes_recorded_paths() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, b"x").unwrap();
        std::fs::write(&b, b"y").unwrap();

        let opts = Options::default();
        let mut job = Job::new(&opts, origin(), fixed_ts());
        job.tmp_data = Some(a.clone());
        job.data = Some(b.clone());
        job.tmp_ctrl = Some(dir.path().join("never-created"));
        drop(job);

        assert!(!a.exists());
        assert!(!b.exists());
    }

    #[test]
    fn committed_job_keeps_its_files() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        std::fs::write(&data, b"x").unwrap();

        let opts = Options::default();
        let mut job = Job::new(&opts, origin(), fixed_ts());
        job.data = Some(data.clone());
        job.commit();

        assert!(data.exists());
    }
}
