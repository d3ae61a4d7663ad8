//! Control file codec.
//!
//! A control file is the unit of work consumers see in `queue/`. It is a
//! line-oriented text record: five fixed `Q???` fields in a fixed order,
//! then one `key: value` line per metadata entry.
//!
//! ```text
//! QDFN: /abs/path/to/data/x/y/filename
//! QDSB: 94
//! QSTT: 1700000000
//! QSTM: 123456
//! QSHN: myhost.example.com
//! <metadata-key>: <metadata-value>
//! ```

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::job::Job;

/// Absolute path of the data file.
pub const DATA_PATH_KEY: &str = "QDFN";
/// Data file size in bytes.
pub const DATA_SIZE_KEY: &str = "QDSB";
/// Enqueue time, unix seconds.
pub const TIME_SECS_KEY: &str = "QSTT";
/// Enqueue time, microseconds past `QSTT`.
pub const TIME_MICROS_KEY: &str = "QSTM";
/// Hostname of the producer.
pub const HOSTNAME_KEY: &str = "QSHN";

const SEPARATOR: &str = ": ";

/// Decoded contents of a control file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    pub data_path: PathBuf,
    pub size: u64,
    pub seconds: i64,
    pub micros: u32,
    pub hostname: String,
    pub metadata: BTreeMap<String, String>,
}

impl ControlRecord {
    /// Envelope for a job whose payload is published at `data_path`.
    pub fn for_job(job: &Job<'_>, data_path: &Path) -> Self {
        Self {
            data_path: data_path.to_path_buf(),
            size: job.size,
            seconds: job.ts.timestamp(),
            micros: job.ts.timestamp_subsec_micros(),
            hostname: job.origin.hostname.clone(),
            metadata: job.options.metadata.clone(),
        }
    }

    /// Check the data path and every metadata entry, failing on the first
    /// bad one.
    pub fn validate(&self) -> Result<()> {
        self.data_path_str()?;
        for (key, value) in &self.metadata {
            validate_metadatum(key, value)?;
        }
        Ok(())
    }

    /// Render the record. Metadata is validated before anything is produced.
    pub fn render(&self) -> Result<String> {
        self.validate()?;

        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = writeln!(out, "{DATA_PATH_KEY}{SEPARATOR}{}", self.data_path_str()?);
        let _ = writeln!(out, "{DATA_SIZE_KEY}{SEPARATOR}{}", self.size);
        let _ = writeln!(out, "{TIME_SECS_KEY}{SEPARATOR}{}", self.seconds);
        let _ = writeln!(out, "{TIME_MICROS_KEY}{SEPARATOR}{}", self.micros);
        let _ = writeln!(out, "{HOSTNAME_KEY}{SEPARATOR}{}", self.hostname);
        for (key, value) in &self.metadata {
            let _ = writeln!(out, "{key}{SEPARATOR}{value}");
        }
        Ok(out)
    }

    /// Parse a control file. All five fixed fields are required; every other
    /// line is metadata.
    pub fn parse(text: &str) -> Result<Self> {
        let mut fixed: BTreeMap<&str, &str> = BTreeMap::new();
        let mut metadata = BTreeMap::new();

        // Only '\n' ends a line; a trailing '\r' belongs to the value.
        for line in text.split('\n').filter(|l| !l.is_empty()) {
            let (key, value) = line
                .split_once(SEPARATOR)
                .ok_or_else(|| malformed(format!("line without separator: {line:?}")))?;
            if is_reserved_key(key) {
                fixed.insert(key, value);
            } else {
                metadata.insert(key.to_string(), value.to_string());
            }
        }

        Ok(Self {
            data_path: PathBuf::from(field(&fixed, DATA_PATH_KEY)?),
            size: number(&fixed, DATA_SIZE_KEY)?,
            seconds: number(&fixed, TIME_SECS_KEY)?,
            micros: number(&fixed, TIME_MICROS_KEY)?,
            hostname: field(&fixed, HOSTNAME_KEY)?.to_string(),
            metadata,
        })
    }

    /// `QDFN` is written verbatim, so the path must be valid UTF-8.
    fn data_path_str(&self) -> Result<&str> {
        self.data_path.to_str().ok_or_else(|| {
            Error::Other(format!(
                "data path is not valid UTF-8: {}",
                self.data_path.display()
            ))
        })
    }

    /// Render and write the record to `path`, flushed to disk.
    pub(crate) fn write_to(&self, path: &Path) -> Result<()> {
        let text = self.render()?;
        let mut file = std::fs::File::create(path)?;
        file.write_all(text.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }
}

/// Keys of the form `Q???` belong to the fixed fields.
fn is_reserved_key(key: &str) -> bool {
    key.starts_with('Q') && key.chars().count() == 4
}

fn validate_metadatum(key: &str, value: &str) -> Result<()> {
    let reason = if is_reserved_key(key) {
        "key is reserved for control fields"
    } else if key.contains([':', '\0', '\n']) {
        "key contains ':', NUL or newline"
    } else if value.contains(['\0', '\n']) {
        "value contains NUL or newline"
    } else {
        return Ok(());
    };
    Err(Error::InvalidMetadata {
        key: key.to_string(),
        reason,
    })
}

fn field<'t>(fixed: &BTreeMap<&str, &'t str>, key: &str) -> Result<&'t str> {
    fixed
        .get(key)
        .copied()
        .ok_or_else(|| malformed(format!("missing {key}")))
}

fn number<T>(fixed: &BTreeMap<&str, &str>, key: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    field(fixed, key)?
        .parse()
        .map_err(|e| malformed(format!("{key}: {e}")))
}

fn malformed(detail: String) -> Error {
    Error::Other(format!("malformed control record: {detail}"))
}
