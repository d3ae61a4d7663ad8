//! On-disk layout of a queue root.
//!
//! ```text
//! <root>/tmp/                       scratch, never read by consumers
//! <root>/data/<lvl1>/<lvl2>/<name>  payload files
//! <root>/queue/<name>               control files, one per ready job
//! <root>/active/                    consumer claims, untouched here
//! ```

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const TMP_DIR: &str = "tmp";
pub const DATA_DIR: &str = "data";
pub const QUEUE_DIR: &str = "queue";
pub const ACTIVE_DIR: &str = "active";

/// Resolved absolute paths of a queue root and its four subdirectories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub root: PathBuf,
    pub tmp: PathBuf,
    pub data: PathBuf,
    pub queue: PathBuf,
    pub active: PathBuf,
}

impl Layout {
    /// Ensure `root` and its subdirectories exist and resolve their paths.
    ///
    /// Safe to call concurrently from several processes against the same
    /// root: a directory that already exists is not an error. The absolute
    /// root must be valid UTF-8, since data paths are written into control
    /// files as text.
    pub fn create(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let root = std::path::absolute(root).map_err(|source| Error::Setup {
            path: root.to_path_buf(),
            source,
        })?;
        if root.to_str().is_none() {
            return Err(Error::Setup {
                path: root,
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "queue root is not valid UTF-8",
                ),
            });
        }
        ensure_dir(&root)?;

        let subdir = |name: &str| -> Result<PathBuf> {
            let path = root.join(name);
            ensure_dir(&path)?;
            Ok(path)
        };

        Ok(Self {
            tmp: subdir(TMP_DIR)?,
            data: subdir(DATA_DIR)?,
            queue: subdir(QUEUE_DIR)?,
            active: subdir(ACTIVE_DIR)?,
            root,
        })
    }
}

/// Create `dir` (and parents) with a permissive mode if it is missing.
pub(crate) fn ensure_dir(dir: &Path) -> Result<()> {
    match std::fs::metadata(dir) {
        Ok(meta) if meta.is_dir() => return Ok(()),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(Error::Setup {
                path: dir.to_path_buf(),
                source,
            });
        }
    }

    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt as _;
        builder.mode(0o777);
    }

    builder.create(dir).map_err(|source| Error::Setup {
        path: dir.to_path_buf(),
        source,
    })
}
