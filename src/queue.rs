//! Producer side of the queue: the atomic publish protocol.
//!
//! A job becomes visible in two hard-link steps. The payload is streamed
//! into a private file under `tmp/`, flushed, then linked into
//! `data/<lvl1>/<lvl2>/<stem>`. A control file pointing at that data path is
//! written under `tmp/` and linked into `queue/<name>`. `link(2)` either
//! creates the new name or fails because it exists, so consumers never see
//! a partially written file. Name collisions are retried with a salted name.
//!
//! Every path created is recorded on the [`Job`]; any early return drops the
//! job and removes them.

use std::fs::{File, FileTimes, OpenOptions};
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use chrono::Utc;
use opentelemetry::KeyValue;

use crate::control::ControlRecord;
use crate::error::{Error, Result};
use crate::job::{Job, JobName, Options, Origin, shard};
use crate::layout::{Layout, ensure_dir};
use crate::telemetry;

/// Attempts per hard-link stage before giving up.
pub const MAX_LINK_ATTEMPTS: u32 = 10;

/// Backoff step between link attempts, multiplied by the attempt number.
const LINK_BACKOFF: Duration = Duration::from_micros(250);

/// Handle on a queue root. Cheap to share between threads.
#[derive(Debug, Clone)]
pub struct DirQueue {
    layout: Layout,
    origin: Option<Origin>,
}

/// What a successful enqueue made visible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enqueued {
    /// Filename of the control file under `queue/`.
    pub name: String,
    pub control_path: PathBuf,
    pub data_path: PathBuf,
    pub size: u64,
}

/// Outcome of a single publish attempt under one candidate name.
enum Attempt<T> {
    Published(T),
    Collision { dst: PathBuf },
}

impl DirQueue {
    /// Open the queue at `root`, creating its directory layout if missing.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            layout: Layout::create(root)?,
            origin: None,
        })
    }

    /// Pin the producer identity instead of resolving it per job.
    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Enqueue everything `reader` yields.
    pub fn enqueue_reader(&self, reader: impl Read, options: &Options) -> Result<Enqueued> {
        let span =
            telemetry::enqueue::start_enqueue_span(&self.layout.root, options.effective_priority());
        let _entered = span.enter();
        let started = Instant::now();

        let result = self
            .origin()
            .and_then(|origin| self.enqueue_job(Job::new(options, origin, Utc::now()), reader));

        let outcome = if result.is_ok() { "ok" } else { "error" };
        telemetry::metrics::jobs_enqueued().add(1, &[KeyValue::new("result", outcome)]);
        telemetry::metrics::enqueue_duration_ms()
            .record(started.elapsed().as_secs_f64() * 1000.0, &[]);

        match &result {
            Ok(job) => {
                telemetry::metrics::payload_bytes().record(job.size, &[]);
                telemetry::enqueue::record_published(&span, &job.name, job.size);
            }
            Err(e) => tracing::debug!(error = %e, "enqueue failed"),
        }
        result
    }

    /// Enqueue the contents of the file at `path`.
    pub fn enqueue_file(&self, path: impl AsRef<Path>, options: &Options) -> Result<Enqueued> {
        let file = File::open(path)?;
        self.enqueue_reader(file, options)
    }

    /// Enqueue an in-memory payload.
    pub fn enqueue_bytes(&self, data: impl AsRef<[u8]>, options: &Options) -> Result<Enqueued> {
        self.enqueue_reader(data.as_ref(), options)
    }

    fn origin(&self) -> Result<Origin> {
        match &self.origin {
            Some(origin) => Ok(origin.clone()),
            None => Origin::detect(),
        }
    }

    pub(crate) fn enqueue_job(&self, mut job: Job<'_>, mut reader: impl Read) -> Result<Enqueued> {
        let names = job.name();
        let name = names.plain().to_string();

        // 1. Payload into private scratch space.
        let (tmp_data, mut file) = self.reserve_scratch(&names, &name, "data")?;
        job.tmp_data = Some(tmp_data.clone());
        job.size = std::io::copy(&mut reader, &mut file)?;
        file.sync_all()?;
        drop(file);

        // 2-3. Surface the payload in its shard directory.
        let (name, data_path) = self.publish(&names, name, &tmp_data, "data", |candidate| {
            let dst = self.data_path(candidate);
            if link_new(&tmp_data, &dst)? {
                Ok(Attempt::Published(dst))
            } else {
                Ok(Attempt::Collision { dst })
            }
        })?;
        job.data = Some(data_path.clone());
        discard_superseded(&mut job.tmp_data);

        // 4. Control record. Metadata is validated before anything is written.
        let mut record = ControlRecord::for_job(&job, &data_path);
        record.validate()?;
        let (tmp_ctrl, file) = self.reserve_scratch(&names, &name, "ctrl")?;
        drop(file);
        job.tmp_ctrl = Some(tmp_ctrl.clone());
        record.write_to(&tmp_ctrl)?;

        // 5. Surface the control file. The queue name and the data path must
        // keep corresponding, so a collision here moves the data file along
        // to the shard of the new name before retrying.
        let mut published_as = name.clone();
        let data_slot = &mut job.data;
        let (name, control_path) = self.publish(&names, name, &tmp_ctrl, "control", |candidate| {
            if candidate != published_as {
                let moved = self.data_path(candidate);
                if !link_new(&record.data_path, &moved)? {
                    return Ok(Attempt::Collision { dst: moved });
                }
                let mut superseded = Some(std::mem::replace(&mut record.data_path, moved.clone()));
                *data_slot = Some(moved);
                discard_superseded(&mut superseded);
                published_as = candidate.to_string();
                record.write_to(&tmp_ctrl)?;
            }

            let dst = self.layout.queue.join(candidate);
            if link_new(&tmp_ctrl, &dst)? {
                Ok(Attempt::Published(dst))
            } else {
                Ok(Attempt::Collision { dst })
            }
        })?;
        discard_superseded(&mut job.tmp_ctrl);

        let enqueued = Enqueued {
            name,
            control_path,
            data_path: record.data_path,
            size: job.size,
        };
        job.commit();

        // 6. Some filesystems only wake directory watchers on an mtime change.
        if let Err(e) = touch(&self.layout.queue) {
            tracing::warn!(
                path = %self.layout.queue.display(),
                error = %e,
                "failed to update queue directory mtime"
            );
        }

        Ok(enqueued)
    }

    /// Run `attempt` under successive candidate names until it publishes,
    /// backing off a little longer after each collision.
    fn publish<T>(
        &self,
        names: &JobName,
        first: String,
        src: &Path,
        stage: &'static str,
        mut attempt: impl FnMut(&str) -> Result<Attempt<T>>,
    ) -> Result<(String, T)> {
        let mut candidate = first;
        let mut tries = 1;
        loop {
            let dst = match attempt(&candidate)? {
                Attempt::Published(published) => return Ok((candidate, published)),
                Attempt::Collision { dst } => dst,
            };

            telemetry::metrics::link_collisions().add(1, &[KeyValue::new("stage", stage)]);
            tracing::debug!(stage, attempt = tries, dst = %dst.display(), "name collision");

            if tries >= MAX_LINK_ATTEMPTS {
                return Err(Error::LinkExhausted {
                    src: src.to_path_buf(),
                    dst,
                    attempts: tries,
                });
            }
            std::thread::sleep(LINK_BACKOFF * tries);
            tries += 1;
            candidate = names.salted();
        }
    }

    /// Create a file in `tmp/` that no other producer can be writing to.
    fn reserve_scratch(
        &self,
        names: &JobName,
        name: &str,
        ext: &str,
    ) -> Result<(PathBuf, File)> {
        let mut candidate = name.to_string();
        let mut tries = 1;
        loop {
            let path = self.layout.tmp.join(format!("{candidate}.{ext}"));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists && tries < MAX_LINK_ATTEMPTS => {
                    tries += 1;
                    candidate = names.salted();
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn data_path(&self, name: &str) -> PathBuf {
        self.layout.data.join(shard(name).relative_path())
    }
}

/// Hard-link `src` to `dst`, creating `dst`'s parent first. Returns false if
/// `dst` already exists.
///
/// There is no rename fallback. On filesystems without hard links (FAT and
/// similar mounts, where `link` fails with `EPERM`) every enqueue fails with
/// [`Error::Io`].
fn link_new(src: &Path, dst: &Path) -> Result<bool> {
    if let Some(parent) = dst.parent() {
        ensure_dir(parent)?;
    }
    match std::fs::hard_link(src, dst) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Remove a name that has been superseded by a hard link. Failure only warns.
fn discard_superseded(slot: &mut Option<PathBuf>) {
    if let Some(path) = slot.take() {
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to remove superseded file"
            );
        }
    }
}

fn touch(dir: &Path) -> std::io::Result<()> {
    let now = SystemTime::now();
    File::open(dir)?.set_times(FileTimes::new().set_accessed(now).set_modified(now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone};

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 17, 4, 5).unwrap()
    }

    fn queue(root: &Path) -> DirQueue {
        DirQueue::open(root)
            .unwrap()
            .with_origin(Origin::new("vox", 12345))
    }

    fn plain_name(q: &DirQueue, opts: &Options) -> String {
        Job::new(opts, q.origin().unwrap(), ts()).filename(false)
    }

    fn entries(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect()
    }

    #[test]
    fn data_collision_retries_under_salted_name() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path());
        let opts = Options::default();
        let plain = plain_name(&q, &opts);

        let taken = q.data_path(&plain);
        std::fs::create_dir_all(taken.parent().unwrap()).unwrap();
        std::fs::write(&taken, b"someone else").unwrap();

        let job = Job::new(&opts, q.origin().unwrap(), ts());
        let out = q.enqueue_job(job, &b"payload"[..]).unwrap();

        assert!(out.name.starts_with(&format!("{plain}.12345.")), "{}", out.name);
        assert_eq!(out.data_path, q.data_path(&out.name));
        assert_eq!(std::fs::read(&out.data_path).unwrap(), b"payload");
        assert_eq!(std::fs::read(&taken).unwrap(), b"someone else");

        let record =
            ControlRecord::parse(&std::fs::read_to_string(&out.control_path).unwrap()).unwrap();
        assert_eq!(record.data_path, out.data_path);
        assert!(entries(&q.layout.tmp).is_empty());
    }

    #[test]
    fn control_collision_moves_data_to_matching_shard() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path());
        let opts = Options::default().metadata("foo", "abc");
        let plain = plain_name(&q, &opts);

        let taken = q.layout.queue.join(&plain);
        std::fs::write(&taken, b"not ours").unwrap();

        let job = Job::new(&opts, q.origin().unwrap(), ts());
        let out = q.enqueue_job(job, &b"payload"[..]).unwrap();

        assert_ne!(out.name, plain);
        assert_eq!(out.control_path, q.layout.queue.join(&out.name));
        assert_eq!(out.data_path, q.data_path(&out.name));
        assert!(!q.data_path(&plain).exists());
        assert_eq!(std::fs::read(&taken).unwrap(), b"not ours");

        let record =
            ControlRecord::parse(&std::fs::read_to_string(&out.control_path).unwrap()).unwrap();
        assert_eq!(record.data_path, out.data_path);
        assert_eq!(record.size, 7);
        assert_eq!(record.metadata["foo"], "abc");
        assert!(entries(&q.layout.tmp).is_empty());
    }

    #[test]
    fn publish_gives_up_after_max_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path());
        let opts = Options::default();
        let names = Job::new(&opts, q.origin().unwrap(), ts()).name();
        let src = q.layout.tmp.join("src");

        let mut calls = 0;
        let err = q
            .publish(&names, names.plain().to_string(), &src, "data", |candidate| {
                calls += 1;
                Ok(Attempt::<()>::Collision {
                    dst: q.data_path(candidate),
                })
            })
            .unwrap_err();

        assert_eq!(calls, MAX_LINK_ATTEMPTS);
        match err {
            Error::LinkExhausted { src: s, attempts, .. } => {
                assert_eq!(s, src);
                assert_eq!(attempts, MAX_LINK_ATTEMPTS);
            }
            other => panic!("expected LinkExhausted, got {other:?}"),
        }
    }

    #[test]
    fn scratch_names_do_not_clobber_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path());
        let opts = Options::default();
        let names = Job::new(&opts, q.origin().unwrap(), ts()).name();

        let (first, _f1) = q.reserve_scratch(&names, names.plain(), "data").unwrap();
        let (second, _f2) = q.reserve_scratch(&names, names.plain(), "data").unwrap();

        assert_ne!(first, second);
        assert_eq!(entries(&q.layout.tmp).len(), 2);
    }

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("stream broke"))
        }
    }

    #[test]
    fn read_failure_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path());

        let err = q
            .enqueue_reader(FailingReader, &Options::default())
            .unwrap_err();

        assert!(matches!(err, Error::Io(_)), "got {err:?}");
        assert!(entries(&q.layout.tmp).is_empty());
        assert!(entries(&q.layout.data).is_empty());
        assert!(entries(&q.layout.queue).is_empty());
    }

    fn files_under(dir: &Path) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for path in entries(dir) {
            if path.is_dir() {
                files.extend(files_under(&path));
            } else {
                files.push(path);
            }
        }
        files
    }

    #[test]
    fn control_stage_exhaustion_removes_published_data() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path());
        let opts = Options::default();
        let plain = plain_name(&q, &opts);

        // Occupy the plain name and every salted variant.
        std::fs::write(q.layout.queue.join(&plain), b"").unwrap();
        for salt in 0..=u16::MAX {
            std::fs::write(q.layout.queue.join(format!("{plain}.12345.{salt}")), b"").unwrap();
        }

        let job = Job::new(&opts, q.origin().unwrap(), ts());
        let err = q.enqueue_job(job, &b"payload"[..]).unwrap_err();

        match err {
            Error::LinkExhausted { attempts, .. } => assert_eq!(attempts, MAX_LINK_ATTEMPTS),
            other => panic!("expected LinkExhausted, got {other:?}"),
        }
        assert!(files_under(&q.layout.tmp).is_empty());
        assert!(files_under(&q.layout.data).is_empty());
        assert_eq!(entries(&q.layout.queue).len(), 1 + 65_536);
    }

    fn mtime(path: &Path) -> SystemTime {
        std::fs::metadata(path).unwrap().modified().unwrap()
    }

    fn backdate(dir: &Path) -> SystemTime {
        let past = SystemTime::now() - Duration::from_secs(3600);
        File::open(dir)
            .unwrap()
            .set_times(FileTimes::new().set_accessed(past).set_modified(past))
            .unwrap();
        past
    }

    #[test]
    fn touch_moves_directory_mtime_forward() {
        let dir = tempfile::tempdir().unwrap();
        let past = backdate(dir.path());

        touch(dir.path()).unwrap();

        assert!(mtime(dir.path()) > past);
    }

    #[test]
    fn enqueue_bumps_queue_directory_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let q = queue(dir.path());
        let past = backdate(&q.layout.queue);

        q.enqueue_bytes("x", &Options::default()).unwrap();

        assert!(mtime(&q.layout.queue) > past);
    }

    #[test]
    fn non_collision_link_error_is_io() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");

        let err = link_new(&missing, &dir.path().join("sub/dst")).unwrap_err();

        assert!(matches!(err, Error::Io(_)), "got {err:?}");
    }
}
