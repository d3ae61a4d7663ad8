//! # dirqueue
//!
//! Producer side of a filesystem work queue. Jobs are published into a
//! shared directory tree with hard links, so independent consumer processes
//! only ever see complete payloads and control files.
//!
//! ```no_run
//! use dirqueue::{DirQueue, Options};
//!
//! let queue = DirQueue::open("/var/spool/myqueue")?;
//! let job = queue.enqueue_bytes(b"hello", &Options::default().metadata("kind", "greeting"))?;
//! println!("queued {}", job.name);
//! # Ok::<(), dirqueue::error::Error>(())
//! ```

pub mod config;
pub mod control;
pub mod encode;
pub mod error;
pub mod job;
pub mod layout;
pub mod queue;
pub mod telemetry;

pub use control::ControlRecord;
pub use job::{Options, Origin, shard};
pub use layout::Layout;
pub use queue::{DirQueue, Enqueued};
