//! Fan-in from local collection plugins.
//!
//! A [`Pool`] watches a directory of executables and runs one child process
//! per file. Each child's stdout is decoded as an ordered point stream onto
//! the pool's bounded output channel, stderr is logged line by line, and
//! exits re-enter a retry schedule: hourly for plugins that ask to be
//! rescheduled (exit code 13), five seconds for everything else. Touching a
//! plugin file restarts it immediately; removing it retires the entry.

pub mod pool;
pub mod process;
pub mod watch;

pub use pool::{Pool, MAX_POOL_BUF, MAX_POOL_SIZE};
pub use watch::{watch, DirectoryEvent, EventKind};
