//! Austin: an out-of-process statistical sampler for CPython.
//!
//! This crate lets you drive the sampler as a library: locate and attach to
//! a target process, walk its interpreter state on a timer, and stream
//! stack samples out over the MOJO binary wire format.
//!
//! # Example
//!
//! ```rust,no_run
//! fn sample_once(pid: austin::Pid) -> anyhow::Result<()> {
//!     let config = austin::Config::default();
//!     let mut supervisor = austin::Supervisor::attach(pid, austin::MAX_STACK_SIZE)?;
//!     supervisor.init(std::time::Duration::from_millis(config.attach_timeout_ms))?;
//!
//!     let stdout = std::io::stdout();
//!     let mut emitter = austin::emitter::MojoEmitter::new(stdout.lock(), false);
//!     emitter.write_header()?;
//!     supervisor.sample(&config, 0, &mut emitter)?;
//!     Ok(())
//! }
//! ```
#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate log;

pub mod caches;
pub mod codeloc;
pub mod config;
pub mod descriptors;
pub mod dump;
pub mod emitter;
pub mod error;
pub mod image;
pub mod locator;
pub mod platform;
pub mod process;
pub mod stack_buffers;
pub mod stats;
pub mod timer;
pub mod tree;
pub mod unwind;
pub mod version;

pub use config::Config;
pub use process::Supervisor;
pub use remoteprocess::Pid;
pub use tree::ProcessTree;
pub use unwind::MAX_STACK_SIZE;
