pub mod cache;
pub mod canon;
pub mod config;
pub mod daemon;
pub mod db;
pub mod depfile;
pub mod detect;
pub mod error;
pub mod graph;
pub mod hash;
pub mod json_events;
pub mod json_progress;
pub mod load;
pub mod process;
pub mod progress;
pub mod rpc;
pub mod run;
pub mod scanner;
pub mod serve;
mod signal;
pub mod stream_server;
mod task;
pub mod trace;
mod watch;
pub mod work;

pub use config::Config;
pub use daemon::{Daemon, StartResult, Status};
pub use error::Error;

#[cfg(not(any(windows, target_arch = "wasm32")))]
use jemallocator::Jemalloc;

#[cfg(not(any(windows, target_arch = "wasm32")))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;
