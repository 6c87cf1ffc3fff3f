//! uthreads: M:N 用户态线程运行时
//!
//! ```no_run
//! use std::sync::Arc;
//! use uthreads::{Cluster, ClusterConfig, Mutex, UThread};
//!
//! let cluster = Cluster::with_config(ClusterConfig { workers: 2, ..Default::default() }).unwrap();
//! let counter = Arc::new(Mutex::new(0));
//! for _ in 0..100 {
//!     let counter = counter.clone();
//!     UThread::spawn_on(&cluster, move || *counter.lock() += 1).unwrap();
//! }
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("uthreads currently supports only Linux");

#[macro_use]
mod error;

pub mod config;
pub mod ffi;
pub mod runtime;

pub use config::ClusterConfig;
pub use error::{Error, Result};
pub use runtime::{
    BlockingQueue, Cluster, KThread, Mutex, MutexGuard, Stack, UThread, UThreadState, UtId,
};
