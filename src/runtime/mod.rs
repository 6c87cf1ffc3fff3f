//! 微线程运行时模块
//!
//! M:N 用户态线程调度：大量协作式调度的微线程复用在少量 OS 线程上。
//!
//! 核心组件：
//! - uThread: 微线程，有自己的栈和状态
//! - kThread: 工作线程，一个 OS 线程，循环调度微线程
//! - Cluster: 一组共享就绪池的工作线程
//! - BlockingQueue / Mutex: 挂起微线程而不阻塞 OS 线程的同步原语

pub(crate) mod arch;
pub mod stack;
pub(crate) mod list;
pub mod uthread;
pub mod kthread;
pub mod cluster;
pub mod sync;

pub use cluster::Cluster;
pub use kthread::KThread;
pub use stack::Stack;
pub use sync::{BlockingQueue, Mutex, MutexGuard};
pub use uthread::{UThread, UThreadState};

/// 微线程 ID 类型
pub type UtId = u64;
