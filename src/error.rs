//! 错误类型
//!
//! 可恢复的失败（资源耗尽、线程创建失败）以 `Error` 返回；
//! 违反调度约定或出现不可能的调度状态时通过 `fatal!` 立即终止进程。

use thiserror::Error;

/// 运行时错误
#[derive(Debug, Error)]
pub enum Error {
    /// 请求的栈太小
    #[error("stack size {size} is below the minimum of {min} bytes")]
    InvalidStackSize { size: usize, min: usize },

    /// 栈内存映射失败
    #[error("failed to map a {size}-byte stack (errno {errno})")]
    StackAlloc { size: usize, errno: i32 },

    /// 微线程句柄空间用尽
    #[error("micro-thread arena exhausted")]
    ArenaExhausted,

    /// 工作线程创建失败
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// 向已关闭的 cluster 提交工作
    #[error("cluster {0} has been shut down")]
    ClusterShutdown(u64),
}

pub type Result<T> = std::result::Result<T, Error>;

/// 致命错误：记录诊断信息后直接 abort，绝不跨越切换过的栈展开
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        log::error!("{}", message);
        eprintln!("uthreads: fatal: {}", message);
        std::process::abort()
    }};
}
