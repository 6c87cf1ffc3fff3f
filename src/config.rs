//! 配置常量模块
//!
//! 运行时可调的常量都在这里定义，便于后期修改

/// 微线程默认栈大小：256KB
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// 允许的最小栈大小：16KB
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// 栈缓存最多保留的栈数量
pub const STACK_CACHE_CAPACITY: usize = 64;

/// arena 每块的记录数
pub const ARENA_CHUNK_SIZE: usize = 1024;

/// arena 最多块数（句柄空间 = 块数 × 每块记录数）
pub const ARENA_MAX_CHUNKS: usize = 1024;

/// 一次从 cluster 取到本地队列的最大微线程数
pub const DEFAULT_BATCH_SIZE: usize = 32;

/// 工作线程名前缀
pub const WORKER_NAME_PREFIX: &str = "uthreads-kt";

/// 版本号
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Cluster 配置
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// 名称（用于日志）
    pub name: String,
    /// 创建时启动的工作线程数（默认为 CPU 核心数）
    pub workers: usize,
    /// 在该 cluster 上 spawn 的微线程栈大小
    pub stack_size: usize,
    /// 单次批量取工作的上限
    pub batch_size: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: String::from("cluster"),
            workers: num_cpus::get(),
            stack_size: DEFAULT_STACK_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}
