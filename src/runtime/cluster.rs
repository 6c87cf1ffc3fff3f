//! Cluster
//!
//! 一组工作线程共享一个就绪池。任何线程都可以往池里提交就绪的微线程，
//! 工作线程本地队列空了之后按份额批量取走，份额与工作线程数成反比，
//! 避免一个线程把整池都搬空而其他线程饿着。

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crossbeam_utils::CachePadded;
use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::config::{ClusterConfig, DEFAULT_BATCH_SIZE, DEFAULT_STACK_SIZE, MIN_STACK_SIZE};
use crate::error::{Error, Result};
use crate::runtime::kthread::{self, KThread};
use crate::runtime::list::UtList;
use crate::runtime::uthread;

static NEXT_CLUSTER_ID: AtomicU64 = AtomicU64::new(1);

/// 共享就绪池
struct Pool {
    list: UtList,
}

struct ClusterInner {
    id: u64,
    name: String,
    stack_size: usize,
    batch_size: usize,
    pool: Mutex<Pool>,
    /// 池非空或关闭时通知
    available: Condvar,
    /// 池长度，供 `try_get_work` 免锁判断
    queued: CachePadded<AtomicUsize>,
    /// 正在运行的工作线程数
    kthreads: CachePadded<AtomicUsize>,
    /// 阻塞在 `get_work` 上的工作线程数
    idle: CachePadded<AtomicUsize>,
    /// 属于本 cluster 的存活微线程数
    live: CachePadded<AtomicUsize>,
    shutdown: AtomicBool,
    /// `with_config` 创建的工作线程
    workers: Mutex<Vec<KThread>>,
}

/// Cluster 句柄，克隆后指向同一个 cluster
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

impl Cluster {
    /// 创建一个没有工作线程的 cluster
    pub fn new() -> Self {
        Self::build(String::from("cluster"), DEFAULT_STACK_SIZE, DEFAULT_BATCH_SIZE)
    }

    /// 按配置创建 cluster 并启动 `config.workers` 个工作线程
    pub fn with_config(config: ClusterConfig) -> Result<Self> {
        if config.stack_size < MIN_STACK_SIZE {
            return Err(Error::InvalidStackSize {
                size: config.stack_size,
                min: MIN_STACK_SIZE,
            });
        }
        let cluster = Self::build(config.name, config.stack_size, config.batch_size);
        for _ in 0..config.workers {
            match KThread::new(&cluster) {
                Ok(kt) => cluster.inner.workers.lock().push(kt),
                Err(e) => {
                    cluster.shutdown();
                    cluster.join();
                    return Err(e);
                }
            }
        }
        Ok(cluster)
    }

    fn build(name: String, stack_size: usize, batch_size: usize) -> Self {
        let id = NEXT_CLUSTER_ID.fetch_add(1, Ordering::Relaxed);
        debug!("cluster {} ({}) created", id, name);
        Self {
            inner: Arc::new(ClusterInner {
                id,
                name,
                stack_size,
                batch_size: batch_size.max(1),
                pool: Mutex::new(Pool {
                    list: UtList::new(uthread::links()),
                }),
                available: Condvar::new(),
                queued: CachePadded::new(AtomicUsize::new(0)),
                kthreads: CachePadded::new(AtomicUsize::new(0)),
                idle: CachePadded::new(AtomicUsize::new(0)),
                live: CachePadded::new(AtomicUsize::new(0)),
                shutdown: AtomicBool::new(false),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// 进程级默认 cluster，第一次使用时创建，带一个工作线程，永不销毁
    pub fn default_cluster() -> &'static Cluster {
        static DEFAULT: OnceLock<Cluster> = OnceLock::new();
        DEFAULT.get_or_init(|| {
            let config = ClusterConfig {
                name: String::from("default"),
                workers: 1,
                ..ClusterConfig::default()
            };
            match Cluster::with_config(config) {
                Ok(cluster) => cluster,
                Err(e) => fatal!("failed to start the default cluster: {}", e),
            }
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// 在本 cluster 上 spawn 的微线程的栈大小
    #[inline]
    pub fn stack_size(&self) -> usize {
        self.inner.stack_size
    }

    #[inline]
    pub fn batch_size(&self) -> usize {
        self.inner.batch_size
    }

    /// 正在运行的工作线程数
    pub fn kthread_count(&self) -> usize {
        self.inner.kthreads.load(Ordering::Acquire)
    }

    /// 阻塞等待工作的工作线程数
    pub fn idle_kthreads(&self) -> usize {
        self.inner.idle.load(Ordering::Acquire)
    }

    /// 属于本 cluster 的存活微线程数
    pub fn live_uthreads(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    /// 共享池中等待调度的微线程数
    pub fn queued(&self) -> usize {
        self.inner.queued.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// 关闭 cluster：拒绝新的 `start`，唤醒空闲的工作线程；
    /// 工作线程在没有可运行工作后退出
    pub fn shutdown(&self) {
        let _pool = self.inner.pool.lock();
        if !self.inner.shutdown.swap(true, Ordering::AcqRel) {
            debug!("cluster {} shutting down", self.inner.id);
        }
        self.inner.available.notify_all();
    }

    /// 等待 `with_config` 创建的工作线程全部退出
    pub fn join(&self) {
        if kthread::context().is_some_and(|ctx| ctx.cluster() == self) {
            fatal!("cluster {} joined from one of its own workers", self.inner.id);
        }
        let workers = std::mem::take(&mut *self.inner.workers.lock());
        for kt in workers {
            kt.join();
        }
    }

    /// 把就绪的微线程放进共享池
    pub(crate) fn submit(&self, index: u32) {
        let mut pool = self.inner.pool.lock();
        pool.list.push_back(index);
        self.inner.queued.fetch_add(1, Ordering::Release);
        if self.inner.idle.load(Ordering::Acquire) > 0 {
            self.inner.available.notify_one();
        }
    }

    /// 阻塞地取一批工作到 `dst`
    ///
    /// 返回 `false` 表示 cluster 已关闭且池为空，调用方应退出工作循环。
    pub(crate) fn get_work(&self, dst: &mut UtList) -> bool {
        let mut pool = self.inner.pool.lock();
        loop {
            if !pool.list.is_empty() {
                self.transfer(&mut pool, dst);
                return true;
            }
            if self.is_shutdown() {
                return false;
            }
            self.inner.idle.fetch_add(1, Ordering::AcqRel);
            self.inner.available.wait(&mut pool);
            self.inner.idle.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// 非阻塞地取一批工作到 `dst`，返回取到的数量
    pub(crate) fn try_get_work(&self, dst: &mut UtList) -> usize {
        if self.inner.queued.load(Ordering::Acquire) == 0 {
            return 0;
        }
        let mut pool = self.inner.pool.lock();
        self.transfer(&mut pool, dst)
    }

    fn transfer(&self, pool: &mut Pool, dst: &mut UtList) -> usize {
        let workers = self.kthread_count().max(1);
        let share = pool.list.len().div_ceil(workers).clamp(1, self.inner.batch_size);
        let moved = pool.list.transfer(dst, share);
        self.inner.queued.fetch_sub(moved, Ordering::Release);
        // 还有剩余就叫醒下一个空闲线程
        if !pool.list.is_empty() && self.inner.idle.load(Ordering::Acquire) > 0 {
            self.inner.available.notify_one();
        }
        moved
    }

    pub(crate) fn attach(&self) {
        self.inner.live.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn detach(&self) {
        self.inner.live.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn kthread_started(&self) {
        self.inner.kthreads.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn kthread_exited(&self) {
        self.inner.kthreads.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Default for Cluster {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Cluster {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Cluster {}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("kthreads", &self.kthread_count())
            .field("live", &self.live_uthreads())
            .field("queued", &self.queued())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::uthread::UThread;

    #[test]
    fn test_cluster_new() {
        let cluster = Cluster::new();
        assert_eq!(cluster.kthread_count(), 0);
        assert_eq!(cluster.live_uthreads(), 0);
        assert_eq!(cluster.queued(), 0);
        assert_eq!(cluster.stack_size(), DEFAULT_STACK_SIZE);
        assert!(!cluster.is_shutdown());
    }

    #[test]
    fn test_cluster_identity() {
        let a = Cluster::new();
        let b = Cluster::new();
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_with_config_rejects_small_stack() {
        let config = ClusterConfig {
            workers: 0,
            stack_size: 1024,
            ..ClusterConfig::default()
        };
        assert!(matches!(
            Cluster::with_config(config),
            Err(Error::InvalidStackSize { size: 1024, .. })
        ));
    }

    #[test]
    fn test_batch_size_at_least_one() {
        let config = ClusterConfig {
            workers: 0,
            batch_size: 0,
            ..ClusterConfig::default()
        };
        let cluster = Cluster::with_config(config).unwrap();
        assert_eq!(cluster.batch_size(), 1);
    }

    #[test]
    fn test_pool_transfer_share() {
        let cluster = Cluster::new();
        let threads: Vec<UThread> = (0..4).map(|_| UThread::create(MIN_STACK_SIZE).unwrap()).collect();
        for ut in &threads {
            cluster.submit(ut.index());
        }
        assert_eq!(cluster.queued(), 4);

        // 没有工作线程时按一个算，一次搬走全部
        let mut local = UtList::new(uthread::links());
        assert_eq!(cluster.try_get_work(&mut local), 4);
        assert_eq!(cluster.queued(), 0);
        assert_eq!(cluster.try_get_work(&mut local), 0);

        let order: Vec<u32> = std::iter::from_fn(|| local.pop_front()).collect();
        let expected: Vec<u32> = threads.iter().map(UThread::index).collect();
        assert_eq!(order, expected);

        for ut in threads {
            ut.destroy();
        }
    }

    #[test]
    fn test_shutdown_stops_get_work() {
        let cluster = Cluster::new();
        cluster.shutdown();
        let mut local = UtList::new(uthread::links());
        assert!(!cluster.get_work(&mut local));
    }

    #[test]
    fn test_start_on_shutdown_cluster() {
        let cluster = Cluster::new();
        cluster.shutdown();
        let ut = UThread::create(MIN_STACK_SIZE).unwrap();
        assert!(matches!(
            ut.start(&cluster, || {}),
            Err(Error::ClusterShutdown(id)) if id == cluster.id()
        ));
        ut.destroy();
    }
}
