//! 工作线程（kThread）
//!
//! 一个 kThread 对应一个 OS 线程，循环地从本地就绪队列取微线程并切换进去。
//! 本地队列空了就向所属 cluster 批量取；cluster 也没有时回到主循环占位线程，
//! 在 cluster 上阻塞等待，而不是空转。
//!
//! 每个工作线程有一个 `WorkerContext`，住在 OS 线程自己的栈上，
//! 通过线程局部槽位暴露给运行在该线程上的任意代码。

use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::bounded;
use log::{debug, error, trace};

use crate::config::WORKER_NAME_PREFIX;
use crate::error::{Error, Result};
use crate::runtime::arch;
use crate::runtime::cluster::Cluster;
use crate::runtime::list::UtList;
use crate::runtime::uthread::{self, record, UThreadState};

/// 进程内存活的工作线程数
static TOTAL_KTHREADS: AtomicUsize = AtomicUsize::new(0);

static NEXT_KTHREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CONTEXT: Cell<*const WorkerContext> = const { Cell::new(ptr::null()) };
}

/// 当前 OS 线程的调度上下文
///
/// 微线程可能在另一个 OS 线程上被恢复，所以每次切换之后都必须重新读取，
/// 不能把返回值留到切换点之后使用。
#[inline(never)]
pub(crate) fn context() -> Option<&'static WorkerContext> {
    let ptr = CONTEXT.with(Cell::get);
    unsafe { ptr.as_ref() }
}

/// 安装线程局部上下文，离开作用域时清除
struct ContextSlot;

impl ContextSlot {
    fn install(ctx: &WorkerContext) -> Self {
        CONTEXT.with(|slot| {
            if !slot.get().is_null() {
                fatal!("OS thread is already running a worker loop");
            }
            slot.set(ctx as *const WorkerContext);
        });
        ContextSlot
    }
}

impl Drop for ContextSlot {
    fn drop(&mut self) {
        CONTEXT.with(|slot| slot.set(ptr::null()));
    }
}

/// 切换后钩子对被切走线程的处理
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PostSwitch {
    /// 回收栈与槽位
    Reclaim,
    /// 立即重新就绪
    Requeue,
    /// 执行续延，把线程发布到等待队列
    Publish,
    /// 交给外部协作者；有续延则执行
    External,
    /// 主循环占位线程，不做处理
    Idle,
}

impl PostSwitch {
    fn for_state(state: UThreadState) -> Self {
        match state {
            UThreadState::Terminated => PostSwitch::Reclaim,
            UThreadState::Yield | UThreadState::Migrate => PostSwitch::Requeue,
            UThreadState::Waiting => PostSwitch::Publish,
            UThreadState::IoBlock => PostSwitch::External,
            UThreadState::Initialized | UThreadState::Ready | UThreadState::Running => {
                fatal!("switched away from a micro-thread in state {:?}", state)
            }
        }
    }
}

/// 通过 `switch_stack` 传给钩子的参数，位于被切走线程的栈上
struct SwitchArgs<'a> {
    prev: u32,
    next: u32,
    continuation: Option<&'a mut dyn FnMut()>,
}

/// 工作线程调度上下文
pub(crate) struct WorkerContext {
    cluster: Cluster,
    /// 本地就绪队列，只有本线程访问
    ready: RefCell<UtList>,
    /// 正在执行的微线程
    current: Cell<u32>,
    /// 主循环占位线程
    main: u32,
    /// 是否运行 `default_run`；否则本地队列不接收工作
    dispatches: bool,
}

impl WorkerContext {
    fn new(cluster: Cluster, main: u32, dispatches: bool) -> Self {
        Self {
            cluster,
            ready: RefCell::new(UtList::new(uthread::links())),
            current: Cell::new(main),
            main,
            dispatches,
        }
    }

    #[inline]
    pub(crate) fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    #[inline]
    pub(crate) fn current(&self) -> u32 {
        self.current.get()
    }

    #[inline]
    pub(crate) fn main(&self) -> u32 {
        self.main
    }

    /// 直接放进本地队列
    ///
    /// 本 cluster 有空闲工作线程、共享池非空或本地队列已满时拒绝，由调用方提交到共享池。
    pub(crate) fn try_push_local(&self, index: u32) -> bool {
        if !self.dispatches || self.cluster.idle_kthreads() > 0 || self.cluster.queued() > 0 {
            return false;
        }
        let mut ready = self.ready.borrow_mut();
        if ready.len() >= self.cluster.batch_size() {
            return false;
        }
        ready.push_back(index);
        true
    }

    fn pop_local(&self) -> Option<u32> {
        self.ready.borrow_mut().pop_front()
    }

    /// 从当前微线程切走，选择下一个要运行的线程
    ///
    /// 调用前当前线程的状态必须已经设好。返回时调用者可能已经在另一个 OS 线程上，
    /// 之后不能再使用 `self`。
    pub(crate) fn switch_context(&self, continuation: Option<&mut dyn FnMut()>) {
        let next = match self.pop_local() {
            Some(next) => next,
            None => {
                // 1. 本地队列空，尝试从 cluster 补充
                if self.cluster.try_get_work(&mut self.ready.borrow_mut()) > 0 {
                    match self.pop_local() {
                        Some(next) => next,
                        None => fatal!("local ready queue empty right after a refill"),
                    }
                } else {
                    // 2. 没有其他工作：让出的线程继续运行
                    let current = self.current.get();
                    if record(current).state() == UThreadState::Yield {
                        record(current).set_state(UThreadState::Running);
                        return;
                    }
                    // 3. 回到主循环占位线程
                    self.main
                }
            }
        };
        self.switch_to(next, continuation);
    }

    /// 切换到 `next`
    fn switch_to(&self, next: u32, continuation: Option<&mut dyn FnMut()>) {
        let prev = self.current.get();
        let next_sp = record(next).sp().load(Ordering::Acquire);
        if next_sp == 0 {
            fatal!("switch to micro-thread {} with no saved stack pointer", record(next).id());
        }
        trace!("switch {} -> {}", record(prev).id(), record(next).id());

        let mut args = SwitchArgs { prev, next, continuation };
        unsafe {
            arch::switch_stack(
                record(prev).sp().as_ptr(),
                next_sp,
                &mut args as *mut SwitchArgs<'_> as *mut u8,
                post_switch,
            );
        }
    }

    /// 主循环：本地有就执行本地的，否则阻塞向 cluster 取；cluster 关闭且无工作时退出
    fn default_run(&self) {
        loop {
            match self.pop_local() {
                Some(next) => self.switch_to(next, None),
                None => {
                    if !self.cluster.get_work(&mut self.ready.borrow_mut()) {
                        break;
                    }
                }
            }
        }
    }
}

/// 切换后钩子
///
/// 在新栈上、目标寄存器恢复之前运行。此时被切走线程的寄存器已经完整保存，
/// 可以安全地把它交给别的线程。
unsafe extern "C" fn post_switch(arg: *mut u8) {
    let args = unsafe { &mut *(arg as *mut SwitchArgs<'_>) };
    let (prev, next) = (args.prev, args.next);
    let continuation = args.continuation.take();

    let Some(ctx) = context() else {
        fatal!("context switch outside of a worker thread");
    };
    let action = if prev == ctx.main {
        PostSwitch::Idle
    } else {
        PostSwitch::for_state(record(prev).state())
    };

    match action {
        PostSwitch::Reclaim => uthread::reclaim(prev),
        PostSwitch::Requeue => uthread::requeue(prev),
        PostSwitch::Publish => match continuation {
            Some(publish) => publish(),
            None => fatal!("micro-thread {} is waiting without a continuation", record(prev).id()),
        },
        PostSwitch::External => {
            if let Some(publish) = continuation {
                publish();
            }
        }
        PostSwitch::Idle => {}
    }

    ctx.current.set(next);
    let rec = record(next);
    rec.set_state(UThreadState::Running);
    rec.sp().store(0, Ordering::Release);
}

/// 工作线程的主体
enum Body {
    /// 调度循环，直到 cluster 关闭且没有可运行的工作
    DefaultRun,
    /// 执行调用方的函数，不调度微线程
    Func(Box<dyn FnOnce() + Send>),
}

/// 在当前 OS 线程上安装调度上下文并运行 `body`
///
/// `started` 在计数器更新之后、进入主体之前调用。
fn work(cluster: &Cluster, main: u32, id: u64, body: Body, started: impl FnOnce()) {
    let dispatches = matches!(body, Body::DefaultRun);
    let ctx = WorkerContext::new(cluster.clone(), main, dispatches);
    TOTAL_KTHREADS.fetch_add(1, Ordering::AcqRel);
    cluster.kthread_started();
    debug!("kthread {} started on cluster {}", id, cluster.name());
    started();

    {
        let _slot = ContextSlot::install(&ctx);
        match body {
            Body::DefaultRun => ctx.default_run(),
            Body::Func(f) => {
                if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
                    error!("kthread {} function panicked", id);
                }
            }
        }
    }

    cluster.kthread_exited();
    TOTAL_KTHREADS.fetch_sub(1, Ordering::AcqRel);
    uthread::reclaim(main);
    debug!("kthread {} exited from cluster {}", id, cluster.name());
}

fn current_pthread() -> libc::pthread_t {
    unsafe { libc::pthread_self() }
}

/// 工作线程句柄
///
/// 丢弃句柄不会停止线程；线程在 cluster 关闭后自行退出。
pub struct KThread {
    id: u64,
    cluster: Cluster,
    pthread: libc::pthread_t,
    handle: Option<JoinHandle<()>>,
}

impl KThread {
    /// 在 `cluster` 上启动一个新的工作线程
    ///
    /// 返回时线程已经进入工作循环。
    pub fn new(cluster: &Cluster) -> Result<Self> {
        Self::spawn(cluster, Body::DefaultRun)
    }

    /// 启动一个属于 `cluster` 的工作线程，执行 `f` 而不是调度循环
    ///
    /// `f` 在该线程自己的栈上运行，可以创建和提交微线程，但这个线程本身不执行微线程。
    /// `f` 返回后线程退出。
    pub fn with_fn<F>(cluster: &Cluster, f: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::spawn(cluster, Body::Func(Box::new(f)))
    }

    fn spawn(cluster: &Cluster, body: Body) -> Result<Self> {
        let id = NEXT_KTHREAD_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded::<Result<libc::pthread_t>>(1);
        let worker_cluster = cluster.clone();

        let handle = thread::Builder::new()
            .name(format!("{}-{}", WORKER_NAME_PREFIX, id))
            .spawn(move || {
                let main = match uthread::create_placeholder(&worker_cluster) {
                    Ok(main) => main,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                };
                work(&worker_cluster, main, id, body, move || {
                    let _ = tx.send(Ok(current_pthread()));
                });
            })?;

        let pthread = match rx.recv() {
            Ok(Ok(pthread)) => pthread,
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(Error::Spawn(std::io::Error::other(
                    "worker thread exited before starting",
                )));
            }
        };

        Ok(Self {
            id,
            cluster: cluster.clone(),
            pthread,
            handle: Some(handle),
        })
    }

    /// 把调用线程变成 `cluster` 的工作线程，直到 cluster 关闭
    pub fn run_on_current(cluster: &Cluster) -> Result<()> {
        if context().is_some() {
            fatal!("run_on_current called from inside a worker thread");
        }
        let id = NEXT_KTHREAD_ID.fetch_add(1, Ordering::Relaxed);
        let main = uthread::create_placeholder(cluster)?;
        work(cluster, main, id, Body::DefaultRun, || {});
        Ok(())
    }

    /// 等待线程退出
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                fatal!("kthread {} cannot join itself", self.id);
            }
            let _ = handle.join();
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// 底层 pthread 句柄
    #[inline]
    pub fn native_handle(&self) -> libc::pthread_t {
        self.pthread
    }

    /// 进程内存活的工作线程数
    pub fn count() -> usize {
        TOTAL_KTHREADS.load(Ordering::Acquire)
    }

    /// 调用线程是工作线程时返回其 pthread 句柄
    pub fn current_native_handle() -> Option<libc::pthread_t> {
        context().map(|_| current_pthread())
    }
}

impl std::fmt::Debug for KThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KThread")
            .field("id", &self.id)
            .field("cluster", &self.cluster.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_switch_actions() {
        assert_eq!(PostSwitch::for_state(UThreadState::Terminated), PostSwitch::Reclaim);
        assert_eq!(PostSwitch::for_state(UThreadState::Yield), PostSwitch::Requeue);
        assert_eq!(PostSwitch::for_state(UThreadState::Migrate), PostSwitch::Requeue);
        assert_eq!(PostSwitch::for_state(UThreadState::Waiting), PostSwitch::Publish);
        assert_eq!(PostSwitch::for_state(UThreadState::IoBlock), PostSwitch::External);
    }

    #[test]
    fn test_no_context_on_plain_thread() {
        assert!(context().is_none());
        assert!(KThread::current_native_handle().is_none());
    }

    #[test]
    fn test_with_fn_runs_on_worker_without_dispatching() {
        let cluster = Cluster::new();
        let (tx, rx) = bounded(1);
        let kt_cluster = cluster.clone();
        let kt = KThread::with_fn(&cluster, move || {
            let ctx = context().unwrap();
            let ut = uthread::UThread::create(crate::config::MIN_STACK_SIZE).unwrap();
            ut.start(&kt_cluster, || {}).unwrap();
            tx.send((ctx.cluster() == &kt_cluster, ctx.current() == ctx.main()))
                .unwrap();
        })
        .unwrap();

        let (same_cluster, on_main) = rx.recv().unwrap();
        assert!(same_cluster);
        assert!(on_main);
        kt.join();

        // 本线程不调度，启动的微线程进了共享池
        assert_eq!(cluster.queued(), 1);
        assert_eq!(cluster.kthread_count(), 0);

        let runner = KThread::new(&cluster).unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while cluster.live_uthreads() > 0 {
            assert!(std::time::Instant::now() < deadline);
            thread::sleep(std::time::Duration::from_millis(1));
        }
        cluster.shutdown();
        runner.join();
    }

    #[test]
    fn test_kthread_lifecycle() {
        let cluster = Cluster::new();
        let kt = KThread::new(&cluster).unwrap();
        assert_eq!(kt.cluster(), &cluster);
        assert_eq!(cluster.kthread_count(), 1);
        assert!(KThread::count() >= 1);

        cluster.shutdown();
        kt.join();
        assert_eq!(cluster.kthread_count(), 0);
    }
}
