//! 微线程（uThread）
//!
//! 微线程记录存放在进程级 arena 里，用户只拿到 `UThread` 句柄（槽位下标 + 唯一 id）。
//! 槽位被回收复用后 id 不同，旧句柄因此可以被识别出来。
//!
//! 状态机：
//!
//! ```text
//! Initialized --start--> Ready --dispatch--> Running
//! Running --yield_now/migrate/suspend/suspend_io/terminate--> Yield/Migrate/Waiting/IoBlock/Terminated
//! Yield/Migrate --切换后钩子--> Ready
//! Waiting/IoBlock --resume--> Ready
//! Terminated: 终态，栈和槽位被回收
//! ```

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::OnceLock;

use log::{error, trace};
use parking_lot::Mutex;

use crate::config::{ARENA_CHUNK_SIZE, ARENA_MAX_CHUNKS, DEFAULT_STACK_SIZE, MIN_STACK_SIZE};
use crate::error::{Error, Result};
use crate::runtime::arch;
use crate::runtime::cluster::Cluster;
use crate::runtime::kthread::{self, WorkerContext};
use crate::runtime::list::{Link, LinkStore};
use crate::runtime::stack::{Stack, STACK_CACHE};
use crate::runtime::UtId;

/// 微线程状态
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UThreadState {
    /// 已创建，尚未启动
    Initialized = 0,
    /// 在某个就绪队列里
    Ready = 1,
    /// 正在某个工作线程上执行
    Running = 2,
    /// 主动让出，切换后立刻重新就绪
    Yield = 3,
    /// 正在迁移到另一个 cluster
    Migrate = 4,
    /// 挂在等待队列上，等待 `resume`
    Waiting = 5,
    /// 等待外部 I/O 就绪通知
    IoBlock = 6,
    /// 已结束
    Terminated = 7,
}

impl From<u8> for UThreadState {
    fn from(value: u8) -> Self {
        match value {
            0 => UThreadState::Initialized,
            1 => UThreadState::Ready,
            2 => UThreadState::Running,
            3 => UThreadState::Yield,
            4 => UThreadState::Migrate,
            5 => UThreadState::Waiting,
            6 => UThreadState::IoBlock,
            _ => UThreadState::Terminated,
        }
    }
}

type Entry = Box<dyn FnOnce() + Send + 'static>;

/// 微线程记录
pub(crate) struct Record {
    /// 0 表示槽位空闲
    id: AtomicU64,
    state: AtomicU8,
    /// 保存的栈指针；运行中为 0
    sp: AtomicUsize,
    link: Link,
    stack: Mutex<Option<Stack>>,
    entry: Mutex<Option<Entry>>,
    cluster: Mutex<Option<Cluster>>,
}

impl Record {
    fn new() -> Self {
        Self {
            id: AtomicU64::new(0),
            state: AtomicU8::new(UThreadState::Terminated as u8),
            sp: AtomicUsize::new(0),
            link: Link::new(),
            stack: Mutex::new(None),
            entry: Mutex::new(None),
            cluster: Mutex::new(None),
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> UtId {
        self.id.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn state(&self) -> UThreadState {
        UThreadState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: UThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub(crate) fn sp(&self) -> &AtomicUsize {
        &self.sp
    }

    pub(crate) fn cluster(&self) -> Option<Cluster> {
        self.cluster.lock().clone()
    }
}

/// 分块增长的记录池
struct Arena {
    chunks: [OnceLock<Box<[Record]>>; ARENA_MAX_CHUNKS],
    next: AtomicU32,
    free: Mutex<Vec<u32>>,
}

impl Arena {
    fn alloc(&self) -> Result<u32> {
        if let Some(index) = self.free.lock().pop() {
            return Ok(index);
        }
        let limit = (ARENA_CHUNK_SIZE * ARENA_MAX_CHUNKS) as u32;
        let index = self
            .next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
            .map_err(|_| Error::ArenaExhausted)?;
        self.chunks[index as usize / ARENA_CHUNK_SIZE]
            .get_or_init(|| (0..ARENA_CHUNK_SIZE).map(|_| Record::new()).collect());
        Ok(index)
    }

    fn release(&self, index: u32) {
        self.free.lock().push(index);
    }

    fn get(&self, index: u32) -> &Record {
        let chunk = self
            .chunks
            .get(index as usize / ARENA_CHUNK_SIZE)
            .and_then(OnceLock::get);
        match chunk {
            Some(records) => &records[index as usize % ARENA_CHUNK_SIZE],
            None => fatal!("invalid micro-thread slot {}", index),
        }
    }
}

impl LinkStore for Arena {
    fn link(&self, index: u32) -> &Link {
        &self.get(index).link
    }
}

static ARENA: Arena = Arena {
    chunks: [const { OnceLock::new() }; ARENA_MAX_CHUNKS],
    next: AtomicU32::new(0),
    free: parking_lot::const_mutex(Vec::new()),
};

/// id 分配器，0 保留给空闲槽位
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// 已启动但未结束的微线程数（不含占位线程）
static LIVE: AtomicUsize = AtomicUsize::new(0);

#[inline]
pub(crate) fn record(index: u32) -> &'static Record {
    ARENA.get(index)
}

/// 链表用的下标存储
pub(crate) fn links() -> &'static dyn LinkStore {
    &ARENA
}

/// 微线程句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UThread {
    index: u32,
    id: UtId,
}

impl UThread {
    /// 以默认栈大小创建微线程
    pub fn new() -> Result<Self> {
        Self::create(DEFAULT_STACK_SIZE)
    }

    /// 创建一个处于 `Initialized` 状态的微线程
    ///
    /// 优先从栈缓存中取同尺寸的栈。
    pub fn create(stack_size: usize) -> Result<Self> {
        if stack_size < MIN_STACK_SIZE {
            return Err(Error::InvalidStackSize {
                size: stack_size,
                min: MIN_STACK_SIZE,
            });
        }
        let stack = match STACK_CACHE.take(stack_size) {
            Some(stack) => stack,
            None => Stack::new(stack_size)?,
        };
        let index = match ARENA.alloc() {
            Ok(index) => index,
            Err(e) => {
                let _ = STACK_CACHE.give(stack);
                return Err(e);
            }
        };

        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let rec = record(index);
        *rec.stack.lock() = Some(stack);
        rec.sp.store(0, Ordering::Relaxed);
        rec.set_state(UThreadState::Initialized);
        rec.id.store(id, Ordering::Release);
        Ok(Self { index, id })
    }

    /// 在默认 cluster 上创建并启动
    pub fn spawn<F>(f: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::spawn_on(Cluster::default_cluster(), f)
    }

    /// 在指定 cluster 上创建并启动，栈大小取该 cluster 的配置
    pub fn spawn_on<F>(cluster: &Cluster, f: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let ut = Self::create(cluster.stack_size())?;
        if let Err(e) = ut.start(cluster, f) {
            ut.destroy();
            return Err(e);
        }
        Ok(ut)
    }

    /// 绑定入口并交给 `cluster` 调度
    ///
    /// 每个微线程只能启动一次，重复启动是致命错误。
    pub fn start<F>(&self, cluster: &Cluster, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let rec = self.record();
        if rec.state() != UThreadState::Initialized {
            fatal!("micro-thread {} started twice (state {:?})", self.id, rec.state());
        }
        if cluster.is_shutdown() {
            return Err(Error::ClusterShutdown(cluster.id()));
        }

        let Some(top) = rec.stack.lock().as_ref().map(Stack::top) else {
            fatal!("micro-thread {} has no stack", self.id);
        };
        *rec.entry.lock() = Some(Box::new(f));
        let sp = unsafe { arch::init_stack(top, uthread_main, self.index as usize as *mut u8) };
        rec.sp.store(sp, Ordering::Release);

        *rec.cluster.lock() = Some(cluster.clone());
        cluster.attach();
        LIVE.fetch_add(1, Ordering::AcqRel);
        rec.set_state(UThreadState::Ready);
        trace!("micro-thread {} started on cluster {}", self.id, cluster.id());

        schedule(self.index, cluster);
        Ok(())
    }

    /// 销毁一个从未启动的微线程，栈交回缓存
    pub fn destroy(self) {
        let rec = self.record();
        if rec.state() != UThreadState::Initialized {
            fatal!("cannot destroy micro-thread {} in state {:?}", self.id, rec.state());
        }
        reclaim(self.index);
    }

    /// 让出当前工作线程
    ///
    /// 不在微线程里调用时退化为 `std::thread::yield_now`。
    pub fn yield_now() {
        match running() {
            Some((ctx, current)) => {
                record(current).set_state(UThreadState::Yield);
                ctx.switch_context(None);
            }
            None => std::thread::yield_now(),
        }
    }

    /// 把调用者迁移到 `target`，返回时已在 `target` 的工作线程上运行
    pub fn migrate(target: &Cluster) {
        let Some((ctx, current)) = running() else {
            fatal!("migrate called outside of a micro-thread");
        };
        let rec = record(current);
        {
            let mut slot = rec.cluster.lock();
            if slot.as_ref() == Some(target) {
                return;
            }
            if let Some(old) = slot.replace(target.clone()) {
                old.detach();
            }
            target.attach();
        }
        trace!("micro-thread {} migrating to cluster {}", rec.id(), target.id());
        rec.set_state(UThreadState::Migrate);
        ctx.switch_context(None);
    }

    /// 挂起调用者，进入 `Waiting`
    ///
    /// `continuation` 在寄存器保存完毕之后、于下一个上下文上执行，
    /// 负责把调用者发布到某个等待队列；此后只能由 `resume` 唤醒。
    pub fn suspend<F: FnOnce()>(continuation: F) {
        park(UThreadState::Waiting, continuation);
    }

    /// 挂起调用者，进入 `IoBlock`
    ///
    /// 与 `suspend` 相同的发布时序；运行循环不会碰 `IoBlock` 的微线程，
    /// 直到外部的就绪通知者调用 `resume`。
    pub fn suspend_io<F: FnOnce()>(continuation: F) {
        park(UThreadState::IoBlock, continuation);
    }

    /// 把挂起的微线程重新放回就绪路径
    ///
    /// 只有 `Waiting` 和 `IoBlock` 的微线程可以被唤醒，其他状态是致命错误。
    pub fn resume(&self) {
        let rec = self.record();
        match rec.state() {
            UThreadState::Waiting | UThreadState::IoBlock => {}
            state => fatal!("cannot resume micro-thread {} in state {:?}", self.id, state),
        }
        requeue(self.index);
    }

    /// 结束调用者
    ///
    /// 调用者栈上尚存活的局部变量不会被析构。
    pub fn terminate() -> ! {
        let Some((ctx, current)) = running() else {
            fatal!("terminate called outside of a micro-thread");
        };
        let rec = record(current);
        if let Some(cluster) = rec.cluster() {
            cluster.detach();
        }
        LIVE.fetch_sub(1, Ordering::AcqRel);
        rec.set_state(UThreadState::Terminated);
        trace!("micro-thread {} terminated", rec.id());
        ctx.switch_context(None);
        fatal!("terminated micro-thread {} was resumed", rec.id())
    }

    /// 当前正在执行的微线程；在工作线程主循环或普通线程上为 `None`
    pub fn current() -> Option<Self> {
        running().map(|(_, index)| Self { index, id: record(index).id() })
    }

    #[inline]
    pub fn id(&self) -> UtId {
        self.id
    }

    /// 当前状态；槽位已被回收时返回 `Terminated`
    pub fn state(&self) -> UThreadState {
        let rec = record(self.index);
        if rec.id() != self.id {
            return UThreadState::Terminated;
        }
        rec.state()
    }

    /// 当前所属 cluster
    pub fn cluster(&self) -> Option<Cluster> {
        let rec = record(self.index);
        if rec.id() != self.id {
            return None;
        }
        rec.cluster()
    }

    /// 进程内存活的微线程数
    pub fn live_count() -> usize {
        LIVE.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    pub(crate) fn from_index(index: u32) -> Self {
        Self { index, id: record(index).id() }
    }

    fn record(&self) -> &'static Record {
        let rec = record(self.index);
        if rec.id() != self.id {
            fatal!("stale micro-thread handle {}", self.id);
        }
        rec
    }
}

/// 调用者所在的工作线程及正在运行的微线程
fn running() -> Option<(&'static WorkerContext, u32)> {
    let ctx = kthread::context()?;
    let current = ctx.current();
    (current != ctx.main()).then_some((ctx, current))
}

fn park<F: FnOnce()>(state: UThreadState, continuation: F) {
    let Some((ctx, current)) = running() else {
        fatal!("cannot park outside of a micro-thread");
    };
    let mut continuation = Some(continuation);
    let mut publish = || {
        if let Some(f) = continuation.take() {
            f();
        }
    };
    trace!("micro-thread {} parked as {:?}", record(current).id(), state);
    record(current).set_state(state);
    ctx.switch_context(Some(&mut publish));
}

/// 切换后钩子把让出或迁移的微线程放回就绪路径
pub(crate) fn requeue(index: u32) {
    let rec = record(index);
    let Some(cluster) = rec.cluster() else {
        fatal!("micro-thread {} has no cluster", rec.id());
    };
    rec.set_state(UThreadState::Ready);
    schedule(index, &cluster);
}

/// 把就绪的微线程交给调度
///
/// 当前工作线程属于同一 cluster 且 `try_push_local` 接受时入本地队列，否则进共享池。
fn schedule(index: u32, cluster: &Cluster) {
    if let Some(ctx) = kthread::context() {
        if ctx.cluster() == cluster && ctx.try_push_local(index) {
            return;
        }
    }
    cluster.submit(index);
}

/// 回收已结束的微线程：栈交回缓存，槽位放回空闲表
pub(crate) fn reclaim(index: u32) {
    let rec = record(index);
    if let Some(stack) = rec.stack.lock().take() {
        if let Err(stack) = STACK_CACHE.give(stack) {
            trace!("stack cache full, unmapping {:?}", stack);
        }
    }
    rec.entry.lock().take();
    rec.cluster.lock().take();
    rec.sp.store(0, Ordering::Relaxed);
    rec.set_state(UThreadState::Terminated);
    rec.id.store(0, Ordering::Release);
    ARENA.release(index);
}

/// 为工作线程创建主循环占位微线程：没有自己的栈，不计入存活数
pub(crate) fn create_placeholder(cluster: &Cluster) -> Result<u32> {
    let index = ARENA.alloc()?;
    let rec = record(index);
    *rec.cluster.lock() = Some(cluster.clone());
    rec.sp.store(0, Ordering::Relaxed);
    rec.set_state(UThreadState::Running);
    rec.id.store(NEXT_ID.fetch_add(1, Ordering::Relaxed), Ordering::Release);
    Ok(index)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

/// 每个微线程的入口
unsafe extern "C" fn uthread_main(arg: *mut u8) -> ! {
    let index = arg as usize as u32;
    {
        let rec = record(index);
        let Some(entry) = rec.entry.lock().take() else {
            fatal!("micro-thread {} has no entry", rec.id());
        };
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entry)) {
            error!(
                "micro-thread {} panicked: {}",
                rec.id(),
                panic_message(payload.as_ref())
            );
        }
    }
    UThread::terminate()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_from_u8() {
        for state in [
            UThreadState::Initialized,
            UThreadState::Ready,
            UThreadState::Running,
            UThreadState::Yield,
            UThreadState::Migrate,
            UThreadState::Waiting,
            UThreadState::IoBlock,
            UThreadState::Terminated,
        ] {
            assert_eq!(UThreadState::from(state as u8), state);
        }
    }

    #[test]
    fn test_create_and_destroy() {
        let ut = UThread::create(DEFAULT_STACK_SIZE).unwrap();
        assert_eq!(ut.state(), UThreadState::Initialized);
        assert!(ut.cluster().is_none());

        let other = UThread::create(DEFAULT_STACK_SIZE).unwrap();
        assert!(other.id() > ut.id());

        ut.destroy();
        assert_eq!(ut.state(), UThreadState::Terminated);
        other.destroy();
    }

    #[test]
    fn test_create_rejects_small_stack() {
        let err = UThread::create(MIN_STACK_SIZE - 1).unwrap_err();
        assert!(matches!(err, Error::InvalidStackSize { .. }));
    }

    #[test]
    fn test_small_stack_rejected_even_when_cached() {
        // 先让缓存里留下一个最小尺寸的栈
        UThread::create(MIN_STACK_SIZE).unwrap().destroy();
        let err = UThread::create(MIN_STACK_SIZE - 1).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidStackSize { size, min: MIN_STACK_SIZE } if size == MIN_STACK_SIZE - 1
        ));
    }

    #[test]
    fn test_stale_handle_after_reuse() {
        let first = UThread::create(MIN_STACK_SIZE).unwrap();
        let stale = first;
        first.destroy();

        let second = UThread::create(MIN_STACK_SIZE).unwrap();
        assert_ne!(second.id(), stale.id());
        assert_eq!(stale.state(), UThreadState::Terminated);
        assert_eq!(second.state(), UThreadState::Initialized);
        second.destroy();
    }

    #[test]
    fn test_no_current_outside_worker() {
        assert!(UThread::current().is_none());
        // 普通线程上让出不会出错
        UThread::yield_now();
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(panic_message(payload.as_ref()), "<non-string panic payload>");
    }
}
