//! 微线程阻塞同步原语
//!
//! `BlockingQueue` 自己不带锁，等待队列由调用方的外部锁保护：
//! `suspend` 在持锁状态下挂起调用者，续延先把调用者挂到队尾再释放锁，
//! 因此 `signal` 看到的等待者一定已经保存好了寄存器，也不会丢失唤醒。
//!
//! `Mutex<T>` 建立在它之上，被阻塞的是微线程而不是工作线程。

use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};

use log::warn;
use parking_lot::MutexGuard as RawGuard;

use crate::runtime::list::UtList;
use crate::runtime::uthread::{self, UThread};
use crate::runtime::UtId;

/// 微线程等待队列，FIFO 唤醒
pub struct BlockingQueue {
    waiters: UtList,
}

impl BlockingQueue {
    pub fn new() -> Self {
        Self {
            waiters: UtList::new(uthread::links()),
        }
    }

    /// 等待者数量
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// 队首等待者
    pub(crate) fn front(&self) -> Option<UThread> {
        self.waiters.front().map(UThread::from_index)
    }

    /// 挂起调用者
    ///
    /// `guard` 保护着队列；调用者被挂到队尾之后锁才释放。
    /// 醒来时锁不再持有，需要的话由调用者重新获取。
    pub fn suspend<T: AsMut<BlockingQueue>>(mut guard: RawGuard<'_, T>) {
        let Some(current) = UThread::current() else {
            fatal!("BlockingQueue::suspend called outside of a micro-thread");
        };
        UThread::suspend(move || {
            AsMut::<BlockingQueue>::as_mut(&mut *guard)
                .waiters
                .push_back(current.index());
            drop(guard);
        });
    }

    /// 唤醒队首等待者，返回是否有人被唤醒
    pub fn signal<T: AsMut<BlockingQueue>>(mut guard: RawGuard<'_, T>) -> bool {
        let next = AsMut::<BlockingQueue>::as_mut(&mut *guard).waiters.pop_front();
        drop(guard);
        match next {
            Some(index) => {
                UThread::from_index(index).resume();
                true
            }
            None => false,
        }
    }

    /// 唤醒全部等待者，返回唤醒数量
    pub fn signal_all<T: AsMut<BlockingQueue>>(mut guard: RawGuard<'_, T>) -> usize {
        let queue = AsMut::<BlockingQueue>::as_mut(&mut *guard);
        let mut woken = 0;
        while let Some(index) = queue.waiters.pop_front() {
            UThread::from_index(index).resume();
            woken += 1;
        }
        drop(guard);
        woken
    }
}

impl AsMut<BlockingQueue> for BlockingQueue {
    fn as_mut(&mut self) -> &mut BlockingQueue {
        self
    }
}

impl Default for BlockingQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BlockingQueue {
    fn drop(&mut self) {
        if !self.waiters.is_empty() {
            warn!(
                "blocking queue dropped with {} parked micro-threads",
                self.waiters.len()
            );
        }
    }
}

impl fmt::Debug for BlockingQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingQueue")
            .field("waiters", &self.waiters.len())
            .finish()
    }
}

struct LockState {
    locked: bool,
    /// 持有者；普通 OS 线程持有时为 `None`
    owner: Option<UtId>,
    waiters: BlockingQueue,
}

impl AsMut<BlockingQueue> for LockState {
    fn as_mut(&mut self) -> &mut BlockingQueue {
        &mut self.waiters
    }
}

/// 微线程互斥锁
///
/// 竞争时挂起的是微线程。解锁时若有等待者，所有权直接交给队首，
/// 锁在交接过程中始终保持锁定，后来者无法插队。
pub struct Mutex<T: ?Sized> {
    state: parking_lot::Mutex<LockState>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: parking_lot::Mutex::new(LockState {
                locked: false,
                owner: None,
                waiters: BlockingQueue::new(),
            }),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// 获取锁，竞争时挂起当前微线程
    ///
    /// 在普通 OS 线程上调用时以让出 CPU 的方式自旋等待。
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let me = UThread::current();
        let mut state = self.state.lock();
        loop {
            if !state.locked {
                state.locked = true;
                state.owner = me.map(|ut| ut.id());
                return MutexGuard::new(self);
            }
            match me {
                Some(me) => {
                    if state.owner == Some(me.id()) {
                        fatal!("micro-thread {} locked a mutex it already holds", me.id());
                    }
                    BlockingQueue::suspend(state);
                    // 醒来时所有权已经交到手上
                    return MutexGuard::new(self);
                }
                None => {
                    drop(state);
                    std::thread::yield_now();
                    state = self.state.lock();
                }
            }
        }
    }

    /// 尝试获取锁，不阻塞
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let mut state = self.state.lock();
        if state.locked {
            return None;
        }
        state.locked = true;
        state.owner = UThread::current().map(|ut| ut.id());
        Some(MutexGuard::new(self))
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    /// 持有锁的微线程 id
    pub fn owner(&self) -> Option<UtId> {
        self.state.lock().owner
    }

    /// 排队等待的微线程数
    pub fn waiters(&self) -> usize {
        self.state.lock().waiters.len()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn unlock(&self) {
        let mut state = self.state.lock();
        match state.waiters.front() {
            Some(next) => {
                state.owner = Some(next.id());
                BlockingQueue::signal(state);
            }
            None => {
                state.locked = false;
                state.owner = None;
            }
        }
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Mutex")
            .field("locked", &state.locked)
            .field("owner", &state.owner)
            .field("waiters", &state.waiters.len())
            .finish_non_exhaustive()
    }
}

/// `Mutex` 的 RAII 守卫，析构时解锁
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
    _marker: PhantomData<&'a mut T>,
}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    fn new(mutex: &'a Mutex<T>) -> Self {
        Self {
            mutex,
            _marker: PhantomData,
        }
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocking_queue_empty() {
        let queue = parking_lot::Mutex::new(BlockingQueue::new());
        assert!(queue.lock().is_empty());
        assert!(!BlockingQueue::signal(queue.lock()));
        assert_eq!(BlockingQueue::signal_all(queue.lock()), 0);
    }

    #[test]
    fn test_mutex_on_plain_thread() {
        let mutex = Mutex::new(5);
        {
            let mut guard = mutex.lock();
            *guard += 1;
            assert!(mutex.is_locked());
            assert!(mutex.try_lock().is_none());
            assert_eq!(mutex.owner(), None);
        }
        assert!(!mutex.is_locked());
        assert_eq!(*mutex.try_lock().unwrap(), 6);
        assert_eq!(mutex.into_inner(), 6);
    }

    #[test]
    fn test_mutex_get_mut() {
        let mut mutex = Mutex::new(vec![1, 2]);
        mutex.get_mut().push(3);
        assert_eq!(*mutex.lock(), vec![1, 2, 3]);
        assert_eq!(mutex.waiters(), 0);
    }

    #[test]
    fn test_mutex_between_os_threads() {
        let mutex = std::sync::Arc::new(Mutex::new(0u32));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let mutex = mutex.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        *mutex.lock() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*mutex.lock(), 400);
    }
}
