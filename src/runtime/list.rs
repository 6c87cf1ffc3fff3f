//! 侵入式双向链表
//!
//! 链接字段嵌在微线程记录里，链表本身只保存首尾下标，不做任何额外分配。
//! `FENCE` 是保留的无效下标，充当哨兵，永远不会是一个真实的微线程。
//!
//! 链表不自带锁：就绪池由 cluster 的锁保护，本地就绪队列只被所属工作线程访问，
//! 等待队列由调用方传入的外部锁保护。

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// 哨兵下标
pub(crate) const FENCE: u32 = u32::MAX;

/// 嵌入在记录中的链接
pub(crate) struct Link {
    prev: AtomicU32,
    next: AtomicU32,
    /// 是否已在某个链表里
    linked: AtomicBool,
}

impl Link {
    pub(crate) const fn new() -> Self {
        Self {
            prev: AtomicU32::new(FENCE),
            next: AtomicU32::new(FENCE),
            linked: AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    fn is_linked(&self) -> bool {
        self.linked.load(Ordering::Relaxed)
    }
}

/// 由下标找到链接
pub(crate) trait LinkStore: Sync {
    fn link(&self, index: u32) -> &Link;
}

/// 按下标串起来的 FIFO 链表
pub(crate) struct UtList {
    store: &'static dyn LinkStore,
    head: u32,
    tail: u32,
    len: usize,
}

impl UtList {
    pub(crate) fn new(store: &'static dyn LinkStore) -> Self {
        Self {
            store,
            head: FENCE,
            tail: FENCE,
            len: 0,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.head == FENCE
    }

    /// 队首下标
    #[inline]
    pub(crate) fn front(&self) -> Option<u32> {
        (self.head != FENCE).then_some(self.head)
    }

    /// 追加到队尾
    ///
    /// 同一个微线程同时出现在两个链表里是致命错误。
    pub(crate) fn push_back(&mut self, index: u32) {
        if index == FENCE {
            fatal!("attempted to enqueue the fence index");
        }
        let link = self.store.link(index);
        if link.linked.swap(true, Ordering::Relaxed) {
            fatal!("micro-thread slot {} is already linked into a queue", index);
        }
        link.prev.store(self.tail, Ordering::Relaxed);
        link.next.store(FENCE, Ordering::Relaxed);

        if self.tail == FENCE {
            self.head = index;
        } else {
            self.store.link(self.tail).next.store(index, Ordering::Relaxed);
        }
        self.tail = index;
        self.len += 1;
    }

    /// 从链表中摘除 `index`
    pub(crate) fn remove(&mut self, index: u32) {
        let link = self.store.link(index);
        if !link.linked.swap(false, Ordering::Relaxed) {
            fatal!("micro-thread slot {} is not linked into a queue", index);
        }
        let prev = link.prev.swap(FENCE, Ordering::Relaxed);
        let next = link.next.swap(FENCE, Ordering::Relaxed);

        if prev == FENCE {
            self.head = next;
        } else {
            self.store.link(prev).next.store(next, Ordering::Relaxed);
        }
        if next == FENCE {
            self.tail = prev;
        } else {
            self.store.link(next).prev.store(prev, Ordering::Relaxed);
        }
        self.len -= 1;
    }

    /// 弹出队首
    pub(crate) fn pop_front(&mut self) -> Option<u32> {
        let head = self.front()?;
        self.remove(head);
        Some(head)
    }

    /// 从队首移动至多 `max` 个到 `dst` 队尾，保持顺序
    pub(crate) fn transfer(&mut self, dst: &mut UtList, max: usize) -> usize {
        let mut moved = 0;
        while moved < max {
            let Some(index) = self.pop_front() else {
                break;
            };
            dst.push_back(index);
            moved += 1;
        }
        moved
    }
}

impl std::fmt::Debug for UtList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UtList")
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("len", &self.len)
            .finish()
    }
}
