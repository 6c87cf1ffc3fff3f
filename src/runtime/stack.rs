//! 微线程栈管理
//!
//! 每个栈是一段 mmap 得到的连续内存，最低的一页设为保护页，
//! 栈从高地址向低地址增长。微线程结束后栈交回有界缓存，供下一个同尺寸的微线程复用。

use std::io;
use std::ptr::{self, NonNull};
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::config::{MIN_STACK_SIZE, STACK_CACHE_CAPACITY};
use crate::error::{Error, Result};

const MAP_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK;

/// 系统页大小
fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    })
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// 微线程栈
pub struct Stack {
    /// 映射起始地址（保护页）
    base: NonNull<u8>,
    /// 映射总长度，含保护页
    mapped: usize,
    /// 可用容量
    capacity: usize,
}

impl Stack {
    /// 分配一个至少 `size` 字节的栈
    pub fn new(size: usize) -> Result<Self> {
        if size < MIN_STACK_SIZE {
            return Err(Error::InvalidStackSize { size, min: MIN_STACK_SIZE });
        }

        let page = page_size();
        let capacity = Self::rounded(size);
        let mapped = capacity + page;

        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                MAP_FLAGS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(Error::StackAlloc { size, errno: last_errno() });
        }

        // 最低一页不可访问，溢出时直接 SIGSEGV
        if unsafe { libc::mprotect(raw, page, libc::PROT_NONE) } != 0 {
            let errno = last_errno();
            unsafe {
                libc::munmap(raw, mapped);
            }
            return Err(Error::StackAlloc { size, errno });
        }

        let base = NonNull::new(raw as *mut u8).ok_or(Error::StackAlloc { size, errno: 0 })?;
        Ok(Self { base, mapped, capacity })
    }

    /// 把请求的大小向上取整到页
    #[inline]
    pub fn rounded(size: usize) -> usize {
        let page = page_size();
        size.div_ceil(page) * page
    }

    /// 最低可用地址（保护页之上）
    #[inline]
    pub fn bottom(&self) -> usize {
        self.base.as_ptr() as usize + page_size()
    }

    /// 栈顶（最高地址，初始栈指针从这里往下）
    #[inline]
    pub fn top(&self) -> usize {
        self.base.as_ptr() as usize + self.mapped
    }

    /// 可用容量
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 地址是否落在可用区间内
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.bottom() && addr <= self.top()
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.mapped);
        }
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("bottom", &format_args!("{:#x}", self.bottom()))
            .field("top", &format_args!("{:#x}", self.top()))
            .field("capacity", &self.capacity)
            .finish()
    }
}

// 栈内存只被拥有它的微线程使用，所有权随微线程在线程间转移
unsafe impl Send for Stack {}

/// 有界栈缓存
pub(crate) struct StackCache {
    stacks: Mutex<Vec<Stack>>,
    capacity: usize,
}

impl StackCache {
    pub(crate) const fn new(capacity: usize) -> Self {
        Self {
            stacks: parking_lot::const_mutex(Vec::new()),
            capacity,
        }
    }

    /// 取出一个尺寸匹配的栈
    pub(crate) fn take(&self, size: usize) -> Option<Stack> {
        let wanted = Stack::rounded(size);
        let mut stacks = self.stacks.lock();
        let pos = stacks.iter().rposition(|s| s.capacity() == wanted)?;
        Some(stacks.swap_remove(pos))
    }

    /// 归还一个栈；缓存已满时原样退回，由调用方释放
    pub(crate) fn give(&self, stack: Stack) -> std::result::Result<(), Stack> {
        let mut stacks = self.stacks.lock();
        if stacks.len() >= self.capacity {
            return Err(stack);
        }
        stacks.push(stack);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.stacks.lock().len()
    }
}

/// 进程级栈缓存
pub(crate) static STACK_CACHE: StackCache = StackCache::new(STACK_CACHE_CAPACITY);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_new() {
        let stack = Stack::new(64 * 1024).unwrap();
        assert!(stack.capacity() >= 64 * 1024);
        assert_eq!(stack.top() - stack.bottom(), stack.capacity());
        assert_eq!(stack.top() % page_size(), 0);
        assert!(stack.contains(stack.top() - 8));
        assert!(!stack.contains(stack.bottom() - 1));
    }

    #[test]
    fn test_stack_too_small() {
        let err = Stack::new(1024).unwrap_err();
        assert!(matches!(err, Error::InvalidStackSize { size: 1024, .. }));
    }

    #[test]
    fn test_stack_is_writable() {
        let stack = Stack::new(MIN_STACK_SIZE).unwrap();
        let word = (stack.top() - 8) as *mut u64;
        unsafe {
            word.write(0xdead_beef);
            assert_eq!(word.read(), 0xdead_beef);
        }
    }

    #[test]
    fn test_stack_cache_reuse() {
        let cache = StackCache::new(2);
        let stack = Stack::new(32 * 1024).unwrap();
        let top = stack.top();
        assert!(cache.give(stack).is_ok());

        assert!(cache.take(64 * 1024).is_none());
        let reused = cache.take(32 * 1024).unwrap();
        assert_eq!(reused.top(), top);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_stack_cache_bounded() {
        let cache = StackCache::new(1);
        assert!(cache.give(Stack::new(MIN_STACK_SIZE).unwrap()).is_ok());
        assert!(cache.give(Stack::new(MIN_STACK_SIZE).unwrap()).is_err());
        assert_eq!(cache.len(), 1);
    }
}
