//! C 接口
//!
//! 每个函数都是对核心 API 的直接转发；句柄以不透明指针的形式交给调用方，
//! 由对应的 destroy 函数释放。

#![allow(non_snake_case)]

use std::ffi::c_void;
use std::ptr;

use log::error;

use crate::runtime::{Cluster, KThread, UThread};

/// C 入口函数类型
pub type StartRoutine = unsafe extern "C" fn(arg: *mut c_void) -> *mut c_void;

/// 把调用方的参数指针带进微线程
struct SendPtr(*mut c_void);

// 指针所指对象的线程安全由 C 调用方负责
unsafe impl Send for SendPtr {}

impl SendPtr {
    fn into_inner(self) -> *mut c_void {
        self.0
    }
}

fn spawn_raw(cluster: &Cluster, start_routine: StartRoutine, arg: *mut c_void) -> *mut UThread {
    let arg = SendPtr(arg);
    let spawned = UThread::spawn_on(cluster, move || {
        let arg = arg.into_inner();
        unsafe {
            start_routine(arg);
        }
    });
    match spawned {
        Ok(ut) => Box::into_raw(Box::new(ut)),
        Err(e) => {
            error!("uThread_create failed: {}", e);
            ptr::null_mut()
        }
    }
}

/*************Cluster*************/

#[no_mangle]
pub extern "C" fn cluster_create() -> *mut Cluster {
    Box::into_raw(Box::new(Cluster::new()))
}

/// 关闭 cluster 并释放句柄
///
/// # Safety
///
/// `cluster` 必须来自 `cluster_create` 且只释放一次。
#[no_mangle]
pub unsafe extern "C" fn cluster_destroy(cluster: *mut Cluster) {
    if cluster.is_null() {
        return;
    }
    let cluster = unsafe { Box::from_raw(cluster) };
    cluster.shutdown();
    cluster.join();
}

/*************kThread*************/

/// 在 `cluster` 上启动工作线程，失败返回空指针
///
/// # Safety
///
/// `cluster` 必须是有效的 cluster 句柄。
#[no_mangle]
pub unsafe extern "C" fn kThread_create(cluster: *mut Cluster) -> *mut KThread {
    let Some(cluster) = (unsafe { cluster.as_ref() }) else {
        return ptr::null_mut();
    };
    match KThread::new(cluster) {
        Ok(kt) => Box::into_raw(Box::new(kt)),
        Err(e) => {
            error!("kThread_create failed: {}", e);
            ptr::null_mut()
        }
    }
}

/// 释放工作线程句柄；线程本身在 cluster 关闭后退出
///
/// # Safety
///
/// `kt` 必须来自 `kThread_create` 且只释放一次。
#[no_mangle]
pub unsafe extern "C" fn kThread_destroy(kt: *mut KThread) {
    if !kt.is_null() {
        drop(unsafe { Box::from_raw(kt) });
    }
}

/// 调用线程的 pthread 句柄；不是工作线程时返回 0
#[no_mangle]
pub extern "C" fn kThread_get_current_pthread_id() -> libc::pthread_t {
    KThread::current_native_handle().unwrap_or(0)
}

/// # Safety
///
/// `kt` 必须是有效的工作线程句柄。
#[no_mangle]
pub unsafe extern "C" fn kThread_get_pthread_id(kt: *mut KThread) -> libc::pthread_t {
    match unsafe { kt.as_ref() } {
        Some(kt) => kt.native_handle(),
        None => 0,
    }
}

#[no_mangle]
pub extern "C" fn kThread_count() -> u64 {
    KThread::count() as u64
}

/*************uThread*************/

/// 在默认 cluster 上启动微线程
#[no_mangle]
pub extern "C" fn uThread_create(start_routine: StartRoutine, arg: *mut c_void) -> *mut UThread {
    spawn_raw(Cluster::default_cluster(), start_routine, arg)
}

/// # Safety
///
/// `cluster` 必须是有效的 cluster 句柄。
#[no_mangle]
pub unsafe extern "C" fn uThread_create_with_cluster(
    cluster: *mut Cluster,
    start_routine: StartRoutine,
    arg: *mut c_void,
) -> *mut UThread {
    match unsafe { cluster.as_ref() } {
        Some(cluster) => spawn_raw(cluster, start_routine, arg),
        None => ptr::null_mut(),
    }
}

/// 把调用者迁移到 `cluster`
///
/// # Safety
///
/// `cluster` 必须是有效的 cluster 句柄。
#[no_mangle]
pub unsafe extern "C" fn uThread_migrate(cluster: *mut Cluster) {
    if let Some(cluster) = unsafe { cluster.as_ref() } {
        UThread::migrate(cluster);
    }
}

/// 释放微线程句柄，不影响微线程本身
///
/// # Safety
///
/// `ut` 必须来自 `uThread_create*` 且只释放一次。
#[no_mangle]
pub unsafe extern "C" fn uThread_destroy(ut: *mut UThread) {
    if !ut.is_null() {
        drop(unsafe { Box::from_raw(ut) });
    }
}

#[no_mangle]
pub extern "C" fn uThread_yield() {
    UThread::yield_now();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    static RUNS: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn bump(arg: *mut c_void) -> *mut c_void {
        RUNS.fetch_add(arg as usize, Ordering::SeqCst);
        uThread_yield();
        ptr::null_mut()
    }

    #[test]
    fn test_ffi_round_trip() {
        let cluster = cluster_create();
        let kt = unsafe { kThread_create(cluster) };
        assert!(!kt.is_null());
        assert_ne!(unsafe { kThread_get_pthread_id(kt) }, 0);
        assert!(kThread_count() >= 1);
        assert_eq!(kThread_get_current_pthread_id(), 0);

        let ut = unsafe { uThread_create_with_cluster(cluster, bump, 3 as *mut c_void) };
        assert!(!ut.is_null());

        let deadline = Instant::now() + Duration::from_secs(10);
        while RUNS.load(Ordering::SeqCst) < 3 {
            assert!(Instant::now() < deadline, "micro-thread never ran");
            std::thread::sleep(Duration::from_millis(1));
        }

        unsafe {
            uThread_destroy(ut);
            kThread_destroy(kt);
            cluster_destroy(cluster);
        }
    }

    #[test]
    fn test_ffi_null_handles() {
        unsafe {
            assert!(kThread_create(ptr::null_mut()).is_null());
            assert_eq!(kThread_get_pthread_id(ptr::null_mut()), 0);
            assert!(uThread_create_with_cluster(ptr::null_mut(), bump, ptr::null_mut()).is_null());
            cluster_destroy(ptr::null_mut());
            kThread_destroy(ptr::null_mut());
            uThread_destroy(ptr::null_mut());
        }
    }
}
