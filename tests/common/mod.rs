//! 集成测试公共工具

#![allow(dead_code)]

use std::env;
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use uthreads::{Cluster, ClusterConfig};

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// 带工作线程的 cluster
pub fn cluster(name: &str, workers: usize) -> Cluster {
    Cluster::with_config(ClusterConfig {
        name: name.to_string(),
        workers,
        ..ClusterConfig::default()
    })
    .unwrap()
}

/// 轮询直到条件成立，超时则失败
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// 关闭并等待工作线程退出
pub fn teardown(cluster: Cluster) {
    cluster.shutdown();
    cluster.join();
    assert_eq!(cluster.kthread_count(), 0);
}

/// 当前 OS 线程名
#[inline(never)]
pub fn worker_name() -> Option<String> {
    std::thread::current().name().map(str::to_string)
}

const ABORT_CHILD_ENV: &str = "UTHREADS_ABORT_CHILD";

/// 在子进程里单独运行名为 `test_name` 的测试执行 `body`，断言子进程被 `SIGABRT` 终止
///
/// `test_name` 必须是调用方测试函数的完整名字。
pub fn expect_abort(test_name: &str, body: impl FnOnce()) {
    if env::var_os(ABORT_CHILD_ENV).is_some() {
        body();
        return;
    }
    let status = Command::new(env::current_exe().unwrap())
        .args([test_name, "--exact", "--test-threads=1"])
        .env(ABORT_CHILD_ENV, "1")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert_eq!(
        status.signal(),
        Some(libc::SIGABRT),
        "{} should abort, exited with {}",
        test_name,
        status
    );
}
