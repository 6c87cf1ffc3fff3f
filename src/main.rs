//! uthreads 演示程序
//!
//! 在一个 cluster 上启动若干微线程，在 `Mutex` 保护下累加计数器，最后打印统计。

use std::env;
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use uthreads::config::VERSION;
use uthreads::{Cluster, ClusterConfig, KThread, Mutex, UThread};

/// 打印帮助信息
fn print_help() {
    println!("Usage: uthreads [command]");
    println!();
    println!("Commands:");
    println!("  run [workers] [count]   Run the counter demo (default: 2 workers, 100 micro-threads)");
    println!("  help                    Show this help message");
    println!("  version                 Show version information");
}

fn parse_arg(value: Option<&&str>, default: usize) -> usize {
    match value {
        None => default,
        Some(s) => s.parse().unwrap_or_else(|_| {
            eprintln!("invalid number: {}", s);
            process::exit(1);
        }),
    }
}

/// 计数器演示
fn run_demo(workers: usize, count: usize) {
    let config = ClusterConfig {
        name: String::from("demo"),
        workers: workers.max(1),
        ..ClusterConfig::default()
    };
    let cluster = match Cluster::with_config(config) {
        Ok(cluster) => cluster,
        Err(e) => {
            eprintln!("failed to create cluster: {}", e);
            process::exit(1);
        }
    };

    let counter = Arc::new(Mutex::new(0usize));
    let finished = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();

    for _ in 0..count {
        let counter = counter.clone();
        let finished = finished.clone();
        let spawned = UThread::spawn_on(&cluster, move || {
            {
                let mut value = counter.lock();
                UThread::yield_now();
                *value += 1;
            }
            finished.fetch_add(1, Ordering::AcqRel);
        });
        if let Err(e) = spawned {
            eprintln!("failed to spawn micro-thread: {}", e);
            process::exit(1);
        }
    }

    while finished.load(Ordering::Acquire) < count {
        std::thread::sleep(Duration::from_millis(1));
    }
    let elapsed = started.elapsed();

    println!("counter       : {}", *counter.lock());
    println!("micro-threads : {}", count);
    println!("kthreads      : {}", KThread::count());
    println!("elapsed       : {:?}", elapsed);

    cluster.shutdown();
    cluster.join();
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let remaining: Vec<&str> = args.iter().skip(1).map(|s| s.as_str()).collect();

    match remaining.as_slice() {
        [] => run_demo(2, 100),
        ["run", rest @ ..] if rest.len() <= 2 => {
            run_demo(parse_arg(rest.first(), 2), parse_arg(rest.get(1), 100))
        }
        ["help"] | ["--help"] | ["-h"] => print_help(),
        ["version"] | ["--version"] | ["-v"] => println!("uthreads {}", VERSION),
        _ => {
            print_help();
            process::exit(1);
        }
    }
}
