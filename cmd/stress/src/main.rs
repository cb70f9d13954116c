//! Stress test - many tasks
//!
//! Launches a large number of tasks that yield repeatedly and bump a
//! shared counter under the suspending mutex, then checks nothing was lost.
//!
//! Usage: `stress [tasks] [rounds]`

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use strand::{yield_now, Mutex, Runtime, RuntimeConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== strand Stress Test ===\n");

    let mut args = std::env::args().skip(1);
    let num_tasks: usize = args.next().and_then(|s| s.parse().ok()).unwrap_or(10_000);
    let rounds: usize = args.next().and_then(|s| s.parse().ok()).unwrap_or(10);

    let config = RuntimeConfig::from_env();
    config.print();
    let runtime = Runtime::builder().config(config).build()?;

    let completed = Arc::new(AtomicU64::new(0));
    let counter = Arc::new(Mutex::new(0u64));
    let start = Instant::now();

    let done = Arc::clone(&completed);
    let shared = Arc::clone(&counter);
    let spawn_time = runtime.block_on(move |scope| async move {
        let default = scope.handle().dispatchers().default();
        for i in 0..num_tasks {
            let done = Arc::clone(&done);
            let shared = Arc::clone(&shared);
            scope.on(default.clone()).launch(move |_| async move {
                for _ in 0..rounds {
                    yield_now().await?;
                    *shared.lock().await? += 1;
                }
                done.fetch_add(1, Ordering::Relaxed);
                Ok(())
            })?;

            // Progress indicator
            if (i + 1) % 1000 == 0 {
                print!("\rLaunched: {}/{}", i + 1, num_tasks);
            }
        }
        Ok(start.elapsed())
    })?;

    let total_time = start.elapsed();
    let expected = (num_tasks * rounds) as u64;
    let counted = *counter.try_lock()?;

    println!("\n\n=== Results ===");
    println!("Total tasks:     {}", num_tasks);
    println!("Completed:       {}", completed.load(Ordering::Relaxed));
    println!("Counter:         {} (expected {})", counted, expected);
    println!("Launch time:     {:?}", spawn_time);
    println!("Total time:      {:?}", total_time);
    println!(
        "Throughput:      {:.0} tasks/sec",
        num_tasks as f64 / total_time.as_secs_f64()
    );

    runtime.shutdown();
    if counted != expected {
        return Err(format!("lost updates: {} != {}", counted, expected).into());
    }
    println!("\n=== Stress Test Complete ===");
    Ok(())
}
